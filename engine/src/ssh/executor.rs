//! Remote command executor
//!
//! Every call opens its own exec channel. A non-zero exit never fails the
//! call; it is recorded in the [`CommandResult`] for the caller to classify.

use std::path::Path;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::errors::EngineError;
use crate::ssh::pool::Connection;
use crate::utils::shell_quote;

/// Exit code recorded when the command never produced an exit status
pub const NO_EXIT_STATUS: i32 = -1;

/// Outcome of one remote command
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResult {
    pub command: String,

    /// Combined stdout and stderr
    pub output: String,

    pub exit_code: i32,

    pub duration: Duration,

    /// Transport error or non-zero exit description
    pub error: Option<String>,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    /// Output with surrounding whitespace removed
    pub fn trimmed_output(&self) -> &str {
        self.output.trim()
    }

    /// Convert a failed result into a [`EngineError::CommandFailed`]
    pub fn into_result(self) -> Result<CommandResult, EngineError> {
        if self.success() {
            return Ok(self);
        }
        let output = match &self.error {
            Some(err) if self.output.trim().is_empty() => err.clone(),
            _ => tail(&self.output, 20),
        };
        Err(EngineError::CommandFailed {
            command: self.command,
            exit_code: self.exit_code,
            output,
        })
    }
}

/// Last `lines` lines of `output`
fn tail(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.trim_end().lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}

/// Run one command
pub async fn execute(conn: &Connection, command: &str) -> CommandResult {
    run(conn, command, None).await
}

/// Run one command, feeding `stdin`
pub async fn execute_with_input(conn: &Connection, command: &str, stdin: Vec<u8>) -> CommandResult {
    run(conn, command, Some(stdin)).await
}

/// Run one command with a deadline.
///
/// On timeout the channel is abandoned and the result carries
/// [`NO_EXIT_STATUS`] with a timeout error.
pub async fn execute_with_timeout(conn: &Connection, command: &str, timeout: Duration) -> CommandResult {
    let started = Instant::now();
    match tokio::time::timeout(timeout, run(conn, command, None)).await {
        Ok(result) => result,
        Err(_) => CommandResult {
            command: command.to_string(),
            output: String::new(),
            exit_code: NO_EXIT_STATUS,
            duration: started.elapsed(),
            error: Some(format!("timed out after {:?}", timeout)),
        },
    }
}

/// Write `contents` to `path` on the remote host, creating parent directories
pub async fn upload(conn: &Connection, path: &str, contents: &str) -> CommandResult {
    let parent = Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| ".".to_string());
    let command = format!(
        "mkdir -p {} && cat > {} && chmod 600 {}",
        shell_quote(&parent),
        shell_quote(path),
        shell_quote(path)
    );
    run(conn, &command, Some(contents.as_bytes().to_vec())).await
}

async fn run(conn: &Connection, command: &str, stdin: Option<Vec<u8>>) -> CommandResult {
    let started = Instant::now();
    debug!("[{}] $ {}", conn.key(), command);

    let result = match conn.exec(command, stdin).await {
        Ok(out) => {
            let output = String::from_utf8_lossy(&out.output).to_string();
            match out.exit_status {
                Some(0) => CommandResult {
                    command: command.to_string(),
                    output,
                    exit_code: 0,
                    duration: started.elapsed(),
                    error: None,
                },
                Some(code) => CommandResult {
                    command: command.to_string(),
                    output,
                    exit_code: code as i32,
                    duration: started.elapsed(),
                    error: Some(format!("process exited with status {}", code)),
                },
                None => CommandResult {
                    command: command.to_string(),
                    output,
                    exit_code: NO_EXIT_STATUS,
                    duration: started.elapsed(),
                    error: Some("channel closed without exit status".to_string()),
                },
            }
        }
        Err(e) => CommandResult {
            command: command.to_string(),
            output: String::new(),
            exit_code: NO_EXIT_STATUS,
            duration: started.elapsed(),
            error: Some(e.to_string()),
        },
    };

    debug!(
        "[{}] exit {} in {:?}",
        conn.key(),
        result.exit_code,
        result.duration
    );
    result
}
