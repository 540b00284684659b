//! Scripted in-memory transport
//!
//! Lets the pool, session manager and orchestrator run without a real SSH
//! server: commands are matched by substring against scripted responses and
//! everything executed is recorded for assertions.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::errors::EngineError;
use crate::ssh::{DialTarget, Dialer, ExecOutput, RemoteConnection};

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    exit_status: u32,
    output: String,
    delay: Option<Duration>,
}

#[derive(Default)]
struct MockState {
    rules: Mutex<Vec<Rule>>,
    commands: Mutex<Vec<String>>,
    inputs: Mutex<Vec<(String, String)>>,
}

impl MockState {
    fn rule_for(&self, command: &str) -> Option<Rule> {
        let rules = self.rules.lock().unwrap_or_else(|e| e.into_inner());
        rules.iter().rev().find(|r| command.contains(&r.pattern)).cloned()
    }
}

/// Dialer handing out [`MockConnection`]s that share one script
#[derive(Default)]
pub struct MockDialer {
    state: Arc<MockState>,
    dials: AtomicUsize,
    fail_dials: AtomicBool,
    dial_delay: Mutex<Option<Duration>>,
    connections: Mutex<Vec<Arc<MockConnection>>>,
}

impl MockDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer commands containing `pattern`. Later rules take precedence.
    pub fn respond(&self, pattern: &str, exit_status: u32, output: &str) {
        self.push_rule(Rule {
            pattern: pattern.to_string(),
            exit_status,
            output: output.to_string(),
            delay: None,
        });
    }

    /// Answer commands containing `pattern` successfully after `delay`
    pub fn respond_after(&self, pattern: &str, delay: Duration) {
        self.push_rule(Rule {
            pattern: pattern.to_string(),
            exit_status: 0,
            output: String::new(),
            delay: Some(delay),
        });
    }

    fn push_rule(&self, rule: Rule) {
        self.state
            .rules
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(rule);
    }

    /// Make subsequent dials fail with a connectivity error
    pub fn fail_dials(&self, fail: bool) {
        self.fail_dials.store(fail, Ordering::SeqCst);
    }

    /// Delay every dial by `delay`
    pub fn set_dial_delay(&self, delay: Option<Duration>) {
        *self.dial_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    pub fn dial_count(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    /// Every command executed, in order
    pub fn commands(&self) -> Vec<String> {
        self.state
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Executed commands containing `pattern`
    pub fn commands_matching(&self, pattern: &str) -> Vec<String> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains(pattern))
            .collect()
    }

    /// `(command, stdin)` pairs for commands that received input
    pub fn inputs(&self) -> Vec<(String, String)> {
        self.state
            .inputs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Make every connection dialed so far fail probes and commands
    pub fn kill_connections(&self) {
        for conn in self.connections.lock().unwrap_or_else(|e| e.into_inner()).iter() {
            conn.alive.store(false, Ordering::SeqCst);
        }
    }

    /// Number of dialed connections that were closed
    pub fn closed_count(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|c| c.closed.load(Ordering::SeqCst))
            .count()
    }
}

#[async_trait]
impl Dialer for MockDialer {
    async fn dial(&self, target: &DialTarget) -> Result<Arc<dyn RemoteConnection>, EngineError> {
        self.dials.fetch_add(1, Ordering::SeqCst);

        let delay = *self.dial_delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.fail_dials.load(Ordering::SeqCst) {
            return Err(EngineError::Connectivity(format!(
                "connection refused: {}",
                target.key()
            )));
        }

        let conn = Arc::new(MockConnection {
            state: self.state.clone(),
            alive: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        });
        self.connections
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(conn.clone());
        Ok(conn)
    }
}

/// Connection executing against the dialer's script
pub struct MockConnection {
    state: Arc<MockState>,
    alive: AtomicBool,
    closed: AtomicBool,
}

impl MockConnection {
    fn check_alive(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::SeqCst) || !self.alive.load(Ordering::SeqCst) {
            return Err(EngineError::Connectivity("connection reset".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteConnection for MockConnection {
    async fn exec(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<ExecOutput, EngineError> {
        self.check_alive()?;

        self.state
            .commands
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.to_string());
        if let Some(input) = stdin {
            self.state
                .inputs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push((command.to_string(), String::from_utf8_lossy(&input).to_string()));
        }

        let rule = self.state.rule_for(command);
        if let Some(delay) = rule.as_ref().and_then(|r| r.delay) {
            tokio::time::sleep(delay).await;
        }

        Ok(match rule {
            Some(rule) => ExecOutput {
                output: rule.output.into_bytes(),
                exit_status: Some(rule.exit_status),
            },
            None => ExecOutput {
                output: Vec::new(),
                exit_status: Some(0),
            },
        })
    }

    async fn probe(&self) -> Result<(), EngineError> {
        self.check_alive()
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
