//! Remote shell subsystem
//!
//! The pool owns live transports; callers only ever see a [`pool::Connection`]
//! handle, lease it through [`session::SessionManager`] and run commands with
//! [`executor`].

pub mod executor;
pub mod host_keys;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod pool;
pub mod russh_dialer;
pub mod session;

use std::fmt;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};

use crate::errors::EngineError;

/// Raw result of one exec channel
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// stdout and stderr, interleaved in arrival order
    pub output: Vec<u8>,

    /// Remote exit status, `None` if the channel closed without one
    pub exit_status: Option<u32>,
}

/// A live transport to one remote host
#[async_trait]
pub trait RemoteConnection: Send + Sync {
    /// Run `command` on a fresh exec channel, optionally feeding `stdin`
    async fn exec(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<ExecOutput, EngineError>;

    /// Open and immediately close a throwaway channel
    async fn probe(&self) -> Result<(), EngineError>;

    /// Disconnect. Idempotent.
    async fn close(&self);
}

/// Establishes new transports
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(
        &self,
        target: &DialTarget,
    ) -> Result<std::sync::Arc<dyn RemoteConnection>, EngineError>;
}

/// SSH private key material as PEM text
#[derive(Clone)]
pub struct SshCredential {
    pem: SecretString,
}

impl SshCredential {
    /// Validate PEM armor and wrap the key.
    ///
    /// Keys stored with escaped newlines (`\n` literals) are unescaped first.
    pub fn from_pem(pem: &str) -> Result<Self, EngineError> {
        let normalized = if pem.contains("\\n") && !pem.contains('\n') {
            pem.replace("\\n", "\n")
        } else {
            pem.to_string()
        };
        let trimmed = normalized.trim();

        let header_ok = trimmed.starts_with("-----BEGIN ")
            && trimmed
                .lines()
                .next()
                .map(|l| l.ends_with("PRIVATE KEY-----"))
                .unwrap_or(false);
        let footer_ok = trimmed
            .lines()
            .last()
            .map(|l| l.starts_with("-----END ") && l.ends_with("PRIVATE KEY-----"))
            .unwrap_or(false);

        if !header_ok || !footer_ok {
            return Err(EngineError::ValidationError(
                "SSH credential is not a PEM private key".to_string(),
            ));
        }

        Ok(Self {
            pem: SecretString::from(format!("{}\n", trimmed)),
        })
    }

    pub fn pem(&self) -> &str {
        self.pem.expose_secret()
    }
}

impl fmt::Debug for SshCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SshCredential(<redacted>)")
    }
}

/// Where and as whom to connect
#[derive(Debug, Clone)]
pub struct DialTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub credential: SshCredential,
}

impl DialTarget {
    pub fn new(host: impl Into<String>, port: u16, user: impl Into<String>, credential: SshCredential) -> Self {
        Self {
            host: host.into(),
            port,
            user: user.into(),
            credential,
        }
    }

    /// Pool key, `user@host`
    pub fn key(&self) -> String {
        pool_key(&self.host, &self.user)
    }
}

pub fn pool_key(host: &str, user: &str) -> String {
    format!("{}@{}", user, host)
}
