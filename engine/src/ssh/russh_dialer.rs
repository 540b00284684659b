//! SSH transport backed by russh

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use russh::client::{self, Handle};
use russh::{ChannelMsg, Disconnect};
use russh_keys::key;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::errors::EngineError;
use crate::ssh::host_keys::HostKeyStore;
use crate::ssh::{DialTarget, Dialer, ExecOutput, RemoteConnection};

/// Client handler that verifies server keys against the host key store
struct HostKeyVerifier {
    store: Arc<HostKeyStore>,
    host: String,
    port: u16,
}

#[async_trait]
impl client::Handler for HostKeyVerifier {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        let fingerprint = server_public_key.fingerprint();
        match self.store.verify(&self.host, self.port, &fingerprint).await {
            Ok(check) => Ok(check.is_accepted()),
            Err(e) => {
                warn!("Host key store error for {}: {}", self.host, e);
                Ok(false)
            }
        }
    }
}

/// Dials SSH connections with public key authentication
pub struct RusshDialer {
    host_keys: Arc<HostKeyStore>,
    keepalive_interval: Option<Duration>,
}

impl RusshDialer {
    pub fn new(host_keys: Arc<HostKeyStore>) -> Self {
        Self {
            host_keys,
            keepalive_interval: Some(Duration::from_secs(30)),
        }
    }
}

#[async_trait]
impl Dialer for RusshDialer {
    async fn dial(&self, target: &DialTarget) -> Result<Arc<dyn RemoteConnection>, EngineError> {
        let key_pair = russh_keys::decode_secret_key(target.credential.pem(), None)
            .map_err(|e| EngineError::Connectivity(format!("invalid SSH private key: {}", e)))?;

        let config = Arc::new(client::Config {
            keepalive_interval: self.keepalive_interval,
            ..Default::default()
        });

        let handler = HostKeyVerifier {
            store: self.host_keys.clone(),
            host: target.host.clone(),
            port: target.port,
        };

        debug!("Dialing {}@{}:{}", target.user, target.host, target.port);
        let mut handle = client::connect(config, (target.host.as_str(), target.port), handler)
            .await
            .map_err(|e| {
                EngineError::Connectivity(format!("connect to {}:{}: {}", target.host, target.port, e))
            })?;

        let authenticated = handle
            .authenticate_publickey(target.user.clone(), Arc::new(key_pair))
            .await
            .map_err(|e| EngineError::Connectivity(format!("authenticate {}: {}", target.key(), e)))?;

        if !authenticated {
            return Err(EngineError::Connectivity(format!(
                "public key rejected for {}",
                target.key()
            )));
        }

        Ok(Arc::new(RusshConnection {
            handle: Mutex::new(handle),
        }))
    }
}

/// One authenticated SSH connection
pub struct RusshConnection {
    handle: Mutex<Handle<HostKeyVerifier>>,
}

impl RusshConnection {
    async fn open_channel(&self) -> Result<russh::Channel<client::Msg>, EngineError> {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return Err(EngineError::Connectivity("connection closed".to_string()));
        }
        handle
            .channel_open_session()
            .await
            .map_err(|e| EngineError::Connectivity(format!("open channel: {}", e)))
    }
}

#[async_trait]
impl RemoteConnection for RusshConnection {
    async fn exec(&self, command: &str, stdin: Option<Vec<u8>>) -> Result<ExecOutput, EngineError> {
        let mut channel = self.open_channel().await?;

        channel
            .exec(true, command)
            .await
            .map_err(|e| EngineError::Connectivity(format!("exec: {}", e)))?;

        if let Some(input) = stdin {
            channel
                .data(&input[..])
                .await
                .map_err(|e| EngineError::Connectivity(format!("write stdin: {}", e)))?;
            channel
                .eof()
                .await
                .map_err(|e| EngineError::Connectivity(format!("close stdin: {}", e)))?;
        }

        let mut result = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => result.output.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => result.output.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status } => result.exit_status = Some(exit_status),
                _ => {}
            }
        }

        Ok(result)
    }

    async fn probe(&self) -> Result<(), EngineError> {
        let channel = self.open_channel().await?;
        channel
            .close()
            .await
            .map_err(|e| EngineError::Connectivity(format!("close probe channel: {}", e)))
    }

    async fn close(&self) {
        let handle = self.handle.lock().await;
        if handle.is_closed() {
            return;
        }
        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "pool eviction", "en")
            .await
        {
            debug!("Disconnect failed: {}", e);
        }
    }
}
