//! Connect hook that upgrades connections to encrypted ones.

use std::sync::Arc;
use std::time::Duration;

use pipelink::{
    ConnectHook, PipeClient, PipeConnection, PipeError, PipeServer, Result,
    SingleConnectionPipeServer,
};
use tracing::{info, warn};

use crate::cipher::EncryptedFormatter;
use crate::exchange::{exchange_key, fingerprint, Role};
use crate::EncryptionConfig;

/// Runs the key exchange on every new connection and swaps in an
/// [`EncryptedFormatter`] around the connection's current formatter.
///
/// The formatter reverts when the connection disconnects, dropping the key.
#[derive(Debug, Clone)]
pub struct KeyExchangeHook {
    role: Role,
    timeout: Duration,
}

impl KeyExchangeHook {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            timeout: EncryptionConfig::KEY_EXCHANGE_TIMEOUT,
        }
    }

    /// Bound the whole exchange, side channel included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn role(&self) -> Role {
        self.role
    }
}

#[async_trait::async_trait]
impl<T> ConnectHook<T> for KeyExchangeHook
where
    T: Send + Sync + 'static,
{
    async fn on_connected(&self, connection: &Arc<PipeConnection<T>>) -> Result<()> {
        let exchange = exchange_key(self.role, connection.pipe_name(), connection.server_name());
        let key = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(key)) => key,
            Ok(Err(e)) => {
                warn!("Key exchange on {} failed: {}", connection.pipe_name(), e);
                return Err(match e {
                    PipeError::KeyExchange { .. } => e,
                    other => PipeError::KeyExchange {
                        message: other.to_string(),
                    },
                });
            }
            Err(_) => {
                warn!(
                    "Key exchange on {} timed out after {:?}",
                    connection.pipe_name(),
                    self.timeout
                );
                return Err(PipeError::KeyExchange {
                    message: format!("timed out after {:?}", self.timeout),
                });
            }
        };

        let encrypted = EncryptedFormatter::new(connection.formatter(), &key);
        connection.set_formatter(Arc::new(encrypted))?;
        info!(
            "Encryption enabled on {} (key {})",
            connection.pipe_name(),
            fingerprint(&key)
        );
        Ok(())
    }
}

/// Adds `enable_encryption()` to clients and servers.
pub trait EnableEncryption {
    /// Encrypt every future connection with the default exchange timeout.
    fn enable_encryption(&self) {
        self.enable_encryption_with_timeout(EncryptionConfig::KEY_EXCHANGE_TIMEOUT);
    }

    fn enable_encryption_with_timeout(&self, timeout: Duration);
}

impl<T> EnableEncryption for PipeClient<T>
where
    T: Send + Sync + 'static,
{
    fn enable_encryption_with_timeout(&self, timeout: Duration) {
        self.set_hook(Some(Arc::new(
            KeyExchangeHook::new(Role::Client).with_timeout(timeout),
        )));
    }
}

impl<T> EnableEncryption for PipeServer<T>
where
    T: Send + Sync + 'static,
{
    fn enable_encryption_with_timeout(&self, timeout: Duration) {
        self.set_hook(Some(Arc::new(
            KeyExchangeHook::new(Role::Server).with_timeout(timeout),
        )));
    }
}

impl<T> EnableEncryption for SingleConnectionPipeServer<T>
where
    T: Send + Sync + 'static,
{
    fn enable_encryption_with_timeout(&self, timeout: Duration) {
        self.set_hook(Some(Arc::new(
            KeyExchangeHook::new(Role::Server).with_timeout(timeout),
        )));
    }
}
