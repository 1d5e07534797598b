//! Centralized configuration for pipelink.
//!
//! This module provides protocol constants, timing defaults and the option
//! structs accepted by servers and clients.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::platform::PipeListener;

/// Protocol and timing constants.
pub struct PipeConfig;

impl PipeConfig {
    // Wire format
    pub const FRAME_HEADER_LEN: usize = 4;
    pub const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024; // 64MB

    // Client timing
    pub const RECONNECTION_INTERVAL: Duration = Duration::from_millis(100);
    pub const CONNECT_POLL_INTERVAL: Duration = Duration::from_millis(20);
    pub const CONNECT_POLL_MAX_DELAY: Duration = Duration::from_millis(250);

    // Server timing
    pub const BUSY_RETRY_DELAY: Duration = Duration::from_millis(50);
    pub const BUSY_RETRY_MAX_DELAY: Duration = Duration::from_secs(1);
    pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    // Endpoint naming
    pub const PIPE_DIR_ENV: &'static str = "PIPELINK_PIPE_DIR";
    pub const PIPE_DIR_NAME: &'static str = "pipelink";
    pub const SOCKET_EXTENSION: &'static str = "sock";
    pub const LOCK_EXTENSION: &'static str = "lock";
    pub const LOCAL_SERVER: &'static str = ".";
}

/// Hook applied to every endpoint a server binds (e.g. access control).
pub type EndpointInit = Arc<dyn Fn(&PipeListener) -> std::io::Result<()> + Send + Sync>;

/// Options for both server variants.
#[derive(Clone)]
pub struct ServerOptions {
    /// Retry binding the public name until it is free instead of failing `start`.
    pub wait_free_pipe: bool,
    /// How long the server waits for a peer on its freshly allocated data endpoint.
    pub handshake_timeout: Duration,
    /// Largest payload accepted or sent on any connection.
    pub max_message_size: usize,
    /// Optional hook run on each bound endpoint.
    pub endpoint_init: Option<EndpointInit>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            wait_free_pipe: false,
            handshake_timeout: PipeConfig::HANDSHAKE_TIMEOUT,
            max_message_size: PipeConfig::MAX_MESSAGE_SIZE,
            endpoint_init: None,
        }
    }
}

impl ServerOptions {
    /// Create server options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry a busy public name instead of failing `start`.
    ///
    /// Default: `false`
    pub fn with_wait_free_pipe(mut self, wait: bool) -> Self {
        self.wait_free_pipe = wait;
        self
    }

    /// Set the data endpoint handshake timeout.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Install an endpoint initialization hook.
    pub fn with_endpoint_init(
        mut self,
        init: impl Fn(&PipeListener) -> std::io::Result<()> + Send + Sync + 'static,
    ) -> Self {
        self.endpoint_init = Some(Arc::new(init));
        self
    }
}

impl fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerOptions")
            .field("wait_free_pipe", &self.wait_free_pipe)
            .field("handshake_timeout", &self.handshake_timeout)
            .field("max_message_size", &self.max_message_size)
            .field("endpoint_init", &self.endpoint_init.is_some())
            .finish()
    }
}

/// Options for clients.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Keep trying to (re)connect in the background while disconnected.
    pub auto_reconnect: bool,
    /// Reconnect timer period; also bounds each background connect attempt.
    pub reconnection_interval: Duration,
    /// Host the server runs on. Only `"."` (local) is supported on Unix.
    pub server_name: String,
    /// Largest payload accepted or sent on the connection.
    pub max_message_size: usize,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnection_interval: PipeConfig::RECONNECTION_INTERVAL,
            server_name: PipeConfig::LOCAL_SERVER.to_string(),
            max_message_size: PipeConfig::MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientOptions {
    /// Create client options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable automatic reconnection.
    ///
    /// Default: `true`
    pub fn with_auto_reconnect(mut self, enable: bool) -> Self {
        self.auto_reconnect = enable;
        self
    }

    /// Set the reconnect timer period.
    pub fn with_reconnection_interval(mut self, interval: Duration) -> Self {
        self.reconnection_interval = interval;
        self
    }

    /// Set the server host name.
    pub fn with_server_name(mut self, server_name: impl Into<String>) -> Self {
        self.server_name = server_name.into();
        self
    }

    /// Set the maximum message size.
    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let server = ServerOptions::default();
        assert!(!server.wait_free_pipe);
        assert!(server.endpoint_init.is_none());

        let client = ClientOptions::default();
        assert!(client.auto_reconnect);
        assert_eq!(client.server_name, ".");
        assert_eq!(client.reconnection_interval, PipeConfig::RECONNECTION_INTERVAL);
    }

    #[test]
    fn test_builders() {
        let server = ServerOptions::new()
            .with_wait_free_pipe(true)
            .with_max_message_size(1024)
            .with_endpoint_init(|_| Ok(()));
        assert!(server.wait_free_pipe);
        assert_eq!(server.max_message_size, 1024);
        assert!(format!("{:?}", server).contains("endpoint_init: true"));

        let client = ClientOptions::new()
            .with_auto_reconnect(false)
            .with_reconnection_interval(Duration::from_millis(10));
        assert!(!client.auto_reconnect);
        assert_eq!(client.reconnection_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_max_message_size_fits_frame_header() {
        assert!(PipeConfig::MAX_MESSAGE_SIZE <= i32::MAX as usize);
    }
}
