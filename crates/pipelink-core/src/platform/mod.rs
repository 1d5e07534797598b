//! Platform abstraction layer for the named endpoint substrate.
//!
//! All `#[cfg]` blocks for OS-specific endpoint behavior live in this module
//! rather than scattered throughout the transport.
//!
//! # Architecture
//!
//! - `endpoint` - Endpoint name validation and path resolution
//! - `permissions` - Ready-made endpoint initialization hooks
//! - `unix` / `windows` - The listener and connect primitives
//!
//! # Supported Platforms
//!
//! - **Unix**: Unix domain sockets at `{pipe_dir}/{name}.sock`. A sibling
//!   `{name}.lock` file holds an exclusive advisory lock for as long as the
//!   name is claimed, which is what makes a second `bind` fail.
//! - **Windows**: Named pipes at `\\{server}\pipe\{name}`; exclusivity comes
//!   from `first_pipe_instance`.
//!
//! Neither substrate exposes a "wait until the peer drained the pipe"
//! primitive, so the framed writer's drain step is a no-op on both.

pub mod endpoint;
pub mod permissions;

#[cfg(unix)]
mod unix;

#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::*;

#[cfg(windows)]
pub use windows::*;

pub use endpoint::{data_endpoint_name, pipe_dir, validate_name};

use crate::retry::RetryConfig;
use tracing::debug;

/// Connect to a named endpoint, waiting for it to appear.
///
/// A missing endpoint (server not started yet, or between accept cycles)
/// is not an error here: the call polls with backoff until the endpoint
/// exists. Bound the wait with `tokio::time::timeout` or by dropping the
/// future.
pub async fn connect_when_available(
    name: &str,
    server_name: &str,
) -> std::io::Result<ClientStream> {
    let mut backoff = RetryConfig::connect_poll().backoff();
    loop {
        match connect(name, server_name).await {
            Ok(stream) => return Ok(stream),
            Err(e) if is_endpoint_unavailable(&e) => {
                if backoff.attempts() == 0 {
                    debug!("Waiting for pipe endpoint {} to become available", name);
                }
                backoff.sleep().await;
            }
            Err(e) => return Err(e),
        }
    }
}
