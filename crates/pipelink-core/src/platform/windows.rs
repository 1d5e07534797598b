//! Windows named pipe implementation of the named endpoint substrate.

use std::io;

use tokio::net::windows::named_pipe::{
    ClientOptions, NamedPipeClient, NamedPipeServer, ServerOptions,
};
use tokio::sync::Mutex;

use super::endpoint::pipe_path;
use crate::config::PipeConfig;

/// Server side of an accepted endpoint connection.
pub type PipeStream = NamedPipeServer;

/// Client side of an endpoint connection.
pub type ClientStream = NamedPipeClient;

const ERROR_FILE_NOT_FOUND: i32 = 2;
const ERROR_ACCESS_DENIED: i32 = 5;
const ERROR_PIPE_BUSY: i32 = 231;

/// A claimed endpoint name accepting peer connections.
///
/// Each named pipe instance serves exactly one peer, so the listener keeps
/// the next instance ready and swaps it out on every accept. The first
/// instance is created with `first_pipe_instance`, which is what makes a
/// second `bind` on the same name fail.
#[derive(Debug)]
pub struct PipeListener {
    name: String,
    path: String,
    next: Mutex<NamedPipeServer>,
}

impl PipeListener {
    /// Claim `name` and start listening.
    ///
    /// Fails with `AddrInUse` if another server owns the name.
    pub fn bind(name: &str) -> io::Result<Self> {
        let path = pipe_path(name, PipeConfig::LOCAL_SERVER);
        let first = ServerOptions::new()
            .first_pipe_instance(true)
            .create(&path)
            .map_err(|e| {
                if e.raw_os_error() == Some(ERROR_ACCESS_DENIED) {
                    io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("pipe {} is owned by another server", path),
                    )
                } else {
                    e
                }
            })?;

        Ok(Self {
            name: name.to_string(),
            path,
            next: Mutex::new(first),
        })
    }

    /// The endpoint name this listener owns.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Full pipe path (`\\.\pipe\{name}`).
    pub fn pipe_path(&self) -> &str {
        &self.path
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> io::Result<PipeStream> {
        let mut next = self.next.lock().await;
        next.connect().await?;
        let replacement = ServerOptions::new().create(&self.path)?;
        Ok(std::mem::replace(&mut *next, replacement))
    }
}

/// Make one connection attempt to `name` on `server_name`.
pub async fn connect(name: &str, server_name: &str) -> io::Result<ClientStream> {
    ClientOptions::new().open(pipe_path(name, server_name))
}

/// Check whether a connect error only means "nobody is listening yet".
pub fn is_endpoint_unavailable(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(ERROR_FILE_NOT_FOUND) | Some(ERROR_PIPE_BUSY)
    ) || err.kind() == io::ErrorKind::NotFound
}
