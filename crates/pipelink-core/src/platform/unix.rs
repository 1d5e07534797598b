//! Unix domain socket implementation of the named endpoint substrate.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use super::endpoint::{lock_path_in, pipe_dir, socket_path_in};
use crate::config::PipeConfig;

/// Server side of an accepted endpoint connection.
pub type PipeStream = UnixStream;

/// Client side of an endpoint connection.
pub type ClientStream = UnixStream;

/// A claimed endpoint name accepting peer connections.
///
/// Holding a `PipeListener` is what "owning" a name means: the lock file
/// stays exclusively locked until the listener is dropped, at which point the
/// socket and lock files are removed.
#[derive(Debug)]
pub struct PipeListener {
    name: String,
    socket_path: PathBuf,
    lock_path: PathBuf,
    listener: UnixListener,
    lock: File,
}

impl PipeListener {
    /// Claim `name` in the default pipe directory and start listening.
    ///
    /// Fails with `AddrInUse` if another live listener holds the name.
    pub fn bind(name: &str) -> io::Result<Self> {
        Self::bind_in(&pipe_dir(), name)
    }

    /// Claim `name` inside `dir` and start listening.
    pub fn bind_in(dir: &Path, name: &str) -> io::Result<Self> {
        std::fs::create_dir_all(dir)?;

        let socket_path = socket_path_in(dir, name);
        let lock_path = lock_path_in(dir, name);
        let lock = claim_lock(&lock_path)?;

        // We own the lock, so any socket file left behind belongs to a dead owner.
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("Removed stale endpoint {}", socket_path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }

        let listener = UnixListener::bind(&socket_path)?;

        Ok(Self {
            name: name.to_string(),
            socket_path,
            lock_path,
            listener,
            lock,
        })
    }

    /// The endpoint name this listener owns.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Filesystem path of the listening socket.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Wait for the next peer.
    pub async fn accept(&self) -> io::Result<PipeStream> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(stream)
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
        // Unlink before unlocking; claim_lock re-checks the inode to cover the gap.
        let _ = std::fs::remove_file(&self.lock_path);
        let _ = self.lock.unlock();
    }
}

/// Open and exclusively lock `path`, retrying if the file was replaced
/// between opening and locking.
fn claim_lock(path: &Path) -> io::Result<File> {
    loop {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if let Err(e) = file.try_lock_exclusive() {
            let contended = fs2::lock_contended_error();
            if e.kind() == io::ErrorKind::WouldBlock || e.raw_os_error() == contended.raw_os_error()
            {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("endpoint lock {} is held by another owner", path.display()),
                ));
            }
            return Err(e);
        }

        // The previous owner may have unlinked the file after we opened it.
        let held = file.metadata()?;
        match std::fs::metadata(path) {
            Ok(current) if current.ino() == held.ino() && current.dev() == held.dev() => {
                return Ok(file);
            }
            Ok(_) => continue,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Make one connection attempt to `name`.
pub async fn connect(name: &str, server_name: &str) -> io::Result<ClientStream> {
    if server_name != PipeConfig::LOCAL_SERVER {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("remote server {} is not reachable over Unix sockets", server_name),
        ));
    }
    connect_in(&pipe_dir(), name).await
}

/// Make one connection attempt to `name` inside `dir`.
pub async fn connect_in(dir: &Path, name: &str) -> io::Result<ClientStream> {
    UnixStream::connect(socket_path_in(dir, name)).await
}

/// Check whether a connect error only means "nobody is listening yet".
pub fn is_endpoint_unavailable(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}
