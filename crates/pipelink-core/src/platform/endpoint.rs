//! Endpoint naming and path resolution.
//!
//! Public names are chosen by the application. Data names are derived as
//! `{public}_{n}` by the multi-client server; the key exchange sub-channel
//! appends its own suffix to a connection's name.

use crate::config::PipeConfig;
use crate::error::{PipeError, Result};
use std::path::PathBuf;

/// Reject names that cannot be mapped onto an endpoint on every platform.
pub fn validate_name(name: &str) -> Result<()> {
    let reason = if name.is_empty() {
        Some("name is empty")
    } else if name.contains(['/', '\\']) {
        Some("name contains a path separator")
    } else if name.contains('\0') {
        Some("name contains a NUL byte")
    } else if name == "." || name == ".." {
        Some("name is a relative path component")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PipeError::InvalidName {
            pipe_name: name.to_string(),
            reason: reason.to_string(),
        }),
        None => Ok(()),
    }
}

/// Name of the `n`-th data endpoint allocated behind a public name.
pub fn data_endpoint_name(public_name: &str, id: u64) -> String {
    format!("{}_{}", public_name, id)
}

/// Directory holding Unix endpoint sockets and their lock files.
///
/// # Resolution order
/// 1. `$PIPELINK_PIPE_DIR`, used as-is
/// 2. The user runtime directory (`$XDG_RUNTIME_DIR`) + `pipelink`
/// 3. The system temp directory + `pipelink`
///
/// On Windows the directory is unused; named pipes live in their own namespace.
pub fn pipe_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(PipeConfig::PIPE_DIR_ENV) {
        if !dir.is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::runtime_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(PipeConfig::PIPE_DIR_NAME)
}

/// Socket file for `name` inside `dir`.
#[cfg(unix)]
pub fn socket_path_in(dir: &std::path::Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, PipeConfig::SOCKET_EXTENSION))
}

/// Lock file guarding `name` inside `dir`.
#[cfg(unix)]
pub fn lock_path_in(dir: &std::path::Path, name: &str) -> PathBuf {
    dir.join(format!("{}.{}", name, PipeConfig::LOCK_EXTENSION))
}

/// Full Windows pipe path for `name` on `server_name`.
#[cfg(windows)]
pub fn pipe_path(name: &str, server_name: &str) -> String {
    format!(r"\\{}\pipe\{}", server_name, name)
}
