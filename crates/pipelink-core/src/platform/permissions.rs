//! Ready-made endpoint initialization hooks.
//!
//! Access-control policy belongs to the application; these helpers cover the
//! common "only my user may connect" case and plug into
//! [`ServerOptions::with_endpoint_init`](crate::config::ServerOptions::with_endpoint_init).

use super::PipeListener;
use std::io;
use tracing::debug;

/// Restrict an endpoint to the current user.
///
/// # Platform Behavior
/// - **Unix**: Sets the socket file mode to 0o600
/// - **Windows**: No-op (named pipes default to the creator's security descriptor)
pub fn restrict_to_owner(listener: &PipeListener) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let path = listener.socket_path();
        let mut permissions = std::fs::metadata(path)?.permissions();
        permissions.set_mode(0o600);
        std::fs::set_permissions(path, permissions)?;
        debug!("Restricted endpoint {} to owner", path.display());
    }

    #[cfg(windows)]
    {
        debug!("Keeping default security descriptor for {}", listener.pipe_path());
    }

    Ok(())
}

/// Check whether an endpoint is reachable only by its owner.
///
/// # Platform Behavior
/// - **Unix**: True when no group/other permission bits are set
/// - **Windows**: Always true
pub fn is_owner_only(listener: &PipeListener) -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::metadata(listener.socket_path())
            .map(|m| m.permissions().mode() & 0o077 == 0)
            .unwrap_or(false)
    }

    #[cfg(windows)]
    {
        let _ = listener;
        true
    }
}
