//! Error types for pipelink.
//!
//! One enum covers the whole transport: framing faults, liveness violations,
//! endpoint naming conflicts, per-message decode failures, cancellation and
//! the integrity failures raised by encrypting formatters.

use std::time::Duration;
use thiserror::Error;

/// Main error type for pipelink.
#[derive(Debug, Error)]
pub enum PipeError {
    // Transport errors
    #[error("IO error: {message}")]
    Io {
        message: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Framing error: {message}")]
    Framing { message: String },

    #[error("Message size {size} exceeds maximum {max}")]
    MessageTooLarge { size: usize, max: usize },

    // Liveness errors
    #[error("Pipe {pipe_name} is not connected")]
    NotConnected { pipe_name: String },

    #[error("{what} for pipe {pipe_name} is already started")]
    AlreadyStarted { what: String, pipe_name: String },

    // Naming errors
    #[error("Pipe name {pipe_name} is already in use")]
    NameConflict { pipe_name: String },

    #[error("Invalid pipe name {pipe_name:?}: {reason}")]
    InvalidName { pipe_name: String, reason: String },

    #[error("Handshake with {pipe_name} failed: {message}")]
    Handshake { pipe_name: String, message: String },

    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Operation was cancelled")]
    Cancelled,

    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Format error: {message}")]
    Format { message: String },

    // Encryption errors
    #[error("Key exchange failed: {message}")]
    KeyExchange { message: String },

    #[error("Message integrity is broken")]
    Integrity,

    // Broadcast errors
    #[error("Broadcast failed for {failed} of {total} connections: {}", .errors.join("; "))]
    Broadcast {
        failed: usize,
        total: usize,
        errors: Vec<String>,
    },

    // Generic errors
    #[error("{0}")]
    Other(String),
}

/// Result type alias for pipelink operations.
pub type Result<T> = std::result::Result<T, PipeError>;

// Conversion implementations for common error types

impl From<std::io::Error> for PipeError {
    fn from(err: std::io::Error) -> Self {
        PipeError::Io {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for PipeError {
    fn from(err: serde_json::Error) -> Self {
        PipeError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl PipeError {
    /// Create a framing error.
    pub fn framing(message: impl Into<String>) -> Self {
        PipeError::Framing {
            message: message.into(),
        }
    }

    /// Create a not-connected error for a pipe.
    pub fn not_connected(pipe_name: impl Into<String>) -> Self {
        PipeError::NotConnected {
            pipe_name: pipe_name.into(),
        }
    }

    /// Map an I/O error raised while claiming an endpoint name.
    ///
    /// `AddrInUse` becomes [`PipeError::NameConflict`]; everything else stays
    /// an I/O error.
    pub fn from_bind(err: std::io::Error, pipe_name: &str) -> Self {
        if err.kind() == std::io::ErrorKind::AddrInUse {
            PipeError::NameConflict {
                pipe_name: pipe_name.to_string(),
            }
        } else {
            err.into()
        }
    }

    /// Check if this error is the expected outcome of a shutdown.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipeError::Cancelled)
    }

    /// Check if this error means the endpoint was only transiently busy.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipeError::NameConflict { .. } | PipeError::Timeout(_) => true,
            PipeError::Io {
                source: Some(err), ..
            } => matches!(
                err.kind(),
                std::io::ErrorKind::AddrInUse
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::NotFound
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Check if this error means the underlying channel is gone.
    pub fn is_fatal_to_channel(&self) -> bool {
        matches!(
            self,
            PipeError::Io { .. } | PipeError::Framing { .. } | PipeError::MessageTooLarge { .. }
        )
    }
}
