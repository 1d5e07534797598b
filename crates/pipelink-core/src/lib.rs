//! pipelink - Message-oriented IPC over local named pipes.
//!
//! One process runs a [`PipeServer`] on a well-known pipe name; other
//! processes connect with a [`PipeClient`] and exchange discrete typed
//! messages. Every client gets a private channel through a rendezvous
//! handshake, reconnects automatically, and encodes messages with a
//! pluggable [`Formatter`] (JSON by default).
//!
//! For in-band key exchange and authenticated encryption, see the
//! `pipelink-encryption` crate.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipelink::{PipeClient, PipeEvent, PipeServer};
//!
//! #[tokio::main]
//! async fn main() -> pipelink::Result<()> {
//!     let server: PipeServer<String> = PipeServer::new("orders");
//!     let mut server_events = server.take_events().unwrap();
//!     server.start().await?;
//!
//!     let client: PipeClient<String> = PipeClient::new("orders");
//!     client.connect().await?;
//!     client.write(Some(&"hello".to_string())).await?;
//!
//!     while let Some(event) = server_events.recv().await {
//!         if let PipeEvent::Message { connection, message } = event {
//!             println!("{} says {:?}", connection.pipe_name(), message);
//!             break;
//!         }
//!     }
//!
//!     client.disconnect().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod formatter;
pub mod ipc;
pub mod platform;
pub mod retry;
pub mod worker;

// Re-export commonly used types
pub use cancel::{CancellationToken, CancelledError};
pub use config::{ClientOptions, PipeConfig, ServerOptions};
pub use error::{PipeError, Result};
pub use events::{EventSender, PipeEvent, PipeEvents};
pub use formatter::{Formatter, JsonFormatter, SharedFormatter};
pub use ipc::{
    ConnectHook, ConnectMode, FramedStream, PipeClient, PipeConnection, PipeServer,
    SingleConnectionPipeServer,
};
pub use platform::PipeListener;
pub use retry::RetryConfig;
pub use worker::Worker;
