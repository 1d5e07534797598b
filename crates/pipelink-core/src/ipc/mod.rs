//! Message-oriented IPC over named local endpoints.
//!
//! Discrete typed messages travel as length-prefixed frames over Unix domain
//! sockets (Unix) or named pipes (Windows).
//!
//! # Architecture
//!
//! - **Protocol**: Frame codec and the duplex framed stream
//! - **Connection**: One peer channel with its read loop and formatter
//! - **Server**: Many clients on one public name via the rendezvous handshake
//! - **Single server**: One client at a time directly on the public name
//! - **Client**: Handshake or direct connect with automatic reconnection

pub mod client;
pub mod connection;
pub mod protocol;
pub mod server;
pub mod single_server;

pub use client::{ConnectMode, PipeClient};
pub use connection::{ConnectHook, PipeConnection};
pub use protocol::{read_frame, write_frame, FramedStream, PipeIo};
pub use server::PipeServer;
pub use single_server::SingleConnectionPipeServer;
