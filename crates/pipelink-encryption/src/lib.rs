//! pipelink-encryption - In-band key exchange for pipelink connections.
//!
//! When a connection comes up, both peers open a short-lived side channel
//! named `{pipe_name}_Inferno`, trade X25519 public keys over it and derive
//! an AES-256-GCM key with HKDF-SHA256. The connection's formatter is then
//! wrapped in an [`EncryptedFormatter`], so every later message is
//! encrypted and authenticated. Tampered frames surface as
//! `PipeError::Integrity` events; the connection stays up.
//!
//! # Example
//!
//! ```rust,ignore
//! use pipelink::{PipeClient, PipeServer};
//! use pipelink_encryption::EnableEncryption;
//!
//! let server: PipeServer<String> = PipeServer::new("vault");
//! server.enable_encryption();
//! server.start().await?;
//!
//! let client: PipeClient<String> = PipeClient::new("vault");
//! client.enable_encryption();
//! client.connect().await?;
//! ```

pub mod cipher;
pub mod exchange;
pub mod hook;

use std::time::Duration;

pub use cipher::EncryptedFormatter;
pub use exchange::{derive_key, exchange_key, key_channel_name, Role};
pub use hook::{EnableEncryption, KeyExchangeHook};

/// Key exchange and cipher constants.
pub struct EncryptionConfig;

impl EncryptionConfig {
    /// Suffix of the key exchange side channel.
    pub const ENDPOINT_SUFFIX: &'static str = "_Inferno";
    /// Upper bound on one key exchange, side channel included.
    pub const KEY_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(10);

    pub const PUBLIC_KEY_LEN: usize = 32;
    pub const KEY_LEN: usize = 32;
    pub const NONCE_LEN: usize = 12;
    pub const TAG_LEN: usize = 16;

    /// HKDF context binding derived keys to this protocol.
    pub const HKDF_INFO: &'static [u8] = b"pipelink-encryption/v1 aes-256-gcm";
}
