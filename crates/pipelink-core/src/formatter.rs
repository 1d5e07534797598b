//! The pluggable message encoding of a connection.
//!
//! A formatter turns one message into one frame payload and back. `None`
//! is the "no value" message: it always encodes to the empty payload, and
//! the empty payload always decodes to `None`, never to an error.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;

use crate::error::Result;

/// Serialize/deserialize strategy for messages of type `T`.
pub trait Formatter<T>: Send + Sync + 'static {
    /// Encode a message. `None` must encode to the empty payload.
    fn serialize(&self, value: Option<&T>) -> Result<Vec<u8>>;

    /// Decode a payload. The empty payload must decode to `None`.
    fn deserialize(&self, bytes: &[u8]) -> Result<Option<T>>;
}

/// A formatter shared between a connection and its owner.
pub type SharedFormatter<T> = Arc<dyn Formatter<T>>;

/// JSON encoding via `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonFormatter;

impl JsonFormatter {
    /// Shared handle to a JSON formatter for `T`.
    pub fn shared<T>() -> SharedFormatter<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync + 'static,
    {
        Arc::new(JsonFormatter)
    }
}

impl<T> Formatter<T> for JsonFormatter
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn serialize(&self, value: Option<&T>) -> Result<Vec<u8>> {
        match value {
            Some(value) => Ok(serde_json::to_vec(value)?),
            None => Ok(Vec::new()),
        }
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Option<T>> {
        if bytes.is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(bytes)?))
    }
}
