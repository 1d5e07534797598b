//! Authenticated-encryption formatter.
//!
//! Wire form of an encrypted payload: `nonce (12) || ciphertext || tag (16)`.
//! A fresh random nonce is drawn for every message.

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use pipelink::{Formatter, PipeError, Result, SharedFormatter};

use crate::EncryptionConfig;

/// Wraps another formatter with AES-256-GCM.
///
/// `None` is sealed like any other message: the wrapped formatter's empty
/// encoding goes through the cipher, so it carries a nonce and a tag. A bare
/// empty frame cannot be authentic on an encrypted channel and is rejected
/// with `Integrity`.
pub struct EncryptedFormatter<T> {
    inner: SharedFormatter<T>,
    cipher: Aes256Gcm,
}

impl<T> EncryptedFormatter<T> {
    /// Encrypt on top of `inner` with a 32-byte key.
    pub fn new(inner: SharedFormatter<T>, key: &[u8; 32]) -> Self {
        Self {
            inner,
            cipher: Aes256Gcm::new(key.into()),
        }
    }

    /// The formatter producing the plaintext.
    pub fn inner(&self) -> &SharedFormatter<T> {
        &self.inner
    }

    fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| PipeError::Format {
                message: "encryption failed".into(),
            })?;

        let mut sealed = Vec::with_capacity(nonce.len() + ciphertext.len());
        sealed.extend_from_slice(&nonce);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    fn open(&self, sealed: &[u8]) -> Result<Vec<u8>> {
        if sealed.len() < EncryptionConfig::NONCE_LEN + EncryptionConfig::TAG_LEN {
            return Err(PipeError::Integrity);
        }
        let (nonce, ciphertext) = sealed.split_at(EncryptionConfig::NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| PipeError::Integrity)
    }
}

impl<T> Formatter<T> for EncryptedFormatter<T>
where
    T: Send + Sync + 'static,
{
    fn serialize(&self, value: Option<&T>) -> Result<Vec<u8>> {
        let plaintext = self.inner.serialize(value)?;
        self.seal(&plaintext)
    }

    fn deserialize(&self, bytes: &[u8]) -> Result<Option<T>> {
        let plaintext = self.open(bytes)?;
        self.inner.deserialize(&plaintext)
    }
}

impl<T> std::fmt::Debug for EncryptedFormatter<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedFormatter").finish_non_exhaustive()
    }
}
