//! X25519 key agreement over a throwaway side channel.
//!
//! The server side binds `{pipe_name}_Inferno` and accepts exactly one peer;
//! the client side connects to it. The client speaks first: it sends its
//! 32-byte public key as one frame and the server answers with its own.
//! Both sides then feed the shared secret through HKDF-SHA256.

use aes_gcm::aead::OsRng;
use hkdf::Hkdf;
use pipelink::platform::{self, PipeListener};
use pipelink::{FramedStream, PipeError, Result};
use sha2::{Digest, Sha256};
use tracing::debug;
use x25519_dalek::{EphemeralSecret, PublicKey};

use crate::EncryptionConfig;

/// Which end of the exchange this peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Name of the key exchange side channel for `pipe_name`.
pub fn key_channel_name(pipe_name: &str) -> String {
    format!("{}{}", pipe_name, EncryptionConfig::ENDPOINT_SUFFIX)
}

/// Derive the 32-byte message key from an X25519 shared secret.
pub fn derive_key(shared_secret: &[u8]) -> Result<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, shared_secret);
    let mut key = [0u8; 32];
    hkdf.expand(EncryptionConfig::HKDF_INFO, &mut key)
        .map_err(|e| PipeError::KeyExchange {
            message: format!("key derivation failed: {}", e),
        })?;
    Ok(key)
}

/// Short, non-reversible fingerprint of a key for logs.
pub(crate) fn fingerprint(key: &[u8]) -> String {
    hex::encode(&Sha256::digest(key)[..8])
}

/// Agree on a message key with the peer of the connection on `pipe_name`.
///
/// Not bounded in time; callers wrap it in `tokio::time::timeout`.
pub async fn exchange_key(role: Role, pipe_name: &str, server_name: &str) -> Result<[u8; 32]> {
    let channel = key_channel_name(pipe_name);
    let secret = EphemeralSecret::random_from_rng(OsRng);
    let public = PublicKey::from(&secret);

    let peer = match role {
        Role::Server => {
            let listener =
                PipeListener::bind(&channel).map_err(|e| PipeError::from_bind(e, &channel))?;
            let stream = FramedStream::new(listener.accept().await?);
            drop(listener);

            let peer = read_public_key(&stream).await?;
            stream.write(public.as_bytes()).await?;
            stream.close().await;
            peer
        }
        Role::Client => {
            let stream =
                FramedStream::new(platform::connect_when_available(&channel, server_name).await?);

            stream.write(public.as_bytes()).await?;
            let peer = read_public_key(&stream).await?;
            stream.close().await;
            peer
        }
    };

    let shared = secret.diffie_hellman(&peer);
    if !shared.was_contributory() {
        return Err(PipeError::KeyExchange {
            message: "peer sent a low-order public key".into(),
        });
    }

    let key = derive_key(shared.as_bytes())?;
    debug!(
        "Key exchange on {} complete as {:?} (key {})",
        channel,
        role,
        fingerprint(&key)
    );
    Ok(key)
}

async fn read_public_key(stream: &FramedStream) -> Result<PublicKey> {
    let bytes = stream.read().await?.ok_or_else(|| PipeError::KeyExchange {
        message: "peer closed the key channel before sending its key".into(),
    })?;
    let key: [u8; EncryptionConfig::PUBLIC_KEY_LEN] =
        bytes.as_slice().try_into().map_err(|_| PipeError::KeyExchange {
            message: format!(
                "expected a {}-byte public key, got {} bytes",
                EncryptionConfig::PUBLIC_KEY_LEN,
                bytes.len()
            ),
        })?;
    Ok(PublicKey::from(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn unique_name() -> String {
        format!("kex-{}", uuid::Uuid::new_v4().simple())
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(key_channel_name("orders_3"), "orders_3_Inferno");
    }

    #[test]
    fn test_derive_key_is_deterministic() {
        let a = derive_key(&[1; 32]).unwrap();
        let b = derive_key(&[1; 32]).unwrap();
        let c = derive_key(&[2; 32]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_both_sides_agree() {
        let name = unique_name();
        let server = {
            let name = name.clone();
            tokio::spawn(async move { exchange_key(Role::Server, &name, ".").await })
        };
        let client = exchange_key(Role::Client, &name, ".");

        let client_key = tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .unwrap()
            .unwrap();
        let server_key = tokio::time::timeout(Duration::from_secs(10), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(client_key, server_key);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_short_key_is_rejected() {
        let name = unique_name();
        let channel = key_channel_name(&name);
        let listener = PipeListener::bind(&channel).unwrap();

        let client = tokio::spawn(async move { exchange_key(Role::Client, &name, ".").await });

        let stream = FramedStream::new(listener.accept().await.unwrap());
        let _client_key = stream.read().await.unwrap();
        stream.write(&[1, 2, 3]).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(10), client)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(PipeError::KeyExchange { .. })));
    }
}
