//! # Reference tokens
//!
//! Seals a staging-row id into an opaque token with XChaCha20-Poly1305 so
//! listeners only ever fetch rows a holder of the secret asked them to.
//!
//! Token layout (URL-safe base64, unpadded): `nonce (24) || ciphertext (8) || tag (16)`.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::error::{RelayError, Result};

const NONCE_LEN: usize = 24;
const ID_LEN: usize = 8;
const TAG_LEN: usize = 16;
const TOKEN_BYTES: usize = NONCE_LEN + ID_LEN + TAG_LEN;

/// Domain separation for the key derived from the configured secret
const KEY_CONTEXT: &[u8] = b"pg-large-notify/reference-token/v1";

/// 256-bit key derived from the configured secret
#[derive(Clone, Zeroize)]
#[zeroize(drop)]
struct TokenKey([u8; 32]);

impl TokenKey {
    fn derive(secret: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(KEY_CONTEXT);
        hasher.update(secret.as_bytes());
        Self(hasher.finalize().into())
    }
}

/// Encrypts and authenticates staging-row ids
#[derive(Clone)]
pub struct ReferenceCodec {
    key: TokenKey,
}

impl std::fmt::Debug for ReferenceCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceCodec")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

impl ReferenceCodec {
    /// Build a codec from a non-empty secret
    pub fn new(secret: &str) -> Result<Self> {
        if secret.is_empty() {
            return Err(RelayError::config("payload encryptor secret is empty"));
        }
        Ok(Self {
            key: TokenKey::derive(secret),
        })
    }

    /// Seal `id` into a token. A fresh random nonce is used every call.
    pub fn encode(&self, id: i64) -> Result<String> {
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());

        let mut nonce = [0u8; NONCE_LEN];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut nonce);

        let ciphertext = cipher
            .encrypt(XNonce::from_slice(&nonce), id.to_be_bytes().as_slice())
            .map_err(|e| RelayError::config(format!("failed to seal reference: {e}")))?;

        let mut token = Vec::with_capacity(TOKEN_BYTES);
        token.extend_from_slice(&nonce);
        token.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(token))
    }

    /// Open a token. Anything that fails to authenticate, or that does not
    /// carry a positive id, is rejected.
    pub fn decode(&self, token: &str) -> Result<i64> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token)
            .map_err(|_| RelayError::Authentication)?;
        if bytes.len() != TOKEN_BYTES {
            return Err(RelayError::Authentication);
        }

        let (nonce, ciphertext) = bytes.split_at(NONCE_LEN);
        let cipher = XChaCha20Poly1305::new((&self.key.0).into());
        let plaintext = cipher
            .decrypt(XNonce::from_slice(nonce), ciphertext)
            .map_err(|_| RelayError::Authentication)?;

        let id_bytes: [u8; ID_LEN] = plaintext
            .as_slice()
            .try_into()
            .map_err(|_| RelayError::Authentication)?;
        let id = i64::from_be_bytes(id_bytes);
        if id < 1 {
            return Err(RelayError::Authentication);
        }
        Ok(id)
    }
}
