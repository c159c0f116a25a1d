//! Authenticated encryption of provider secrets.
//!
//! AES-256-GCM with a fresh 96-bit nonce per seal. The 128-bit tag is kept
//! as its own envelope field so a truncated payload is rejected as malformed
//! before the cipher ever runs.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Key, Nonce,
};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroizing;

use crate::envelope::secrets::ProviderSecrets;

const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const TAG_SIZE: usize = 16;

/// Current envelope format. Bound into the AAD.
pub const ENVELOPE_VERSION: u8 = 1;

const AAD_PREFIX: &[u8] = b"pos-rotator.credential.v";

/// Errors raised while sealing or opening an envelope.
#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Tag mismatch, wrong key, or a malformed envelope. The credential is
    /// unusable until re-supplied; this is never transient.
    #[error("ciphertext invalid: {0}")]
    CiphertextInvalid(&'static str),

    #[error("encryption failed: {0}")]
    Encrypt(String),

    #[error("encryption key unavailable: {0}")]
    KeyUnavailable(String),
}

pub type EnvelopeResult<T> = Result<T, EnvelopeError>;

/// 256-bit symmetric key. Zeroized on drop, never printed.
#[derive(Clone)]
pub struct EncryptionKey(Zeroizing<[u8; KEY_SIZE]>);

impl EncryptionKey {
    pub fn from_bytes(bytes: &[u8]) -> EnvelopeResult<Self> {
        if bytes.len() != KEY_SIZE {
            return Err(EnvelopeError::KeyUnavailable(format!(
                "expected {KEY_SIZE} key bytes, got {}",
                bytes.len()
            )));
        }
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        key.copy_from_slice(bytes);
        Ok(Self(key))
    }

    pub fn from_base64(encoded: &str) -> EnvelopeResult<Self> {
        let bytes = Zeroizing::new(
            BASE64
                .decode(encoded.trim())
                .map_err(|_| EnvelopeError::KeyUnavailable("key is not valid base64".into()))?,
        );
        Self::from_bytes(&bytes)
    }

    /// Fresh random key.
    pub fn generate() -> Self {
        let mut key = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(&mut key[..]);
        Self(key)
    }

    fn cipher(&self) -> Aes256Gcm {
        Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.0[..]))
    }
}

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EncryptionKey(<redacted>)")
    }
}

/// The at-rest form of a credential: `{iv, tag, payload}`, base64 encoded.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedEnvelope {
    pub v: u8,
    pub iv: String,
    pub tag: String,
    pub payload: String,
}

impl std::fmt::Debug for SealedEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealedEnvelope")
            .field("v", &self.v)
            .finish_non_exhaustive()
    }
}

fn aad(version: u8) -> Vec<u8> {
    let mut aad = AAD_PREFIX.to_vec();
    aad.extend_from_slice(version.to_string().as_bytes());
    aad
}

/// Seal `secrets` under `key`.
pub fn encrypt(secrets: &ProviderSecrets, key: &EncryptionKey) -> EnvelopeResult<SealedEnvelope> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(secrets).map_err(|e| EnvelopeError::Encrypt(e.to_string()))?,
    );

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let aad = aad(ENVELOPE_VERSION);
    let mut sealed = key
        .cipher()
        .encrypt(
            Nonce::from_slice(&nonce_bytes),
            Payload {
                msg: &plaintext,
                aad: &aad,
            },
        )
        .map_err(|_| EnvelopeError::Encrypt("cipher rejected payload".into()))?;

    // aes-gcm appends the tag to the ciphertext.
    let tag = sealed.split_off(sealed.len() - TAG_SIZE);

    Ok(SealedEnvelope {
        v: ENVELOPE_VERSION,
        iv: BASE64.encode(nonce_bytes),
        tag: BASE64.encode(tag),
        payload: BASE64.encode(sealed),
    })
}

/// Open an envelope. Any tampering, key mismatch or malformed field is
/// reported as [`EnvelopeError::CiphertextInvalid`].
pub fn decrypt(envelope: &SealedEnvelope, key: &EncryptionKey) -> EnvelopeResult<ProviderSecrets> {
    if envelope.v != ENVELOPE_VERSION {
        return Err(EnvelopeError::CiphertextInvalid("unsupported envelope version"));
    }

    let nonce = BASE64
        .decode(&envelope.iv)
        .map_err(|_| EnvelopeError::CiphertextInvalid("iv is not base64"))?;
    if nonce.len() != NONCE_SIZE {
        return Err(EnvelopeError::CiphertextInvalid("iv has wrong length"));
    }

    let tag = BASE64
        .decode(&envelope.tag)
        .map_err(|_| EnvelopeError::CiphertextInvalid("tag is not base64"))?;
    if tag.len() != TAG_SIZE {
        return Err(EnvelopeError::CiphertextInvalid("tag has wrong length"));
    }

    let mut sealed = BASE64
        .decode(&envelope.payload)
        .map_err(|_| EnvelopeError::CiphertextInvalid("payload is not base64"))?;
    sealed.extend_from_slice(&tag);

    let aad = aad(envelope.v);
    let plaintext = Zeroizing::new(
        key.cipher()
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &sealed,
                    aad: &aad,
                },
            )
            .map_err(|_| EnvelopeError::CiphertextInvalid("authentication tag mismatch"))?,
    );

    serde_json::from_slice(&plaintext)
        .map_err(|_| EnvelopeError::CiphertextInvalid("decrypted payload is not a secret object"))
}
