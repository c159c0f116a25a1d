//! Credential envelope subsystem.
//!
//! # Data Flow
//! ```text
//! ProviderSecrets (api key, secret, token, store id)
//!     → secrets.rs (serialize, derive masked hints + fingerprint)
//!     → cipher.rs (AES-256-GCM seal → SealedEnvelope {iv, tag, payload})
//!     → stored as CredentialRecord.ciphertext
//!
//! On attempt start:
//!     keys.rs (KeyProvider) → EncryptionKey
//!     → cipher.rs (open) → ProviderSecrets
//! ```
//!
//! # Security Constraints
//! - The key never leaves the process and is never persisted here
//! - Plaintext buffers are zeroized on drop
//! - Only masked hints and fingerprints may reach logs, records or alerts

pub mod cipher;
pub mod keys;
pub mod secrets;

pub use cipher::{decrypt, encrypt, EncryptionKey, EnvelopeError, EnvelopeResult, SealedEnvelope};
pub use keys::{EnvKeyProvider, KeyProvider, StaticKeyProvider};
pub use secrets::{fingerprint, mask_suffix, MaskedHints, ProviderSecrets};
