//! Encryption key access.
//!
//! The key is an external secret. It is read at attempt start and never
//! written anywhere by this crate.

use crate::envelope::cipher::{EncryptionKey, EnvelopeError, EnvelopeResult};

/// Environment variable holding the base64-encoded 256-bit key.
pub const ENCRYPTION_KEY_ENV_VAR: &str = "ROTATOR_ENCRYPTION_KEY";

/// Supplies the envelope key.
pub trait KeyProvider: Send + Sync {
    fn encryption_key(&self) -> EnvelopeResult<EncryptionKey>;
}

/// Reads the key from an environment variable on every call, so a rotated
/// key is picked up without restart.
#[derive(Debug, Clone)]
pub struct EnvKeyProvider {
    var: String,
}

impl EnvKeyProvider {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvKeyProvider {
    fn default() -> Self {
        Self::new(ENCRYPTION_KEY_ENV_VAR)
    }
}

impl KeyProvider for EnvKeyProvider {
    fn encryption_key(&self) -> EnvelopeResult<EncryptionKey> {
        let encoded = std::env::var(&self.var).map_err(|_| {
            EnvelopeError::KeyUnavailable(format!("environment variable {} not set", self.var))
        })?;
        EncryptionKey::from_base64(&encoded)
    }
}

/// A fixed in-memory key.
#[derive(Debug, Clone)]
pub struct StaticKeyProvider {
    key: EncryptionKey,
}

impl StaticKeyProvider {
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    pub fn generate() -> Self {
        Self::new(EncryptionKey::generate())
    }
}

impl KeyProvider for StaticKeyProvider {
    fn encryption_key(&self) -> EnvelopeResult<EncryptionKey> {
        Ok(self.key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_env_var() {
        let provider = EnvKeyProvider::new("ROTATOR_TEST_KEY_THAT_IS_NEVER_SET");
        let err = provider.encryption_key().unwrap_err();
        assert!(err.to_string().contains("ROTATOR_TEST_KEY_THAT_IS_NEVER_SET"));
    }

    #[test]
    fn test_static_provider_returns_same_key() {
        use crate::envelope::{decrypt, encrypt, ProviderSecrets};

        let provider = StaticKeyProvider::generate();
        let sealed = encrypt(
            &ProviderSecrets::new("api_key_0000", "secret"),
            &provider.encryption_key().unwrap(),
        )
        .unwrap();
        assert!(decrypt(&sealed, &provider.encryption_key().unwrap()).is_ok());
    }
}
