//! Provider secret object, masked hints and token fingerprints.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop};

const MASK: &str = "****";
const HINT_CHARS: usize = 4;
const FINGERPRINT_BYTES: usize = 6;

/// Plaintext credentials for one (location, provider).
///
/// Only ever held in memory between decrypt and re-encrypt.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct ProviderSecrets {
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub access_token: Option<String>,
    #[serde(default)]
    pub store_id: Option<String>,
}

impl ProviderSecrets {
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            access_token: None,
            store_id: None,
        }
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn with_store_id(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    /// Copy of these secrets carrying a newly issued token.
    pub fn rotated(&self, token: &str) -> Self {
        let mut next = self.clone();
        next.access_token = Some(token.to_string());
        next
    }

    /// Display-safe fragments.
    pub fn masked_hints(&self) -> MaskedHints {
        MaskedHints {
            api_key: Some(mask_suffix(&self.api_key)),
            store_id: self.store_id.as_deref().map(mask_suffix),
            token_fingerprint: self.access_token.as_deref().map(fingerprint),
        }
    }
}

impl std::fmt::Debug for ProviderSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSecrets")
            .field("api_key", &mask_suffix(&self.api_key))
            .field("api_secret", &MASK)
            .field("access_token", &self.access_token.as_deref().map(fingerprint))
            .field("store_id", &self.store_id.as_deref().map(mask_suffix))
            .finish()
    }
}

/// Non-secret display fragments stored alongside the ciphertext.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaskedHints {
    pub api_key: Option<String>,
    pub store_id: Option<String>,
    pub token_fingerprint: Option<String>,
}

/// `****` followed by the last four characters. Values shorter than eight
/// characters are masked entirely.
pub fn mask_suffix(value: &str) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() < HINT_CHARS * 2 {
        return MASK.to_string();
    }
    let tail: String = chars[chars.len() - HINT_CHARS..].iter().collect();
    format!("{MASK}{tail}")
}

/// Truncated SHA-256 of a token, safe for logs and audit rows.
pub fn fingerprint(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    hex::encode(&digest[..FINGERPRINT_BYTES])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_suffix() {
        assert_eq!(mask_suffix("sk_live_abcdef1234"), "****1234");
        assert_eq!(mask_suffix("short"), "****");
        assert_eq!(mask_suffix(""), "****");
    }

    #[test]
    fn test_fingerprint_is_stable_and_short() {
        let a = fingerprint("tok_super_secret_value");
        assert_eq!(a, fingerprint("tok_super_secret_value"));
        assert_eq!(a.len(), FINGERPRINT_BYTES * 2);
        assert!(!a.contains("secret"));
        assert_ne!(a, fingerprint("tok_other"));
    }

    #[test]
    fn test_debug_never_prints_secrets() {
        let secrets = ProviderSecrets::new("api_key_live_9876", "the-real-secret")
            .with_access_token("tok_plaintext_value");
        let rendered = format!("{secrets:?}");
        assert!(!rendered.contains("the-real-secret"));
        assert!(!rendered.contains("tok_plaintext_value"));
        assert!(!rendered.contains("api_key_live_9876"));
        assert!(rendered.contains("****9876"));
    }

    #[test]
    fn test_rotated_keeps_identity_fields() {
        let secrets = ProviderSecrets::new("api_key_live_9876", "s3cr3t!!").with_store_id("store-0042");
        let next = secrets.rotated("tok_new");
        assert_eq!(next.access_token.as_deref(), Some("tok_new"));
        assert_eq!(next.store_id.as_deref(), Some("store-0042"));
        assert_eq!(next.api_key, secrets.api_key);
    }

    #[test]
    fn test_masked_hints() {
        let hints = ProviderSecrets::new("api_key_live_9876", "s3cr3t!!")
            .with_store_id("store-0042")
            .with_access_token("tok_abc")
            .masked_hints();
        assert_eq!(hints.api_key.as_deref(), Some("****9876"));
        assert_eq!(hints.store_id.as_deref(), Some("****0042"));
        assert_eq!(hints.token_fingerprint, Some(fingerprint("tok_abc")));
    }
}
