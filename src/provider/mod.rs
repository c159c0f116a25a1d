//! POS provider access.
//!
//! # Data Flow
//! ```text
//! Orchestrator
//!     → ProviderRegistry::get(provider)
//!     → ProviderApi::exchange_token(secrets)   POST token endpoint
//!     → ProviderApi::verify_identity(token)    GET identity endpoint
//! ```
//!
//! # Design Decisions
//! - Status semantics: 401/403 auth, 429 rate limited, 5xx transient
//! - Tokens only live inside [`TokenGrant`], whose Debug is redacted

pub mod error;
pub mod http;
pub mod registry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::envelope::{fingerprint, ProviderSecrets};

pub use error::{ProviderError, ProviderResult};
pub use http::HttpProvider;
pub use registry::ProviderRegistry;

/// `{token, expiresIn}` from the token endpoint.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
pub struct TokenGrant {
    pub token: String,
    /// Seconds until the token expires.
    #[serde(default)]
    pub expires_in: Option<u64>,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("token", &fingerprint(&self.token))
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// Response of the identity endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
}

/// A POS provider's token and identity endpoints.
#[async_trait]
pub trait ProviderApi: Send + Sync {
    async fn exchange_token(&self, secrets: &ProviderSecrets) -> ProviderResult<TokenGrant>;

    async fn verify_identity(&self, token: &str) -> ProviderResult<Identity>;
}
