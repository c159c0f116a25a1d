//! HTTP client for a provider's token and identity endpoints.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use reqwest::{Client, Response};
use serde::Serialize;
use url::Url;

use crate::clock::Clock;
use crate::config::{ProviderConfig, TimeoutConfig};
use crate::envelope::ProviderSecrets;
use crate::provider::{Identity, ProviderApi, ProviderError, ProviderResult, TokenGrant};
use crate::resilience::retries::parse_retry_after;

#[derive(Serialize)]
struct TokenRequest<'a> {
    api_key: &'a str,
    api_secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    store_id: Option<&'a str>,
}

pub struct HttpProvider {
    name: String,
    client: Client,
    token_url: Url,
    identity_url: Url,
    clock: Arc<dyn Clock>,
}

impl HttpProvider {
    pub fn new(config: &ProviderConfig, timeouts: &TimeoutConfig, clock: Arc<dyn Clock>) -> ProviderResult<Self> {
        let base = Url::parse(&config.base_url).map_err(|_| ProviderError::Malformed("invalid base_url"))?;
        let token_url = base
            .join(&config.token_path)
            .map_err(|_| ProviderError::Malformed("invalid token_path"))?;
        let identity_url = base
            .join(&config.identity_path)
            .map_err(|_| ProviderError::Malformed("invalid identity_path"))?;

        let client = Client::builder()
            .connect_timeout(Duration::from_secs(timeouts.connect_secs))
            .timeout(Duration::from_secs(timeouts.provider_request_secs))
            .user_agent(concat!("pos-rotator/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|_| ProviderError::Malformed("http client configuration"))?;

        Ok(Self {
            name: config.name.clone(),
            client,
            token_url,
            identity_url,
            clock,
        })
    }

    /// Pass 2xx through; turn anything else into a classified error without
    /// reading the body.
    fn check(&self, response: Response) -> ProviderResult<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_retry_after(v, self.clock.now()));

        tracing::debug!(
            provider = %self.name,
            status = status.as_u16(),
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "Provider returned error status"
        );
        Err(ProviderError::from_status(status.as_u16(), retry_after))
    }
}

#[async_trait]
impl ProviderApi for HttpProvider {
    async fn exchange_token(&self, secrets: &ProviderSecrets) -> ProviderResult<TokenGrant> {
        let body = TokenRequest {
            api_key: &secrets.api_key,
            api_secret: &secrets.api_secret,
            store_id: secrets.store_id.as_deref(),
        };
        let response = self
            .client
            .post(self.token_url.clone())
            .json(&body)
            .send()
            .await?;
        let grant: TokenGrant = self.check(response)?.json().await?;
        if grant.token.is_empty() {
            return Err(ProviderError::Malformed("empty token"));
        }
        Ok(grant)
    }

    async fn verify_identity(&self, token: &str) -> ProviderResult<Identity> {
        let response = self
            .client
            .get(self.identity_url.clone())
            .bearer_auth(token)
            .send()
            .await?;
        Ok(self.check(response)?.json().await?)
    }
}
