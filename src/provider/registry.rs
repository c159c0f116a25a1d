//! Provider lookup by name.

use std::collections::HashMap;
use std::sync::Arc;

use crate::clock::Clock;
use crate::config::RotatorConfig;
use crate::provider::{HttpProvider, ProviderApi, ProviderError, ProviderResult};

#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderApi>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// One [`HttpProvider`] per configured provider.
    pub fn from_config(config: &RotatorConfig, clock: Arc<dyn Clock>) -> ProviderResult<Self> {
        let mut registry = Self::new();
        for p in &config.providers {
            let provider = HttpProvider::new(p, &config.timeouts, clock.clone())?;
            tracing::info!(provider = %p.name, base_url = %p.base_url, "Provider registered");
            registry.register(p.name.clone(), Arc::new(provider));
        }
        Ok(registry)
    }

    pub fn register(&mut self, name: impl Into<String>, api: Arc<dyn ProviderApi>) {
        self.providers.insert(name.into(), api);
    }

    pub fn get(&self, name: &str) -> ProviderResult<Arc<dyn ProviderApi>> {
        self.providers
            .get(name)
            .cloned()
            .ok_or_else(|| ProviderError::Unknown(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.providers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::config::ProviderConfig;

    #[test]
    fn test_from_config() {
        let mut config = RotatorConfig::default();
        config.providers.push(ProviderConfig {
            name: "square".into(),
            base_url: "http://127.0.0.1:9".into(),
            token_path: "/oauth/token".into(),
            identity_path: "/v1/me".into(),
        });
        let registry = ProviderRegistry::from_config(&config, Arc::new(SystemClock)).unwrap();
        assert_eq!(registry.names(), vec!["square"]);
        assert!(registry.get("square").is_ok());
        assert!(matches!(registry.get("toast"), Err(ProviderError::Unknown(_))));
    }
}
