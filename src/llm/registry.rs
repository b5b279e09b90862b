//! Provider → adapter lookup, built once at startup.

use std::collections::HashMap;
use std::sync::Arc;

use super::{
    AdapterError, AnthropicAdapter, GoogleAdapter, ModelClientAdapter, OpenAiAdapter, Provider,
};
use crate::config::ProvidersConfig;

/// Registry of one adapter per provider.
///
/// Adapters for providers without credentials are still registered; they
/// fail with a configuration error when a job actually selects them.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Provider, Arc<dyn ModelClientAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut providers: Vec<_> = self.adapters.keys().map(|p| p.as_str()).collect();
        providers.sort_unstable();
        f.debug_struct("AdapterRegistry")
            .field("providers", &providers)
            .finish()
    }
}

impl AdapterRegistry {
    /// An empty registry; every lookup fails until adapters are added.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Build HTTP adapters for every provider from configuration.
    #[must_use]
    pub fn from_config(config: &ProvidersConfig, http: &reqwest::Client) -> Self {
        let registry = Self::new()
            .with_adapter(Arc::new(OpenAiAdapter::new(
                http.clone(),
                config.openai.clone(),
            )))
            .with_adapter(Arc::new(AnthropicAdapter::new(
                http.clone(),
                config.anthropic.clone(),
            )))
            .with_adapter(Arc::new(GoogleAdapter::new(
                http.clone(),
                config.google.clone(),
            )));

        for provider in Provider::ALL {
            let configured = registry
                .get(provider)
                .is_some_and(|a| a.ensure_configured().is_ok());
            tracing::info!(
                name: "llm.registry.provider",
                provider = %provider,
                configured,
                "Registered model adapter"
            );
        }
        registry
    }

    /// Register (or replace) the adapter for its provider.
    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn ModelClientAdapter>) -> Self {
        self.adapters.insert(adapter.provider(), adapter);
        self
    }

    #[must_use]
    pub fn get(&self, provider: Provider) -> Option<Arc<dyn ModelClientAdapter>> {
        self.adapters.get(&provider).cloned()
    }

    /// Look up a provider's adapter and check its credentials.
    ///
    /// # Errors
    ///
    /// Returns [`AdapterError::Configuration`] if the provider has no adapter
    /// or its adapter is missing credentials.
    pub fn resolve(&self, provider: Provider) -> Result<Arc<dyn ModelClientAdapter>, AdapterError> {
        let adapter = self
            .get(provider)
            .ok_or(AdapterError::Configuration(provider))?;
        adapter.ensure_configured()?;
        Ok(adapter)
    }
}
