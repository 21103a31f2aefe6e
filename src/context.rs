//! Process-wide collaborators, built once and passed to every operation.

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingProvider};
use crate::extract::ExtractorRegistry;
use crate::session::SessionManager;
use crate::store::{IndexStore, SqliteIndexStore};

/// Configuration plus the provider, store, session manager and extractor
/// registry it resolves to. Pipeline and query work runs inside [`span`].
///
/// [`span`]: PortalContext::span
#[derive(Clone)]
pub struct PortalContext {
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    store: Arc<dyn IndexStore>,
    sessions: SessionManager,
    extractors: ExtractorRegistry,
    span: tracing::Span,
}

impl PortalContext {
    /// Validate `config` and resolve its embedding provider.
    pub fn from_config(config: Config) -> Result<Self> {
        config.validate()?;
        let provider = create_provider(&config.embedding).with_context(|| {
            format!(
                "Failed to initialise embedding provider '{}'",
                config.embedding.provider
            )
        })?;
        Ok(Self::with_provider(config, provider))
    }

    /// Build a context around an already-constructed provider.
    pub fn with_provider(config: Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let sessions = SessionManager::new(
            config.storage.temp_root.clone(),
            config.storage.index_root.clone(),
        );
        let span = tracing::info_span!(
            "document_portal",
            service = "document-portal",
            model = provider.model_name()
        );
        Self {
            config,
            provider,
            store: Arc::new(SqliteIndexStore::new()),
            sessions,
            extractors: ExtractorRegistry::with_builtins(),
            span,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn IndexStore>) -> Self {
        self.store = store;
        self
    }

    pub fn with_sessions(mut self, sessions: SessionManager) -> Self {
        self.sessions = sessions;
        self
    }

    pub fn with_extractors(mut self, extractors: ExtractorRegistry) -> Self {
        self.extractors = extractors;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn provider(&self) -> &Arc<dyn EmbeddingProvider> {
        &self.provider
    }

    pub fn store(&self) -> &dyn IndexStore {
        self.store.as_ref()
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn extractors(&self) -> &ExtractorRegistry {
        &self.extractors
    }

    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_from_minimal_config_uses_hash_provider() {
        let tmp = TempDir::new().unwrap();
        let ctx = PortalContext::from_config(Config::minimal(tmp.path())).unwrap();
        assert_eq!(ctx.provider().model_name(), "feature-hash");
        assert_eq!(ctx.sessions().index_root(), tmp.path().join("index"));
        assert!(ctx.extractors().supports("PDF"));
    }

    #[test]
    fn test_invalid_config_rejected() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.chunking.overlap_chars = config.chunking.max_chars;
        assert!(PortalContext::from_config(config).is_err());
    }
}
