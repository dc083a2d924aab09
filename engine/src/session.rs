//! Per-run session: the governor, the cache handle, and the chosen backend.
//!
//! Exactly one `Session` exists per engine run. It owns the budget counters
//! exclusively; the cache opens lazily on first use and degrades to a no-op
//! when the disk is unavailable.

use std::sync::Arc;
use std::sync::OnceLock;

use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing::warn;

use crate::backend::select_backend;
use crate::cache::CacheStats;
use crate::cache::PatternStore;
use crate::cache::QueryCache;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::governor::Governor;
use crate::governor::GovernorLimits;
use crate::governor::SessionStats;
use crate::pricing::PricingTable;
use crate::transport::ModelTransport;

pub struct Session {
    config: EngineConfig,
    governor: Governor,
    transport: Arc<dyn ModelTransport>,
    default_model: String,
    backend_description: String,
    cache: OnceLock<Option<QueryCache>>,
    patterns: OnceLock<Option<PatternStore>>,
}

impl Session {
    /// Construct a session by running backend selection.
    pub async fn start(config: EngineConfig) -> Result<Self> {
        let selection = select_backend(&config.backend).await?;
        info!(
            backend = %selection.description,
            model = %selection.model,
            budget_usd = config.budget.max_budget_usd,
            max_calls = config.budget.max_calls,
            max_depth = config.budget.max_depth,
            "session ready"
        );
        Ok(Self::assemble(
            config,
            selection.transport,
            selection.model,
            selection.description,
            PricingTable::default(),
        ))
    }

    /// Construct a session around an already-chosen transport.
    ///
    /// Used by embedders and tests that supply their own backend and
    /// pricing; no probing happens.
    pub fn with_transport(
        config: EngineConfig,
        transport: Arc<dyn ModelTransport>,
        model: impl Into<String>,
        pricing: PricingTable,
    ) -> Self {
        let description = transport.name().to_string();
        Self::assemble(config, transport, model.into(), description, pricing)
    }

    fn assemble(
        config: EngineConfig,
        transport: Arc<dyn ModelTransport>,
        model: String,
        backend_description: String,
        pricing: PricingTable,
    ) -> Self {
        let limits = GovernorLimits::from(&config.budget);
        Self {
            governor: Governor::new(limits, pricing),
            transport,
            default_model: model,
            backend_description,
            cache: OnceLock::new(),
            patterns: OnceLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn governor(&self) -> &Governor {
        &self.governor
    }

    pub(crate) fn transport(&self) -> &Arc<dyn ModelTransport> {
        &self.transport
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    pub fn backend_description(&self) -> &str {
        &self.backend_description
    }

    /// The cache handle, opened on first access. `None` when bypassed or
    /// when the disk is unusable (logged, run continues uncached).
    pub(crate) fn cache(&self) -> Option<&QueryCache> {
        if self.config.cache.bypass {
            return None;
        }
        self.cache
            .get_or_init(|| match QueryCache::open(&self.config.cache) {
                Ok(cache) => Some(cache),
                Err(err) => {
                    warn!(%err, "query cache unavailable; continuing without it");
                    None
                }
            })
            .as_ref()
    }

    /// The observed-pattern store, opened on first access. Disabled along
    /// with the cache when the run bypasses disk state.
    pub fn pattern_store(&self) -> Option<&PatternStore> {
        if self.config.cache.bypass {
            return None;
        }
        self.patterns
            .get_or_init(|| match PatternStore::open(&self.config.cache) {
                Ok(store) => Some(store),
                Err(err) => {
                    warn!(%err, "pattern store unavailable; continuing without it");
                    None
                }
            })
            .as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.governor.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache().map(QueryCache::stats).unwrap_or_default()
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.governor.cancellation()
    }

    /// Run-level warnings for the envelope.
    pub fn warnings(&self) -> Vec<String> {
        self.governor
            .unpriced_models()
            .into_iter()
            .map(|model| format!("no pricing for model {model}; cost accounted as zero"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::EngineError;
    use crate::transport::Completion;
    use crate::transport::CompletionRequest;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    struct NullTransport;

    #[async_trait]
    impl ModelTransport for NullTransport {
        async fn complete(&self, _request: &CompletionRequest) -> crate::error::Result<Completion> {
            Err(EngineError::transport("unreachable", false))
        }

        fn name(&self) -> &'static str {
            "null"
        }
    }

    #[test]
    fn bypass_disables_the_cache() {
        let config = EngineConfig {
            cache: CacheConfig {
                bypass: true,
                ..CacheConfig::default()
            },
            ..EngineConfig::default()
        };
        let session = Session::with_transport(
            config,
            Arc::new(NullTransport),
            "m",
            PricingTable::default(),
        );
        assert!(session.cache().is_none());
        assert!(session.pattern_store().is_none());
        assert_eq!(session.cache_stats(), CacheStats::default());
    }

    #[test]
    fn cache_opens_lazily_under_configured_root() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            cache: CacheConfig {
                root: Some(dir.path().join("nested")),
                ..CacheConfig::default()
            },
            ..EngineConfig::default()
        };
        let session = Session::with_transport(
            config,
            Arc::new(NullTransport),
            "m",
            PricingTable::default(),
        );
        assert!(!dir.path().join("nested").exists());
        assert!(session.cache().is_some());
        assert!(dir.path().join("nested").exists());
    }

    #[test]
    fn stats_start_at_zero() {
        let session = Session::with_transport(
            EngineConfig::default(),
            Arc::new(NullTransport),
            "m",
            PricingTable::default(),
        );
        let stats = session.stats();
        assert_eq!(stats.call_count, 0);
        assert_eq!(stats.total_cost_usd, 0.0);
        assert_eq!(session.default_model(), "m");
    }
}
