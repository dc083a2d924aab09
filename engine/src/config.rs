//! Engine configuration.
//!
//! Sections mirror the run lifecycle: budget limits for the governor,
//! backend selection inputs, cache placement, and worker-pool sizing.
//! A TOML file layer (`EngineConfigFile`) feeds defaults; recognised
//! environment variables override it.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::error::Result;

/// Main configuration for one engine run.
#[derive(Clone, Debug, Default)]
pub struct EngineConfig {
    /// Session budget limits.
    pub budget: BudgetConfig,
    /// Backend selection and transport settings.
    pub backend: BackendConfig,
    /// Query cache placement and TTLs.
    pub cache: CacheConfig,
    /// Worker pool sizing.
    pub pool: PoolConfig,
}

impl EngineConfig {
    pub fn load_from_path(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|err| {
            EngineError::configuration(format!("cannot read config {}: {err}", path.display()))
        })?;
        let file: EngineConfigFile = toml::from_str(&content)
            .map_err(|err| EngineError::configuration(format!("malformed config: {err}")))?;
        Ok(Self::from_file(file))
    }

    fn from_file(file: EngineConfigFile) -> Self {
        let mut config = Self::default();
        if let Some(budget) = file.budget {
            config.budget = budget.into();
        }
        if let Some(backend) = file.backend {
            config.backend = backend.into();
        }
        if let Some(cache) = file.cache {
            config.cache = cache.into();
        }
        if let Some(pool) = file.pool {
            config.pool = pool.into();
        }
        config
    }

    /// Apply the recognised environment variables on top of the current values.
    ///
    /// `REMOTE_API_KEY` supplies the remote credential, `CACHE_ROOT` moves the
    /// cache, and `MAX_BUDGET_USD` / `MAX_CALLS` / `MAX_DEPTH` replace the
    /// session limits. Malformed numeric values are configuration errors.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Ok(key) = std::env::var("REMOTE_API_KEY") {
            if !key.is_empty() {
                self.backend.remote_api_key = Some(key);
            }
        }
        if let Ok(root) = std::env::var("CACHE_ROOT") {
            if !root.is_empty() {
                self.cache.root = Some(PathBuf::from(root));
            }
        }
        if let Ok(value) = std::env::var("MAX_BUDGET_USD") {
            self.budget.max_budget_usd = value.parse().map_err(|_| {
                EngineError::configuration(format!("MAX_BUDGET_USD is not a number: {value}"))
            })?;
        }
        if let Ok(value) = std::env::var("MAX_CALLS") {
            self.budget.max_calls = value.parse().map_err(|_| {
                EngineError::configuration(format!("MAX_CALLS is not an integer: {value}"))
            })?;
        }
        if let Ok(value) = std::env::var("MAX_DEPTH") {
            self.budget.max_depth = value.parse().map_err(|_| {
                EngineError::configuration(format!("MAX_DEPTH is not an integer: {value}"))
            })?;
        }
        Ok(())
    }
}

/// Session budget limits.
#[derive(Clone, Debug)]
pub struct BudgetConfig {
    /// Maximum spend in USD.
    pub max_budget_usd: f64,
    /// Maximum number of accounted LLM calls.
    pub max_calls: u64,
    /// Maximum concurrent reservation depth.
    pub max_depth: u64,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            max_budget_usd: 1.0,
            max_calls: 50,
            max_depth: 8,
        }
    }
}

/// Backend selection and transport settings.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Force the remote backend even when a local endpoint answers.
    pub force_remote: bool,
    /// Skip probing and use this local base URL.
    pub local_base_url: Option<String>,
    /// Bearer credential for the remote backend.
    pub remote_api_key: Option<String>,
    /// Remote chat-completions endpoint base URL.
    pub remote_base_url: String,
    /// Model override; otherwise the selector's discovery wins.
    pub model: Option<String>,
    /// Hard output-token ceiling per call.
    pub max_output_tokens: u32,
    /// Per-call timeout for local backends. Thinking models want >= 600s.
    pub local_timeout: Duration,
    /// Per-call timeout for the remote backend.
    pub remote_timeout: Duration,
    /// Allow one pipeline-level retry of retryable transport failures.
    pub retry_transport_errors: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            force_remote: false,
            local_base_url: None,
            remote_api_key: None,
            remote_base_url: "https://api.openai.com/v1".to_string(),
            model: None,
            max_output_tokens: 4096,
            local_timeout: Duration::from_secs(240),
            remote_timeout: Duration::from_secs(120),
            retry_transport_errors: false,
        }
    }
}

/// Query cache placement and behavior.
#[derive(Clone, Debug)]
pub struct CacheConfig {
    /// Cache root directory; temp dir by default.
    pub root: Option<PathBuf>,
    /// Skip the cache entirely for this run.
    pub bypass: bool,
    /// TTL for general entries.
    pub ttl: Duration,
    /// TTL for the segregated security-pattern namespace.
    pub security_ttl: Duration,
    /// Retention for observed-pattern history.
    pub pattern_retention: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            root: None,
            bypass: false,
            ttl: Duration::from_secs(24 * 3600),
            security_ttl: Duration::from_secs(7 * 24 * 3600),
            pattern_retention: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

/// Worker pool sizing.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    /// Maximum concurrent in-flight transport calls per fan-out.
    pub max_workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self { max_workers: 5 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct EngineConfigFile {
    pub budget: Option<BudgetConfigFile>,
    pub backend: Option<BackendConfigFile>,
    pub cache: Option<CacheConfigFile>,
    pub pool: Option<PoolConfigFile>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BudgetConfigFile {
    pub max_budget_usd: Option<f64>,
    pub max_calls: Option<u64>,
    pub max_depth: Option<u64>,
}

impl From<BudgetConfigFile> for BudgetConfig {
    fn from(file: BudgetConfigFile) -> Self {
        let mut config = BudgetConfig::default();
        if let Some(max_budget_usd) = file.max_budget_usd {
            config.max_budget_usd = max_budget_usd;
        }
        if let Some(max_calls) = file.max_calls {
            config.max_calls = max_calls;
        }
        if let Some(max_depth) = file.max_depth {
            config.max_depth = max_depth;
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct BackendConfigFile {
    pub force_remote: Option<bool>,
    pub local_base_url: Option<String>,
    pub remote_base_url: Option<String>,
    pub model: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub local_timeout_secs: Option<u64>,
    pub remote_timeout_secs: Option<u64>,
    pub retry_transport_errors: Option<bool>,
}

impl From<BackendConfigFile> for BackendConfig {
    fn from(file: BackendConfigFile) -> Self {
        let mut config = BackendConfig::default();
        if let Some(force_remote) = file.force_remote {
            config.force_remote = force_remote;
        }
        if let Some(local_base_url) = file.local_base_url {
            config.local_base_url = Some(local_base_url);
        }
        if let Some(remote_base_url) = file.remote_base_url {
            config.remote_base_url = remote_base_url;
        }
        if let Some(model) = file.model {
            config.model = Some(model);
        }
        if let Some(max_output_tokens) = file.max_output_tokens {
            config.max_output_tokens = max_output_tokens;
        }
        if let Some(secs) = file.local_timeout_secs {
            config.local_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = file.remote_timeout_secs {
            config.remote_timeout = Duration::from_secs(secs);
        }
        if let Some(retry) = file.retry_transport_errors {
            config.retry_transport_errors = retry;
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct CacheConfigFile {
    pub root: Option<PathBuf>,
    pub bypass: Option<bool>,
    pub ttl_hours: Option<u64>,
    pub security_ttl_hours: Option<u64>,
    pub pattern_retention_days: Option<u64>,
}

impl From<CacheConfigFile> for CacheConfig {
    fn from(file: CacheConfigFile) -> Self {
        let mut config = CacheConfig::default();
        if let Some(root) = file.root {
            config.root = Some(root);
        }
        if let Some(bypass) = file.bypass {
            config.bypass = bypass;
        }
        if let Some(hours) = file.ttl_hours {
            config.ttl = Duration::from_secs(hours * 3600);
        }
        if let Some(hours) = file.security_ttl_hours {
            config.security_ttl = Duration::from_secs(hours * 3600);
        }
        if let Some(days) = file.pattern_retention_days {
            config.pattern_retention = Duration::from_secs(days * 24 * 3600);
        }
        config
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PoolConfigFile {
    pub max_workers: Option<usize>,
}

impl From<PoolConfigFile> for PoolConfig {
    fn from(file: PoolConfigFile) -> Self {
        Self {
            max_workers: file.max_workers.unwrap_or(5).max(1),
        }
    }
}
