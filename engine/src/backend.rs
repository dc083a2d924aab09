//! Startup backend selection.
//!
//! Probes a fixed list of local OpenAI-compatible endpoints once; the first
//! to answer `/models` within a short window is selected and its first
//! listed model becomes the session default. Falls back to the remote
//! managed backend when a credential is present. Overrides can force the
//! remote backend or pin a specific local base URL.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;
use tracing::info;

use crate::config::BackendConfig;
use crate::error::EngineError;
use crate::error::Result;
use crate::transport::LocalTransport;
use crate::transport::ModelTransport;
use crate::transport::RemoteTransport;

/// Local endpoints probed in order at startup.
pub const LOCAL_PROBE_URLS: [&str; 4] = [
    "http://localhost:8080/v1",
    "http://localhost:11434/v1",
    "http://localhost:1234/v1",
    "http://localhost:8000/v1",
];

/// Connect + read window for each probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// The outcome of backend selection.
pub struct BackendSelection {
    pub transport: Arc<dyn ModelTransport>,
    /// Canonical model name for the session.
    pub model: String,
    /// Human-readable description for logging and diagnostics.
    pub description: String,
}

impl std::fmt::Debug for BackendSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSelection")
            .field("transport", &self.transport.name())
            .field("model", &self.model)
            .field("description", &self.description)
            .finish()
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
}

/// Fetch `{base}/models` and return the first listed model id.
async fn probe_models(client: &reqwest::Client, base_url: &str) -> Option<String> {
    let url = format!("{}/models", base_url.trim_end_matches('/'));
    let response = client
        .get(&url)
        .timeout(PROBE_TIMEOUT)
        .send()
        .await
        .ok()?;
    if !response.status().is_success() {
        return None;
    }
    let models: ModelsResponse = response.json().await.ok()?;
    models.data.into_iter().next().map(|entry| entry.id)
}

/// Choose the transport and canonical model for this run.
///
/// Runs once at session construction. Precedence: force-remote override,
/// pinned local URL, probed local endpoints, then remote credential. With
/// none of those available the run cannot start.
pub async fn select_backend(config: &BackendConfig) -> Result<BackendSelection> {
    let client = reqwest::Client::new();

    if config.force_remote {
        return remote_selection(config);
    }

    if let Some(base_url) = &config.local_base_url {
        let discovered = probe_models(&client, base_url).await;
        let model = config.model.clone().or(discovered).ok_or_else(|| {
            EngineError::BackendUnavailable {
                message: format!("forced local endpoint {base_url} did not answer /models"),
            }
        })?;
        info!(%base_url, %model, "using pinned local backend");
        return Ok(BackendSelection {
            transport: Arc::new(LocalTransport::new(base_url.clone(), config.local_timeout)),
            description: format!("local ({base_url})"),
            model,
        });
    }

    for base_url in LOCAL_PROBE_URLS {
        debug!(%base_url, "probing local backend");
        if let Some(first_model) = probe_models(&client, base_url).await {
            let model = config.model.clone().unwrap_or(first_model);
            info!(%base_url, %model, "selected local backend");
            return Ok(BackendSelection {
                transport: Arc::new(LocalTransport::new(base_url, config.local_timeout)),
                description: format!("local ({base_url})"),
                model,
            });
        }
    }

    if config.remote_api_key.is_some() {
        return remote_selection(config);
    }

    Err(EngineError::BackendUnavailable {
        message: "no local endpoint answered and no remote credential is configured".to_string(),
    })
}

fn remote_selection(config: &BackendConfig) -> Result<BackendSelection> {
    let api_key = config.remote_api_key.clone().ok_or_else(|| {
        EngineError::configuration("remote backend requires REMOTE_API_KEY")
    })?;
    let model = config
        .model
        .clone()
        .unwrap_or_else(|| "claude-3-5-sonnet".to_string());
    info!(%model, "selected remote backend");
    Ok(BackendSelection {
        transport: Arc::new(RemoteTransport::new(
            config.remote_base_url.clone(),
            api_key,
            config.remote_timeout,
        )),
        description: "remote".to_string(),
        model,
    })
}
