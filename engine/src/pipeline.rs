//! The `llm_query` contract.
//!
//! Cache lookup, governor admission, transport under a cancellation-aware
//! deadline, governor accounting, cache write. Cache hits are free: they do
//! not touch the governor's call counter and are tallied separately. Every
//! granted admission is settled exactly once, with zeros when the transport
//! failed, so depth cannot leak.

use std::time::Duration;

use tracing::debug;
use tracing::warn;

use crate::cache::CacheNamespace;
use crate::cache::QueryKey;
use crate::error::EngineError;
use crate::error::Result;
use crate::pricing::estimate_tokens;
use crate::session::Session;
use crate::transport::Completion;
use crate::transport::CompletionRequest;

/// Per-call options for `llm_query_with`.
#[derive(Clone, Debug, Default)]
pub struct QueryOptions {
    /// Model override; the session default otherwise.
    pub model: Option<String>,
    /// Request JSON output via prompt amendment.
    pub json_output: bool,
    /// Cache under the security namespace (longer TTL).
    pub security_cache: bool,
}

impl QueryOptions {
    fn namespace(&self) -> CacheNamespace {
        if self.security_cache {
            CacheNamespace::Security
        } else {
            CacheNamespace::General
        }
    }
}

impl Session {
    /// Issue one LLM call with default options.
    pub async fn llm_query(&self, prompt: &str, context: &str) -> Result<String> {
        self.llm_query_with(prompt, context, QueryOptions::default())
            .await
    }

    /// Issue one LLM call.
    ///
    /// Budget refusals and transport failures come back as typed error
    /// values; the caller's control flow decides what to do with them.
    pub async fn llm_query_with(
        &self,
        prompt: &str,
        context: &str,
        options: QueryOptions,
    ) -> Result<String> {
        let model = options
            .model
            .clone()
            .unwrap_or_else(|| self.default_model().to_string());
        let namespace = options.namespace();
        let key = QueryKey::compute(&model, prompt, context, options.json_output);

        if let Some(cache) = self.cache() {
            if let Some(entry) = cache.get(&key, namespace) {
                debug!(%key, "cache hit");
                self.governor().record_cache_hit();
                return Ok(entry.response);
            }
        }

        let estimated = estimate_tokens(prompt) + estimate_tokens(context);
        let admission = self.governor().reserve(estimated, &model)?;

        let request = CompletionRequest {
            model: model.clone(),
            prompt: prompt.to_string(),
            context: context.to_string(),
            json_output: options.json_output,
            max_tokens: self.config().backend.max_output_tokens,
        };

        match self.run_transport(&request).await {
            Ok(completion) => {
                self.governor().account(
                    admission,
                    completion.tokens_in,
                    completion.tokens_out,
                    &model,
                );
                if let Some(cache) = self.cache() {
                    if let Err(err) = cache.put(
                        &key,
                        namespace,
                        &completion.text,
                        &model,
                        completion.tokens_in,
                        completion.tokens_out,
                    ) {
                        warn!(%err, "cache write failed");
                    }
                }
                Ok(completion.text)
            }
            Err(err) => {
                // Settle with zeros so the failed call releases its depth
                // slot but still counts against the call budget.
                self.governor().account(admission, 0, 0, &model);
                Err(err)
            }
        }
    }

    /// Drive the transport, bounded by the session cancellation signal.
    ///
    /// The per-call timeout lives inside the transport; a sibling overrun
    /// that fires the cancellation token aborts this call too. At most one
    /// retry, and only when configured and the failure is retryable.
    async fn run_transport(&self, request: &CompletionRequest) -> Result<Completion> {
        let cancel = self.cancellation();
        let mut attempts_left = if self.config().backend.retry_transport_errors {
            2
        } else {
            1
        };
        let mut backoff = Duration::from_millis(500);

        loop {
            let outcome = tokio::select! {
                _ = cancel.cancelled() => Err(EngineError::Cancelled),
                result = self.transport().complete(request) => result,
            };

            attempts_left -= 1;
            match outcome {
                Err(ref err) if err.is_retryable() && attempts_left > 0 => {
                    debug!(%err, "retrying transport call after backoff");
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                other => return other,
            }
        }
    }
}
