//! Ordered fan-out with bounded concurrency and cooperative cancellation.
//!
//! Each item runs the full call pipeline and therefore carries its own
//! governor reserve/account pair; the governor's depth pre-increment is
//! what bounds total concurrency across nested fan-outs. Output order
//! always equals input order regardless of completion order.

use std::sync::Arc;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::debug;

use crate::error::EngineError;
use crate::pipeline::QueryOptions;
use crate::session::Session;

/// One fan-out input: instruction plus data payload.
#[derive(Clone, Debug, Default)]
pub struct QueryMessage {
    pub prompt: String,
    pub context: String,
}

impl QueryMessage {
    pub fn new(prompt: impl Into<String>, context: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            context: context.into(),
        }
    }
}

/// Result slot for one fan-out item.
///
/// Errors stay structured so a workflow cannot mistake one for response
/// content.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(untagged)]
pub enum BatchItem {
    /// Successful response text.
    Success(String),
    /// Error slot with code, message, and retriable flag.
    Error { error: BatchError },
}

/// Error details for a failed fan-out item.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
    pub retriable: bool,
}

impl BatchItem {
    pub fn success(response: impl Into<String>) -> Self {
        Self::Success(response.into())
    }

    pub fn error(code: impl Into<String>, message: impl Into<String>, retriable: bool) -> Self {
        Self::Error {
            error: BatchError {
                code: code.into(),
                message: message.into(),
                retriable,
            },
        }
    }

    pub fn from_engine_error(err: &EngineError) -> Self {
        let code = match err {
            EngineError::BudgetExceeded { .. } => "budget_exceeded",
            EngineError::Transport { .. } => "transport_error",
            EngineError::Cancelled => "cancelled",
            EngineError::Validation { .. } => "validation_error",
            EngineError::Cache { .. } => "cache_error",
            EngineError::Configuration { .. } => "configuration_error",
            EngineError::BackendUnavailable { .. } => "backend_unavailable",
            EngineError::Execution { .. } => "execution_error",
        };
        Self::error(code, err.to_string(), err.is_retryable())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success(_))
    }

    /// The response text, or `None` for an error slot.
    pub fn as_success(&self) -> Option<&str> {
        match self {
            Self::Success(text) => Some(text),
            Self::Error { .. } => None,
        }
    }
}

impl Session {
    /// Fan a batch of messages out through the call pipeline.
    ///
    /// Never more than `max_workers` transport calls are in flight at once
    /// (the session pool default when `None`). Items that have not yet
    /// reserved when the session cancellation fires are skipped with a
    /// `cancelled` slot; in-flight items finish and are accounted.
    pub async fn parallel_llm_query(
        &self,
        messages: &[QueryMessage],
        max_workers: Option<usize>,
    ) -> Vec<BatchItem> {
        self.parallel_llm_query_with(messages, max_workers, QueryOptions::default())
            .await
    }

    /// Fan-out with shared per-item options.
    pub async fn parallel_llm_query_with(
        &self,
        messages: &[QueryMessage],
        max_workers: Option<usize>,
        options: QueryOptions,
    ) -> Vec<BatchItem> {
        if messages.is_empty() {
            return Vec::new();
        }
        let limit = max_workers
            .unwrap_or(self.config().pool.max_workers)
            .max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let cancel = self.cancellation();
        debug!(items = messages.len(), limit, "starting fan-out");

        let futures: Vec<_> = messages
            .iter()
            .map(|message| {
                let semaphore = Arc::clone(&semaphore);
                let cancel = cancel.clone();
                let options = options.clone();
                async move {
                    let _permit = semaphore.acquire().await.expect("pool semaphore closed");
                    // Poll between items: skip work that has not reserved yet.
                    if cancel.is_cancelled() {
                        return BatchItem::from_engine_error(&EngineError::Cancelled);
                    }
                    match self
                        .llm_query_with(&message.prompt, &message.context, options)
                        .await
                    {
                        Ok(text) => BatchItem::Success(text),
                        Err(err) => BatchItem::from_engine_error(&err),
                    }
                }
            })
            .collect();

        join_all(futures).await
    }

    /// Apply one prompt to many chunks: each chunk is rendered to context by
    /// `context_fn` and paired with the shared prompt.
    pub async fn parallel_map<T, F>(
        &self,
        prompt: &str,
        chunks: &[T],
        context_fn: F,
        max_workers: Option<usize>,
    ) -> Vec<BatchItem>
    where
        F: Fn(&T) -> String,
    {
        let messages: Vec<QueryMessage> = chunks
            .iter()
            .map(|chunk| QueryMessage::new(prompt, context_fn(chunk)))
            .collect();
        self.parallel_llm_query(&messages, max_workers).await
    }
}
