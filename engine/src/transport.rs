//! Single-shot model transports.
//!
//! Two variants share one chat-completions wire shape: a remote managed
//! backend reached over HTTPS with a bearer credential, and a local
//! OpenAI-compatible server at a configurable base URL. Neither retries;
//! retry policy belongs to the call pipeline. The engine never sends
//! provider-specific response-format switches: JSON output is requested by
//! prompt amendment only.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::Serialize;
use tracing::debug;

use crate::error::EngineError;
use crate::error::Result;
use crate::pricing::estimate_tokens;

/// Directive appended to the prompt when the caller asked for JSON output.
pub const JSON_OUTPUT_DIRECTIVE: &str =
    "Respond with valid JSON only. No markdown, no commentary.";

/// One LLM request: instruction plus data payload.
#[derive(Clone, Debug, Default)]
pub struct CompletionRequest {
    pub model: String,
    pub prompt: String,
    pub context: String,
    pub json_output: bool,
    /// Hard output-token ceiling for the call.
    pub max_tokens: u32,
}

impl CompletionRequest {
    /// The single user-message content sent over the wire.
    ///
    /// Context, when present, is prepended the way the corpus analyses
    /// expect: a `Context:` block followed by the `Task:` instruction.
    pub fn wire_content(&self) -> String {
        let mut content = if self.context.is_empty() {
            self.prompt.clone()
        } else {
            format!("Context:\n{}\n\nTask:\n{}", self.context, self.prompt)
        };
        if self.json_output {
            content.push_str("\n\n");
            content.push_str(JSON_OUTPUT_DIRECTIVE);
        }
        content
    }
}

/// A completed round-trip with token accounting.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// A backend capable of one prompt -> text round-trip.
#[async_trait]
pub trait ModelTransport: Send + Sync {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion>;

    /// Short backend label for logging ("remote" / "local").
    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

#[derive(Deserialize)]
struct ChatUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

fn transport_error_from_reqwest(err: reqwest::Error) -> EngineError {
    // Failures below the HTTP layer; status-based rejections are mapped
    // separately.
    let retryable = err.is_timeout() || err.is_connect() || err.is_request();
    EngineError::transport(format!("request failed: {err}"), retryable)
}

fn transport_error_from_status(status: StatusCode, body: &str) -> EngineError {
    let retryable = status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS;
    let snippet: String = body.chars().take(200).collect();
    EngineError::transport(format!("backend returned {status}: {snippet}"), retryable)
}

/// Strip one leading `<think>...</think>` block emitted by thinking models.
///
/// Applied exactly once at the transport so every later layer sees only the
/// answer. Anything short of a complete leading block passes through.
pub fn strip_think_block(text: &str) -> &str {
    let trimmed = text.trim_start();
    let Some(rest) = trimmed.strip_prefix("<think>") else {
        return text;
    };
    match rest.find("</think>") {
        Some(end) => rest[end + "</think>".len()..].trim_start(),
        None => text,
    }
}

async fn post_chat(
    client: &reqwest::Client,
    url: &str,
    bearer: Option<&str>,
    timeout: Duration,
    request: &CompletionRequest,
) -> Result<ChatResponse> {
    let content = request.wire_content();
    let body = ChatRequest {
        model: &request.model,
        messages: vec![ChatMessage {
            role: "user",
            content: &content,
        }],
        max_tokens: request.max_tokens,
    };

    let mut builder = client.post(url).timeout(timeout).json(&body);
    if let Some(token) = bearer {
        builder = builder.bearer_auth(token);
    }

    let response = builder.send().await.map_err(transport_error_from_reqwest)?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(transport_error_from_status(status, &body));
    }
    response
        .json::<ChatResponse>()
        .await
        .map_err(|err| EngineError::transport(format!("malformed response: {err}"), false))
}

fn completion_from_response(
    response: ChatResponse,
    request: &CompletionRequest,
    strip_think: bool,
) -> Result<Completion> {
    let raw = response
        .choices
        .into_iter()
        .next()
        .map(|choice| choice.message.content)
        .ok_or_else(|| EngineError::transport("response carried no choices", false))?;

    let text = if strip_think {
        strip_think_block(&raw).to_string()
    } else {
        raw
    };

    // Backends that omit usage get the ~4 chars/token estimate over the
    // combined prompt and context.
    let estimated_in = ((request.prompt.len() + request.context.len()) as u64)
        .div_ceil(4)
        .max(1);
    let (tokens_in, tokens_out) = match response.usage {
        Some(usage) => (
            usage.input_tokens.unwrap_or(estimated_in),
            usage.output_tokens.unwrap_or_else(|| estimate_tokens(&text)),
        ),
        None => (estimated_in, estimate_tokens(&text)),
    };

    Ok(Completion {
        text,
        tokens_in,
        tokens_out,
    })
}

/// Remote managed backend over HTTPS with a bearer credential.
pub struct RemoteTransport {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

impl RemoteTransport {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
            timeout,
        }
    }
}

#[async_trait]
impl ModelTransport for RemoteTransport {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %request.model, backend = "remote", "issuing completion");
        let response = post_chat(
            &self.client,
            &url,
            Some(&self.api_key),
            self.timeout,
            request,
        )
        .await?;
        completion_from_response(response, request, false)
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}

/// Local OpenAI-compatible backend at a configurable base URL.
pub struct LocalTransport {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl LocalTransport {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            timeout,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl ModelTransport for LocalTransport {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(model = %request.model, backend = "local", "issuing completion");
        let response = post_chat(&self.client, &url, None, self.timeout, request).await?;
        completion_from_response(response, request, true)
    }

    fn name(&self) -> &'static str {
        "local"
    }
}
