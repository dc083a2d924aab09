//! The single JSON record an engine run emits.

use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::governor::SessionStats;

/// Run status carried in the envelope.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Error,
}

/// Everything the caller learns about a run: the final value, captured
/// stdout, session accounting, and the error taxonomy on failure.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub status: RunStatus,
    /// Final textual result, or the structured value from `FINAL_VAR`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    pub stdout: String,
    pub session: SessionStats,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ResultEnvelope {
    pub fn success(result: serde_json::Value, stdout: String, session: SessionStats) -> Self {
        Self {
            status: RunStatus::Success,
            result: Some(result),
            stdout,
            session,
            error_type: None,
            message: None,
            warnings: Vec::new(),
        }
    }

    pub fn error(err: &EngineError, stdout: String, session: SessionStats) -> Self {
        Self {
            status: RunStatus::Error,
            result: None,
            stdout,
            session,
            error_type: Some(err.error_type().to_string()),
            message: Some(err.to_string()),
            warnings: Vec::new(),
        }
    }

    pub fn with_warnings(mut self, warnings: Vec<String>) -> Self {
        self.warnings = warnings;
        self
    }

    /// The one-object-on-stdout form.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|err| {
            format!(
                "{{\"status\":\"error\",\"error_type\":\"ExecutionError\",\"message\":\"envelope serialization failed: {err}\"}}"
            )
        })
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json)
            .map_err(|err| EngineError::validation(format!("malformed envelope: {err}")))
    }
}
