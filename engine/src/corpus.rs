//! The immutable email corpus a program analyses.
//!
//! Emails arrive from an external corpus loader as JSON. The engine never
//! mutates them and preserves their ordering; unknown fields round-trip
//! untouched so programs can expose loader-specific data.

use std::path::Path;

use serde::Deserialize;
use serde::Serialize;

use crate::error::EngineError;
use crate::error::Result;

/// A single message record as supplied by the corpus loader.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Email {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "threadId")]
    pub thread_id: String,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub to: String,
    /// RFC-2822 or ISO-8601 date string, verbatim from the loader.
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub snippet: String,
    #[serde(default)]
    pub body: String,
    /// Loader-specific fields preserved for round-tripping.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Metadata describing how the corpus was produced.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorpusMetadata {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub count: usize,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub source: String,
}

/// Ordered, immutable sequence of emails plus its metadata.
///
/// Lifetime is one engine run.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Corpus {
    pub emails: Vec<Email>,
    pub metadata: CorpusMetadata,
}

/// Accepts both the loader contract `{messages, metadata}` and the
/// bulk-read file shape `{status, messages, query, result_count, ...}`.
#[derive(Deserialize)]
struct CorpusFile {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    messages: Vec<Email>,
    #[serde(default)]
    metadata: Option<CorpusMetadata>,
    #[serde(default)]
    query: Option<String>,
    #[serde(default)]
    result_count: Option<usize>,
}

impl Corpus {
    pub fn new(emails: Vec<Email>, metadata: CorpusMetadata) -> Self {
        Self { emails, metadata }
    }

    /// Parse a corpus from the loader's JSON payload.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let file: CorpusFile = serde_json::from_str(json)
            .map_err(|err| EngineError::validation(format!("malformed corpus: {err}")))?;

        if let Some(status) = &file.status {
            if status != "success" {
                return Err(EngineError::validation(format!(
                    "corpus file reports status={status}"
                )));
            }
        }

        let count = file.result_count.unwrap_or(file.messages.len());
        let mut metadata = file.metadata.unwrap_or_default();
        if metadata.count == 0 {
            metadata.count = count;
        }
        if metadata.query.is_empty() {
            metadata.query = file.query.unwrap_or_else(|| "loaded_from_file".to_string());
        }

        Ok(Self {
            emails: file.messages,
            metadata,
        })
    }

    /// Load a corpus from a JSON file on disk.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path).map_err(|err| {
            EngineError::validation(format!("cannot read corpus file {}: {err}", path.display()))
        })?;
        let mut corpus = Self::from_json_str(&json)?;
        if corpus.metadata.source.is_empty() {
            corpus.metadata.source = path.display().to_string();
        }
        Ok(corpus)
    }

    pub fn len(&self) -> usize {
        self.emails.len()
    }

    pub fn is_empty(&self) -> bool {
        self.emails.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn email_json() -> &'static str {
        r#"{
            "messages": [
                {"id": "m1", "threadId": "t1", "subject": "hello",
                 "from": "Alice <a@x.com>", "to": "b@x.com",
                 "date": "Wed, 15 Jan 2026 10:30:00 -0800",
                 "snippet": "hi there", "body": "hi there, full text",
                 "labels": ["INBOX", "UNREAD"]}
            ],
            "metadata": {"query": "is:unread", "count": 1, "format": "metadata", "source": "imap"}
        }"#
    }

    #[test]
    fn parses_loader_contract() {
        let corpus = Corpus::from_json_str(email_json()).unwrap();
        assert_eq!(corpus.len(), 1);
        assert_eq!(corpus.metadata.query, "is:unread");
        assert_eq!(corpus.emails[0].thread_id, "t1");
        assert_eq!(corpus.emails[0].from, "Alice <a@x.com>");
    }

    #[test]
    fn preserves_unknown_fields_on_round_trip() {
        let corpus = Corpus::from_json_str(email_json()).unwrap();
        let labels = corpus.emails[0].extra.get("labels").unwrap();
        assert_eq!(labels, &serde_json::json!(["INBOX", "UNREAD"]));

        let serialized = serde_json::to_string(&corpus.emails[0]).unwrap();
        let reparsed: Email = serde_json::from_str(&serialized).unwrap();
        assert_eq!(reparsed, corpus.emails[0]);
    }

    #[test]
    fn parses_bulk_read_shape() {
        let json = r#"{
            "status": "success",
            "query": "newer_than:7d",
            "result_count": 2,
            "messages": [
                {"id": "m1", "snippet": "a"},
                {"id": "m2", "snippet": "b"}
            ]
        }"#;
        let corpus = Corpus::from_json_str(json).unwrap();
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.metadata.query, "newer_than:7d");
        assert_eq!(corpus.metadata.count, 2);
    }

    #[test]
    fn rejects_failed_bulk_read() {
        let json = r#"{"status": "error", "messages": []}"#;
        let err = Corpus::from_json_str(json).unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
    }

    #[test]
    fn rejects_malformed_json() {
        let err = Corpus::from_json_str("{not json").unwrap_err();
        assert_eq!(err.error_type(), "ValidationError");
    }

    #[test]
    fn empty_corpus_is_valid() {
        let corpus = Corpus::from_json_str(r#"{"messages": []}"#).unwrap();
        assert!(corpus.is_empty());
        assert_eq!(corpus.metadata.count, 0);
    }
}
