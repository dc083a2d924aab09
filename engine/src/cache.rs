//! Time-bounded, disk-backed cache for LLM query results.
//!
//! Keys are content hashes over `(model, prompt, context, json_output)`,
//! stable across process restarts and platforms. Entries live one JSON file
//! per key under a process-wide root; writes go to a temp file and rename
//! into place so readers never observe a torn entry. Expired or corrupt
//! files are unlinked on read. A segregated namespace holds security
//! patterns with a longer TTL, and a pattern store keeps a retention-bounded
//! history of observed alert signatures across runs.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;
use tracing::debug;
use tracing::warn;

use crate::config::CacheConfig;
use crate::error::EngineError;
use crate::error::Result;

/// Field separator inside the hashed key material.
const KEY_SEPARATOR: u8 = 0x1f;

/// Content hash identifying one LLM request.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryKey(String);

impl QueryKey {
    /// Deterministic SHA-256 over `model 0x1F prompt 0x1F context 0x1F flag`.
    pub fn compute(model: &str, prompt: &str, context: &str, json_output: bool) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(model.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(prompt.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(context.as_bytes());
        hasher.update([KEY_SEPARATOR]);
        hasher.update(if json_output { b"1" } else { b"0" });
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for QueryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which TTL regime an entry belongs to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheNamespace {
    /// General query results, 24h TTL by default.
    General,
    /// Security-pattern results, 7d TTL by default.
    Security,
}

/// A cached LLM response with enough metadata to be self-describing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: QueryKey,
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub model: String,
    pub tokens_in: u64,
    pub tokens_out: u64,
}

/// Hit/miss accounting for observability.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub tokens_saved: u64,
}

/// Disk-backed query cache rooted at a single directory.
#[derive(Debug)]
pub struct QueryCache {
    root: PathBuf,
    ttl: Duration,
    security_ttl: Duration,
    stats: Mutex<CacheStats>,
}

impl QueryCache {
    /// Open (creating if needed) the cache under the configured root.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mailrlm-cache"));
        std::fs::create_dir_all(&root).map_err(|err| {
            EngineError::cache(format!("cannot create cache root {}: {err}", root.display()))
        })?;
        Ok(Self {
            root,
            ttl: config.ttl,
            security_ttl: config.security_ttl,
            stats: Mutex::new(CacheStats::default()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn ttl_for(&self, namespace: CacheNamespace) -> Duration {
        match namespace {
            CacheNamespace::General => self.ttl,
            CacheNamespace::Security => self.security_ttl,
        }
    }

    fn entry_path(&self, key: &QueryKey, namespace: CacheNamespace) -> PathBuf {
        match namespace {
            CacheNamespace::General => self.root.join(format!("{key}.json")),
            CacheNamespace::Security => self.root.join(format!("sec_{key}.json")),
        }
    }

    fn is_fresh(&self, entry: &CacheEntry, namespace: CacheNamespace) -> bool {
        let ttl = match chrono::Duration::from_std(self.ttl_for(namespace)) {
            Ok(ttl) => ttl,
            Err(_) => return true,
        };
        Utc::now() - entry.created_at < ttl
    }

    /// Return the entry iff present and fresh. IO or decode failures are
    /// logged and treated as misses; stale and corrupt files are removed.
    pub fn get(&self, key: &QueryKey, namespace: CacheNamespace) -> Option<CacheEntry> {
        let path = self.entry_path(key, namespace);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.record_miss();
                return None;
            }
            Err(err) => {
                warn!(path = %path.display(), %err, "cache read failed; treating as miss");
                self.record_miss();
                return None;
            }
        };

        let entry: CacheEntry = match serde_json::from_str(&raw) {
            Ok(entry) => entry,
            Err(err) => {
                debug!(path = %path.display(), %err, "removing corrupt cache entry");
                let _ = std::fs::remove_file(&path);
                self.record_miss();
                return None;
            }
        };

        if !self.is_fresh(&entry, namespace) {
            let _ = std::fs::remove_file(&path);
            self.record_miss();
            return None;
        }

        let mut stats = self.stats.lock().expect("cache stats poisoned");
        stats.hits += 1;
        stats.tokens_saved += entry.tokens_in + entry.tokens_out;
        Some(entry)
    }

    /// Write an entry atomically; a prior entry at the same key is replaced.
    pub fn put(
        &self,
        key: &QueryKey,
        namespace: CacheNamespace,
        response: &str,
        model: &str,
        tokens_in: u64,
        tokens_out: u64,
    ) -> Result<()> {
        let entry = CacheEntry {
            key: key.clone(),
            response: response.to_string(),
            created_at: Utc::now(),
            model: model.to_string(),
            tokens_in,
            tokens_out,
        };
        let json = serde_json::to_string_pretty(&entry)
            .map_err(|err| EngineError::cache(format!("cannot encode cache entry: {err}")))?;

        let path = self.entry_path(key, namespace);
        let tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|err| EngineError::cache(format!("cannot create cache temp file: {err}")))?;
        std::fs::write(tmp.path(), json)
            .map_err(|err| EngineError::cache(format!("cannot write cache entry: {err}")))?;
        tmp.persist(&path)
            .map_err(|err| EngineError::cache(format!("cannot persist cache entry: {err}")))?;
        Ok(())
    }

    fn record_miss(&self) {
        self.stats.lock().expect("cache stats poisoned").misses += 1;
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().expect("cache stats poisoned").clone()
    }

    /// Remove every expired entry under the root. Returns entries removed.
    pub fn sweep_expired(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            let namespace = if path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("sec_"))
            {
                CacheNamespace::Security
            } else {
                CacheNamespace::General
            };
            let stale = match std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<CacheEntry>(&raw).ok())
            {
                Some(entry) => !self.is_fresh(&entry, namespace),
                None => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        removed
    }

    /// Remove every entry. Returns entries removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json")
                && std::fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}

/// One sighting of an alert pattern.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternObservation {
    pub timestamp: DateTime<Utc>,
    /// Caller-supplied detail (window key, alert count, severity, ...).
    pub context: serde_json::Value,
}

/// Everything recorded for one pattern signature.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PatternHistory {
    pub signature: String,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub observation_count: usize,
    pub observations: Vec<PatternObservation>,
}

/// Aggregate view of the store.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternStoreStats {
    pub unique_patterns: usize,
    pub total_observations: usize,
}

/// Persistent history of observed alert patterns across runs.
///
/// One file per signature under `patterns/` inside the cache root.
/// Observations older than the retention window are pruned on write, so a
/// signature seen repeatedly within the window reads back as a recurring
/// pattern while stale history ages out. Files are rewritten with the same
/// temp-and-rename discipline as cache entries.
#[derive(Debug)]
pub struct PatternStore {
    root: PathBuf,
    retention: Duration,
}

/// Word-level Jaccard similarity between two signatures.
fn signature_similarity(a: &str, b: &str) -> f64 {
    let words_a: std::collections::BTreeSet<&str> = a.split_whitespace().collect();
    let words_b: std::collections::BTreeSet<&str> = b.split_whitespace().collect();
    if words_a.is_empty() || words_b.is_empty() {
        return 0.0;
    }
    let intersection = words_a.intersection(&words_b).count();
    let union = words_a.union(&words_b).count();
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

impl PatternStore {
    /// Open (creating if needed) the store under the configured cache root.
    pub fn open(config: &CacheConfig) -> Result<Self> {
        let root = config
            .root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("mailrlm-cache"))
            .join("patterns");
        std::fs::create_dir_all(&root).map_err(|err| {
            EngineError::cache(format!(
                "cannot create pattern store {}: {err}",
                root.display()
            ))
        })?;
        Ok(Self {
            root,
            retention: config.pattern_retention,
        })
    }

    fn pattern_path(&self, signature: &str) -> PathBuf {
        let digest = format!("{:x}", Sha256::digest(signature.as_bytes()));
        self.root.join(format!("pat_{}.json", &digest[..16]))
    }

    /// Record a sighting and return the signature's pruned history.
    pub fn record(&self, signature: &str, context: serde_json::Value) -> Result<PatternHistory> {
        let path = self.pattern_path(signature);
        let mut observations = std::fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<PatternHistory>(&raw).ok())
            .map(|history| history.observations)
            .unwrap_or_default();

        observations.push(PatternObservation {
            timestamp: Utc::now(),
            context,
        });
        if let Ok(retention) = chrono::Duration::from_std(self.retention) {
            let cutoff = Utc::now() - retention;
            observations.retain(|observation| observation.timestamp > cutoff);
        }

        let history = PatternHistory {
            signature: signature.to_string(),
            first_seen: observations.first().map(|observation| observation.timestamp),
            last_seen: observations.last().map(|observation| observation.timestamp),
            observation_count: observations.len(),
            observations,
        };

        let json = serde_json::to_string_pretty(&history)
            .map_err(|err| EngineError::cache(format!("cannot encode pattern history: {err}")))?;
        let tmp = tempfile::NamedTempFile::new_in(&self.root)
            .map_err(|err| EngineError::cache(format!("cannot create pattern temp file: {err}")))?;
        std::fs::write(tmp.path(), json)
            .map_err(|err| EngineError::cache(format!("cannot write pattern history: {err}")))?;
        tmp.persist(&path)
            .map_err(|err| EngineError::cache(format!("cannot persist pattern history: {err}")))?;
        Ok(history)
    }

    /// The stored history for a signature, if any. Corrupt files are
    /// removed and read as absent.
    pub fn history(&self, signature: &str) -> Option<PatternHistory> {
        let path = self.pattern_path(signature);
        let raw = std::fs::read_to_string(&path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(history) => Some(history),
            Err(err) => {
                debug!(path = %path.display(), %err, "removing corrupt pattern history");
                let _ = std::fs::remove_file(&path);
                None
            }
        }
    }

    /// Stored patterns whose signatures resemble this one, most similar
    /// first. The signature's own history is not included.
    pub fn find_similar(&self, signature: &str, min_similarity: f64) -> Vec<PatternHistory> {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return Vec::new();
        };
        let mut scored = Vec::new();
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            let is_pattern = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("pat_") && name.ends_with(".json"));
            if !is_pattern {
                continue;
            }
            let Some(history) = std::fs::read_to_string(&path)
                .ok()
                .and_then(|raw| serde_json::from_str::<PatternHistory>(&raw).ok())
            else {
                continue;
            };
            if history.signature == signature {
                continue;
            }
            let similarity = signature_similarity(&history.signature, signature);
            if similarity >= min_similarity {
                scored.push((similarity, history));
            }
        }
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));
        scored.into_iter().map(|(_, history)| history).collect()
    }

    pub fn stats(&self) -> PatternStoreStats {
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return PatternStoreStats::default();
        };
        let mut stats = PatternStoreStats::default();
        for dir_entry in entries.flatten() {
            let Some(history) = std::fs::read_to_string(dir_entry.path())
                .ok()
                .and_then(|raw| serde_json::from_str::<PatternHistory>(&raw).ok())
            else {
                continue;
            };
            stats.unique_patterns += 1;
            stats.total_observations += history.observation_count;
        }
        stats
    }

    /// Remove every stored pattern. Returns files removed.
    pub fn clear(&self) -> usize {
        let mut removed = 0;
        let Ok(entries) = std::fs::read_dir(&self.root) else {
            return 0;
        };
        for dir_entry in entries.flatten() {
            let path = dir_entry.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json")
                && std::fs::remove_file(&path).is_ok()
            {
                removed += 1;
            }
        }
        removed
    }
}
