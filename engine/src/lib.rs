//! mailrlm: Recursive Language Model execution engine for email corpora.
//!
//! This crate runs analysis programs over a fixed corpus of messages, where
//! the programs issue nested LLM calls as first-class operations. Every call
//! routes through a shared session governor that enforces cost, call-count,
//! and depth budgets; repeated queries deduplicate through a time-bounded
//! content-addressed cache; and batches fan out through a bounded worker
//! pool with cancellation-safe semantics.

pub mod analyses;
pub mod backend;
pub mod cache;
pub mod config;
pub mod corpus;
pub mod envelope;
pub mod error;
pub mod governor;
pub mod helpers;
pub mod pipeline;
pub mod pool;
pub mod pricing;
pub mod runtime;
pub mod session;
pub mod transport;

pub use config::BackendConfig;
pub use config::BudgetConfig;
pub use config::CacheConfig;
pub use config::EngineConfig;
pub use config::PoolConfig;
pub use corpus::Corpus;
pub use corpus::CorpusMetadata;
pub use corpus::Email;
pub use envelope::ResultEnvelope;
pub use envelope::RunStatus;

// Error types
pub use error::BudgetExceededKind;
pub use error::EngineError;

// Budget enforcement
pub use governor::Admission;
pub use governor::Governor;
pub use governor::GovernorLimits;
pub use governor::SessionStats;

// Cache and pattern history
pub use cache::CacheEntry;
pub use cache::CacheNamespace;
pub use cache::CacheStats;
pub use cache::PatternHistory;
pub use cache::PatternObservation;
pub use cache::PatternStore;
pub use cache::PatternStoreStats;
pub use cache::QueryCache;
pub use cache::QueryKey;

// Transports and backend selection
pub use backend::select_backend;
pub use backend::BackendSelection;
pub use backend::LOCAL_PROBE_URLS;
pub use transport::Completion;
pub use transport::CompletionRequest;
pub use transport::LocalTransport;
pub use transport::ModelTransport;
pub use transport::RemoteTransport;

// Call pipeline and worker pool
pub use pipeline::QueryOptions;
pub use pool::BatchError;
pub use pool::BatchItem;
pub use pool::QueryMessage;

// Program runtime
pub use runtime::AnalysisProgram;
pub use runtime::FinalValue;
pub use runtime::ProgramEnv;
pub use runtime::RunOutcome;
pub use runtime::Runtime;
pub use session::Session;

// Cost tracking
pub use pricing::estimate_tokens;
pub use pricing::PricingTable;
pub use pricing::TokenPricing;
