//! Executes an analysis program against the corpus.
//!
//! A program is a typed callable run with an injected environment: the
//! corpus, the LLM entry points, and the `FINAL` / `FINAL_VAR` result
//! sinks. Programs are synchronous and run on a blocking thread; the
//! environment bridges into the async session the same way the session's
//! other callers do. Standard output is captured per run, and the first
//! `FINAL` wins.
//!
//! Run lifecycle: Init -> BackendReady (session construction) -> Running ->
//! Finalising (first FINAL or program completion) -> Terminal. A budget
//! breach fires the session cancellation; the program keeps running
//! non-LLM code and may still emit a partial FINAL within the grace
//! window, in which case the run succeeds.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tracing::debug;
use tracing::warn;

use crate::corpus::Corpus;
use crate::corpus::CorpusMetadata;
use crate::corpus::Email;
use crate::envelope::ResultEnvelope;
use crate::error::EngineError;
use crate::error::Result;
use crate::governor::SessionStats;
use crate::pipeline::QueryOptions;
use crate::pool::BatchItem;
use crate::pool::QueryMessage;
use crate::session::Session;

/// How long after a budget breach a still-running program may take to emit
/// its partial FINAL before the run is declared budget-terminated.
const DEFAULT_GRACE: Duration = Duration::from_secs(2);

/// A user-supplied analysis over the corpus.
///
/// Implemented by the pre-built analyses and by any closure of the right
/// shape; the environment carries every injected name.
pub trait AnalysisProgram: Send + Sync {
    fn run(&self, env: &ProgramEnv) -> Result<()>;
}

impl<F> AnalysisProgram for F
where
    F: Fn(&ProgramEnv) -> Result<()> + Send + Sync,
{
    fn run(&self, env: &ProgramEnv) -> Result<()> {
        self(env)
    }
}

/// The run's final value as set by `FINAL` / `FINAL_VAR`.
#[derive(Clone, Debug, PartialEq)]
pub enum FinalValue {
    /// Plain text from `FINAL`.
    Text(String),
    /// Named structured value from `FINAL_VAR`.
    Structured {
        name: String,
        value: serde_json::Value,
    },
}

/// The injected-names environment a program runs against.
pub struct ProgramEnv {
    corpus: Arc<Corpus>,
    session: Arc<Session>,
    handle: tokio::runtime::Handle,
    stdout: Mutex<String>,
    final_value: Mutex<Option<FinalValue>>,
    warnings: Mutex<Vec<String>>,
}

impl ProgramEnv {
    fn new(corpus: Arc<Corpus>, session: Arc<Session>, handle: tokio::runtime::Handle) -> Self {
        Self {
            corpus,
            session,
            handle,
            stdout: Mutex::new(String::new()),
            final_value: Mutex::new(None),
            warnings: Mutex::new(Vec::new()),
        }
    }

    /// The read-only, ordered corpus.
    pub fn emails(&self) -> &[Email] {
        &self.corpus.emails
    }

    pub fn metadata(&self) -> &CorpusMetadata {
        &self.corpus.metadata
    }

    /// One recursive LLM call through the session pipeline.
    pub fn llm_query(&self, prompt: &str, context: &str) -> Result<String> {
        self.handle.block_on(self.session.llm_query(prompt, context))
    }

    pub fn llm_query_with(
        &self,
        prompt: &str,
        context: &str,
        options: QueryOptions,
    ) -> Result<String> {
        self.handle
            .block_on(self.session.llm_query_with(prompt, context, options))
    }

    /// Ordered fan-out through the bounded worker pool.
    pub fn parallel_llm_query(
        &self,
        messages: &[QueryMessage],
        max_workers: Option<usize>,
    ) -> Vec<BatchItem> {
        self.handle
            .block_on(self.session.parallel_llm_query(messages, max_workers))
    }

    /// One prompt over many chunks, order-preserving.
    pub fn parallel_map<T, F>(
        &self,
        prompt: &str,
        chunks: &[T],
        context_fn: F,
        max_workers: Option<usize>,
    ) -> Vec<BatchItem>
    where
        F: Fn(&T) -> String,
    {
        self.handle
            .block_on(self.session.parallel_map(prompt, chunks, context_fn, max_workers))
    }

    /// Snapshot of the session counters.
    pub fn get_session(&self) -> SessionStats {
        self.session.stats()
    }

    /// Cross-run history of observed alert patterns, when disk state is
    /// enabled for this run.
    pub fn pattern_store(&self) -> Option<&crate::cache::PatternStore> {
        self.session.pattern_store()
    }

    /// Whether the session budget has already cancelled further LLM work.
    pub fn is_cancelled(&self) -> bool {
        self.session.governor().is_cancelled()
    }

    /// Captured program output; one line per call.
    pub fn print(&self, line: impl AsRef<str>) {
        let mut stdout = self.stdout.lock().expect("stdout buffer poisoned");
        stdout.push_str(line.as_ref());
        stdout.push('\n');
    }

    /// Set the run's final textual result. Only the first call takes effect.
    pub fn finalize(&self, result: impl Into<String>) {
        let mut guard = self.final_value.lock().expect("final value poisoned");
        if guard.is_none() {
            debug!("run finalising with text result");
            *guard = Some(FinalValue::Text(result.into()));
        }
    }

    /// Set a named variable as the run's structured result.
    ///
    /// The value must serialise to JSON; a value that does not is reported
    /// in place of the result, matching `FINAL`'s first-call-wins rule.
    pub fn finalize_var<T: Serialize>(&self, name: &str, value: &T) {
        let mut guard = self.final_value.lock().expect("final value poisoned");
        if guard.is_some() {
            return;
        }
        debug!(name, "run finalising with structured result");
        *guard = Some(match serde_json::to_value(value) {
            Ok(value) => FinalValue::Structured {
                name: name.to_string(),
                value,
            },
            Err(err) => FinalValue::Text(format!(
                "[Error: variable '{name}' could not be serialised: {err}]"
            )),
        });
    }

    /// Record a run-level warning for the envelope.
    pub fn warn(&self, message: impl Into<String>) {
        self.warnings
            .lock()
            .expect("warnings poisoned")
            .push(message.into());
    }

    fn final_is_set(&self) -> bool {
        self.final_value
            .lock()
            .expect("final value poisoned")
            .is_some()
    }

    fn take_final(&self) -> Option<FinalValue> {
        self.final_value
            .lock()
            .expect("final value poisoned")
            .take()
    }

    fn take_stdout(&self) -> String {
        std::mem::take(&mut self.stdout.lock().expect("stdout buffer poisoned"))
    }

    fn take_warnings(&self) -> Vec<String> {
        std::mem::take(&mut self.warnings.lock().expect("warnings poisoned"))
    }
}

/// The outcome of one engine run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub envelope: ResultEnvelope,
    pub exit_code: i32,
}

/// Drives one program to a terminal envelope.
pub struct Runtime {
    session: Arc<Session>,
    corpus: Arc<Corpus>,
    grace: Duration,
}

impl Runtime {
    pub fn new(session: Arc<Session>, corpus: Arc<Corpus>) -> Self {
        Self {
            session,
            corpus,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Run the program to completion and build the result envelope.
    pub async fn execute(&self, program: Arc<dyn AnalysisProgram>) -> RunOutcome {
        let env = Arc::new(ProgramEnv::new(
            Arc::clone(&self.corpus),
            Arc::clone(&self.session),
            tokio::runtime::Handle::current(),
        ));
        debug!(emails = self.corpus.len(), "run entering Running state");

        let worker_env = Arc::clone(&env);
        let join = tokio::task::spawn_blocking(move || program.run(&worker_env));

        let cancel = self.session.cancellation();
        let grace = self.grace;
        let program_result: Option<Result<()>> = tokio::select! {
            joined = join => Some(match joined {
                Ok(result) => result,
                Err(join_err) => Err(EngineError::execution(panic_message(join_err))),
            }),
            () = async {
                cancel.cancelled().await;
                tokio::time::sleep(grace).await;
            } => None,
        };

        self.build_outcome(&env, program_result)
    }

    fn build_outcome(&self, env: &ProgramEnv, program_result: Option<Result<()>>) -> RunOutcome {
        let stdout = env.take_stdout();
        let mut warnings = env.take_warnings();
        warnings.extend(self.session.warnings());
        let stats = self.session.stats();

        let error = match program_result {
            // Program still running past the grace window after a breach:
            // honor a partial FINAL, otherwise the breach is terminal.
            None => {
                warn!("program still running after budget breach grace window");
                if env.final_is_set() {
                    None
                } else {
                    Some(self.breach_error())
                }
            }
            Some(Err(err)) => match err {
                // A budget refusal the program let bubble up is terminal
                // only when no partial FINAL was recorded first.
                EngineError::BudgetExceeded { .. } | EngineError::Cancelled
                    if env.final_is_set() =>
                {
                    warnings.push(format!("program stopped early: {err}"));
                    None
                }
                other => Some(other),
            },
            Some(Ok(())) => {
                if !env.final_is_set() && self.session.governor().is_cancelled() {
                    Some(self.breach_error())
                } else {
                    None
                }
            }
        };

        let envelope = match error {
            Some(err) => {
                debug!(error_type = err.error_type(), "run entering Terminal state");
                let exit_code = err.exit_code();
                return RunOutcome {
                    envelope: ResultEnvelope::error(&err, stdout, stats).with_warnings(warnings),
                    exit_code,
                };
            }
            None => {
                debug!("run entering Finalising state");
                let result = match env.take_final() {
                    Some(FinalValue::Text(text)) => serde_json::Value::String(text),
                    Some(FinalValue::Structured { value, .. }) => value,
                    None => {
                        warnings.push(
                            "program completed without calling FINAL; result is empty".to_string(),
                        );
                        serde_json::Value::String(String::new())
                    }
                };
                ResultEnvelope::success(result, stdout, stats).with_warnings(warnings)
            }
        };

        RunOutcome {
            envelope,
            exit_code: 0,
        }
    }

    fn breach_error(&self) -> EngineError {
        self.session
            .governor()
            .exceeded_error()
            .unwrap_or(EngineError::Cancelled)
    }
}

fn panic_message(join_err: tokio::task::JoinError) -> String {
    if join_err.is_panic() {
        match join_err.try_into_panic() {
            Ok(payload) => {
                if let Some(message) = payload.downcast_ref::<&str>() {
                    format!("program panicked: {message}")
                } else if let Some(message) = payload.downcast_ref::<String>() {
                    format!("program panicked: {message}")
                } else {
                    "program panicked".to_string()
                }
            }
            Err(err) => format!("program task failed: {err}"),
        }
    } else {
        "program task was cancelled".to_string()
    }
}
