//! Session governor: the single source of truth for budget enforcement.
//!
//! Every LLM call must pass through `reserve` / `account`. The depth counter
//! is incremented *before* the limit checks inside `reserve` so that N
//! concurrent workers cannot all observe `depth < max` and then all enter;
//! a refused reservation decrements it back. Once any limit trips, the
//! shared cancellation token fires and no further reservation is granted,
//! while in-flight calls still run to completion and are accounted.

use std::collections::BTreeSet;
use std::sync::Mutex;

use serde::Deserialize;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::config::BudgetConfig;
use crate::error::BudgetExceededKind;
use crate::error::EngineError;
use crate::error::Result;
use crate::pricing::micros_to_usd;
use crate::pricing::usd_to_micros;
use crate::pricing::PricingTable;

/// Budget limits resolved to integral units.
#[derive(Clone, Copy, Debug)]
pub struct GovernorLimits {
    /// Maximum spend in micro-dollars.
    pub max_cost_micros: u64,
    /// Maximum accounted LLM calls.
    pub max_calls: u64,
    /// Maximum concurrent reservation depth.
    pub max_depth: u64,
}

impl From<&BudgetConfig> for GovernorLimits {
    fn from(budget: &BudgetConfig) -> Self {
        Self {
            max_cost_micros: usd_to_micros(budget.max_budget_usd),
            max_calls: budget.max_calls,
            max_depth: budget.max_depth,
        }
    }
}

/// Proof of a successful reservation.
///
/// Must be surrendered to `account` exactly once, including with zero token
/// counts when the transport failed, so a stuck worker cannot pin depth.
#[must_use = "every reservation must be surrendered via Governor::account"]
#[derive(Debug)]
pub struct Admission {
    estimated_tokens: u64,
}

impl Admission {
    pub fn estimated_tokens(&self) -> u64 {
        self.estimated_tokens
    }
}

#[derive(Debug, Default)]
struct GovernorState {
    tokens_in: u64,
    tokens_out: u64,
    cost_micros: u64,
    call_count: u64,
    cache_hits: u64,
    depth: u64,
    unpriced_models: BTreeSet<String>,
}

/// Atomic read of the session counters.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub total_tokens_in: u64,
    pub total_tokens_out: u64,
    pub total_cost_usd: f64,
    pub call_count: u64,
    pub cache_hits: u64,
}

/// Process-scoped budget gate shared by every caller in a run.
#[derive(Debug)]
pub struct Governor {
    limits: GovernorLimits,
    pricing: PricingTable,
    state: Mutex<GovernorState>,
    cancel: CancellationToken,
}

impl Governor {
    pub fn new(limits: GovernorLimits, pricing: PricingTable) -> Self {
        Self {
            limits,
            pricing,
            state: Mutex::new(GovernorState::default()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn limits(&self) -> GovernorLimits {
        self.limits
    }

    /// Admit one call, or refuse with the specific exceeded limit.
    ///
    /// Depth is bumped first and rolled back on refusal; the bump is what
    /// bounds total concurrency across nested fan-outs. The cost gate also
    /// projects the estimated tokens at the model's rates, so a call that
    /// would clearly overshoot the budget is refused before it starts.
    /// Unpriced models project zero and pass trivially.
    pub fn reserve(&self, estimated_tokens: u64, model: &str) -> Result<Admission> {
        let projected_micros = self
            .pricing
            .cost_micros(model, estimated_tokens, estimated_tokens)
            .unwrap_or(0);

        let mut state = self.state.lock().expect("governor state poisoned");
        state.depth += 1;

        let cost_refused = state.cost_micros >= self.limits.max_cost_micros
            || state.cost_micros.saturating_add(projected_micros) > self.limits.max_cost_micros;
        let refused = if cost_refused {
            Some(EngineError::BudgetExceeded {
                kind: BudgetExceededKind::Cost,
                limit: self.limits.max_cost_micros,
                spent: state.cost_micros,
            })
        } else if state.call_count >= self.limits.max_calls {
            Some(EngineError::BudgetExceeded {
                kind: BudgetExceededKind::Calls,
                limit: self.limits.max_calls,
                spent: state.call_count,
            })
        } else if state.depth > self.limits.max_depth {
            Some(EngineError::BudgetExceeded {
                kind: BudgetExceededKind::Depth,
                limit: self.limits.max_depth,
                spent: state.depth,
            })
        } else {
            None
        };

        if let Some(err) = refused {
            state.depth -= 1;
            return Err(err);
        }
        Ok(Admission { estimated_tokens })
    }

    /// Settle an admission with the observed usage.
    ///
    /// Applied even for failed transport calls (with zeros). Fires the
    /// cancellation token when the settled totals cross a limit.
    pub fn account(&self, admission: Admission, tokens_in: u64, tokens_out: u64, model: &str) {
        let _ = admission;
        let delta_micros = match self.pricing.cost_micros(model, tokens_in, tokens_out) {
            Some(delta) => delta,
            None => {
                warn!(model, "no pricing for model; accounting zero cost");
                let mut state = self.state.lock().expect("governor state poisoned");
                state.unpriced_models.insert(model.to_string());
                0
            }
        };

        let exceeded = {
            let mut state = self.state.lock().expect("governor state poisoned");
            state.tokens_in = state.tokens_in.saturating_add(tokens_in);
            state.tokens_out = state.tokens_out.saturating_add(tokens_out);
            state.cost_micros = state.cost_micros.saturating_add(delta_micros);
            state.call_count += 1;
            state.depth = state.depth.saturating_sub(1);
            state.cost_micros >= self.limits.max_cost_micros
                || state.call_count >= self.limits.max_calls
        };

        if exceeded {
            self.cancel.cancel();
        }
    }

    /// The limit that tripped, if the settled totals have crossed one.
    pub fn exceeded_error(&self) -> Option<EngineError> {
        let state = self.state.lock().expect("governor state poisoned");
        if state.cost_micros >= self.limits.max_cost_micros {
            Some(EngineError::BudgetExceeded {
                kind: BudgetExceededKind::Cost,
                limit: self.limits.max_cost_micros,
                spent: state.cost_micros,
            })
        } else if state.call_count >= self.limits.max_calls {
            Some(EngineError::BudgetExceeded {
                kind: BudgetExceededKind::Calls,
                limit: self.limits.max_calls,
                spent: state.call_count,
            })
        } else {
            None
        }
    }

    /// Tally a cache hit; free and not counted as a call.
    pub fn record_cache_hit(&self) {
        let mut state = self.state.lock().expect("governor state poisoned");
        state.cache_hits += 1;
    }

    pub fn snapshot(&self) -> SessionStats {
        let state = self.state.lock().expect("governor state poisoned");
        SessionStats {
            total_tokens_in: state.tokens_in,
            total_tokens_out: state.tokens_out,
            total_cost_usd: micros_to_usd(state.cost_micros),
            call_count: state.call_count,
            cache_hits: state.cache_hits,
        }
    }

    /// Live reservation depth; mainly for tests and diagnostics.
    pub fn depth(&self) -> u64 {
        self.state.lock().expect("governor state poisoned").depth
    }

    /// Models seen without a pricing entry; reported as envelope warnings.
    pub fn unpriced_models(&self) -> Vec<String> {
        let state = self.state.lock().expect("governor state poisoned");
        state.unpriced_models.iter().cloned().collect()
    }

    /// The shared cancellation signal for this session.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pricing::TokenPricing;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;
    use std::thread;

    fn limits(max_cost_micros: u64, max_calls: u64, max_depth: u64) -> GovernorLimits {
        GovernorLimits {
            max_cost_micros,
            max_calls,
            max_depth,
        }
    }

    /// One micro-dollar per token, both directions.
    fn flat_pricing() -> PricingTable {
        let mut table = PricingTable::empty();
        table.set("flat", TokenPricing::new(1_000_000, 1_000_000));
        table
    }

    #[test]
    fn reserve_then_account_balances_depth() {
        let governor = Governor::new(limits(1_000_000, 10, 4), flat_pricing());
        let admission = governor.reserve(100, "flat").unwrap();
        assert_eq!(governor.depth(), 1);
        governor.account(admission, 100, 50, "flat");
        assert_eq!(governor.depth(), 0);

        let stats = governor.snapshot();
        assert_eq!(stats.total_tokens_in, 100);
        assert_eq!(stats.total_tokens_out, 50);
        assert_eq!(stats.call_count, 1);
        assert!((stats.total_cost_usd - 0.000150).abs() < 1e-9);
    }

    #[test]
    fn depth_limit_refuses_and_rolls_back() {
        let governor = Governor::new(limits(1_000_000, 100, 2), flat_pricing());
        let first = governor.reserve(1, "flat").unwrap();
        let second = governor.reserve(1, "flat").unwrap();
        let err = governor.reserve(1, "flat").unwrap_err();
        match err {
            EngineError::BudgetExceeded { kind, .. } => {
                assert_eq!(kind, BudgetExceededKind::Depth)
            }
            other => panic!("unexpected error: {other}"),
        }
        // The refused reservation must not leak depth.
        assert_eq!(governor.depth(), 2);
        governor.account(first, 0, 0, "flat");
        governor.account(second, 0, 0, "flat");
        assert_eq!(governor.depth(), 0);
    }

    #[test]
    fn call_limit_gates_reservations_and_cancels() {
        let governor = Governor::new(limits(1_000_000, 2, 8), flat_pricing());
        for _ in 0..2 {
            let admission = governor.reserve(1, "flat").unwrap();
            governor.account(admission, 1, 1, "flat");
        }
        assert!(governor.is_cancelled());
        let err = governor.reserve(1, "flat").unwrap_err();
        match err {
            EngineError::BudgetExceeded { kind, .. } => {
                assert_eq!(kind, BudgetExceededKind::Calls)
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn exact_budget_spend_blocks_next_reserve() {
        // 2000 tokens at 1 micro/token lands exactly on a 2000-micro budget.
        let governor = Governor::new(limits(2_000, 10, 8), flat_pricing());
        let admission = governor.reserve(1, "flat").unwrap();
        governor.account(admission, 1_000, 1_000, "flat");
        assert!(governor.is_cancelled());
        let err = governor.reserve(1, "flat").unwrap_err();
        match err {
            EngineError::BudgetExceeded { kind, .. } => assert_eq!(kind, BudgetExceededKind::Cost),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn failed_transport_still_accounts_with_zeros() {
        let governor = Governor::new(limits(1_000_000, 10, 2), flat_pricing());
        let admission = governor.reserve(50, "flat").unwrap();
        governor.account(admission, 0, 0, "flat");
        assert_eq!(governor.depth(), 0);
        let stats = governor.snapshot();
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.total_cost_usd, 0.0);
    }

    #[test]
    fn unknown_model_costs_zero_and_is_reported() {
        let governor = Governor::new(limits(1_000, 10, 8), PricingTable::empty());
        let admission = governor.reserve(1, "flat").unwrap();
        governor.account(admission, 10_000, 10_000, "mystery-model");
        let stats = governor.snapshot();
        assert_eq!(stats.total_cost_usd, 0.0);
        assert_eq!(governor.unpriced_models(), vec!["mystery-model".to_string()]);
        // Zero cost means budget checks pass trivially.
        let admission = governor.reserve(1, "flat").unwrap();
        governor.account(admission, 0, 0, "mystery-model");
    }

    #[test]
    fn cache_hits_tally_separately() {
        let governor = Governor::new(limits(1_000, 10, 8), flat_pricing());
        governor.record_cache_hit();
        governor.record_cache_hit();
        let stats = governor.snapshot();
        assert_eq!(stats.cache_hits, 2);
        assert_eq!(stats.call_count, 0);
    }

    #[test]
    fn depth_never_negative_under_interleaving() {
        let governor = Arc::new(Governor::new(limits(u64::MAX, u64::MAX, 6), flat_pricing()));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let governor = Arc::clone(&governor);
                thread::spawn(move || {
                    for _ in 0..200 {
                        if let Ok(admission) = governor.reserve(10, "flat") {
                            governor.account(admission, 10, 10, "flat");
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Quiescence: every successful reserve was paired with one account.
        assert_eq!(governor.depth(), 0);
    }

    #[test]
    fn concurrent_reservations_respect_depth_bound() {
        let governor = Arc::new(Governor::new(limits(u64::MAX, u64::MAX, 3), flat_pricing()));
        let admitted = Arc::new(AtomicU64::new(0));

        // 10 threads race for 3 slots; no account calls until all have raced.
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let governor = Arc::clone(&governor);
                let admitted = Arc::clone(&admitted);
                thread::spawn(move || governor.reserve(1, "flat").ok().inspect(|_| {
                    admitted.fetch_add(1, Ordering::SeqCst);
                }))
            })
            .collect();
        let admissions: Vec<_> = handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .collect();

        assert_eq!(admitted.load(Ordering::SeqCst), 3);
        assert_eq!(governor.depth(), 3);
        for admission in admissions {
            governor.account(admission, 0, 0, "flat");
        }
        assert_eq!(governor.depth(), 0);
    }

    #[test]
    fn totals_match_sum_of_deltas() {
        let governor = Arc::new(Governor::new(limits(u64::MAX, u64::MAX, 64), flat_pricing()));
        let handles: Vec<_> = (0..10)
            .map(|i| {
                let governor = Arc::clone(&governor);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let admission = governor.reserve(i, "flat").unwrap();
                        governor.account(admission, 7, 3, "flat");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let stats = governor.snapshot();
        assert_eq!(stats.call_count, 200);
        assert_eq!(stats.total_tokens_in, 1400);
        assert_eq!(stats.total_tokens_out, 600);
        // 200 calls x 10 tokens x 1 micro = 2000 micros.
        assert!((stats.total_cost_usd - 0.002).abs() < 1e-9);
    }
}
