//! Per-model token pricing used by the session governor.
//!
//! Costs are tracked in micro-dollars (1e-6 USD) per 1M tokens so that the
//! governor's counters stay integral and monotonic under concurrency.

use std::collections::HashMap;

use serde::Deserialize;
use serde::Serialize;

/// Cost per million tokens in micro-dollars.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct TokenPricing {
    /// Cost per 1M input tokens.
    pub input_per_m: u64,
    /// Cost per 1M output tokens.
    pub output_per_m: u64,
}

impl TokenPricing {
    pub fn new(input_per_m: u64, output_per_m: u64) -> Self {
        Self {
            input_per_m,
            output_per_m,
        }
    }

    /// Cost of a call in micro-dollars.
    pub fn cost_micros(&self, tokens_in: u64, tokens_out: u64) -> u64 {
        let input_cost = (tokens_in * self.input_per_m) / 1_000_000;
        let output_cost = (tokens_out * self.output_per_m) / 1_000_000;
        input_cost + output_cost
    }
}

/// Known model pricing (micro-dollars per 1M tokens).
fn default_pricing() -> HashMap<String, TokenPricing> {
    let mut pricing = HashMap::new();

    pricing.insert(
        "claude-3-opus".to_string(),
        TokenPricing::new(15_000_000, 75_000_000),
    );
    pricing.insert(
        "claude-3-5-sonnet".to_string(),
        TokenPricing::new(3_000_000, 15_000_000),
    );
    pricing.insert(
        "claude-3-haiku".to_string(),
        TokenPricing::new(250_000, 1_250_000),
    );
    pricing.insert(
        "gpt-4o".to_string(),
        TokenPricing::new(5_000_000, 15_000_000),
    );
    pricing.insert(
        "gpt-4o-mini".to_string(),
        TokenPricing::new(150_000, 600_000),
    );

    pricing
}

/// Lookup table from model name to token rates.
///
/// Unknown models price at zero and are reported to the caller so a warning
/// can be surfaced; they pass budget checks trivially.
#[derive(Clone, Debug)]
pub struct PricingTable {
    models: HashMap<String, TokenPricing>,
}

impl Default for PricingTable {
    fn default() -> Self {
        Self {
            models: default_pricing(),
        }
    }
}

impl PricingTable {
    /// An empty table; every model is unpriced.
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    /// Add or replace pricing for a model.
    pub fn set(&mut self, model: &str, pricing: TokenPricing) {
        self.models.insert(model.to_string(), pricing);
    }

    pub fn get(&self, model: &str) -> Option<TokenPricing> {
        self.models.get(model).copied()
    }

    /// Cost of a call in micro-dollars, or `None` when the model is unknown.
    pub fn cost_micros(&self, model: &str, tokens_in: u64, tokens_out: u64) -> Option<u64> {
        self.get(model)
            .map(|pricing| pricing.cost_micros(tokens_in, tokens_out))
    }
}

/// Rough token estimate for budgeting: ~4 characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64).div_ceil(4).max(1)
}

/// Convert a dollar amount to micro-dollars, flooring at zero.
pub fn usd_to_micros(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * 1_000_000.0).round() as u64
}

/// Convert micro-dollars back to dollars for reporting.
pub fn micros_to_usd(micros: u64) -> f64 {
    micros as f64 / 1_000_000.0
}
