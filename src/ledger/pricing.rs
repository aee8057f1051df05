//! Per-provider token pricing.

use serde::Serialize;
use std::collections::HashMap;

use crate::config::ProviderConfig;
use crate::types::Provider;

/// USD per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Rates {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Rates {
    pub const fn new(input_per_1k: f64, output_per_1k: f64) -> Self {
        Self {
            input_per_1k,
            output_per_1k,
        }
    }
}

/// Rates used for providers without a published default.
const FALLBACK_RATES: Rates = Rates::new(0.0015, 0.002);

fn default_rates(provider: Provider) -> Option<Rates> {
    match provider {
        Provider::OpenAi => Some(Rates::new(0.0015, 0.002)),
        Provider::Anthropic => Some(Rates::new(0.00163, 0.00551)),
        Provider::Google => Some(Rates::new(0.0005, 0.0015)),
        Provider::Cohere => Some(Rates::new(0.0015, 0.002)),
        _ => None,
    }
}

/// Price table with config overrides applied over built-in defaults.
#[derive(Debug, Clone, Default)]
pub struct Pricing {
    overrides: HashMap<Provider, Rates>,
}

impl Pricing {
    /// Built-in defaults only.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defaults plus any rates set on `[[providers]]` entries. A provider
    /// that sets only one side keeps the default for the other.
    pub fn from_providers(providers: &[ProviderConfig]) -> Self {
        let mut overrides = HashMap::new();
        for p in providers {
            if p.input_cost_per_1k.is_none() && p.output_cost_per_1k.is_none() {
                continue;
            }
            let base = default_rates(p.name).unwrap_or(FALLBACK_RATES);
            overrides.insert(
                p.name,
                Rates::new(
                    p.input_cost_per_1k.unwrap_or(base.input_per_1k),
                    p.output_cost_per_1k.unwrap_or(base.output_per_1k),
                ),
            );
        }
        Self { overrides }
    }

    pub fn rates(&self, provider: Provider) -> Rates {
        self.overrides
            .get(&provider)
            .copied()
            .or_else(|| default_rates(provider))
            .unwrap_or(FALLBACK_RATES)
    }

    /// Cost in USD of a request with the given token counts.
    pub fn cost(&self, provider: Provider, input_tokens: u32, output_tokens: u32) -> f64 {
        let rates = self.rates(provider);
        (input_tokens as f64 / 1000.0) * rates.input_per_1k
            + (output_tokens as f64 / 1000.0) * rates.output_per_1k
    }
}
