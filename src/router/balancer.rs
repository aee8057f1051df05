//! Health-aware weighted provider selection.
//!
//! For each request the balancer filters a model's fallback order down to
//! providers that are healthy, positively weighted and hold at least one
//! acquirable key, then draws a provider by weight and checks a key out of
//! the pool. A provider whose keys run out between filtering and
//! acquisition is dropped and the draw repeats.

use chrono::Utc;
use dashmap::DashMap;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::health::HealthTracker;
use crate::ledger::{RequestRecord, UsageLedger};
use crate::pool::{KeyLease, KeyPool, KeyResult, ReleaseReport};
use crate::types::{Provider, UserAccess};

/// Routing configuration for one model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalancerConfig {
    pub model_name: String,
    /// Relative weights; they need not sum to 1.
    pub provider_weights: BTreeMap<Provider, f64>,
    pub fallback_order: Vec<Provider>,
    pub enabled: bool,
    pub min_healthy_keys: u32,
    pub health_check_interval_secs: u64,
}

impl BalancerConfig {
    /// Check weights and interval. Key availability is checked separately
    /// because it depends on the pool's contents at write time.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.model_name.trim().is_empty() {
            return Err("model name must not be empty".to_string());
        }
        if self.fallback_order.is_empty() {
            return Err("fallback order must list at least one provider".to_string());
        }
        for (provider, weight) in &self.provider_weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(format!(
                    "weight for '{}' must be a non-negative number, got {}",
                    provider, weight
                ));
            }
        }
        if self.health_check_interval_secs == 0 {
            return Err("health check interval must be at least 1 second".to_string());
        }
        Ok(())
    }

    /// Weight of `provider`, zero when not configured.
    pub fn weight(&self, provider: Provider) -> f64 {
        self.provider_weights.get(&provider).copied().unwrap_or(0.0)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

/// Live set of balancer configs, keyed by model name.
#[derive(Debug, Default)]
pub struct BalancerConfigs {
    configs: DashMap<String, Arc<BalancerConfig>>,
}

impl BalancerConfigs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: impl IntoIterator<Item = BalancerConfig>) -> Self {
        let registry = Self::new();
        for config in configs {
            registry.upsert(config);
        }
        registry
    }

    pub fn get(&self, model: &str) -> Option<Arc<BalancerConfig>> {
        self.configs.get(model).map(|entry| entry.value().clone())
    }

    pub fn upsert(&self, config: BalancerConfig) {
        self.configs
            .insert(config.model_name.clone(), Arc::new(config));
    }

    pub fn remove(&self, model: &str) -> bool {
        self.configs.remove(model).is_some()
    }

    pub fn contains(&self, model: &str) -> bool {
        self.configs.contains_key(model)
    }

    /// All configs, ordered by model name.
    pub fn list(&self) -> Vec<Arc<BalancerConfig>> {
        let mut out: Vec<Arc<BalancerConfig>> = self
            .configs
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        out.sort_by(|a, b| a.model_name.cmp(&b.model_name));
        out
    }
}

/// A routed provider plus the key checked out for it.
///
/// Must be completed exactly once through the gateway. Dropping an
/// uncompleted selection (a caller that went away mid-request) frees the
/// key, leaves provider health untouched and, when a ledger is attached,
/// writes a failed `abandoned` request row.
pub struct ProviderSelection {
    provider: Provider,
    model: String,
    user: UserAccess,
    degraded: bool,
    lease: Option<KeyLease>,
    health: Arc<HealthTracker>,
    ledger: Option<UsageLedger>,
    labels: CallLabels,
    started: Instant,
}

/// Identifiers copied onto the ledger row of an abandoned selection.
#[derive(Debug, Clone, Default)]
pub struct CallLabels {
    pub request_id: String,
    pub session_id: Option<String>,
    pub user_agent: Option<String>,
}

impl std::fmt::Debug for ProviderSelection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSelection")
            .field("provider", &self.provider)
            .field("model", &self.model)
            .field("key_id", &self.key_id())
            .field("degraded", &self.degraded)
            .finish()
    }
}

impl ProviderSelection {
    pub fn provider(&self) -> Provider {
        self.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn user(&self) -> &UserAccess {
        &self.user
    }

    /// Whether the selection was made in degraded mode.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn key_id(&self) -> Option<i64> {
        self.lease.as_ref().map(KeyLease::key_id)
    }

    /// Raw key material for the upstream call.
    pub fn api_key(&self) -> &str {
        self.lease.as_ref().map_or("", KeyLease::expose_secret)
    }

    pub fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.started)
    }

    /// Tag the selection with the caller's request identifiers.
    pub fn label(&mut self, labels: CallLabels) {
        self.labels = labels;
    }

    pub(crate) fn attach_ledger(&mut self, ledger: UsageLedger) {
        self.ledger = Some(ledger);
    }

    /// Release the key with `result` and feed the outcome to the tracker.
    ///
    /// Throttling and credential rejections are faults of one key, not of
    /// the provider, and an abandonment is the caller's doing; all three
    /// leave health untouched.
    pub(crate) fn finish(
        mut self,
        result: KeyResult,
        latency_ms: u64,
        error: Option<&str>,
    ) -> Option<ReleaseReport> {
        let lease = self.lease.take()?;
        match result {
            KeyResult::Success { .. } => {
                self.health
                    .record(self.provider, &self.model, true, latency_ms, None)
            }
            KeyResult::Failed => {
                self.health
                    .record(self.provider, &self.model, false, latency_ms, error)
            }
            KeyResult::Throttled { .. } | KeyResult::Rejected | KeyResult::Abandoned => {}
        }
        Some(lease.release(result))
    }
}

impl Drop for ProviderSelection {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        let key_id = lease.key_id();
        tracing::warn!(
            provider = %self.provider,
            model = %self.model,
            key_id,
            "Selection dropped without completion"
        );
        let report = lease.release(KeyResult::Abandoned);

        let Some(ledger) = self.ledger.take() else {
            return;
        };
        let labels = std::mem::take(&mut self.labels);
        let record = RequestRecord {
            request_id: labels.request_id,
            user_id: self.user.user_id,
            session_id: labels.session_id,
            model_name: self.model.clone(),
            provider: self.provider,
            api_key_id: Some(key_id),
            request_type: "chat".to_string(),
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
            response_time_ms: self.elapsed().as_millis() as u64,
            success: false,
            error_code: Some("abandoned".to_string()),
            error_message: Some("request abandoned before completion".to_string()),
            user_agent: labels.user_agent,
            created_at: Utc::now(),
        };

        // Drop cannot await, so the write runs detached.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = ledger.record_completion(record, Some(report)).await {
                        tracing::warn!(key_id, error = %e, "Failed to record abandoned request");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key_id, "No runtime to record abandoned request");
            }
        }
    }
}

/// A routing candidate with its weight and current key headroom.
#[derive(Debug, Clone, Copy)]
struct Candidate {
    provider: Provider,
    weight: f64,
    keys: usize,
}

/// Selects a provider and key per request.
#[derive(Debug, Clone)]
pub struct LoadBalancer {
    configs: Arc<BalancerConfigs>,
    pool: KeyPool,
    health: Arc<HealthTracker>,
    degraded_provider: Option<Provider>,
}

impl LoadBalancer {
    pub fn new(
        configs: Arc<BalancerConfigs>,
        pool: KeyPool,
        health: Arc<HealthTracker>,
        degraded_provider: Option<Provider>,
    ) -> Self {
        Self {
            configs,
            pool,
            health,
            degraded_provider,
        }
    }

    pub fn configs(&self) -> &Arc<BalancerConfigs> {
        &self.configs
    }

    pub fn pool(&self) -> &KeyPool {
        &self.pool
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        &self.health
    }

    /// Route `model` for `user` using the thread-local RNG.
    pub fn route(&self, model: &str, user: &UserAccess) -> Result<ProviderSelection> {
        self.route_with_rng(model, user, &[], &mut rand::thread_rng())
    }

    /// Route while skipping providers in `exclude` (already tried).
    pub fn route_excluding(
        &self,
        model: &str,
        user: &UserAccess,
        exclude: &[Provider],
    ) -> Result<ProviderSelection> {
        self.route_with_rng(model, user, exclude, &mut rand::thread_rng())
    }

    /// Route with an explicit RNG so draws are reproducible in tests.
    pub fn route_with_rng<R: Rng + ?Sized>(
        &self,
        model: &str,
        user: &UserAccess,
        exclude: &[Provider],
        rng: &mut R,
    ) -> Result<ProviderSelection> {
        let config = self
            .configs
            .get(model)
            .filter(|c| c.enabled)
            .ok_or_else(|| Error::ConfigNotFound {
                model: model.to_string(),
            })?;

        let required = config.min_healthy_keys as usize;
        let scan = self.scan(&config, user, exclude);
        let mut candidates = scan.candidates;
        if candidates.is_empty() {
            tracing::warn!(
                model = %model,
                excluded = ?exclude,
                unhealthy = scan.unhealthy_with_keys,
                "No routable providers"
            );
            // Keys remain but every provider holding them is unhealthy.
            if scan.unhealthy_with_keys > 0 {
                return Err(Error::InsufficientHealthyProviders {
                    model: model.to_string(),
                    available: 0,
                    required,
                });
            }
            return Err(Error::AllProvidersExhausted {
                model: model.to_string(),
            });
        }

        let available: usize = candidates.iter().map(|c| c.keys).sum();
        let mut degraded = false;
        if available < required {
            match self
                .degraded_provider
                .filter(|p| candidates.iter().any(|c| c.provider == *p))
            {
                Some(fallback) => {
                    tracing::warn!(
                        model = %model,
                        available,
                        required,
                        provider = %fallback,
                        "Below healthy key threshold, routing in degraded mode"
                    );
                    candidates.retain(|c| c.provider == fallback);
                    degraded = true;
                }
                None => {
                    return Err(Error::InsufficientHealthyProviders {
                        model: model.to_string(),
                        available,
                        required,
                    });
                }
            }
        }

        // Each failed acquisition removes one candidate, so this terminates.
        while !candidates.is_empty() {
            let index = weighted_pick(&candidates, rng);
            let provider = candidates[index].provider;
            match self.pool.acquire(provider, model, user.priority_level) {
                Ok(lease) => {
                    tracing::debug!(
                        model = %model,
                        provider = %provider,
                        key_id = lease.key_id(),
                        degraded,
                        "Routed request"
                    );
                    return Ok(ProviderSelection {
                        provider,
                        model: model.to_string(),
                        user: *user,
                        degraded,
                        lease: Some(lease),
                        health: self.health.clone(),
                        ledger: None,
                        labels: CallLabels {
                            request_id: uuid::Uuid::new_v4().to_string(),
                            ..CallLabels::default()
                        },
                        started: Instant::now(),
                    });
                }
                Err(Error::NoKeyAvailable { .. }) => {
                    tracing::debug!(provider = %provider, model = %model, "Keys ran out, redrawing");
                    candidates.swap_remove(index);
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::AllProvidersExhausted {
            model: model.to_string(),
        })
    }

    /// Providers that could serve `model` right now, in fallback order.
    pub fn routable_providers(&self, config: &BalancerConfig, user: &UserAccess) -> Vec<Provider> {
        self.scan(config, user, &[])
            .candidates
            .into_iter()
            .map(|c| c.provider)
            .collect()
    }

    fn scan(&self, config: &BalancerConfig, user: &UserAccess, exclude: &[Provider]) -> Scan {
        let interval = config.health_check_interval();
        let mut seen = Vec::with_capacity(config.fallback_order.len());
        let mut out = Scan::default();

        for &provider in &config.fallback_order {
            if seen.contains(&provider) || exclude.contains(&provider) {
                continue;
            }
            seen.push(provider);

            let weight = config.weight(provider);
            if weight <= 0.0 {
                continue;
            }
            let keys = self.pool.acquirable_count(provider, user.priority_level);
            if keys == 0 {
                continue;
            }
            if !self.health.is_healthy(provider, &config.model_name, interval) {
                tracing::debug!(
                    provider = %provider,
                    model = %config.model_name,
                    "Skipping unhealthy provider"
                );
                out.unhealthy_with_keys += 1;
                continue;
            }
            out.candidates.push(Candidate {
                provider,
                weight,
                keys,
            });
        }
        out
    }
}

/// Candidates for one routing decision, plus how many providers still had
/// keys but were skipped as unhealthy.
#[derive(Debug, Default)]
struct Scan {
    candidates: Vec<Candidate>,
    unhealthy_with_keys: usize,
}

/// Draw an index with probability proportional to weight.
fn weighted_pick<R: Rng + ?Sized>(candidates: &[Candidate], rng: &mut R) -> usize {
    if candidates.len() == 1 {
        return 0;
    }
    let total: f64 = candidates.iter().map(|c| c.weight).sum();
    let mut point = rng.gen::<f64>() * total;
    for (i, candidate) in candidates.iter().enumerate() {
        if point < candidate.weight {
            return i;
        }
        point -= candidate.weight;
    }
    candidates.len() - 1
}
