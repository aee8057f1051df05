//! Key pool with atomic acquire/release and lazy cooldown recovery.
//!
//! Each key lives in its own [`KeySlot`] guarded by a mutex. Eligibility
//! is checked and the in-flight counter incremented while that mutex is
//! held, so two concurrent acquisitions can never push a key past its
//! concurrency cap.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::PoolConfig;
use crate::crypto::key_hint;
use crate::error::{Error, Result};
use crate::types::{KeyStatus, Provider};

/// Pool-wide tuning, usually built from [`PoolConfig`].
#[derive(Debug, Clone)]
pub struct KeySettings {
    pub max_concurrent_per_key: u32,
    pub rate_limit_cooldown: Duration,
    pub error_threshold: u32,
    pub priority_reserved_slots: u32,
    pub priority_threshold: u8,
    /// Smallest headroom a limited key must have per request it carries.
    pub cost_reserve_usd: f64,
}

impl From<&PoolConfig> for KeySettings {
    fn from(config: &PoolConfig) -> Self {
        Self {
            max_concurrent_per_key: config.max_concurrent_per_key,
            rate_limit_cooldown: config.rate_limit_cooldown(),
            error_threshold: config.error_threshold,
            priority_reserved_slots: config.priority_reserved_slots,
            priority_threshold: config.priority_threshold,
            cost_reserve_usd: config.cost_reserve_usd,
        }
    }
}

impl Default for KeySettings {
    fn default() -> Self {
        Self::from(&PoolConfig::default())
    }
}

impl KeySettings {
    /// Concurrency cap that applies to a caller with the given priority.
    fn cap_for(&self, priority: u8) -> u32 {
        if priority >= self.priority_threshold {
            self.max_concurrent_per_key
        } else {
            self.max_concurrent_per_key
                .saturating_sub(self.priority_reserved_slots)
                .max(1)
        }
    }
}

/// A key as loaded from storage (or freshly donated), ready to pool.
#[derive(Debug, Clone)]
pub struct PooledKey {
    pub id: i64,
    pub donor_user_id: Option<i64>,
    pub provider: Provider,
    pub nickname: Option<String>,
    pub secret: SecretString,
    pub monthly_limit: Option<f64>,
    pub usage_this_month: f64,
    pub total_usage: f64,
    pub requests_this_month: i64,
    pub status: KeyStatus,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub last_used: Option<DateTime<Utc>>,
}

/// Outcome reported when a lease is released.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum KeyResult {
    /// The provider served the request.
    Success { cost_usd: f64 },
    /// The provider throttled this key (HTTP 429).
    Throttled { retry_after: Option<Duration> },
    /// The provider rejected this key's credentials (HTTP 401/403).
    Rejected,
    /// Transient upstream failure (5xx, timeout, network) not caused by the key.
    Failed,
    /// The lease was dropped before the request completed.
    Abandoned,
}

/// What a release changed, for persistence by the usage ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct ReleaseReport {
    pub key_id: i64,
    pub provider: Provider,
    pub status: KeyStatus,
    pub status_changed: bool,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub cost_usd: f64,
    /// Portion of `cost_usd` counted against the monthly limit. Smaller
    /// than `cost_usd` only when the request overran the limit.
    pub usage_increment: f64,
    /// 1 for a completed request, 0 for an abandoned lease.
    pub requests_increment: i64,
    pub usage_this_month: f64,
    pub last_used: Option<DateTime<Utc>>,
}

/// Redacted view of a pooled key.
#[derive(Debug, Clone, Serialize)]
pub struct KeySnapshot {
    pub id: i64,
    pub donor_user_id: Option<i64>,
    pub provider: Provider,
    pub nickname: Option<String>,
    pub key_hint: String,
    pub status: KeyStatus,
    pub monthly_limit: Option<f64>,
    pub usage_this_month: f64,
    pub total_usage: f64,
    pub requests_this_month: i64,
    pub in_flight: u32,
    pub last_used: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
}

/// Mutable per-key state, only touched under the slot's mutex.
#[derive(Debug)]
struct KeyState {
    status: KeyStatus,
    nickname: Option<String>,
    monthly_limit: Option<f64>,
    usage_this_month: f64,
    total_usage: f64,
    requests_this_month: i64,
    in_flight: u32,
    /// Headroom held by in-flight leases against `monthly_limit`.
    reserved_usd: f64,
    consecutive_failures: u32,
    cooldown_until: Option<Instant>,
    cooldown_until_at: Option<DateTime<Utc>>,
    last_used: Option<Instant>,
    last_used_at: Option<DateTime<Utc>>,
}

impl KeyState {
    /// Lazily move an expired rate limit back to active.
    fn refresh(&mut self, now: Instant) {
        if self.status == KeyStatus::RateLimited {
            let expired = self.cooldown_until.map_or(true, |until| now >= until);
            if expired {
                self.status = KeyStatus::Active;
                self.cooldown_until = None;
                self.cooldown_until_at = None;
            }
        }
    }

    /// Headroom one more request holds: the configured floor or this
    /// month's average request cost, whichever is larger.
    fn reservation(&self, floor: f64) -> f64 {
        let average = if self.requests_this_month > 0 {
            self.usage_this_month / self.requests_this_month as f64
        } else {
            0.0
        };
        floor.max(average)
    }

    /// Whether a new request fits under the monthly limit alongside the
    /// requests already in flight.
    fn has_headroom(&self, reserve: f64) -> bool {
        self.monthly_limit.map_or(true, |limit| {
            self.usage_this_month < limit
                && self.usage_this_month + self.reserved_usd + reserve <= limit
        })
    }

    fn is_acquirable(&mut self, now: Instant, cap: u32, floor: f64) -> bool {
        self.refresh(now);
        self.status == KeyStatus::Active
            && self.in_flight < cap
            && self.has_headroom(self.reservation(floor))
    }
}

struct KeySlot {
    id: i64,
    provider: Provider,
    donor_user_id: Option<i64>,
    secret: SecretString,
    state: Mutex<KeyState>,
}

impl KeySlot {
    fn lock(&self) -> MutexGuard<'_, KeyState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> KeySnapshot {
        let mut state = self.lock();
        state.refresh(Instant::now());
        KeySnapshot {
            id: self.id,
            donor_user_id: self.donor_user_id,
            provider: self.provider,
            nickname: state.nickname.clone(),
            key_hint: key_hint(&self.secret),
            status: state.status,
            monthly_limit: state.monthly_limit,
            usage_this_month: state.usage_this_month,
            total_usage: state.total_usage,
            requests_this_month: state.requests_this_month,
            in_flight: state.in_flight,
            last_used: state.last_used_at,
            cooldown_until: state.cooldown_until_at,
        }
    }
}

struct PoolInner {
    keys: DashMap<i64, Arc<KeySlot>>,
    settings: KeySettings,
}

/// Shared, cheaply cloneable handle to the key pool.
#[derive(Clone)]
pub struct KeyPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.inner.keys.len())
            .field("settings", &self.inner.settings)
            .finish()
    }
}

impl KeyPool {
    pub fn new(settings: KeySettings) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                keys: DashMap::new(),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &KeySettings {
        &self.inner.settings
    }

    /// Add a key to the pool, replacing any entry with the same id.
    pub fn insert(&self, key: PooledKey) {
        let now = Instant::now();
        let utc_now = Utc::now();

        // Wall-clock cooldowns from storage become monotonic deadlines.
        let cooldown_until = key.cooldown_until.map(|until| {
            let remaining = (until - utc_now).to_std().unwrap_or(Duration::ZERO);
            now + remaining
        });

        let slot = KeySlot {
            id: key.id,
            provider: key.provider,
            donor_user_id: key.donor_user_id,
            secret: key.secret,
            state: Mutex::new(KeyState {
                status: key.status,
                nickname: key.nickname,
                monthly_limit: key.monthly_limit,
                usage_this_month: key.usage_this_month,
                total_usage: key.total_usage,
                requests_this_month: key.requests_this_month,
                in_flight: 0,
                reserved_usd: 0.0,
                consecutive_failures: 0,
                cooldown_until,
                cooldown_until_at: key.cooldown_until,
                last_used: None,
                last_used_at: key.last_used,
            }),
        };

        tracing::debug!(key_id = key.id, provider = %key.provider, "Key added to pool");
        self.inner.keys.insert(key.id, Arc::new(slot));
    }

    /// Remove a key. Outstanding leases keep working until released.
    pub fn remove(&self, key_id: i64) -> bool {
        self.inner.keys.remove(&key_id).is_some()
    }

    pub fn len(&self) -> usize {
        self.inner.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.keys.is_empty()
    }

    fn slots_for(&self, provider: Provider) -> Vec<Arc<KeySlot>> {
        self.inner
            .keys
            .iter()
            .filter(|entry| entry.value().provider == provider)
            .map(|entry| entry.value().clone())
            .collect()
    }

    fn slot(&self, key_id: i64) -> Result<Arc<KeySlot>> {
        self.inner
            .keys
            .get(&key_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| Error::NotFound(format!("Key {} not found", key_id)))
    }

    /// Acquire a key for `provider`.
    ///
    /// Candidates are tried least-recently-used first (never-used keys
    /// before any other), then by lowest monthly usage. Fails with
    /// [`Error::NoKeyAvailable`] when no key is active, below its
    /// concurrency cap for this caller's priority and left with enough
    /// monthly headroom for one more request.
    ///
    /// A limited key's lease reserves its estimated cost until release, so
    /// concurrent requests cannot jointly overrun the limit.
    pub fn acquire(&self, provider: Provider, model: &str, priority: u8) -> Result<KeyLease> {
        let now = Instant::now();
        let cap = self.inner.settings.cap_for(priority);
        let floor = self.inner.settings.cost_reserve_usd;

        let mut candidates: Vec<(Option<Instant>, f64, Arc<KeySlot>)> = self
            .slots_for(provider)
            .into_iter()
            .map(|slot| {
                let (last_used, usage) = {
                    let state = slot.lock();
                    (state.last_used, state.usage_this_month)
                };
                (last_used, usage, slot)
            })
            .collect();

        candidates.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
                .then(a.2.id.cmp(&b.2.id))
        });

        for (_, _, slot) in candidates {
            let mut state = slot.lock();
            if !state.is_acquirable(now, cap, floor) {
                continue;
            }
            let reserved_usd = if state.monthly_limit.is_some() {
                state.reservation(floor)
            } else {
                0.0
            };
            state.reserved_usd += reserved_usd;
            state.in_flight += 1;
            state.last_used = Some(now);
            state.last_used_at = Some(Utc::now());
            let in_flight = state.in_flight;
            drop(state);

            tracing::debug!(
                key_id = slot.id,
                provider = %provider,
                model = %model,
                in_flight,
                "Key acquired"
            );

            return Ok(KeyLease {
                pool: self.clone(),
                slot,
                model: model.to_string(),
                acquired_at: now,
                reserved_usd,
                released: false,
            });
        }

        tracing::debug!(provider = %provider, model = %model, "No key available");
        Err(Error::NoKeyAvailable { provider })
    }

    /// Number of keys that could be acquired right now for `provider`.
    pub fn acquirable_count(&self, provider: Provider, priority: u8) -> usize {
        let now = Instant::now();
        let cap = self.inner.settings.cap_for(priority);
        let floor = self.inner.settings.cost_reserve_usd;
        self.slots_for(provider)
            .iter()
            .filter(|slot| slot.lock().is_acquirable(now, cap, floor))
            .count()
    }

    /// Whether any key (in any status) is pooled for `provider`.
    pub fn has_keys(&self, provider: Provider) -> bool {
        self.inner
            .keys
            .iter()
            .any(|entry| entry.value().provider == provider)
    }

    /// Providers with at least one pooled key.
    pub fn providers(&self) -> BTreeSet<Provider> {
        self.inner
            .keys
            .iter()
            .map(|entry| entry.value().provider)
            .collect()
    }

    /// Ids and secrets of the active keys for `provider`, lowest id first.
    /// Used for out-of-band test requests that bypass the lease machinery.
    pub fn active_credentials(&self, provider: Provider) -> Vec<(i64, SecretString)> {
        let now = Instant::now();
        let mut credentials: Vec<(i64, SecretString)> = self
            .slots_for(provider)
            .iter()
            .filter(|slot| {
                let mut state = slot.lock();
                state.refresh(now);
                state.status == KeyStatus::Active
            })
            .map(|slot| (slot.id, slot.secret.clone()))
            .collect();
        credentials.sort_by_key(|(id, _)| *id);
        credentials
    }

    fn release_slot(
        &self,
        slot: &KeySlot,
        result: KeyResult,
        reserved_usd: f64,
        held_for: Duration,
    ) -> ReleaseReport {
        let settings = &self.inner.settings;
        let now = Instant::now();
        let mut state = slot.lock();
        let before = state.status;

        state.in_flight = state.in_flight.saturating_sub(1);
        state.reserved_usd = (state.reserved_usd - reserved_usd).max(0.0);
        state.refresh(now);

        let (cost_usd, requests_increment) = match result {
            KeyResult::Success { cost_usd } => {
                state.consecutive_failures = 0;
                (cost_usd.max(0.0), 1)
            }
            KeyResult::Throttled { retry_after } => {
                if state.status == KeyStatus::Active {
                    let cooldown = retry_after.unwrap_or(settings.rate_limit_cooldown);
                    state.status = KeyStatus::RateLimited;
                    state.cooldown_until = Some(now + cooldown);
                    state.cooldown_until_at = chrono::Duration::from_std(cooldown)
                        .ok()
                        .map(|d| Utc::now() + d);
                }
                (0.0, 1)
            }
            KeyResult::Rejected => {
                state.consecutive_failures += 1;
                if state.status == KeyStatus::Active
                    && state.consecutive_failures >= settings.error_threshold
                {
                    state.status = KeyStatus::Error;
                }
                (0.0, 1)
            }
            KeyResult::Failed => (0.0, 1),
            KeyResult::Abandoned => (0.0, 0),
        };

        // Monthly usage stops at the limit; the full cost still lands in
        // total_usage and the request ledger.
        let usage_increment = match state.monthly_limit {
            Some(limit) => cost_usd.min((limit - state.usage_this_month).max(0.0)),
            None => cost_usd,
        };
        if usage_increment < cost_usd {
            tracing::warn!(
                key_id = slot.id,
                provider = %slot.provider,
                overrun_usd = cost_usd - usage_increment,
                "Request cost overran the key's monthly limit"
            );
        }

        state.usage_this_month += usage_increment;
        state.total_usage += cost_usd;
        state.requests_this_month += requests_increment;

        let report = ReleaseReport {
            key_id: slot.id,
            provider: slot.provider,
            status: state.status,
            status_changed: state.status != before,
            cooldown_until: state.cooldown_until_at,
            cost_usd,
            usage_increment,
            requests_increment,
            usage_this_month: state.usage_this_month,
            last_used: state.last_used_at,
        };
        drop(state);

        if report.status_changed {
            tracing::warn!(
                key_id = slot.id,
                provider = %slot.provider,
                from = %before,
                to = %report.status,
                "Key status changed"
            );
        } else {
            tracing::debug!(
                key_id = slot.id,
                provider = %slot.provider,
                result = ?result,
                held_ms = held_for.as_millis() as u64,
                "Key released"
            );
        }

        report
    }

    /// Administrative status change. Re-activating clears cooldown and
    /// the consecutive failure count.
    pub fn set_status(&self, key_id: i64, status: KeyStatus) -> Result<KeySnapshot> {
        let slot = self.slot(key_id)?;
        {
            let mut state = slot.lock();
            state.status = status;
            if status == KeyStatus::Active {
                state.consecutive_failures = 0;
                state.cooldown_until = None;
                state.cooldown_until_at = None;
            }
        }
        tracing::info!(key_id, status = %status, "Key status set");
        Ok(slot.snapshot())
    }

    pub fn set_monthly_limit(&self, key_id: i64, limit: Option<f64>) -> Result<KeySnapshot> {
        let slot = self.slot(key_id)?;
        slot.lock().monthly_limit = limit;
        Ok(slot.snapshot())
    }

    pub fn set_nickname(&self, key_id: i64, nickname: Option<String>) -> Result<KeySnapshot> {
        let slot = self.slot(key_id)?;
        slot.lock().nickname = nickname;
        Ok(slot.snapshot())
    }

    pub fn snapshot(&self, key_id: i64) -> Result<KeySnapshot> {
        Ok(self.slot(key_id)?.snapshot())
    }

    /// Redacted view of every key, ordered by id.
    pub fn snapshots(&self) -> Vec<KeySnapshot> {
        let slots: Vec<Arc<KeySlot>> = self
            .inner
            .keys
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        let mut out: Vec<KeySnapshot> = slots.iter().map(|slot| slot.snapshot()).collect();
        out.sort_by_key(|s| s.id);
        out
    }

    /// Start a new billing month: zero every key's monthly counters.
    pub fn reset_monthly_usage(&self) {
        for entry in self.inner.keys.iter() {
            let mut state = entry.value().lock();
            state.usage_this_month = 0.0;
            state.requests_this_month = 0;
        }
        tracing::info!(keys = self.inner.keys.len(), "Monthly key usage reset");
    }
}

/// A key checked out of the pool.
///
/// Must be released exactly once via [`KeyLease::release`]. A lease that
/// is dropped unreleased frees its slot as [`KeyResult::Abandoned`].
pub struct KeyLease {
    pool: KeyPool,
    slot: Arc<KeySlot>,
    model: String,
    acquired_at: Instant,
    reserved_usd: f64,
    released: bool,
}

impl std::fmt::Debug for KeyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyLease")
            .field("key_id", &self.slot.id)
            .field("provider", &self.slot.provider)
            .field("model", &self.model)
            .finish()
    }
}

impl KeyLease {
    pub fn key_id(&self) -> i64 {
        self.slot.id
    }

    pub fn provider(&self) -> Provider {
        self.slot.provider
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Raw key material for the upstream call.
    pub fn expose_secret(&self) -> &str {
        self.slot.secret.expose_secret()
    }

    /// Time since the key was acquired.
    pub fn elapsed(&self) -> Duration {
        Instant::now().duration_since(self.acquired_at)
    }

    /// Return the key to the pool with the request's outcome.
    pub fn release(mut self, result: KeyResult) -> ReleaseReport {
        self.released = true;
        self.pool
            .release_slot(&self.slot, result, self.reserved_usd, self.elapsed())
    }
}

impl Drop for KeyLease {
    fn drop(&mut self) {
        if !self.released {
            tracing::warn!(
                key_id = self.slot.id,
                provider = %self.slot.provider,
                "KeyLease dropped without release, freeing slot"
            );
            self.pool.release_slot(
                &self.slot,
                KeyResult::Abandoned,
                self.reserved_usd,
                self.elapsed(),
            );
        }
    }
}
