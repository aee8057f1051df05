//! Exponentially-weighted health tracking with burst detection.
//!
//! Per pair state:
//! - **success rate**: EWMA of request outcomes, always within [0, 1]
//! - **latency**: EWMA of response times
//! - **burst window**: timestamps of the most recent failures
//!
//! A pair is unhealthy when its success rate drops below the threshold or
//! more than `burst_threshold` failures fall inside the check interval.
//! Silence longer than the check interval resets the pair to neutral.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use sqlx::SqlitePool;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::HealthConfig;
use crate::storage;
use crate::types::{HealthStatus, Provider};

/// Success rate below which a healthy pair is reported as degraded.
const DEGRADED_BELOW: f64 = 0.9;

/// Check interval assumed for snapshots of pairs never queried by a router.
const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(300);

/// Tracker tuning, usually built from [`HealthConfig`].
#[derive(Debug, Clone)]
pub struct HealthSettings {
    pub success_threshold: f64,
    pub burst_threshold: u32,
    pub smoothing: f64,
}

impl From<&HealthConfig> for HealthSettings {
    fn from(config: &HealthConfig) -> Self {
        Self {
            success_threshold: config.success_threshold,
            burst_threshold: config.burst_threshold,
            smoothing: config.smoothing,
        }
    }
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self::from(&HealthConfig::default())
    }
}

/// Point-in-time view of one pair.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub provider: Provider,
    pub model_name: String,
    pub status: HealthStatus,
    pub success_rate: f64,
    pub response_time_avg: f64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub last_check: DateTime<Utc>,
}

struct HealthInner {
    success_rate: f64,
    avg_latency_ms: Option<f64>,
    /// Cumulative failures since tracking began.
    error_count: u64,
    /// Most recent failure times, at most `burst_threshold + 1` entries.
    recent_failures: VecDeque<Instant>,
    last_error: Option<String>,
    last_request: Option<Instant>,
    last_check: DateTime<Utc>,
    /// Interval most recently used to judge this pair.
    check_interval: Duration,
    dirty: bool,
}

impl HealthInner {
    fn new() -> Self {
        Self {
            success_rate: 1.0,
            avg_latency_ms: None,
            error_count: 0,
            recent_failures: VecDeque::new(),
            last_error: None,
            last_request: None,
            last_check: Utc::now(),
            check_interval: DEFAULT_CHECK_INTERVAL,
            dirty: false,
        }
    }

    fn record(
        &mut self,
        settings: &HealthSettings,
        now: Instant,
        success: bool,
        latency_ms: u64,
        error: Option<&str>,
    ) {
        self.decay(now);

        let alpha = settings.smoothing;
        let sample = if success { 1.0 } else { 0.0 };
        self.success_rate = (alpha * sample + (1.0 - alpha) * self.success_rate).clamp(0.0, 1.0);

        let latency = latency_ms as f64;
        self.avg_latency_ms = Some(match self.avg_latency_ms {
            Some(avg) => alpha * latency + (1.0 - alpha) * avg,
            None => latency,
        });

        if !success {
            self.error_count += 1;
            self.last_error = error.map(str::to_string);
            self.recent_failures.push_back(now);
            let keep = settings.burst_threshold as usize + 1;
            while self.recent_failures.len() > keep {
                self.recent_failures.pop_front();
            }
        }

        self.last_request = Some(now);
        self.last_check = Utc::now();
        self.dirty = true;
    }

    /// Reset to neutral after a silence longer than the check interval.
    fn decay(&mut self, now: Instant) {
        let Some(last) = self.last_request else {
            return;
        };
        if now.duration_since(last) > self.check_interval {
            if self.success_rate < 1.0 || !self.recent_failures.is_empty() {
                tracing::debug!(
                    success_rate = self.success_rate,
                    "health reset to neutral after silence"
                );
                self.dirty = true;
            }
            self.success_rate = 1.0;
            self.recent_failures.clear();
            self.last_request = None;
        }
    }

    fn failures_within(&self, now: Instant) -> usize {
        self.recent_failures
            .iter()
            .filter(|t| now.duration_since(**t) <= self.check_interval)
            .count()
    }

    fn is_healthy(&mut self, settings: &HealthSettings, now: Instant) -> bool {
        self.decay(now);
        self.success_rate >= settings.success_threshold
            && self.failures_within(now) <= settings.burst_threshold as usize
    }

    fn status(&mut self, settings: &HealthSettings, now: Instant) -> HealthStatus {
        if !self.is_healthy(settings, now) {
            HealthStatus::Down
        } else if self.success_rate < DEGRADED_BELOW {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

struct PairHealth {
    inner: Mutex<HealthInner>,
}

impl PairHealth {
    fn lock(&self) -> MutexGuard<'_, HealthInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Concurrent health registry keyed by (provider, model).
///
/// Backed by [`DashMap`] so updates for different pairs do not contend.
/// Unknown pairs are healthy.
pub struct HealthTracker {
    pairs: DashMap<(Provider, String), PairHealth>,
    settings: HealthSettings,
}

impl std::fmt::Debug for HealthTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthTracker")
            .field("pairs", &self.pairs.len())
            .field("settings", &self.settings)
            .finish()
    }
}

impl HealthTracker {
    pub fn new(settings: HealthSettings) -> Self {
        Self {
            pairs: DashMap::new(),
            settings,
        }
    }

    pub fn settings(&self) -> &HealthSettings {
        &self.settings
    }

    /// Record the outcome of one completed request or health check.
    pub fn record(
        &self,
        provider: Provider,
        model: &str,
        success: bool,
        latency_ms: u64,
        error: Option<&str>,
    ) {
        let now = Instant::now();
        let entry = self
            .pairs
            .entry((provider, model.to_string()))
            .or_insert_with(|| PairHealth {
                inner: Mutex::new(HealthInner::new()),
            });
        let mut inner = entry.lock();
        let was_healthy = inner.is_healthy(&self.settings, now);
        inner.record(&self.settings, now, success, latency_ms, error);
        let healthy = inner.is_healthy(&self.settings, now);

        if was_healthy && !healthy {
            tracing::warn!(
                provider = %provider,
                model = %model,
                success_rate = inner.success_rate,
                last_error = ?inner.last_error,
                "pair became UNHEALTHY"
            );
        } else if !was_healthy && healthy {
            tracing::info!(provider = %provider, model = %model, "pair recovered");
        }
    }

    /// Whether `provider` should receive traffic for `model`.
    ///
    /// `interval` is the model's health-check interval; it bounds both the
    /// burst window and the silence after which the pair resets.
    pub fn is_healthy(&self, provider: Provider, model: &str, interval: Duration) -> bool {
        let key = (provider, model.to_string());
        let Some(entry) = self.pairs.get(&key) else {
            return true;
        };
        let mut inner = entry.lock();
        inner.check_interval = interval;
        inner.is_healthy(&self.settings, Instant::now())
    }

    /// Current success rate, if the pair has been seen.
    pub fn success_rate(&self, provider: Provider, model: &str) -> Option<f64> {
        self.pairs
            .get(&(provider, model.to_string()))
            .map(|entry| entry.lock().success_rate)
    }

    fn snapshot_of(&self, key: &(Provider, String), inner: &mut HealthInner) -> HealthSnapshot {
        let status = inner.status(&self.settings, Instant::now());
        HealthSnapshot {
            provider: key.0,
            model_name: key.1.clone(),
            status,
            success_rate: inner.success_rate,
            response_time_avg: inner.avg_latency_ms.unwrap_or(0.0),
            error_count: inner.error_count,
            last_error: inner.last_error.clone(),
            last_check: inner.last_check,
        }
    }

    pub fn snapshot(&self, provider: Provider, model: &str) -> Option<HealthSnapshot> {
        let key = (provider, model.to_string());
        let entry = self.pairs.get(&key)?;
        let mut inner = entry.lock();
        Some(self.snapshot_of(&key, &mut inner))
    }

    /// Snapshots of all tracked pairs, ordered by provider then model.
    pub fn snapshots(&self) -> Vec<HealthSnapshot> {
        let mut out: Vec<HealthSnapshot> = self
            .pairs
            .iter()
            .map(|entry| {
                let mut inner = entry.value().lock();
                self.snapshot_of(entry.key(), &mut inner)
            })
            .collect();
        out.sort_by(|a, b| (a.provider, &a.model_name).cmp(&(b.provider, &b.model_name)));
        out
    }

    /// Snapshots of pairs changed since the previous call.
    pub fn take_dirty(&self) -> Vec<HealthSnapshot> {
        self.pairs
            .iter()
            .filter_map(|entry| {
                let mut inner = entry.value().lock();
                if !inner.dirty {
                    return None;
                }
                inner.dirty = false;
                Some(self.snapshot_of(entry.key(), &mut inner))
            })
            .collect()
    }
}

/// Periodically persist changed health snapshots.
pub fn spawn_flush(tracker: Arc<HealthTracker>, pool: SqlitePool, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for snapshot in tracker.take_dirty() {
                if let Err(e) = storage::health::upsert(&pool, &snapshot).await {
                    tracing::warn!(
                        provider = %snapshot.provider,
                        model = %snapshot.model_name,
                        error = %e,
                        "Failed to persist health snapshot"
                    );
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const INTERVAL: Duration = Duration::from_secs(60);

    fn tracker() -> HealthTracker {
        HealthTracker::new(HealthSettings {
            success_threshold: 0.5,
            burst_threshold: 5,
            smoothing: 0.2,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_pair_is_healthy() {
        let t = tracker();
        assert!(t.is_healthy(Provider::OpenAi, "gpt-x", INTERVAL));
        assert!(t.snapshot(Provider::OpenAi, "gpt-x").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_success_converges_to_one() {
        let t = tracker();
        t.record(Provider::OpenAi, "gpt-x", false, 100, Some("boom"));
        t.record(Provider::OpenAi, "gpt-x", false, 100, Some("boom"));

        let mut previous = t.success_rate(Provider::OpenAi, "gpt-x").unwrap();
        for _ in 0..50 {
            t.record(Provider::OpenAi, "gpt-x", true, 100, None);
            let rate = t.success_rate(Provider::OpenAi, "gpt-x").unwrap();
            assert!(rate >= previous, "rate must not decrease on success");
            assert!((0.0..=1.0).contains(&rate));
            previous = rate;
        }
        assert!(previous > 0.99);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failure_stays_non_negative() {
        let t = tracker();
        for _ in 0..100 {
            t.record(Provider::Google, "gemini", false, 10, Some("5xx"));
        }
        let rate = t.success_rate(Provider::Google, "gemini").unwrap();
        assert!(rate >= 0.0 && rate < 0.01);
        assert!(!t.is_healthy(Provider::Google, "gemini", INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_low_success_rate_is_unhealthy() {
        let t = tracker();
        // 1.0 -> 0.8 -> 0.64 -> 0.512 -> 0.4096
        for _ in 0..3 {
            t.record(Provider::Anthropic, "claude", false, 10, None);
        }
        assert!(t.is_healthy(Provider::Anthropic, "claude", INTERVAL));
        t.record(Provider::Anthropic, "claude", false, 10, None);
        assert!(!t.is_healthy(Provider::Anthropic, "claude", INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_within_interval_is_unhealthy() {
        let t = HealthTracker::new(HealthSettings {
            success_threshold: 0.0,
            burst_threshold: 2,
            smoothing: 0.2,
        });
        for _ in 0..2 {
            t.record(Provider::Cohere, "command", false, 10, None);
        }
        assert!(t.is_healthy(Provider::Cohere, "command", INTERVAL));
        t.record(Provider::Cohere, "command", false, 10, None);
        assert!(!t.is_healthy(Provider::Cohere, "command", INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_spread_out_failures_do_not_burst() {
        let t = HealthTracker::new(HealthSettings {
            success_threshold: 0.0,
            burst_threshold: 2,
            smoothing: 0.2,
        });
        t.is_healthy(Provider::Cohere, "command", INTERVAL);
        for _ in 0..3 {
            t.record(Provider::Cohere, "command", false, 10, None);
            t.record(Provider::Cohere, "command", true, 10, None);
            tokio::time::advance(Duration::from_secs(40)).await;
        }
        assert!(t.is_healthy(Provider::Cohere, "command", INTERVAL));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_resets_to_neutral() {
        let t = tracker();
        for _ in 0..10 {
            t.record(Provider::OpenAi, "gpt-x", false, 10, Some("down"));
        }
        assert!(!t.is_healthy(Provider::OpenAi, "gpt-x", INTERVAL));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(!t.is_healthy(Provider::OpenAi, "gpt-x", INTERVAL));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(t.is_healthy(Provider::OpenAi, "gpt-x", INTERVAL));
        assert_eq!(t.success_rate(Provider::OpenAi, "gpt-x"), Some(1.0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_average_and_snapshot() {
        let t = tracker();
        t.record(Provider::OpenAi, "gpt-x", true, 100, None);
        t.record(Provider::OpenAi, "gpt-x", true, 200, None);
        t.record(Provider::OpenAi, "gpt-x", false, 100, Some("timeout"));

        let snap = t.snapshot(Provider::OpenAi, "gpt-x").unwrap();
        // 100 -> 120 -> 116
        assert!((snap.response_time_avg - 116.0).abs() < 1e-9);
        assert_eq!(snap.error_count, 1);
        assert_eq!(snap.last_error.as_deref(), Some("timeout"));
        assert_eq!(snap.status, HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_take_dirty_only_returns_changes() {
        let t = tracker();
        t.record(Provider::OpenAi, "a", true, 1, None);
        t.record(Provider::Anthropic, "b", true, 1, None);
        assert_eq!(t.take_dirty().len(), 2);
        assert!(t.take_dirty().is_empty());

        t.record(Provider::OpenAi, "a", true, 1, None);
        let dirty = t.take_dirty();
        assert_eq!(dirty.len(), 1);
        assert_eq!(dirty[0].model_name, "a");
        assert_eq!(t.snapshots().len(), 2);
    }
}
