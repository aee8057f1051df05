//! One-token test requests.
//!
//! Donated keys are tried once before they are stored, and `POST
//! /health/check` (or the optional background task) sends a test request
//! for every routed (provider, model) pair with the provider's active keys.

use axum::{extract::State, http::header, Json};
use secrecy::ExposeSecret;
use serde::Serialize;
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::retry::classify_status;
use super::server::{AppState, ProviderEndpoint};
use crate::error::{Error, Result};
use crate::router::CallStatus;
use crate::storage::{self, keys::KeyUpdate};
use crate::types::{KeyStatus, Provider};

/// What one test request came back with.
#[derive(Debug, Clone)]
pub struct TestCall {
    pub status: CallStatus,
    pub latency_ms: u64,
    pub error: Option<String>,
}

/// Send a chat completion capped at a single output token.
pub async fn send_test_request(
    client: &reqwest::Client,
    endpoint: &ProviderEndpoint,
    api_key: &str,
    model: &str,
) -> TestCall {
    let body = serde_json::json!({
        "model": model,
        "messages": [{"role": "user", "content": "ping"}],
        "max_tokens": 1,
    });

    let started = Instant::now();
    let sent = client
        .post(endpoint.chat_completions_url())
        .header(header::CONTENT_TYPE, "application/json")
        .bearer_auth(api_key)
        .timeout(endpoint.timeout)
        .json(&body)
        .send()
        .await;
    let latency_ms = started.elapsed().as_millis() as u64;

    match sent {
        Ok(response) if response.status().is_success() => TestCall {
            status: CallStatus::Success,
            latency_ms,
            error: None,
        },
        Ok(response) => {
            let code = response.status().as_u16();
            TestCall {
                status: classify_status(code, response.headers()),
                latency_ms,
                error: Some(format!("HTTP {}", code)),
            }
        }
        Err(e) => TestCall {
            status: CallStatus::Failed,
            latency_ms,
            error: Some(e.to_string()),
        },
    }
}

/// Try a donated key against its provider before accepting it.
///
/// Only a credential rejection refuses the donation. A throttled key or a
/// refused request still proves the key authenticates.
pub async fn validate_key(state: &AppState, provider: Provider, api_key: &str) -> Result<()> {
    let endpoint = state.endpoint(provider).ok_or_else(|| {
        Error::BadRequest(format!("No endpoint configured for provider '{}'", provider))
    })?;
    let call = send_test_request(&state.http_client, endpoint, api_key, provider.check_model()).await;

    match call.status {
        CallStatus::Rejected => {
            tracing::info!(provider = %provider, "Donated key rejected by provider");
            Err(Error::BadRequest(format!(
                "API key was rejected by {}",
                provider
            )))
        }
        CallStatus::Failed => Err(Error::Upstream(format!(
            "could not validate key with {}: {}",
            provider,
            call.error.unwrap_or_default()
        ))),
        CallStatus::Success | CallStatus::Throttled { .. } | CallStatus::Refused => Ok(()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    Healthy,
    Unhealthy,
    /// Every active key was throttled or rejected, or none exist.
    NoKey,
}

/// Result for one (provider, model) pair.
#[derive(Debug, Clone, Serialize)]
pub struct PairCheck {
    pub provider: Provider,
    pub model_name: String,
    pub key_id: Option<i64>,
    pub outcome: CheckOutcome,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckReport {
    pub checked: usize,
    pub healthy: usize,
    /// Keys moved to `error` because the provider rejected them.
    pub keys_disabled: Vec<i64>,
    pub results: Vec<PairCheck>,
}

/// Send one test request per routed pair and feed the health tracker.
///
/// Pairs come from enabled balancer configs whose fallback providers have
/// an endpoint. Keys are tried lowest id first until one gets an answer
/// about the model; rejected keys are disabled along the way.
pub async fn check_health(state: &AppState) -> HealthCheckReport {
    let pairs: BTreeSet<(Provider, String)> = state
        .configs()
        .list()
        .iter()
        .filter(|config| config.enabled)
        .flat_map(|config| {
            config
                .fallback_order
                .iter()
                .map(|provider| (*provider, config.model_name.clone()))
                .collect::<Vec<_>>()
        })
        .filter(|(provider, _)| state.endpoint(*provider).is_some())
        .collect();

    let mut keys_disabled = Vec::new();
    let mut results = Vec::with_capacity(pairs.len());
    for (provider, model) in pairs {
        results.push(check_pair(state, provider, &model, &mut keys_disabled).await);
    }

    let healthy = results
        .iter()
        .filter(|r| r.outcome == CheckOutcome::Healthy)
        .count();
    tracing::info!(
        checked = results.len(),
        healthy,
        keys_disabled = keys_disabled.len(),
        "Health check finished"
    );

    HealthCheckReport {
        checked: results.len(),
        healthy,
        keys_disabled,
        results,
    }
}

async fn check_pair(
    state: &AppState,
    provider: Provider,
    model: &str,
    keys_disabled: &mut Vec<i64>,
) -> PairCheck {
    let mut result = PairCheck {
        provider,
        model_name: model.to_string(),
        key_id: None,
        outcome: CheckOutcome::NoKey,
        latency_ms: None,
        error: Some("no active key".to_string()),
    };
    let Some(endpoint) = state.endpoint(provider) else {
        return result;
    };

    for (key_id, secret) in state.pool().active_credentials(provider) {
        if keys_disabled.contains(&key_id) {
            continue;
        }
        let call =
            send_test_request(&state.http_client, endpoint, secret.expose_secret(), model).await;
        result.key_id = Some(key_id);
        result.latency_ms = Some(call.latency_ms);
        result.error = call.error.clone();

        match call.status {
            CallStatus::Success | CallStatus::Refused => {
                state
                    .health()
                    .record(provider, model, true, call.latency_ms, None);
                result.outcome = CheckOutcome::Healthy;
                return result;
            }
            CallStatus::Failed => {
                state.health().record(
                    provider,
                    model,
                    false,
                    call.latency_ms,
                    call.error.as_deref(),
                );
                result.outcome = CheckOutcome::Unhealthy;
                return result;
            }
            CallStatus::Rejected => {
                disable_key(state, provider, key_id).await;
                keys_disabled.push(key_id);
            }
            CallStatus::Throttled { .. } => {}
        }
    }
    result
}

async fn disable_key(state: &AppState, provider: Provider, key_id: i64) {
    let update = KeyUpdate {
        status: Some(KeyStatus::Error),
        ..KeyUpdate::default()
    };
    if let Err(e) = storage::keys::update(&state.db, key_id, &update).await {
        tracing::warn!(key_id, error = %e, "Failed to store disabled key status");
    }
    if let Err(e) = state.pool().set_status(key_id, KeyStatus::Error) {
        tracing::warn!(key_id, error = %e, "Key left the pool during health check");
    }
    tracing::warn!(key_id, provider = %provider, "Provider rejected key; disabled");
}

/// Handle POST /health/check
pub async fn run_health_check(State(state): State<AppState>) -> Json<HealthCheckReport> {
    Json(check_health(&state).await)
}

/// Run [`check_health`] every `period`, starting one period after launch.
pub fn spawn_health_checks(state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            check_health(&state).await;
        }
    })
}
