//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::body::Body;
use http::{Request, StatusCode};
use secrecy::SecretString;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use tower::ServiceExt;

use keyrelay::config::Config;
use keyrelay::crypto::KeyVault;
use keyrelay::health::{HealthSettings, HealthTracker};
use keyrelay::ledger::{Pricing, UsageLedger};
use keyrelay::pool::{KeyPool, KeySettings, PooledKey};
use keyrelay::proxy::AppState;
use keyrelay::router::{BalancerConfig, BalancerConfigs, Gateway, LoadBalancer};
use keyrelay::types::{KeyStatus, Provider};

pub const MODEL: &str = "gpt-x";

/// Migrated in-memory database on a single connection, so every query
/// sees the same data.
pub async fn memory_db() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn pooled_key(id: i64, provider: Provider) -> PooledKey {
    PooledKey {
        id,
        donor_user_id: None,
        provider,
        nickname: None,
        secret: SecretString::from(format!("sk-test-{}-{}", provider, id)),
        monthly_limit: None,
        usage_this_month: 0.0,
        total_usage: 0.0,
        requests_this_month: 0,
        status: KeyStatus::Active,
        cooldown_until: None,
        last_used: None,
    }
}

/// `gpt-x` split 70/30 between openai and anthropic.
pub fn gpt_x_config() -> BalancerConfig {
    BalancerConfig {
        model_name: MODEL.to_string(),
        provider_weights: BTreeMap::from([(Provider::OpenAi, 0.7), (Provider::Anthropic, 0.3)]),
        fallback_order: vec![Provider::OpenAi, Provider::Anthropic],
        enabled: true,
        min_healthy_keys: 1,
        health_check_interval_secs: 300,
    }
}

/// Gateway over `pool` with the `gpt-x` config and a fresh tracker.
pub fn gateway(pool: KeyPool, db: SqlitePool) -> Gateway {
    let configs = Arc::new(BalancerConfigs::from_configs([gpt_x_config()]));
    let health = Arc::new(HealthTracker::new(HealthSettings::default()));
    let balancer = LoadBalancer::new(configs, pool, health, None);
    Gateway::new(Arc::new(balancer), UsageLedger::new(db, Pricing::new()))
}

pub fn pool_with(keys: impl IntoIterator<Item = PooledKey>, settings: KeySettings) -> KeyPool {
    let pool = KeyPool::new(settings);
    for key in keys {
        pool.insert(key);
    }
    pool
}

/// Application state whose `openai` and `anthropic` endpoints point at
/// `upstream` (a wiremock server URI) under `/openai` and `/anthropic`.
/// Donated keys are accepted without a test request.
pub async fn app_state(upstream: &str, extra_toml: &str) -> AppState {
    build_state(upstream, extra_toml, false).await
}

/// Like [`app_state`], but donations are validated against `upstream`.
pub async fn validating_app_state(upstream: &str, extra_toml: &str) -> AppState {
    build_state(upstream, extra_toml, true).await
}

async fn build_state(upstream: &str, extra_toml: &str, validate_on_donate: bool) -> AppState {
    let toml = format!(
        r#"
[server]
listen = "127.0.0.1:0"

[routing]
max_failovers = 2

[[providers]]
name = "openai"
url = "{upstream}/openai"
timeout_secs = 5
input_cost_per_1k = 0.001
output_cost_per_1k = 0.002

[[providers]]
name = "anthropic"
url = "{upstream}/anthropic"
timeout_secs = 5
input_cost_per_1k = 0.003
output_cost_per_1k = 0.015

{extra_toml}
"#
    );
    let mut config = Config::parse_str(&toml).unwrap();
    config.pool.validate_on_donate = validate_on_donate;
    AppState::build(config, memory_db().await, KeyVault::new("test-passphrase"))
        .await
        .unwrap()
}

/// Send a request and return status plus parsed JSON body (Null when empty).
pub async fn send(
    app: &axum::Router,
    request: Request<Body>,
) -> (StatusCode, http::HeaderMap, serde_json::Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
    };
    (status, headers, body)
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Donate `api_key` for `provider` through the API, returning the key id.
pub async fn donate(
    app: &axum::Router,
    provider: &str,
    api_key: &str,
    user: Option<i64>,
    monthly_limit: Option<f64>,
) -> i64 {
    let mut request = json_request(
        "POST",
        "/v1/keys",
        serde_json::json!({
            "provider": provider,
            "api_key": api_key,
            "monthly_limit": monthly_limit,
        }),
    );
    if let Some(user) = user {
        request
            .headers_mut()
            .insert("x-keyrelay-user", user.to_string().parse().unwrap());
    }
    let (status, _, body) = send(app, request).await;
    assert_eq!(status, StatusCode::CREATED, "donation failed: {}", body);
    body["id"].as_i64().unwrap()
}

/// Install the `gpt-x` balancer config through the API.
pub async fn put_gpt_x(app: &axum::Router, weights: serde_json::Value, fallback: &[&str]) {
    let (status, _, body) = send(
        app,
        json_request(
            "PUT",
            "/v1/balancer/gpt-x",
            serde_json::json!({
                "provider_weights": weights,
                "fallback_order": fallback,
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "balancer put failed: {}", body);
}

/// A minimal OpenAI-style completion body.
pub fn completion_body(prompt_tokens: u32, completion_tokens: u32) -> serde_json::Value {
    serde_json::json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": MODEL,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": "hello"},
            "finish_reason": "stop"
        }],
        "usage": {
            "prompt_tokens": prompt_tokens,
            "completion_tokens": completion_tokens,
            "total_tokens": prompt_tokens + completion_tokens
        }
    })
}

pub fn chat_request(user: Option<i64>) -> Request<Body> {
    let mut request = json_request(
        "POST",
        "/v1/chat/completions",
        serde_json::json!({
            "model": MODEL,
            "messages": [{"role": "user", "content": "hi"}]
        }),
    );
    if let Some(user) = user {
        request
            .headers_mut()
            .insert("x-keyrelay-user", user.to_string().parse().unwrap());
    }
    request
}
