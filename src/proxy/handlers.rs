//! Chat completion proxy, model listing and health.

use axum::{
    extract::State,
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::time::Instant;

use super::retry::{classify_status, format_retries_header, should_failover, AttemptRecord};
use super::server::AppState;
use super::types::{extract_usage, ChatCompletionRequest};
use crate::error::Error;
use crate::router::{CallLabels, CallStatus, CompletionOutcome, ProviderSelection};
use crate::types::{HealthStatus, Provider, UserAccess};

/// Request header: numeric id of the calling user.
pub const KEYRELAY_USER_HEADER: &str = "x-keyrelay-user";
/// Request header: opaque session id stored with each request record.
pub const KEYRELAY_SESSION_HEADER: &str = "x-keyrelay-session";

/// Response header: request id (UUID v4), shared by every attempt's record.
pub const KEYRELAY_REQUEST_ID_HEADER: &str = "x-keyrelay-request-id";
/// Response header: provider that produced the response.
pub const KEYRELAY_PROVIDER_HEADER: &str = "x-keyrelay-provider";
/// Response header: cost charged in USD, six decimals.
pub const KEYRELAY_COST_USD_HEADER: &str = "x-keyrelay-cost-usd";
/// Response header: wall-clock latency in milliseconds.
pub const KEYRELAY_LATENCY_MS_HEADER: &str = "x-keyrelay-latency-ms";
/// Response header: failed attempts per provider, e.g. `2/openai, 1/anthropic`.
pub const KEYRELAY_RETRIES_HEADER: &str = "x-keyrelay-retries";

/// Longest upstream error body kept in a request record.
const MAX_ERROR_MESSAGE_LEN: usize = 500;

struct RequestOutcome {
    response: Response,
    provider: Provider,
    cost_usd: Option<f64>,
    attempts: Vec<AttemptRecord>,
}

struct RequestError {
    error: Error,
    provider: Option<Provider>,
    attempts: Vec<AttemptRecord>,
}

impl RequestError {
    fn early(error: Error) -> Self {
        Self {
            error,
            provider: None,
            attempts: Vec::new(),
        }
    }
}

/// Per-request fields copied onto every attempt's record.
struct CallContext {
    request_id: String,
    session_id: Option<String>,
    user_agent: Option<String>,
}

impl CallContext {
    fn stamp(&self, mut outcome: CompletionOutcome) -> CompletionOutcome {
        outcome.request_id = self.request_id.clone();
        outcome.session_id = self.session_id.clone();
        outcome.user_agent = self.user_agent.clone();
        outcome
    }

    fn labels(&self) -> CallLabels {
        CallLabels {
            request_id: self.request_id.clone(),
            session_id: self.session_id.clone(),
            user_agent: self.user_agent.clone(),
        }
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Parse the caller's user id from `x-keyrelay-user`.
pub(super) fn user_from_headers(headers: &HeaderMap) -> Result<Option<i64>, Error> {
    header_str(headers, KEYRELAY_USER_HEADER)
        .map(|raw| {
            raw.parse::<i64>().map_err(|_| {
                Error::BadRequest(format!("{} must be a numeric user id", KEYRELAY_USER_HEADER))
            })
        })
        .transpose()
}

fn truncate(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

/// Attach keyrelay metadata headers to a response.
fn attach_keyrelay_headers(
    response: &mut Response,
    request_id: &str,
    latency_ms: u64,
    provider: Option<Provider>,
    cost_usd: Option<f64>,
    attempts: &[AttemptRecord],
) {
    let headers = response.headers_mut();
    insert_header(headers, KEYRELAY_REQUEST_ID_HEADER, request_id);
    headers.insert(
        HeaderName::from_static(KEYRELAY_LATENCY_MS_HEADER),
        HeaderValue::from(latency_ms),
    );
    if let Some(provider) = provider {
        headers.insert(
            HeaderName::from_static(KEYRELAY_PROVIDER_HEADER),
            HeaderValue::from_static(provider.as_str()),
        );
    }
    if let Some(cost) = cost_usd {
        insert_header(headers, KEYRELAY_COST_USD_HEADER, &format!("{:.6}", cost));
    }
    if let Some(retries) = format_retries_header(attempts) {
        insert_header(headers, KEYRELAY_RETRIES_HEADER, &retries);
    }
}

/// Handle POST /v1/chat/completions
pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<ChatCompletionRequest>,
) -> Result<Response, Error> {
    let start = Instant::now();
    let context = CallContext {
        request_id: uuid::Uuid::new_v4().to_string(),
        session_id: header_str(&headers, KEYRELAY_SESSION_HEADER).map(str::to_string),
        user_agent: header_str(&headers, header::USER_AGENT.as_str()).map(str::to_string),
    };

    if state.config.logging.log_requests {
        tracing::info!(
            model = %request.model,
            request_id = %context.request_id,
            "Received chat completion request"
        );
    }

    let result = execute_request(&state, &request, &headers, &context).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            let mut response = outcome.response;
            attach_keyrelay_headers(
                &mut response,
                &context.request_id,
                latency_ms,
                Some(outcome.provider),
                outcome.cost_usd,
                &outcome.attempts,
            );
            Ok(response)
        }
        Err(failure) => {
            tracing::warn!(
                model = %request.model,
                request_id = %context.request_id,
                error = %failure.error,
                "Chat completion failed"
            );
            let mut response = failure.error.into_response();
            attach_keyrelay_headers(
                &mut response,
                &context.request_id,
                latency_ms,
                failure.provider,
                None,
                &failure.attempts,
            );
            Ok(response)
        }
    }
}

/// Route, forward and fail over until a provider answers or the attempt
/// budget runs out. Every selection is completed exactly once.
async fn execute_request(
    state: &AppState,
    request: &ChatCompletionRequest,
    headers: &HeaderMap,
    context: &CallContext,
) -> Result<RequestOutcome, RequestError> {
    if request.is_streaming() {
        return Err(RequestError::early(Error::BadRequest(
            "streaming responses are not supported".to_string(),
        )));
    }

    let user = match user_from_headers(headers).map_err(RequestError::early)? {
        Some(user_id) => state
            .ledger()
            .check_quota(user_id)
            .await
            .map_err(RequestError::early)?,
        None => UserAccess::anonymous(),
    };

    let max_attempts = 1 + state.config.routing.max_failovers as usize;
    let mut attempts: Vec<AttemptRecord> = Vec::new();
    let mut excluded: Vec<Provider> = Vec::new();
    let mut last_error: Option<(Error, Provider)> = None;

    for _ in 0..max_attempts {
        let mut selection = match state
            .gateway
            .route_excluding(&request.model, &user, &excluded)
        {
            Ok(selection) => selection,
            Err(route_error) => {
                let (error, provider) = match last_error {
                    Some((error, provider)) => (error, Some(provider)),
                    None => (route_error, None),
                };
                return Err(RequestError {
                    error,
                    provider,
                    attempts,
                });
            }
        };
        let provider = selection.provider();
        selection.label(context.labels());

        tracing::info!(
            provider = %provider,
            model = %request.model,
            key_id = ?selection.key_id(),
            degraded = selection.is_degraded(),
            "Selected provider"
        );

        match forward(state, request, selection, context).await {
            Forwarded::Answered { response, cost_usd } => {
                return Ok(RequestOutcome {
                    response,
                    provider,
                    cost_usd,
                    attempts,
                });
            }
            Forwarded::Retry {
                status,
                status_code,
                error,
            } => {
                attempts.push(AttemptRecord {
                    provider,
                    status_code,
                });
                // A throttled key is parked by the pool; its provider may still
                // have other keys.
                if !matches!(status, CallStatus::Throttled { .. }) {
                    excluded.push(provider);
                }
                last_error = Some((error, provider));
            }
            Forwarded::Abort(error) => {
                return Err(RequestError {
                    error,
                    provider: Some(provider),
                    attempts,
                });
            }
        }
    }

    let (error, provider) = match last_error {
        Some((error, provider)) => (error, Some(provider)),
        None => (
            Error::AllProvidersExhausted {
                model: request.model.clone(),
            },
            None,
        ),
    };
    Err(RequestError {
        error,
        provider,
        attempts,
    })
}

enum Forwarded {
    /// The provider's answer is final, successful or not.
    Answered {
        response: Response,
        cost_usd: Option<f64>,
    },
    /// Try another candidate.
    Retry {
        status: CallStatus,
        status_code: u16,
        error: Error,
    },
    Abort(Error),
}

/// One upstream attempt. Consumes the selection by completing it.
async fn forward(
    state: &AppState,
    request: &ChatCompletionRequest,
    selection: ProviderSelection,
    context: &CallContext,
) -> Forwarded {
    let provider = selection.provider();
    let Some(endpoint) = state.endpoint(provider) else {
        let outcome = CompletionOutcome::failure(
            CallStatus::Refused,
            0,
            "no_endpoint",
            format!("no endpoint configured for {}", provider),
        );
        state.gateway.complete(selection, context.stamp(outcome)).await;
        return Forwarded::Abort(Error::Internal(format!(
            "No endpoint configured for provider '{}'",
            provider
        )));
    };

    let call_start = Instant::now();
    let sent = state
        .http_client
        .post(endpoint.chat_completions_url())
        .header(header::CONTENT_TYPE, "application/json")
        .bearer_auth(selection.api_key())
        .timeout(endpoint.timeout)
        .json(request)
        .send()
        .await;

    let upstream = match sent {
        Ok(upstream) => upstream,
        Err(e) => {
            let latency_ms = call_start.elapsed().as_millis() as u64;
            let (code, status_code) = if e.is_timeout() {
                ("timeout", 504)
            } else {
                ("network_error", 502)
            };
            tracing::error!(error = %e, provider = %provider, "Failed to reach provider");
            let outcome = CompletionOutcome::failure(CallStatus::Failed, latency_ms, code, e.to_string());
            state.gateway.complete(selection, context.stamp(outcome)).await;
            return Forwarded::Retry {
                status: CallStatus::Failed,
                status_code,
                error: Error::Upstream(format!("Failed to reach provider '{}': {}", provider, e)),
            };
        }
    };

    let status = upstream.status();
    if status.is_success() {
        let parsed = upstream.json::<serde_json::Value>().await;
        let latency_ms = call_start.elapsed().as_millis() as u64;
        let mut body = match parsed {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, provider = %provider, "Unreadable provider response");
                let outcome = CompletionOutcome::failure(
                    CallStatus::Failed,
                    latency_ms,
                    "invalid_response",
                    e.to_string(),
                );
                state.gateway.complete(selection, context.stamp(outcome)).await;
                return Forwarded::Retry {
                    status: CallStatus::Failed,
                    status_code: 502,
                    error: Error::Upstream(format!(
                        "Unreadable response from provider '{}'",
                        provider
                    )),
                };
            }
        };

        let (input_tokens, output_tokens) = match extract_usage(&body) {
            Some(usage) => (usage.prompt_tokens, usage.completion_tokens),
            None => {
                tracing::warn!(provider = %provider, "Provider response has no usage");
                (0, 0)
            }
        };
        let outcome = CompletionOutcome::success(input_tokens, output_tokens, latency_ms);
        let receipt = state.gateway.complete(selection, context.stamp(outcome)).await;

        if let Some(object) = body.as_object_mut() {
            object.insert(
                "keyrelay_provider".to_string(),
                serde_json::Value::String(provider.to_string()),
            );
        }
        tracing::info!(
            provider = %provider,
            input_tokens,
            output_tokens,
            cost_usd = receipt.cost_usd,
            latency_ms,
            "Request completed"
        );
        return Forwarded::Answered {
            response: Json(body).into_response(),
            cost_usd: Some(receipt.cost_usd),
        };
    }

    let upstream_headers = upstream.headers().clone();
    let body = upstream.text().await.unwrap_or_default();
    let latency_ms = call_start.elapsed().as_millis() as u64;
    let call_status = classify_status(status.as_u16(), &upstream_headers);
    tracing::warn!(
        provider = %provider,
        status = %status,
        outcome = ?call_status,
        "Provider returned error"
    );

    let outcome = CompletionOutcome::failure(
        call_status,
        latency_ms,
        status.as_u16().to_string(),
        truncate(body.clone(), MAX_ERROR_MESSAGE_LEN),
    );
    state.gateway.complete(selection, context.stamp(outcome)).await;

    if should_failover(call_status) {
        return Forwarded::Retry {
            status: call_status,
            status_code: status.as_u16(),
            error: Error::Upstream(format!("Provider '{}' returned {}", provider, status)),
        };
    }

    // The request itself was refused; relay the provider's answer.
    let status = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
    let response = (status, [(header::CONTENT_TYPE, "application/json")], body).into_response();
    Forwarded::Answered {
        response,
        cost_usd: None,
    }
}

/// Handle GET /v1/models: enabled models and the providers that could
/// serve them right now.
pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    let balancer = state.gateway.balancer();
    let routing_view = UserAccess {
        user_id: None,
        priority_level: u8::MAX,
    };

    let models: Vec<serde_json::Value> = state
        .configs()
        .list()
        .iter()
        .filter(|config| config.enabled)
        .map(|config| {
            let providers = balancer.routable_providers(config, &routing_view);
            serde_json::json!({
                "id": config.model_name,
                "object": "model",
                "owned_by": "keyrelay",
                "providers": providers,
            })
        })
        .collect();

    Json(serde_json::json!({
        "object": "list",
        "data": models
    }))
}

/// Overall status from per-pair health.
pub(crate) fn overall_status(healthy: usize, degraded: usize, down: usize) -> &'static str {
    let total = healthy + degraded + down;
    if total == 0 {
        return "healthy";
    }
    if down as f64 > total as f64 * 0.5 {
        "down"
    } else if degraded as f64 > total as f64 * 0.3 {
        "degraded"
    } else {
        "healthy"
    }
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let snapshots = state.health().snapshots();
    let count = |status: HealthStatus| snapshots.iter().filter(|s| s.status == status).count();
    let (healthy, degraded, down) = (
        count(HealthStatus::Healthy),
        count(HealthStatus::Degraded),
        count(HealthStatus::Down),
    );

    let keys = state.pool().snapshots();
    let active_keys = keys
        .iter()
        .filter(|k| k.status == crate::types::KeyStatus::Active)
        .count();

    let model_health: Vec<serde_json::Value> = snapshots
        .iter()
        .map(|s| {
            serde_json::json!({
                "provider": s.provider,
                "model_name": s.model_name,
                "status": s.status.as_str(),
                "success_rate": s.success_rate,
                "response_time_avg": s.response_time_avg,
                "error_count": s.error_count,
                "last_error": s.last_error,
                "last_check": s.last_check,
            })
        })
        .collect();

    Json(serde_json::json!({
        "status": overall_status(healthy, degraded, down),
        "service": "keyrelay",
        "total_models": snapshots.len(),
        "healthy_models": healthy,
        "degraded_models": degraded,
        "down_models": down,
        "keys": {
            "total": keys.len(),
            "active": active_keys,
        },
        "model_health": model_health,
    }))
}
