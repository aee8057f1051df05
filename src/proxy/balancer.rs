//! Per-model load balancer configuration endpoints.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use super::server::AppState;
use super::types::BalancerConfigBody;
use crate::error::Error;
use crate::router::BalancerConfig;
use crate::storage;

/// Handle GET /v1/balancer
pub async fn list_configs(State(state): State<AppState>) -> Json<Vec<BalancerConfig>> {
    let configs = state
        .configs()
        .list()
        .iter()
        .map(|config| (**config).clone())
        .collect();
    Json(configs)
}

/// Handle PUT /v1/balancer/:model
///
/// Creates or replaces the model's config. Takes effect on the next route.
pub async fn put_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
    Json(body): Json<BalancerConfigBody>,
) -> Result<Json<BalancerConfig>, Error> {
    let config = body.into_config(model);
    config.validate().map_err(Error::BadRequest)?;

    let keyless: Vec<String> = config
        .fallback_order
        .iter()
        .filter(|p| !state.pool().has_keys(**p))
        .map(|p| p.to_string())
        .collect();
    if !keyless.is_empty() {
        return Err(Error::BadRequest(format!(
            "No keys pooled for provider(s): {}",
            keyless.join(", ")
        )));
    }

    storage::balancer::upsert(&state.db, &config).await?;
    state.configs().upsert(config.clone());
    tracing::info!(
        model = %config.model_name,
        providers = config.fallback_order.len(),
        enabled = config.enabled,
        "Balancer config saved"
    );
    Ok(Json(config))
}

/// Handle DELETE /v1/balancer/:model
pub async fn delete_config(
    State(state): State<AppState>,
    Path(model): Path<String>,
) -> Result<StatusCode, Error> {
    let stored = storage::balancer::delete(&state.db, &model).await?;
    let live = state.configs().remove(&model);
    if !stored && !live {
        return Err(Error::NotFound(format!("balancer config for '{}'", model)));
    }
    tracing::info!(model = %model, "Balancer config removed");
    Ok(StatusCode::NO_CONTENT)
}
