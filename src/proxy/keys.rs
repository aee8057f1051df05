//! Key donation and management endpoints.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use secrecy::SecretString;
use serde::Deserialize;

use super::checks::validate_key;
use super::handlers::user_from_headers;
use super::server::{fresh_key, AppState};
use super::types::{DonateKeyRequest, UpdateKeyRequest};
use crate::crypto::key_hash;
use crate::error::Error;
use crate::pool::KeySnapshot;
use crate::storage::{self, contributions, keys::KeyUpdate, keys::NewKey};
use crate::types::{KeyStatus, Provider};

fn validate_limit(limit: Option<f64>) -> Result<(), Error> {
    match limit {
        Some(limit) if !limit.is_finite() || limit < 0.0 => Err(Error::BadRequest(
            "monthly_limit must be a non-negative number".to_string(),
        )),
        _ => Ok(()),
    }
}

/// Handle POST /v1/keys
///
/// With `pool.validate_on_donate`, the key must first survive a one-token
/// request to its provider. It is then stored encrypted and added to the
/// live pool; identified donors who set a monthly limit are credited.
pub async fn donate_key(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DonateKeyRequest>,
) -> Result<(StatusCode, Json<KeySnapshot>), Error> {
    let donor = user_from_headers(&headers)?;
    let raw_key = body.api_key.trim().to_string();
    if raw_key.is_empty() {
        return Err(Error::BadRequest("api_key must not be empty".to_string()));
    }
    validate_limit(body.monthly_limit)?;
    if state.endpoint(body.provider).is_none() {
        return Err(Error::BadRequest(format!(
            "No endpoint configured for provider '{}'",
            body.provider
        )));
    }

    let hash = key_hash(&raw_key);
    if storage::keys::find_id_by_hash(&state.db, &hash).await?.is_some() {
        return Err(Error::DuplicateKey);
    }
    if state.config.pool.validate_on_donate {
        validate_key(&state, body.provider, &raw_key).await?;
    }

    let new_key = NewKey {
        donor_user_id: donor,
        provider: body.provider,
        key_hash: hash,
        encrypted_key: state.vault.encrypt(&raw_key)?,
        nickname: body.nickname.clone(),
        monthly_limit: body.monthly_limit,
    };
    let donation = body.monthly_limit.unwrap_or(0.0);

    let key_id = storage::in_transaction(&state.db, move |conn| {
        Box::pin(async move {
            let key_id = new_key.insert(&mut *conn).await?;
            if let (Some(user_id), true) = (donor, donation > 0.0) {
                contributions::record_donation(&mut *conn, user_id, donation).await?;
            }
            Ok::<i64, Error>(key_id)
        })
    })
    .await?;

    state.pool().insert(fresh_key(
        key_id,
        donor,
        body.provider,
        body.nickname,
        SecretString::from(raw_key),
        body.monthly_limit,
    ));
    tracing::info!(
        key_id,
        provider = %body.provider,
        donor = ?donor,
        "API key donated"
    );

    Ok((StatusCode::CREATED, Json(state.pool().snapshot(key_id)?)))
}

#[derive(Debug, Deserialize)]
pub struct KeyFilter {
    pub user_id: Option<i64>,
    pub provider: Option<Provider>,
}

/// Handle GET /v1/keys
pub async fn list_keys(
    State(state): State<AppState>,
    Query(filter): Query<KeyFilter>,
) -> Json<Vec<KeySnapshot>> {
    let keys = state
        .pool()
        .snapshots()
        .into_iter()
        .filter(|k| filter.user_id.map_or(true, |u| k.donor_user_id == Some(u)))
        .filter(|k| filter.provider.map_or(true, |p| k.provider == p))
        .collect();
    Json(keys)
}

/// A caller identified by header may only touch keys they donated.
fn check_owner(state: &AppState, headers: &HeaderMap, key_id: i64) -> Result<(), Error> {
    let not_found = || Error::NotFound(format!("API key {}", key_id));
    let snapshot = state.pool().snapshot(key_id).map_err(|_| not_found())?;
    match user_from_headers(headers)? {
        Some(user_id) if snapshot.donor_user_id != Some(user_id) => Err(not_found()),
        _ => Ok(()),
    }
}

/// Handle PATCH /v1/keys/:id
pub async fn update_key(
    State(state): State<AppState>,
    Path(key_id): Path<i64>,
    headers: HeaderMap,
    Json(body): Json<UpdateKeyRequest>,
) -> Result<Json<KeySnapshot>, Error> {
    validate_limit(body.monthly_limit.flatten())?;
    if let Some(status) = body.status {
        if !matches!(
            status,
            KeyStatus::Active | KeyStatus::Inactive | KeyStatus::Expired
        ) {
            return Err(Error::BadRequest(format!(
                "status '{}' cannot be set manually",
                status
            )));
        }
    }
    check_owner(&state, &headers, key_id)?;
    if let Some(Some(limit)) = body.monthly_limit {
        let used = state.pool().snapshot(key_id)?.usage_this_month;
        if limit < used {
            return Err(Error::BadRequest(format!(
                "monthly_limit {} is below this month's usage {:.6}",
                limit, used
            )));
        }
    }

    let update = KeyUpdate {
        nickname: body.nickname.clone(),
        monthly_limit: body.monthly_limit,
        status: body.status,
    };
    if !storage::keys::update(&state.db, key_id, &update).await? {
        return Err(Error::NotFound(format!("API key {}", key_id)));
    }

    let pool = state.pool();
    if let Some(nickname) = body.nickname {
        pool.set_nickname(key_id, Some(nickname))?;
    }
    if let Some(limit) = body.monthly_limit {
        pool.set_monthly_limit(key_id, limit)?;
    }
    if let Some(status) = body.status {
        pool.set_status(key_id, status)?;
    }
    tracing::info!(key_id, "API key updated");

    Ok(Json(pool.snapshot(key_id)?))
}

/// Handle DELETE /v1/keys/:id
pub async fn delete_key(
    State(state): State<AppState>,
    Path(key_id): Path<i64>,
    headers: HeaderMap,
) -> Result<StatusCode, Error> {
    check_owner(&state, &headers, key_id)?;
    if !storage::keys::delete(&state.db, key_id).await? {
        return Err(Error::NotFound(format!("API key {}", key_id)));
    }
    state.pool().remove(key_id);
    tracing::info!(key_id, "API key removed");
    Ok(StatusCode::NO_CONTENT)
}
