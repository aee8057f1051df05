//! Usage, contribution and community endpoints.

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};

use super::server::AppState;
use crate::error::Error;
use crate::ledger::{CommunityStats, ContributionSummary, UserUsageStats};
use crate::storage::contributions::LeaderboardRow;
use crate::types::KeyStatus;

const DEFAULT_USAGE_DAYS: u32 = 30;
const DEFAULT_LEADERBOARD_LIMIT: u32 = 10;

#[derive(Debug, Deserialize)]
pub struct UsageQuery {
    pub days: Option<u32>,
}

/// Handle GET /v1/usage/:user_id
pub async fn user_usage(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<UserUsageStats>, Error> {
    let days = query.days.unwrap_or(DEFAULT_USAGE_DAYS);
    Ok(Json(state.ledger().user_usage_stats(user_id, days).await?))
}

#[derive(Debug, Serialize)]
pub struct ContributionResponse {
    #[serde(flatten)]
    pub summary: ContributionSummary,
    pub donated_keys: usize,
    pub active_keys: usize,
}

/// Handle GET /v1/contributions/:user_id
pub async fn contribution(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<ContributionResponse>, Error> {
    let summary = state.ledger().contribution(user_id).await?;
    let owned: Vec<_> = state
        .pool()
        .snapshots()
        .into_iter()
        .filter(|k| k.donor_user_id == Some(user_id))
        .collect();
    let active_keys = owned.iter().filter(|k| k.status == KeyStatus::Active).count();

    Ok(Json(ContributionResponse {
        summary,
        donated_keys: owned.len(),
        active_keys,
    }))
}

#[derive(Debug, Serialize)]
pub struct CommunityResponse {
    #[serde(flatten)]
    pub stats: CommunityStats,
    pub total_api_keys: usize,
    pub active_api_keys: usize,
    pub models_available: Vec<String>,
}

/// Handle GET /v1/community/stats
pub async fn community_stats(
    State(state): State<AppState>,
) -> Result<Json<CommunityResponse>, Error> {
    let stats = state.ledger().community_stats().await?;
    let keys = state.pool().snapshots();
    let active_api_keys = keys.iter().filter(|k| k.status == KeyStatus::Active).count();
    let models_available = state
        .configs()
        .list()
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.model_name.clone())
        .collect();

    Ok(Json(CommunityResponse {
        stats,
        total_api_keys: keys.len(),
        active_api_keys,
        models_available,
    }))
}

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<u32>,
}

/// Handle GET /v1/community/leaderboard
pub async fn leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<Vec<LeaderboardRow>>, Error> {
    let limit = query.limit.unwrap_or(DEFAULT_LEADERBOARD_LIMIT);
    Ok(Json(state.ledger().leaderboard(limit).await?))
}
