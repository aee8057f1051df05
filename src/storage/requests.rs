//! The request ledger table and its aggregate queries.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{SqliteExecutor, SqlitePool};

use super::timestamp;
use crate::types::Provider;

/// One completed (or failed) inference request, ready for insertion.
///
/// All fields are owned so records can move into spawned tasks and
/// transactions.
#[derive(Debug, Clone, Serialize)]
pub struct RequestRecord {
    pub request_id: String,
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub model_name: String,
    pub provider: Provider,
    pub api_key_id: Option<i64>,
    pub request_type: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_usd: f64,
    pub response_time_ms: u64,
    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl RequestRecord {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens as u64 + self.output_tokens as u64
    }

    /// Insert this record, returning its row id.
    pub async fn insert<'e>(&self, executor: impl SqliteExecutor<'e>) -> Result<i64, sqlx::Error> {
        sqlx::query_scalar::<_, i64>(
            "INSERT INTO ai_model_requests (
                request_id, user_id, session_id, model_name, provider, api_key_id,
                request_type, input_tokens, output_tokens, total_tokens, cost_usd,
                response_time_ms, success, error_code, error_message, user_agent,
                created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id",
        )
        .bind(&self.request_id)
        .bind(self.user_id)
        .bind(self.session_id.as_deref())
        .bind(&self.model_name)
        .bind(self.provider.as_str())
        .bind(self.api_key_id)
        .bind(&self.request_type)
        .bind(self.input_tokens as i64)
        .bind(self.output_tokens as i64)
        .bind(self.total_tokens() as i64)
        .bind(self.cost_usd)
        .bind(self.response_time_ms as i64)
        .bind(self.success)
        .bind(self.error_code.as_deref())
        .bind(self.error_message.as_deref())
        .bind(self.user_agent.as_deref())
        .bind(timestamp(self.created_at))
        .fetch_one(executor)
        .await
    }
}

/// Total cost charged to `user_id` since `since`.
pub async fn cost_since<'e>(
    executor: impl SqliteExecutor<'e>,
    user_id: i64,
    since: DateTime<Utc>,
) -> Result<f64, sqlx::Error> {
    sqlx::query_scalar::<_, f64>(
        "SELECT COALESCE(SUM(cost_usd), 0.0) FROM ai_model_requests
         WHERE user_id = ? AND created_at >= ?",
    )
    .bind(user_id)
    .bind(timestamp(since))
    .fetch_one(executor)
    .await
}

/// Request totals for one user over a window.
#[derive(Debug, Clone, Default, sqlx::FromRow)]
pub struct UsageTotals {
    pub total_requests: i64,
    pub successful_requests: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub last_request: Option<String>,
}

pub async fn usage_totals(
    pool: &SqlitePool,
    user_id: i64,
    since: DateTime<Utc>,
) -> Result<UsageTotals, sqlx::Error> {
    sqlx::query_as::<_, UsageTotals>(
        "SELECT
            COUNT(*) AS total_requests,
            COALESCE(SUM(CASE WHEN success THEN 1 ELSE 0 END), 0) AS successful_requests,
            COALESCE(SUM(total_tokens), 0) AS total_tokens,
            COALESCE(SUM(cost_usd), 0.0) AS total_cost_usd,
            MAX(created_at) AS last_request
         FROM ai_model_requests
         WHERE user_id = ? AND created_at >= ?",
    )
    .bind(user_id)
    .bind(timestamp(since))
    .fetch_one(pool)
    .await
}

/// Per-model usage for one user.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ModelUsage {
    pub model_name: String,
    pub requests: i64,
    pub cost_usd: f64,
}

/// The user's most used models over a window, most requests first.
pub async fn top_models(
    pool: &SqlitePool,
    user_id: i64,
    since: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<ModelUsage>, sqlx::Error> {
    sqlx::query_as::<_, ModelUsage>(
        "SELECT model_name, COUNT(*) AS requests, COALESCE(SUM(cost_usd), 0.0) AS cost_usd
         FROM ai_model_requests
         WHERE user_id = ? AND created_at >= ?
         GROUP BY model_name
         ORDER BY requests DESC, model_name ASC
         LIMIT ?",
    )
    .bind(user_id)
    .bind(timestamp(since))
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Successful request count and cost across all users since `since`.
pub async fn successful_since(
    pool: &SqlitePool,
    since: DateTime<Utc>,
) -> Result<(i64, f64), sqlx::Error> {
    sqlx::query_as::<_, (i64, f64)>(
        "SELECT COUNT(*), COALESCE(SUM(cost_usd), 0.0)
         FROM ai_model_requests
         WHERE success = 1 AND created_at >= ?",
    )
    .bind(timestamp(since))
    .fetch_one(pool)
    .await
}

/// Number of ledger rows that reference `key_id`.
pub async fn count_for_key(pool: &SqlitePool, key_id: i64) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM ai_model_requests WHERE api_key_id = ?")
        .bind(key_id)
        .fetch_one(pool)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(user: i64, model: &str, cost: f64, success: bool, at: DateTime<Utc>) -> RequestRecord {
        RequestRecord {
            request_id: uuid::Uuid::new_v4().to_string(),
            user_id: Some(user),
            session_id: None,
            model_name: model.to_string(),
            provider: Provider::OpenAi,
            api_key_id: Some(1),
            request_type: "chat".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cost_usd: cost,
            response_time_ms: 321,
            success,
            error_code: None,
            error_message: None,
            user_agent: None,
            created_at: at,
        }
    }

    #[tokio::test]
    async fn test_aggregates() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let now = Utc::now();
        record(1, "gpt-x", 0.5, true, now).insert(&pool).await.unwrap();
        record(1, "gpt-x", 0.25, true, now).insert(&pool).await.unwrap();
        record(1, "claude", 0.0, false, now).insert(&pool).await.unwrap();
        record(1, "gpt-x", 9.0, true, now - Duration::days(40))
            .insert(&pool)
            .await
            .unwrap();
        record(2, "gpt-x", 1.0, true, now).insert(&pool).await.unwrap();

        let since = now - Duration::days(30);
        assert!((cost_since(&pool, 1, since).await.unwrap() - 0.75).abs() < 1e-9);

        let totals = usage_totals(&pool, 1, since).await.unwrap();
        assert_eq!(totals.total_requests, 3);
        assert_eq!(totals.successful_requests, 2);
        assert_eq!(totals.total_tokens, 450);
        assert!(totals.last_request.is_some());

        let top = top_models(&pool, 1, since, 5).await.unwrap();
        assert_eq!(top[0].model_name, "gpt-x");
        assert_eq!(top[0].requests, 2);
        assert_eq!(top.len(), 2);

        let (count, cost) = successful_since(&pool, since).await.unwrap();
        assert_eq!(count, 3);
        assert!((cost - 1.75).abs() < 1e-9);
        assert_eq!(count_for_key(&pool, 1).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_empty_window_is_zero() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let totals = usage_totals(&pool, 9, Utc::now()).await.unwrap();
        assert_eq!(totals.total_requests, 0);
        assert_eq!(totals.total_cost_usd, 0.0);
        assert!(totals.last_request.is_none());
    }
}
