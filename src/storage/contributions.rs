//! Donation totals, credits and tiers per user.

use chrono::Utc;
use serde::Serialize;
use sqlx::{SqliteConnection, SqliteExecutor, SqlitePool};

use super::timestamp;
use crate::types::ContributionTier;

/// Credits granted per donated USD.
pub const CREDIT_MULTIPLIER: f64 = 2.0;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct ContributionRow {
    pub user_id: i64,
    pub total_donated_usd: f64,
    pub credits_earned: f64,
    pub credits_used: f64,
    pub credits_remaining: f64,
    pub contribution_tier: String,
    pub monthly_usage_limit: f64,
    pub priority_level: i64,
    pub updated_at: String,
}

pub async fn get<'e>(
    executor: impl SqliteExecutor<'e>,
    user_id: i64,
) -> Result<Option<ContributionRow>, sqlx::Error> {
    sqlx::query_as::<_, ContributionRow>(
        "SELECT user_id, total_donated_usd, credits_earned, credits_used,
                credits_remaining, contribution_tier, monthly_usage_limit,
                priority_level, updated_at
         FROM user_contributions WHERE user_id = ?",
    )
    .bind(user_id)
    .fetch_optional(executor)
    .await
}

/// Add a donation to the user's total and recompute their tier.
pub async fn record_donation(
    conn: &mut SqliteConnection,
    user_id: i64,
    amount_usd: f64,
) -> Result<ContributionRow, sqlx::Error> {
    let previous = get(&mut *conn, user_id)
        .await?
        .map_or(0.0, |row| row.total_donated_usd);
    let benefits = ContributionTier::for_total_donated(previous + amount_usd);
    let credits = amount_usd * CREDIT_MULTIPLIER;
    let now = timestamp(Utc::now());

    sqlx::query(
        "INSERT INTO user_contributions (
            user_id, total_donated_usd, credits_earned, credits_used, credits_remaining,
            contribution_tier, monthly_usage_limit, priority_level, created_at, updated_at
        ) VALUES (?, ?, ?, 0, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(user_id) DO UPDATE SET
            total_donated_usd = total_donated_usd + excluded.total_donated_usd,
            credits_earned = credits_earned + excluded.credits_earned,
            credits_remaining = credits_remaining + excluded.credits_remaining,
            contribution_tier = excluded.contribution_tier,
            monthly_usage_limit = excluded.monthly_usage_limit,
            priority_level = excluded.priority_level,
            updated_at = excluded.updated_at",
    )
    .bind(user_id)
    .bind(amount_usd)
    .bind(credits)
    .bind(credits)
    .bind(benefits.tier.as_str())
    .bind(benefits.monthly_usage_limit)
    .bind(benefits.priority_level as i64)
    .bind(&now)
    .bind(&now)
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        user_id,
        amount_usd,
        tier = %benefits.tier,
        "Donation recorded"
    );

    get(&mut *conn, user_id)
        .await?
        .ok_or(sqlx::Error::RowNotFound)
}

/// Draw `amount_usd` from the user's credit balance.
pub async fn spend_credits<'e>(
    executor: impl SqliteExecutor<'e>,
    user_id: i64,
    amount_usd: f64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE user_contributions SET
            credits_used = credits_used + ?,
            credits_remaining = credits_remaining - ?,
            updated_at = ?
         WHERE user_id = ?",
    )
    .bind(amount_usd)
    .bind(amount_usd)
    .bind(timestamp(Utc::now()))
    .bind(user_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Count of users with donations and the sum donated.
pub async fn totals(pool: &SqlitePool) -> Result<(i64, f64), sqlx::Error> {
    sqlx::query_as::<_, (i64, f64)>(
        "SELECT COUNT(*), COALESCE(SUM(total_donated_usd), 0.0)
         FROM user_contributions WHERE total_donated_usd > 0",
    )
    .fetch_one(pool)
    .await
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct LeaderboardRow {
    pub user_id: i64,
    pub total_donated_usd: f64,
    pub contribution_tier: String,
    pub credits_earned: f64,
    pub active_keys: i64,
}

/// Top donors with their count of active keys.
pub async fn leaderboard(pool: &SqlitePool, limit: i64) -> Result<Vec<LeaderboardRow>, sqlx::Error> {
    sqlx::query_as::<_, LeaderboardRow>(
        "SELECT c.user_id, c.total_donated_usd, c.contribution_tier, c.credits_earned,
                COUNT(k.id) AS active_keys
         FROM user_contributions c
         LEFT JOIN donated_api_keys k
            ON k.donor_user_id = c.user_id AND k.status = 'active'
         WHERE c.total_donated_usd > 0
         GROUP BY c.user_id
         ORDER BY c.total_donated_usd DESC, c.user_id ASC
         LIMIT ?",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_donations_accumulate_and_raise_tier() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        let mut conn = pool.acquire().await.unwrap();

        let row = record_donation(&mut conn, 5, 20.0).await.unwrap();
        assert_eq!(row.contribution_tier, "basic");
        assert_eq!(row.credits_remaining, 40.0);

        let row = record_donation(&mut conn, 5, 10.0).await.unwrap();
        assert_eq!(row.total_donated_usd, 30.0);
        assert_eq!(row.contribution_tier, "supporter");
        assert_eq!(row.priority_level, 2);
        assert_eq!(row.monthly_usage_limit, 25.0);
        assert_eq!(row.credits_earned, 60.0);
        drop(conn);

        spend_credits(&pool, 5, 15.0).await.unwrap();
        let row = get(&pool, 5).await.unwrap().unwrap();
        assert_eq!(row.credits_used, 15.0);
        assert_eq!(row.credits_remaining, 45.0);

        assert_eq!(totals(&pool).await.unwrap(), (1, 30.0));
        let board = leaderboard(&pool, 10).await.unwrap();
        assert_eq!(board.len(), 1);
        assert_eq!(board[0].active_keys, 0);
    }
}
