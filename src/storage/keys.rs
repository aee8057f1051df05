//! Persistence for donated API keys.
//!
//! The in-memory [`KeyPool`](crate::pool::KeyPool) is authoritative while
//! the service runs; these rows are its durable copy. Counter updates are
//! increments so concurrent completions commute.

use chrono::Utc;
use sqlx::{SqliteExecutor, SqlitePool};

use super::{parse_timestamp, timestamp, usage_period};
use crate::crypto::KeyVault;
use crate::error::{Error, Result};
use crate::pool::{PooledKey, ReleaseReport};
use crate::types::{KeyStatus, Provider};

/// A key row as stored.
#[derive(Debug, sqlx::FromRow)]
pub struct KeyRow {
    pub id: i64,
    pub donor_user_id: Option<i64>,
    pub provider: String,
    pub encrypted_key: String,
    pub nickname: Option<String>,
    pub monthly_limit: Option<f64>,
    pub usage_this_month: f64,
    pub total_usage: f64,
    pub requests_this_month: i64,
    pub status: String,
    pub cooldown_until: Option<String>,
    pub last_used: Option<String>,
}

impl KeyRow {
    /// Decrypt and convert into a poolable key.
    pub fn decode(self, vault: &KeyVault) -> Result<PooledKey> {
        let provider: Provider = self
            .provider
            .parse()
            .map_err(|e| Error::Internal(format!("key {}: {}", self.id, e)))?;
        let status: KeyStatus = self
            .status
            .parse()
            .map_err(|e| Error::Internal(format!("key {}: {}", self.id, e)))?;
        let secret = vault.decrypt(&self.encrypted_key)?;

        Ok(PooledKey {
            id: self.id,
            donor_user_id: self.donor_user_id,
            provider,
            nickname: self.nickname,
            secret,
            monthly_limit: self.monthly_limit,
            usage_this_month: self.usage_this_month,
            total_usage: self.total_usage,
            requests_this_month: self.requests_this_month,
            status,
            cooldown_until: self.cooldown_until.as_deref().and_then(parse_timestamp),
            last_used: self.last_used.as_deref().and_then(parse_timestamp),
        })
    }
}

/// A key about to be inserted. Owned so it can move into a transaction.
#[derive(Debug, Clone)]
pub struct NewKey {
    pub donor_user_id: Option<i64>,
    pub provider: Provider,
    pub key_hash: String,
    pub encrypted_key: String,
    pub nickname: Option<String>,
    pub monthly_limit: Option<f64>,
}

impl NewKey {
    /// Insert this key, returning its id.
    pub async fn insert<'e>(&self, executor: impl SqliteExecutor<'e>) -> Result<i64> {
        let now = Utc::now();
        let id = sqlx::query_scalar::<_, i64>(
            "INSERT INTO donated_api_keys (
                donor_user_id, provider, key_hash, encrypted_key, nickname,
                monthly_limit, usage_period, status, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            RETURNING id",
        )
        .bind(self.donor_user_id)
        .bind(self.provider.as_str())
        .bind(&self.key_hash)
        .bind(&self.encrypted_key)
        .bind(self.nickname.as_deref())
        .bind(self.monthly_limit)
        .bind(usage_period(now))
        .bind(timestamp(now))
        .bind(timestamp(now))
        .fetch_one(executor)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::DuplicateKey,
            _ => Error::Database(e),
        })?;
        Ok(id)
    }
}

pub async fn find_id_by_hash<'e>(
    executor: impl SqliteExecutor<'e>,
    key_hash: &str,
) -> Result<Option<i64>> {
    let id = sqlx::query_scalar::<_, i64>("SELECT id FROM donated_api_keys WHERE key_hash = ?")
        .bind(key_hash)
        .fetch_optional(executor)
        .await?;
    Ok(id)
}

pub async fn load_all(pool: &SqlitePool) -> Result<Vec<KeyRow>> {
    let rows = sqlx::query_as::<_, KeyRow>(
        "SELECT id, donor_user_id, provider, encrypted_key, nickname, monthly_limit,
                usage_this_month, total_usage, requests_this_month, status,
                cooldown_until, last_used
         FROM donated_api_keys
         ORDER BY id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

/// Persist what a lease release changed.
pub async fn apply_release<'e>(
    executor: impl SqliteExecutor<'e>,
    report: &ReleaseReport,
) -> Result<()> {
    sqlx::query(
        "UPDATE donated_api_keys SET
            usage_this_month = CASE
                WHEN monthly_limit IS NOT NULL AND usage_this_month + ? > monthly_limit
                    THEN MAX(usage_this_month, monthly_limit)
                ELSE usage_this_month + ?
            END,
            total_usage = total_usage + ?,
            requests_this_month = requests_this_month + ?,
            status = ?,
            cooldown_until = ?,
            last_used = COALESCE(?, last_used),
            updated_at = ?
         WHERE id = ?",
    )
    .bind(report.usage_increment)
    .bind(report.usage_increment)
    .bind(report.cost_usd)
    .bind(report.requests_increment)
    .bind(report.status.as_str())
    .bind(report.cooldown_until.map(timestamp))
    .bind(report.last_used.map(timestamp))
    .bind(timestamp(Utc::now()))
    .bind(report.key_id)
    .execute(executor)
    .await?;
    Ok(())
}

/// Fields an owner may change after donating.
#[derive(Debug, Clone, Default)]
pub struct KeyUpdate {
    pub nickname: Option<String>,
    /// `Some(None)` lifts the limit; `None` leaves it unchanged.
    pub monthly_limit: Option<Option<f64>>,
    pub status: Option<KeyStatus>,
}

/// Apply `update`, returning false when no such key exists.
pub async fn update<'e>(
    executor: impl SqliteExecutor<'e>,
    key_id: i64,
    update: &KeyUpdate,
) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE donated_api_keys SET
            nickname = COALESCE(?, nickname),
            monthly_limit = CASE WHEN ? THEN ? ELSE monthly_limit END,
            status = COALESCE(?, status),
            cooldown_until = CASE WHEN ? = 'active' THEN NULL ELSE cooldown_until END,
            updated_at = ?
         WHERE id = ?",
    )
    .bind(update.nickname.as_deref())
    .bind(update.monthly_limit.is_some())
    .bind(update.monthly_limit.flatten())
    .bind(update.status.map(|s| s.as_str()))
    .bind(update.status.map(|s| s.as_str()))
    .bind(timestamp(Utc::now()))
    .bind(key_id)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete<'e>(executor: impl SqliteExecutor<'e>, key_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM donated_api_keys WHERE id = ?")
        .bind(key_id)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Zero monthly counters on keys still tagged with an older period.
///
/// Returns the number of keys reset.
pub async fn roll_usage_period(pool: &SqlitePool, period: &str) -> Result<u64> {
    let result = sqlx::query(
        "UPDATE donated_api_keys SET
            usage_this_month = 0,
            requests_this_month = 0,
            usage_period = ?
         WHERE usage_period <> ?",
    )
    .bind(period)
    .bind(period)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn new_key(vault: &KeyVault, raw: &str) -> NewKey {
        NewKey {
            donor_user_id: Some(3),
            provider: Provider::Anthropic,
            key_hash: crate::crypto::key_hash(raw),
            encrypted_key: vault.encrypt(raw).unwrap(),
            nickname: Some("team key".to_string()),
            monthly_limit: Some(20.0),
        }
    }

    #[tokio::test]
    async fn test_insert_load_and_decode() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        let id = new_key(&vault, "sk-ant-123456789").insert(&pool).await.unwrap();

        let rows = load_all(&pool).await.unwrap();
        assert_eq!(rows.len(), 1);
        let key = rows.into_iter().next().unwrap().decode(&vault).unwrap();
        assert_eq!(key.id, id);
        assert_eq!(key.provider, Provider::Anthropic);
        assert_eq!(key.status, KeyStatus::Active);
        assert_eq!(key.monthly_limit, Some(20.0));
        assert_eq!(
            secrecy::ExposeSecret::expose_secret(&key.secret),
            "sk-ant-123456789"
        );
    }

    #[tokio::test]
    async fn test_duplicate_hash_rejected() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        new_key(&vault, "sk-dup-000000001").insert(&pool).await.unwrap();
        let err = new_key(&vault, "sk-dup-000000001")
            .insert(&pool)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateKey));
        assert!(find_id_by_hash(&pool, &crate::crypto::key_hash("sk-dup-000000001"))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_apply_release_increments() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        let id = new_key(&vault, "sk-inc-000000001").insert(&pool).await.unwrap();

        let report = ReleaseReport {
            key_id: id,
            provider: Provider::Anthropic,
            status: KeyStatus::RateLimited,
            status_changed: true,
            cooldown_until: Some(Utc::now()),
            cost_usd: 0.25,
            usage_increment: 0.25,
            requests_increment: 1,
            usage_this_month: 0.25,
            last_used: Some(Utc::now()),
        };
        apply_release(&pool, &report).await.unwrap();
        apply_release(&pool, &report).await.unwrap();

        let row = load_all(&pool).await.unwrap().remove(0);
        assert_eq!(row.requests_this_month, 2);
        assert!((row.usage_this_month - 0.5).abs() < 1e-9);
        assert!((row.total_usage - 0.5).abs() < 1e-9);
        assert_eq!(row.status, "rate_limited");
        assert!(row.cooldown_until.is_some());
    }

    #[tokio::test]
    async fn test_apply_release_stops_monthly_usage_at_limit() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        let id = new_key(&vault, "sk-cap-000000001").insert(&pool).await.unwrap();

        // Two concurrent completions each computed against 15 of headroom.
        let report = ReleaseReport {
            key_id: id,
            provider: Provider::Anthropic,
            status: KeyStatus::Active,
            status_changed: false,
            cooldown_until: None,
            cost_usd: 15.0,
            usage_increment: 15.0,
            requests_increment: 1,
            usage_this_month: 15.0,
            last_used: Some(Utc::now()),
        };
        apply_release(&pool, &report).await.unwrap();
        apply_release(&pool, &report).await.unwrap();

        let row = load_all(&pool).await.unwrap().remove(0);
        assert_eq!(row.usage_this_month, 20.0);
        assert!((row.total_usage - 30.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_update_can_lift_monthly_limit() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        let id = new_key(&vault, "sk-lim-000000001").insert(&pool).await.unwrap();

        update(&pool, id, &KeyUpdate::default()).await.unwrap();
        assert_eq!(load_all(&pool).await.unwrap()[0].monthly_limit, Some(20.0));

        let lift = KeyUpdate {
            monthly_limit: Some(None),
            ..Default::default()
        };
        assert!(update(&pool, id, &lift).await.unwrap());
        assert_eq!(load_all(&pool).await.unwrap()[0].monthly_limit, None);
    }

    #[tokio::test]
    async fn test_update_delete_and_period_roll() {
        let pool = test_pool().await;
        let vault = KeyVault::new("test");
        let id = new_key(&vault, "sk-upd-000000001").insert(&pool).await.unwrap();

        let changed = update(
            &pool,
            id,
            &KeyUpdate {
                status: Some(KeyStatus::Inactive),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert!(changed);
        let row = load_all(&pool).await.unwrap().remove(0);
        assert_eq!(row.status, "inactive");
        assert_eq!(row.nickname.as_deref(), Some("team key"));

        sqlx::query("UPDATE donated_api_keys SET usage_this_month = 3, usage_period = '2000-01'")
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(roll_usage_period(&pool, "2000-02").await.unwrap(), 1);
        assert_eq!(roll_usage_period(&pool, "2000-02").await.unwrap(), 0);
        assert_eq!(load_all(&pool).await.unwrap()[0].usage_this_month, 0.0);

        assert!(delete(&pool, id).await.unwrap());
        assert!(!delete(&pool, id).await.unwrap());
        assert!(!update(&pool, id, &KeyUpdate::default()).await.unwrap());
    }
}
