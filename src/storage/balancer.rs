//! Persistence for per-model balancer configs.

use chrono::Utc;
use sqlx::{SqliteExecutor, SqlitePool};

use super::timestamp;
use crate::error::{Error, Result};
use crate::router::BalancerConfig;

#[derive(Debug, sqlx::FromRow)]
struct BalancerRow {
    model_name: String,
    provider_weights: String,
    fallback_order: String,
    enabled: bool,
    min_healthy_keys: i64,
    health_check_interval: i64,
}

impl BalancerRow {
    fn decode(self) -> std::result::Result<BalancerConfig, String> {
        let provider_weights =
            serde_json::from_str(&self.provider_weights).map_err(|e| e.to_string())?;
        let fallback_order =
            serde_json::from_str(&self.fallback_order).map_err(|e| e.to_string())?;
        Ok(BalancerConfig {
            model_name: self.model_name,
            provider_weights,
            fallback_order,
            enabled: self.enabled,
            min_healthy_keys: self.min_healthy_keys.max(0) as u32,
            health_check_interval_secs: self.health_check_interval.max(1) as u64,
        })
    }
}

fn encode(config: &BalancerConfig) -> Result<(String, String)> {
    let weights = serde_json::to_string(&config.provider_weights)
        .map_err(|e| Error::Internal(format!("encode weights: {}", e)))?;
    let fallback = serde_json::to_string(&config.fallback_order)
        .map_err(|e| Error::Internal(format!("encode fallback order: {}", e)))?;
    Ok((weights, fallback))
}

/// Load every stored config. Rows that no longer decode are skipped.
pub async fn load_all(pool: &SqlitePool) -> Result<Vec<BalancerConfig>> {
    let rows = sqlx::query_as::<_, BalancerRow>(
        "SELECT model_name, provider_weights, fallback_order, enabled,
                min_healthy_keys, health_check_interval
         FROM model_load_balancer
         ORDER BY model_name",
    )
    .fetch_all(pool)
    .await?;

    let mut configs = Vec::with_capacity(rows.len());
    for row in rows {
        let model = row.model_name.clone();
        match row.decode() {
            Ok(config) => configs.push(config),
            Err(e) => {
                tracing::warn!(model = %model, error = %e, "Skipping unreadable balancer config")
            }
        }
    }
    Ok(configs)
}

/// Insert or replace the config for `config.model_name`.
pub async fn upsert<'e>(executor: impl SqliteExecutor<'e>, config: &BalancerConfig) -> Result<()> {
    let (weights, fallback) = encode(config)?;
    let now = timestamp(Utc::now());
    sqlx::query(
        "INSERT INTO model_load_balancer (
            model_name, provider_weights, fallback_order, enabled,
            min_healthy_keys, health_check_interval, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(model_name) DO UPDATE SET
            provider_weights = excluded.provider_weights,
            fallback_order = excluded.fallback_order,
            enabled = excluded.enabled,
            min_healthy_keys = excluded.min_healthy_keys,
            health_check_interval = excluded.health_check_interval,
            updated_at = excluded.updated_at",
    )
    .bind(&config.model_name)
    .bind(weights)
    .bind(fallback)
    .bind(config.enabled)
    .bind(config.min_healthy_keys as i64)
    .bind(config.health_check_interval_secs as i64)
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await?;
    Ok(())
}

/// Insert `config` only if its model has no row yet. Returns true if written.
pub async fn insert_if_absent<'e>(
    executor: impl SqliteExecutor<'e>,
    config: &BalancerConfig,
) -> Result<bool> {
    let (weights, fallback) = encode(config)?;
    let now = timestamp(Utc::now());
    let result = sqlx::query(
        "INSERT OR IGNORE INTO model_load_balancer (
            model_name, provider_weights, fallback_order, enabled,
            min_healthy_keys, health_check_interval, created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(&config.model_name)
    .bind(weights)
    .bind(fallback)
    .bind(config.enabled)
    .bind(config.min_healthy_keys as i64)
    .bind(config.health_check_interval_secs as i64)
    .bind(&now)
    .bind(&now)
    .execute(executor)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn delete<'e>(executor: impl SqliteExecutor<'e>, model: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM model_load_balancer WHERE model_name = ?")
        .bind(model)
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Provider;

    fn config(model: &str) -> BalancerConfig {
        BalancerConfig {
            model_name: model.to_string(),
            provider_weights: [(Provider::OpenAi, 0.7), (Provider::Anthropic, 0.3)]
                .into_iter()
                .collect(),
            fallback_order: vec![Provider::OpenAi, Provider::Anthropic],
            enabled: true,
            min_healthy_keys: 1,
            health_check_interval_secs: 300,
        }
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        upsert(&pool, &config("gpt-x")).await.unwrap();
        let mut changed = config("gpt-x");
        changed.enabled = false;
        changed.fallback_order = vec![Provider::Anthropic];
        upsert(&pool, &changed).await.unwrap();

        let loaded = load_all(&pool).await.unwrap();
        assert_eq!(loaded, vec![changed]);
    }

    #[tokio::test]
    async fn test_insert_if_absent_keeps_existing() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        let mut edited = config("gpt-x");
        edited.min_healthy_keys = 3;
        upsert(&pool, &edited).await.unwrap();

        assert!(!insert_if_absent(&pool, &config("gpt-x")).await.unwrap());
        assert!(insert_if_absent(&pool, &config("claude")).await.unwrap());

        let loaded = load_all(&pool).await.unwrap();
        assert_eq!(loaded.len(), 2);
        let gpt = loaded.iter().find(|c| c.model_name == "gpt-x").unwrap();
        assert_eq!(gpt.min_healthy_keys, 3);

        assert!(delete(&pool, "claude").await.unwrap());
        assert!(!delete(&pool, "claude").await.unwrap());
    }
}
