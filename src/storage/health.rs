//! Persistence for rolling health snapshots.

use sqlx::SqlitePool;

use super::timestamp;
use crate::health::HealthSnapshot;

/// Insert or refresh the row for the snapshot's (provider, model) pair.
pub async fn upsert(pool: &SqlitePool, snapshot: &HealthSnapshot) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO ai_model_health (
            provider, model_name, status, response_time_avg, success_rate,
            error_count, last_error, last_check
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(provider, model_name) DO UPDATE SET
            status = excluded.status,
            response_time_avg = excluded.response_time_avg,
            success_rate = excluded.success_rate,
            error_count = excluded.error_count,
            last_error = excluded.last_error,
            last_check = excluded.last_check",
    )
    .bind(snapshot.provider.as_str())
    .bind(&snapshot.model_name)
    .bind(snapshot.status.as_str())
    .bind(snapshot.response_time_avg)
    .bind(snapshot.success_rate)
    .bind(snapshot.error_count as i64)
    .bind(snapshot.last_error.as_deref())
    .bind(timestamp(snapshot.last_check))
    .execute(pool)
    .await?;
    Ok(())
}
