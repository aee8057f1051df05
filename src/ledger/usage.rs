//! The usage ledger: immutable request records plus the counters they move.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;

use super::pricing::Pricing;
use crate::error::{Error, Result};
use crate::pool::ReleaseReport;
use crate::storage::contributions::{self, LeaderboardRow};
use crate::storage::requests::{self, ModelUsage};
use crate::storage::{in_transaction, keys, month_start, parse_timestamp, RequestRecord};
use crate::types::{ContributionTier, UserAccess};

/// Models listed in a user's usage summary.
const TOP_MODELS: i64 = 5;

/// Longest window accepted for usage summaries.
pub const MAX_USAGE_DAYS: u32 = 365;

/// A user's activity over a window of days.
#[derive(Debug, Clone, Serialize)]
pub struct UserUsageStats {
    pub user_id: i64,
    pub days: u32,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub total_tokens: i64,
    pub total_cost_usd: f64,
    pub top_models: Vec<ModelUsage>,
    pub last_request: Option<DateTime<Utc>>,
}

/// A user's donation standing and this month's allowance.
#[derive(Debug, Clone, Serialize)]
pub struct ContributionSummary {
    pub user_id: i64,
    pub total_donated_usd: f64,
    pub credits_earned: f64,
    pub credits_used: f64,
    pub credits_remaining: f64,
    pub contribution_tier: ContributionTier,
    pub monthly_usage_limit: f64,
    pub priority_level: u8,
    pub cost_this_month: f64,
}

/// Pool-wide donation and usage figures.
#[derive(Debug, Clone, Serialize)]
pub struct CommunityStats {
    pub total_contributors: i64,
    pub total_donated_usd: f64,
    pub monthly_requests: i64,
    pub monthly_cost_usd: f64,
}

/// Allowance state for one user, with defaults for users who never donated.
#[derive(Debug, Clone, Copy)]
struct Standing {
    monthly_usage_limit: f64,
    credits_remaining: f64,
    priority_level: u8,
}

impl Standing {
    fn from_row(row: Option<&contributions::ContributionRow>) -> Self {
        match row {
            Some(row) => Self {
                monthly_usage_limit: row.monthly_usage_limit,
                credits_remaining: row.credits_remaining,
                priority_level: row.priority_level.clamp(1, u8::MAX as i64) as u8,
            },
            None => {
                let basic = ContributionTier::for_total_donated(0.0);
                Self {
                    monthly_usage_limit: basic.monthly_usage_limit,
                    credits_remaining: 0.0,
                    priority_level: basic.priority_level,
                }
            }
        }
    }
}

/// Portion of `cost` that lands above `limit`, given `prior` spend.
fn overage(prior: f64, cost: f64, limit: f64) -> f64 {
    (prior + cost - limit).max(0.0) - (prior - limit).max(0.0)
}

/// Records requests and answers usage questions.
#[derive(Debug, Clone)]
pub struct UsageLedger {
    db: SqlitePool,
    pricing: Arc<Pricing>,
}

impl UsageLedger {
    pub fn new(db: SqlitePool, pricing: Pricing) -> Self {
        Self {
            db,
            pricing: Arc::new(pricing),
        }
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn pricing(&self) -> &Pricing {
        &self.pricing
    }

    /// Insert a request record. Records are never updated afterwards.
    pub async fn append(&self, record: &RequestRecord) -> Result<i64> {
        Ok(record.insert(&self.db).await?)
    }

    /// Total cost charged to `user_id` since `since`.
    pub async fn aggregate_cost(&self, user_id: i64, since: DateTime<Utc>) -> Result<f64> {
        Ok(requests::cost_since(&self.db, user_id, since).await?)
    }

    /// Write a request record together with the key counters it moves and
    /// any credit draw, all or nothing.
    ///
    /// Credits are only drawn for the part of the cost that exceeds the
    /// user's monthly allowance.
    pub async fn record_completion(
        &self,
        record: RequestRecord,
        report: Option<ReleaseReport>,
    ) -> Result<i64> {
        in_transaction(&self.db, move |conn| {
            Box::pin(async move {
                let mut credit_draw = 0.0;
                if let (Some(user_id), true) = (record.user_id, record.cost_usd > 0.0) {
                    if let Some(row) = contributions::get(&mut *conn, user_id).await? {
                        let standing = Standing::from_row(Some(&row));
                        let prior = requests::cost_since(
                            &mut *conn,
                            user_id,
                            month_start(record.created_at),
                        )
                        .await?;
                        credit_draw =
                            overage(prior, record.cost_usd, standing.monthly_usage_limit);
                    }
                }

                let id = record.insert(&mut *conn).await?;
                if let Some(report) = &report {
                    keys::apply_release(&mut *conn, report).await?;
                }
                if let (Some(user_id), true) = (record.user_id, credit_draw > 0.0) {
                    contributions::spend_credits(&mut *conn, user_id, credit_draw).await?;
                }
                Ok::<i64, Error>(id)
            })
        })
        .await
    }

    /// Resolve a user's routing priority, refusing users who have used up
    /// this month's allowance and have no credits left.
    pub async fn check_quota(&self, user_id: i64) -> Result<UserAccess> {
        let row = contributions::get(&self.db, user_id).await?;
        let standing = Standing::from_row(row.as_ref());
        let spent = self
            .aggregate_cost(user_id, month_start(Utc::now()))
            .await?;

        if spent >= standing.monthly_usage_limit && standing.credits_remaining <= 0.0 {
            tracing::info!(
                user_id,
                spent,
                limit = standing.monthly_usage_limit,
                "Usage quota exceeded"
            );
            return Err(Error::QuotaExceeded { user_id });
        }
        Ok(UserAccess::new(user_id, standing.priority_level))
    }

    pub async fn contribution(&self, user_id: i64) -> Result<ContributionSummary> {
        let row = contributions::get(&self.db, user_id).await?;
        let standing = Standing::from_row(row.as_ref());
        let cost_this_month = self
            .aggregate_cost(user_id, month_start(Utc::now()))
            .await?;

        let (total_donated_usd, credits_earned, credits_used, tier) = match &row {
            Some(row) => (
                row.total_donated_usd,
                row.credits_earned,
                row.credits_used,
                row.contribution_tier
                    .parse()
                    .unwrap_or(ContributionTier::Basic),
            ),
            None => (0.0, 0.0, 0.0, ContributionTier::Basic),
        };

        Ok(ContributionSummary {
            user_id,
            total_donated_usd,
            credits_earned,
            credits_used,
            credits_remaining: standing.credits_remaining,
            contribution_tier: tier,
            monthly_usage_limit: standing.monthly_usage_limit,
            priority_level: standing.priority_level,
            cost_this_month,
        })
    }

    pub async fn user_usage_stats(&self, user_id: i64, days: u32) -> Result<UserUsageStats> {
        if days == 0 || days > MAX_USAGE_DAYS {
            return Err(Error::BadRequest(format!(
                "days must be between 1 and {}",
                MAX_USAGE_DAYS
            )));
        }
        let since = Utc::now() - Duration::days(days as i64);
        let totals = requests::usage_totals(&self.db, user_id, since).await?;
        let top_models = requests::top_models(&self.db, user_id, since, TOP_MODELS).await?;

        Ok(UserUsageStats {
            user_id,
            days,
            total_requests: totals.total_requests,
            successful_requests: totals.successful_requests,
            total_tokens: totals.total_tokens,
            total_cost_usd: totals.total_cost_usd,
            top_models,
            last_request: totals.last_request.as_deref().and_then(parse_timestamp),
        })
    }

    pub async fn community_stats(&self) -> Result<CommunityStats> {
        let (total_contributors, total_donated_usd) = contributions::totals(&self.db).await?;
        let (monthly_requests, monthly_cost_usd) =
            requests::successful_since(&self.db, month_start(Utc::now())).await?;
        Ok(CommunityStats {
            total_contributors,
            total_donated_usd,
            monthly_requests,
            monthly_cost_usd,
        })
    }

    pub async fn leaderboard(&self, limit: u32) -> Result<Vec<LeaderboardRow>> {
        Ok(contributions::leaderboard(&self.db, limit.clamp(1, 100) as i64).await?)
    }
}
