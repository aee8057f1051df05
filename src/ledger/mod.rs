//! Usage ledger: request records, costs, quotas and contribution stats.

mod pricing;
mod usage;

pub use crate::storage::requests::ModelUsage;
pub use crate::storage::RequestRecord;
pub use pricing::{Pricing, Rates};
pub use usage::{
    CommunityStats, ContributionSummary, UsageLedger, UserUsageStats, MAX_USAGE_DAYS,
};
