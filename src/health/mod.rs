//! Rolling health statistics per (provider, model).
//!
//! The tracker is the only writer of `ai_model_health`; [`spawn_flush`]
//! persists snapshots of pairs that changed since the last flush.

mod tracker;

pub use crate::types::HealthStatus;
pub use tracker::{spawn_flush, HealthSettings, HealthSnapshot, HealthTracker};
