//! HTTP API.
//!
//! The OpenAI-compatible chat completions proxy plus the admin endpoints
//! for keys, balancer configs, usage and health.

mod balancer;
pub mod checks;
mod handlers;
mod keys;
pub mod retry;
mod server;
pub mod types;
mod usage;

pub use handlers::{
    KEYRELAY_COST_USD_HEADER, KEYRELAY_LATENCY_MS_HEADER, KEYRELAY_PROVIDER_HEADER,
    KEYRELAY_REQUEST_ID_HEADER, KEYRELAY_RETRIES_HEADER, KEYRELAY_SESSION_HEADER,
    KEYRELAY_USER_HEADER,
};
pub use checks::{check_health, CheckOutcome, HealthCheckReport, PairCheck};
pub use server::{create_router, run_server, spawn_period_rollover, AppState, ProviderEndpoint};
pub use types::{ChatCompletionRequest, Message};
