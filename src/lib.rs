//! keyrelay - community key pool and load-balancing router for AI providers
//!
//! Routes OpenAI-compatible requests for a logical model to one of several
//! upstream providers, drawing keys from a shared donated pool, tracking
//! per-provider health and recording every request in a usage ledger.

pub mod config;
pub mod crypto;
pub mod error;
pub mod health;
pub mod ledger;
pub mod pool;
pub mod proxy;
pub mod router;
pub mod storage;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use router::{Gateway, LoadBalancer};
