//! Pool of donated provider API keys.
//!
//! The pool owns every key's lifecycle: which keys may be handed out,
//! how many requests each may carry at once, and the status transitions
//! caused by throttling or repeated rejections.

mod key_pool;

pub use key_pool::{
    KeyLease, KeyPool, KeyResult, KeySettings, KeySnapshot, PooledKey, ReleaseReport,
};
