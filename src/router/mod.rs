//! Provider routing.
//!
//! This module handles choosing a provider and key for each request based on:
//! - Per-model weights and fallback order
//! - Provider health for that model
//! - Key availability for the caller's priority

mod balancer;
mod gateway;

pub use balancer::{BalancerConfig, BalancerConfigs, CallLabels, LoadBalancer, ProviderSelection};
pub use gateway::{CallStatus, CompletionOutcome, Gateway, Receipt};
