//! OpenAI-compatible request types and the JSON bodies of the admin API.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::router::BalancerConfig;
use crate::types::{KeyStatus, Provider};

/// Chat completion request (OpenAI-compatible).
///
/// Fields keyrelay does not interpret are carried in `extra` and forwarded
/// to the provider unchanged.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<StopSequence>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A chat message. Content may be a string or a list of parts.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Message {
    pub role: String,
    pub content: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Stop sequence can be a string or array of strings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum StopSequence {
    Single(String),
    Multiple(Vec<String>),
}

/// Token usage statistics.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

impl ChatCompletionRequest {
    pub fn is_streaming(&self) -> bool {
        self.stream.unwrap_or(false)
    }
}

/// Extract token usage from a provider response.
///
/// Returns None if usage is missing or lacks either token count.
pub fn extract_usage(response: &serde_json::Value) -> Option<Usage> {
    let usage = response.get("usage").filter(|u| !u.is_null())?;
    serde_json::from_value(usage.clone()).ok()
}

/// Body of POST /v1/keys.
#[derive(Debug, Deserialize)]
pub struct DonateKeyRequest {
    pub provider: Provider,
    pub api_key: String,
    pub nickname: Option<String>,
    /// Monthly USD the donor allows this key to spend. Also the amount
    /// credited to the donor.
    pub monthly_limit: Option<f64>,
}

/// Body of PATCH /v1/keys/{id}.
#[derive(Debug, Default, Deserialize)]
pub struct UpdateKeyRequest {
    pub nickname: Option<String>,
    /// Absent leaves the limit alone; `null` makes the key unlimited.
    #[serde(default, deserialize_with = "present")]
    pub monthly_limit: Option<Option<f64>>,
    pub status: Option<KeyStatus>,
}

/// Maps a present field (even `null`) to `Some`, so an absent field and an
/// explicit `null` stay distinguishable.
fn present<'de, T, D>(deserializer: D) -> Result<Option<T>, D::Error>
where
    T: Deserialize<'de>,
    D: serde::Deserializer<'de>,
{
    T::deserialize(deserializer).map(Some)
}

/// Body of PUT /v1/balancer/{model}.
#[derive(Debug, Deserialize)]
pub struct BalancerConfigBody {
    pub provider_weights: BTreeMap<Provider, f64>,
    pub fallback_order: Vec<Provider>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_min_healthy_keys")]
    pub min_healthy_keys: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_enabled() -> bool {
    true
}

fn default_min_healthy_keys() -> u32 {
    1
}

fn default_health_check_interval() -> u64 {
    300
}

impl BalancerConfigBody {
    pub fn into_config(self, model_name: String) -> BalancerConfig {
        BalancerConfig {
            model_name,
            provider_weights: self.provider_weights,
            fallback_order: self.fallback_order,
            enabled: self.enabled,
            min_healthy_keys: self.min_healthy_keys,
            health_check_interval_secs: self.health_check_interval_secs,
        }
    }
}
