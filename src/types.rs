//! Shared domain enums: providers, key and health status, contribution tiers.
//!
//! Each concept is defined once here and used by storage, the pool,
//! the router and the HTTP layer alike.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// An upstream AI inference vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    OpenAi,
    Anthropic,
    Google,
    Cohere,
    Replicate,
    HuggingFace,
    Azure,
    Bedrock,
}

impl Provider {
    pub const ALL: [Provider; 8] = [
        Provider::OpenAi,
        Provider::Anthropic,
        Provider::Google,
        Provider::Cohere,
        Provider::Replicate,
        Provider::HuggingFace,
        Provider::Azure,
        Provider::Bedrock,
    ];

    /// Lowercase wire/database name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::OpenAi => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Google => "google",
            Provider::Cohere => "cohere",
            Provider::Replicate => "replicate",
            Provider::HuggingFace => "huggingface",
            Provider::Azure => "azure",
            Provider::Bedrock => "bedrock",
        }
    }

    /// Public OpenAI-compatible base URL, for vendors that offer one.
    /// Azure and Bedrock endpoints are per-account and must be configured.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Provider::OpenAi => Some("https://api.openai.com/v1"),
            Provider::Anthropic => Some("https://api.anthropic.com/v1"),
            Provider::Google => Some("https://generativelanguage.googleapis.com/v1beta/openai"),
            Provider::Cohere => Some("https://api.cohere.ai/compatibility/v1"),
            Provider::HuggingFace => Some("https://router.huggingface.co/v1"),
            Provider::Replicate | Provider::Azure | Provider::Bedrock => None,
        }
    }

    /// Cheapest chat model, used for one-token key and health checks.
    pub fn check_model(&self) -> &'static str {
        match self {
            Provider::OpenAi | Provider::Azure => "gpt-3.5-turbo",
            Provider::Anthropic => "claude-3-haiku-20240307",
            Provider::Google => "gemini-pro",
            Provider::Cohere => "command-r",
            Provider::Replicate => "meta/meta-llama-3-8b-instruct",
            Provider::HuggingFace => "meta-llama/Meta-Llama-3-8B-Instruct",
            Provider::Bedrock => "anthropic.claude-3-haiku-20240307-v1:0",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Provider {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Provider::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownVariant::new("provider", s))
    }
}

/// Lifecycle status of a pooled key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStatus {
    Active,
    Inactive,
    Expired,
    RateLimited,
    Error,
}

impl KeyStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStatus::Active => "active",
            KeyStatus::Inactive => "inactive",
            KeyStatus::Expired => "expired",
            KeyStatus::RateLimited => "rate_limited",
            KeyStatus::Error => "error",
        }
    }
}

impl fmt::Display for KeyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(KeyStatus::Active),
            "inactive" => Ok(KeyStatus::Inactive),
            "expired" => Ok(KeyStatus::Expired),
            "rate_limited" => Ok(KeyStatus::RateLimited),
            "error" => Ok(KeyStatus::Error),
            other => Err(UnknownVariant::new("key status", other)),
        }
    }
}

/// Coarse health classification of a (provider, model) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Down,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Down => "down",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HealthStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "healthy" => Ok(HealthStatus::Healthy),
            "degraded" => Ok(HealthStatus::Degraded),
            "down" => Ok(HealthStatus::Down),
            other => Err(UnknownVariant::new("health status", other)),
        }
    }
}

/// Donation-derived contribution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContributionTier {
    Basic,
    Supporter,
    Patron,
    Benefactor,
}

/// Benefits attached to a tier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TierBenefits {
    pub tier: ContributionTier,
    /// Monthly usage allowance in USD.
    pub monthly_usage_limit: f64,
    /// Higher number = higher priority.
    pub priority_level: u8,
}

impl ContributionTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContributionTier::Basic => "basic",
            ContributionTier::Supporter => "supporter",
            ContributionTier::Patron => "patron",
            ContributionTier::Benefactor => "benefactor",
        }
    }

    /// Tier reached by a cumulative donation total.
    pub fn for_total_donated(total_usd: f64) -> TierBenefits {
        let (tier, monthly_usage_limit, priority_level) = if total_usd >= 500.0 {
            (ContributionTier::Benefactor, 100.0, 4)
        } else if total_usd >= 100.0 {
            (ContributionTier::Patron, 50.0, 3)
        } else if total_usd >= 25.0 {
            (ContributionTier::Supporter, 25.0, 2)
        } else {
            (ContributionTier::Basic, 5.0, 1)
        };
        TierBenefits {
            tier,
            monthly_usage_limit,
            priority_level,
        }
    }
}

impl fmt::Display for ContributionTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContributionTier {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "basic" => Ok(ContributionTier::Basic),
            "supporter" => Ok(ContributionTier::Supporter),
            "patron" => Ok(ContributionTier::Patron),
            "benefactor" => Ok(ContributionTier::Benefactor),
            other => Err(UnknownVariant::new("contribution tier", other)),
        }
    }
}

/// Who is asking for a route. Anonymous callers get basic priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserAccess {
    pub user_id: Option<i64>,
    pub priority_level: u8,
}

impl UserAccess {
    pub fn anonymous() -> Self {
        Self {
            user_id: None,
            priority_level: 1,
        }
    }

    pub fn new(user_id: i64, priority_level: u8) -> Self {
        Self {
            user_id: Some(user_id),
            priority_level,
        }
    }
}

/// A string that did not name any variant of an enum.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
