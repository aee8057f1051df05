//! Configuration parsing and validation for keyrelay.

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use crate::router::BalancerConfig;
use crate::types::Provider;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
    #[serde(default)]
    pub balancer: Vec<BalancerSeed>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP server configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_listen")]
    pub listen: String,
}

fn default_listen() -> String {
    "127.0.0.1:8080".to_string()
}

/// Database configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// Path to SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

fn default_db_path() -> String {
    "./keyrelay.db".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Secret wrapper that redacts in Debug/Display/Serialize and zeroizes on drop.
///
/// Used for provider API keys and the storage encryption key. The raw value
/// is only reachable through `.expose_secret()`.
#[derive(Clone)]
pub struct ApiKey(SecretString);

impl ApiKey {
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl std::fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for ApiKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Serialize for ApiKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("[REDACTED]")
    }
}

impl<'de> serde::Deserialize<'de> for ApiKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(|s| ApiKey(SecretString::from(s)))
    }
}

impl From<String> for ApiKey {
    fn from(s: String) -> Self {
        ApiKey(SecretString::from(s))
    }
}

impl From<&str> for ApiKey {
    fn from(s: &str) -> Self {
        ApiKey(SecretString::from(s))
    }
}

/// How a secret value was resolved.
#[derive(Debug, Clone, PartialEq)]
pub enum KeySource {
    /// Literal string in config (no ${} references)
    Literal,
    /// Contained ${VAR} references expanded from environment
    EnvExpanded,
    /// Auto-discovered from convention env var (holds var name)
    Convention(String),
    /// Nothing configured
    None,
}

impl std::fmt::Display for KeySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeySource::Literal => write!(f, "config-literal"),
            KeySource::EnvExpanded => write!(f, "env-expanded"),
            KeySource::Convention(var) => write!(f, "convention ({})", var),
            KeySource::None => write!(f, "none"),
        }
    }
}

/// Encryption of stored key material.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityConfig {
    /// Key used to encrypt donated API keys at rest. When absent an
    /// ephemeral key is generated and previously stored keys are unreadable.
    pub encryption_key: Option<ApiKey>,
}

/// Key pool tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Maximum simultaneous in-flight requests per key
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_per_key: u32,
    /// Cooldown applied to a throttled key when the provider gives no Retry-After
    #[serde(default = "default_cooldown_secs")]
    pub rate_limit_cooldown_secs: u64,
    /// Consecutive hard failures before a key is marked `error`
    #[serde(default = "default_error_threshold")]
    pub error_threshold: u32,
    /// Concurrency slots per key reserved for priority users
    #[serde(default = "default_reserved_slots")]
    pub priority_reserved_slots: u32,
    /// Minimum priority level that may use reserved slots
    #[serde(default = "default_priority_threshold")]
    pub priority_threshold: u8,
    /// Minimum USD held against a limited key's headroom per in-flight request
    #[serde(default = "default_cost_reserve")]
    pub cost_reserve_usd: f64,
    /// Send a one-token test request before accepting a donated key
    #[serde(default = "default_validate_on_donate")]
    pub validate_on_donate: bool,
}

fn default_max_concurrent() -> u32 {
    4
}

fn default_cooldown_secs() -> u64 {
    60
}

fn default_error_threshold() -> u32 {
    3
}

fn default_reserved_slots() -> u32 {
    1
}

fn default_priority_threshold() -> u8 {
    2
}

fn default_cost_reserve() -> f64 {
    0.01
}

fn default_validate_on_donate() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_key: default_max_concurrent(),
            rate_limit_cooldown_secs: default_cooldown_secs(),
            error_threshold: default_error_threshold(),
            priority_reserved_slots: default_reserved_slots(),
            priority_threshold: default_priority_threshold(),
            cost_reserve_usd: default_cost_reserve(),
            validate_on_donate: default_validate_on_donate(),
        }
    }
}

impl PoolConfig {
    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_secs(self.rate_limit_cooldown_secs)
    }
}

/// Health tracker tuning.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthConfig {
    /// Success rate below which a (provider, model) pair is unhealthy
    #[serde(default = "default_success_threshold")]
    pub success_threshold: f64,
    /// Failures within one check interval that mark a pair unhealthy
    #[serde(default = "default_burst_threshold")]
    pub burst_threshold: u32,
    /// EWMA smoothing factor in (0, 1]
    #[serde(default = "default_smoothing")]
    pub smoothing: f64,
    /// How often health snapshots are written to the database
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    /// Seconds between background health checks; 0 disables them
    #[serde(default)]
    pub check_interval_secs: u64,
}

fn default_success_threshold() -> f64 {
    0.5
}

fn default_burst_threshold() -> u32 {
    5
}

fn default_smoothing() -> f64 {
    0.2
}

fn default_flush_interval() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            success_threshold: default_success_threshold(),
            burst_threshold: default_burst_threshold(),
            smoothing: default_smoothing(),
            flush_interval_secs: default_flush_interval(),
            check_interval_secs: 0,
        }
    }
}

/// Routing and failover behaviour.
#[derive(Debug, Clone, Deserialize)]
pub struct RoutingConfig {
    /// Failovers allowed per logical request after the first attempt
    #[serde(default = "default_max_failovers")]
    pub max_failovers: u32,
    /// Provider used alone when a model is short of healthy keys
    pub degraded_provider: Option<Provider>,
}

fn default_max_failovers() -> u32 {
    2
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_failovers: default_max_failovers(),
            degraded_provider: None,
        }
    }
}

/// Upstream provider endpoint configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderConfig {
    pub name: Provider,
    /// Base URL of an OpenAI-compatible API (e.g., "https://api.openai.com/v1")
    pub url: String,
    /// Optional system-owned key registered into the pool at startup
    pub api_key: Option<ApiKey>,
    /// Monthly USD limit for the system-owned key
    pub monthly_limit: Option<f64>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// USD per 1000 prompt tokens (defaults to built-in table)
    pub input_cost_per_1k: Option<f64>,
    /// USD per 1000 completion tokens (defaults to built-in table)
    pub output_cost_per_1k: Option<f64>,
}

fn default_timeout_secs() -> u64 {
    60
}

impl ProviderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Initial load balancer config for a model, written to the database
/// when no row exists for that model yet.
#[derive(Debug, Clone, Deserialize)]
pub struct BalancerSeed {
    pub model: String,
    #[serde(default)]
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub fallback: Vec<Provider>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_min_healthy_keys")]
    pub min_healthy_keys: u32,
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,
}

fn default_min_healthy_keys() -> u32 {
    1
}

fn default_health_check_interval() -> u64 {
    300
}

impl BalancerSeed {
    /// Convert into a balancer config, resolving weight keys to providers.
    pub fn to_balancer_config(&self) -> Result<BalancerConfig, ConfigError> {
        let mut weights = BTreeMap::new();
        for (name, weight) in &self.weights {
            let provider: Provider = name.parse().map_err(|e| {
                ConfigError::Validation(format!("Balancer '{}': {}", self.model, e))
            })?;
            weights.insert(provider, *weight);
        }

        let config = BalancerConfig {
            model_name: self.model.clone(),
            provider_weights: weights,
            fallback_order: self.fallback.clone(),
            enabled: self.enabled,
            min_healthy_keys: self.min_healthy_keys,
            health_check_interval_secs: self.health_check_interval_secs,
        };
        config
            .validate()
            .map_err(|e| ConfigError::Validation(format!("Balancer '{}': {}", self.model, e)))?;
        Ok(config)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Whether to log a line for every incoming chat completion
    #[serde(default = "default_true")]
    pub log_requests: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            log_requests: true,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::parse_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content).map_err(ConfigError::Parse)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.providers.is_empty() {
            tracing::warn!("No providers configured - every route will be exhausted");
        }

        for (i, provider) in self.providers.iter().enumerate() {
            if provider.url.is_empty() {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' has empty URL",
                    provider.name
                )));
            }
            if self.providers[..i].iter().any(|p| p.name == provider.name) {
                return Err(ConfigError::Validation(format!(
                    "Provider '{}' configured more than once",
                    provider.name
                )));
            }
        }

        if self.pool.max_concurrent_per_key == 0 {
            return Err(ConfigError::Validation(
                "pool.max_concurrent_per_key must be at least 1".to_string(),
            ));
        }
        if self.pool.priority_reserved_slots >= self.pool.max_concurrent_per_key {
            return Err(ConfigError::Validation(
                "pool.priority_reserved_slots must be below max_concurrent_per_key".to_string(),
            ));
        }
        if !(self.pool.cost_reserve_usd.is_finite() && self.pool.cost_reserve_usd >= 0.0) {
            return Err(ConfigError::Validation(
                "pool.cost_reserve_usd must be a non-negative number".to_string(),
            ));
        }
        if !(self.health.smoothing > 0.0 && self.health.smoothing <= 1.0) {
            return Err(ConfigError::Validation(
                "health.smoothing must be in (0, 1]".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.health.success_threshold) {
            return Err(ConfigError::Validation(
                "health.success_threshold must be in [0, 1]".to_string(),
            ));
        }

        for seed in &self.balancer {
            seed.to_balancer_config()?;
        }

        Ok(())
    }

    /// Get database config with defaults.
    pub fn database(&self) -> DatabaseConfig {
        self.database.clone().unwrap_or_default()
    }

    /// Endpoint config for a provider, if configured.
    pub fn provider(&self, provider: Provider) -> Option<&ProviderConfig> {
        self.providers.iter().find(|p| p.name == provider)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Configuration validation error: {0}")]
    Validation(String),

    #[error("Environment variable '{var}' not set for '{owner}': {message}")]
    EnvVar {
        var: String,
        owner: String,
        message: String,
    },
}

/// Raw provider config deserialized directly from TOML.
/// api_key is `Option<String>` so it may contain `${VAR}` references not yet expanded.
#[derive(Deserialize)]
pub struct RawProviderConfig {
    name: Provider,
    url: String,
    api_key: Option<String>,
    monthly_limit: Option<f64>,
    #[serde(default = "default_timeout_secs")]
    timeout_secs: u64,
    input_cost_per_1k: Option<f64>,
    output_cost_per_1k: Option<f64>,
}

/// Raw security section; the encryption key may contain `${VAR}` references.
#[derive(Deserialize, Default)]
pub struct RawSecurityConfig {
    encryption_key: Option<String>,
}

/// Raw configuration deserialized directly from TOML.
#[derive(Deserialize)]
pub struct RawConfig {
    server: ServerConfig,
    database: Option<DatabaseConfig>,
    #[serde(default)]
    security: RawSecurityConfig,
    #[serde(default)]
    pool: PoolConfig,
    #[serde(default)]
    health: HealthConfig,
    #[serde(default)]
    routing: RoutingConfig,
    #[serde(default)]
    providers: Vec<RawProviderConfig>,
    #[serde(default)]
    balancer: Vec<BalancerSeed>,
    #[serde(default)]
    logging: LoggingConfig,
}

/// Expand all `${VAR}` references in a string using a custom lookup function.
///
/// Supports multiple `${VAR}` in one string. Fails on the first missing
/// variable, an unclosed `${`, or an empty variable name.
fn expand_env_vars_with<F>(input: &str, owner: &str, lookup: F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if !input.contains("${") {
        return Ok(input.to_string());
    }

    let mut result = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        result.push_str(&rest[..start]);
        let after = &rest[start + 2..];

        let end = after.find('}').ok_or_else(|| ConfigError::EnvVar {
            var: "<unclosed>".to_string(),
            owner: owner.to_string(),
            message: format!("Unclosed '${{' in config value: {}", input),
        })?;

        let var_name = &after[..end];
        if var_name.is_empty() {
            return Err(ConfigError::EnvVar {
                var: "".to_string(),
                owner: owner.to_string(),
                message: "Empty variable name in '${}' reference".to_string(),
            });
        }

        let value = lookup(var_name).ok_or_else(|| ConfigError::EnvVar {
            var: var_name.to_string(),
            owner: owner.to_string(),
            message: format!(
                "Environment variable '{}' is not set (referenced by '{}')",
                var_name, owner
            ),
        })?;

        result.push_str(&value);
        rest = &after[end + 1..];
    }

    result.push_str(rest);
    Ok(result)
}

fn expand_env_vars(input: &str, owner: &str) -> Result<String, ConfigError> {
    expand_env_vars_with(input, owner, |name| std::env::var(name).ok())
}

/// Convention env var holding a system-owned key for a provider:
/// `KEYRELAY_<PROVIDER>_API_KEY`, e.g. `KEYRELAY_OPENAI_API_KEY`.
pub fn convention_env_var_name(provider: Provider) -> String {
    format!("KEYRELAY_{}_API_KEY", provider.as_str().to_uppercase())
}

fn convention_key_lookup(provider: Provider) -> Option<(String, String)> {
    let var_name = convention_env_var_name(provider);
    std::env::var(&var_name).ok().map(|value| (var_name, value))
}

/// Resolve a raw secret: expand `${VAR}` references or take it literally.
fn resolve_secret(
    raw: Option<&str>,
    owner: &str,
) -> Result<(Option<ApiKey>, KeySource), ConfigError> {
    match raw {
        Some(raw_key) if raw_key.contains("${") => {
            let expanded = expand_env_vars(raw_key, owner)?;
            Ok((Some(ApiKey::from(expanded)), KeySource::EnvExpanded))
        }
        Some(raw_key) => Ok((Some(ApiKey::from(raw_key)), KeySource::Literal)),
        None => Ok((None, KeySource::None)),
    }
}

impl Config {
    /// Convert raw config to final config with env var expansion.
    ///
    /// Returns the config and, per provider, where its system key came from.
    /// Providers without an `api_key` fall back to the convention env var.
    pub fn from_raw(raw: RawConfig) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError> {
        let mut providers = Vec::with_capacity(raw.providers.len());
        let mut key_sources = Vec::with_capacity(raw.providers.len());

        for rp in raw.providers {
            let (api_key, source) = match resolve_secret(rp.api_key.as_deref(), rp.name.as_str())? {
                (None, _) => match convention_key_lookup(rp.name) {
                    Some((var_name, value)) => {
                        (Some(ApiKey::from(value)), KeySource::Convention(var_name))
                    }
                    None => (None, KeySource::None),
                },
                resolved => resolved,
            };

            key_sources.push((rp.name, source));

            providers.push(ProviderConfig {
                name: rp.name,
                url: rp.url,
                api_key,
                monthly_limit: rp.monthly_limit,
                timeout_secs: rp.timeout_secs,
                input_cost_per_1k: rp.input_cost_per_1k,
                output_cost_per_1k: rp.output_cost_per_1k,
            });
        }

        let (encryption_key, _) =
            resolve_secret(raw.security.encryption_key.as_deref(), "security.encryption_key")?;

        let config = Config {
            server: raw.server,
            database: raw.database,
            security: SecurityConfig { encryption_key },
            pool: raw.pool,
            health: raw.health,
            routing: raw.routing,
            providers,
            balancer: raw.balancer,
            logging: raw.logging,
        };

        Ok((config, key_sources))
    }

    /// Load configuration from a TOML file with environment variable expansion.
    pub fn from_file_with_env(
        path: impl AsRef<Path>,
    ) -> Result<(Self, Vec<(Provider, KeySource)>), ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        let raw: RawConfig = toml::from_str(&content).map_err(ConfigError::Parse)?;
        let (config, key_sources) = Self::from_raw(raw)?;
        config.validate()?;

        Ok((config, key_sources))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.server.listen, "127.0.0.1:9000");
        assert!(config.providers.is_empty());
        assert_eq!(config.pool.max_concurrent_per_key, 4);
        assert_eq!(config.routing.max_failovers, 2);
        assert_eq!(config.health.success_threshold, 0.5);
        assert!(config.pool.validate_on_donate);
        assert_eq!(config.health.check_interval_secs, 0);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            listen = "0.0.0.0:8080"

            [database]
            path = "./test.db"

            [pool]
            max_concurrent_per_key = 8
            rate_limit_cooldown_secs = 120
            priority_reserved_slots = 2

            [health]
            burst_threshold = 10

            [routing]
            max_failovers = 1
            degraded_provider = "openai"

            [[providers]]
            name = "openai"
            url = "https://api.openai.com/v1"
            timeout_secs = 30

            [[providers]]
            name = "anthropic"
            url = "https://anthropic.example.com/v1"
            output_cost_per_1k = 0.006

            [[balancer]]
            model = "gpt-x"
            weights = { openai = 0.7, anthropic = 0.3 }
            fallback = ["openai", "anthropic"]

            [logging]
            level = "debug"
        "#;

        let config = Config::parse_str(toml).unwrap();
        assert_eq!(config.providers.len(), 2);
        assert_eq!(config.providers[0].name, Provider::OpenAi);
        assert_eq!(config.providers[0].timeout(), Duration::from_secs(30));
        assert_eq!(config.pool.rate_limit_cooldown(), Duration::from_secs(120));
        assert_eq!(config.routing.degraded_provider, Some(Provider::OpenAi));
        assert_eq!(config.balancer.len(), 1);

        let balancer = config.balancer[0].to_balancer_config().unwrap();
        assert_eq!(balancer.provider_weights[&Provider::OpenAi], 0.7);
        assert_eq!(
            balancer.fallback_order,
            vec![Provider::OpenAi, Provider::Anthropic]
        );
        assert_eq!(balancer.min_healthy_keys, 1);
        assert_eq!(balancer.health_check_interval_secs, 300);
    }

    #[test]
    fn test_rejects_unknown_weight_provider() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [[balancer]]
            model = "m"
            weights = { mistral = 1.0 }
            fallback = []
        "#;

        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("mistral"), "{}", err);
    }

    #[test]
    fn test_rejects_negative_weight() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [[balancer]]
            model = "m"
            weights = { openai = -1.0 }
            fallback = ["openai"]
        "#;

        assert!(Config::parse_str(toml).is_err());
    }

    #[test]
    fn test_rejects_duplicate_provider() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [[providers]]
            name = "openai"
            url = "https://a.example.com/v1"

            [[providers]]
            name = "openai"
            url = "https://b.example.com/v1"
        "#;

        let err = Config::parse_str(toml).unwrap_err().to_string();
        assert!(err.contains("more than once"));
    }

    #[test]
    fn test_rejects_reserved_slots_at_cap() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [pool]
            max_concurrent_per_key = 2
            priority_reserved_slots = 2
        "#;

        assert!(Config::parse_str(toml).is_err());
    }

    #[test]
    fn test_api_key_redaction() {
        let key = ApiKey::from("sk-super-secret");
        assert_eq!(format!("{:?}", key), "[REDACTED]");
        assert_eq!(format!("{}", key), "[REDACTED]");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"[REDACTED]\"");
        assert_eq!(key.expose_secret(), "sk-super-secret");
    }

    #[test]
    fn test_provider_config_debug_redaction() {
        let toml = r#"
            [server]
            listen = "127.0.0.1:9000"

            [[providers]]
            name = "openai"
            url = "https://example.com/v1"
            api_key = "sk-literal-secret"
        "#;

        let config = Config::parse_str(toml).unwrap();
        let debug = format!("{:?}", config.providers[0]);
        assert!(debug.contains("[REDACTED]"));
        assert!(!debug.contains("sk-literal-secret"));
    }

    // ── Expansion tests (no global env state) ──

    #[test]
    fn test_expand_single_var() {
        let lookup = |name: &str| match name {
            "MY_KEY" => Some("sk-abcd".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("${MY_KEY}", "openai", lookup).unwrap();
        assert_eq!(result, "sk-abcd");
    }

    #[test]
    fn test_expand_mixed_literal_and_var() {
        let lookup = |name: &str| match name {
            "KEY" => Some("resolved".to_string()),
            _ => None,
        };
        let result = expand_env_vars_with("prefix-${KEY}-suffix", "openai", lookup).unwrap();
        assert_eq!(result, "prefix-resolved-suffix");
    }

    #[test]
    fn test_expand_missing_var_fails() {
        let result = expand_env_vars_with("${MISSING}", "security.encryption_key", |_| None);
        let err = result.unwrap_err().to_string();
        assert!(err.contains("MISSING"));
        assert!(err.contains("security.encryption_key"));
    }

    #[test]
    fn test_expand_unclosed_brace_fails() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let err = expand_env_vars_with("${UNCLOSED", "x", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("unclosed"));
    }

    #[test]
    fn test_expand_empty_var_name_fails() {
        let lookup = |_: &str| -> Option<String> { panic!("should not be called") };
        let err = expand_env_vars_with("${}", "x", lookup)
            .unwrap_err()
            .to_string()
            .to_lowercase();
        assert!(err.contains("empty"));
    }

    #[test]
    fn test_convention_env_var_name() {
        assert_eq!(
            convention_env_var_name(Provider::OpenAi),
            "KEYRELAY_OPENAI_API_KEY"
        );
        assert_eq!(
            convention_env_var_name(Provider::HuggingFace),
            "KEYRELAY_HUGGINGFACE_API_KEY"
        );
    }

    fn make_raw_config(name: Provider, api_key: Option<String>, enc: Option<String>) -> RawConfig {
        RawConfig {
            server: ServerConfig {
                listen: "127.0.0.1:9000".to_string(),
            },
            database: None,
            security: RawSecurityConfig {
                encryption_key: enc,
            },
            pool: PoolConfig::default(),
            health: HealthConfig::default(),
            routing: RoutingConfig::default(),
            providers: vec![RawProviderConfig {
                name,
                url: "https://example.com/v1".to_string(),
                api_key,
                monthly_limit: None,
                timeout_secs: 60,
                input_cost_per_1k: None,
                output_cost_per_1k: None,
            }],
            balancer: vec![],
            logging: LoggingConfig::default(),
        }
    }

    #[test]
    fn test_from_raw_literal_key() {
        let raw = make_raw_config(Provider::Cohere, Some("literal-key".to_string()), None);
        let (config, sources) = Config::from_raw(raw).unwrap();
        assert_eq!(sources[0], (Provider::Cohere, KeySource::Literal));
        assert_eq!(
            config.providers[0].api_key.as_ref().unwrap().expose_secret(),
            "literal-key"
        );
        assert!(config.security.encryption_key.is_none());
    }

    #[test]
    fn test_from_raw_expands_encryption_key() {
        let var_name = "KEYRELAY_TEST_ENC_KEY_EXPAND";
        unsafe { std::env::set_var(var_name, "vault-secret") };

        let raw = make_raw_config(
            Provider::Replicate,
            Some("k".to_string()),
            Some(format!("${{{}}}", var_name)),
        );
        let (config, _) = Config::from_raw(raw).unwrap();
        assert_eq!(
            config.security.encryption_key.unwrap().expose_secret(),
            "vault-secret"
        );

        unsafe { std::env::remove_var(var_name) };
    }

    #[test]
    fn test_from_raw_convention_key() {
        // Bedrock is not used by any other test in this module
        let var_name = convention_env_var_name(Provider::Bedrock);
        unsafe { std::env::set_var(&var_name, "bedrock-convention-key") };

        let raw = make_raw_config(Provider::Bedrock, None, None);
        let (config, sources) = Config::from_raw(raw).unwrap();
        assert_eq!(sources[0].1, KeySource::Convention(var_name.clone()));
        assert_eq!(
            config.providers[0].api_key.as_ref().unwrap().expose_secret(),
            "bedrock-convention-key"
        );

        unsafe { std::env::remove_var(&var_name) };
    }

    #[test]
    fn test_from_raw_missing_env_var_fails() {
        let var_name = "KEYRELAY_TEST_DEFINITELY_MISSING";
        unsafe { std::env::remove_var(var_name) };

        let raw = make_raw_config(Provider::Azure, Some(format!("${{{}}}", var_name)), None);
        let err = Config::from_raw(raw).unwrap_err().to_string();
        assert!(err.contains(var_name));
        assert!(err.contains("azure"));
    }
}
