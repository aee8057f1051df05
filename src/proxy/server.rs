//! HTTP server setup, state bootstrap and background tasks.

use axum::{
    routing::{get, patch, post, put},
    Router,
};
use chrono::Utc;
use reqwest::Client;
use secrecy::SecretString;
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;

use super::{balancer, checks, handlers, keys, usage};
use crate::config::Config;
use crate::crypto::{key_hash, KeyVault};
use crate::error::{Error, Result};
use crate::health::{self, HealthSettings, HealthTracker};
use crate::ledger::{Pricing, UsageLedger};
use crate::pool::{KeyPool, KeySettings, PooledKey};
use crate::router::{BalancerConfigs, Gateway, LoadBalancer};
use crate::storage;
use crate::types::{KeyStatus, Provider};

/// Timeout for providers reached through a built-in default URL.
const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// How often the billing-period rollover is checked.
const ROLLOVER_CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Where and how to reach one provider.
#[derive(Debug, Clone)]
pub struct ProviderEndpoint {
    pub base_url: String,
    pub timeout: Duration,
}

impl ProviderEndpoint {
    pub fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }
}

/// Configured endpoints, falling back to each vendor's public URL.
fn build_endpoints(config: &Config) -> HashMap<Provider, ProviderEndpoint> {
    Provider::ALL
        .into_iter()
        .filter_map(|provider| {
            let endpoint = match config.provider(provider) {
                Some(p) => ProviderEndpoint {
                    base_url: p.url.clone(),
                    timeout: p.timeout(),
                },
                None => ProviderEndpoint {
                    base_url: provider.default_base_url()?.to_string(),
                    timeout: DEFAULT_UPSTREAM_TIMEOUT,
                },
            };
            Some((provider, endpoint))
        })
        .collect()
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<Gateway>,
    pub http_client: Client,
    pub config: Arc<Config>,
    pub db: SqlitePool,
    pub vault: Arc<KeyVault>,
    pub endpoints: Arc<HashMap<Provider, ProviderEndpoint>>,
}

impl AppState {
    /// Assemble the pool, tracker, balancer and ledger from `config` and
    /// an already-migrated database.
    ///
    /// Rolls stale monthly counters, registers configured system keys,
    /// seeds balancer configs for models without a stored row, then loads
    /// keys and configs into memory.
    pub async fn build(config: Config, db: SqlitePool, vault: KeyVault) -> Result<Self> {
        let endpoints = build_endpoints(&config);

        let rolled = storage::keys::roll_usage_period(&db, &storage::usage_period(Utc::now())).await?;
        if rolled > 0 {
            tracing::info!(keys = rolled, "Monthly key usage reset for new period");
        }

        register_system_keys(&config, &db, &vault).await?;

        for seed in &config.balancer {
            let balancer_config = seed.to_balancer_config()?;
            if storage::balancer::insert_if_absent(&db, &balancer_config).await? {
                tracing::info!(model = %balancer_config.model_name, "Seeded balancer config");
            }
        }

        let pool = KeyPool::new(KeySettings::from(&config.pool));
        for row in storage::keys::load_all(&db).await? {
            let key_id = row.id;
            match row.decode(&vault) {
                Ok(key) if endpoints.contains_key(&key.provider) => pool.insert(key),
                Ok(key) => tracing::warn!(
                    key_id,
                    provider = %key.provider,
                    "No endpoint for provider, key not pooled"
                ),
                Err(e) => tracing::warn!(key_id, error = %e, "Skipping unreadable key"),
            }
        }

        let configs = BalancerConfigs::from_configs(storage::balancer::load_all(&db).await?);
        for balancer_config in configs.list() {
            for provider in &balancer_config.fallback_order {
                if !pool.has_keys(*provider) {
                    tracing::warn!(
                        model = %balancer_config.model_name,
                        provider = %provider,
                        "Fallback provider has no pooled keys"
                    );
                }
            }
        }

        tracing::info!(
            keys = pool.len(),
            models = configs.list().len(),
            "Key pool and balancer configs loaded"
        );

        let health = Arc::new(HealthTracker::new(HealthSettings::from(&config.health)));
        let balancer = LoadBalancer::new(
            Arc::new(configs),
            pool,
            health,
            config.routing.degraded_provider,
        );
        let ledger = UsageLedger::new(db.clone(), Pricing::from_providers(&config.providers));

        let http_client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Internal(format!("HTTP client: {}", e)))?;

        Ok(Self {
            gateway: Arc::new(Gateway::new(Arc::new(balancer), ledger)),
            http_client,
            config: Arc::new(config),
            db,
            vault: Arc::new(vault),
            endpoints: Arc::new(endpoints),
        })
    }

    pub fn pool(&self) -> &KeyPool {
        self.gateway.balancer().pool()
    }

    pub fn health(&self) -> &Arc<HealthTracker> {
        self.gateway.balancer().health()
    }

    pub fn configs(&self) -> &Arc<BalancerConfigs> {
        self.gateway.balancer().configs()
    }

    pub fn ledger(&self) -> &UsageLedger {
        self.gateway.ledger()
    }

    pub fn endpoint(&self, provider: Provider) -> Option<&ProviderEndpoint> {
        self.endpoints.get(&provider)
    }
}

/// Store keys given in `[[providers]]` (or convention env vars) as
/// system-owned keys. Keys already stored are left as they are.
async fn register_system_keys(config: &Config, db: &SqlitePool, vault: &KeyVault) -> Result<()> {
    for provider in &config.providers {
        let Some(api_key) = &provider.api_key else {
            continue;
        };
        let hash = key_hash(api_key.expose_secret());
        if storage::keys::find_id_by_hash(db, &hash).await?.is_some() {
            continue;
        }
        let new_key = storage::keys::NewKey {
            donor_user_id: None,
            provider: provider.name,
            key_hash: hash,
            encrypted_key: vault.encrypt(api_key.expose_secret().trim())?,
            nickname: Some(format!("{} system key", provider.name)),
            monthly_limit: provider.monthly_limit,
        };
        let id = new_key.insert(db).await?;
        tracing::info!(key_id = id, provider = %provider.name, "Registered system key");
    }
    Ok(())
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // OpenAI-compatible endpoints
        .route("/v1/chat/completions", post(handlers::chat_completions))
        .route("/v1/models", get(handlers::list_models))
        // Key pool
        .route("/v1/keys", post(keys::donate_key).get(keys::list_keys))
        .route("/v1/keys/:id", patch(keys::update_key).delete(keys::delete_key))
        // Balancer configs
        .route("/v1/balancer", get(balancer::list_configs))
        .route(
            "/v1/balancer/:model",
            put(balancer::put_config).delete(balancer::delete_config),
        )
        // Usage and contributions
        .route("/v1/usage/:user_id", get(usage::user_usage))
        .route("/v1/contributions/:user_id", get(usage::contribution))
        .route("/v1/community/stats", get(usage::community_stats))
        .route("/v1/community/leaderboard", get(usage::leaderboard))
        .route("/health", get(handlers::health))
        .route("/health/check", post(checks::run_health_check))
        // State and middleware
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Periodically start a new billing period once the calendar month turns.
pub fn spawn_period_rollover(state: AppState, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let label = storage::usage_period(Utc::now());
            match storage::keys::roll_usage_period(&state.db, &label).await {
                Ok(0) => {}
                Ok(rolled) => {
                    state.pool().reset_monthly_usage();
                    tracing::info!(keys = rolled, period = %label, "Started new billing period");
                }
                Err(e) => tracing::warn!(error = %e, "Billing period rollover failed"),
            }
        }
    })
}

/// Vault for key material, keyed by `[security].encryption_key`.
fn build_vault(config: &Config) -> KeyVault {
    match &config.security.encryption_key {
        Some(key) => KeyVault::new(key.expose_secret()),
        None => {
            tracing::warn!(
                "No security.encryption_key set; using an ephemeral key. \
                 Stored keys will be unreadable after restart"
            );
            KeyVault::ephemeral()
        }
    }
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let db_config = config.database();
    let flush_interval = Duration::from_secs(config.health.flush_interval_secs.max(1));
    let check_interval = config.health.check_interval_secs;

    let db = storage::init_pool(&db_config.path).await?;
    tracing::info!(path = %db_config.path, "Database ready");

    let vault = build_vault(&config);
    let state = AppState::build(config, db.clone(), vault).await?;

    health::spawn_flush(state.health().clone(), db, flush_interval);
    spawn_period_rollover(state.clone(), ROLLOVER_CHECK_INTERVAL);
    if check_interval > 0 {
        checks::spawn_health_checks(state.clone(), Duration::from_secs(check_interval));
        tracing::info!(interval_secs = check_interval, "Background health checks enabled");
    }

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting keyrelay server");

    axum::serve(listener, app).await?;

    Ok(())
}

/// Build a pooled key for a freshly donated secret.
pub(super) fn fresh_key(
    id: i64,
    donor_user_id: Option<i64>,
    provider: Provider,
    nickname: Option<String>,
    secret: SecretString,
    monthly_limit: Option<f64>,
) -> PooledKey {
    PooledKey {
        id,
        donor_user_id,
        provider,
        nickname,
        secret,
        monthly_limit,
        usage_this_month: 0.0,
        total_usage: 0.0,
        requests_this_month: 0,
        status: KeyStatus::Active,
        cooldown_until: None,
        last_used: None,
    }
}
