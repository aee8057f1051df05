//! keyrelay - community key pool and load-balancing router for AI providers
//!
//! Serves an OpenAI-compatible endpoint that spreads each model's traffic
//! across providers and pooled keys.

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use keyrelay::config::{convention_env_var_name, Config, KeySource};
use keyrelay::types::Provider;

#[derive(Parser)]
#[command(name = "keyrelay")]
#[command(about = "Community key pool and load-balancing router for AI providers")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy server
    Serve {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,

        /// Override listen address
        #[arg(short, long)]
        listen: Option<String>,
    },

    /// Validate configuration file
    Check {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },

    /// Show configured providers and where their system keys come from
    Providers {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.toml")]
        config: String,
    },
}

fn init_tracing(level: &str) {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("keyrelay={level},tower_http={level}").into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn log_key_sources(key_sources: &[(Provider, KeySource)]) {
    for (provider, source) in key_sources {
        match source {
            KeySource::None => tracing::info!(
                provider = %provider,
                hint = %convention_env_var_name(*provider),
                "No system key; set the env var to register one"
            ),
            _ => tracing::info!(provider = %provider, source = %source, "System key resolved"),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, listen } => {
            let (mut cfg, key_sources) = Config::from_file_with_env(&config)?;
            init_tracing(&cfg.logging.level);
            tracing::info!(config = %config, "Configuration loaded");
            log_key_sources(&key_sources);

            if let Some(addr) = listen {
                tracing::info!(listen = %addr, "Override listen address");
                cfg.server.listen = addr;
            }

            keyrelay::proxy::run_server(cfg).await
        }

        Commands::Check { config } => {
            init_tracing("info");
            let (cfg, key_sources) = Config::from_file_with_env(&config)?;
            log_key_sources(&key_sources);
            println!(
                "Configuration OK: {} provider(s), {} balancer seed(s), database {}",
                cfg.providers.len(),
                cfg.balancer.len(),
                cfg.database().path
            );
            if cfg.security.encryption_key.is_none() {
                println!("Warning: security.encryption_key is not set");
            }
            Ok(())
        }

        Commands::Providers { config } => {
            init_tracing("warn");
            let (cfg, key_sources) = Config::from_file_with_env(&config)?;
            println!(
                "{:<12} {:<50} {:>10} {:>10}  {}",
                "PROVIDER", "URL", "IN/1K", "OUT/1K", "SYSTEM KEY"
            );
            for provider in &cfg.providers {
                let source = key_sources
                    .iter()
                    .find(|(p, _)| *p == provider.name)
                    .map_or(KeySource::None, |(_, s)| s.clone());
                println!(
                    "{:<12} {:<50} {:>10} {:>10}  {}",
                    provider.name.as_str(),
                    provider.url,
                    provider
                        .input_cost_per_1k
                        .map_or("-".to_string(), |r| format!("{:.4}", r)),
                    provider
                        .output_cost_per_1k
                        .map_or("-".to_string(), |r| format!("{:.4}", r)),
                    source
                );
            }
            Ok(())
        }
    }
}
