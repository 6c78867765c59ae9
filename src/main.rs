//! changeprop - change propagation service
//!
#![doc = "changeprop - change propagation service"]
#![doc = "Main entry point for the changeprop binary."]

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, warn};

use changeprop::cli::{Cli, Commands};
use changeprop::config::Config;
use changeprop::engine::{EngineSettings, HttpDispatcher};
use changeprop::kafka::{KafkaClientConfig, KafkaClientFactory};
use changeprop::logging::init_logging;
use changeprop::metrics::init_metrics_exporter;
use changeprop::ratelimit::{NoopRateLimiter, RateLimiter, WindowRateLimiter};
use changeprop::subscription::{ManagerDependencies, SubscriptionManager};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config_path = cli.config.as_deref().unwrap_or("config.yaml");
    let config = Config::load(config_path, &cli)?;

    match cli.command {
        Commands::Run { .. } => {
            config.validate()?;
            init_logging(&config.logging)?;
            info!(config = %config_path, rules = config.rules.len(), "Starting change propagation");
            run(config).await
        }
        Commands::Check => check(&config, config_path),
    }
}

/// Runs every configured rule until interrupted.
async fn run(config: Config) -> Result<()> {
    init_metrics_exporter();

    let client_config =
        KafkaClientConfig::from_settings(&config.kafka).context("Invalid Kafka settings")?;
    let factory = Arc::new(KafkaClientFactory::new(client_config));
    let producer = Arc::new(factory.create_producer()?);
    let metadata = Arc::new(factory.create_metadata()?);

    let rate_limiter: Arc<dyn RateLimiter> = if config.ratelimiter.is_empty() {
        Arc::new(NoopRateLimiter)
    } else {
        Arc::new(WindowRateLimiter::new(config.ratelimiter.limits()))
    };

    let settings = EngineSettings::from_config(&config);
    let deps = ManagerDependencies {
        consumers: factory,
        metadata,
        producer,
        http: Arc::new(HttpDispatcher::new(settings.request_timeout)?),
        rate_limiter,
        globals: Arc::new(config.globals.clone()),
        rule_options: config.rule_options(),
        group_prefix: config.kafka.group_prefix.clone(),
        discovery_interval: Duration::from_secs(config.engine.discovery_interval_secs),
        dedup_window: config.engine.dedup_window,
        settings,
    };

    let mut manager = SubscriptionManager::new(deps);
    if let Err(e) = manager.subscribe_all(&config.rules).await {
        manager.shutdown().await;
        return Err(e);
    }
    info!(rules = ?manager.rule_names(), "All rules subscribed");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    warn!("Shutdown signal received, draining in-flight work");
    manager.shutdown().await;
    info!("Shutdown complete");
    Ok(())
}

/// Compiles every rule and reports the result.
fn check(config: &Config, config_path: &str) -> Result<()> {
    config
        .validate()
        .with_context(|| format!("{} is invalid", config_path))?;
    println!("{}: {} rule(s) OK", config_path, config.rules.len());
    for (name, def) in &config.rules {
        println!("  {} -> {}", name, def.topic_specs().join(", "));
    }
    Ok(())
}
