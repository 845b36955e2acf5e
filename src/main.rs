use anyhow::Result;
use forge::{config::Config, heal, iaas, Storage};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "forge=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Forge - IaaS provisioning and self-healing");

    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "forge.yaml".to_string());
    let config = if Path::new(&config_path).exists() {
        Config::load(Path::new(&config_path)).await?
    } else {
        tracing::warn!("config file {} not found, using defaults", config_path);
        Config::default()
    };
    let config = Arc::new(config);

    let database_url = config
        .get_string("database:url")
        .unwrap_or_else(|| "sqlite:forge.db?mode=rwc".to_string());
    let storage = Storage::new(&database_url).await?;

    tracing::info!("Running database migrations");
    storage.migrate().await?;

    let catalog = Arc::new(storage.machines());
    for kind in iaas::registered_kinds() {
        let provider = iaas::resolve(kind, kind, config.clone(), catalog.clone())?;
        tracing::info!("Registered IaaS provider {}:\n{}", kind, provider.describe());
    }

    // Healers run on a fixed cadence; each iteration probes and heals only
    // when the probe says so.
    let interval = Duration::from_secs(config.get_u64("heal:interval-secs").unwrap_or(60));
    tracing::info!(
        "Starting heal loop for {:?} every {:?}",
        heal::registered_names(),
        interval
    );
    loop {
        for name in heal::registered_names() {
            if let Err(e) = heal::run(name).await {
                tracing::error!("Healer {} failed: {}", name, e);
            }
        }
        tokio::time::sleep(interval).await;
    }
}
