//! Service entry point
//!
//! Loads configuration (JSON or TOML file named by `SENTINEL_CONFIG_PATH`,
//! defaults applied otherwise), overlays secrets from the environment, and
//! serves the API until interrupted.

use sentinel::api::{start_server, AppState};
use sentinel::config::SentinelConfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = match std::env::var("SENTINEL_CONFIG_PATH") {
        Ok(path) => SentinelConfig::from_file(&path)?,
        Err(_) => {
            warn!("SENTINEL_CONFIG_PATH not set; using built-in defaults");
            SentinelConfig::default()
        }
    };
    config.apply_env();

    info!(
        app = %config.app.name,
        version = %config.app.version,
        environment = %config.app.environment,
        "starting"
    );

    let state = AppState::initialize(config).await?;
    start_server(state).await?;

    info!("server stopped");
    Ok(())
}
