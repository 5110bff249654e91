use anyhow::{Context, Result};
use signage_player::{HeadlessSurface, Scope, Settings, SignagePlayer, Surfaces};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::var("SIGNAGE_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("signage.toml"));
    let settings = Settings::load(&config_path)
        .with_context(|| format!("Failed to load settings from {}", config_path.display()))?;

    tracing::info!(
        "Starting signage player for device {} on {}",
        settings.device.device_id,
        settings.server_url
    );

    // Headless until a windowing backend is wired in.
    let (a, b, _probe) = HeadlessSurface::pair();
    let surfaces = Surfaces::new(Box::new(a), Box::new(b));

    let scope = Scope::from_settings(&settings);
    let player = SignagePlayer::initialize(settings, scope, surfaces)
        .await
        .context("Failed to start playback")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    tracing::info!("Shutting down");

    if let Ok(status) = player.status().await {
        tracing::info!(
            "Final state {} at item {} of {}",
            status.state.as_str(),
            status.current_index + 1,
            status.playlist_len
        );
    }
    player.shutdown().await?;

    Ok(())
}
