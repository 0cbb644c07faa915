use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{FaceEngineService, BUS_NAME, OBJECT_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("mirrord starting");

    let config = Config::from_env().context("invalid configuration")?;
    tracing::info!(
        model_dir = %config.model_dir.display(),
        family = %config.model_family,
        threshold = config.similarity_threshold,
        iou_threshold = config.tracker.iou_threshold,
        max_missed = config.tracker.max_missed,
        "configuration loaded"
    );

    let engine = engine::build_engine(&config).context("failed to initialize face engine")?;
    let handle = engine::spawn_engine(engine)?;

    let service = FaceEngineService::new(
        handle.clone(),
        config.similarity_threshold,
        config.model_family,
        config.model_dir.clone(),
    );
    let connection = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the session bus")?;

    tracing::info!(bus_name = BUS_NAME, path = OBJECT_PATH, "mirrord ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("mirrord shutting down");

    drop(connection);
    handle.shutdown().await?;

    Ok(())
}
