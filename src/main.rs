use anyhow::Context;
use e3dc_modbus_bridge::{Config, ConfigLayer, Coordinator, EnergyCheckpoint, Snapshot};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting E3/DC modbus bridge {}", env!("CARGO_PKG_VERSION"));

    let data = ConfigLayer::from_env().context("reading E3DC_* environment")?;
    let options = match env::var("E3DC_OPTIONS") {
        Ok(path) => ConfigLayer::from_json_file(&path)
            .with_context(|| format!("loading options from {path}"))?,
        Err(_) => ConfigLayer::default(),
    };
    let config = Config::resolve(&data, &options).context("invalid configuration")?;

    let state_file = PathBuf::from(
        env::var("E3DC_STATE_FILE").unwrap_or_else(|_| "e3dc_energy.json".to_string()),
    );
    let restored = EnergyCheckpoint::load(&state_file).context("loading energy state")?;

    let coordinator = Coordinator::setup(config, &restored)
        .await
        .context("E3/DC setup failed")?;
    let poller = tokio::spawn(coordinator.clone().run());
    let reporter = tokio::spawn(report_snapshots(coordinator.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("listening for ctrl-c")?;
    info!("Shutdown requested");

    coordinator.shutdown().await;
    reporter.abort();
    if let Err(e) = poller.await {
        error!("Poll task ended abnormally: {e}");
    }

    coordinator
        .checkpoint()
        .await
        .save(&state_file)
        .with_context(|| format!("saving energy state to {}", state_file.display()))?;
    info!("Energy state saved to {}", state_file.display());
    Ok(())
}

/// Logs a short line for every published snapshot.
async fn report_snapshots(coordinator: Arc<Coordinator>) {
    let mut updates = coordinator.subscribe();
    while updates.changed().await.is_ok() {
        let snapshot = updates.borrow_and_update().clone();
        if let Some(snapshot) = snapshot {
            log_snapshot(&snapshot);
            let energy = coordinator.energy().await;
            info!("Energy (kWh): {energy:?}");
        }
    }
}

fn log_snapshot(snapshot: &Snapshot) {
    let field = |name: &str| {
        snapshot
            .number(name)
            .map_or_else(|| "unknown".to_string(), |v| v.to_string())
    };
    info!(
        "PV {}W, battery {}W ({}%), house {}W, grid {}W, wallbox {}W, autarky {}%",
        field("pv_power"),
        field("battery_power"),
        field("battery_soc"),
        field("house_power"),
        field("grid_power"),
        field("wallbox_power"),
        field("autarky"),
    );
}
