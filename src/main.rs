use anyhow::{Result, anyhow};
use helios::Config;
use helios::dbus::BusExporter;
use helios::discovery::{Orchestrator, OrchestratorHandle, RtuLink};
use helios::logging::init_logging;
use helios::settings::{LOAD_ATTEMPTS, LOAD_RETRY_DELAY, SettingsStore};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = match std::env::args().nth(1) {
        Some(path) => Config::from_file(&path),
        None => Config::load(),
    }
    .map_err(|e| anyhow!("Failed to load configuration: {}", e))?;
    config
        .validate()
        .map_err(|e| anyhow!("Invalid configuration: {}", e))?;
    init_logging(&config.logging).map_err(|e| anyhow!("Failed to initialise logging: {}", e))?;

    info!("Helios PV inverter bridge {} starting up", env!("APP_VERSION"));

    let settings = Arc::new(Mutex::new(
        SettingsStore::open(&config.settings_file, LOAD_ATTEMPTS, LOAD_RETRY_DELAY).await,
    ));

    let (device_events_tx, device_events_rx) = mpsc::unbounded_channel();
    let mut orchestrator =
        Orchestrator::new(config.clone(), settings.clone(), device_events_tx).await;
    if let Some(link) = open_rtu_link(&config) {
        orchestrator = orchestrator.with_rtu(link);
    }
    let handle = orchestrator.handle();

    let mut exporter = BusExporter::new(config.dbus.clone(), orchestrator.handle());
    if let Err(e) = exporter.start().await {
        if config.dbus.require {
            return Err(anyhow!("D-Bus unavailable: {}", e));
        }
        warn!("D-Bus unavailable, continuing without gateway service: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let exporter_task = tokio::spawn(exporter.run(device_events_rx, shutdown_rx.clone()));
    let mut orchestrator_task = tokio::spawn(orchestrator.run(shutdown_rx));

    let outcome = tokio::select! {
        _ = wait_for_shutdown(&handle) => {
            info!("Shutdown requested");
            let _ = shutdown_tx.send(true);
            (&mut orchestrator_task).await
        }
        result = &mut orchestrator_task => {
            let _ = shutdown_tx.send(true);
            result
        }
    };
    let _ = exporter_task.await;

    if let Err(e) = settings.lock().await.save_if_dirty() {
        warn!("Failed to save settings on exit: {}", e);
    }

    match outcome {
        Ok(Ok(())) => {
            info!("Shutdown complete");
            Ok(())
        }
        Ok(Err(e)) => {
            error!("Discovery failed: {}", e);
            Err(anyhow!("Discovery error: {}", e))
        }
        Err(e) => Err(anyhow!("Discovery task aborted: {}", e)),
    }
}

#[cfg(feature = "rtu")]
fn open_rtu_link(config: &Config) -> Option<RtuLink> {
    let rtu = config.modbus.rtu.as_ref()?;
    match helios::modbus::open_serial(
        &rtu.device,
        rtu.baud_rate,
        std::time::Duration::from_millis(rtu.response_timeout_ms),
    ) {
        Ok(client) => Some(RtuLink {
            device: rtu.device.clone(),
            transport: Arc::new(client),
            units: rtu.unit_ids.clone(),
        }),
        Err(e) => {
            error!("Cannot open serial port {}: {}", rtu.device, e);
            None
        }
    }
}

#[cfg(not(feature = "rtu"))]
fn open_rtu_link(config: &Config) -> Option<RtuLink> {
    if config.modbus.rtu.is_some() {
        warn!("Modbus RTU configured but serial support is not compiled in");
    }
    None
}

/// Resolve on Ctrl+C or SIGTERM; SIGHUP starts a full rescan
#[cfg(unix)]
async fn wait_for_shutdown(handle: &OrchestratorHandle) {
    use tokio::signal::unix::{SignalKind, signal};
    let (Ok(mut term), Ok(mut hup)) = (
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    ) else {
        error!("Failed to install signal handlers");
        let _ = tokio::signal::ctrl_c().await;
        return;
    };
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return,
            _ = term.recv() => return,
            _ = hup.recv() => {
                info!("SIGHUP received, rescanning");
                handle.request_rescan();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_handle: &OrchestratorHandle) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for Ctrl+C: {}", e);
    }
}
