//! Per-device polling sessions
//!
//! A session is one tokio task running a protocol-specific state machine
//! (`SunSpecUpdater` or `SolarApiUpdater`). It publishes an
//! `InverterSnapshot` over a watch channel, accepts `UpdaterCommand`s and
//! reports connectivity changes to the orchestrator as `PollEvent`s.

mod limiter;
mod solar_api_updater;
mod sunspec_updater;

pub use limiter::{
    NoLimiter, PowerLimiter, SmaLimiter, SolarEdgeLimiter, SunSpecLimiter, select_limiter,
};
pub use solar_api_updater::{SolarApiState, SolarApiUpdater};
pub use sunspec_updater::{SunSpecState, SunSpecUpdater};

use crate::config::PollingConfig;
use crate::device::{DeviceInfo, DeviceKey, InverterPhase, InverterPosition, PhaseMeasurement};
use crate::energy::PhaseEnergyProcessor;
use crate::logging::{LogContext, StructuredLogger, get_logger_with_context};
use crate::settings::SettingsStore;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Everything a session publishes
#[derive(Debug, Clone)]
pub struct InverterSnapshot {
    pub info: DeviceInfo,
    pub connected: bool,
    /// Fronius status code
    pub status_code: Option<i32>,
    pub error_code: Option<i32>,
    pub mean: PhaseMeasurement,
    pub phases: [PhaseMeasurement; 3],
    /// Active limit in W, NaN without a limiter
    pub power_limit: f64,
    pub min_power_limit: f64,
    pub max_power_limit: f64,
    pub phase: InverterPhase,
    pub position: InverterPosition,
    pub custom_name: String,
    pub device_instance: u32,
    pub last_update: Option<DateTime<Utc>>,
}

impl InverterSnapshot {
    pub fn new(info: DeviceInfo) -> Self {
        Self {
            info,
            connected: false,
            status_code: None,
            error_code: None,
            mean: PhaseMeasurement::default(),
            phases: [PhaseMeasurement::default(); 3],
            power_limit: f64::NAN,
            min_power_limit: f64::NAN,
            max_power_limit: f64::NAN,
            phase: InverterPhase::default(),
            position: InverterPosition::default(),
            custom_name: String::new(),
            device_instance: 0,
            last_update: None,
        }
    }

    /// Name shown to the user: the custom name if set
    pub fn display_name(&self) -> &str {
        if self.custom_name.is_empty() {
            &self.info.product_name
        } else {
            &self.custom_name
        }
    }
}

/// Commands accepted by a running session
#[derive(Debug, Clone, PartialEq)]
pub enum UpdaterCommand {
    /// Requested limit in W
    SetPowerLimit(f64),
    SetPhase(InverterPhase),
    SetPosition(InverterPosition),
    SetCustomName(String),
}

/// Session events for the orchestrator
#[derive(Debug, Clone, PartialEq)]
pub enum PollEvent {
    ConnectionLost { key: DeviceKey, host: String },
    ModelChanged { key: DeviceKey, host: String },
}

/// Consecutive error counter with a disconnect threshold
#[derive(Debug, Clone)]
pub struct RetryCounter {
    count: u32,
    threshold: u32,
}

impl RetryCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    /// Count an error. Returns true when the threshold is reached; the
    /// counter then starts over.
    pub fn record_error(&mut self) -> bool {
        self.count += 1;
        if self.count >= self.threshold {
            self.count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Shared wiring handed to every session
#[derive(Clone)]
pub struct SessionContext {
    pub polling: PollingConfig,
    pub settings: Arc<Mutex<SettingsStore>>,
    pub events: mpsc::UnboundedSender<PollEvent>,
}

/// State common to both updaters: energy, retries, snapshot and persistence
pub(crate) struct SessionCore {
    pub info: DeviceInfo,
    pub processor: PhaseEnergyProcessor,
    pub retry: RetryCounter,
    pub snapshot: InverterSnapshot,
    pub context: SessionContext,
    pub logger: StructuredLogger,
    snapshot_tx: watch::Sender<Arc<InverterSnapshot>>,
    lost_reported: bool,
    last_energy_save: Instant,
}

impl SessionCore {
    pub async fn new(
        info: DeviceInfo,
        context: SessionContext,
    ) -> (Self, watch::Receiver<Arc<InverterSnapshot>>) {
        let settings = context.settings.lock().await.inverter(&info.unique_id).clone();
        let processor =
            PhaseEnergyProcessor::new(info.phase_count, settings.phase, settings.energy_baseline());

        let mut snapshot = InverterSnapshot::new(info.clone());
        snapshot.phase = settings.phase;
        snapshot.position = settings.position;
        snapshot.custom_name = settings.custom_name;
        snapshot.device_instance = settings.device_instance;

        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(snapshot.clone()));
        let logger = get_logger_with_context(
            LogContext::new("polling")
                .with_device(&info.unique_id)
                .with_location(info.location()),
        );
        (
            Self {
                retry: RetryCounter::new(context.polling.retry_threshold),
                info,
                processor,
                snapshot,
                context,
                logger,
                snapshot_tx,
                lost_reported: false,
                last_energy_save: Instant::now(),
            },
            snapshot_rx,
        )
    }

    pub fn publish(&mut self) {
        self.snapshot.mean = *self.processor.mean();
        self.snapshot.phases = *self.processor.phases();
        self.snapshot.phase = self.processor.phase();
        self.snapshot_tx.send_replace(Arc::new(self.snapshot.clone()));
    }

    pub fn record_success(&mut self) {
        self.retry.record_success();
        self.lost_reported = false;
        if !self.snapshot.connected {
            self.logger.info("Connected");
        }
        self.snapshot.connected = true;
        self.snapshot.last_update = Some(Utc::now());
    }

    /// Count a failed step. Returns true when the device just went offline.
    pub fn record_error(&mut self, error: &str) -> bool {
        self.logger.debug(&format!(
            "Poll failed ({}/{}): {}",
            self.retry.count() + 1,
            self.context.polling.retry_threshold,
            error
        ));
        if !self.retry.record_error() || self.lost_reported {
            return false;
        }
        self.lost_reported = true;
        self.logger.warn("Connection lost");
        self.snapshot.connected = false;
        self.snapshot.status_code = None;
        self.snapshot.error_code = None;
        self.processor.reset();
        self.publish();
        let _ = self.context.events.send(PollEvent::ConnectionLost {
            key: self.info.key(),
            host: self.info.host.clone(),
        });
        true
    }

    pub fn report_model_changed(&mut self, model: u16) {
        self.logger.warn(&format!(
            "Inverter model changed to {}, requesting rescan",
            model
        ));
        self.snapshot.connected = false;
        self.processor.reset();
        self.publish();
        let _ = self.context.events.send(PollEvent::ModelChanged {
            key: self.info.key(),
            host: self.info.host.clone(),
        });
    }

    /// Apply commands that do not touch the device
    pub async fn apply_setting(&mut self, command: &UpdaterCommand) {
        let unique_id = self.info.unique_id.clone();
        let mut settings = self.context.settings.lock().await;
        match command {
            UpdaterCommand::SetPhase(phase) => {
                self.processor.set_phase(*phase);
                settings.update_inverter(&unique_id, |s| s.phase = *phase);
            }
            UpdaterCommand::SetPosition(position) => {
                self.snapshot.position = *position;
                settings.update_inverter(&unique_id, |s| s.position = *position);
            }
            UpdaterCommand::SetCustomName(name) => {
                match settings.set_custom_name(&unique_id, name) {
                    Ok(()) => self.snapshot.custom_name = name.clone(),
                    Err(e) => self.logger.warn(&format!("Custom name rejected: {}", e)),
                }
            }
            UpdaterCommand::SetPowerLimit(_) => return,
        }
        if let Err(e) = settings.save_if_dirty() {
            self.logger.warn(&format!("Failed to save settings: {}", e));
        }
        drop(settings);
        self.publish();
    }

    /// Persist the energy baseline if the save interval elapsed
    pub async fn maybe_save_energy(&mut self) {
        let interval = Duration::from_secs(self.context.polling.energy_save_interval_s);
        if self.last_energy_save.elapsed() >= interval {
            self.save_energy().await;
        }
    }

    pub async fn save_energy(&mut self) {
        self.last_energy_save = Instant::now();
        let baseline = self.processor.energy_baseline();
        let mut settings = self.context.settings.lock().await;
        settings.store_energy(&self.info.unique_id, baseline);
        if let Err(e) = settings.save_if_dirty() {
            self.logger
                .warn(&format!("Failed to save energy baseline: {}", e));
        }
    }
}

/// Owner side of a running session
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<UpdaterCommand>,
    snapshot: watch::Receiver<Arc<InverterSnapshot>>,
    shutdown: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub(crate) fn new(
        commands: mpsc::UnboundedSender<UpdaterCommand>,
        snapshot: watch::Receiver<Arc<InverterSnapshot>>,
        shutdown: watch::Sender<bool>,
        task: JoinHandle<()>,
    ) -> Self {
        Self {
            commands,
            snapshot,
            shutdown,
            task: Some(task),
        }
    }

    pub fn send(&self, command: UpdaterCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commands(&self) -> mpsc::UnboundedSender<UpdaterCommand> {
        self.commands.clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<InverterSnapshot>> {
        self.snapshot.clone()
    }

    pub fn latest(&self) -> Arc<InverterSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Ask the session to save its state and stop, then wait for it
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

/// Channels for a new session: (handle-side parts, task-side parts)
pub(crate) fn session_channels() -> (
    mpsc::UnboundedSender<UpdaterCommand>,
    mpsc::UnboundedReceiver<UpdaterCommand>,
    watch::Sender<bool>,
    watch::Receiver<bool>,
) {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (stop_tx, stop_rx) = watch::channel(false);
    (cmd_tx, cmd_rx, stop_tx, stop_rx)
}
