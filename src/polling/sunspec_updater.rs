use super::limiter::{PowerLimiter, select_limiter};
use super::{
    InverterSnapshot, SessionContext, SessionCore, SessionHandle, UpdaterCommand,
    session_channels, sleep_until_opt,
};
use crate::device::DeviceInfo;
use crate::modbus::ModbusTransport;
use crate::sunspec::telemetry::{Decoded, SunSpecSample, block_len, decode_block};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SunSpecState {
    /// Run the limiter's connect sequence
    Init,
    ReadTelemetry,
    /// Only entered with a pending limit
    WritePowerLimit,
    Idle,
    /// Model changed; waiting to be torn down
    Halted,
}

/// Polls a SunSpec inverter over Modbus
pub struct SunSpecUpdater {
    core: SessionCore,
    transport: Arc<dyn ModbusTransport>,
    limiter: Box<dyn PowerLimiter>,
    state: SunSpecState,
    initialized: bool,
    /// Cleared when the limiter's connect sequence failed
    limiter_ready: bool,
    /// Requested limit as a fraction of max power
    pending_limit: Option<f64>,
    limit_expiry: Option<Instant>,
    idle_until: Instant,
}

impl SunSpecUpdater {
    pub async fn new(
        info: DeviceInfo,
        transport: Arc<dyn ModbusTransport>,
        context: SessionContext,
    ) -> (Self, watch::Receiver<Arc<InverterSnapshot>>) {
        let limiter = select_limiter(&info);
        let (core, snapshot_rx) = SessionCore::new(info, context).await;
        let mut updater = Self {
            core,
            transport,
            limiter,
            state: SunSpecState::Init,
            initialized: false,
            limiter_ready: true,
            pending_limit: None,
            limit_expiry: None,
            idle_until: Instant::now(),
        };
        updater.refresh_limits();
        updater.core.publish();
        (updater, snapshot_rx)
    }

    /// Start the updater on its own task
    pub async fn spawn(
        info: DeviceInfo,
        transport: Arc<dyn ModbusTransport>,
        context: SessionContext,
    ) -> SessionHandle {
        let (updater, snapshot_rx) = Self::new(info, transport, context).await;
        let (cmd_tx, cmd_rx, stop_tx, stop_rx) = session_channels();
        let task = tokio::spawn(updater.run(cmd_rx, stop_rx));
        SessionHandle::new(cmd_tx, snapshot_rx, stop_tx, task)
    }

    pub fn state(&self) -> SunSpecState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.core.retry.count()
    }

    pub fn has_pending_limit(&self) -> bool {
        self.pending_limit.is_some()
    }

    pub fn snapshot(&self) -> &InverterSnapshot {
        &self.core.snapshot
    }

    /// Perform the action of the current state and move to the next one.
    /// `Idle` transitions immediately; waiting is up to the caller.
    pub async fn step(&mut self) {
        match self.state {
            SunSpecState::Init => self.connect().await,
            SunSpecState::ReadTelemetry => self.read_telemetry().await,
            SunSpecState::WritePowerLimit => self.write_power_limit().await,
            SunSpecState::Idle => {
                self.state = if self.initialized {
                    SunSpecState::ReadTelemetry
                } else {
                    SunSpecState::Init
                };
            }
            SunSpecState::Halted => {}
        }
    }

    pub async fn handle_command(&mut self, command: UpdaterCommand) {
        match command {
            UpdaterCommand::SetPowerLimit(watts) => self.request_power_limit(watts),
            other => self.core.apply_setting(&other).await,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UpdaterCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.core.logger.info(&format!(
            "Starting SunSpec polling ({}, {} phase(s))",
            self.core.info.protocol, self.core.info.phase_count
        ));
        while !*shutdown.borrow() {
            match self.state {
                SunSpecState::Idle | SunSpecState::Halted => {
                    let halted = self.state == SunSpecState::Halted;
                    tokio::select! {
                        _ = tokio::time::sleep_until(self.idle_until), if !halted => {
                            self.step().await;
                        }
                        _ = sleep_until_opt(self.limit_expiry), if !halted => {
                            self.expire_power_limit().await;
                        }
                        cmd = commands.recv() => match cmd {
                            Some(cmd) => self.handle_command(cmd).await,
                            None => break,
                        },
                        _ = shutdown.changed() => break,
                    }
                }
                _ => {
                    self.step().await;
                    // Requests that arrived while the device was busy
                    while let Ok(cmd) = commands.try_recv() {
                        self.handle_command(cmd).await;
                    }
                }
            }
        }
        self.core.save_energy().await;
        self.core.logger.info("SunSpec polling stopped");
    }

    fn enter_idle(&mut self, ok: bool) {
        let polling = &self.core.context.polling;
        let wait = if ok {
            polling.idle_interval_ms
        } else {
            polling.retry_interval_ms
        };
        self.idle_until = Instant::now() + Duration::from_millis(wait);
        self.state = SunSpecState::Idle;
    }

    fn after_success(&mut self) {
        if self.pending_limit.is_some() {
            self.state = SunSpecState::WritePowerLimit;
        } else {
            self.enter_idle(true);
        }
    }

    fn fail(&mut self, error: &str) {
        if self.core.record_error(error) {
            self.initialized = false;
            self.limit_expiry = None;
        }
        self.enter_idle(false);
    }

    fn max_power(&self) -> Option<f64> {
        let max = self.core.info.max_power;
        (max.is_finite() && max > 0.0).then_some(max)
    }

    fn limiting_supported(&self) -> bool {
        self.limiter_ready && self.limiter.supports_limiting(&self.core.info)
    }

    fn refresh_limits(&mut self) {
        let max_power = self.max_power();
        let supported = self.limiting_supported();
        let limit_active = self.limit_expiry.is_some();
        let snapshot = &mut self.core.snapshot;
        match max_power {
            Some(max) if supported => {
                snapshot.min_power_limit = 0.0;
                snapshot.max_power_limit = max;
                if !limit_active {
                    snapshot.power_limit = max;
                }
            }
            _ => {
                snapshot.min_power_limit = f64::NAN;
                snapshot.max_power_limit = f64::NAN;
                snapshot.power_limit = f64::NAN;
            }
        }
    }

    /// Run the limiter setup. Telemetry is polled whether or not it succeeds.
    async fn connect(&mut self) {
        let setup = self
            .limiter
            .on_connected(self.transport.as_ref(), &mut self.core.info)
            .await;
        self.limiter_ready = match setup {
            Ok(()) => true,
            Err(e) => {
                self.core
                    .logger
                    .warn(&format!("Power limiting unavailable: {}", e));
                false
            }
        };
        if !self.limiter_ready {
            self.pending_limit = None;
            self.limit_expiry = None;
        }
        self.initialized = true;
        self.core.snapshot.info = self.core.info.clone();
        self.refresh_limits();
        self.core.publish();
        self.state = SunSpecState::ReadTelemetry;
    }

    async fn read_telemetry(&mut self) {
        let info = &self.core.info;
        let result = self
            .transport
            .read_holding_registers(
                info.unit_id,
                info.inverter_model_offset,
                block_len(info.protocol),
            )
            .await;
        let values = match result {
            Ok(values) => values,
            Err(e) => return self.fail(&e.to_string()),
        };
        match decode_block(&self.core.info, &values) {
            Decoded::Sample(sample) => {
                self.apply_sample(sample);
                self.core.record_success();
                self.core.publish();
                self.core.maybe_save_energy().await;
                self.after_success();
            }
            Decoded::NullFrame => {
                self.core.logger.debug("Skipping Fronius null frame");
                self.after_success();
            }
            Decoded::ModelChanged { model } => {
                self.core.report_model_changed(model);
                self.state = SunSpecState::Halted;
            }
            Decoded::Invalid(reason) => self.fail(&reason),
        }
    }

    fn apply_sample(&mut self, sample: SunSpecSample) {
        if sample.status_code.is_some() {
            self.core.snapshot.status_code = sample.status_code;
        }
        let Some(common) = sample.common else {
            return;
        };
        let processor = &mut self.core.processor;
        processor.process_common(&common);
        match sample.three_phase {
            Some(three_phase) => processor.process_three_phase(&three_phase),
            None => processor.apply_split_phase(),
        }
    }

    fn request_power_limit(&mut self, watts: f64) {
        let Some(max) = self.max_power() else {
            self.core
                .logger
                .debug("Ignoring power limit: max power unknown");
            return;
        };
        if !self.limiting_supported() || watts.is_nan() {
            self.core.logger.debug("Ignoring power limit request");
            return;
        }
        self.pending_limit = Some((watts / max).clamp(0.0, 1.0));
        if self.state == SunSpecState::Idle {
            self.state = SunSpecState::WritePowerLimit;
        }
    }

    async fn write_power_limit(&mut self) {
        let Some(pct) = self.pending_limit.take() else {
            self.enter_idle(true);
            return;
        };
        match self
            .limiter
            .apply_power_limit(self.transport.as_ref(), &self.core.info, pct)
            .await
        {
            Ok(()) => {
                let refresh =
                    Duration::from_millis(self.core.context.polling.power_limit_refresh_ms);
                self.limit_expiry = Some(Instant::now() + refresh);
                if let Some(max) = self.max_power() {
                    self.core.snapshot.power_limit = pct * max;
                }
                self.core
                    .logger
                    .debug(&format!("Power limit set to {:.1} %", pct * 100.0));
                self.core.publish();
                self.enter_idle(true);
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }

    async fn expire_power_limit(&mut self) {
        self.limit_expiry = None;
        match self
            .limiter
            .reset_power_limit(self.transport.as_ref(), &self.core.info)
            .await
        {
            Ok(()) => {
                self.core.logger.debug("Power limit expired");
                self.refresh_limits();
                self.core.publish();
            }
            Err(e) => self
                .core
                .logger
                .debug(&format!("Failed to reset power limit: {}", e)),
        }
    }
}
