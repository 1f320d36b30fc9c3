use super::{
    InverterSnapshot, SessionContext, SessionCore, SessionHandle, UpdaterCommand,
    session_channels,
};
use crate::device::DeviceInfo;
use crate::solar_api::SolarApiClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolarApiState {
    GetCommonData,
    /// Only for multi-phase inverters
    Get3PData,
    Idle,
}

/// Polls a Fronius inverter through the Solar API. No power limiting.
pub struct SolarApiUpdater {
    core: SessionCore,
    client: Arc<SolarApiClient>,
    state: SolarApiState,
    idle_until: Instant,
}

impl SolarApiUpdater {
    pub async fn new(
        info: DeviceInfo,
        client: Arc<SolarApiClient>,
        context: SessionContext,
    ) -> (Self, watch::Receiver<Arc<InverterSnapshot>>) {
        let (mut core, snapshot_rx) = SessionCore::new(info, context).await;
        core.publish();
        (
            Self {
                core,
                client,
                state: SolarApiState::GetCommonData,
                idle_until: Instant::now(),
            },
            snapshot_rx,
        )
    }

    pub async fn spawn(
        info: DeviceInfo,
        client: Arc<SolarApiClient>,
        context: SessionContext,
    ) -> SessionHandle {
        let (updater, snapshot_rx) = Self::new(info, client, context).await;
        let (cmd_tx, cmd_rx, stop_tx, stop_rx) = session_channels();
        let task = tokio::spawn(updater.run(cmd_rx, stop_rx));
        SessionHandle::new(cmd_tx, snapshot_rx, stop_tx, task)
    }

    pub fn state(&self) -> SolarApiState {
        self.state
    }

    pub fn retry_count(&self) -> u32 {
        self.core.retry.count()
    }

    pub fn snapshot(&self) -> &InverterSnapshot {
        &self.core.snapshot
    }

    /// Perform the action of the current state and move to the next one
    pub async fn step(&mut self) {
        match self.state {
            SolarApiState::GetCommonData => self.get_common_data().await,
            SolarApiState::Get3PData => self.get_three_phase_data().await,
            SolarApiState::Idle => self.state = SolarApiState::GetCommonData,
        }
    }

    pub async fn handle_command(&mut self, command: UpdaterCommand) {
        match command {
            UpdaterCommand::SetPowerLimit(_) => self
                .core
                .logger
                .debug("Power limiting is not supported over the Solar API"),
            other => self.core.apply_setting(&other).await,
        }
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<UpdaterCommand>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        self.core.logger.info("Starting Solar API polling");
        while !*shutdown.borrow() {
            if self.state == SolarApiState::Idle {
                tokio::select! {
                    _ = tokio::time::sleep_until(self.idle_until) => self.step().await,
                    cmd = commands.recv() => match cmd {
                        Some(cmd) => self.handle_command(cmd).await,
                        None => break,
                    },
                    _ = shutdown.changed() => break,
                }
            } else {
                self.step().await;
            }
        }
        self.core.save_energy().await;
        self.core.logger.info("Solar API polling stopped");
    }

    fn enter_idle(&mut self) {
        let interval = Duration::from_millis(self.core.context.polling.solar_api_interval_ms);
        self.idle_until = Instant::now() + interval;
        self.state = SolarApiState::Idle;
    }

    fn finish_cycle(&mut self) {
        self.core.record_success();
        self.core.publish();
        self.enter_idle();
    }

    fn fail(&mut self, error: &str) {
        self.core.record_error(error);
        self.enter_idle();
    }

    fn device_id(&self) -> i32 {
        i32::from(self.core.info.unit_id)
    }

    async fn get_common_data(&mut self) {
        match self.client.get_common_data(self.device_id()).await {
            Ok(data) => {
                self.core.snapshot.status_code = data.status_code;
                self.core.snapshot.error_code = data.error_code;
                self.core.processor.process_common(&data);
                self.core.maybe_save_energy().await;
                if self.core.info.phase_count > 1 {
                    self.state = SolarApiState::Get3PData;
                } else {
                    self.finish_cycle();
                }
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }

    async fn get_three_phase_data(&mut self) {
        match self.client.get_three_phase_data(self.device_id()).await {
            Ok(data) => {
                self.core.processor.process_three_phase(&data);
                self.finish_cycle();
            }
            Err(e) => self.fail(&e.to_string()),
        }
    }
}
