use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::WatchStream;

use crate::config::DbusConfig;
use crate::device::DeviceKey;
use crate::discovery::{DeviceEvent, OrchestratorHandle};
use crate::error::Result;
use crate::logging::{LogContext, StructuredLogger, get_logger, get_logger_with_context};
use crate::polling::{InverterSnapshot, UpdaterCommand};

use super::gateway::{gateway_service, is_rescan_request, publish_status};
use super::inverter::{command_for_write, inverter_service, publish_snapshot};
use super::service::DbusService;
use super::shared::BusWrite;

struct DeviceExport {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Mirrors every running session (and the scan status) onto the bus.
///
/// With the bus disabled the trees are still maintained in memory and
/// snapshots are only logged.
pub struct BusExporter {
    config: DbusConfig,
    orchestrator: OrchestratorHandle,
    gateway: Option<(DbusService, mpsc::UnboundedReceiver<BusWrite>)>,
    devices: HashMap<DeviceKey, DeviceExport>,
    logger: StructuredLogger,
}

impl BusExporter {
    pub fn new(config: DbusConfig, orchestrator: OrchestratorHandle) -> Self {
        Self {
            config,
            orchestrator,
            gateway: None,
            devices: HashMap::new(),
            logger: get_logger("dbus"),
        }
    }

    /// Register the gateway service. Errors only when the bus is enabled
    /// and cannot be reached.
    pub async fn start(&mut self) -> Result<()> {
        let (mut service, writes) = gateway_service().await?;
        if self.config.enabled {
            service.start().await?;
        } else {
            self.logger.info("D-Bus export disabled; snapshots are logged only");
        }
        self.gateway = Some((service, writes));
        Ok(())
    }

    pub async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<DeviceEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let (mut gateway, mut gateway_writes) = match self.gateway.take() {
            Some((service, writes)) => (Some(service), Some(writes)),
            None => (None, None),
        };
        let mut status = WatchStream::new(self.orchestrator.status());

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(DeviceEvent::Started { key, info, snapshot, commands }) => {
                        self.stop_device(&key).await;
                        let logger = get_logger_with_context(
                            LogContext::new("dbus")
                                .with_device(&info.unique_id)
                                .with_location(info.location()),
                        );
                        match self.spawn_device(snapshot, commands, logger).await {
                            Ok(export) => {
                                self.devices.insert(key, export);
                            }
                            Err(e) => self
                                .logger
                                .warn(&format!("Cannot export {}: {}", info.unique_id, e)),
                        }
                    }
                    Some(DeviceEvent::Stopped { key }) => self.stop_device(&key).await,
                    None => break,
                },
                Some(scan) = status.next() => {
                    if let Some(service) = gateway.as_mut()
                        && let Err(e) = publish_status(service, &scan).await
                    {
                        self.logger.debug(&format!("Scan status export failed: {}", e));
                    }
                }
                Some(write) = recv_opt(&mut gateway_writes) => {
                    if is_rescan_request(&write) {
                        self.logger.info("Rescan requested over D-Bus");
                        self.orchestrator.request_rescan();
                    }
                }
                _ = shutdown.changed() => break,
            }
        }

        let keys: Vec<DeviceKey> = self.devices.keys().cloned().collect();
        for key in keys {
            self.stop_device(&key).await;
        }
        if let Some(service) = gateway.as_mut() {
            service.stop().await;
        }
    }

    async fn spawn_device(
        &self,
        snapshots: watch::Receiver<Arc<InverterSnapshot>>,
        commands: mpsc::UnboundedSender<UpdaterCommand>,
        logger: StructuredLogger,
    ) -> Result<DeviceExport> {
        let initial = snapshots.borrow().clone();
        let (mut service, writes) = inverter_service(&initial).await?;
        if self.config.enabled
            && let Err(e) = service.start().await
        {
            logger.warn(&format!("D-Bus registration failed, continuing offline: {}", e));
        }
        let (stop, stop_rx) = oneshot::channel();
        let task = tokio::spawn(export_device(
            service, writes, snapshots, commands, stop_rx, logger,
        ));
        Ok(DeviceExport { stop, task })
    }

    async fn stop_device(&mut self, key: &DeviceKey) {
        if let Some(export) = self.devices.remove(key) {
            let _ = export.stop.send(());
            let _ = export.task.await;
        }
    }
}

async fn recv_opt<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn export_device(
    mut service: DbusService,
    mut writes: mpsc::UnboundedReceiver<BusWrite>,
    snapshots: watch::Receiver<Arc<InverterSnapshot>>,
    commands: mpsc::UnboundedSender<UpdaterCommand>,
    mut stop: oneshot::Receiver<()>,
    logger: StructuredLogger,
) {
    let mut stream = WatchStream::new(snapshots);
    loop {
        tokio::select! {
            snapshot = stream.next() => match snapshot {
                Some(snapshot) => {
                    logger.debug(&format!(
                        "{}: {:.0} W, connected={}",
                        snapshot.display_name(),
                        snapshot.mean.power,
                        snapshot.connected
                    ));
                    if let Err(e) = publish_snapshot(&mut service, &snapshot).await {
                        logger.debug(&format!("Snapshot export failed: {}", e));
                    }
                }
                None => break,
            },
            Some(write) = writes.recv() => match command_for_write(&write) {
                Some(command) => {
                    if commands.send(command).is_err() {
                        break;
                    }
                }
                None => logger.warn(&format!("Ignoring write to {}: {}", write.path, write.value)),
            },
            _ = &mut stop => break,
        }
    }
    service.stop().await;
}
