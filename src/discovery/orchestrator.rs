use super::addresses::{AddressGenerator, local_subnets};
use super::detector::{DeviceDetector, ProbeSettings};
use super::registry::{DeviceRegistry, RegistryEntry, Registration};
use super::udp::UdpProbe;
use crate::config::Config;
use crate::device::{DeviceInfo, DeviceKey, ProtocolType};
use crate::error::Result;
use crate::logging::{StructuredLogger, get_logger};
use crate::modbus::{ModbusTcpClient, ModbusTransport, TcpClientSettings};
use crate::polling::{
    InverterSnapshot, PollEvent, SessionContext, SessionHandle, SolarApiUpdater, SunSpecUpdater,
    UpdaterCommand, sleep_until_opt,
};
use crate::settings::SettingsStore;
use crate::solar_api::SolarApiClient;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

/// Sessions coming and going, for the bus export
pub enum DeviceEvent {
    Started {
        key: DeviceKey,
        info: DeviceInfo,
        snapshot: watch::Receiver<Arc<InverterSnapshot>>,
        commands: mpsc::UnboundedSender<UpdaterCommand>,
    },
    Stopped {
        key: DeviceKey,
    },
}

/// Progress of the running scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ScanStatus {
    pub scanning: bool,
    /// Percentage of candidate addresses handed out
    pub progress: u8,
}

/// A serial Modbus link whose units are walked on every full scan
#[derive(Clone)]
pub struct RtuLink {
    pub device: String,
    pub transport: Arc<dyn ModbusTransport>,
    pub units: Vec<u8>,
}

/// Remote control for a running orchestrator
#[derive(Clone)]
pub struct OrchestratorHandle {
    rescan: mpsc::UnboundedSender<()>,
    status: watch::Receiver<ScanStatus>,
}

impl OrchestratorHandle {
    /// Start a full scan (subnets included)
    pub fn request_rescan(&self) -> bool {
        self.rescan.send(()).is_ok()
    }

    pub fn status(&self) -> watch::Receiver<ScanStatus> {
        self.status.clone()
    }
}

type ProbeResult = (String, Vec<DeviceInfo>);

/// Candidate queue of one scan
struct Scan {
    generator: AddressGenerator,
    generator_done: bool,
    /// Hosts injected by UDP discovery or requeued by sessions
    injected: VecDeque<String>,
    probed: HashSet<String>,
    in_flight: HashSet<String>,
    finished: bool,
}

impl Scan {
    fn new(generator: AddressGenerator) -> Self {
        Self {
            generator,
            generator_done: false,
            injected: VecDeque::new(),
            probed: HashSet::new(),
            in_flight: HashSet::new(),
            finished: false,
        }
    }

    fn inject(&mut self, host: String) {
        if !self.injected.contains(&host) {
            self.injected.push_front(host);
            self.finished = false;
        }
    }

    fn next_candidate(&mut self) -> Option<String> {
        while let Some(host) = self.injected.pop_front() {
            if self.in_flight.insert(host.clone()) {
                self.probed.insert(host.clone());
                return Some(host);
            }
        }
        while !self.generator_done {
            match self.generator.next() {
                Some(host) if self.probed.contains(&host) || self.in_flight.contains(&host) => {}
                Some(host) => {
                    self.probed.insert(host.clone());
                    self.in_flight.insert(host.clone());
                    return Some(host);
                }
                None => self.generator_done = true,
            }
        }
        None
    }

    /// No candidates left to hand out; probes may still be running
    fn is_exhausted(&self) -> bool {
        self.generator_done && self.injected.is_empty()
    }
}

/// Finds devices and keeps one polling session per active device
pub struct Orchestrator {
    config: Config,
    registry: Arc<Mutex<DeviceRegistry>>,
    settings: Arc<Mutex<SettingsStore>>,
    detector: Arc<DeviceDetector>,
    session_context: SessionContext,
    poll_events: mpsc::UnboundedReceiver<PollEvent>,
    device_events: mpsc::UnboundedSender<DeviceEvent>,
    rescan_tx: mpsc::UnboundedSender<()>,
    rescan_rx: mpsc::UnboundedReceiver<()>,
    status_tx: watch::Sender<ScanStatus>,
    rtu: Option<RtuLink>,
    logger: StructuredLogger,
}

impl Orchestrator {
    pub async fn new(
        config: Config,
        settings: Arc<Mutex<SettingsStore>>,
        device_events: mpsc::UnboundedSender<DeviceEvent>,
    ) -> Self {
        let solar_api_port = settings
            .lock()
            .await
            .global()
            .port_number
            .unwrap_or(config.solar_api.port);
        let detector = Arc::new(DeviceDetector::new(ProbeSettings::from_config(
            &config,
            solar_api_port,
        )));
        let (events_tx, poll_events) = mpsc::unbounded_channel();
        let (rescan_tx, rescan_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ScanStatus::default());
        Self {
            session_context: SessionContext {
                polling: config.polling.clone(),
                settings: settings.clone(),
                events: events_tx,
            },
            config,
            registry: Arc::new(Mutex::new(DeviceRegistry::new())),
            settings,
            detector,
            poll_events,
            device_events,
            rescan_tx,
            rescan_rx,
            status_tx,
            rtu: None,
            logger: get_logger("discovery"),
        }
    }

    /// Also walk the units of a serial link
    pub fn with_rtu(mut self, link: RtuLink) -> Self {
        self.rtu = Some(link);
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            rescan: self.rescan_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<DeviceRegistry>> {
        self.registry.clone()
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let semaphore = Arc::new(Semaphore::new(
            self.config.discovery.max_concurrent_probes.max(1),
        ));
        let mut probes: JoinSet<ProbeResult> = JoinSet::new();
        let (udp_tx, mut udp_rx) = mpsc::unbounded_channel::<String>();
        let mut scan = self.start_scan(true, &udp_tx, &mut probes).await;
        let mut rescan_at: Option<Instant> = None;

        loop {
            self.fill_probes(&mut scan, &mut probes, &semaphore);
            self.publish_status(&scan);
            if !scan.finished && probes.is_empty() && scan.is_exhausted() {
                scan.finished = true;
                rescan_at = self.scan_finished().await;
                self.publish_status(&scan);
            }

            tokio::select! {
                Some(joined) = probes.join_next() => match joined {
                    Ok((host, found)) => {
                        scan.in_flight.remove(&host);
                        for info in found {
                            self.register(info).await;
                        }
                    }
                    Err(e) => self.logger.warn(&format!("Probe task failed: {}", e)),
                },
                Some(host) = udp_rx.recv() => scan.inject(host),
                Some(event) = self.poll_events.recv() => {
                    self.handle_poll_event(event, &mut scan, &mut probes).await;
                }
                Some(()) = self.rescan_rx.recv() => {
                    rescan_at = None;
                    scan = self.start_scan(true, &udp_tx, &mut probes).await;
                }
                _ = sleep_until_opt(rescan_at) => {
                    rescan_at = None;
                    scan = self.start_scan(false, &udp_tx, &mut probes).await;
                }
                _ = shutdown.changed() => break,
            }
        }

        probes.abort_all();
        self.shutdown().await;
        Ok(())
    }

    async fn priority_hosts(&self) -> (Vec<String>, Vec<String>) {
        let settings = self.settings.lock().await;
        let mut configured = self.config.discovery.ip_addresses.clone();
        configured.extend(settings.global().ip_addresses.iter().cloned());
        let known = settings.global().known_ip_addresses.clone();
        (configured, known)
    }

    /// A full scan includes subnets, UDP discovery and the RTU link
    async fn start_scan(
        &self,
        full: bool,
        udp_tx: &mpsc::UnboundedSender<String>,
        probes: &mut JoinSet<ProbeResult>,
    ) -> Scan {
        let (configured, known) = self.priority_hosts().await;
        let priority = configured.into_iter().chain(known);
        let generator = if full && !self.config.discovery.priority_only {
            AddressGenerator::new(priority, &local_subnets())
        } else {
            AddressGenerator::priority_only(priority)
        };
        self.logger.info(&format!(
            "Starting {} scan of {} address(es)",
            if full { "full" } else { "priority" },
            generator.total()
        ));

        if full && self.config.discovery.udp_enabled {
            let tx = udp_tx.clone();
            let logger = self.logger.clone();
            tokio::spawn(async move {
                if let Err(e) = UdpProbe::default().run(tx).await {
                    logger.debug(&format!("UDP discovery failed: {}", e));
                }
            });
        }

        if full {
            self.spawn_rtu_probe(probes);
        }

        Scan::new(generator)
    }

    /// Walk the units of the serial link, if there is one
    fn spawn_rtu_probe(&self, probes: &mut JoinSet<ProbeResult>) {
        let Some(link) = self.rtu.clone() else {
            return;
        };
        let detector = self.detector.clone();
        let registry = self.registry.clone();
        probes.spawn(async move {
            let found = detector
                .probe_units(
                    link.transport.as_ref(),
                    &link.device,
                    0,
                    &link.units,
                    &registry,
                )
                .await;
            (link.device, found)
        });
    }

    fn fill_probes(
        &self,
        scan: &mut Scan,
        probes: &mut JoinSet<ProbeResult>,
        semaphore: &Arc<Semaphore>,
    ) {
        while let Ok(permit) = semaphore.clone().try_acquire_owned() {
            let Some(host) = scan.next_candidate() else {
                break;
            };
            let detector = self.detector.clone();
            let registry = self.registry.clone();
            probes.spawn(async move {
                let _permit = permit;
                let found = detector.probe_host(&host, &registry).await;
                (host, found)
            });
        }
    }

    fn publish_status(&self, scan: &Scan) {
        let status = ScanStatus {
            scanning: !scan.finished,
            progress: if scan.finished { 100 } else { scan.generator.progress() },
        };
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    /// Decide whether to rescan. Returns the rescan deadline.
    async fn scan_finished(&self) -> Option<Instant> {
        let auto_scan = self
            .settings
            .lock()
            .await
            .global()
            .auto_scan
            .unwrap_or(self.config.discovery.auto_scan);
        let (configured, _) = self.priority_hosts().await;
        let registry = self.registry.lock().await;
        let missing = configured
            .iter()
            .filter(|h| !registry.has_host(h.trim()))
            .count();
        self.logger.info(&format!(
            "Scan finished: {} device(s) managed, {} configured host(s) missing",
            registry.len(),
            missing
        ));
        (auto_scan && missing > 0)
            .then(|| Instant::now() + Duration::from_millis(self.config.discovery.rescan_delay_ms))
    }

    async fn register(&self, info: DeviceInfo) {
        let key = info.key();
        let outcome = self.registry.lock().await.register(info.clone());
        match outcome {
            Registration::Unchanged => {
                self.registry.lock().await.set_connected(&key, true);
                return;
            }
            Registration::Added => self.logger.info(&format!(
                "Found {} ({}) at {}",
                info.product_name,
                info.unique_id,
                info.location()
            )),
            Registration::Moved { previous } => {
                self.logger.info(&format!(
                    "{} moved from {} to {}",
                    info.unique_id,
                    previous.info.location(),
                    info.location()
                ));
                self.stop_entry(previous).await;
            }
            Registration::Replaced { previous } => {
                self.logger.info(&format!(
                    "{} replaces {} at {}",
                    info.unique_id,
                    previous.info.unique_id,
                    info.location()
                ));
                self.stop_entry(previous).await;
            }
        }

        if info.port != 0 {
            let mut settings = self.settings.lock().await;
            if settings.add_known_ip(&info.host)
                && let Err(e) = settings.save()
            {
                self.logger.warn(&format!("Failed to save known hosts: {}", e));
            }
        }
        self.start_session(info).await;
    }

    fn transport_for(&self, info: &DeviceInfo) -> Arc<dyn ModbusTransport> {
        if let Some(link) = &self.rtu
            && link.device == info.host
        {
            return link.transport.clone();
        }
        let modbus = &self.config.modbus;
        let settings =
            TcpClientSettings::from_config(modbus).with_request_timeout(modbus.sunspec_timeout());
        Arc::new(ModbusTcpClient::new(&info.host, info.port, settings))
    }

    async fn start_session(&self, info: DeviceInfo) {
        let key = info.key();
        let active = self
            .settings
            .lock()
            .await
            .inverter(&info.unique_id)
            .is_active;
        if !active {
            self.logger
                .info(&format!("{} is disabled, not polling", info.unique_id));
            return;
        }

        let handle: SessionHandle = match info.protocol {
            ProtocolType::SolarApi => {
                let timeout = Duration::from_millis(self.config.solar_api.timeout_ms);
                match SolarApiClient::with_timeout(&info.host, info.port, timeout) {
                    Ok(client) => {
                        SolarApiUpdater::spawn(
                            info.clone(),
                            Arc::new(client),
                            self.session_context.clone(),
                        )
                        .await
                    }
                    Err(e) => {
                        self.logger.warn(&format!("Cannot poll {}: {}", info.unique_id, e));
                        return;
                    }
                }
            }
            _ => {
                let transport = self.transport_for(&info);
                SunSpecUpdater::spawn(info.clone(), transport, self.session_context.clone()).await
            }
        };

        let started = DeviceEvent::Started {
            key: key.clone(),
            info,
            snapshot: handle.subscribe(),
            commands: handle.commands(),
        };
        // Entry removed while the session was starting
        let orphan = self.registry.lock().await.attach_session(&key, handle);
        if let Some(orphan) = orphan {
            orphan.stop().await;
            return;
        }
        let _ = self.device_events.send(started);
    }

    async fn stop_entry(&self, entry: RegistryEntry) {
        let key = entry.info.key();
        if let Some(session) = entry.session {
            let _ = self.device_events.send(DeviceEvent::Stopped { key });
            session.stop().await;
        }
    }

    async fn handle_poll_event(
        &self,
        event: PollEvent,
        scan: &mut Scan,
        probes: &mut JoinSet<ProbeResult>,
    ) {
        match event {
            PollEvent::ConnectionLost { key, host } => {
                self.registry.lock().await.set_connected(&key, false);
                // A serial link reopens itself; its session keeps polling
                if !self.is_rtu(&host) {
                    scan.inject(host);
                }
            }
            PollEvent::ModelChanged { key, host } => {
                let entry = self.registry.lock().await.remove(&key);
                if let Some(entry) = entry {
                    self.stop_entry(entry).await;
                }
                if self.is_rtu(&host) {
                    self.spawn_rtu_probe(probes);
                } else {
                    scan.inject(host);
                }
            }
        }
    }

    fn is_rtu(&self, host: &str) -> bool {
        self.rtu.as_ref().is_some_and(|l| l.device == host)
    }

    async fn shutdown(&self) {
        self.logger.info("Stopping all polling sessions");
        let entries = self.registry.lock().await.drain();
        for entry in entries {
            self.stop_entry(entry).await;
        }
        if let Err(e) = self.settings.lock().await.save_if_dirty() {
            self.logger.warn(&format!("Failed to save settings: {}", e));
        }
        self.status_tx.send_replace(ScanStatus::default());
    }
}
