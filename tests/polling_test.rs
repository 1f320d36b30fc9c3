mod common;

use common::*;
use helios::config::PollingConfig;
use helios::device::{DeviceInfo, InverterPhase, InverterPosition, ProtocolType, product};
use helios::modbus::ModbusTransport;
use helios::polling::{
    InverterSnapshot, PollEvent, SessionContext, SolarApiState, SolarApiUpdater, SunSpecState,
    SunSpecUpdater, UpdaterCommand,
};
use helios::settings::SettingsStore;
use helios::solar_api::SolarApiClient;
use helios::sunspec::SunSpecDetector;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{Mutex, mpsc};

struct Harness {
    transport: Arc<MapTransport>,
    updater: SunSpecUpdater,
    events: mpsc::UnboundedReceiver<PollEvent>,
    settings: Arc<Mutex<SettingsStore>>,
    _dir: TempDir,
}

fn context(dir: &TempDir) -> (SessionContext, mpsc::UnboundedReceiver<PollEvent>) {
    let settings = Arc::new(Mutex::new(SettingsStore::new(
        dir.path().join("settings.json"),
    )));
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    (
        SessionContext {
            polling: PollingConfig::default(),
            settings,
            events: events_tx,
        },
        events_rx,
    )
}

/// Fronius map with W = 445 (SF 0) and operating state MPPT
fn producing_map() -> std::collections::HashMap<u16, u16> {
    let mut map = fronius_map();
    map.insert(INVERTER_AT + 14, 445);
    map.insert(INVERTER_AT + 38, 4);
    map
}

async fn detect(map: std::collections::HashMap<u16, u16>) -> (DeviceInfo, Arc<MapTransport>) {
    let transport = Arc::new(MapTransport::new(map));
    let info = SunSpecDetector::new(Duration::from_secs(5))
        .detect(transport.as_ref(), "10.0.0.5", 502, 1)
        .await
        .expect("inverter detected");
    (info, transport)
}

/// Detect the map and start an updater on it
async fn harness_for(map: std::collections::HashMap<u16, u16>) -> Harness {
    let (info, transport) = detect(map).await;
    let dir = tempfile::tempdir().unwrap();
    let (ctx, events) = context(&dir);
    let settings = ctx.settings.clone();
    let dyn_transport: Arc<dyn ModbusTransport> = transport.clone();
    let (updater, _snapshots) = SunSpecUpdater::new(info, dyn_transport, ctx).await;
    Harness {
        transport,
        updater,
        events,
        settings,
        _dir: dir,
    }
}

async fn sunspec_harness() -> Harness {
    harness_for(producing_map()).await
}

/// Run one poll cycle: step through Idle and Init, then read telemetry
async fn poll_cycle(updater: &mut SunSpecUpdater) {
    for _ in 0..2 {
        if updater.state() == SunSpecState::ReadTelemetry {
            break;
        }
        updater.step().await;
    }
    assert_eq!(updater.state(), SunSpecState::ReadTelemetry);
    updater.step().await;
}

#[tokio::test]
async fn successful_read_publishes_measurements() {
    let mut h = sunspec_harness().await;
    assert_eq!(h.updater.state(), SunSpecState::Init);
    poll_cycle(&mut h.updater).await;

    assert_eq!(h.updater.state(), SunSpecState::Idle);
    let snapshot = h.updater.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.mean.power, 445.0);
    assert_eq!(snapshot.status_code, Some(11));
    assert_eq!(snapshot.max_power_limit, 8200.0);
    assert_eq!(snapshot.power_limit, 8200.0);
}

#[tokio::test]
async fn connection_lost_is_reported_once() {
    let mut h = sunspec_harness().await;
    h.transport.set_failing(true);

    for _ in 0..4 {
        poll_cycle(&mut h.updater).await;
        assert_eq!(h.updater.state(), SunSpecState::Idle);
    }
    assert_eq!(h.updater.retry_count(), 4);
    assert!(h.events.try_recv().is_err());

    poll_cycle(&mut h.updater).await;
    assert_eq!(h.updater.retry_count(), 0);
    assert!(!h.updater.snapshot().connected);
    match h.events.try_recv() {
        Ok(PollEvent::ConnectionLost { key, host }) => {
            assert_eq!(host, "10.0.0.5");
            assert_eq!(key.unique_id, "28136344");
        }
        other => panic!("expected ConnectionLost, got {:?}", other),
    }

    // The outage continues; no second event
    for _ in 0..6 {
        poll_cycle(&mut h.updater).await;
    }
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn recovery_clears_outage() {
    let mut h = sunspec_harness().await;
    h.transport.set_failing(true);
    for _ in 0..5 {
        poll_cycle(&mut h.updater).await;
    }
    assert!(matches!(h.events.try_recv(), Ok(PollEvent::ConnectionLost { .. })));

    h.transport.set_failing(false);
    poll_cycle(&mut h.updater).await;
    assert!(h.updater.snapshot().connected);
    assert_eq!(h.updater.retry_count(), 0);

    h.transport.set_failing(true);
    for _ in 0..5 {
        poll_cycle(&mut h.updater).await;
    }
    assert!(matches!(h.events.try_recv(), Ok(PollEvent::ConnectionLost { .. })));
}

#[tokio::test]
async fn repeated_power_limit_is_rewritten() {
    let mut h = sunspec_harness().await;
    poll_cycle(&mut h.updater).await;
    assert_eq!(h.updater.state(), SunSpecState::Idle);

    for round in 1..=2 {
        h.updater
            .handle_command(UpdaterCommand::SetPowerLimit(4100.0))
            .await;
        assert!(h.updater.has_pending_limit());
        assert_eq!(h.updater.state(), SunSpecState::WritePowerLimit);
        h.updater.step().await;

        assert_eq!(h.updater.state(), SunSpecState::Idle);
        assert!(!h.updater.has_pending_limit());
        let writes = h.transport.writes();
        assert_eq!(writes.len(), round);
        assert_eq!(writes[round - 1], (CONTROLS_AT + 5, vec![5000, 0, 120, 0, 1]));
    }
    assert_eq!(h.updater.snapshot().power_limit, 4100.0);
    assert!(h.events.try_recv().is_err());
}

#[tokio::test]
async fn limit_above_max_is_clamped() {
    let mut h = sunspec_harness().await;
    poll_cycle(&mut h.updater).await;
    h.updater
        .handle_command(UpdaterCommand::SetPowerLimit(20_000.0))
        .await;
    h.updater.step().await;
    assert_eq!(h.transport.writes()[0].1[0], 10000);
}

#[tokio::test]
async fn limit_requested_while_busy_follows_the_read() {
    let mut h = sunspec_harness().await;
    h.updater.step().await;
    assert_eq!(h.updater.state(), SunSpecState::ReadTelemetry);
    h.updater
        .handle_command(UpdaterCommand::SetPowerLimit(0.0))
        .await;
    assert_eq!(h.updater.state(), SunSpecState::ReadTelemetry);

    h.updater.step().await;
    assert_eq!(h.updater.state(), SunSpecState::WritePowerLimit);
    h.updater.step().await;
    assert_eq!(h.transport.writes()[0], (CONTROLS_AT + 5, vec![0, 0, 120, 0, 1]));
}

#[tokio::test]
async fn failed_limiter_setup_still_polls_telemetry() {
    let mut map = producing_map();
    // SolarEdge without the MaxActivePower register (0xF304)
    for (i, v) in string_registers("SolarEdge", 16).into_iter().enumerate() {
        map.insert(COMMON_AT + 2 + i as u16, v);
    }
    let mut h = harness_for(map).await;
    assert_eq!(h.updater.snapshot().info.product_id, product::SOLAREDGE);

    poll_cycle(&mut h.updater).await;
    assert_eq!(h.updater.state(), SunSpecState::Idle);
    let snapshot = h.updater.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.mean.power, 445.0);
    assert!(snapshot.max_power_limit.is_nan());
    assert!(snapshot.power_limit.is_nan());
    assert!(h.events.try_recv().is_err());

    // Limiting stays off for this connection
    h.updater
        .handle_command(UpdaterCommand::SetPowerLimit(4100.0))
        .await;
    assert!(!h.updater.has_pending_limit());
    for _ in 0..3 {
        poll_cycle(&mut h.updater).await;
    }
    assert!(h.transport.writes().is_empty());
    assert_eq!(h.updater.retry_count(), 0);
}

async fn wait_for_limit(
    snapshots: &mut tokio::sync::watch::Receiver<Arc<InverterSnapshot>>,
    expected: f64,
) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let current = snapshots.borrow_and_update().clone();
            if current.connected && current.power_limit == expected {
                return;
            }
            if snapshots.changed().await.is_err() {
                panic!("session ended");
            }
        }
    })
    .await
    .expect("power limit published");
}

#[tokio::test]
async fn expired_power_limit_returns_to_max() {
    let (info, transport) = detect(producing_map()).await;
    let dir = tempfile::tempdir().unwrap();
    let (mut ctx, _events) = context(&dir);
    ctx.polling.idle_interval_ms = 20;
    ctx.polling.power_limit_refresh_ms = 200;
    let dyn_transport: Arc<dyn ModbusTransport> = transport.clone();
    let session = SunSpecUpdater::spawn(info, dyn_transport, ctx).await;
    let mut snapshots = session.subscribe();

    wait_for_limit(&mut snapshots, 8200.0).await;
    assert!(session.send(UpdaterCommand::SetPowerLimit(4100.0)));
    wait_for_limit(&mut snapshots, 4100.0).await;
    assert!(transport.writes().contains(&(CONTROLS_AT + 5, vec![5000, 0, 120, 0, 1])));

    // Nobody renewed the limit: the enable flag is cleared and max is published again
    wait_for_limit(&mut snapshots, 8200.0).await;
    assert!(transport.writes().contains(&(CONTROLS_AT + 9, vec![0])));
    session.stop().await;
}

#[tokio::test]
async fn changed_model_halts_session() {
    let mut h = sunspec_harness().await;
    poll_cycle(&mut h.updater).await;
    // Firmware update turned the three-phase model into a single-phase one
    h.transport.registers.lock().unwrap().insert(INVERTER_AT, 101);
    poll_cycle(&mut h.updater).await;

    assert_eq!(h.updater.state(), SunSpecState::Halted);
    assert!(matches!(h.events.try_recv(), Ok(PollEvent::ModelChanged { .. })));
    h.updater.step().await;
    assert_eq!(h.updater.state(), SunSpecState::Halted);
}

#[tokio::test]
async fn settings_commands_are_persisted() {
    let mut h = sunspec_harness().await;
    h.updater
        .handle_command(UpdaterCommand::SetCustomName("Garage roof".to_string()))
        .await;
    h.updater
        .handle_command(UpdaterCommand::SetPosition(InverterPosition::Input2))
        .await;
    h.updater
        .handle_command(UpdaterCommand::SetPhase(InverterPhase::L3))
        .await;

    assert_eq!(h.updater.snapshot().custom_name, "Garage roof");
    assert_eq!(h.updater.snapshot().position, InverterPosition::Input2);
    assert_eq!(h.updater.snapshot().phase, InverterPhase::L3);

    let path = h.settings.lock().await.file_path().to_path_buf();
    let mut reloaded = SettingsStore::new(&path);
    reloaded.load().unwrap();
    let saved = reloaded.get_inverter("28136344").expect("inverter saved");
    assert_eq!(saved.custom_name, "Garage roof");
    assert_eq!(saved.position, InverterPosition::Input2);
    assert_eq!(saved.phase, InverterPhase::L3);
}

#[tokio::test]
async fn overlong_custom_name_is_rejected() {
    let mut h = sunspec_harness().await;
    h.updater
        .handle_command(UpdaterCommand::SetCustomName("x".repeat(65)))
        .await;
    assert_eq!(h.updater.snapshot().custom_name, "");
}

#[tokio::test]
async fn solar_api_updater_reads_common_then_three_phase() {
    let (port, requests) = spawn_http_server(|line| {
        if line.contains("CommonInverterData") {
            solar_api_reply(serde_json::json!({
                "PAC": { "Value": 445.7, "Unit": "W" },
                "IAC": { "Value": 1.9, "Unit": "A" },
                "UAC": { "Value": 231.0, "Unit": "V" },
                "TOTAL_ENERGY": { "Value": 1_500_000.0, "Unit": "Wh" },
                "DeviceStatus": { "StatusCode": 7, "ErrorCode": 0 }
            }))
        } else {
            solar_api_reply(serde_json::json!({
                "IAC_L1": { "Value": 0.7 }, "IAC_L2": { "Value": 0.6 }, "IAC_L3": { "Value": 0.6 },
                "UAC_L1": { "Value": 231.0 }, "UAC_L2": { "Value": 232.0 }, "UAC_L3": { "Value": 230.0 }
            }))
        }
    })
    .await;

    let mut info = DeviceInfo::new("127.0.0.1", port, 1);
    info.protocol = ProtocolType::SolarApi;
    info.phase_count = 3;
    info.unique_id = "123_100372".to_string();
    let client = Arc::new(SolarApiClient::new("127.0.0.1", port).unwrap());

    let dir = tempfile::tempdir().unwrap();
    let (ctx, _events) = context(&dir);
    let (mut updater, snapshots) = SolarApiUpdater::new(info, client, ctx).await;

    updater.step().await;
    assert_eq!(updater.state(), SolarApiState::Get3PData);
    updater.step().await;
    assert_eq!(updater.state(), SolarApiState::Idle);

    let snapshot = snapshots.borrow().clone();
    assert!(snapshot.connected);
    assert_eq!(snapshot.mean.power, 445.7);
    assert_eq!(snapshot.mean.energy, 1500.0);
    assert_eq!(snapshot.status_code, Some(7));
    let phase_power: f64 = snapshot.phases.iter().map(|p| p.power).sum();
    assert!((phase_power - 445.7).abs() < 1e-6);

    let requests = requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    assert!(requests[0].contains("Scope=Device"));
    assert!(requests[0].contains("DeviceId=1"));
    assert!(requests[1].contains("DataCollection=3PInverterData"));
}

#[tokio::test]
async fn solar_api_updater_ignores_power_limit() {
    let (port, requests) = spawn_http_server(|_| solar_api_reply(serde_json::json!({}))).await;
    let mut info = DeviceInfo::new("127.0.0.1", port, 1);
    info.protocol = ProtocolType::SolarApi;
    info.phase_count = 1;
    info.unique_id = "123_1".to_string();
    let client = Arc::new(SolarApiClient::new("127.0.0.1", port).unwrap());
    let dir = tempfile::tempdir().unwrap();
    let (ctx, _events) = context(&dir);
    let (mut updater, _snapshots) = SolarApiUpdater::new(info, client, ctx).await;

    updater
        .handle_command(UpdaterCommand::SetPowerLimit(1000.0))
        .await;
    assert_eq!(updater.state(), SolarApiState::GetCommonData);
    assert!(requests.lock().unwrap().is_empty());
}
