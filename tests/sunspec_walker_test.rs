mod common;

use common::*;
use helios::device::{ProtocolType, product};
use helios::modbus::{ModbusTcpClient, TcpClientSettings};
use helios::sunspec::SunSpecDetector;
use std::time::Duration;

#[tokio::test]
async fn walker_fingerprints_fronius_map() {
    let transport = MapTransport::new(fronius_map());
    let info = SunSpecDetector::new(Duration::from_secs(5))
        .detect(&transport, "10.0.0.5", 502, 1)
        .await
        .expect("inverter detected");

    assert_eq!(info.product_id, product::FRONIUS);
    assert_eq!(info.product_name, "Fronius Symo 8.2-3-M");
    assert_eq!(info.serial_number, "28136344");
    assert_eq!(info.protocol, ProtocolType::SunSpecIntSf);
    assert_eq!(info.phase_count, 3);
    assert_eq!(info.inverter_model_offset, INVERTER_AT);
    assert_eq!(info.max_power, 8200.0);
    assert_eq!(info.control_model, 123);
    assert_eq!(info.control_offset, CONTROLS_AT);
    assert_eq!(info.power_limit_scale, 10000.0);
}

#[tokio::test]
async fn walker_stops_at_end_marker() {
    let transport = MapTransport::new(fronius_map());
    SunSpecDetector::new(Duration::from_secs(5))
        .detect(&transport, "10.0.0.5", 502, 1)
        .await
        .expect("inverter detected");

    let reads = transport.reads();
    assert_eq!(reads.last(), Some(&(END_AT, 2)));
    assert!(reads.iter().all(|&(start, count)| start + count <= END_AT + 2));
}

#[tokio::test]
async fn unknown_models_are_skipped_by_length() {
    let transport = MapTransport::new(fronius_map());
    SunSpecDetector::new(Duration::from_secs(5))
        .detect(&transport, "10.0.0.5", 502, 1)
        .await
        .expect("inverter detected");

    let reads = transport.reads();
    // Only the header of the unknown model is read, then the next model follows
    let at_unknown: Vec<_> = reads.iter().filter(|(start, _)| *start == UNKNOWN_AT).collect();
    assert_eq!(at_unknown, vec![&(UNKNOWN_AT, 2)]);
    assert!(reads.contains(&(NAMEPLATE_AT, 2)));
    assert!(!reads.iter().any(|(start, _)| (UNKNOWN_AT + 2..NAMEPLATE_AT).contains(start)));
}

#[tokio::test]
async fn map_without_inverter_model_is_ignored() {
    let mut map = fronius_map();
    // Replace the inverter model with an unknown one of the same length
    map.insert(INVERTER_AT, 64000);
    let transport = MapTransport::new(map);
    let info = SunSpecDetector::new(Duration::from_secs(5))
        .detect(&transport, "10.0.0.5", 502, 1)
        .await;
    assert!(info.is_none());
}

#[tokio::test]
async fn missing_marker_is_not_sunspec() {
    let mut map = fronius_map();
    map.insert(BASE, 0);
    let transport = MapTransport::new(map);
    let info = SunSpecDetector::new(Duration::from_secs(5))
        .detect(&transport, "10.0.0.5", 502, 1)
        .await;
    assert!(info.is_none());
    // Every base address was tried
    let reads = transport.reads();
    assert!(reads.contains(&(50000, 2)));
}

#[tokio::test]
async fn tcp_walk_reads_header_after_marker() {
    let (port, log) = spawn_modbus_server(fronius_map()).await;
    let client = ModbusTcpClient::new("127.0.0.1", port, TcpClientSettings::default());
    let info = SunSpecDetector::new(Duration::from_secs(5))
        .detect(&client, "127.0.0.1", port, 1)
        .await
        .expect("inverter detected over TCP");
    client.close();

    assert_eq!(info.port, port);
    let log = log.lock().unwrap().clone();
    assert_eq!(log[0], (1, 3, BASE, 2));
    assert_eq!(log[1], (1, 3, COMMON_AT, 2));
}
