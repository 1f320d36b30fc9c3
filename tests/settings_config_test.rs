use helios::config::{Config, RtuConfig};
use helios::device::{InverterPhase, InverterPosition};
use helios::settings::{SettingsStore, settings_key};
use helios::HeliosError;
use std::time::Duration;

#[test]
fn settings_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");

    let mut store = SettingsStore::new(&path);
    store.update_inverter("102_28136344", |s| {
        s.phase = InverterPhase::L2;
        s.position = InverterPosition::Output;
    });
    store.set_custom_name("102_28136344", "Carport").unwrap();
    store.store_energy("102_28136344", [1.5, f64::NAN, 0.0]);
    store.add_known_ip("192.168.1.40");
    store.save().unwrap();
    assert!(!store.is_dirty());

    let mut reloaded = SettingsStore::new(&path);
    reloaded.load().unwrap();
    let saved = reloaded.get_inverter("102_28136344").unwrap();
    assert_eq!(saved.phase, InverterPhase::L2);
    assert_eq!(saved.position, InverterPosition::Output);
    assert_eq!(saved.custom_name, "Carport");
    assert_eq!(saved.l1_energy, Some(1.5));
    // Only normal numbers are stored
    assert_eq!(saved.l2_energy, None);
    assert_eq!(saved.l3_energy, None);
    assert_eq!(reloaded.global().known_ip_addresses, vec!["192.168.1.40"]);
    assert!(reloaded.data().inverters.contains_key(&settings_key("102_28136344")));
}

#[test]
fn unchanged_update_keeps_store_clean() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = SettingsStore::new(dir.path().join("settings.json"));
    store.inverter("a");
    store.save().unwrap();
    store.update_inverter("a", |s| s.is_active = true);
    assert!(!store.is_dirty());
    assert!(store.add_known_ip("10.0.0.1"));
    assert!(store.is_dirty());
    assert!(!store.add_known_ip("10.0.0.1"));

    store.save().unwrap();
    store.update_global(|g| g.auto_scan = Some(false));
    assert!(store.is_dirty());
    assert_eq!(store.global().auto_scan, Some(false));
}

#[tokio::test]
async fn missing_settings_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let store =
        SettingsStore::open(dir.path().join("absent.json"), 3, Duration::from_millis(1)).await;
    assert!(store.data().inverters.is_empty());
    assert!(store.global().ip_addresses.is_empty());
}

#[tokio::test]
async fn corrupt_settings_file_falls_back_and_is_rewritten() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    let mut store = SettingsStore::open(&path, 2, Duration::from_millis(1)).await;
    assert!(store.data().inverters.is_empty());
    assert!(store.is_dirty());
    store.save_if_dirty().unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    assert!(serde_json::from_str::<serde_json::Value>(&contents).is_ok());
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");

    let mut config = Config::default();
    config.discovery.ip_addresses = vec!["192.168.1.20".to_string()];
    config.modbus.rtu = Some(RtuConfig {
        device: "/dev/ttyUSB0".to_string(),
        baud_rate: 19200,
        unit_ids: vec![2, 3],
        response_timeout_ms: 800,
    });
    config.polling.retry_threshold = 3;
    config.save_to_file(&path).unwrap();

    let loaded = Config::from_file(&path).unwrap();
    assert!(loaded.validate().is_ok());
    assert_eq!(loaded.discovery.ip_addresses, vec!["192.168.1.20"]);
    assert_eq!(loaded.polling.retry_threshold, 3);
    let rtu = loaded.modbus.rtu.unwrap();
    assert_eq!(rtu.baud_rate, 19200);
    assert_eq!(rtu.unit_ids, vec![2, 3]);
}

#[test]
fn invalid_yaml_is_serialization_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(&path, "modbus: [unclosed").unwrap();
    let err = Config::from_file(&path).unwrap_err();
    assert!(matches!(err, HeliosError::Serialization { .. }));
}

#[test]
fn missing_config_file_is_io_error() {
    let err = Config::from_file("/nonexistent/helios.yaml").unwrap_err();
    assert!(matches!(err, HeliosError::Io { .. }));
}

#[test]
fn validation_names_the_field() {
    let mut config = Config::default();
    config.modbus.tcp_pipeline_depth = 0;
    let err = config.validate().unwrap_err();
    assert!(matches!(
        err,
        HeliosError::Validation { ref field, .. } if field == "modbus.tcp_pipeline_depth"
    ));

    let mut config = Config::default();
    config.logging.level = "LOUD".to_string();
    let err = config.validate().unwrap_err();
    assert!(matches!(err, HeliosError::Validation { ref field, .. } if field == "logging.level"));

    let mut config = Config::default();
    config.polling.retry_threshold = 0;
    assert!(config.validate().is_err());
}
