//! Device selection and teardown.

mod common;

use common::{fast_settings, selector};
use monsoon_daq::config::Settings;
use monsoon_daq::simulator::{SimulatorConfig, SimulatorFactory};
use monsoon_daq::{destroy, DeviceSelector, HardwareFamily, PowerMonitorError};
use std::sync::Arc;

fn two_monitor_factory() -> Arc<SimulatorFactory> {
    Arc::new(
        SimulatorFactory::new()
            .with_device(SimulatorConfig::new(HardwareFamily::Lvpm, 12345))
            .with_device(SimulatorConfig::new(HardwareFamily::Hvpm, 23456)),
    )
}

#[tokio::test]
async fn test_mixed_specs_create_both_families() {
    let factory = two_monitor_factory();
    let mut monitors = selector(&factory)
        .create_from_json(&serde_json::json!([
            12345,
            {"type": "HvpmMonsoon", "serial": 23456}
        ]))
        .expect("valid device specs");

    let families: Vec<_> = monitors.iter().map(|m| m.family()).collect();
    assert_eq!(families, vec![HardwareFamily::Lvpm, HardwareFamily::Hvpm]);
    assert!(monitors.iter().all(|m| !m.is_open()));
    assert_eq!(factory.connects(12345), 0);

    for monitor in &mut monitors {
        let status = monitor.status().await.expect("status");
        assert_eq!(status.serial, monitor.serial());
    }
    destroy(&mut monitors).await.expect("destroy");
    assert!(monitors.iter().all(|m| !m.is_open()));
}

#[tokio::test]
async fn test_invalid_spec_creates_nothing() {
    let factory = two_monitor_factory();
    let err = selector(&factory)
        .create_from_json(&serde_json::json!([12345, {"type": "UNKNOWN", "serial": 10}]))
        .unwrap_err();
    assert!(matches!(err, PowerMonitorError::Configuration { .. }), "{err}");
    assert_eq!(factory.connects(12345), 0);
}

#[tokio::test]
async fn test_destroy_twice_closes_once() {
    let factory = two_monitor_factory();
    let mut monitors = selector(&factory)
        .create_from_json(&serde_json::json!([12345, 23456]))
        .expect("valid device specs");
    monitors[0].calibrate().await.expect("calibration");
    let _handle = monitors[1].start_sampling(1000).await.expect("start");

    destroy(&mut monitors).await.expect("first destroy");
    assert!(monitors.iter().all(|m| !m.is_open() && !m.is_sampling()));

    destroy(&mut monitors).await.expect("second destroy");
    assert_eq!(factory.connects(12345), 1);
    assert_eq!(factory.connects(23456), 1);
}

#[tokio::test]
async fn test_devices_from_settings_file() {
    let settings = Settings::from_toml_str(
        r#"
        devices = [12345, { type = "HvpmMonsoon", serial = 23456 }]

        [engine]
        read_timeout = "10ms"
        request_timeout = "500ms"

        [selector]
        hvpm_serial_threshold = 20000

        [transport]
        drain_on_open = "0s"
        "#,
    )
    .expect("valid settings");
    settings.validate().expect("settings validate");

    let factory = two_monitor_factory();
    let selector = DeviceSelector::from_settings(&settings, factory.clone());
    let mut monitors = selector.create(settings.device_requests().expect("device requests"));
    assert_eq!(monitors.len(), 2);
    assert_eq!(monitors[1].family(), HardwareFamily::Hvpm);

    let volts = monitors[1]
        .read_reading(monsoon_daq::Reading::Voltage)
        .await
        .expect("voltage");
    assert!((volts - 5.0).abs() < 1e-3);
    destroy(&mut monitors).await.expect("destroy");
}

#[test]
fn test_threshold_override() {
    let factory = two_monitor_factory();
    let selector = DeviceSelector::from_settings(&fast_settings(), factory)
        .with_hvpm_serial_threshold(10_000);
    assert_eq!(selector.family_for_serial(12345), HardwareFamily::Hvpm);
    assert_eq!(selector.family_for_serial(9999), HardwareFamily::Lvpm);
}
