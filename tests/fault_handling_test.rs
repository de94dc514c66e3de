//! Fault paths: withheld calibration, corrupt frames, device faults and
//! silent devices, and recovery through `reset()`.

mod common;

use common::{run_until_fault, selector, take_samples};
use monsoon_daq::simulator::{SimulatorConfig, SimulatorFactory};
use monsoon_daq::{
    destroy, Channel, EngineState, ErrorKind, Granularity, HardwareFamily, Instrument, Origin,
    PowerMonitorError,
};
use std::sync::Arc;

fn monitor(config: SimulatorConfig) -> (Arc<SimulatorFactory>, Vec<Instrument>) {
    let serial = config.serial;
    let factory = Arc::new(SimulatorFactory::new().with_device(config));
    let monitors = selector(&factory)
        .create_from_json(&serde_json::json!([serial]))
        .expect("valid device spec");
    (factory, monitors)
}

#[tokio::test]
async fn test_withheld_calibration_faults_the_session() {
    let (factory, mut monitors) = monitor(
        SimulatorConfig::new(HardwareFamily::Lvpm, 100).withhold(
            Channel::Main,
            Granularity::Coarse,
            Origin::Scale,
        ),
    );
    let monitor = &mut monitors[0];

    let mut handle = monitor.start_sampling(1000).await.expect("start");
    let (samples, err) = run_until_fault(&mut handle).await;
    // Main carries the only load, and its coarse triad never completes
    assert!(samples.is_empty());
    assert!(matches!(err, PowerMonitorError::CalibrationTimeout { .. }), "{err}");
    assert_eq!(monitor.state(), EngineState::Faulted);

    let report = monitor.stop_sampling(handle).await.expect("stop");
    assert_eq!(report.fault, Some(err));
    assert!(report.stats.peak_uncalibrated > 0);

    // Faulted is sticky
    let err = monitor.start_sampling(1000).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::State);

    monitor.reset().await.expect("reset");
    assert_eq!(monitor.state(), EngineState::Idle);
    assert!(!monitor.calibration().is_complete());
    assert_eq!(factory.connects(100), 2);
    destroy(&mut monitors).await.expect("destroy");
}

#[tokio::test]
async fn test_frequent_corruption_escalates() {
    let (_factory, mut monitors) =
        monitor(SimulatorConfig::new(HardwareFamily::Hvpm, 30000).corrupt_every(2));
    let monitor = &mut monitors[0];
    monitor.calibrate().await.expect("calibration");

    let mut handle = monitor.start_sampling(2000).await.expect("start");
    let (_samples, err) = run_until_fault(&mut handle).await;
    assert!(matches!(err, PowerMonitorError::Checksum { .. }), "{err}");
    assert_eq!(monitor.state(), EngineState::Faulted);

    let report = monitor.stop_sampling(handle).await.expect("stop");
    assert!(report.stats.checksum_errors > 0);
    assert!(!report.is_clean());
    destroy(&mut monitors).await.expect("destroy");
}

#[tokio::test]
async fn test_occasional_corruption_is_tolerated() {
    let (_factory, mut monitors) =
        monitor(SimulatorConfig::new(HardwareFamily::Lvpm, 200).corrupt_every(50));
    let monitor = &mut monitors[0];
    monitor.calibrate().await.expect("calibration");

    let mut handle = monitor.start_sampling(2000).await.expect("start");
    take_samples(&mut handle, 300).await;
    let report = monitor.stop_sampling(handle).await.expect("stop");

    assert!(report.is_clean(), "{:?}", report.fault);
    assert!(report.stats.checksum_errors > 0);
    assert_eq!(monitor.state(), EngineState::Idle);
    destroy(&mut monitors).await.expect("destroy");
}

#[tokio::test]
async fn test_device_fault_then_reset() {
    let (factory, mut monitors) =
        monitor(SimulatorConfig::new(HardwareFamily::Lvpm, 300).fault_after(20, 0x42));
    let monitor = &mut monitors[0];
    monitor.calibrate().await.expect("calibration");

    let mut handle = monitor.start_sampling(1000).await.expect("start");
    let (samples, err) = run_until_fault(&mut handle).await;
    assert_eq!(samples.len(), 20);
    assert_eq!(err, PowerMonitorError::DeviceFault { code: 0x42 });
    assert_eq!(err.kind(), ErrorKind::Hardware);
    monitor.stop_sampling(handle).await.expect("stop");

    let err = monitor.status().await.unwrap_err();
    assert!(matches!(err, PowerMonitorError::InvalidState { .. }), "{err}");

    monitor.reset().await.expect("reset");
    let status = monitor.status().await.expect("status after reset");
    assert!(!status.is_fault());
    assert_eq!(status.serial, 300);
    assert_eq!(factory.connects(300), 2);
    destroy(&mut monitors).await.expect("destroy");
}

#[tokio::test]
async fn test_silent_device_trips_the_watchdog() {
    let (_factory, mut monitors) =
        monitor(SimulatorConfig::new(HardwareFamily::Hvpm, 40000).silent_after(10));
    let monitor = &mut monitors[0];
    monitor.calibrate().await.expect("calibration");

    let mut handle = monitor.start_sampling(1000).await.expect("start");
    let (samples, err) = run_until_fault(&mut handle).await;
    assert_eq!(samples.len(), 10);
    assert!(matches!(err, PowerMonitorError::Transport { .. }), "{err}");
    assert_eq!(err.kind(), ErrorKind::Communication);

    monitor.stop_sampling(handle).await.expect("stop");
    assert_eq!(monitor.state(), EngineState::Faulted);
    destroy(&mut monitors).await.expect("destroy");
}

#[tokio::test]
async fn test_missing_device_faults_on_first_use() {
    let factory = Arc::new(SimulatorFactory::new());
    let mut monitors = selector(&factory)
        .create_from_json(&serde_json::json!([55]))
        .expect("creation does not touch hardware");
    let monitor = &mut monitors[0];

    let err = monitor.calibrate().await.unwrap_err();
    assert!(matches!(err, PowerMonitorError::Transport { .. }), "{err}");
    assert!(!monitor.is_open());
    destroy(&mut monitors).await.expect("destroy");
}
