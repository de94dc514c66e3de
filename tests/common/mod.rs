//! Shared helpers for simulator-backed integration tests.

#![allow(dead_code)]

use futures::StreamExt;
use monsoon_daq::config::Settings;
use monsoon_daq::simulator::SimulatorFactory;
use monsoon_daq::{CalibratedSample, DeviceSelector, PowerMonitorError, SamplingHandle};
use std::sync::Arc;
use std::time::Duration;

/// Upper bound for any single wait in these tests.
pub const PATIENCE: Duration = Duration::from_secs(5);

/// Settings with timeouts short enough for tests.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.engine.read_timeout = Duration::from_millis(10);
    settings.engine.watchdog = Duration::from_millis(300);
    settings.engine.calibration_timeout = Duration::from_millis(300);
    settings.engine.drain_timeout = Duration::from_millis(100);
    settings.engine.request_timeout = Duration::from_millis(500);
    settings.transport.drain_on_open = Duration::ZERO;
    settings
}

/// Selector wired to a simulator factory.
pub fn selector(factory: &Arc<SimulatorFactory>) -> DeviceSelector {
    DeviceSelector::from_settings(&fast_settings(), factory.clone())
}

/// Read exactly `n` samples, failing on faults and stalls.
pub async fn take_samples(handle: &mut SamplingHandle, n: usize) -> Vec<CalibratedSample> {
    let mut samples = Vec::with_capacity(n);
    while samples.len() < n {
        let item = tokio::time::timeout(PATIENCE, handle.next())
            .await
            .expect("timed out waiting for samples")
            .expect("sample stream ended early");
        samples.push(item.expect("session faulted"));
    }
    samples
}

/// Read until the session faults; returns the samples seen before it.
pub async fn run_until_fault(
    handle: &mut SamplingHandle,
) -> (Vec<CalibratedSample>, PowerMonitorError) {
    let mut samples = Vec::new();
    loop {
        let item = tokio::time::timeout(PATIENCE, handle.next())
            .await
            .expect("timed out waiting for a fault")
            .expect("sample stream ended without a fault");
        match item {
            Ok(sample) => samples.push(sample),
            Err(err) => return (samples, err),
        }
    }
}

/// Assert stream positions are 0, 1, 2, ...
pub fn assert_contiguous(samples: &[CalibratedSample]) {
    for (expected, sample) in samples.iter().enumerate() {
        assert_eq!(sample.sequence, expected as u64, "gap in sample sequence");
    }
}
