//! One power monitor: lazily opened link, calibration store and session
//! state.
//!
//! An `Instrument` is created by the [`DeviceSelector`](crate::selector::DeviceSelector)
//! without touching the hardware; the transport opens on the first command.
//! Request/response commands run inline on the caller's task. Sampling moves
//! the link into a dedicated task until `stop_sampling` hands it back.

use crate::calibration::{CalibrationSet, CalibrationStore};
use crate::config::{CalibrationSettings, EngineSettings, Settings};
use crate::engine::{
    spawn_session, EngineState, Link, RunningSession, SamplingHandle, SamplingReport,
    SamplingStats, SessionPlan, SessionState,
};
use crate::error::{PowerMonitorError, Result};
use crate::protocol::{Command, Frame};
use crate::transport::{drain_input, TransportFactory};
use crate::types::{
    Channel, DeviceStatus, Granularity, HardwareFamily, Reading, ReferenceCurrents, UsbPassthrough,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument, trace, warn};

/// Highest sample rate either family accepts.
pub const MAX_SAMPLE_RATE_HZ: u16 = 5000;

/// Per-instrument settings.
#[derive(Debug, Clone, PartialEq)]
pub struct InstrumentConfig {
    /// Engine timing and limits.
    pub engine: EngineSettings,
    /// Reference currents used for conversion.
    pub reference_currents: ReferenceCurrents,
    /// Quiet period for discarding stale input on open; zero skips it.
    pub drain_on_open: Duration,
}

impl InstrumentConfig {
    /// Library defaults for a family.
    #[must_use]
    pub fn for_family(family: HardwareFamily) -> Self {
        Self::from_settings(&Settings::default(), family)
    }

    /// Settings for a family taken from loaded configuration.
    #[must_use]
    pub fn from_settings(settings: &Settings, family: HardwareFamily) -> Self {
        Self::from_parts(
            &settings.engine,
            &settings.calibration,
            settings.transport.drain_on_open,
            family,
        )
    }

    pub(crate) fn from_parts(
        engine: &EngineSettings,
        calibration: &CalibrationSettings,
        drain_on_open: Duration,
        family: HardwareFamily,
    ) -> Self {
        Self {
            engine: engine.clone(),
            reference_currents: calibration.reference_currents(family),
            drain_on_open,
        }
    }
}

/// A power monitor and its session.
pub struct Instrument {
    family: HardwareFamily,
    serial: u32,
    config: InstrumentConfig,
    transports: Arc<dyn TransportFactory>,
    link: Option<Link>,
    session: Option<RunningSession>,
    store: CalibrationStore,
    state: SessionState,
    next_session_id: u64,
}

impl fmt::Debug for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instrument")
            .field("family", &self.family)
            .field("serial", &self.serial)
            .field("state", &self.state.get())
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Instrument {
    /// Create an instrument. Nothing is opened until the first command.
    pub fn new(
        family: HardwareFamily,
        serial: u32,
        transports: Arc<dyn TransportFactory>,
        config: InstrumentConfig,
    ) -> Self {
        Self {
            family,
            serial,
            config,
            transports,
            link: None,
            session: None,
            store: CalibrationStore::new(),
            state: SessionState::default(),
            next_session_id: 0,
        }
    }

    /// Hardware family.
    #[must_use]
    pub fn family(&self) -> HardwareFamily {
        self.family
    }

    /// Serial number.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Settings in effect.
    #[must_use]
    pub fn config(&self) -> &InstrumentConfig {
        &self.config
    }

    /// Current session state.
    #[must_use]
    pub fn state(&self) -> EngineState {
        self.state.get()
    }

    /// The fault that put the instrument in `Faulted`, if any.
    #[must_use]
    pub fn fault(&self) -> Option<PowerMonitorError> {
        self.state.fault_reason()
    }

    /// Shared handle to the calibration store.
    ///
    /// Updates made through it apply to a running session from the next
    /// sample onward.
    #[must_use]
    pub fn calibration(&self) -> CalibrationStore {
        self.store.clone()
    }

    /// Whether the transport is open (including while lent to a session).
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.link.is_some() || self.session.is_some()
    }

    /// Whether a sampling session is running.
    ///
    /// A session whose handle was dropped no longer counts.
    #[must_use]
    pub fn is_sampling(&self) -> bool {
        self.session
            .as_ref()
            .is_some_and(|session| !session.is_abandoned())
    }

    fn invalid(&self, operation: &'static str) -> PowerMonitorError {
        PowerMonitorError::InvalidState {
            operation,
            state: self.state.get(),
        }
    }

    fn ensure_idle(&self, operation: &'static str) -> Result<()> {
        if self.session.is_some() || self.state.get() != EngineState::Idle {
            return Err(self.invalid(operation));
        }
        Ok(())
    }

    /// Fault the instrument on errors that leave the device in an unknown
    /// condition.
    fn settle<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(err) = &result {
            match err {
                PowerMonitorError::Timeout { .. }
                | PowerMonitorError::InvalidState { .. }
                | PowerMonitorError::Configuration { .. } => {}
                _ => {
                    warn!(serial = self.serial, error = %err, "Instrument faulted");
                    self.state.fault(err.clone());
                }
            }
        }
        result
    }

    /// Open the transport if it is not open yet.
    #[instrument(skip(self), fields(serial = self.serial, family = %self.family), err)]
    pub async fn open(&mut self) -> Result<()> {
        if self.state.get() == EngineState::Faulted {
            return Err(self.invalid("open"));
        }
        if self.is_open() {
            return Ok(());
        }

        let mut transport = self.transports.connect(self.family, self.serial).await?;
        if !self.config.drain_on_open.is_zero() {
            let discarded = drain_input(
                transport.as_mut(),
                self.config.drain_on_open,
                self.config.engine.drain_timeout,
            )
            .await?;
            if discarded > 0 {
                debug!(discarded, "Discarded stale bytes on open");
            }
        }

        self.link = Some(Link::new(
            transport,
            self.family,
            self.config.engine.read_chunk_bytes,
        ));
        info!(serial = self.serial, family = %self.family, "Opened power monitor");
        Ok(())
    }

    /// Open if needed and borrow the link for a command.
    async fn idle_link(&mut self, operation: &'static str) -> Result<&mut Link> {
        self.reclaim_abandoned().await?;
        self.ensure_idle(operation)?;
        let opened = self.open().await;
        self.settle(opened)?;
        self.link
            .as_mut()
            .ok_or_else(|| PowerMonitorError::transport("transport not open"))
    }

    /// Read the device's calibration and wait until every origin has been
    /// reported.
    ///
    /// Values already in the store are kept until superseded. Fails with
    /// `CalibrationTimeout` when origins are missing after the calibration
    /// timeout and with `CalibrationIncomplete` when a reported triad cannot
    /// define a slope; both fault the instrument.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn calibrate(&mut self) -> Result<()> {
        self.idle_link("calibrate").await?;
        self.state.transition(EngineState::Calibrating);
        let result = self.read_calibration().await;
        let result = self.settle(result);
        if result.is_ok() {
            self.state.transition(EngineState::Idle);
            info!(serial = self.serial, "Calibration complete");
        }
        result
    }

    async fn read_calibration(&mut self) -> Result<()> {
        let settings = self.config.engine.clone();
        let references = self.config.reference_currents;
        let store = self.store.clone();
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| PowerMonitorError::transport("transport not open"))?;

        link.send(&Command::ReadCalibration).await?;
        let deadline = Instant::now() + settings.calibration_timeout;
        let mut fresh = CalibrationSet::new();

        while !fresh.is_complete() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                let missing: Vec<String> = fresh
                    .missing()
                    .iter()
                    .map(|(c, g, o)| format!("{c}/{g}/{o}"))
                    .collect();
                return Err(PowerMonitorError::calibration_timeout(format!(
                    "no value for {} after {:?}",
                    missing.join(", "),
                    settings.calibration_timeout
                )));
            }
            if link.fill(settings.read_timeout.min(remaining)).await? == 0 {
                continue;
            }
            while let Some(frame) = link.next_valid_frame()? {
                match frame {
                    Frame::Calibration {
                        channel,
                        granularity,
                        origin,
                        value,
                    } => {
                        fresh.set(channel, granularity, origin, value);
                        store.update(channel, granularity, origin, value);
                    }
                    Frame::Status(status) if status.is_fault() => {
                        return Err(PowerMonitorError::DeviceFault { code: status.code });
                    }
                    other => trace!(?other, "Ignoring frame while calibrating"),
                }
            }
        }

        for channel in Channel::ALL {
            for granularity in Granularity::ALL {
                let triad = store.get(channel, granularity)?;
                let reference_amps = references.for_granularity(granularity);
                triad.current_amps(triad.zero, reference_amps, channel, granularity)?;
            }
        }
        Ok(())
    }

    /// Send a command and wait for the frame `pick` accepts.
    ///
    /// Calibration frames that arrive meanwhile still update the store.
    async fn request<T>(
        &mut self,
        operation: &'static str,
        command: Command,
        mut pick: impl FnMut(&Frame) -> Option<T> + Send,
    ) -> Result<T> {
        let timeout = self.config.engine.request_timeout;
        let read_timeout = self.config.engine.read_timeout;
        let store = self.store.clone();
        let link = self.idle_link(operation).await?;

        let exchange = async {
            link.send(&command).await?;
            let deadline = Instant::now() + timeout;
            loop {
                let remaining = deadline.saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    return Err(PowerMonitorError::Timeout {
                        what: format!("answer to {command:?}"),
                    });
                }
                if link.fill(read_timeout.min(remaining)).await? == 0 {
                    continue;
                }
                while let Some(frame) = link.next_valid_frame()? {
                    if let Some(answer) = pick(&frame) {
                        return Ok(answer);
                    }
                    match frame {
                        Frame::Calibration {
                            channel,
                            granularity,
                            origin,
                            value,
                        } => store.update(channel, granularity, origin, value),
                        Frame::Status(status) if status.is_fault() => {
                            return Err(PowerMonitorError::DeviceFault { code: status.code });
                        }
                        other => trace!(?other, "Ignoring unrelated frame"),
                    }
                }
            }
        };
        let result = exchange.await;
        self.settle(result)
    }

    /// Send a command that has no answer.
    async fn command(&mut self, operation: &'static str, command: Command) -> Result<()> {
        let link = self.idle_link(operation).await?;
        let result = link.send(&command).await;
        self.settle(result)
    }

    /// Read an auxiliary register.
    ///
    /// `Voltage` is returned in volts; `GainControl` as the raw register
    /// value.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn read_reading(&mut self, kind: Reading) -> Result<f64> {
        let lsb = self.family.voltage_lsb_volts();
        let raw = self
            .request("read reading", Command::ReadReading(kind), |frame| match frame {
                Frame::Reading { kind: k, raw } if *k == kind => Some(*raw),
                _ => None,
            })
            .await?;
        Ok(match kind {
            Reading::Voltage => f64::from(raw) * lsb,
            Reading::GainControl => f64::from(raw),
        })
    }

    /// Query the device status.
    ///
    /// A status reporting a device error is returned, not raised; the caller
    /// decides what to do with it.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn status(&mut self) -> Result<DeviceStatus> {
        let status = self
            .request("query status", Command::GetStatus, |frame| match frame {
                Frame::Status(status) => Some(*status),
                _ => None,
            })
            .await?;
        if status.serial != self.serial {
            warn!(
                expected = self.serial,
                reported = status.serial,
                "Device reports a different serial number"
            );
        }
        Ok(status)
    }

    /// Switch the main output on or off.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn set_power(&mut self, on: bool) -> Result<()> {
        self.command("set power", Command::SetPower(on)).await
    }

    /// Set the main output voltage. `0.0` turns the output off.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn set_voltage(&mut self, volts: f64) -> Result<()> {
        let (min, max) = self.family.output_voltage_range();
        if !(volts == 0.0 || (min..=max).contains(&volts)) {
            return Err(PowerMonitorError::configuration(format!(
                "{} output voltage must be 0 or within {min}..={max} V, got {volts}",
                self.family
            )));
        }
        let millivolts = (volts * 1000.0).round() as u16;
        self.command("set voltage", Command::SetVoltage { millivolts })
            .await
    }

    /// Set the USB passthrough mode.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn set_usb_passthrough(&mut self, mode: UsbPassthrough) -> Result<()> {
        self.command("set USB passthrough", Command::SetUsbPassthrough(mode))
            .await
    }

    /// Start a sampling session at `rate_hz` samples per second.
    ///
    /// With an incomplete calibration store the session first requests
    /// calibration and holds early samples until it arrives.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn start_sampling(&mut self, rate_hz: u16) -> Result<SamplingHandle> {
        if rate_hz == 0 || rate_hz > MAX_SAMPLE_RATE_HZ {
            return Err(PowerMonitorError::configuration(format!(
                "sample rate must be within 1..={MAX_SAMPLE_RATE_HZ} Hz, got {rate_hz}"
            )));
        }
        self.idle_link("start sampling").await?;
        let link = self
            .link
            .take()
            .ok_or_else(|| PowerMonitorError::transport("transport not open"))?;

        self.next_session_id += 1;
        let plan = SessionPlan {
            serial: self.serial,
            rate_hz,
            settings: self.config.engine.clone(),
            reference: self.config.reference_currents,
            voltage_lsb: self.family.voltage_lsb_volts(),
        };
        let (running, handle) = spawn_session(
            self.next_session_id,
            link,
            self.store.clone(),
            self.state.clone(),
            plan,
        );
        self.session = Some(running);
        Ok(handle)
    }

    /// Start a sampling session at the configured `engine.default_rate_hz`.
    pub async fn start_sampling_default(&mut self) -> Result<SamplingHandle> {
        let rate_hz = self.config.engine.default_rate_hz;
        self.start_sampling(rate_hz).await
    }

    /// Stop the session `handle` belongs to and collect its report.
    ///
    /// Samples produced but not yet read from the handle are returned in
    /// [`SamplingReport::remaining`]. A session that faulted reports the
    /// fault; the instrument then stays `Faulted` until `reset()`.
    #[instrument(skip(self, handle), fields(serial = self.serial), err)]
    pub async fn stop_sampling(&mut self, handle: SamplingHandle) -> Result<SamplingReport> {
        match &self.session {
            Some(session) if session.id == handle.session_id() => {}
            _ => return Err(self.invalid("stop sampling")),
        }
        handle.request_stop();
        let stats = self.end_session().await?;

        let mut remaining = Vec::new();
        let mut fault = None;
        for item in handle.into_remaining() {
            match item {
                Ok(sample) => remaining.push(sample),
                Err(err) => fault = Some(err),
            }
        }
        let fault = fault.or_else(|| self.state.fault_reason());

        Ok(SamplingReport {
            stats,
            remaining,
            fault,
        })
    }

    /// End a session whose handle was dropped without `stop_sampling`.
    async fn reclaim_abandoned(&mut self) -> Result<()> {
        if !self
            .session
            .as_ref()
            .is_some_and(RunningSession::is_abandoned)
        {
            return Ok(());
        }
        let stats = self.end_session().await?;
        debug!(
            serial = self.serial,
            samples = stats.samples_emitted,
            "Reclaimed link from abandoned sampling session"
        );
        Ok(())
    }

    /// Stop a running session, if any, and take the link back.
    async fn end_session(&mut self) -> Result<SamplingStats> {
        let Some(session) = self.session.take() else {
            return Ok(SamplingStats::default());
        };
        match session.join().await {
            Ok(outcome) => {
                self.link = Some(outcome.link);
                Ok(outcome.stats)
            }
            Err(err) => {
                self.state.fault(err.clone());
                Err(err)
            }
        }
    }

    /// Close and reopen the transport and forget decoder state and
    /// calibration. The only way out of `Faulted`.
    #[instrument(skip(self), fields(serial = self.serial), err)]
    pub async fn reset(&mut self) -> Result<()> {
        if let Err(err) = self.end_session().await {
            debug!(error = %err, "Sampling task ended abnormally during reset");
        }
        if let Some(mut link) = self.link.take() {
            if let Err(err) = link.close().await {
                debug!(error = %err, "Closing transport during reset failed");
            }
        }
        self.store.clear();
        self.state.clear();
        info!(serial = self.serial, "Reset power monitor");

        let reopened = self.open().await;
        self.settle(reopened)
    }

    /// Stop any session and close the transport. Closing an instrument that
    /// is closed or was never opened does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let ended = self.end_session().await;
        let closed = match self.link.take() {
            Some(mut link) => {
                info!(serial = self.serial, family = %self.family, "Closing power monitor");
                link.close().await
            }
            None => Ok(()),
        };
        ended.and(closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::Triad;
    use crate::transport::mock::{self, MockDevice};
    use crate::transport::DynTransport;
    use crate::types::Origin;
    use futures::future::BoxFuture;
    use parking_lot::Mutex;
    use tracing_test::traced_test;

    /// Factory that hands out one pre-made mock transport.
    fn single_mock(family: HardwareFamily) -> (Arc<dyn TransportFactory>, MockDevice) {
        let (transport, device) = mock::transport("mock");
        let slot = Arc::new(Mutex::new(Some(transport)));
        let factory = move |f: HardwareFamily, _serial: u32| -> BoxFuture<'static, Result<DynTransport>> {
            let taken = slot.lock().take();
            Box::pin(async move {
                assert_eq!(f, family);
                match taken {
                    Some(transport) => Ok(Box::new(transport) as DynTransport),
                    None => Err(PowerMonitorError::transport("already connected")),
                }
            })
        };
        (Arc::new(factory), device)
    }

    fn config() -> InstrumentConfig {
        let mut config = InstrumentConfig::for_family(HardwareFamily::Lvpm);
        config.drain_on_open = Duration::ZERO;
        config.engine.request_timeout = Duration::from_millis(200);
        config.engine.calibration_timeout = Duration::from_millis(200);
        config.engine.read_timeout = Duration::from_millis(10);
        config
    }

    fn lvpm() -> (Instrument, MockDevice) {
        let (factory, device) = single_mock(HardwareFamily::Lvpm);
        (
            Instrument::new(HardwareFamily::Lvpm, 10, factory, config()),
            device,
        )
    }

    #[tokio::test]
    async fn creation_does_not_open() {
        let (instrument, device) = lvpm();
        assert!(!instrument.is_open());
        assert_eq!(instrument.state(), EngineState::Idle);
        assert_eq!(device.shutdown_count(), 0);
    }

    #[tokio::test]
    async fn reading_voltage_survives_split_frames() {
        let (mut instrument, mut device) = lvpm();
        let codec = crate::protocol::FrameCodec::new(HardwareFamily::Lvpm);
        let request = codec.encode_command(&Command::ReadReading(Reading::Voltage));
        let answer = codec
            .encode_frame(&Frame::Reading {
                kind: Reading::Voltage,
                raw: 32_000,
            })
            .unwrap();

        let device_task = tokio::spawn(async move {
            device.expect_write(&request).await;
            device.send_chunked(&answer, 1).unwrap();
            device
        });

        let volts = instrument.read_reading(Reading::Voltage).await.unwrap();
        assert!((volts - 4.0).abs() < 1e-9);
        assert!(instrument.is_open());
        device_task.await.unwrap();
    }

    #[tokio::test]
    async fn unanswered_request_times_out_without_faulting() {
        let (mut instrument, _device) = lvpm();
        let err = instrument.status().await.unwrap_err();
        assert!(matches!(err, PowerMonitorError::Timeout { .. }));
        assert_eq!(instrument.state(), EngineState::Idle);
    }

    #[tokio::test]
    async fn calibrate_times_out_and_faults() {
        let (mut instrument, device) = lvpm();
        let codec = crate::protocol::FrameCodec::new(HardwareFamily::Lvpm);
        // Only one origin ever arrives.
        device
            .send(
                &codec
                    .encode_frame(&Frame::Calibration {
                        channel: Channel::Main,
                        granularity: Granularity::Coarse,
                        origin: Origin::Zero,
                        value: 0,
                    })
                    .unwrap(),
            )
            .unwrap();

        let err = instrument.calibrate().await.unwrap_err();
        assert!(matches!(err, PowerMonitorError::CalibrationTimeout { .. }));
        assert_eq!(instrument.state(), EngineState::Faulted);

        let err = instrument.set_power(true).await.unwrap_err();
        assert!(matches!(
            err,
            PowerMonitorError::InvalidState {
                state: EngineState::Faulted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn degenerate_calibration_is_rejected() {
        let (mut instrument, device) = lvpm();
        let codec = crate::protocol::FrameCodec::new(HardwareFamily::Lvpm);
        let mut bytes = Vec::new();
        for (channel, granularity, origin, value) in
            uniform_slots(Triad::new(100, 100, 100))
        {
            bytes.extend(
                codec
                    .encode_frame(&Frame::Calibration {
                        channel,
                        granularity,
                        origin,
                        value,
                    })
                    .unwrap(),
            );
        }
        device.send(&bytes).unwrap();

        let err = instrument.calibrate().await.unwrap_err();
        assert!(matches!(err, PowerMonitorError::CalibrationIncomplete { .. }));
        assert_eq!(instrument.state(), EngineState::Faulted);
        assert!(instrument.fault().is_some());
    }

    #[tokio::test]
    async fn voltage_range_is_checked_per_family() {
        let (mut instrument, mut device) = lvpm();
        let err = instrument.set_voltage(5.0).await.unwrap_err();
        assert!(matches!(err, PowerMonitorError::Configuration { .. }));
        assert_eq!(instrument.state(), EngineState::Idle);

        let codec = crate::protocol::FrameCodec::new(HardwareFamily::Lvpm);
        instrument.set_voltage(4.2).await.unwrap();
        device
            .expect_write(&codec.encode_command(&Command::SetVoltage { millivolts: 4200 }))
            .await;
        instrument.set_voltage(0.0).await.unwrap();
        device
            .expect_write(&codec.encode_command(&Command::SetVoltage { millivolts: 0 }))
            .await;
    }

    #[tokio::test]
    async fn rate_is_validated_before_opening() {
        let (mut instrument, _device) = lvpm();
        assert!(instrument.start_sampling(0).await.is_err());
        assert!(instrument.start_sampling(MAX_SAMPLE_RATE_HZ + 1).await.is_err());
        assert!(!instrument.is_open());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (mut instrument, device) = lvpm();
        instrument.close().await.unwrap();
        assert_eq!(device.shutdown_count(), 0);

        instrument.set_power(true).await.unwrap();
        instrument.close().await.unwrap();
        instrument.close().await.unwrap();
        assert_eq!(device.shutdown_count(), 1);
        assert!(!instrument.is_open());
    }

    #[tokio::test]
    #[traced_test]
    async fn lifecycle_is_logged() {
        let (mut instrument, _device) = lvpm();
        instrument.set_usb_passthrough(UsbPassthrough::Auto).await.unwrap();
        instrument.close().await.unwrap();
        assert!(logs_contain("Opened power monitor"));
        assert!(logs_contain("Closing power monitor"));
    }

    fn uniform_slots(triad: Triad) -> Vec<(Channel, Granularity, Origin, i32)> {
        let set = CalibrationSet::uniform(triad);
        let mut slots = Vec::new();
        for channel in Channel::ALL {
            for granularity in Granularity::ALL {
                for origin in Origin::ALL {
                    if let Some(value) = set.value(channel, granularity, origin) {
                        slots.push((channel, granularity, origin, value));
                    }
                }
            }
        }
        slots
    }
}
