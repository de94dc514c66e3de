//! Simulated power monitors for development and tests without hardware.
//!
//! A [`SimulatedMonitor`] speaks the real wire protocol of its family over an
//! in-memory duplex stream: it parses the host's commands with the same
//! [`FrameCodec`] and answers with encoded frames, so everything above the
//! transport runs exactly as it would against a device.
//!
//! Beyond a healthy device it can misbehave on purpose: corrupt every n-th
//! data frame, withhold or delay calibration origins, report a device fault
//! or go silent after a number of samples.
//!
//! # Example
//!
//! ```rust,ignore
//! use monsoon_daq::simulator::{SimulatorConfig, SimulatorFactory};
//!
//! let factory = SimulatorFactory::new()
//!     .with_device(SimulatorConfig::new(HardwareFamily::Lvpm, 12345).with_current(Channel::Main, 0.25))
//!     .with_device(SimulatorConfig::new(HardwareFamily::Hvpm, 23456).corrupt_every(50));
//! let selector = DeviceSelector::new(Arc::new(factory));
//! ```

use crate::calibration::{CalibrationSet, Triad};
use crate::error::{PowerMonitorError, Result};
use crate::protocol::{Command, Frame, FrameCodec};
use crate::transport::{DynTransport, StreamTransport, TransportFactory};
use crate::types::{
    Channel, DeviceStatus, Granularity, HardwareFamily, Origin, RawSample, Reading, UsbPassthrough,
};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

/// Buffer size of each direction of the in-memory link.
const LINK_CAPACITY: usize = 64 * 1024;

/// Shortest interval between bursts of data frames.
const MIN_TICK: Duration = Duration::from_millis(1);

// =============================================================================
// Configuration
// =============================================================================

/// Behavior of one simulated monitor.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Hardware family, which selects the framing.
    pub family: HardwareFamily,
    /// Serial number reported in status frames.
    pub serial: u32,
    /// Factory calibration the device reports.
    pub calibration: CalibrationSet,
    /// Simulated load per channel; `None` disables the channel.
    pub loads: [Option<Waveform>; 3],
    /// Value reported for [`Reading::GainControl`].
    pub gain_register: i32,
    /// Output voltage at power-up, in millivolts.
    pub output_millivolts: u16,
    /// Firmware version reported in status frames.
    pub firmware_version: u8,
    /// Deliberate misbehavior.
    pub faults: FaultInjection,
}

/// Deliberate misbehavior of a simulated monitor.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultInjection {
    /// Corrupt the checksum of every n-th data frame.
    pub corrupt_every: Option<u64>,
    /// Calibration origins the device never reports.
    pub withheld: Vec<(Channel, Granularity, Origin)>,
    /// Delay between `ReadCalibration` and the calibration frames.
    pub calibration_delay: Duration,
    /// After this many data frames, report this status code and stop
    /// streaming.
    pub fault_after: Option<(u64, u8)>,
    /// After this many data frames, stop sending anything.
    pub silent_after: Option<u64>,
}

impl SimulatorConfig {
    /// A healthy device with plausible factory calibration and a 250 mA load
    /// on the main channel.
    #[must_use]
    pub fn new(family: HardwareFamily, serial: u32) -> Self {
        Self {
            family,
            serial,
            calibration: default_calibration(),
            loads: [Some(Waveform::Constant(0.25)), None, None],
            gain_register: 0x1F,
            output_millivolts: match family {
                HardwareFamily::Lvpm => 4000,
                HardwareFamily::Hvpm => 5000,
            },
            firmware_version: 32,
            faults: FaultInjection::default(),
        }
    }

    /// Put a constant load on a channel and enable it.
    #[must_use]
    pub fn with_current(self, channel: Channel, amps: f64) -> Self {
        self.with_waveform(channel, Waveform::Constant(amps))
    }

    /// Put a time-varying load on a channel and enable it.
    #[must_use]
    pub fn with_waveform(mut self, channel: Channel, waveform: Waveform) -> Self {
        self.loads[channel.index()] = Some(waveform);
        self
    }

    /// Enable only the given channels, keeping their loads.
    #[must_use]
    pub fn with_channels(mut self, channels: &[Channel]) -> Self {
        for channel in Channel::ALL {
            let slot = &mut self.loads[channel.index()];
            if channels.contains(&channel) {
                slot.get_or_insert(Waveform::Constant(0.0));
            } else {
                *slot = None;
            }
        }
        self
    }

    /// Replace the reported calibration.
    #[must_use]
    pub fn with_calibration(mut self, calibration: CalibrationSet) -> Self {
        self.calibration = calibration;
        self
    }

    /// Corrupt every n-th data frame.
    #[must_use]
    pub fn corrupt_every(mut self, n: u64) -> Self {
        self.faults.corrupt_every = Some(n.max(1));
        self
    }

    /// Never report one calibration origin.
    #[must_use]
    pub fn withhold(mut self, channel: Channel, granularity: Granularity, origin: Origin) -> Self {
        self.faults.withheld.push((channel, granularity, origin));
        self
    }

    /// Answer `ReadCalibration` only after `delay`.
    #[must_use]
    pub fn calibration_delay(mut self, delay: Duration) -> Self {
        self.faults.calibration_delay = delay;
        self
    }

    /// Report status `code` after `samples` data frames.
    #[must_use]
    pub fn fault_after(mut self, samples: u64, code: u8) -> Self {
        self.faults.fault_after = Some((samples, code));
        self
    }

    /// Go silent after `samples` data frames.
    #[must_use]
    pub fn silent_after(mut self, samples: u64) -> Self {
        self.faults.silent_after = Some(samples);
        self
    }

    /// Raw ADC sample for `amps` on `channel`.
    ///
    /// Uses the fine range while the current fits in it, the coarse range
    /// otherwise. `None` when the channel has no usable calibration.
    #[must_use]
    pub fn raw_sample(&self, channel: Channel, amps: f64, sequence: u32) -> Option<RawSample> {
        let references = self.family.reference_currents();
        let encode = |granularity: Granularity| {
            let triad = self.calibration.triad(channel, granularity)?;
            let counts_per_amp = triad.counts_per_amp(references.for_granularity(granularity))?;
            let full_scale = (f64::from(triad.scale) - f64::from(triad.zero)) / counts_per_amp;
            Some((
                (f64::from(triad.zero) + amps * counts_per_amp).round() as i32,
                full_scale,
            ))
        };
        let (granularity, raw) = match encode(Granularity::Fine) {
            Some((raw, full_scale)) if amps.abs() <= full_scale => (Granularity::Fine, raw),
            _ => (Granularity::Coarse, encode(Granularity::Coarse)?.0),
        };
        Some(RawSample {
            channel,
            granularity,
            raw,
            sequence,
            voltage_raw: None,
        })
    }
}

/// Load current of a simulated channel over time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Waveform {
    /// Fixed current in amps.
    Constant(f64),
    /// `mean + amplitude * sin(2πt / period)` in amps.
    Sine {
        /// Mean current.
        mean_amps: f64,
        /// Peak deviation from the mean.
        amplitude_amps: f64,
        /// Period of one cycle.
        period: Duration,
    },
    /// Alternates between two currents, starting with `low_amps`.
    Square {
        /// Current during the first half period.
        low_amps: f64,
        /// Current during the second half period.
        high_amps: f64,
        /// Period of one cycle.
        period: Duration,
    },
}

impl Waveform {
    /// Current at `t` seconds after sampling started.
    #[must_use]
    pub fn amps_at(&self, t: f64) -> f64 {
        match *self {
            Waveform::Constant(amps) => amps,
            Waveform::Sine {
                mean_amps,
                amplitude_amps,
                period,
            } => {
                let period = period.as_secs_f64();
                if period <= 0.0 {
                    return mean_amps;
                }
                mean_amps + amplitude_amps * (std::f64::consts::TAU * t / period).sin()
            }
            Waveform::Square {
                low_amps,
                high_amps,
                period,
            } => {
                let period = period.as_secs_f64();
                if period <= 0.0 || (t % period) < period / 2.0 {
                    low_amps
                } else {
                    high_amps
                }
            }
        }
    }
}

/// Calibration used by simulated devices unless replaced: 1000 counts/A in
/// the coarse range and 100 000 counts/A in the fine range at the LVPM
/// reference currents.
#[must_use]
pub fn default_calibration() -> CalibrationSet {
    let mut set = CalibrationSet::new();
    for channel in Channel::ALL {
        set.set_triad(channel, Granularity::Coarse, Triad::new(100, 1100, 3100));
        set.set_triad(channel, Granularity::Fine, Triad::new(50, 1050, 4050));
    }
    set
}

// =============================================================================
// Shared device state
// =============================================================================

#[derive(Debug)]
struct DeviceState {
    powered: bool,
    output_millivolts: u16,
    usb_passthrough: UsbPassthrough,
    loads: [Option<Waveform>; 3],
    streaming: bool,
    commands: Vec<Command>,
    data_frames: u64,
}

/// View into a running simulated monitor.
///
/// Clones share the same device.
#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    serial: u32,
    state: Arc<Mutex<DeviceState>>,
}

impl SimulatorHandle {
    fn new(config: &SimulatorConfig) -> Self {
        Self {
            serial: config.serial,
            state: Arc::new(Mutex::new(DeviceState {
                powered: true,
                output_millivolts: config.output_millivolts,
                usb_passthrough: UsbPassthrough::Auto,
                loads: config.loads,
                streaming: false,
                commands: Vec::new(),
                data_frames: 0,
            })),
        }
    }

    /// Serial number of the device.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    /// Whether the main output is on.
    #[must_use]
    pub fn powered(&self) -> bool {
        self.state.lock().powered
    }

    /// Main output voltage in millivolts.
    #[must_use]
    pub fn output_millivolts(&self) -> u16 {
        self.state.lock().output_millivolts
    }

    /// Current USB passthrough mode.
    #[must_use]
    pub fn usb_passthrough(&self) -> UsbPassthrough {
        self.state.lock().usb_passthrough
    }

    /// Whether the device is streaming data frames.
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.state.lock().streaming
    }

    /// Every command received so far, in order.
    #[must_use]
    pub fn commands(&self) -> Vec<Command> {
        self.state.lock().commands.clone()
    }

    /// Number of data frames sent so far.
    #[must_use]
    pub fn data_frames(&self) -> u64 {
        self.state.lock().data_frames
    }

    /// Change the load on a channel while the device runs; `None` disables
    /// the channel.
    pub fn set_load(&self, channel: Channel, load: Option<Waveform>) {
        self.state.lock().loads[channel.index()] = load;
    }
}

// =============================================================================
// Device task
// =============================================================================

/// A simulated monitor bound to one link.
#[derive(Debug)]
pub struct SimulatedMonitor {
    config: SimulatorConfig,
    handle: SimulatorHandle,
    codec: FrameCodec,
    rate_hz: u16,
    sequence: u32,
    calibration_due: Option<Instant>,
    silent: bool,
    sent: u64,
    ticks: u64,
    fault_code: Option<u8>,
    /// Replies waiting to be written
    outbox: Vec<u8>,
}

impl SimulatedMonitor {
    /// Create a monitor; nothing runs until [`SimulatedMonitor::spawn`].
    #[must_use]
    pub fn new(config: SimulatorConfig) -> Self {
        let handle = SimulatorHandle::new(&config);
        Self {
            codec: FrameCodec::new(config.family),
            config,
            handle,
            rate_hz: 0,
            sequence: 0,
            calibration_due: None,
            silent: false,
            sent: 0,
            ticks: 0,
            fault_code: None,
            outbox: Vec::new(),
        }
    }

    /// Handle to the device state.
    #[must_use]
    pub fn handle(&self) -> SimulatorHandle {
        self.handle.clone()
    }

    /// Run the device on a background task and return the host end of its
    /// link. The task ends when the host closes the link.
    #[must_use]
    pub fn spawn(self) -> (StreamTransport<DuplexStream>, SimulatorHandle) {
        let (host, device) = tokio::io::duplex(LINK_CAPACITY);
        let label = format!("simulated {} {}", self.config.family, self.config.serial);
        let handle = self.handle();
        tokio::spawn(self.serve(device));
        (StreamTransport::new(host, label), handle)
    }

    async fn serve(mut self, mut io: DuplexStream) {
        let serial = self.config.serial;
        debug!(serial, family = %self.config.family, "Simulated monitor running");
        let mut buf = vec![0u8; 1024];
        let mut ticker = interval(MIN_TICK);

        loop {
            let streaming = self.handle.is_streaming() && !self.silent;
            let calibration_due = self.calibration_due;
            tokio::select! {
                read = io.read(&mut buf) => {
                    let n = match read {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    self.codec.push(&buf[..n]);
                    match self.answer_commands() {
                        Ok(Some(start)) => {
                            ticker = interval(tick_period(start));
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(serial, error = %err, "Simulated monitor failed");
                            break;
                        }
                    }
                }
                _ = ticker.tick(), if streaming => {
                    match self.data_burst() {
                        Ok(bytes) => {
                            if io.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(serial, error = %err, "Simulated monitor failed");
                            break;
                        }
                    }
                }
                () = sleep_until(calibration_due.unwrap_or_else(Instant::now)), if calibration_due.is_some() => {
                    self.calibration_due = None;
                    match self.calibration_frames() {
                        Ok(bytes) => {
                            if io.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => {
                            warn!(serial, error = %err, "Simulated monitor failed");
                            break;
                        }
                    }
                }
            }

            if !self.outbox.is_empty() {
                let bytes = std::mem::take(&mut self.outbox);
                if io.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        }
        debug!(serial, "Simulated monitor stopped");
    }
}

/// Interval between bursts for a sample rate.
fn tick_period(rate_hz: u16) -> Duration {
    Duration::from_secs_f64(1.0 / f64::from(rate_hz.max(1))).max(MIN_TICK)
}

impl SimulatedMonitor {
    /// Handle every complete command in the decoder. Returns the new sample
    /// rate when sampling (re)started.
    fn answer_commands(&mut self) -> Result<Option<u16>> {
        let mut started = None;
        loop {
            let command = match self.codec.next_command() {
                Ok(Some(Ok(command))) => command,
                Ok(Some(Err(reason))) => {
                    warn!(serial = self.config.serial, %reason, "Simulated monitor ignored malformed command");
                    continue;
                }
                Ok(None) => return Ok(started),
                Err(err) => {
                    warn!(serial = self.config.serial, error = %err, "Simulated monitor dropped corrupt command");
                    continue;
                }
            };
            trace!(serial = self.config.serial, ?command, "Simulated monitor received command");
            self.handle.state.lock().commands.push(command);
            if let Some(rate_hz) = self.execute(command)? {
                started = Some(rate_hz);
            }
        }
    }

    fn execute(&mut self, command: Command) -> Result<Option<u16>> {
        let device = Arc::clone(&self.handle.state);
        let mut state = device.lock();
        match command {
            Command::StartSampling { rate_hz } => {
                self.rate_hz = rate_hz;
                self.ticks = 0;
                state.streaming = true;
                return Ok(Some(rate_hz));
            }
            Command::StopSampling => state.streaming = false,
            Command::ReadCalibration => {
                self.calibration_due = Some(Instant::now() + self.config.faults.calibration_delay);
            }
            Command::ReadReading(kind) => {
                let raw = match kind {
                    Reading::Voltage => {
                        (f64::from(state.output_millivolts) / 1000.0
                            / self.config.family.voltage_lsb_volts())
                        .round() as i32
                    }
                    Reading::GainControl => self.config.gain_register,
                };
                drop(state);
                self.queue(&Frame::Reading { kind, raw })?;
            }
            Command::SetPower(on) => state.powered = on,
            Command::GetStatus => {
                drop(state);
                let status = self.status();
                self.queue(&Frame::Status(status))?;
            }
            Command::SetVoltage { millivolts } => state.output_millivolts = millivolts,
            Command::SetUsbPassthrough(mode) => state.usb_passthrough = mode,
        }
        Ok(None)
    }
}

impl SimulatedMonitor {
    fn queue(&mut self, frame: &Frame) -> Result<()> {
        if !self.silent {
            let bytes = self.codec.encode_frame(frame)?;
            self.outbox.extend_from_slice(&bytes);
        }
        Ok(())
    }

    /// Data frames for one tick, with any injected faults applied.
    fn data_burst(&mut self) -> Result<Vec<u8>> {
        let period = tick_period(self.rate_hz);
        let per_tick = (f64::from(self.rate_hz) * period.as_secs_f64()).round().max(1.0) as u64;
        let (loads, powered, output_millivolts) = {
            let state = self.handle.state.lock();
            (state.loads, state.powered, state.output_millivolts)
        };
        let voltage_raw = (f64::from(output_millivolts) / 1000.0
            / self.config.family.voltage_lsb_volts())
        .round() as u16;

        let faults = self.config.faults.clone();
        let mut bytes = Vec::new();
        'burst: for _ in 0..per_tick {
            self.ticks += 1;
            for channel in Channel::ALL {
                let Some(load) = loads[channel.index()] else {
                    continue;
                };
                // Main output off means no load current
                let amps = if channel == Channel::Main && !powered {
                    0.0
                } else {
                    load.amps_at(self.ticks as f64 / f64::from(self.rate_hz.max(1)))
                };
                if faults.silent_after.is_some_and(|limit| self.sent >= limit) {
                    info!(serial = self.config.serial, sent = self.sent, "Simulated monitor going silent");
                    self.silent = true;
                    break 'burst;
                }
                if let Some((after, code)) = faults.fault_after {
                    if self.sent >= after {
                        info!(serial = self.config.serial, code, "Simulated monitor reporting fault");
                        self.fault_code = Some(code);
                        self.handle.state.lock().streaming = false;
                        bytes.extend(self.codec.encode_frame(&Frame::Status(self.status()))?);
                        break 'burst;
                    }
                }
                let Some(mut sample) = self.config.raw_sample(channel, amps, self.sequence) else {
                    continue;
                };
                if channel == Channel::Main {
                    sample.voltage_raw = Some(voltage_raw);
                }
                self.sequence = self.sequence.wrapping_add(1);
                self.sent += 1;

                let mut frame = self.codec.encode_frame(&Frame::Data(sample))?;
                if faults.corrupt_every.is_some_and(|n| self.sent % n == 0) {
                    if let Some(last) = frame.last_mut() {
                        *last ^= 0xFF;
                    }
                }
                bytes.extend(frame);
            }
        }
        self.handle.state.lock().data_frames = self.sent;
        Ok(bytes)
    }

    /// One calibration frame per reported origin.
    fn calibration_frames(&mut self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        if self.silent {
            return Ok(bytes);
        }
        for channel in Channel::ALL {
            for granularity in Granularity::ALL {
                for origin in Origin::ALL {
                    if self.config.faults.withheld.contains(&(channel, granularity, origin)) {
                        continue;
                    }
                    let Some(value) = self.config.calibration.value(channel, granularity, origin)
                    else {
                        continue;
                    };
                    bytes.extend(self.codec.encode_frame(&Frame::Calibration {
                        channel,
                        granularity,
                        origin,
                        value,
                    })?);
                }
            }
        }
        Ok(bytes)
    }

    fn status(&self) -> DeviceStatus {
        DeviceStatus {
            code: self.fault_code.unwrap_or(0),
            firmware_version: self.config.firmware_version,
            serial: self.config.serial,
        }
    }
}

// =============================================================================
// SimulatorFactory - TransportFactory implementation
// =============================================================================

/// Connects instruments to simulated monitors by serial number.
///
/// Every connect starts a fresh device from its configuration, the way a
/// power-cycled monitor would come up.
#[derive(Debug, Default)]
pub struct SimulatorFactory {
    devices: Mutex<HashMap<u32, SimulatorConfig>>,
    handles: Mutex<HashMap<u32, SimulatorHandle>>,
    connects: Mutex<HashMap<u32, usize>>,
}

impl SimulatorFactory {
    /// Factory without devices.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a device.
    #[must_use]
    pub fn with_device(self, config: SimulatorConfig) -> Self {
        self.add_device(config);
        self
    }

    /// Add or replace a device.
    pub fn add_device(&self, config: SimulatorConfig) {
        self.devices.lock().insert(config.serial, config);
    }

    /// Handle of the most recent connection to `serial`.
    #[must_use]
    pub fn handle(&self, serial: u32) -> Option<SimulatorHandle> {
        self.handles.lock().get(&serial).cloned()
    }

    /// How many times `serial` has been connected.
    #[must_use]
    pub fn connects(&self, serial: u32) -> usize {
        self.connects.lock().get(&serial).copied().unwrap_or(0)
    }
}

impl TransportFactory for SimulatorFactory {
    fn connect(&self, family: HardwareFamily, serial: u32) -> BoxFuture<'static, Result<DynTransport>> {
        let config = self.devices.lock().get(&serial).cloned();
        let Some(config) = config else {
            return Box::pin(async move {
                Err(PowerMonitorError::transport(format!(
                    "no simulated {family} monitor with serial {serial}"
                )))
            });
        };
        if config.family != family {
            warn!(
                serial,
                expected = %family,
                actual = %config.family,
                "Simulated monitor speaks a different framing than requested"
            );
        }

        let monitor = SimulatedMonitor::new(config);
        self.handles.lock().insert(serial, monitor.handle());
        *self.connects.lock().entry(serial).or_insert(0) += 1;
        Box::pin(async move {
            let (transport, _handle) = monitor.spawn();
            Ok(Box::new(transport) as DynTransport)
        })
    }
}
