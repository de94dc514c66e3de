//! Sampling engine: the session state machine and the acquisition task.
//!
//! # State machine
//!
//! ```text
//!          start_sampling / calibrate
//!   Idle ──────────────▶ Calibrating ──all origins──▶ Sampling
//!    ▲                       │                           │
//!    │                       │ timeout                   │ stop
//!    │                       ▼                           ▼
//!    │                    Faulted ◀────── fault ──── Stopping
//!    │                       │                           │
//!    └──────── reset() ──────┘◀──────── drained ─────────┘ (to Idle)
//! ```
//!
//! One tokio task runs each sampling session. Inside the loop the transport
//! read (with `read_timeout`) is the only suspension point; decoded frames
//! are handled synchronously and calibrated samples go out over an unbounded
//! channel, so a slow consumer never stalls acquisition. Cancellation is
//! cooperative: the stop flag is checked between frames.
//!
//! Samples whose (channel, granularity) has no complete triad yet are held in
//! arrival order and released as soon as calibration arrives. The hold queue
//! is bounded; overflowing it faults the session rather than dropping data.

use crate::calibration::{CalibrationStore, Triad};
use crate::config::EngineSettings;
use crate::error::{PowerMonitorError, Result};
use crate::protocol::{Command, Frame, FrameCodec};
use crate::transport::DynTransport;
use crate::types::{CalibratedSample, HardwareFamily, RawSample, ReferenceCurrents};
use futures::Stream;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

/// Corrupt-frame escalation needs at least this many frames in the window.
const MIN_FRAMES_FOR_ESCALATION: usize = 16;

/// Session state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EngineState {
    /// Ready for a command.
    #[default]
    Idle,
    /// Waiting for every calibration origin.
    Calibrating,
    /// Streaming calibrated samples.
    Sampling,
    /// Draining in-flight frames after a stop request.
    Stopping,
    /// Terminal until `reset()`.
    Faulted,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Calibrating => write!(f, "calibrating"),
            Self::Sampling => write!(f, "sampling"),
            Self::Stopping => write!(f, "stopping"),
            Self::Faulted => write!(f, "faulted"),
        }
    }
}

#[derive(Debug, Default)]
struct StateInner {
    state: EngineState,
    fault: Option<PowerMonitorError>,
}

/// State shared between an instrument and its sampling task.
#[derive(Debug, Clone, Default)]
pub(crate) struct SessionState {
    inner: Arc<RwLock<StateInner>>,
}

impl SessionState {
    pub fn get(&self) -> EngineState {
        self.inner.read().state
    }

    pub fn fault_reason(&self) -> Option<PowerMonitorError> {
        self.inner.read().fault.clone()
    }

    /// Move to `to` unless faulted; only [`SessionState::clear`] leaves
    /// `Faulted`.
    pub fn transition(&self, to: EngineState) {
        let mut inner = self.inner.write();
        if inner.state == EngineState::Faulted || inner.state == to {
            return;
        }
        debug!(from = %inner.state, to = %to, "Engine state change");
        inner.state = to;
    }

    /// Enter `Faulted`. The first fault is kept.
    pub fn fault(&self, err: PowerMonitorError) {
        let mut inner = self.inner.write();
        inner.state = EngineState::Faulted;
        if inner.fault.is_none() {
            inner.fault = Some(err);
        }
    }

    pub fn clear(&self) {
        *self.inner.write() = StateInner::default();
    }
}

/// Transport plus decoder of one instrument.
pub(crate) struct Link {
    transport: DynTransport,
    codec: FrameCodec,
    scratch: Vec<u8>,
}

impl Link {
    pub fn new(transport: DynTransport, family: HardwareFamily, read_chunk: usize) -> Self {
        Self {
            transport,
            codec: FrameCodec::new(family),
            scratch: vec![0u8; read_chunk.max(1)],
        }
    }

    pub fn family(&self) -> HardwareFamily {
        self.codec.family()
    }

    pub async fn send(&mut self, command: &Command) -> Result<()> {
        let bytes = self.codec.encode_command(command);
        debug!(family = %self.family(), ?command, len = bytes.len(), "Sending command");
        self.transport.write(&bytes).await
    }

    /// Read once and feed the decoder. `Ok(0)` means nothing arrived.
    pub async fn fill(&mut self, timeout: Duration) -> Result<usize> {
        let n = self.transport.read(&mut self.scratch, timeout).await?;
        if n > 0 {
            self.codec.push(&self.scratch[..n]);
        }
        Ok(n)
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        self.codec.next_frame()
    }

    /// Like [`Link::next_frame`], but corrupt frames are logged and skipped.
    pub fn next_valid_frame(&mut self) -> Result<Option<Frame>> {
        loop {
            match self.codec.next_frame() {
                Err(err) if err.is_recoverable() => {
                    warn!(error = %err, "Dropped corrupt frame");
                }
                other => return other,
            }
        }
    }

    pub fn discarded_bytes(&self) -> u64 {
        self.codec.discarded_bytes()
    }

    pub async fn close(&mut self) -> Result<()> {
        self.codec.reset();
        self.transport.close().await
    }
}

/// Counters of one sampling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SamplingStats {
    /// Frames that passed framing and checksum.
    pub frames_decoded: u64,
    /// Calibrated samples handed to the stream.
    pub samples_emitted: u64,
    /// Calibration origins received mid-session.
    pub calibration_updates: u64,
    /// Status frames received.
    pub status_frames: u64,
    /// Frames dropped as uninterpretable.
    pub malformed_frames: u64,
    /// Frames dropped for a checksum mismatch.
    pub checksum_errors: u64,
    /// Bytes discarded while resynchronizing.
    pub discarded_bytes: u64,
    /// Deepest the uncalibrated hold queue got.
    pub peak_uncalibrated: usize,
}

/// Outcome of a stopped session.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplingReport {
    /// Session counters.
    pub stats: SamplingStats,
    /// Samples that were produced but not yet read from the handle.
    pub remaining: Vec<CalibratedSample>,
    /// The fault that ended the session, if any.
    pub fault: Option<PowerMonitorError>,
}

impl SamplingReport {
    /// Whether the session ended without a fault.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.fault.is_none()
    }
}

/// Sliding window of frame outcomes for checksum escalation.
#[derive(Debug)]
struct DropWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    max_rate: f64,
    corrupt: usize,
}

impl DropWindow {
    fn new(capacity: usize, max_rate: f64) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            max_rate,
            corrupt: 0,
        }
    }

    /// Record one frame; returns the corrupt fraction when it exceeds the
    /// threshold.
    fn record(&mut self, corrupt: bool) -> Option<f64> {
        self.outcomes.push_back(corrupt);
        if corrupt {
            self.corrupt += 1;
        }
        if self.outcomes.len() > self.capacity && self.outcomes.pop_front() == Some(true) {
            self.corrupt -= 1;
        }

        let len = self.outcomes.len();
        if len < MIN_FRAMES_FOR_ESCALATION.min(self.capacity) {
            return None;
        }
        let rate = self.corrupt as f64 / len as f64;
        (rate > self.max_rate).then_some(rate)
    }
}

/// Parameters of one sampling session.
#[derive(Debug, Clone)]
pub(crate) struct SessionPlan {
    pub serial: u32,
    pub rate_hz: u16,
    pub settings: EngineSettings,
    pub reference: ReferenceCurrents,
    pub voltage_lsb: f64,
}

/// What the task hands back when it ends.
pub(crate) struct SessionOutcome {
    pub link: Link,
    pub stats: SamplingStats,
}

/// The instrument's side of a running session.
pub(crate) struct RunningSession {
    pub id: u64,
    stop: Arc<AtomicBool>,
    handle_dropped: Arc<AtomicBool>,
    task: JoinHandle<SessionOutcome>,
}

impl RunningSession {
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Whether the caller dropped the handle without stopping the session.
    pub fn is_abandoned(&self) -> bool {
        self.handle_dropped.load(Ordering::SeqCst)
    }

    /// Stop the task and wait for it to hand the link back.
    pub async fn join(self) -> Result<SessionOutcome> {
        self.request_stop();
        self.task
            .await
            .map_err(|e| PowerMonitorError::transport(format!("sampling task failed: {e}")))
    }
}

/// Caller's side of a running session: a finite, ordered stream of
/// calibrated samples.
///
/// The stream ends after the session stops. A fault arrives as a final
/// `Err` item.
#[derive(Debug)]
pub struct SamplingHandle {
    samples: UnboundedReceiverStream<Result<CalibratedSample>>,
    stop: Arc<AtomicBool>,
    session_id: u64,
    serial: u32,
    _guard: DropGuard,
}

/// Stops the session and marks it abandoned when its handle goes away.
#[derive(Debug)]
struct DropGuard {
    stop: Arc<AtomicBool>,
    dropped: Arc<AtomicBool>,
}

impl Drop for DropGuard {
    fn drop(&mut self) {
        self.dropped.store(true, Ordering::SeqCst);
        self.stop.store(true, Ordering::SeqCst);
    }
}

impl SamplingHandle {
    /// Ask the session to stop without waiting for it.
    ///
    /// The stream keeps yielding the drained tail and then ends.
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }

    /// Serial number of the instrument producing the samples.
    #[must_use]
    pub fn serial(&self) -> u32 {
        self.serial
    }

    pub(crate) fn session_id(&self) -> u64 {
        self.session_id
    }

    /// Everything still queued; only meaningful once the task has ended.
    pub(crate) fn into_remaining(self) -> Vec<Result<CalibratedSample>> {
        let mut rx = self.samples.into_inner();
        rx.close();
        let mut remaining = Vec::new();
        while let Ok(item) = rx.try_recv() {
            remaining.push(item);
        }
        remaining
    }
}

impl Stream for SamplingHandle {
    type Item = Result<CalibratedSample>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.samples).poll_next(cx)
    }
}

/// Start the acquisition task.
pub(crate) fn spawn_session(
    id: u64,
    link: Link,
    store: CalibrationStore,
    state: SessionState,
    plan: SessionPlan,
) -> (RunningSession, SamplingHandle) {
    let (tx, rx) = mpsc::unbounded_channel();
    let stop = Arc::new(AtomicBool::new(false));
    let handle_dropped = Arc::new(AtomicBool::new(false));
    let serial = plan.serial;
    // Visible to the caller as soon as start_sampling returns
    state.transition(if store.is_complete() {
        EngineState::Sampling
    } else {
        EngineState::Calibrating
    });

    let sampler = Sampler {
        pending: VecDeque::new(),
        drops: DropWindow::new(
            plan.settings.checksum_window,
            plan.settings.max_checksum_drop_rate,
        ),
        stats: SamplingStats::default(),
        next_sequence: 0,
        started: Instant::now(),
        stop: Arc::clone(&stop),
        receiver_gone: false,
        link,
        store,
        state,
        plan,
        tx,
    };
    let task = tokio::spawn(sampler.run());

    let running = RunningSession {
        id,
        stop: Arc::clone(&stop),
        handle_dropped: Arc::clone(&handle_dropped),
        task,
    };
    let handle = SamplingHandle {
        samples: UnboundedReceiverStream::new(rx),
        stop: Arc::clone(&stop),
        session_id: id,
        serial,
        _guard: DropGuard {
            stop,
            dropped: handle_dropped,
        },
    };
    (running, handle)
}

struct Sampler {
    link: Link,
    store: CalibrationStore,
    state: SessionState,
    plan: SessionPlan,
    stop: Arc<AtomicBool>,
    tx: UnboundedSender<Result<CalibratedSample>>,
    pending: VecDeque<(RawSample, Duration)>,
    drops: DropWindow,
    stats: SamplingStats,
    next_sequence: u64,
    started: Instant,
    receiver_gone: bool,
}

impl Sampler {
    async fn run(mut self) -> SessionOutcome {
        info!(
            serial = self.plan.serial,
            family = %self.link.family(),
            rate_hz = self.plan.rate_hz,
            "Sampling started"
        );

        match self.acquire().await {
            Ok(()) => self.state.transition(EngineState::Idle),
            Err(err) => self.fail(err).await,
        }

        self.stats.discarded_bytes = self.link.discarded_bytes();
        info!(
            serial = self.plan.serial,
            frames = self.stats.frames_decoded,
            samples = self.stats.samples_emitted,
            checksum_errors = self.stats.checksum_errors,
            malformed = self.stats.malformed_frames,
            peak_uncalibrated = self.stats.peak_uncalibrated,
            "Sampling stopped"
        );
        SessionOutcome {
            link: self.link,
            stats: self.stats,
        }
    }

    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    async fn acquire(&mut self) -> Result<()> {
        let settings = self.plan.settings.clone();
        let mut calibration_deadline = None;

        if self.store.is_complete() {
            self.state.transition(EngineState::Sampling);
        } else {
            info!(
                serial = self.plan.serial,
                missing = self.store.missing().len(),
                "Calibration incomplete, requesting it before sampling"
            );
            self.state.transition(EngineState::Calibrating);
            self.link.send(&Command::ReadCalibration).await?;
            calibration_deadline = Some(Instant::now() + settings.calibration_timeout);
        }

        self.link
            .send(&Command::StartSampling {
                rate_hz: self.plan.rate_hz,
            })
            .await?;
        self.started = Instant::now();
        let mut last_data = Instant::now();

        while !self.stop_requested() {
            if let Some(deadline) = calibration_deadline {
                if self.state.get() != EngineState::Calibrating {
                    calibration_deadline = None;
                } else if Instant::now() >= deadline {
                    return Err(PowerMonitorError::calibration_timeout(format!(
                        "{} origins still missing after {:?}",
                        self.store.missing().len(),
                        settings.calibration_timeout
                    )));
                }
            }

            if self.link.fill(settings.read_timeout).await? == 0 {
                // The calibration deadline governs until every origin is in
                if calibration_deadline.is_some() {
                    continue;
                }
                let silent = last_data.elapsed();
                if silent >= settings.watchdog {
                    return Err(PowerMonitorError::transport(format!(
                        "no data from device for {silent:?}"
                    )));
                }
                continue;
            }
            last_data = Instant::now();
            self.process(true)?;
        }

        self.drain().await
    }

    async fn drain(&mut self) -> Result<()> {
        self.state.transition(EngineState::Stopping);
        self.link.send(&Command::StopSampling).await?;

        let settings = &self.plan.settings;
        let (read_timeout, deadline) = (
            settings.read_timeout,
            Instant::now() + settings.drain_timeout,
        );
        self.process(false)?;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                debug!(serial = self.plan.serial, "Drain budget exhausted");
                break;
            }
            if self.link.fill(read_timeout.min(remaining)).await? == 0 {
                break;
            }
            self.process(false)?;
        }

        if !self.pending.is_empty() {
            return Err(PowerMonitorError::calibration_timeout(format!(
                "stopped with {} samples still waiting for calibration",
                self.pending.len()
            )));
        }
        Ok(())
    }

    async fn fail(&mut self, err: PowerMonitorError) {
        error!(serial = self.plan.serial, error = %err, "Sampling session faulted");
        if !matches!(err, PowerMonitorError::Transport { .. }) {
            if let Err(stop_err) = self.link.send(&Command::StopSampling).await {
                debug!(error = %stop_err, "Could not send StopSampling after fault");
            }
        }
        self.state.fault(err.clone());
        if self.tx.send(Err(err)).is_err() {
            debug!("Sample receiver dropped before the fault was delivered");
        }
    }

    /// Handle every buffered frame. With `respect_stop`, a stop request
    /// leaves the rest in the decoder for the drain.
    fn process(&mut self, respect_stop: bool) -> Result<()> {
        loop {
            if respect_stop && self.stop_requested() {
                return Ok(());
            }
            match self.link.next_frame() {
                Ok(Some(frame)) => {
                    self.stats.frames_decoded += 1;
                    self.drops.record(false);
                    self.handle(frame)?;
                }
                Ok(None) => return Ok(()),
                Err(err) if err.is_recoverable() => {
                    self.stats.checksum_errors += 1;
                    warn!(serial = self.plan.serial, error = %err, "Dropped corrupt frame");
                    if let Some(rate) = self.drops.record(true) {
                        warn!(
                            serial = self.plan.serial,
                            rate,
                            window = self.plan.settings.checksum_window,
                            "Corrupt frame rate over threshold"
                        );
                        return Err(err);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    fn handle(&mut self, frame: Frame) -> Result<()> {
        match frame {
            Frame::Data(sample) => self.accept(sample),
            Frame::Calibration {
                channel,
                granularity,
                origin,
                value,
            } => {
                trace!(%channel, %granularity, %origin, value, "Calibration update");
                self.store.update(channel, granularity, origin, value);
                self.stats.calibration_updates += 1;
                if self.state.get() == EngineState::Calibrating && self.store.is_complete() {
                    info!(serial = self.plan.serial, "Calibration complete, sampling");
                    self.state.transition(EngineState::Sampling);
                }
                self.flush()
            }
            Frame::Status(status) => {
                self.stats.status_frames += 1;
                if status.is_fault() {
                    return Err(PowerMonitorError::DeviceFault { code: status.code });
                }
                Ok(())
            }
            Frame::Reading { kind, raw } => {
                trace!(%kind, raw, "Ignoring reading frame while sampling");
                Ok(())
            }
            Frame::Malformed(reason) => {
                self.stats.malformed_frames += 1;
                warn!(serial = self.plan.serial, %reason, "Dropped malformed frame");
                Ok(())
            }
        }
    }

    fn accept(&mut self, sample: RawSample) -> Result<()> {
        let arrived = self.started.elapsed();
        if !self.pending.is_empty() {
            self.flush()?;
        }

        let triad = self.store.triad(sample.channel, sample.granularity);
        match triad {
            Some(triad) if self.pending.is_empty() => self.emit(sample, arrived, triad),
            _ => {
                let max = self.plan.settings.max_uncalibrated_samples;
                if self.pending.len() >= max {
                    return Err(PowerMonitorError::calibration_timeout(format!(
                        "{max} samples buffered waiting for calibration ({} origins missing)",
                        self.store.missing().len()
                    )));
                }
                self.pending.push_back((sample, arrived));
                self.stats.peak_uncalibrated = self.stats.peak_uncalibrated.max(self.pending.len());
                Ok(())
            }
        }
    }

    /// Release held samples, in order, while their triads are complete.
    fn flush(&mut self) -> Result<()> {
        while let Some(&(sample, arrived)) = self.pending.front() {
            let Some(triad) = self.store.triad(sample.channel, sample.granularity) else {
                break;
            };
            self.pending.pop_front();
            self.emit(sample, arrived, triad)?;
        }
        Ok(())
    }

    fn emit(&mut self, sample: RawSample, elapsed: Duration, triad: Triad) -> Result<()> {
        let reference_amps = self.plan.reference.for_granularity(sample.granularity);
        let current_amps =
            triad.current_amps(sample.raw, reference_amps, sample.channel, sample.granularity)?;
        let calibrated = CalibratedSample {
            channel: sample.channel,
            sequence: self.next_sequence,
            elapsed,
            current_amps,
            voltage_volts: sample
                .voltage_raw
                .map(|v| f64::from(v) * self.plan.voltage_lsb),
        };
        self.next_sequence += 1;
        self.stats.samples_emitted += 1;

        if self.tx.send(Ok(calibrated)).is_err() && !self.receiver_gone {
            self.receiver_gone = true;
            debug!(serial = self.plan.serial, "Sample receiver dropped, stopping");
            self.stop.store(true, Ordering::SeqCst);
        }
        Ok(())
    }
}
