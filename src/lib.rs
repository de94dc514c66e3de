//! # Monsoon DAQ
//!
//! Acquisition and calibration driver for Monsoon LVPM and HVPM power
//! monitors. The crate opens a monitor over a byte transport, reads its
//! factory calibration, streams raw ADC frames and turns them into
//! calibrated current (and voltage) samples.
//!
//! ## Crate Structure
//!
//! - **`selector`**: Turns device specs (bare serials or `{type, serial}`
//!   records) into [`Instrument`]s and tears them down again with [`destroy`].
//! - **`instrument`**: One monitor: lazily opened link, request/response
//!   commands and the sampling session lifecycle.
//! - **`engine`**: The sampling task: state machine, hold queue for samples
//!   that arrive before calibration, watchdog and corrupt-frame escalation.
//! - **`protocol`**: Framing and resumable decoding for both families.
//! - **`calibration`**: Origin triads, the shared calibration store and the
//!   raw-to-amps conversion.
//! - **`transport`**: The byte-link abstraction, serial ports (feature
//!   `serial`) and a scripted mock port.
//! - **`simulator`**: Simulated monitors speaking the real protocol, with
//!   fault injection.
//! - **`config`**: Layered settings (defaults, TOML, `MONSOON_` environment).
//! - **`error`**: [`PowerMonitorError`] and its classification.
//!
//! ## Example
//!
//! ```rust,ignore
//! use monsoon_daq::{destroy, DeviceSelector, SerialTransportFactory, Settings};
//! use futures::StreamExt;
//!
//! let settings = Settings::load(None)?;
//! let transports = Arc::new(SerialTransportFactory::from_settings(&settings.transport));
//! let selector = DeviceSelector::from_settings(&settings, transports);
//! let mut monitors = selector.create_from_json(&serde_json::json!([12345]))?;
//!
//! let monitor = &mut monitors[0];
//! monitor.calibrate().await?;
//! let mut samples = monitor.start_sampling(5000).await?;
//! while let Some(sample) = samples.next().await {
//!     let sample = sample?;
//!     println!("{} {:.6} A", sample.channel, sample.current_amps);
//! #   break;
//! }
//! let report = monitor.stop_sampling(samples).await?;
//! destroy(&mut monitors).await?;
//! ```

pub mod calibration;
pub mod config;
pub mod engine;
pub mod error;
pub mod instrument;
pub mod protocol;
pub mod selector;
pub mod simulator;
pub mod transport;
pub mod types;

pub use calibration::{CalibrationSet, CalibrationStore, Triad};
pub use config::Settings;
pub use engine::{EngineState, SamplingHandle, SamplingReport, SamplingStats};
pub use error::{ErrorKind, PowerMonitorError, Result};
pub use instrument::{Instrument, InstrumentConfig, MAX_SAMPLE_RATE_HZ};
pub use protocol::{Command, Frame, FrameCodec, MalformedFrame};
pub use selector::{destroy, DeviceRequest, DeviceSelector, DeviceSpec};
#[cfg(feature = "serial")]
pub use transport::SerialTransportFactory;
pub use transport::{DynTransport, Transport, TransportFactory};
pub use types::{
    CalibratedSample, Channel, DeviceStatus, Granularity, HardwareFamily, Origin, RawSample,
    Reading, ReferenceCurrents, UsbPassthrough,
};
