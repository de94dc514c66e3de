//! Device selection: turning device specs into instruments.
//!
//! A device spec is either a bare serial number or a record naming the
//! hardware type:
//!
//! ```json
//! [12345, {"type": "HvpmMonsoon", "serial": 23456}]
//! ```
//!
//! Bare serials are classified by a threshold: below it LVPM, at or above it
//! HVPM. Creation has no side effects; transports open on first use.

use crate::config::{CalibrationSettings, EngineSettings, Settings};
use crate::error::{PowerMonitorError, Result};
use crate::instrument::{Instrument, InstrumentConfig};
use crate::transport::TransportFactory;
use crate::types::HardwareFamily;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Untyped serial numbers at or above this are HVPM.
pub const DEFAULT_HVPM_SERIAL_THRESHOLD: u32 = 20000;

/// A device spec as written in configuration.
///
/// Deserializes from either a bare integer or a `{type, serial}` table;
/// [`DeviceRequest::try_from`] validates it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceSpec {
    /// Bare serial number.
    Serial(u32),
    /// Record with an optional type string.
    Record {
        /// Hardware type string.
        #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
        type_name: Option<String>,
        /// Serial number.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        serial: Option<i64>,
    },
}

/// A validated request for one instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRequest {
    /// Family inferred from the serial number.
    Serial(u32),
    /// Family given explicitly.
    Typed {
        /// Hardware family.
        family: HardwareFamily,
        /// Serial number.
        serial: u32,
    },
}

impl DeviceRequest {
    /// Serial number of the requested device.
    #[must_use]
    pub fn serial(&self) -> u32 {
        match *self {
            DeviceRequest::Serial(serial) | DeviceRequest::Typed { serial, .. } => serial,
        }
    }

    /// Parse one device spec from JSON.
    pub fn from_json(value: &serde_json::Value) -> Result<Self> {
        let spec: DeviceSpec = serde_json::from_value(value.clone()).map_err(|_| {
            PowerMonitorError::configuration(format!(
                "device spec must be a non-negative serial number or {{type, serial}}, got {value}"
            ))
        })?;
        Self::try_from(spec)
    }
}

impl From<u32> for DeviceRequest {
    fn from(serial: u32) -> Self {
        DeviceRequest::Serial(serial)
    }
}

impl TryFrom<DeviceSpec> for DeviceRequest {
    type Error = PowerMonitorError;

    fn try_from(spec: DeviceSpec) -> Result<Self> {
        match spec {
            DeviceSpec::Serial(serial) => Ok(DeviceRequest::Serial(serial)),
            DeviceSpec::Record { type_name, serial } => {
                let serial = serial.ok_or_else(|| {
                    PowerMonitorError::configuration("device record is missing 'serial'")
                })?;
                let serial = u32::try_from(serial).map_err(|_| {
                    PowerMonitorError::configuration(format!(
                        "device serial must be a non-negative 32-bit integer, got {serial}"
                    ))
                })?;
                match type_name {
                    None => Ok(DeviceRequest::Serial(serial)),
                    Some(name) => HardwareFamily::from_type_name(&name)
                        .map(|family| DeviceRequest::Typed { family, serial })
                        .ok_or_else(|| {
                            PowerMonitorError::configuration(format!(
                                "unrecognized device type '{name}' (expected '{}' or '{}')",
                                HardwareFamily::LVPM_TYPE_NAME,
                                HardwareFamily::HVPM_TYPE_NAME
                            ))
                        }),
                }
            }
        }
    }
}

impl fmt::Display for DeviceRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceRequest::Serial(serial) => write!(f, "{serial}"),
            DeviceRequest::Typed { family, serial } => {
                write!(f, "{}:{serial}", family.type_name())
            }
        }
    }
}

/// Builds [`Instrument`]s from device requests.
pub struct DeviceSelector {
    hvpm_serial_threshold: u32,
    transports: Arc<dyn TransportFactory>,
    engine: EngineSettings,
    calibration: CalibrationSettings,
    drain_on_open: Duration,
}

impl fmt::Debug for DeviceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSelector")
            .field("hvpm_serial_threshold", &self.hvpm_serial_threshold)
            .finish_non_exhaustive()
    }
}

impl DeviceSelector {
    /// Selector with library defaults.
    pub fn new(transports: Arc<dyn TransportFactory>) -> Self {
        Self::from_settings(&Settings::default(), transports)
    }

    /// Selector configured from loaded settings.
    pub fn from_settings(settings: &Settings, transports: Arc<dyn TransportFactory>) -> Self {
        Self {
            hvpm_serial_threshold: settings.selector.hvpm_serial_threshold,
            transports,
            engine: settings.engine.clone(),
            calibration: settings.calibration,
            drain_on_open: settings.transport.drain_on_open,
        }
    }

    /// Override the LVPM/HVPM serial threshold.
    #[must_use]
    pub fn with_hvpm_serial_threshold(mut self, threshold: u32) -> Self {
        self.hvpm_serial_threshold = threshold;
        self
    }

    /// Override the engine settings given to new instruments.
    #[must_use]
    pub fn with_engine_settings(mut self, engine: EngineSettings) -> Self {
        self.engine = engine;
        self
    }

    /// Override the stale-input drain on open.
    #[must_use]
    pub fn with_drain_on_open(mut self, quiet: Duration) -> Self {
        self.drain_on_open = quiet;
        self
    }

    /// Threshold in effect.
    #[must_use]
    pub fn hvpm_serial_threshold(&self) -> u32 {
        self.hvpm_serial_threshold
    }

    /// Family of an untyped serial number.
    #[must_use]
    pub fn family_for_serial(&self, serial: u32) -> HardwareFamily {
        if serial < self.hvpm_serial_threshold {
            HardwareFamily::Lvpm
        } else {
            HardwareFamily::Hvpm
        }
    }

    /// Family and serial a request resolves to.
    #[must_use]
    pub fn resolve(&self, request: DeviceRequest) -> (HardwareFamily, u32) {
        match request {
            DeviceRequest::Serial(serial) => (self.family_for_serial(serial), serial),
            DeviceRequest::Typed { family, serial } => (family, serial),
        }
    }

    /// Create one instrument per request, in order.
    pub fn create<I>(&self, requests: I) -> Vec<Instrument>
    where
        I: IntoIterator<Item = DeviceRequest>,
    {
        requests
            .into_iter()
            .map(|request| {
                let (family, serial) = self.resolve(request);
                debug!(%request, %family, serial, "Creating instrument");
                let config = InstrumentConfig::from_parts(
                    &self.engine,
                    &self.calibration,
                    self.drain_on_open,
                    family,
                );
                Instrument::new(family, serial, Arc::clone(&self.transports), config)
            })
            .collect()
    }

    /// Validate every spec, then create the instruments.
    ///
    /// Nothing is created when any spec is invalid.
    pub fn create_from_specs(&self, specs: &[DeviceSpec]) -> Result<Vec<Instrument>> {
        let requests = specs
            .iter()
            .cloned()
            .map(DeviceRequest::try_from)
            .collect::<Result<Vec<_>>>()?;
        Ok(self.create(requests))
    }

    /// Create instruments from a JSON device spec or array of specs.
    pub fn create_from_json(&self, value: &serde_json::Value) -> Result<Vec<Instrument>> {
        let requests = match value {
            serde_json::Value::Array(items) => items
                .iter()
                .map(DeviceRequest::from_json)
                .collect::<Result<Vec<_>>>()?,
            single => vec![DeviceRequest::from_json(single)?],
        };
        Ok(self.create(requests))
    }
}

/// Close every instrument, stopping active sessions first.
///
/// Safe to call repeatedly and on instruments that were never opened. Every
/// instrument is closed even if one fails; the first error is returned.
pub async fn destroy(instruments: &mut [Instrument]) -> Result<()> {
    let mut first_error = None;
    for instrument in instruments.iter_mut() {
        if let Err(err) = instrument.close().await {
            warn!(serial = instrument.serial(), error = %err, "Failed to close instrument");
            first_error.get_or_insert(err);
        }
    }
    info!(count = instruments.len(), "Destroyed instruments");
    first_error.map_or(Ok(()), Err)
}
