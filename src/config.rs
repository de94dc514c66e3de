//! Layered configuration.
//!
//! Settings are assembled with figment in three layers:
//!
//! 1. Library defaults ([`Settings::default`])
//! 2. An optional TOML file
//! 3. Environment variables prefixed `MONSOON_`, with `__` separating
//!    nested keys (`MONSOON_ENGINE__WATCHDOG=5s`)
//!
//! Durations are humantime strings (`"250ms"`, `"2s"`).
//!
//! ```toml
//! [engine]
//! read_timeout = "50ms"
//! watchdog = "2s"
//! max_uncalibrated_samples = 4096
//!
//! [selector]
//! hvpm_serial_threshold = 20000
//!
//! [transport]
//! port_template = "/dev/serial/by-id/usb-Monsoon_{family}_{serial}-if00"
//!
//! [calibration.lvpm]
//! coarse_amps = 2.0
//! fine_amps = 0.03
//!
//! [[devices]]
//! type = "HvpmMonsoon"
//! serial = 23456
//! ```

use crate::error::{PowerMonitorError, Result};
use crate::instrument::MAX_SAMPLE_RATE_HZ;
use crate::selector::{DeviceRequest, DeviceSpec, DEFAULT_HVPM_SERIAL_THRESHOLD};
use crate::types::{HardwareFamily, ReferenceCurrents};
use anyhow::Context;
use figment::providers::{Env, Format, Serialized, Toml};
use figment::{Figment, Provider};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Config file read when no explicit path is given.
pub const DEFAULT_CONFIG_PATH: &str = "config/monsoon.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "MONSOON_";

/// Root of the configuration tree.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Sampling engine timing and limits.
    pub engine: EngineSettings,
    /// Device selection.
    pub selector: SelectorSettings,
    /// Serial transport.
    pub transport: TransportSettings,
    /// Reference-current overrides.
    pub calibration: CalibrationSettings,
    /// Monitors to create.
    pub devices: Vec<DeviceSpec>,
}

impl Provider for Settings {
    fn metadata(&self) -> figment::Metadata {
        figment::Metadata::named("Library Defaults")
    }

    fn data(
        &self,
    ) -> std::result::Result<figment::value::Map<figment::Profile, figment::value::Dict>, figment::Error>
    {
        Serialized::defaults(Settings::default()).data()
    }
}

/// Sampling engine timing and limits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Timeout of a single transport read.
    #[serde(with = "humantime_serde")]
    pub read_timeout: Duration,
    /// A sampling session faults when nothing arrives for this long.
    #[serde(with = "humantime_serde")]
    pub watchdog: Duration,
    /// Time allowed for every calibration origin to arrive.
    #[serde(with = "humantime_serde")]
    pub calibration_timeout: Duration,
    /// Time allowed to drain in-flight frames after `StopSampling`.
    #[serde(with = "humantime_serde")]
    pub drain_timeout: Duration,
    /// Time allowed for the answer to a request such as `GetStatus`.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Samples held while their granularity is not yet calibrated.
    pub max_uncalibrated_samples: usize,
    /// Frames in the checksum drop-rate window.
    pub checksum_window: usize,
    /// Fraction of corrupt frames in the window that faults the session.
    pub max_checksum_drop_rate: f64,
    /// Sample rate for [`Instrument::start_sampling_default`](crate::Instrument::start_sampling_default).
    pub default_rate_hz: u16,
    /// Size of one transport read.
    pub read_chunk_bytes: usize,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            read_timeout: Duration::from_millis(50),
            watchdog: Duration::from_secs(2),
            calibration_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_millis(500),
            request_timeout: Duration::from_secs(1),
            max_uncalibrated_samples: 4096,
            checksum_window: 128,
            max_checksum_drop_rate: 0.2,
            default_rate_hz: 5000,
            read_chunk_bytes: 4096,
        }
    }
}

/// Device selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorSettings {
    /// Untyped serials at or above this are HVPM.
    pub hvpm_serial_threshold: u32,
}

impl Default for SelectorSettings {
    fn default() -> Self {
        Self {
            hvpm_serial_threshold: DEFAULT_HVPM_SERIAL_THRESHOLD,
        }
    }
}

/// Serial transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Port path template; `{family}`, `{type}` and `{serial}` are filled in.
    pub port_template: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Stale input is discarded until the link stays quiet this long.
    /// Zero skips the drain.
    #[serde(with = "humantime_serde")]
    pub drain_on_open: Duration,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            port_template: "/dev/serial/by-id/usb-Monsoon_{family}_{serial}-if00".to_string(),
            baud_rate: 115_200,
            drain_on_open: Duration::from_millis(10),
        }
    }
}

/// Reference-current overrides for test rigs with non-factory loads.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationSettings {
    /// LVPM override.
    pub lvpm: Option<ReferenceCurrents>,
    /// HVPM override.
    pub hvpm: Option<ReferenceCurrents>,
}

impl CalibrationSettings {
    /// Effective reference currents of a family.
    #[must_use]
    pub fn reference_currents(&self, family: HardwareFamily) -> ReferenceCurrents {
        let overridden = match family {
            HardwareFamily::Lvpm => self.lvpm,
            HardwareFamily::Hvpm => self.hvpm,
        };
        overridden.unwrap_or_else(|| family.reference_currents())
    }
}

impl Settings {
    /// Load defaults, then `config_path` (or [`DEFAULT_CONFIG_PATH`]) if it
    /// exists, then `MONSOON_*` environment variables, and validate.
    pub fn load(config_path: Option<&Path>) -> anyhow::Result<Self> {
        let mut figment = Figment::from(Settings::default());

        let file_path = config_path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_PATH));
        if file_path.exists() {
            figment = figment.merge(Toml::file(file_path));
        } else if config_path.is_some() {
            warn!(path = %file_path.display(), "Config file not found, using defaults");
        } else {
            debug!(path = %file_path.display(), "No config file, using defaults");
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let settings: Settings = figment
            .extract()
            .context("Failed to extract configuration")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// Parse settings from a TOML document layered over the defaults.
    pub fn from_toml_str(toml: &str) -> anyhow::Result<Self> {
        let settings: Settings = Figment::from(Settings::default())
            .merge(Toml::string(toml))
            .extract()
            .context("Failed to parse configuration")?;
        settings
            .validate()
            .context("Configuration validation failed")?;
        Ok(settings)
    }

    /// Check every section.
    pub fn validate(&self) -> Result<()> {
        let engine = &self.engine;
        for (name, value) in [
            ("engine.read_timeout", engine.read_timeout),
            ("engine.watchdog", engine.watchdog),
            ("engine.calibration_timeout", engine.calibration_timeout),
            ("engine.drain_timeout", engine.drain_timeout),
            ("engine.request_timeout", engine.request_timeout),
        ] {
            if value.is_zero() {
                return Err(PowerMonitorError::configuration(format!(
                    "{name} must be greater than zero"
                )));
            }
        }
        if engine.watchdog < engine.read_timeout {
            return Err(PowerMonitorError::configuration(format!(
                "engine.watchdog ({:?}) must not be shorter than engine.read_timeout ({:?})",
                engine.watchdog, engine.read_timeout
            )));
        }
        if engine.max_uncalibrated_samples == 0 {
            return Err(PowerMonitorError::configuration(
                "engine.max_uncalibrated_samples must be greater than zero",
            ));
        }
        if engine.checksum_window == 0 {
            return Err(PowerMonitorError::configuration(
                "engine.checksum_window must be greater than zero",
            ));
        }
        if !(engine.max_checksum_drop_rate > 0.0 && engine.max_checksum_drop_rate <= 1.0) {
            return Err(PowerMonitorError::configuration(format!(
                "engine.max_checksum_drop_rate = {} is outside (0, 1]",
                engine.max_checksum_drop_rate
            )));
        }
        if engine.default_rate_hz == 0 || engine.default_rate_hz > MAX_SAMPLE_RATE_HZ {
            return Err(PowerMonitorError::configuration(format!(
                "engine.default_rate_hz = {} is outside 1..={MAX_SAMPLE_RATE_HZ}",
                engine.default_rate_hz
            )));
        }
        if engine.read_chunk_bytes == 0 {
            return Err(PowerMonitorError::configuration(
                "engine.read_chunk_bytes must be greater than zero",
            ));
        }

        if self.transport.port_template.is_empty() {
            return Err(PowerMonitorError::configuration(
                "transport.port_template must not be empty",
            ));
        }

        for (name, currents) in [
            ("calibration.lvpm", self.calibration.lvpm),
            ("calibration.hvpm", self.calibration.hvpm),
        ] {
            let Some(currents) = currents else { continue };
            for amps in [currents.coarse_amps, currents.fine_amps] {
                if !amps.is_finite() || amps <= 0.0 {
                    return Err(PowerMonitorError::configuration(format!(
                        "{name}: reference current {amps} A must be positive"
                    )));
                }
            }
        }

        self.device_requests().map(|_| ())
    }

    /// The `devices` list, validated.
    pub fn device_requests(&self) -> Result<Vec<DeviceRequest>> {
        self.devices
            .iter()
            .cloned()
            .map(DeviceRequest::try_from)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(
            settings.selector.hvpm_serial_threshold,
            DEFAULT_HVPM_SERIAL_THRESHOLD
        );
    }

    #[test]
    fn toml_overrides_defaults() {
        let settings = Settings::from_toml_str(
            r#"
            [engine]
            read_timeout = "20ms"
            max_uncalibrated_samples = 16

            [selector]
            hvpm_serial_threshold = 30000

            [calibration.hvpm]
            coarse_amps = 3.5
            fine_amps = 0.04

            [[devices]]
            type = "LvpmStockMonsoon"
            serial = 10

            [[devices]]
            serial = 23456
            "#,
        )
        .unwrap();

        assert_eq!(settings.engine.read_timeout, Duration::from_millis(20));
        assert_eq!(settings.engine.watchdog, Duration::from_secs(2));
        assert_eq!(settings.engine.max_uncalibrated_samples, 16);
        assert_eq!(settings.selector.hvpm_serial_threshold, 30000);
        assert_eq!(
            settings.calibration.reference_currents(HardwareFamily::Hvpm),
            ReferenceCurrents {
                coarse_amps: 3.5,
                fine_amps: 0.04
            }
        );
        assert_eq!(
            settings.calibration.reference_currents(HardwareFamily::Lvpm),
            HardwareFamily::Lvpm.reference_currents()
        );

        let requests = settings.device_requests().unwrap();
        assert_eq!(
            requests,
            vec![
                DeviceRequest::Typed {
                    family: HardwareFamily::Lvpm,
                    serial: 10
                },
                DeviceRequest::Serial(23456),
            ]
        );
    }

    #[test]
    fn example_file_matches_defaults() {
        let settings =
            Settings::from_toml_str(include_str!("../config/monsoon.example.toml")).unwrap();
        assert_eq!(settings.engine, EngineSettings::default());
        assert_eq!(settings.transport, TransportSettings::default());
        assert_eq!(settings.device_requests().unwrap().len(), 2);
    }

    #[test]
    fn rejects_invalid_values() {
        let cases = [
            "[engine]\nread_timeout = \"0s\"",
            "[engine]\nmax_uncalibrated_samples = 0",
            "[engine]\nmax_checksum_drop_rate = 1.5",
            "[engine]\ndefault_rate_hz = 0",
            "[engine]\ndefault_rate_hz = 6000",
            "[engine]\nwatchdog = \"10ms\"\nread_timeout = \"50ms\"",
            "[calibration.lvpm]\ncoarse_amps = -1.0\nfine_amps = 0.03",
            "[[devices]]\ntype = \"UNKNOWN\"\nserial = 10",
        ];
        for case in cases {
            assert!(Settings::from_toml_str(case).is_err(), "accepted: {case}");
        }
    }

    #[test]
    #[serial]
    fn load_layers_file_and_environment() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[engine]\nwatchdog = \"4s\"\ndrain_timeout = \"1s\"").unwrap();

        std::env::set_var("MONSOON_ENGINE__DRAIN_TIMEOUT", "250ms");
        let settings = Settings::load(Some(file.path()));
        std::env::remove_var("MONSOON_ENGINE__DRAIN_TIMEOUT");

        let settings = settings.unwrap();
        assert_eq!(settings.engine.watchdog, Duration::from_secs(4));
        assert_eq!(settings.engine.drain_timeout, Duration::from_millis(250));
    }

    #[test]
    #[serial]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = Settings::load(Some(&dir.path().join("absent.toml"))).unwrap();
        assert_eq!(settings, Settings::default());
    }
}
