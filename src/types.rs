//! Measurement vocabulary shared by the codec, the calibration store and the
//! sampling engine.
//!
//! Every enum here has a one-byte wire code. The codes are identical for both
//! hardware families; only the framing around them differs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Measurement channel of the power monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    /// Main supply output.
    Main,
    /// USB passthrough port.
    Usb,
    /// Auxiliary current input.
    Aux,
}

impl Channel {
    /// All channels in wire-code order.
    pub const ALL: [Channel; 3] = [Channel::Main, Channel::Usb, Channel::Aux];

    /// Wire code of this channel.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Channel::Main => 0,
            Channel::Usb => 1,
            Channel::Aux => 2,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.code())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Main => write!(f, "main"),
            Channel::Usb => write!(f, "usb"),
            Channel::Aux => write!(f, "aux"),
        }
    }
}

/// ADC range a sample was taken in. Both ranges are calibrated independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    /// High-current range.
    Coarse,
    /// Low-current, high-resolution range.
    Fine,
}

impl Granularity {
    /// All granularities in wire-code order.
    pub const ALL: [Granularity; 2] = [Granularity::Coarse, Granularity::Fine];

    /// Wire code of this granularity.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Granularity::Coarse => 0,
            Granularity::Fine => 1,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.code())
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Granularity::Coarse => write!(f, "coarse"),
            Granularity::Fine => write!(f, "fine"),
        }
    }
}

/// Calibration point kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Origin {
    /// ADC code with no load applied.
    Zero,
    /// ADC code with the reference load applied.
    Reference,
    /// ADC code at full scale.
    Scale,
}

impl Origin {
    /// All origins in wire-code order.
    pub const ALL: [Origin; 3] = [Origin::Zero, Origin::Reference, Origin::Scale];

    /// Wire code of this origin.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Origin::Zero => 0,
            Origin::Reference => 1,
            Origin::Scale => 2,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        Self::ALL.get(usize::from(code)).copied()
    }

    pub(crate) fn index(self) -> usize {
        usize::from(self.code())
    }
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Zero => write!(f, "zero"),
            Origin::Reference => write!(f, "reference"),
            Origin::Scale => write!(f, "scale"),
        }
    }
}

/// Auxiliary register read on demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reading {
    /// Main output voltage.
    Voltage,
    /// Front-end gain control register.
    GainControl,
}

impl Reading {
    /// Wire code of this register.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            Reading::Voltage => 0,
            Reading::GainControl => 1,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Reading::Voltage),
            1 => Some(Reading::GainControl),
            _ => None,
        }
    }
}

impl fmt::Display for Reading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reading::Voltage => write!(f, "voltage"),
            Reading::GainControl => write!(f, "gain_control"),
        }
    }
}

/// USB passthrough mode of the monitor's USB channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UsbPassthrough {
    /// USB data lines disconnected.
    Off,
    /// USB data lines connected.
    On,
    /// Connected only while not sampling.
    Auto,
}

impl UsbPassthrough {
    /// Wire code of this mode.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            UsbPassthrough::Off => 0,
            UsbPassthrough::On => 1,
            UsbPassthrough::Auto => 2,
        }
    }

    /// Parse a wire code.
    #[must_use]
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(UsbPassthrough::Off),
            1 => Some(UsbPassthrough::On),
            2 => Some(UsbPassthrough::Auto),
            _ => None,
        }
    }
}

/// Reference load currents applied by the factory calibration routine.
///
/// `counts_per_amp = (scale - reference) / I_ref`, so these values are part
/// of the calibration model, not of the device state.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceCurrents {
    /// Reference current for the coarse range, in amps.
    pub coarse_amps: f64,
    /// Reference current for the fine range, in amps.
    pub fine_amps: f64,
}

impl ReferenceCurrents {
    /// Reference current for a granularity.
    #[must_use]
    pub fn for_granularity(&self, granularity: Granularity) -> f64 {
        match granularity {
            Granularity::Coarse => self.coarse_amps,
            Granularity::Fine => self.fine_amps,
        }
    }
}

/// Hardware variant of the power monitor.
///
/// Resolved once when the instrument is created; everything family-specific
/// (framing, reference currents, voltage scaling) hangs off this tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HardwareFamily {
    /// Low-voltage power monitor.
    Lvpm,
    /// High-voltage power monitor.
    Hvpm,
}

impl HardwareFamily {
    /// Type string used in device specs for [`HardwareFamily::Lvpm`].
    pub const LVPM_TYPE_NAME: &'static str = "LvpmStockMonsoon";
    /// Type string used in device specs for [`HardwareFamily::Hvpm`].
    pub const HVPM_TYPE_NAME: &'static str = "HvpmMonsoon";

    /// Type string of this family as it appears in device specs.
    #[must_use]
    pub fn type_name(self) -> &'static str {
        match self {
            HardwareFamily::Lvpm => Self::LVPM_TYPE_NAME,
            HardwareFamily::Hvpm => Self::HVPM_TYPE_NAME,
        }
    }

    /// Resolve a device-spec type string. Matching is exact.
    #[must_use]
    pub fn from_type_name(name: &str) -> Option<Self> {
        match name {
            Self::LVPM_TYPE_NAME => Some(HardwareFamily::Lvpm),
            Self::HVPM_TYPE_NAME => Some(HardwareFamily::Hvpm),
            _ => None,
        }
    }

    /// Factory reference currents of this family.
    #[must_use]
    pub fn reference_currents(self) -> ReferenceCurrents {
        match self {
            HardwareFamily::Lvpm => ReferenceCurrents {
                coarse_amps: 2.0,
                fine_amps: 0.03,
            },
            HardwareFamily::Hvpm => ReferenceCurrents {
                coarse_amps: 4.0,
                fine_amps: 0.05,
            },
        }
    }

    /// Size of one voltage ADC count, in volts.
    #[must_use]
    pub fn voltage_lsb_volts(self) -> f64 {
        match self {
            HardwareFamily::Lvpm => 125e-6,
            HardwareFamily::Hvpm => 250e-6,
        }
    }

    /// Settable main output range in volts. Zero (output off) is always legal.
    #[must_use]
    pub fn output_voltage_range(self) -> (f64, f64) {
        match self {
            HardwareFamily::Lvpm => (2.01, 4.55),
            HardwareFamily::Hvpm => (0.8, 13.5),
        }
    }
}

impl fmt::Display for HardwareFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HardwareFamily::Lvpm => write!(f, "LVPM"),
            HardwareFamily::Hvpm => write!(f, "HVPM"),
        }
    }
}

/// One uncalibrated ADC sample as decoded from a data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawSample {
    /// Channel the sample belongs to.
    pub channel: Channel,
    /// ADC range the sample was taken in.
    pub granularity: Granularity,
    /// Raw current ADC code.
    pub raw: i32,
    /// Device-side sequence counter (wraps at the family's field width).
    pub sequence: u32,
    /// Raw voltage ADC code, when the frame carried one.
    pub voltage_raw: Option<u16>,
}

/// A sample converted to physical units.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibratedSample {
    /// Channel the sample belongs to.
    pub channel: Channel,
    /// Position in the session's stream, starting at 0.
    pub sequence: u64,
    /// Arrival time relative to the start of the session.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    /// Current in amps.
    pub current_amps: f64,
    /// Voltage in volts, when the frame carried one.
    pub voltage_volts: Option<f64>,
}

/// Device status as reported by a status frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    /// Device status code; 0 means healthy.
    pub code: u8,
    /// Firmware version byte.
    pub firmware_version: u8,
    /// Serial number reported by the device.
    pub serial: u32,
}

impl DeviceStatus {
    /// Whether the device reports an error condition.
    #[must_use]
    pub fn is_fault(&self) -> bool {
        self.code != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_codes_round_trip() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_code(channel.code()), Some(channel));
        }
        for granularity in Granularity::ALL {
            assert_eq!(Granularity::from_code(granularity.code()), Some(granularity));
        }
        for origin in Origin::ALL {
            assert_eq!(Origin::from_code(origin.code()), Some(origin));
        }
        assert_eq!(Channel::from_code(3), None);
        assert_eq!(Granularity::from_code(2), None);
        assert_eq!(Reading::from_code(9), None);
    }

    #[test]
    fn type_names_are_exact() {
        assert_eq!(
            HardwareFamily::from_type_name("LvpmStockMonsoon"),
            Some(HardwareFamily::Lvpm)
        );
        assert_eq!(
            HardwareFamily::from_type_name("HvpmMonsoon"),
            Some(HardwareFamily::Hvpm)
        );
        assert_eq!(HardwareFamily::from_type_name("hvpmmonsoon"), None);
        assert_eq!(HardwareFamily::from_type_name(""), None);
    }

    #[test]
    fn status_fault_flag() {
        let healthy = DeviceStatus {
            code: 0,
            firmware_version: 31,
            serial: 10,
        };
        assert!(!healthy.is_fault());
        assert!(DeviceStatus { code: 4, ..healthy }.is_fault());
    }
}
