//! Error types for power-monitor operations.
//!
//! A single enum covers every failure a session can report. Errors are
//! `Clone` because a fault is both delivered on the sample stream and kept on
//! the instrument until `reset()`.

use crate::engine::EngineState;
use crate::types::{Channel, Granularity, HardwareFamily};
use std::fmt;
use thiserror::Error;

/// Result type alias for power-monitor operations.
pub type Result<T> = std::result::Result<T, PowerMonitorError>;

/// Errors that can occur when working with a power monitor.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PowerMonitorError {
    /// Malformed device request or invalid settings
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A single frame failed its checksum
    #[error("{family} frame checksum mismatch: expected {expected:#06x}, got {actual:#06x}")]
    Checksum {
        family: HardwareFamily,
        expected: u16,
        actual: u16,
    },

    /// Calibration triad missing an origin, or degenerate
    #[error("Calibration incomplete for {channel}/{granularity}: {reason}")]
    CalibrationIncomplete {
        channel: Channel,
        granularity: Granularity,
        reason: String,
    },

    /// Calibration did not complete in time
    #[error("Calibration timed out: {message}")]
    CalibrationTimeout { message: String },

    /// I/O failure, closed link or watchdog expiry
    #[error("Transport error: {message}")]
    Transport { message: String },

    /// Status frame reported a device error
    #[error("Device reported fault status {code:#04x}")]
    DeviceFault { code: u8 },

    /// Operation not legal in the current session state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: EngineState,
    },

    /// Request/response exchange got no answer
    #[error("Timed out waiting for {what}")]
    Timeout { what: String },
}

/// Broad classification of a [`PowerMonitorError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad request or settings.
    Configuration,
    /// Link-level failure (framing, I/O, timeouts).
    Communication,
    /// Calibration data missing, degenerate or late.
    Calibration,
    /// The device itself reported an error.
    Hardware,
    /// The session state machine rejected the operation.
    State,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Configuration => write!(f, "configuration"),
            Self::Communication => write!(f, "communication"),
            Self::Calibration => write!(f, "calibration"),
            Self::Hardware => write!(f, "hardware"),
            Self::State => write!(f, "state"),
        }
    }
}

impl PowerMonitorError {
    pub(crate) fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub(crate) fn calibration_timeout(message: impl Into<String>) -> Self {
        Self::CalibrationTimeout {
            message: message.into(),
        }
    }

    pub(crate) fn incomplete(
        channel: Channel,
        granularity: Granularity,
        reason: impl Into<String>,
    ) -> Self {
        Self::CalibrationIncomplete {
            channel,
            granularity,
            reason: reason.into(),
        }
    }

    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::Checksum { .. } | Self::Transport { .. } | Self::Timeout { .. } => {
                ErrorKind::Communication
            }
            Self::CalibrationIncomplete { .. } | Self::CalibrationTimeout { .. } => {
                ErrorKind::Calibration
            }
            Self::DeviceFault { .. } => ErrorKind::Hardware,
            Self::InvalidState { .. } => ErrorKind::State,
        }
    }

    /// Whether the sampling loop may continue after this error.
    ///
    /// Only a single corrupt frame is recoverable; everything else would
    /// produce meaningless values and faults the session.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Checksum { .. })
    }

    /// Check if this is a calibration error.
    #[must_use]
    pub fn is_calibration(&self) -> bool {
        self.kind() == ErrorKind::Calibration
    }
}

impl From<std::io::Error> for PowerMonitorError {
    fn from(err: std::io::Error) -> Self {
        Self::transport(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_checksum_errors_are_recoverable() {
        let checksum = PowerMonitorError::Checksum {
            family: HardwareFamily::Hvpm,
            expected: 0x1234,
            actual: 0x4321,
        };
        assert!(checksum.is_recoverable());
        assert_eq!(checksum.kind(), ErrorKind::Communication);

        let transport = PowerMonitorError::transport("port vanished");
        assert!(!transport.is_recoverable());
        assert!(!PowerMonitorError::DeviceFault { code: 2 }.is_recoverable());
    }

    #[test]
    fn display_carries_context() {
        let err = PowerMonitorError::incomplete(Channel::Usb, Granularity::Fine, "zero not set");
        assert_eq!(
            err.to_string(),
            "Calibration incomplete for usb/fine: zero not set"
        );
        assert!(err.is_calibration());

        let err = PowerMonitorError::InvalidState {
            operation: "start sampling",
            state: EngineState::Faulted,
        };
        assert_eq!(err.to_string(), "Cannot start sampling while faulted");
        assert_eq!(err.kind(), ErrorKind::State);
    }

    #[test]
    fn io_errors_become_transport_errors() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: PowerMonitorError = io.into();
        assert!(matches!(err, PowerMonitorError::Transport { .. }));
    }
}
