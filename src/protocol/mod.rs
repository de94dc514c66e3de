//! Wire protocol for both power-monitor families.
//!
//! The two families share one command set and one set of inbound frame
//! kinds but differ in framing (sync marker, header layout, checksum and
//! byte order). [`FrameCodec`] is tagged with the family once and dispatches
//! to the family's framing with a `match`, so the sampling engine never looks
//! at bytes.
//!
//! Decoding is resumable. Bytes are pushed into a carry-over buffer and
//! complete frames are pulled out; splitting the same byte stream at any
//! point yields the same frames. Bytes before a sync marker are discarded
//! and counted. A frame whose checksum fails is reported as
//! [`PowerMonitorError::Checksum`] after its sync marker has been skipped, so
//! the next call resynchronizes on its own.

mod hvpm;
mod lvpm;

use crate::error::{PowerMonitorError, Result};
use crate::types::{
    Channel, DeviceStatus, Granularity, HardwareFamily, Origin, RawSample, Reading, UsbPassthrough,
};
use bytes::{Buf, BytesMut};
use std::fmt;
use tracing::{debug, trace};

/// Host-to-device command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Begin streaming data frames at the given rate.
    StartSampling {
        /// Samples per second per channel.
        rate_hz: u16,
    },
    /// Stop streaming data frames.
    StopSampling,
    /// Ask the device to report every calibration origin.
    ReadCalibration,
    /// Read an auxiliary register.
    ReadReading(Reading),
    /// Switch the main output on or off.
    SetPower(bool),
    /// Ask for a status frame.
    GetStatus,
    /// Set the main output voltage.
    SetVoltage {
        /// Output voltage in millivolts; 0 turns the output off.
        millivolts: u16,
    },
    /// Set the USB passthrough mode.
    SetUsbPassthrough(UsbPassthrough),
}

/// Device-to-host frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// One raw ADC sample.
    Data(RawSample),
    /// One calibration origin value.
    Calibration {
        /// Channel the value belongs to.
        channel: Channel,
        /// ADC range the value belongs to.
        granularity: Granularity,
        /// Which origin point this is.
        origin: Origin,
        /// Raw ADC code.
        value: i32,
    },
    /// Device status.
    Status(DeviceStatus),
    /// Answer to [`Command::ReadReading`].
    Reading {
        /// Register that was read.
        kind: Reading,
        /// Raw register value.
        raw: i32,
    },
    /// A frame that passed its checksum but could not be interpreted.
    Malformed(MalformedFrame),
}

/// Why a checksummed frame could not be interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MalformedFrame {
    /// The frame type code is not in the family's table.
    UnknownType(u8),
    /// The payload length does not match the frame type.
    BadLength {
        /// Frame type code.
        frame_type: u8,
        /// Payload length the frame type requires.
        expected: usize,
        /// Payload length received.
        actual: usize,
    },
    /// A payload field holds an out-of-range code.
    BadField {
        /// Frame type code.
        frame_type: u8,
        /// Field name.
        field: &'static str,
        /// Offending value.
        value: u8,
    },
    /// The header declares a length the family does not allow.
    InvalidLength {
        /// Declared length.
        declared: usize,
    },
}

impl fmt::Display for MalformedFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownType(code) => write!(f, "unknown frame type {code:#04x}"),
            Self::BadLength {
                frame_type,
                expected,
                actual,
            } => write!(
                f,
                "frame type {frame_type:#04x} needs {expected} payload bytes, got {actual}"
            ),
            Self::BadField {
                frame_type,
                field,
                value,
            } => write!(f, "frame type {frame_type:#04x}: invalid {field} {value}"),
            Self::InvalidLength { declared } => write!(f, "invalid declared length {declared}"),
        }
    }
}

/// A checksummed frame, before interpretation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Packet {
    pub frame_type: u8,
    pub payload: Vec<u8>,
}

impl Packet {
    fn new(frame_type: u8, payload: Vec<u8>) -> Self {
        Self {
            frame_type,
            payload,
        }
    }

    /// Payload reader after checking the exact length.
    fn body(&self, expected: usize) -> std::result::Result<&[u8], MalformedFrame> {
        if self.payload.len() == expected {
            Ok(&self.payload)
        } else {
            Err(MalformedFrame::BadLength {
                frame_type: self.frame_type,
                expected,
                actual: self.payload.len(),
            })
        }
    }

    fn code<T>(
        &self,
        field: &'static str,
        value: u8,
        parse: fn(u8) -> Option<T>,
    ) -> std::result::Result<T, MalformedFrame> {
        parse(value).ok_or(MalformedFrame::BadField {
            frame_type: self.frame_type,
            field,
            value,
        })
    }
}

/// Result of scanning a buffer that starts with a sync marker.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Scan {
    Incomplete,
    Packet { packet: Packet, consumed: usize },
    Corrupt { expected: u16, actual: u16 },
    InvalidLength { declared: usize },
}

/// What a pull from the decoder produced.
type Pulled = Option<std::result::Result<Packet, MalformedFrame>>;

/// Family-tagged encoder and resumable decoder.
#[derive(Debug)]
pub struct FrameCodec {
    family: HardwareFamily,
    buffer: BytesMut,
    discarded: u64,
}

impl FrameCodec {
    /// A codec for one family with an empty carry-over buffer.
    #[must_use]
    pub fn new(family: HardwareFamily) -> Self {
        Self {
            family,
            buffer: BytesMut::with_capacity(1024),
            discarded: 0,
        }
    }

    /// Family this codec speaks.
    #[must_use]
    pub fn family(&self) -> HardwareFamily {
        self.family
    }

    /// Bytes dropped while hunting for a sync marker.
    #[must_use]
    pub fn discarded_bytes(&self) -> u64 {
        self.discarded
    }

    /// Bytes waiting in the carry-over buffer.
    #[must_use]
    pub fn buffered_bytes(&self) -> usize {
        self.buffer.len()
    }

    /// Drop any partial frame and reset counters.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.discarded = 0;
    }

    /// Encode a command into one complete frame.
    #[must_use]
    pub fn encode_command(&self, command: &Command) -> Vec<u8> {
        match self.family {
            HardwareFamily::Lvpm => lvpm::encode_command(command),
            HardwareFamily::Hvpm => hvpm::encode_command(command),
        }
    }

    /// Decode one complete command frame.
    pub fn decode_command(&self, bytes: &[u8]) -> Result<Command> {
        let mut decoder = FrameCodec::new(self.family);
        decoder.push(bytes);
        match decoder.next_command()? {
            Some(Ok(command)) => Ok(command),
            Some(Err(malformed)) => Err(PowerMonitorError::configuration(format!(
                "malformed {} command: {malformed}",
                self.family
            ))),
            None => Err(PowerMonitorError::configuration(format!(
                "incomplete {} command frame ({} bytes)",
                self.family,
                bytes.len()
            ))),
        }
    }

    /// Encode an inbound frame, as a device would send it.
    ///
    /// Fields wider than the family's wire format saturate.
    pub fn encode_frame(&self, frame: &Frame) -> Result<Vec<u8>> {
        if let Frame::Malformed(reason) = frame {
            return Err(PowerMonitorError::configuration(format!(
                "cannot encode malformed frame ({reason})"
            )));
        }
        Ok(match self.family {
            HardwareFamily::Lvpm => lvpm::encode_frame(frame),
            HardwareFamily::Hvpm => hvpm::encode_frame(frame),
        })
    }

    /// Append received bytes to the carry-over buffer.
    pub fn push(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Pull the next inbound frame, if a complete one is buffered.
    ///
    /// `Ok(None)` means more bytes are needed.
    pub fn next_frame(&mut self) -> Result<Option<Frame>> {
        let frame = self.pull()?.map(|pulled| match pulled {
            Ok(packet) => {
                let frame = match self.family {
                    HardwareFamily::Lvpm => lvpm::parse_frame(&packet),
                    HardwareFamily::Hvpm => hvpm::parse_frame(&packet),
                };
                frame.unwrap_or_else(Frame::Malformed)
            }
            Err(malformed) => Frame::Malformed(malformed),
        });
        Ok(frame)
    }

    /// Decode every complete frame in `bytes` plus whatever was buffered.
    pub fn decode(&mut self, bytes: &[u8]) -> Vec<Result<Frame>> {
        self.push(bytes);
        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(Ok(frame)),
                Ok(None) => break,
                Err(err) => frames.push(Err(err)),
            }
        }
        frames
    }

    /// Pull the next command, as a device would read it.
    pub(crate) fn next_command(&mut self) -> Result<Option<std::result::Result<Command, MalformedFrame>>> {
        Ok(self.pull()?.map(|pulled| {
            pulled.and_then(|packet| match self.family {
                HardwareFamily::Lvpm => lvpm::parse_command(&packet),
                HardwareFamily::Hvpm => hvpm::parse_command(&packet),
            })
        }))
    }

    fn pull(&mut self) -> Result<Pulled> {
        let sync = match self.family {
            HardwareFamily::Lvpm => lvpm::SYNC,
            HardwareFamily::Hvpm => hvpm::SYNC,
        };
        let skipped = align(&mut self.buffer, sync);
        if skipped > 0 {
            self.discarded += skipped as u64;
            debug!(family = %self.family, skipped, "Discarded bytes before sync marker");
        }
        if self.buffer.len() < sync.len() {
            return Ok(None);
        }

        let scan = match self.family {
            HardwareFamily::Lvpm => lvpm::scan(&self.buffer),
            HardwareFamily::Hvpm => hvpm::scan(&self.buffer),
        };
        match scan {
            Scan::Incomplete => Ok(None),
            Scan::Packet { packet, consumed } => {
                self.buffer.advance(consumed);
                trace!(
                    family = %self.family,
                    frame_type = packet.frame_type,
                    len = packet.payload.len(),
                    "Decoded frame"
                );
                Ok(Some(Ok(packet)))
            }
            Scan::Corrupt { expected, actual } => {
                self.buffer.advance(1);
                Err(PowerMonitorError::Checksum {
                    family: self.family,
                    expected,
                    actual,
                })
            }
            Scan::InvalidLength { declared } => {
                self.buffer.advance(1);
                Ok(Some(Err(MalformedFrame::InvalidLength { declared })))
            }
        }
    }
}

/// Drop bytes until the buffer starts with `sync`, or with a prefix of it
/// that runs into the end of the buffer. Returns the number dropped.
fn align(buffer: &mut BytesMut, sync: &[u8]) -> usize {
    let mut start = 0;
    while start < buffer.len() {
        let window = &buffer[start..];
        let n = window.len().min(sync.len());
        if window[..n] == sync[..n] {
            break;
        }
        start += 1;
    }
    buffer.advance(start);
    start
}

fn sum8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

fn saturate_i16(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}
