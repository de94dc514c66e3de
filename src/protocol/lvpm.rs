//! LVPM framing.
//!
//! ```text
//! 0x7E | len:u8 | type:u8 | payload | sum8
//! ```
//!
//! `len` counts `type`, `payload` and the checksum byte. `sum8` is the
//! wrapping byte sum of `len`, `type` and `payload`. Multi-byte fields are
//! big-endian; ADC codes are 16 bits wide.

use super::{saturate_i16, sum8, Command, Frame, MalformedFrame, Packet, Scan};
use crate::types::{Channel, DeviceStatus, Granularity, Origin, RawSample, Reading, UsbPassthrough};
use bytes::{Buf, BufMut, BytesMut};

pub(super) const SYNC: &[u8] = &[0x7E];

const MAX_LEN: usize = 64;

// Host to device
const CMD_START_SAMPLING: u8 = 0x01;
const CMD_STOP_SAMPLING: u8 = 0x02;
const CMD_READ_CALIBRATION: u8 = 0x03;
const CMD_READ_READING: u8 = 0x04;
const CMD_SET_POWER: u8 = 0x05;
const CMD_GET_STATUS: u8 = 0x06;
const CMD_SET_VOLTAGE: u8 = 0x07;
const CMD_SET_USB_PASSTHROUGH: u8 = 0x08;

// Device to host
const FRAME_DATA: u8 = 0x10;
const FRAME_CALIBRATION: u8 = 0x11;
const FRAME_STATUS: u8 = 0x12;
const FRAME_READING: u8 = 0x13;

pub(super) fn scan(buf: &[u8]) -> Scan {
    if buf.len() < 2 {
        return Scan::Incomplete;
    }
    let len = usize::from(buf[1]);
    if !(2..=MAX_LEN).contains(&len) {
        return Scan::InvalidLength { declared: len };
    }
    let total = 2 + len;
    if buf.len() < total {
        return Scan::Incomplete;
    }
    let expected = sum8(&buf[1..total - 1]);
    let actual = buf[total - 1];
    if expected != actual {
        return Scan::Corrupt {
            expected: u16::from(expected),
            actual: u16::from(actual),
        };
    }
    Scan::Packet {
        packet: Packet::new(buf[2], buf[3..total - 1].to_vec()),
        consumed: total,
    }
}

fn encode_packet(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let len = payload.len() + 2;
    let mut out = BytesMut::with_capacity(len + 2);
    out.put_u8(SYNC[0]);
    out.put_u8(len as u8);
    out.put_u8(frame_type);
    out.put_slice(payload);
    let checksum = sum8(&out[1..]);
    out.put_u8(checksum);
    out.to_vec()
}

pub(super) fn encode_command(command: &Command) -> Vec<u8> {
    let mut payload = BytesMut::new();
    let frame_type = match *command {
        Command::StartSampling { rate_hz } => {
            payload.put_u16(rate_hz);
            CMD_START_SAMPLING
        }
        Command::StopSampling => CMD_STOP_SAMPLING,
        Command::ReadCalibration => CMD_READ_CALIBRATION,
        Command::ReadReading(kind) => {
            payload.put_u8(kind.code());
            CMD_READ_READING
        }
        Command::SetPower(on) => {
            payload.put_u8(u8::from(on));
            CMD_SET_POWER
        }
        Command::GetStatus => CMD_GET_STATUS,
        Command::SetVoltage { millivolts } => {
            payload.put_u16(millivolts);
            CMD_SET_VOLTAGE
        }
        Command::SetUsbPassthrough(mode) => {
            payload.put_u8(mode.code());
            CMD_SET_USB_PASSTHROUGH
        }
    };
    encode_packet(frame_type, &payload)
}

pub(super) fn parse_command(packet: &Packet) -> Result<Command, MalformedFrame> {
    match packet.frame_type {
        CMD_START_SAMPLING => {
            let mut body = packet.body(2)?;
            Ok(Command::StartSampling {
                rate_hz: body.get_u16(),
            })
        }
        CMD_STOP_SAMPLING => packet.body(0).map(|_| Command::StopSampling),
        CMD_READ_CALIBRATION => packet.body(0).map(|_| Command::ReadCalibration),
        CMD_READ_READING => {
            let body = packet.body(1)?;
            Ok(Command::ReadReading(packet.code("reading", body[0], Reading::from_code)?))
        }
        CMD_SET_POWER => {
            let body = packet.body(1)?;
            match body[0] {
                0 => Ok(Command::SetPower(false)),
                1 => Ok(Command::SetPower(true)),
                value => Err(MalformedFrame::BadField {
                    frame_type: packet.frame_type,
                    field: "power",
                    value,
                }),
            }
        }
        CMD_GET_STATUS => packet.body(0).map(|_| Command::GetStatus),
        CMD_SET_VOLTAGE => {
            let mut body = packet.body(2)?;
            Ok(Command::SetVoltage {
                millivolts: body.get_u16(),
            })
        }
        CMD_SET_USB_PASSTHROUGH => {
            let body = packet.body(1)?;
            Ok(Command::SetUsbPassthrough(packet.code(
                "usb_passthrough",
                body[0],
                UsbPassthrough::from_code,
            )?))
        }
        other => Err(MalformedFrame::UnknownType(other)),
    }
}

pub(super) fn encode_frame(frame: &Frame) -> Vec<u8> {
    let mut payload = BytesMut::new();
    let frame_type = match *frame {
        Frame::Data(sample) => {
            payload.put_u8(sample.channel.code());
            payload.put_u8(sample.granularity.code());
            // 16-bit sequence counter wraps
            payload.put_u16(sample.sequence as u16);
            payload.put_i16(saturate_i16(sample.raw));
            match sample.voltage_raw {
                Some(voltage) => {
                    payload.put_u8(1);
                    payload.put_u16(voltage);
                }
                None => {
                    payload.put_u8(0);
                    payload.put_u16(0);
                }
            }
            FRAME_DATA
        }
        Frame::Calibration {
            channel,
            granularity,
            origin,
            value,
        } => {
            payload.put_u8(channel.code());
            payload.put_u8(granularity.code());
            payload.put_u8(origin.code());
            payload.put_i16(saturate_i16(value));
            FRAME_CALIBRATION
        }
        Frame::Status(status) => {
            payload.put_u8(status.code);
            payload.put_u8(status.firmware_version);
            payload.put_u16(u16::try_from(status.serial).unwrap_or(u16::MAX));
            FRAME_STATUS
        }
        Frame::Reading { kind, raw } => {
            payload.put_u8(kind.code());
            payload.put_i16(saturate_i16(raw));
            FRAME_READING
        }
        Frame::Malformed(_) => return Vec::new(),
    };
    encode_packet(frame_type, &payload)
}

pub(super) fn parse_frame(packet: &Packet) -> Result<Frame, MalformedFrame> {
    match packet.frame_type {
        FRAME_DATA => {
            let mut body = packet.body(9)?;
            let channel = packet.code("channel", body.get_u8(), Channel::from_code)?;
            let granularity = packet.code("granularity", body.get_u8(), Granularity::from_code)?;
            let sequence = u32::from(body.get_u16());
            let raw = i32::from(body.get_i16());
            let has_voltage = body.get_u8();
            let voltage = body.get_u16();
            let voltage_raw = match has_voltage {
                0 => None,
                1 => Some(voltage),
                value => {
                    return Err(MalformedFrame::BadField {
                        frame_type: packet.frame_type,
                        field: "voltage_flag",
                        value,
                    })
                }
            };
            Ok(Frame::Data(RawSample {
                channel,
                granularity,
                raw,
                sequence,
                voltage_raw,
            }))
        }
        FRAME_CALIBRATION => {
            let mut body = packet.body(5)?;
            Ok(Frame::Calibration {
                channel: packet.code("channel", body.get_u8(), Channel::from_code)?,
                granularity: packet.code("granularity", body.get_u8(), Granularity::from_code)?,
                origin: packet.code("origin", body.get_u8(), Origin::from_code)?,
                value: i32::from(body.get_i16()),
            })
        }
        FRAME_STATUS => {
            let mut body = packet.body(4)?;
            Ok(Frame::Status(DeviceStatus {
                code: body.get_u8(),
                firmware_version: body.get_u8(),
                serial: u32::from(body.get_u16()),
            }))
        }
        FRAME_READING => {
            let mut body = packet.body(3)?;
            Ok(Frame::Reading {
                kind: packet.code("reading", body.get_u8(), Reading::from_code)?,
                raw: i32::from(body.get_i16()),
            })
        }
        other => Err(MalformedFrame::UnknownType(other)),
    }
}
