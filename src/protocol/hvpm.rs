//! HVPM framing.
//!
//! ```text
//! 0xAA 0x55 | type:u8 | len:u16 LE | payload | crc16 LE
//! ```
//!
//! The CRC is CRC-16/XMODEM over `type`, `len` and `payload`. Multi-byte
//! fields are little-endian; ADC codes are 32 bits wide.

use super::{Command, Frame, MalformedFrame, Packet, Scan};
use crate::types::{Channel, DeviceStatus, Granularity, Origin, RawSample, Reading, UsbPassthrough};
use bytes::{Buf, BufMut, BytesMut};
use crc::{Crc, CRC_16_XMODEM};

pub(super) const SYNC: &[u8] = &[0xAA, 0x55];

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

const HEADER_LEN: usize = 5;
const CRC_LEN: usize = 2;
const MAX_PAYLOAD: usize = 256;

/// Data frames use this voltage code to mean "no voltage measured".
const NO_VOLTAGE: u16 = 0xFFFF;

// Host to device
const CMD_START_SAMPLING: u8 = 0x81;
const CMD_STOP_SAMPLING: u8 = 0x82;
const CMD_READ_CALIBRATION: u8 = 0x83;
const CMD_READ_READING: u8 = 0x84;
const CMD_SET_POWER: u8 = 0x85;
const CMD_GET_STATUS: u8 = 0x86;
const CMD_SET_VOLTAGE: u8 = 0x87;
const CMD_SET_USB_PASSTHROUGH: u8 = 0x88;

// Device to host
const FRAME_DATA: u8 = 0xC0;
const FRAME_CALIBRATION: u8 = 0xC1;
const FRAME_STATUS: u8 = 0xC2;
const FRAME_READING: u8 = 0xC3;

pub(super) fn scan(buf: &[u8]) -> Scan {
    if buf.len() < HEADER_LEN {
        return Scan::Incomplete;
    }
    let len = usize::from(u16::from_le_bytes([buf[3], buf[4]]));
    if len > MAX_PAYLOAD {
        return Scan::InvalidLength { declared: len };
    }
    let total = HEADER_LEN + len + CRC_LEN;
    if buf.len() < total {
        return Scan::Incomplete;
    }
    let expected = CRC.checksum(&buf[2..HEADER_LEN + len]);
    let actual = u16::from_le_bytes([buf[total - 2], buf[total - 1]]);
    if expected != actual {
        return Scan::Corrupt { expected, actual };
    }
    Scan::Packet {
        packet: Packet::new(buf[2], buf[HEADER_LEN..HEADER_LEN + len].to_vec()),
        consumed: total,
    }
}

fn encode_packet(frame_type: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = BytesMut::with_capacity(HEADER_LEN + payload.len() + CRC_LEN);
    out.put_slice(SYNC);
    out.put_u8(frame_type);
    out.put_u16_le(payload.len() as u16);
    out.put_slice(payload);
    let crc = CRC.checksum(&out[2..]);
    out.put_u16_le(crc);
    out.to_vec()
}

pub(super) fn encode_command(command: &Command) -> Vec<u8> {
    let mut payload = BytesMut::new();
    let frame_type = match *command {
        Command::StartSampling { rate_hz } => {
            payload.put_u16_le(rate_hz);
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
            payload.put_u16_le(millivolts);
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
                rate_hz: body.get_u16_le(),
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
                millivolts: body.get_u16_le(),
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
            payload.put_u32_le(sample.sequence);
            payload.put_i32_le(sample.raw);
            payload.put_u16_le(sample.voltage_raw.map_or(NO_VOLTAGE, |v| v.min(NO_VOLTAGE - 1)));
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
            payload.put_i32_le(value);
            FRAME_CALIBRATION
        }
        Frame::Status(status) => {
            payload.put_u8(status.code);
            payload.put_u8(status.firmware_version);
            payload.put_u32_le(status.serial);
            FRAME_STATUS
        }
        Frame::Reading { kind, raw } => {
            payload.put_u8(kind.code());
            payload.put_i32_le(raw);
            FRAME_READING
        }
        Frame::Malformed(_) => return Vec::new(),
    };
    encode_packet(frame_type, &payload)
}

pub(super) fn parse_frame(packet: &Packet) -> Result<Frame, MalformedFrame> {
    match packet.frame_type {
        FRAME_DATA => {
            let mut body = packet.body(12)?;
            let channel = packet.code("channel", body.get_u8(), Channel::from_code)?;
            let granularity = packet.code("granularity", body.get_u8(), Granularity::from_code)?;
            let sequence = body.get_u32_le();
            let raw = body.get_i32_le();
            let voltage = body.get_u16_le();
            Ok(Frame::Data(RawSample {
                channel,
                granularity,
                raw,
                sequence,
                voltage_raw: (voltage != NO_VOLTAGE).then_some(voltage),
            }))
        }
        FRAME_CALIBRATION => {
            let mut body = packet.body(7)?;
            Ok(Frame::Calibration {
                channel: packet.code("channel", body.get_u8(), Channel::from_code)?,
                granularity: packet.code("granularity", body.get_u8(), Granularity::from_code)?,
                origin: packet.code("origin", body.get_u8(), Origin::from_code)?,
                value: body.get_i32_le(),
            })
        }
        FRAME_STATUS => {
            let mut body = packet.body(6)?;
            Ok(Frame::Status(DeviceStatus {
                code: body.get_u8(),
                firmware_version: body.get_u8(),
                serial: body.get_u32_le(),
            }))
        }
        FRAME_READING => {
            let mut body = packet.body(5)?;
            Ok(Frame::Reading {
                kind: packet.code("reading", body.get_u8(), Reading::from_code)?,
                raw: body.get_i32_le(),
            })
        }
        other => Err(MalformedFrame::UnknownType(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_layout_is_little_endian_with_crc() {
        let bytes = encode_command(&Command::StartSampling { rate_hz: 0x1388 });
        assert_eq!(bytes[..7], [0xAA, 0x55, CMD_START_SAMPLING, 0x02, 0x00, 0x88, 0x13]);
        let crc = CRC.checksum(&bytes[2..7]);
        assert_eq!(bytes[7..], crc.to_le_bytes());
    }

    #[test]
    fn xmodem_check_value() {
        assert_eq!(CRC.checksum(b"123456789"), 0x31C3);
    }

    #[test]
    fn oversized_length_is_invalid() {
        assert_eq!(
            scan(&[0xAA, 0x55, FRAME_DATA, 0x01, 0x02]),
            Scan::InvalidLength { declared: 0x0201 }
        );
        assert_eq!(scan(&[0xAA, 0x55, FRAME_DATA, 0x0C]), Scan::Incomplete);
    }

    #[test]
    fn missing_voltage_uses_sentinel() {
        let frame = Frame::Data(RawSample {
            channel: Channel::Usb,
            granularity: Granularity::Coarse,
            raw: -70_000,
            sequence: 70_000,
            voltage_raw: None,
        });
        let bytes = encode_frame(&frame);
        assert_eq!(bytes[bytes.len() - 4..bytes.len() - 2], NO_VOLTAGE.to_le_bytes());
        let Scan::Packet { packet, consumed } = scan(&bytes) else {
            panic!("expected a packet");
        };
        assert_eq!(consumed, bytes.len());
        assert_eq!(parse_frame(&packet), Ok(frame));
    }
}
