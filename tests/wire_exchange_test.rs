//! Scripted byte-level exchanges through the public transport API.

use futures::future::BoxFuture;
use monsoon_daq::transport::StreamTransport;
use monsoon_daq::{
    Command, DeviceStatus, DynTransport, Frame, FrameCodec, HardwareFamily, Instrument,
    InstrumentConfig, PowerMonitorError, Reading, Result, TransportFactory,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::io::{Builder, Mock};

/// Factory that hands out one scripted link.
fn scripted(io: Mock) -> Arc<dyn TransportFactory> {
    let slot = Arc::new(Mutex::new(Some(StreamTransport::new(io, "scripted"))));
    Arc::new(
        move |_family: HardwareFamily, _serial: u32| -> BoxFuture<'static, Result<DynTransport>> {
            let taken = slot.lock().take();
            Box::pin(async move {
                match taken {
                    Some(transport) => Ok(Box::new(transport) as DynTransport),
                    None => Err(PowerMonitorError::transport("script already used")),
                }
            })
        },
    )
}

fn config(family: HardwareFamily) -> InstrumentConfig {
    let mut config = InstrumentConfig::for_family(family);
    config.drain_on_open = Duration::ZERO;
    config.engine.read_timeout = Duration::from_millis(10);
    config
}

#[tokio::test]
async fn test_hvpm_status_skips_corrupt_frame() {
    let codec = FrameCodec::new(HardwareFamily::Hvpm);
    let status = DeviceStatus {
        code: 0,
        firmware_version: 7,
        serial: 23456,
    };
    let mut corrupt = codec.encode_frame(&Frame::Status(status)).expect("encode");
    let last = corrupt.len() - 1;
    corrupt[last] ^= 0x01;

    let io = Builder::new()
        .write(&codec.encode_command(&Command::GetStatus))
        .read(&[0x00, 0x13])
        .read(&corrupt)
        .read(&codec.encode_frame(&Frame::Status(status)).expect("encode"))
        .build();

    let mut monitor = Instrument::new(
        HardwareFamily::Hvpm,
        23456,
        scripted(io),
        config(HardwareFamily::Hvpm),
    );
    let reported = monitor.status().await.expect("status");
    assert_eq!(reported, status);
    monitor.close().await.expect("close");
}

#[tokio::test]
async fn test_lvpm_gain_reading() {
    let codec = FrameCodec::new(HardwareFamily::Lvpm);
    let io = Builder::new()
        .write(&codec.encode_command(&Command::ReadReading(Reading::GainControl)))
        .read(
            &codec
                .encode_frame(&Frame::Reading {
                    kind: Reading::GainControl,
                    raw: 0x2A,
                })
                .expect("encode"),
        )
        .build();

    let mut monitor = Instrument::new(
        HardwareFamily::Lvpm,
        10,
        scripted(io),
        config(HardwareFamily::Lvpm),
    );
    let gain = monitor.read_reading(Reading::GainControl).await.expect("gain");
    assert_eq!(gain, 42.0);
    monitor.close().await.expect("close");
}
