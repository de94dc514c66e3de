//! Serial-port transport (feature `serial`).

use super::{DynTransport, StreamTransport, TransportFactory};
use crate::config::TransportSettings;
use crate::error::{PowerMonitorError, Result};
use crate::types::HardwareFamily;
use futures::future::BoxFuture;
use std::collections::HashMap;
use tracing::info;

/// Transport over a real serial port.
pub type SerialTransport = StreamTransport<tokio_serial::SerialStream>;

/// Open a serial port asynchronously using spawn_blocking.
///
/// Standard settings are applied: 8N1, no flow control.
pub async fn open_serial_async(
    port_path: &str,
    baud_rate: u32,
) -> Result<tokio_serial::SerialStream> {
    use tokio::task::spawn_blocking;
    use tokio_serial::SerialPortBuilderExt;

    let port_path_owned = port_path.to_string();

    spawn_blocking(move || {
        tokio_serial::new(&port_path_owned, baud_rate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .map_err(|e| {
                PowerMonitorError::transport(format!(
                    "failed to open serial port {port_path_owned}: {e}"
                ))
            })
    })
    .await
    .map_err(|e| PowerMonitorError::transport(format!("serial open task failed: {e}")))?
}

/// Opens monitors by rendering a port-path template.
///
/// The template may use `{family}` (`LVPM`/`HVPM`), `{type}` (the device-spec
/// type string) and `{serial}`.
#[derive(Debug, Clone)]
pub struct SerialTransportFactory {
    port_template: String,
    baud_rate: u32,
}

impl SerialTransportFactory {
    /// Factory with an explicit template and baud rate.
    pub fn new(port_template: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_template: port_template.into(),
            baud_rate,
        }
    }

    /// Factory configured from the `[transport]` settings section.
    #[must_use]
    pub fn from_settings(settings: &TransportSettings) -> Self {
        Self::new(settings.port_template.clone(), settings.baud_rate)
    }

    /// Port path of one monitor.
    pub fn port_path(&self, family: HardwareFamily, serial: u32) -> Result<String> {
        let vars = HashMap::from([
            ("family".to_string(), family.to_string()),
            ("type".to_string(), family.type_name().to_string()),
            ("serial".to_string(), serial.to_string()),
        ]);
        strfmt::strfmt(&self.port_template, &vars).map_err(|e| {
            PowerMonitorError::configuration(format!(
                "invalid port template '{}': {e}",
                self.port_template
            ))
        })
    }
}

impl TransportFactory for SerialTransportFactory {
    fn connect(&self, family: HardwareFamily, serial: u32) -> BoxFuture<'static, Result<DynTransport>> {
        let path = self.port_path(family, serial);
        let baud_rate = self.baud_rate;
        Box::pin(async move {
            let path = path?;
            let port = open_serial_async(&path, baud_rate).await?;
            info!(%family, serial, path = %path, baud_rate, "Opened serial port");
            let transport: DynTransport = Box::new(StreamTransport::new(port, path));
            Ok::<_, PowerMonitorError>(transport)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_port_template() {
        let factory =
            SerialTransportFactory::new("/dev/serial/by-id/usb-Monsoon_{family}_{serial}-if00", 9600);
        assert_eq!(
            factory.port_path(HardwareFamily::Hvpm, 23456).unwrap(),
            "/dev/serial/by-id/usb-Monsoon_HVPM_23456-if00"
        );

        let factory = SerialTransportFactory::new("/dev/{type}-{serial}", 9600);
        assert_eq!(
            factory.port_path(HardwareFamily::Lvpm, 10).unwrap(),
            "/dev/LvpmStockMonsoon-10"
        );
    }

    #[test]
    fn unknown_placeholder_is_a_configuration_error() {
        let factory = SerialTransportFactory::new("/dev/{port}", 9600);
        let err = factory.port_path(HardwareFamily::Lvpm, 10).unwrap_err();
        assert!(matches!(err, PowerMonitorError::Configuration { .. }));
    }

    #[tokio::test]
    async fn missing_port_fails_to_open() {
        let factory = SerialTransportFactory::new("/nonexistent/monsoon-{serial}", 9600);
        let result = factory.connect(HardwareFamily::Lvpm, 10).await;
        assert!(matches!(result, Err(PowerMonitorError::Transport { .. })));
    }
}
