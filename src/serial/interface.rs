use std::io::{Read, Write};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortType, StopBits};

use super::{Result, SerialError, SerialPortInfo};

pub const BAUD_RATE: u32 = 115200;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

// Descriptions reported by the SEGGER debug probe's CDC UART
pub const MARKED_PORT_PREFIXES: [&str; 2] = ["JLink", "J-Link"];

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Byte-level link to the pacemaker.
///
/// `read_data` never blocks past its timeout. A short count means the deadline
/// elapsed before the buffer filled; it is not an error.
#[async_trait]
pub trait Transport: Send {
    /// Write all bytes and flush
    async fn send_data(&mut self, data: &[u8]) -> Result<usize>;

    /// Read up to `buffer.len()` bytes, waiting at most `timeout`
    async fn read_data(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize>;

    /// Discard anything buffered on the receive side
    fn clear_input(&mut self) -> Result<()>;

    fn close(&mut self);

    fn is_open(&self) -> bool;

    fn name(&self) -> &str;
}

pub struct SerialInterface {
    port: Option<Box<dyn SerialPort>>,
    device_info: Option<SerialPortInfo>,
}

impl SerialInterface {
    pub fn new() -> Self {
        Self {
            port: None,
            device_info: None,
        }
    }

    /// Enumerate all serial endpoints
    pub fn list_ports() -> Result<Vec<SerialPortInfo>> {
        let ports = serialport::available_ports()?;
        Ok(ports.into_iter().map(port_info).collect())
    }

    /// First port whose description carries the debug probe prefix
    pub fn find_marked_port(ports: &[SerialPortInfo]) -> Option<String> {
        ports
            .iter()
            .find(|p| MARKED_PORT_PREFIXES.iter().any(|pre| p.description.starts_with(pre)))
            .map(|p| p.port_name.clone())
    }

    /// Open the port 8N1 at the given rate
    pub fn connect(&mut self, port_name: &str, baud_rate: u32, timeout: Duration) -> Result<()> {
        let port = serialport::new(port_name, baud_rate)
            .timeout(timeout)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .open()
            .map_err(|e| SerialError::ConnectionFailed(e.to_string()))?;

        // Virtual ports (socat, simulators) do not show up in enumeration
        let device_info = serialport::available_ports()
            .ok()
            .and_then(|ports| ports.into_iter().find(|p| p.port_name == port_name))
            .map(port_info)
            .unwrap_or_else(|| SerialPortInfo {
                port_name: port_name.to_string(),
                description: "n/a".to_string(),
                vid: None,
                pid: None,
                serial_number: None,
            });

        self.port = Some(port);
        self.device_info = Some(device_info);

        log::info!("Opened {} at {} baud", port_name, baud_rate);
        Ok(())
    }

    /// Disconnect from the current device
    pub fn disconnect(&mut self) {
        if let Some(device) = &self.device_info {
            log::info!("Closing {}", device.port_name);
        }
        self.port = None;
        self.device_info = None;
    }

    /// Get current device info
    pub fn device_info(&self) -> Option<&SerialPortInfo> {
        self.device_info.as_ref()
    }

    fn port_mut(&mut self) -> Result<&mut Box<dyn SerialPort>> {
        self.port.as_mut().ok_or(SerialError::NotConnected)
    }
}

impl Default for SerialInterface {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for SerialInterface {
    async fn send_data(&mut self, data: &[u8]) -> Result<usize> {
        let port = self.port_mut()?;
        port.write_all(data)?;
        port.flush()?;
        Ok(data.len())
    }

    async fn read_data(&mut self, buffer: &mut [u8], timeout: Duration) -> Result<usize> {
        let port = self.port_mut()?;
        let deadline = Instant::now() + timeout;
        let mut total_read = 0;

        while total_read < buffer.len() {
            match port.bytes_to_read() {
                Ok(0) => {
                    if Instant::now() >= deadline {
                        break;
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(_) => match port.read(&mut buffer[total_read..]) {
                    Ok(n) => total_read += n,
                    Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => break,
                    Err(e) => return Err(SerialError::IoError(e)),
                },
                Err(e) => return Err(SerialError::SerialportError(e)),
            }
        }

        Ok(total_read)
    }

    fn clear_input(&mut self) -> Result<()> {
        self.port_mut()?.clear(ClearBuffer::Input)?;
        Ok(())
    }

    fn close(&mut self) {
        self.disconnect();
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn name(&self) -> &str {
        self.device_info
            .as_ref()
            .map(|d| d.port_name.as_str())
            .unwrap_or("serial")
    }
}

fn port_info(port: serialport::SerialPortInfo) -> SerialPortInfo {
    match port.port_type {
        SerialPortType::UsbPort(usb) => SerialPortInfo {
            description: usb
                .product
                .clone()
                .or_else(|| usb.manufacturer.clone())
                .unwrap_or_else(|| "USB serial".to_string()),
            port_name: port.port_name,
            vid: Some(usb.vid),
            pid: Some(usb.pid),
            serial_number: usb.serial_number,
        },
        SerialPortType::PciPort => SerialPortInfo {
            port_name: port.port_name,
            description: "PCI serial".to_string(),
            vid: None,
            pid: None,
            serial_number: None,
        },
        SerialPortType::BluetoothPort => SerialPortInfo {
            port_name: port.port_name,
            description: "Bluetooth serial".to_string(),
            vid: None,
            pid: None,
            serial_number: None,
        },
        SerialPortType::Unknown => SerialPortInfo {
            port_name: port.port_name,
            description: "n/a".to_string(),
            vid: None,
            pid: None,
            serial_number: None,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(name: &str, description: &str) -> SerialPortInfo {
        SerialPortInfo {
            port_name: name.to_string(),
            description: description.to_string(),
            vid: None,
            pid: None,
            serial_number: None,
        }
    }

    #[test]
    fn test_find_marked_port_returns_first_match() {
        let ports = vec![
            info("/dev/ttyS0", "n/a"),
            info("/dev/ttyACM0", "JLink CDC UART Port"),
            info("/dev/ttyACM1", "J-Link"),
        ];
        assert_eq!(SerialInterface::find_marked_port(&ports).as_deref(), Some("/dev/ttyACM0"));
    }

    #[test]
    fn test_find_marked_port_none() {
        let ports = vec![info("COM1", "Communications Port"), info("COM4", "USB Serial Device")];
        assert!(SerialInterface::find_marked_port(&ports).is_none());
    }

    #[tokio::test]
    async fn test_unopened_interface_reports_not_connected() {
        let mut iface = SerialInterface::new();
        assert!(!iface.is_open());
        let err = iface.send_data(&[0x16]).await.unwrap_err();
        assert!(matches!(err, SerialError::NotConnected));
        // Closing twice is harmless
        iface.close();
        iface.close();
    }
}
