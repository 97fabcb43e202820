use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serialport::{SerialPort, SerialPortType};
use tokio::sync::watch;

use super::frame::{Frame, FrameDecoder};
use super::{Connector, DiscoveredDevice, Result, Transport, TransportError};

// Qualcomm (CSR) USB vendor id used by QCC development boards and dongles
pub const QCC_VID: u16 = 0x0A12;
pub const BAUD_RATE: u32 = 115200;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Frame link over a USB serial port.
pub struct SerialLink {
    port_name: String,
    port: Option<Box<dyn SerialPort>>,
    decoder: FrameDecoder,
    link_tx: watch::Sender<bool>,
}

impl SerialLink {
    /// Open the port and mark the link as up.
    pub fn open(port_name: &str) -> Result<Self> {
        let (link_tx, _) = watch::channel(false);
        let mut link = Self {
            port_name: port_name.to_string(),
            port: None,
            decoder: FrameDecoder::new(),
            link_tx,
        };
        link.open_port()?;
        Ok(link)
    }

    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn open_port(&mut self) -> Result<()> {
        let port = serialport::new(&self.port_name, BAUD_RATE)
            .timeout(Duration::from_millis(50))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(self.port_name.clone()),
                _ => TransportError::ConnectionFailed(e.to_string()),
            })?;

        self.port = Some(port);
        self.decoder.clear();
        self.link_tx.send_replace(true);
        log::info!("Serial link open on {}", self.port_name);
        Ok(())
    }

    fn mark_down(&mut self) {
        if self.port.take().is_some() {
            log::warn!("Serial link on {} lost", self.port_name);
        }
        self.link_tx.send_replace(false);
    }
}

#[async_trait]
impl Transport for SerialLink {
    async fn send(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;

        let written = port.write_all(bytes).and_then(|_| port.flush());
        if let Err(e) = written {
            if e.kind() == std::io::ErrorKind::TimedOut {
                return Err(TransportError::Timeout);
            }
            self.mark_down();
            return Err(TransportError::Disconnected);
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<Frame> {
        loop {
            if let Some(frame) = self.decoder.next_frame()? {
                return Ok(frame);
            }

            let port = self.port.as_mut().ok_or(TransportError::Disconnected)?;
            match port.bytes_to_read() {
                Ok(0) => {
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                Ok(available) => {
                    let mut buffer = vec![0u8; available as usize];
                    match port.read(&mut buffer) {
                        Ok(n) => self.decoder.push(&buffer[..n]),
                        Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                        Err(e) => {
                            log::error!("Serial read on {} failed: {}", self.port_name, e);
                            self.mark_down();
                            return Err(TransportError::Disconnected);
                        }
                    }
                }
                Err(e) => {
                    log::error!("Serial status query on {} failed: {}", self.port_name, e);
                    self.mark_down();
                    return Err(TransportError::Disconnected);
                }
            }
        }
    }

    async fn reconnect(&mut self) -> Result<()> {
        self.port = None;
        self.open_port()
    }

    fn disconnect(&mut self) {
        log::info!("Disconnecting from {}", self.port_name);
        self.port = None;
        self.decoder.clear();
        self.link_tx.send_replace(false);
    }

    fn is_connected(&self) -> bool {
        self.port.is_some()
    }

    fn link_state(&self) -> watch::Receiver<bool> {
        self.link_tx.subscribe()
    }
}

/// Finds QCC devices among the host's USB serial ports.
#[derive(Debug, Clone)]
pub struct SerialConnector {
    vendor_id: u16,
}

impl SerialConnector {
    pub fn new() -> Self {
        Self { vendor_id: QCC_VID }
    }

    pub fn with_vendor_id(vendor_id: u16) -> Self {
        Self { vendor_id }
    }
}

impl Default for SerialConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for SerialConnector {
    async fn discover(&self) -> Result<Vec<DiscoveredDevice>> {
        let ports = serialport::available_ports()?;
        let mut devices = Vec::new();

        for port in ports {
            if let SerialPortType::UsbPort(usb_info) = port.port_type {
                if usb_info.vid == self.vendor_id {
                    devices.push(DiscoveredDevice {
                        name: usb_info.product.unwrap_or_else(|| port.port_name.clone()),
                        address: port.port_name,
                    });
                }
            }
        }

        log::debug!("Serial discovery found {} device(s)", devices.len());
        Ok(devices)
    }

    async fn open(&self, address: &str) -> Result<Box<dyn Transport>> {
        Ok(Box::new(SerialLink::open(address)?))
    }
}
