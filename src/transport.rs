//! Serial transport seam.
//!
//! Detection and acquisition only talk to [`Endpoint`] and [`PortOpener`], so
//! tests can substitute scripted endpoints for real hardware. The production
//! implementation is backed by the `serialport` crate.

use serde::{Deserialize, Serialize};
use serialport::{SerialPort, SerialPortType};
use std::io::{self, Read};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not enumerate serial ports: {0}")]
    Enumerate(#[source] serialport::Error),
    #[error("could not open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("serial port error on {port}: {source}")]
    Serial {
        port: String,
        #[source]
        source: serialport::Error,
    },
    #[error("read failed on {port}: {source}")]
    Read {
        port: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} is closed")]
    Closed(String),
}

/// A serial device as reported by the operating system.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    pub name: String,
    pub description: String,
}

impl PortInfo {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }
}

/// An open byte-stream handle.
pub trait Endpoint: Send {
    fn id(&self) -> &str;

    /// Bytes already buffered by the driver, readable without blocking.
    fn bytes_available(&mut self) -> Result<usize, TransportError>;

    /// Read at most `buf.len()` bytes, waiting no longer than `timeout`.
    ///
    /// A read that times out with nothing received returns `Ok(0)`.
    fn read_up_to(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;

    /// Release the underlying device. Calling it twice is harmless.
    fn close(&mut self);

    fn is_open(&self) -> bool;
}

pub trait PortOpener {
    type Endpoint: Endpoint;

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<Self::Endpoint, TransportError>;
}

/// List every serial port the OS knows about, with a readable description.
pub fn enumerate_ports() -> Result<Vec<PortInfo>, TransportError> {
    let ports = serialport::available_ports().map_err(TransportError::Enumerate)?;
    Ok(ports
        .into_iter()
        .map(|port| {
            let description = describe_port_type(&port.port_type);
            PortInfo::new(port.port_name, description)
        })
        .collect())
}

fn describe_port_type(port_type: &SerialPortType) -> String {
    match port_type {
        SerialPortType::UsbPort(info) => {
            let product = info.product.as_deref().unwrap_or("serial device");
            format!("USB {} ({:04x}:{:04x})", product, info.vid, info.pid)
        }
        SerialPortType::BluetoothPort => String::from("Standard Serial over Bluetooth link"),
        SerialPortType::PciPort => String::from("PCI serial port"),
        SerialPortType::Unknown => String::from("Serial port"),
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SerialPortOpener;

impl PortOpener for SerialPortOpener {
    type Endpoint = SerialEndpoint;

    fn open(
        &self,
        port: &str,
        baud_rate: u32,
        read_timeout: Duration,
    ) -> Result<SerialEndpoint, TransportError> {
        let handle = serialport::new(port, baud_rate)
            .timeout(read_timeout)
            .open()
            .map_err(|source| TransportError::Open {
                port: port.to_string(),
                source,
            })?;

        Ok(SerialEndpoint {
            name: port.to_string(),
            port: Some(handle),
            timeout: read_timeout,
        })
    }
}

pub struct SerialEndpoint {
    name: String,
    port: Option<Box<dyn SerialPort>>,
    timeout: Duration,
}

impl SerialEndpoint {
    fn handle(&mut self) -> Result<&mut Box<dyn SerialPort>, TransportError> {
        self.port
            .as_mut()
            .ok_or_else(|| TransportError::Closed(self.name.clone()))
    }
}

impl core::fmt::Debug for SerialEndpoint {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SerialEndpoint")
            .field("name", &self.name)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl Endpoint for SerialEndpoint {
    fn id(&self) -> &str {
        &self.name
    }

    fn bytes_available(&mut self) -> Result<usize, TransportError> {
        let name = self.name.clone();
        let count = self
            .handle()?
            .bytes_to_read()
            .map_err(|source| TransportError::Serial { port: name, source })?;
        Ok(count as usize)
    }

    fn read_up_to(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        let name = self.name.clone();
        if timeout != self.timeout {
            self.handle()?
                .set_timeout(timeout)
                .map_err(|source| TransportError::Serial {
                    port: name.clone(),
                    source,
                })?;
            self.timeout = timeout;
        }

        match self.handle()?.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(source) => Err(TransportError::Read { port: name, source }),
        }
    }

    fn close(&mut self) {
        if self.port.take().is_some() {
            debug!("Closed serial port {}", self.name);
        }
    }

    fn is_open(&self) -> bool {
        self.port.is_some()
    }
}
