//! Serial port access
//!
//! The session only talks to a port through the [`Port`] and [`PortOpener`]
//! traits. [`SystemPortOpener`] backs them with the `serialport` crate; tests
//! plug in an in-memory wire instead.

use std::fmt;
use std::io;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, SerialPort};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PortError {
    #[error("Port {0} is busy")]
    Busy(String),

    #[error("Port {0} not found")]
    NotFound(String),

    #[error("Failed to open {port}: {source}")]
    Open {
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Port I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, PortError>;

/// Parity setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Parity {
    #[default]
    None,
    Odd,
    Even,
}

impl Parity {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "n" => Some(Parity::None),
            "odd" | "o" => Some(Parity::Odd),
            "even" | "e" => Some(Parity::Even),
            _ => None,
        }
    }

    fn to_serialport(self) -> serialport::Parity {
        match self {
            Parity::None => serialport::Parity::None,
            Parity::Odd => serialport::Parity::Odd,
            Parity::Even => serialport::Parity::Even,
        }
    }
}

impl fmt::Display for Parity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Parity::None => "none",
            Parity::Odd => "odd",
            Parity::Even => "even",
        })
    }
}

/// Stop bits setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StopBits {
    #[default]
    One,
    Two,
}

impl StopBits {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "1" | "one" => Some(StopBits::One),
            "2" | "two" => Some(StopBits::Two),
            _ => None,
        }
    }

    fn to_serialport(self) -> serialport::StopBits {
        match self {
            StopBits::One => serialport::StopBits::One,
            StopBits::Two => serialport::StopBits::Two,
        }
    }
}

impl fmt::Display for StopBits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StopBits::One => "1",
            StopBits::Two => "2",
        })
    }
}

/// Connection parameters of the physical port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortConfig {
    pub port_name: String,
    pub baud_rate: u32,
    pub parity: Parity,
    pub stop_bits: StopBits,
    /// Read timeout applied after opening
    pub read_timeout: Duration,
}

/// An open port
///
/// Reads are only issued for bytes already reported by
/// [`bytes_to_read`](Port::bytes_to_read), so they return without waiting.
pub trait Port: io::Read + io::Write + Send {
    /// Bytes waiting in the input buffer
    fn bytes_to_read(&self) -> io::Result<usize>;

    /// Drop everything in the input buffer
    fn clear_input(&mut self) -> io::Result<()>;

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()>;
}

/// Acquires ports
pub trait PortOpener: Send + Sync {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn Port>>;
}

/// Port backed by the operating system's serial driver
struct SystemPort {
    inner: Box<dyn SerialPort>,
}

impl io::Read for SystemPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl io::Write for SystemPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Port for SystemPort {
    fn bytes_to_read(&self) -> io::Result<usize> {
        Ok(self.inner.bytes_to_read()? as usize)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(self.inner.clear(ClearBuffer::Input)?)
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        Ok(self.inner.set_timeout(timeout)?)
    }
}

/// Opens real serial ports, 8 data bits, no flow control
pub struct SystemPortOpener;

impl PortOpener for SystemPortOpener {
    fn open(&self, config: &PortConfig) -> Result<Box<dyn Port>> {
        let inner = serialport::new(&config.port_name, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(config.parity.to_serialport())
            .stop_bits(config.stop_bits.to_serialport())
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout)
            .open()
            .map_err(|e| classify_open_error(&config.port_name, e))?;

        Ok(Box::new(SystemPort { inner }))
    }
}

/// Sort an open failure into busy / missing / other
fn classify_open_error(port: &str, error: serialport::Error) -> PortError {
    let description = error.description.to_lowercase();
    let busy = description.contains("busy")
        || description.contains("denied")
        || description.contains("in use");

    match error.kind() {
        serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied) => PortError::Busy(port.to_string()),
        _ if busy => PortError::Busy(port.to_string()),
        serialport::ErrorKind::NoDevice | serialport::ErrorKind::Io(io::ErrorKind::NotFound) => {
            PortError::NotFound(port.to_string())
        }
        _ => PortError::Open {
            port: port.to_string(),
            source: error,
        },
    }
}

/// Names of the serial ports present on this machine
pub fn available_ports() -> Result<Vec<String>> {
    let mut names: Vec<String> = serialport::available_ports()
        .map_err(|e| PortError::Io(e.into()))?
        .into_iter()
        .map(|info| info.port_name)
        .collect();
    names.sort();
    names.dedup();
    Ok(names)
}
