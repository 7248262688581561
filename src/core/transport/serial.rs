//! Serial port transport implementation

use super::{StartupSignal, StartupStatus, Transport, TransportError};
use serde::{Deserialize, Serialize};
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::collections::VecDeque;
use std::io::{Read, Write};
use std::time::{Duration, Instant};

/// Idle step while polling for input
const POLL_STEP: Duration = Duration::from_millis(5);

/// Serial port flow control type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialFlowControl {
    /// No flow control
    #[default]
    None,
    /// Hardware flow control (RTS/CTS)
    Hardware,
    /// Software flow control (XON/XOFF)
    Software,
}

/// Serial port parity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SerialParity {
    /// No parity
    #[default]
    None,
    /// Odd parity
    Odd,
    /// Even parity
    Even,
}

impl std::str::FromStr for SerialParity {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" | "n" => Ok(Self::None),
            "odd" | "o" => Ok(Self::Odd),
            "even" | "e" => Ok(Self::Even),
            _ => Err(()),
        }
    }
}

/// Serial port configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Port name (e.g., COM3, /dev/ttyUSB0)
    pub port: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity
    pub parity: SerialParity,
    /// Flow control
    pub flow_control: SerialFlowControl,
}

impl SerialConfig {
    /// Create a new serial configuration with default settings
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: 8,
            stop_bits: 1,
            parity: SerialParity::None,
            flow_control: SerialFlowControl::None,
        }
    }

    /// Set data bits
    #[must_use]
    pub fn data_bits(mut self, bits: u8) -> Self {
        self.data_bits = bits;
        self
    }

    /// Set stop bits
    #[must_use]
    pub fn stop_bits(mut self, bits: u8) -> Self {
        self.stop_bits = bits;
        self
    }

    /// Set parity
    #[must_use]
    pub fn parity(mut self, parity: SerialParity) -> Self {
        self.parity = parity;
        self
    }

    /// Set flow control
    #[must_use]
    pub fn flow_control(mut self, flow: SerialFlowControl) -> Self {
        self.flow_control = flow;
        self
    }

    /// Expand `~` on unix hosts; other platforms use the name as given
    pub fn device_path(&self) -> String {
        if cfg!(unix) {
            if let Some(rest) = self.port.strip_prefix("~/") {
                if let Some(home) = directories::BaseDirs::new() {
                    return home.home_dir().join(rest).to_string_lossy().into_owned();
                }
            }
        }
        self.port.clone()
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self::new("/dev/ttyUSB0", 115200)
    }
}

/// Serial port transport
///
/// Device output is decoded as Latin-1 so arbitrary bytes never fail a read;
/// lines are split on `\n`.
pub struct SerialTransport {
    config: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
    partial: Vec<u8>,
    lines: VecDeque<String>,
}

impl SerialTransport {
    /// Create a new serial transport
    pub fn new(config: SerialConfig) -> Self {
        Self {
            config,
            port: None,
            partial: Vec::with_capacity(256),
            lines: VecDeque::new(),
        }
    }

    /// Port configuration
    pub fn config(&self) -> &SerialConfig {
        &self.config
    }

    fn open(&self) -> Result<Box<dyn SerialPort>, TransportError> {
        let data_bits = match self.config.data_bits {
            5 => DataBits::Five,
            6 => DataBits::Six,
            7 => DataBits::Seven,
            _ => DataBits::Eight,
        };

        let stop_bits = match self.config.stop_bits {
            2 => StopBits::Two,
            _ => StopBits::One,
        };

        let parity = match self.config.parity {
            SerialParity::Odd => Parity::Odd,
            SerialParity::Even => Parity::Even,
            SerialParity::None => Parity::None,
        };

        let flow_control = match self.config.flow_control {
            SerialFlowControl::Hardware => FlowControl::Hardware,
            SerialFlowControl::Software => FlowControl::Software,
            SerialFlowControl::None => FlowControl::None,
        };

        let path = self.config.device_path();

        serialport::new(&path, self.config.baud_rate)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .parity(parity)
            .flow_control(flow_control)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| match e.kind() {
                serialport::ErrorKind::NoDevice => TransportError::PortNotFound(path.clone()),
                serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
                    TransportError::PermissionDenied(path.clone())
                }
                serialport::ErrorKind::InvalidInput => TransportError::ConfigError(e.to_string()),
                _ => TransportError::ConnectionFailed(e.to_string()),
            })
    }

    /// Move whatever the port has buffered into `partial`, splitting lines
    fn fill(&mut self) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        let available = port
            .bytes_to_read()
            .map_err(|e| TransportError::ReceiveError(e.to_string()))?;
        if available == 0 {
            return Ok(());
        }

        let mut buffer = vec![0u8; available as usize];
        let n = match port.read(&mut buffer) {
            Ok(n) => n,
            Err(ref e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
            Err(e) => return Err(TransportError::IoError(e)),
        };

        split_lines(&mut self.partial, &buffer[..n], &mut self.lines);
        Ok(())
    }
}

/// Append `bytes` to `partial`, moving each completed line into `lines`.
///
/// Bytes decode as Latin-1. A trailing `\r` is dropped; an unterminated tail
/// stays in `partial` for the next read.
fn split_lines(partial: &mut Vec<u8>, bytes: &[u8], lines: &mut VecDeque<String>) {
    for &byte in bytes {
        if byte == b'\n' {
            if partial.last() == Some(&b'\r') {
                partial.pop();
            }
            lines.push_back(partial.drain(..).map(char::from).collect());
        } else {
            partial.push(byte);
        }
    }
}

impl Transport for SerialTransport {
    fn begin_capture(&mut self, startup: StartupSignal) -> Result<(), TransportError> {
        match self.open() {
            Ok(port) => {
                self.port = Some(port);
                self.partial.clear();
                self.lines.clear();
                tracing::info!("Opened serial port {}", self.describe());
                startup.complete(StartupStatus::Success);
                Ok(())
            }
            Err(e) => {
                startup.complete(StartupStatus::Error);
                Err(e)
            }
        }
    }

    fn poll_readable(&mut self, timeout: Duration) -> Result<bool, TransportError> {
        let deadline = Instant::now() + timeout;

        loop {
            if !self.lines.is_empty() {
                return Ok(true);
            }

            self.fill()?;

            if !self.lines.is_empty() {
                return Ok(true);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    fn read_line(&mut self) -> Result<String, TransportError> {
        self.lines
            .pop_front()
            .ok_or_else(|| TransportError::ReceiveError("no complete line buffered".to_string()))
    }

    fn write_line(&mut self, line: &str) -> Result<(), TransportError> {
        let port = self.port.as_mut().ok_or(TransportError::NotConnected)?;

        // Latin-1: characters outside one byte cannot be sent.
        let mut bytes = Vec::with_capacity(line.len() + 1);
        for ch in line.chars() {
            let code = u32::from(ch);
            let byte = u8::try_from(code)
                .map_err(|_| TransportError::SendError(format!("character {ch:?} is not Latin-1")))?;
            bytes.push(byte);
        }
        bytes.push(b'\n');

        port.write_all(&bytes)?;
        port.flush()?;
        Ok(())
    }

    fn end_capture(&mut self) -> Result<(), TransportError> {
        if self.port.take().is_some() {
            tracing::info!("Closed serial port {}", self.config.port);
        }
        self.partial.clear();
        self.lines.clear();
        Ok(())
    }

    fn describe(&self) -> String {
        format!(
            "{} @ {} baud ({}{}{} {})",
            self.config.port,
            self.config.baud_rate,
            self.config.data_bits,
            match self.config.parity {
                SerialParity::None => "N",
                SerialParity::Odd => "O",
                SerialParity::Even => "E",
            },
            self.config.stop_bits,
            match self.config.flow_control {
                SerialFlowControl::None => "No FC",
                SerialFlowControl::Hardware => "HW FC",
                SerialFlowControl::Software => "SW FC",
            }
        )
    }
}

/// List available serial ports
pub fn list_ports() -> Result<Vec<serialport::SerialPortInfo>, TransportError> {
    serialport::available_ports().map_err(|e| TransportError::IoError(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(chunks: &[&[u8]]) -> (Vec<String>, Vec<u8>) {
        let mut partial = Vec::new();
        let mut lines = VecDeque::new();
        for chunk in chunks {
            split_lines(&mut partial, chunk, &mut lines);
        }
        (lines.into_iter().collect(), partial)
    }

    #[test]
    fn test_split_crlf_across_reads() {
        let (lines, partial) = split(&[b"boot ok\r", b"\nREADY\r\n"]);
        assert_eq!(lines, vec!["boot ok", "READY"]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_split_keeps_partial_tail() {
        let (lines, partial) = split(&[b"temp=4", b"1\nvolt"]);
        assert_eq!(lines, vec!["temp=41"]);
        assert_eq!(partial, b"volt");

        let (lines, _) = split(&[b"temp=4", b"1\nvolt", b"age=3.3\n"]);
        assert_eq!(lines, vec!["temp=41", "voltage=3.3"]);
    }

    #[test]
    fn test_split_decodes_latin1() {
        let (lines, _) = split(&[&[b'T', 0xB0, b'C', 0xFF, b'\n']]);
        assert_eq!(lines, vec!["T\u{b0}C\u{ff}"]);
    }

    #[test]
    fn test_split_empty_and_inner_cr() {
        let (lines, _) = split(&[b"\n\r\na\rb\n"]);
        assert_eq!(lines, vec!["", "", "a\rb"]);
    }

    #[test]
    fn test_describe() {
        let transport = SerialTransport::new(SerialConfig::new("/dev/ttyACM0", 9600).parity(SerialParity::Even));
        assert_eq!(transport.describe(), "/dev/ttyACM0 @ 9600 baud (8E1 No FC)");
    }

    #[test]
    fn test_parity_parse() {
        assert_eq!("E".parse::<SerialParity>(), Ok(SerialParity::Even));
        assert_eq!("none".parse::<SerialParity>(), Ok(SerialParity::None));
        assert!("mark".parse::<SerialParity>().is_err());
    }

    #[test]
    fn test_end_capture_is_idempotent() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        assert!(transport.end_capture().is_ok());
        assert!(transport.end_capture().is_ok());
    }

    #[test]
    fn test_io_before_open() {
        let mut transport = SerialTransport::new(SerialConfig::default());
        assert!(matches!(transport.write_line("x"), Err(TransportError::NotConnected)));
        assert!(transport.read_line().is_err());
    }

    #[test]
    fn test_missing_port_signals_error() {
        let mut transport = SerialTransport::new(SerialConfig::new("/dev/tracewait-does-not-exist", 115200));
        let (signal, rx) = StartupSignal::new();
        assert!(transport.begin_capture(signal).is_err());
        assert_eq!(rx.recv().ok(), Some(StartupStatus::Error));
    }
}
