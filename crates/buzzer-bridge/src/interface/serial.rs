//! Serial port interface for the buzzer coordinator
//!
//! Async serial communication using tokio-serial. The coordinator prints one
//! ASCII line per event, so framing is newline based; `\r` is tolerated.

use crate::config::{DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS, MAX_LINE_LENGTH};
use crate::error::{BridgeError, Result};
use crate::interface::{ConnectionState, CoordinatorInterface, TransportMode};
use async_trait::async_trait;
use bytes::BytesMut;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, error, info, trace, warn};

/// Buffer size for reading from serial port
const READ_BUFFER_SIZE: usize = 512;

/// Serial interface to the coordinator
pub struct SerialInterface {
    /// Serial port path
    port_path: PathBuf,

    /// Baud rate
    baud_rate: u32,

    /// Read timeout
    timeout: Duration,

    /// Serial stream (when connected)
    stream: Option<SerialStream>,

    /// Current connection state
    state: ConnectionState,

    /// Bytes received but not yet terminated by a newline
    read_buffer: BytesMut,

    /// Interface name for logging
    name: String,
}

impl SerialInterface {
    /// Create a new serial interface
    pub fn new(port: impl AsRef<Path>) -> Self {
        let port_path = port.as_ref().to_path_buf();
        let name = format!("serial:{}", port_path.display());

        Self {
            port_path,
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            stream: None,
            state: ConnectionState::Disconnected,
            read_buffer: BytesMut::with_capacity(READ_BUFFER_SIZE * 2),
            name,
        }
    }

    /// Create with custom baud rate
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Get the port path
    pub fn port_path(&self) -> &Path {
        &self.port_path
    }

    /// Get the current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Take the next complete line out of the read buffer
    fn try_take_line(&mut self) -> Option<String> {
        loop {
            let Some(pos) = self.read_buffer.iter().position(|b| *b == b'\n') else {
                if self.read_buffer.len() > MAX_LINE_LENGTH {
                    warn!(
                        discarded = self.read_buffer.len(),
                        "Discarding over-long line without terminator"
                    );
                    self.read_buffer.clear();
                }
                return None;
            };

            let raw = self.read_buffer.split_to(pos + 1);
            let mut line = &raw[..pos];
            if line.last() == Some(&b'\r') {
                line = &line[..line.len() - 1];
            }
            if line.is_empty() {
                continue;
            }
            if line.len() > MAX_LINE_LENGTH {
                warn!(length = line.len(), "Discarding over-long line");
                continue;
            }

            let text = String::from_utf8_lossy(line).into_owned();
            trace!(line = %text, "Received line");
            return Some(text);
        }
    }
}

#[async_trait]
impl CoordinatorInterface for SerialInterface {
    async fn connect(&mut self) -> Result<()> {
        if self.state == ConnectionState::Connected {
            return Ok(());
        }

        self.state = ConnectionState::Connecting;
        info!(port = %self.port_path.display(), baud = self.baud_rate, "Connecting to serial port");

        // Check if port exists
        if !self.port_path.exists() {
            self.state = ConnectionState::Disconnected;
            return Err(BridgeError::PortNotFound(
                self.port_path.display().to_string(),
            ));
        }

        let stream = tokio_serial::new(self.port_path.to_string_lossy(), self.baud_rate)
            .timeout(self.timeout)
            .open_native_async()
            .map_err(|e| {
                self.state = ConnectionState::Disconnected;
                BridgeError::PortOpenFailed {
                    port: self.port_path.display().to_string(),
                    reason: e.to_string(),
                }
            })?;

        self.stream = Some(stream);
        self.state = ConnectionState::Connected;
        self.read_buffer.clear();

        info!(port = %self.port_path.display(), "Connected to buzzer coordinator");
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if let Some(stream) = self.stream.take() {
            drop(stream);
        }

        self.state = ConnectionState::Disconnected;
        self.read_buffer.clear();

        info!(port = %self.port_path.display(), "Disconnected from serial port");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected && self.stream.is_some()
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        if let Some(line) = self.try_take_line() {
            return Ok(Some(line));
        }

        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;
        let mut buf = [0u8; READ_BUFFER_SIZE];

        match stream.read(&mut buf).await {
            Ok(0) => {
                // EOF - coordinator unplugged
                self.state = ConnectionState::Disconnected;
                Err(BridgeError::Disconnected)
            }
            Ok(n) => {
                trace!(bytes = n, "Read from serial port");
                self.read_buffer.extend_from_slice(&buf[..n]);
                Ok(self.try_take_line())
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => {
                error!(error = %e, "Serial read error");
                self.state = ConnectionState::Disconnected;
                Err(BridgeError::ReadError(e.to_string()))
            }
        }
    }

    async fn write_line(&mut self, line: &str) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(BridgeError::Disconnected)?;

        debug!(command = line, "Writing command");
        let mut framed = Vec::with_capacity(line.len() + 1);
        framed.extend_from_slice(line.as_bytes());
        framed.push(b'\n');

        stream.write_all(&framed).await.map_err(|e| {
            error!(error = %e, "Serial write error");
            self.state = ConnectionState::Disconnected;
            BridgeError::WriteError(e.to_string())
        })?;

        stream
            .flush()
            .await
            .map_err(|e| BridgeError::WriteError(format!("Flush failed: {}", e)))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn mode(&self) -> TransportMode {
        TransportMode::Serial
    }
}

impl std::fmt::Debug for SerialInterface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialInterface")
            .field("port", &self.port_path)
            .field("baud_rate", &self.baud_rate)
            .field("state", &self.state)
            .field("buffer_len", &self.read_buffer.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_complete_lines() {
        let mut iface = SerialInterface::new("/dev/null");
        iface
            .read_buffer
            .extend_from_slice(b"BUZZER:AA,1\r\nACK:SCAN\npartial");

        assert_eq!(iface.try_take_line().as_deref(), Some("BUZZER:AA,1"));
        assert_eq!(iface.try_take_line().as_deref(), Some("ACK:SCAN"));
        assert_eq!(iface.try_take_line(), None);
        assert_eq!(&iface.read_buffer[..], b"partial");
    }

    #[test]
    fn test_skip_blank_lines() {
        let mut iface = SerialInterface::new("/dev/null");
        iface.read_buffer.extend_from_slice(b"\r\n\nSTATUS:armed=1\n");
        assert_eq!(iface.try_take_line().as_deref(), Some("STATUS:armed=1"));
    }

    #[test]
    fn test_discard_over_long_unterminated() {
        let mut iface = SerialInterface::new("/dev/null");
        iface
            .read_buffer
            .extend_from_slice(&vec![b'x'; MAX_LINE_LENGTH + 1]);

        assert_eq!(iface.try_take_line(), None);
        assert!(iface.read_buffer.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_lossy() {
        let mut iface = SerialInterface::new("/dev/null");
        iface.read_buffer.extend_from_slice(b"ERROR:\xffbad\n");
        let line = iface.try_take_line().unwrap();
        assert!(line.starts_with("ERROR:"));
        assert!(line.ends_with("bad"));
    }

    #[test]
    fn test_interface_state() {
        let iface = SerialInterface::new("/dev/ttyUSB0");
        assert_eq!(iface.state(), ConnectionState::Disconnected);
        assert!(!iface.is_connected());
        assert_eq!(iface.name(), "serial:/dev/ttyUSB0");
    }

    #[tokio::test]
    async fn test_missing_port_not_found() {
        let mut iface = SerialInterface::new("/dev/definitely-not-a-buzzer");
        assert!(matches!(
            iface.connect().await,
            Err(BridgeError::PortNotFound(_))
        ));
    }
}
