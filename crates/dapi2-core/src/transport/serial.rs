//! Serial port channel.
//!
//! Line parameters are fixed by the boards: 8 data bits, no parity,
//! one stop bit. Only the baud rate varies.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, Parity, SerialPort, StopBits};
use tracing::{debug, instrument};

use super::traits::{Channel, TransportError};

pub struct SerialChannel {
    port: Box<dyn SerialPort>,
    name: String,
    baud: u32,
}

impl SerialChannel {
    /// Opens `name` at `baud`, 8N1.
    #[instrument]
    pub fn open(name: &str, baud: u32) -> Result<Self, TransportError> {
        let port = serialport::new(name, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(Duration::from_millis(100))
            .open()
            .map_err(|e| TransportError::OpenFailed {
                port: name.to_string(),
                message: e.to_string(),
            })?;
        debug!(port = name, baud, "serial port open");
        Ok(Self {
            port,
            name: name.to_string(),
            baud,
        })
    }
}

impl Channel for SerialChannel {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        self.port.write_all(bytes)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError> {
        self.port
            .set_timeout(timeout)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        let mut byte = [0u8; 1];
        match self.port.read_exact(&mut byte) {
            Ok(()) => Ok(Some(byte[0])),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.port
            .clear(ClearBuffer::Input)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.port
            .set_baud_rate(baud)
            .map_err(|e| TransportError::Io(std::io::Error::other(e)))?;
        self.baud = baud;
        Ok(())
    }

    fn descriptor(&self) -> String {
        format!("{}@{}", self.name, self.baud)
    }
}

impl std::fmt::Debug for SerialChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialChannel")
            .field("name", &self.name)
            .field("baud", &self.baud)
            .finish()
    }
}
