//! Byte channel abstraction.
//!
//! Defines the `Channel` trait over which the stop-and-wait link runs,
//! allowing different implementations (serial, TCP proxy, mock).

use std::time::Duration;

use thiserror::Error;

use crate::protocol::{MessageError, MsgType};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open {port}: {message}")]
    OpenFailed { port: String, message: String },

    #[error("no acknowledgement after {attempts} attempts")]
    NoAck { attempts: u32 },

    #[error("unexpected acknowledgement byte 0x{byte:02X}")]
    BadAck { byte: u8 },

    #[error("no response within {timeout_ms} ms")]
    ResponseTimeout { timeout_ms: u64 },

    #[error("reply stalled after {received} bytes")]
    ReceiveTimeout { received: usize },

    #[error("malformed reply: {0}")]
    Frame(#[from] MessageError),

    #[error("reply type {actual:?} does not match request type {expected:?}")]
    TypeMismatch { expected: MsgType, actual: MsgType },

    #[error("no board answered on any probed baud rate")]
    BaudNotFound,

    #[error("proxy offers no connection")]
    NoAvailableConnection,

    #[error("proxy has no connection at index {index}")]
    NoConnectionOnIndex { index: u32 },

    #[error("proxy connection list changed, re-enumerate")]
    StorageChanged,

    #[error("no proxy connection selected")]
    NoConnectionSelected,

    #[error("unexpected proxy reply: {reply}")]
    ProxyProtocol { reply: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A half-duplex byte channel to a board.
///
/// Implementations must treat a read timeout as a normal outcome
/// (`Ok(None)`), not an error: the link layer drives its retry logic
/// off that distinction.
pub trait Channel {
    /// Writes all bytes.
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Reads one byte, waiting at most `timeout`. Returns `Ok(None)`
    /// when nothing arrived in time.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, TransportError>;

    /// Discards any pending input.
    fn flush_input(&mut self) -> Result<(), TransportError>;

    /// Reconfigures the line speed. No-op for channels without one.
    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError>;

    /// Human-readable endpoint description for logs.
    fn descriptor(&self) -> String;
}
