//! Stop-and-wait link layer.
//!
//! One request at a time: a frame is sent, the board acknowledges it
//! with a single ACK byte, then answers with exactly one reply frame
//! which the master acknowledges in turn. Unacknowledged or corrupt
//! exchanges are retried a bounded number of times.

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::traits::{Channel, TransportError};
use crate::protocol::constants::{ACK, BAUDRATES, NAK};
use crate::protocol::{FrameReader, Message, MsgType, ReaderStatus};
use crate::common::Side;

/// Link timing and retry parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    /// How long to wait for the ACK of a sent frame.
    pub ack_timeout_ms: u64,
    /// How long to wait for the first byte of a reply.
    pub response_timeout_ms: u64,
    /// How long to wait between consecutive bytes of a reply.
    pub char_timeout_ms: u64,
    /// Attempts per frame before giving up.
    pub max_retries: u32,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            ack_timeout_ms: 500,
            response_timeout_ms: 1000,
            char_timeout_ms: 100,
            max_retries: 5,
        }
    }
}

/// Frame direction, as seen from the master.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Tx,
    Rx,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Tx => write!(f, "TX"),
            Direction::Rx => write!(f, "RX"),
        }
    }
}

/// One traced frame, handed to the trace hook as it crosses the link.
#[derive(Debug)]
pub struct TraceFrame<'a> {
    pub timestamp: SystemTime,
    pub direction: Direction,
    pub bytes: &'a [u8],
    /// Decoded form, absent when the frame failed to decode.
    pub message: Option<&'a Message>,
}

pub type TraceHook = Box<dyn FnMut(&TraceFrame<'_>) + Send>;

/// Stop-and-wait link over an arbitrary byte channel.
pub struct DapiLink<C: Channel> {
    channel: C,
    config: LinkConfig,
    reader: FrameReader,
    hook: Option<TraceHook>,
}

impl<C: Channel> DapiLink<C> {
    pub fn new(channel: C, config: LinkConfig) -> Self {
        Self {
            channel,
            config,
            reader: FrameReader::new(Side::Slave),
            hook: Some(Box::new(tracing_hook)),
        }
    }

    /// Replaces the frame trace hook. `None` disables tracing.
    pub fn set_trace_hook(&mut self, hook: Option<TraceHook>) {
        self.hook = hook;
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn channel(&mut self) -> &mut C {
        &mut self.channel
    }

    fn emit_trace(&mut self, direction: Direction, bytes: &[u8], message: Option<&Message>) {
        if let Some(hook) = self.hook.as_mut() {
            hook(&TraceFrame {
                timestamp: SystemTime::now(),
                direction,
                bytes,
                message,
            });
        }
    }

    /// Sends one frame and waits for its ACK, retrying on silence or
    /// on a NAK.
    pub fn send(&mut self, msg: &Message) -> Result<(), TransportError> {
        let frame = msg.to_bytes();
        let ack_timeout = Duration::from_millis(self.config.ack_timeout_ms);
        let mut last_bad: Option<u8> = None;

        for attempt in 1..=self.config.max_retries {
            self.channel.write(&frame)?;
            self.emit_trace(Direction::Tx, &frame, Some(msg));

            match self.channel.read_byte(ack_timeout)? {
                Some(ACK) => return Ok(()),
                Some(byte) => {
                    warn!(attempt, byte = format_args!("0x{byte:02X}"), "frame not acknowledged");
                    last_bad = Some(byte);
                }
                None => {
                    warn!(attempt, "no acknowledgement");
                    last_bad = None;
                }
            }
        }

        match last_bad {
            Some(byte) => Err(TransportError::BadAck { byte }),
            None => Err(TransportError::NoAck {
                attempts: self.config.max_retries,
            }),
        }
    }

    /// Waits for one reply frame, ACKing it when sound and NAKing
    /// corrupt ones until the retries are exhausted.
    ///
    /// A reply whose type matches neither `expected` nor an error
    /// frame is still acknowledged, then reported as a mismatch.
    pub fn receive(&mut self, expected: MsgType) -> Result<Message, TransportError> {
        let response_timeout = Duration::from_millis(self.config.response_timeout_ms);
        let char_timeout = Duration::from_millis(self.config.char_timeout_ms);

        'attempt: for attempt in 1..=self.config.max_retries {
            self.reader.reset();

            let first = match self.channel.read_byte(response_timeout)? {
                Some(b) => b,
                None => {
                    return Err(TransportError::ResponseTimeout {
                        timeout_ms: self.config.response_timeout_ms,
                    });
                }
            };

            let mut status = self.reader.push(first);
            while status == ReaderStatus::Pending {
                match self.channel.read_byte(char_timeout)? {
                    Some(b) => status = self.reader.push(b),
                    None => {
                        let received = self.reader.raw().len();
                        warn!(attempt, received, "reply stalled mid-frame");
                        self.channel.write(&[NAK])?;
                        continue 'attempt;
                    }
                }
            }

            match status {
                ReaderStatus::Complete(msg) => {
                    self.channel.write(&[ACK])?;
                    let raw = self.reader.raw().to_vec();
                    self.emit_trace(Direction::Rx, &raw, Some(&msg));

                    if !msg.is_error() && msg.mtype() != expected {
                        return Err(TransportError::TypeMismatch {
                            expected,
                            actual: msg.mtype(),
                        });
                    }
                    return Ok(msg);
                }
                ReaderStatus::Ack | ReaderStatus::Nak => {
                    // A lone control byte where a reply belongs.
                    warn!(attempt, "stray control byte instead of a reply");
                }
                ReaderStatus::Failed(e) => {
                    warn!(attempt, error = %e, "corrupt reply, requesting retransmission");
                    let raw = self.reader.raw().to_vec();
                    self.emit_trace(Direction::Rx, &raw, None);
                    self.channel.write(&[NAK])?;
                }
                ReaderStatus::Pending => unreachable!("loop exits on terminal status"),
            }
        }

        Err(TransportError::ReceiveTimeout {
            received: self.reader.raw().len(),
        })
    }

    /// One full exchange: send, then receive a reply of the matching
    /// type.
    pub fn request(&mut self, msg: &Message) -> Result<Message, TransportError> {
        self.send(msg)?;
        self.receive(msg.mtype())
    }

    /// Probes the standard baud rates with `probe` until the board
    /// answers, leaving the channel configured at the detected rate.
    pub fn detect_baud_rate(&mut self, probe: &Message) -> Result<u32, TransportError> {
        for &baud in BAUDRATES {
            debug!(baud, "probing baud rate");
            self.channel.set_baud_rate(baud)?;
            self.channel.flush_input()?;
            match self.request(probe) {
                Ok(_) => {
                    debug!(baud, "board answered");
                    return Ok(baud);
                }
                Err(e) => trace!(baud, error = %e, "no board at this rate"),
            }
        }
        Err(TransportError::BaudNotFound)
    }
}

fn tracing_hook(frame: &TraceFrame<'_>) {
    match frame.message {
        Some(msg) => trace!(dir = %frame.direction, len = frame.bytes.len(), %msg, "frame"),
        None => trace!(dir = %frame.direction, len = frame.bytes.len(), raw = ?frame.bytes, "frame"),
    }
}
