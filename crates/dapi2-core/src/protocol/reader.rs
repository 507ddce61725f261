//! Byte-at-a-time frame reassembly.
//!
//! The reader is fed every byte pulled off the line and reports when a
//! complete frame has been assembled and decoded. A single leading ACK
//! or NAK byte is surfaced as its own outcome; anything else starts a
//! frame whose length is taken from the function byte.

use thiserror::Error;

use super::constants::{ACK, CRC_SIZE, FUNC_LEN_MASK, HEADER_SIZE, MAX_FRAME_SIZE, NAK};
use super::message::{Message, MessageError};
use crate::common::Side;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReaderError {
    #[error(transparent)]
    Message(#[from] MessageError),

    #[error("byte fed to a finished reader")]
    Finished,
}

/// Outcome of feeding one byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStatus {
    /// Frame not complete yet.
    Pending,
    /// The byte was a standalone ACK.
    Ack,
    /// The byte was a standalone NAK.
    Nak,
    /// A frame was completed and decoded.
    Complete(Message),
    /// A frame was completed but failed to decode, or the reader was
    /// misused. The reader must be reset before reuse.
    Failed(ReaderError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Waiting for the first byte of a frame.
    Idle,
    /// Function byte seen, collecting the rest of the frame.
    Collecting { remaining: usize },
    /// Terminal, reset required.
    Done,
}

/// Reassembles frames emitted by `sender` from a byte stream.
#[derive(Debug)]
pub struct FrameReader {
    sender: Side,
    state: State,
    buf: Vec<u8>,
}

impl FrameReader {
    pub fn new(sender: Side) -> Self {
        Self {
            sender,
            state: State::Idle,
            buf: Vec::with_capacity(MAX_FRAME_SIZE),
        }
    }

    /// True while a frame is partially assembled.
    pub fn mid_frame(&self) -> bool {
        matches!(self.state, State::Collecting { .. })
    }

    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.buf.clear();
    }

    /// Feeds one byte, returning the reassembly outcome.
    pub fn push(&mut self, byte: u8) -> ReaderStatus {
        match self.state {
            State::Idle => match byte {
                ACK => {
                    self.state = State::Done;
                    ReaderStatus::Ack
                }
                NAK => {
                    self.state = State::Done;
                    ReaderStatus::Nak
                }
                func => {
                    let payload_len = (func & FUNC_LEN_MASK) as usize;
                    self.buf.push(func);
                    self.state = State::Collecting {
                        // Address, payload and CRC still to come.
                        remaining: HEADER_SIZE - 1 + payload_len + CRC_SIZE,
                    };
                    ReaderStatus::Pending
                }
            },
            State::Collecting { remaining } => {
                self.buf.push(byte);
                if remaining > 1 {
                    self.state = State::Collecting {
                        remaining: remaining - 1,
                    };
                    return ReaderStatus::Pending;
                }
                self.state = State::Done;
                match Message::parse(self.sender, &self.buf) {
                    Ok(msg) => ReaderStatus::Complete(msg),
                    Err(e) => ReaderStatus::Failed(e.into()),
                }
            }
            State::Done => ReaderStatus::Failed(ReaderError::Finished),
        }
    }

    /// Raw bytes of the frame assembled so far.
    pub fn raw(&self) -> &[u8] {
        &self.buf
    }
}
