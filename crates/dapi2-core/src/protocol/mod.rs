//! Wire protocol: constants, CRC, message codec and frame reassembly.

pub mod constants;
pub mod crc;
pub mod message;
pub mod reader;

pub use constants::{ACK, BAUDRATES, MAX_DATA_SIZE, MAX_REGS_PER_MSG, MsgType, NAK};
pub use message::{Message, MessageError, Payload};
pub use reader::{FrameReader, ReaderError, ReaderStatus};
