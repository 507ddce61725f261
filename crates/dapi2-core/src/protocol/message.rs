//! Message codec.
//!
//! A frame on the wire is `func, addr, payload.., crc_hi, crc_lo`. The
//! function byte packs an extension flag (bit 7, refused), an error
//! flag (bit 6), the message type (bits 5..4) and the payload length
//! (bits 3..0). Both peers use the same layout; the sender side
//! disambiguates request from reply.

use std::fmt;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use thiserror::Error;

use super::constants::{
    CRC_SIZE, FUNC_ERR_MASK, FUNC_EXT_MASK, FUNC_LEN_MASK, HEADER_SIZE, MAX_DATA_SIZE, MsgType,
};
use super::crc::checksum;
use crate::common::Side;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("frame too short ({actual} bytes)")]
    TooShort { actual: usize },

    #[error("declared payload length {declared} does not match frame ({actual} payload bytes)")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("CRC mismatch: computed 0x{computed:04X}, received 0x{received:04X}")]
    CrcMismatch { computed: u16, received: u16 },

    #[error("extension bit set in function byte 0x{func:02X}")]
    Extension { func: u8 },

    #[error("reserved message type in function byte 0x{func:02X}")]
    ReservedType { func: u8 },

    #[error("payload too long ({len} bytes)")]
    PayloadTooLong { len: usize },

    #[error("invalid {what} payload ({len} bytes)")]
    InvalidPayload { what: &'static str, len: usize },

    #[error("invalid read length {count}")]
    InvalidReadLength { count: usize },
}

/// Fixed-capacity frame payload (at most 8 bytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Payload {
    bytes: [u8; MAX_DATA_SIZE],
    len: u8,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_slice(data: &[u8]) -> Result<Self, MessageError> {
        if data.len() > MAX_DATA_SIZE {
            return Err(MessageError::PayloadTooLong { len: data.len() });
        }
        let mut bytes = [0u8; MAX_DATA_SIZE];
        bytes[..data.len()].copy_from_slice(data);
        Ok(Self {
            bytes,
            len: data.len() as u8,
        })
    }

    /// Appends one byte. Panics if the payload would exceed 8 bytes.
    pub fn with_byte(mut self, value: u8) -> Self {
        assert!((self.len as usize) < MAX_DATA_SIZE, "payload overflow");
        self.bytes[self.len as usize] = value;
        self.len += 1;
        self
    }

    /// Appends a big-endian word. Panics if the payload would exceed 8 bytes.
    pub fn with_word(mut self, value: u16) -> Self {
        assert!((self.len as usize) + 2 <= MAX_DATA_SIZE, "payload overflow");
        BigEndian::write_u16(&mut self.bytes[self.len as usize..], value);
        self.len += 2;
        self
    }

    /// Appends a big-endian double word. Panics if the payload would
    /// exceed 8 bytes.
    pub fn with_dword(mut self, value: u32) -> Self {
        assert!((self.len as usize) + 4 <= MAX_DATA_SIZE, "payload overflow");
        BigEndian::write_u32(&mut self.bytes[self.len as usize..], value);
        self.len += 4;
        self
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn byte(&self, index: usize) -> Option<u8> {
        self.as_slice().get(index).copied()
    }

    /// Big-endian word at word index `index` (0 = first two bytes).
    pub fn word(&self, index: usize) -> Option<u16> {
        let offset = index * 2;
        if offset + 2 <= self.len() {
            Some(BigEndian::read_u16(&self.bytes[offset..]))
        } else {
            None
        }
    }

    pub fn dword(&self, index: usize) -> Option<u32> {
        let offset = index * 4;
        if offset + 4 <= self.len() {
            Some(BigEndian::read_u32(&self.bytes[offset..]))
        } else {
            None
        }
    }

    pub fn words(&self) -> impl Iterator<Item = u16> + '_ {
        self.as_slice().chunks_exact(2).map(BigEndian::read_u16)
    }
}

/// A decoded DAPI message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    /// Master asks for `count` bytes of registers starting at `addr`.
    ReadReg { addr: u8, count: u8 },
    /// Board returns register values starting at `addr`.
    RegValues { addr: u8, data: Payload },
    /// Master writes register values starting at `addr`.
    WriteReg { addr: u8, data: Payload },
    /// Board echoes the written values.
    RegWritten { addr: u8, data: Payload },
    /// Master issues a command.
    Command { cmd: u8, data: Payload },
    /// Board answers a command.
    Response { cmd: u8, data: Payload },
    /// Board refuses a request.
    Error { mtype: MsgType, addr: u8, code: u8 },
}

impl Message {
    /// Read request. `count` is in bytes and must be even, 2..=8.
    pub fn read_reg(addr: u8, count: usize) -> Result<Self, MessageError> {
        if count == 0 || count > MAX_DATA_SIZE || count % 2 != 0 {
            return Err(MessageError::InvalidReadLength { count });
        }
        Ok(Message::ReadReg {
            addr,
            count: count as u8,
        })
    }

    pub fn write_reg(addr: u8, values: &[u16]) -> Result<Self, MessageError> {
        Ok(Message::WriteReg {
            addr,
            data: words_payload(values)?,
        })
    }

    pub fn reg_values(addr: u8, values: &[u16]) -> Result<Self, MessageError> {
        Ok(Message::RegValues {
            addr,
            data: words_payload(values)?,
        })
    }

    pub fn command(cmd: u8, data: Payload) -> Self {
        Message::Command { cmd, data }
    }

    pub fn response(cmd: u8, data: Payload) -> Self {
        Message::Response { cmd, data }
    }

    pub fn error(mtype: MsgType, addr: u8, code: u8) -> Self {
        Message::Error { mtype, addr, code }
    }

    pub fn mtype(&self) -> MsgType {
        match self {
            Message::ReadReg { .. } | Message::RegValues { .. } => MsgType::Read,
            Message::WriteReg { .. } | Message::RegWritten { .. } => MsgType::Write,
            Message::Command { .. } | Message::Response { .. } => MsgType::Command,
            Message::Error { mtype, .. } => *mtype,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Message::Error { .. })
    }

    /// Register address or command identifier (second frame byte).
    pub fn addr(&self) -> u8 {
        match self {
            Message::ReadReg { addr, .. }
            | Message::RegValues { addr, .. }
            | Message::WriteReg { addr, .. }
            | Message::RegWritten { addr, .. }
            | Message::Error { addr, .. } => *addr,
            Message::Command { cmd, .. } | Message::Response { cmd, .. } => *cmd,
        }
    }

    pub fn error_code(&self) -> Option<u8> {
        match self {
            Message::Error { code, .. } => Some(*code),
            _ => None,
        }
    }

    fn payload(&self) -> Payload {
        match self {
            Message::ReadReg { count, .. } => Payload::new().with_byte(*count),
            Message::RegValues { data, .. }
            | Message::WriteReg { data, .. }
            | Message::RegWritten { data, .. }
            | Message::Command { data, .. }
            | Message::Response { data, .. } => *data,
            Message::Error { code, .. } => Payload::new().with_byte(*code),
        }
    }

    fn func(&self) -> u8 {
        let payload_len = self.payload().len() as u8;
        let err = if self.is_error() { FUNC_ERR_MASK } else { 0 };
        err | self.mtype() as u8 | (payload_len & FUNC_LEN_MASK)
    }

    /// Serializes to a complete frame, CRC included.
    pub fn to_bytes(&self) -> Vec<u8> {
        let payload = self.payload();
        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len() + CRC_SIZE);
        frame.push(self.func());
        frame.push(self.addr());
        frame.extend_from_slice(payload.as_slice());
        let crc = checksum(&frame);
        frame.write_u16::<BigEndian>(crc).ok();
        frame
    }

    /// Decodes a complete frame emitted by `sender`, verifying length
    /// and CRC.
    pub fn parse(sender: Side, frame: &[u8]) -> Result<Self, MessageError> {
        if frame.len() < HEADER_SIZE + CRC_SIZE {
            return Err(MessageError::TooShort {
                actual: frame.len(),
            });
        }
        let func = frame[0];
        let addr = frame[1];
        let declared = (func & FUNC_LEN_MASK) as usize;
        let actual = frame.len() - HEADER_SIZE - CRC_SIZE;
        if declared != actual {
            return Err(MessageError::LengthMismatch { declared, actual });
        }

        let computed = checksum(&frame[..frame.len() - CRC_SIZE]);
        let received = BigEndian::read_u16(&frame[frame.len() - CRC_SIZE..]);
        if computed != received {
            return Err(MessageError::CrcMismatch { computed, received });
        }

        if func & FUNC_EXT_MASK != 0 {
            return Err(MessageError::Extension { func });
        }

        let mtype = MsgType::from_func(func);
        if mtype == MsgType::Reserved {
            return Err(MessageError::ReservedType { func });
        }

        let data = Payload::from_slice(&frame[HEADER_SIZE..frame.len() - CRC_SIZE])?;

        if func & FUNC_ERR_MASK != 0 {
            if data.len() != 1 {
                return Err(MessageError::InvalidPayload {
                    what: "error",
                    len: data.len(),
                });
            }
            return Ok(Message::Error {
                mtype,
                addr,
                code: data.bytes[0],
            });
        }

        match (mtype, sender) {
            (MsgType::Read, Side::Master) => {
                if data.len() != 1 {
                    return Err(MessageError::InvalidPayload {
                        what: "read request",
                        len: data.len(),
                    });
                }
                let count = data.bytes[0];
                if count == 0 || count as usize > MAX_DATA_SIZE || count % 2 != 0 {
                    return Err(MessageError::InvalidReadLength {
                        count: count as usize,
                    });
                }
                Ok(Message::ReadReg { addr, count })
            }
            (MsgType::Read, Side::Slave) => {
                check_word_payload("read reply", &data)?;
                Ok(Message::RegValues { addr, data })
            }
            (MsgType::Write, Side::Master) => {
                check_word_payload("write request", &data)?;
                Ok(Message::WriteReg { addr, data })
            }
            (MsgType::Write, Side::Slave) => {
                check_word_payload("write echo", &data)?;
                Ok(Message::RegWritten { addr, data })
            }
            (MsgType::Command, Side::Master) => Ok(Message::Command { cmd: addr, data }),
            (MsgType::Command, Side::Slave) => Ok(Message::Response { cmd: addr, data }),
            (MsgType::Reserved, _) => unreachable!("rejected above"),
        }
    }
}

fn words_payload(values: &[u16]) -> Result<Payload, MessageError> {
    if values.is_empty() || values.len() * 2 > MAX_DATA_SIZE {
        return Err(MessageError::PayloadTooLong {
            len: values.len() * 2,
        });
    }
    let mut payload = Payload::new();
    for &v in values {
        payload = payload.with_word(v);
    }
    Ok(payload)
}

fn check_word_payload(what: &'static str, data: &Payload) -> Result<(), MessageError> {
    if data.is_empty() || data.len() % 2 != 0 {
        return Err(MessageError::InvalidPayload {
            what,
            len: data.len(),
        });
    }
    Ok(())
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Message::ReadReg { addr, count } => {
                write!(f, "read {count} bytes @0x{addr:02X}")
            }
            Message::RegValues { addr, data } => {
                write!(f, "values @0x{addr:02X}")?;
                fmt_words(f, data)
            }
            Message::WriteReg { addr, data } => {
                write!(f, "write @0x{addr:02X}")?;
                fmt_words(f, data)
            }
            Message::RegWritten { addr, data } => {
                write!(f, "written @0x{addr:02X}")?;
                fmt_words(f, data)
            }
            Message::Command { cmd, data } => {
                write!(f, "command 0x{cmd:02X} {:02X?}", data.as_slice())
            }
            Message::Response { cmd, data } => {
                write!(f, "response 0x{cmd:02X} {:02X?}", data.as_slice())
            }
            Message::Error { mtype, addr, code } => {
                write!(f, "error 0x{code:02X} on {mtype:?} @0x{addr:02X}")
            }
        }
    }
}

fn fmt_words(f: &mut fmt::Formatter<'_>, data: &Payload) -> fmt::Result {
    write!(f, " [")?;
    for (i, w) in data.words().enumerate() {
        if i > 0 {
            write!(f, ", ")?;
        }
        write!(f, "0x{w:04X}")?;
    }
    write!(f, "]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::constants::MsgType;

    #[test]
    fn test_read_request_roundtrip() {
        let msg = Message::read_reg(0x10, 8).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 0x01); // READ, len 1
        assert_eq!(bytes[1], 0x10);
        assert_eq!(bytes[2], 8);
        assert_eq!(bytes.len(), 5);

        let parsed = Message::parse(Side::Master, &bytes).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn test_write_roundtrip() {
        let msg = Message::write_reg(0x21, &[0x1234, 0x5678]).unwrap();
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 0x14); // WRITE, len 4
        assert_eq!(&bytes[2..6], &[0x12, 0x34, 0x56, 0x78]);

        let parsed = Message::parse(Side::Master, &bytes).unwrap();
        assert_eq!(parsed, msg);

        // The same frame coming from the board is a write echo.
        let echo = Message::parse(Side::Slave, &bytes).unwrap();
        assert!(matches!(echo, Message::RegWritten { addr: 0x21, .. }));
    }

    #[test]
    fn test_command_no_payload() {
        let msg = Message::command(0x41, Payload::new());
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 0x20); // COMMAND, len 0
        assert_eq!(bytes[1], 0x41);
        assert_eq!(bytes.len(), 4);
    }

    #[test]
    fn test_error_frame() {
        let msg = Message::error(MsgType::Write, 0x05, 0x02);
        let bytes = msg.to_bytes();
        assert_eq!(bytes[0], 0x51); // WRITE | ERR, len 1
        let parsed = Message::parse(Side::Slave, &bytes).unwrap();
        assert_eq!(parsed.error_code(), Some(0x02));
        assert_eq!(parsed.mtype(), MsgType::Write);
    }

    #[test]
    fn test_crc_mismatch_rejected() {
        let mut bytes = Message::read_reg(0x10, 2).unwrap().to_bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(
            Message::parse(Side::Master, &bytes),
            Err(MessageError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_extension_bit_refused() {
        let msg = Message::read_reg(0x10, 2).unwrap();
        let mut bytes = msg.to_bytes();
        bytes[0] |= 0x80;
        // Fix up the CRC so only the extension check trips.
        let crc = crate::protocol::crc::checksum(&bytes[..3]);
        let len = bytes.len();
        bytes[len - 2..].copy_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Message::parse(Side::Master, &bytes),
            Err(MessageError::Extension { .. })
        ));
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let mut bytes = Message::read_reg(0x10, 2).unwrap().to_bytes();
        bytes.insert(3, 0x00);
        assert!(matches!(
            Message::parse(Side::Master, &bytes),
            Err(MessageError::LengthMismatch { .. })
        ));
    }

    #[test]
    fn test_odd_write_payload_rejected() {
        // Hand-build a write frame with 3 payload bytes.
        let mut frame = vec![0x13, 0x21, 0x01, 0x02, 0x03];
        let crc = crate::protocol::crc::checksum(&frame);
        frame.extend_from_slice(&crc.to_be_bytes());
        assert!(matches!(
            Message::parse(Side::Master, &frame),
            Err(MessageError::InvalidPayload { .. })
        ));
    }

    #[test]
    fn test_payload_accessors() {
        let p = Payload::new().with_byte(0x03).with_word(0xE8E8);
        assert_eq!(p.len(), 3);
        assert_eq!(p.byte(0), Some(0x03));
        assert_eq!(p.as_slice(), &[0x03, 0xE8, 0xE8]);

        let p = Payload::new().with_dword(0x0001_0000);
        assert_eq!(p.dword(0), Some(0x0001_0000));
        assert_eq!(p.word(0), Some(0x0001));
    }
}
