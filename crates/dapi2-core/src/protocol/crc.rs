//! Frame checksum.
//!
//! Frames are protected by CRC-16/IBM-3740 (poly 0x1021, init 0xFFFF),
//! appended big-endian after the payload.

use crc::{CRC_16_IBM_3740, Crc};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Checksum over the function byte, address and payload.
pub fn checksum(bytes: &[u8]) -> u16 {
    CRC16.checksum(bytes)
}
