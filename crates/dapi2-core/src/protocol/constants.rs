//! Wire-level constants: control bytes, function byte layout, command
//! and error identifiers.

// ============================================================================
// Control Bytes
// ============================================================================

/// Positive acknowledgement of a received frame.
pub const ACK: u8 = 0x06;

/// Negative acknowledgement (framing or CRC failure).
pub const NAK: u8 = 0x15;

// ============================================================================
// Function Byte Layout
// ============================================================================

/// Extension flag. Reserved for future framing; frames with this bit
/// set are refused.
pub const FUNC_EXT_MASK: u8 = 0x80;

/// Error flag, set by the board on a refused request.
pub const FUNC_ERR_MASK: u8 = 0x40;

/// Message type field (bits 5..4).
pub const FUNC_TYPE_MASK: u8 = 0x30;

/// Payload length field (bits 3..0).
pub const FUNC_LEN_MASK: u8 = 0x0F;

/// Message type carried in the function byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MsgType {
    Read = 0x00,
    Write = 0x10,
    Command = 0x20,
    Reserved = 0x30,
}

impl MsgType {
    pub fn from_func(func: u8) -> Self {
        match func & FUNC_TYPE_MASK {
            0x00 => MsgType::Read,
            0x10 => MsgType::Write,
            0x20 => MsgType::Command,
            _ => MsgType::Reserved,
        }
    }
}

// ============================================================================
// Frame Geometry
// ============================================================================

/// Function byte + address byte.
pub const HEADER_SIZE: usize = 2;

/// Maximum payload carried by one frame.
pub const MAX_DATA_SIZE: usize = 8;

/// Big-endian CRC-16 trailer.
pub const CRC_SIZE: usize = 2;

/// Largest possible frame on the wire.
pub const MAX_FRAME_SIZE: usize = HEADER_SIZE + MAX_DATA_SIZE + CRC_SIZE;

/// Bytes per register value.
pub const REG_SIZE: usize = 2;

/// Registers per read/write frame (payload limit / register size).
pub const MAX_REGS_PER_MSG: usize = MAX_DATA_SIZE / REG_SIZE;

// ============================================================================
// Serial Line
// ============================================================================

/// Baud rates probed during automatic detection, fastest first.
pub const BAUDRATES: &[u32] = &[115_200, 57_600, 38_400, 19_200, 9_600];

// ============================================================================
// Command Identifiers
// ============================================================================

pub mod cmd {
    // System
    pub const REBOOT: u8 = 0x01;
    pub const STANDBY: u8 = 0x02;
    pub const PERIPHERAL_ACTIVATE: u8 = 0x03;
    pub const EMERGENCY_STOP: u8 = 0x04;
    pub const CONNECT: u8 = 0x05;
    pub const DISCONNECT: u8 = 0x06;
    pub const GET_MC_SN: u8 = 0x09;
    pub const BOOT_FLASH: u8 = 0x0A;

    // Motor
    pub const MOTOR_FREEWHEEL_STOP: u8 = 0x20;
    pub const MOTOR_STOP: u8 = 0x21;
    pub const MOTOR_START: u8 = 0x22;
    pub const MOTOR_INC_SPEED: u8 = 0x23;
    pub const MOTOR_DEC_SPEED: u8 = 0x24;
    pub const MOTOR_REVERSE: u8 = 0x25;

    // Light
    pub const LIGHT_OFF: u8 = 0x40;
    pub const LIGHT_ON: u8 = 0x41;
    pub const LIGHT_INTENSITY: u8 = 0x42;
    pub const LIGHT_ALTERNATE: u8 = 0x43;

    // Settings memory
    pub const MEMORY_STORE: u8 = 0x50;
    pub const MEMORY_RECALL: u8 = 0x51;
    pub const MEMORY_READ: u8 = 0x52;
    pub const MEMORY_RESET: u8 = 0x53;
    pub const MEMORY_SET: u8 = 0x54;
    pub const MEMORY_GET: u8 = 0x55;

    // Factory
    pub const FACT_EEPROM_RESET: u8 = 0x80;
    pub const FACT_SET_SYSINFO: u8 = 0x81;
    pub const FACT_SET_SRVINFO: u8 = 0x82;
    pub const FACT_CALIBRATION: u8 = 0x83;

    // Firmware download
    pub const FLASH_BEGIN: u8 = 0x90;
    pub const FLASH_DATA: u8 = 0x91;
    pub const FLASH_END: u8 = 0x92;

    // Debug
    pub const DEBUG_READ: u8 = 0xC2;
    pub const DEBUG_WRITE: u8 = 0xC3;
}

// ============================================================================
// Board Error Codes
// ============================================================================

pub mod errcode {
    pub const OK: u8 = 0x00;
    pub const WRONG_ADDRESS: u8 = 0x01;
    pub const READ_ONLY: u8 = 0x02;
    pub const WRONG_VALUE: u8 = 0x03;
    pub const WRONG_CONTEXT: u8 = 0x04;
    pub const MALFORMED_MESSAGE: u8 = 0x05;
    pub const ACCESS_DENIED: u8 = 0x06;
    pub const EEPROM_FAILURE: u8 = 0x07;
    pub const ABORTED: u8 = 0xFD;
    pub const COM_BROKEN: u8 = 0xFE;
    pub const UNDEFINED: u8 = 0xFF;

    // Command-scoped codes, meaning depends on the refused command.
    pub const CMD_SPECIFIC_1: u8 = 0x81;
    pub const CMD_SPECIFIC_2: u8 = 0x82;
}
