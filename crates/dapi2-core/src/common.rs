//! Shared primitives: peer sides, access levels, packed date/version words.

use std::fmt;

/// Which peer of the link emitted (or is expected to emit) a frame.
///
/// Function codes are symmetric on the wire, so the decoder needs to
/// know the sender to map a frame onto the right message variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// The controlling host.
    Master,
    /// The board.
    Slave,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Master => write!(f, "master"),
            Side::Slave => write!(f, "slave"),
        }
    }
}

/// Session access level, granted by the `CONNECT` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum AccessLevel {
    No = 0,
    User = 1,
    Service = 2,
    Factory = 3,
}

impl AccessLevel {
    pub fn from_bits(bits: u16) -> Self {
        match bits & 0x3 {
            1 => AccessLevel::User,
            2 => AccessLevel::Service,
            3 => AccessLevel::Factory,
            _ => AccessLevel::No,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            AccessLevel::No => "no",
            AccessLevel::User => "user",
            AccessLevel::Service => "service",
            AccessLevel::Factory => "factory",
        }
    }
}

impl fmt::Display for AccessLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A calendar date as stored in board registers.
///
/// Packed layout: `(year - 2000) << 9 | month << 5 | day`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl BoardDate {
    pub fn from_word(word: u16) -> Self {
        Self {
            year: (word >> 9) + 2000,
            month: ((word >> 5) & 0x0F) as u8,
            day: (word & 0x1F) as u8,
        }
    }

    pub fn to_word(&self) -> u16 {
        (self.year.saturating_sub(2000) << 9) | ((self.month as u16) << 5) | (self.day as u16)
    }
}

impl fmt::Display for BoardDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// A `major.minor` version as stored in board registers.
///
/// Packed layout: `major << 8 | minor`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct BoardVersion {
    pub major: u8,
    pub minor: u8,
}

impl BoardVersion {
    pub fn from_word(word: u16) -> Self {
        Self {
            major: (word >> 8) as u8,
            minor: (word & 0xFF) as u8,
        }
    }

    pub fn to_word(&self) -> u16 {
        ((self.major as u16) << 8) | self.minor as u16
    }
}

impl fmt::Display for BoardVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.major, self.minor)
    }
}

/// Decode a register word holding two ASCII characters (high byte first).
pub fn word_to_ascii(word: u16) -> String {
    let hi = (word >> 8) as u8;
    let lo = (word & 0xFF) as u8;
    [hi, lo]
        .iter()
        .filter(|b| **b != 0)
        .map(|b| *b as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_level_from_bits() {
        assert_eq!(AccessLevel::from_bits(0x0000), AccessLevel::No);
        assert_eq!(AccessLevel::from_bits(0x0002), AccessLevel::Service);
        // Only the two low bits matter.
        assert_eq!(AccessLevel::from_bits(0xFF01), AccessLevel::User);
    }

    #[test]
    fn test_board_date_roundtrip() {
        let d = BoardDate {
            year: 2023,
            month: 11,
            day: 7,
        };
        assert_eq!(BoardDate::from_word(d.to_word()), d);
        assert_eq!(d.to_word(), (23 << 9) | (11 << 5) | 7);
    }

    #[test]
    fn test_board_version_word() {
        let v = BoardVersion::from_word(0x0207);
        assert_eq!(v.major, 2);
        assert_eq!(v.minor, 7);
        assert_eq!(v.to_string(), "2.07");
    }

    #[test]
    fn test_word_to_ascii() {
        assert_eq!(word_to_ascii(0x4D42), "MB");
        assert_eq!(word_to_ascii(0x0041), "A");
    }
}
