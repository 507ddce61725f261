//! Error taxonomy.
//!
//! Two distinct spaces live here: the *refusal codes* a board puts in
//! an error frame (mapped to [`DapiFault`]), and the *device error
//! catalogue* describing the codes reported in the warning/error
//! register, loaded from XML.

use std::collections::BTreeMap;
use std::fmt;

use thiserror::Error;

use crate::protocol::constants::{cmd, errcode};
use crate::protocol::{Message, MsgType};
use crate::registers::loader::LoadError;

/// A typed refusal from the board.
///
/// Codes `0x81`/`0x82` are command-scoped: their meaning depends on
/// which command was refused.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DapiFault {
    #[error("wrong register address 0x{addr:02X}")]
    WrongAddress { addr: u8 },

    #[error("register 0x{addr:02X} is read-only")]
    ReadOnly { addr: u8 },

    #[error("value refused for register 0x{addr:02X}")]
    WrongValue { addr: u8 },

    #[error("request refused in the current context")]
    WrongContext,

    #[error("board considered the request malformed")]
    MalformedMessage,

    #[error("access level too low")]
    AccessDenied,

    #[error("board EEPROM failure")]
    EepromFailure,

    #[error("operation aborted by the board")]
    Aborted,

    #[error("board reports its communication broken")]
    ComBroken,

    #[error("connection denied")]
    ConnectionDenied,

    #[error("firmware download failed")]
    FlashFailure,

    #[error("firmware download ended unexpectedly")]
    FlashUnexpectedEnd,

    #[error("calibration: wrong item")]
    CalibrationWrongItem,

    #[error("calibration: wrong step")]
    CalibrationWrongStep,

    #[error("undefined refusal code 0x{code:02X}")]
    Undefined { code: u8 },
}

impl DapiFault {
    /// Maps an error frame to a typed fault. Returns `None` for
    /// non-error messages.
    pub fn from_reply(msg: &Message) -> Option<Self> {
        let Message::Error { mtype, addr, code } = msg else {
            return None;
        };
        let (mtype, addr, code) = (*mtype, *addr, *code);

        let fault = match code {
            errcode::WRONG_ADDRESS => DapiFault::WrongAddress { addr },
            errcode::READ_ONLY => DapiFault::ReadOnly { addr },
            errcode::WRONG_VALUE => DapiFault::WrongValue { addr },
            errcode::WRONG_CONTEXT => DapiFault::WrongContext,
            errcode::MALFORMED_MESSAGE => DapiFault::MalformedMessage,
            errcode::ACCESS_DENIED => DapiFault::AccessDenied,
            errcode::EEPROM_FAILURE => DapiFault::EepromFailure,
            errcode::ABORTED => DapiFault::Aborted,
            errcode::COM_BROKEN => DapiFault::ComBroken,
            errcode::CMD_SPECIFIC_1 | errcode::CMD_SPECIFIC_2 if mtype == MsgType::Command => {
                match (addr, code) {
                    (cmd::CONNECT, _) => DapiFault::ConnectionDenied,
                    (cmd::FLASH_BEGIN | cmd::FLASH_DATA | cmd::FLASH_END, errcode::CMD_SPECIFIC_1) => {
                        DapiFault::FlashFailure
                    }
                    (cmd::FLASH_BEGIN | cmd::FLASH_DATA | cmd::FLASH_END, _) => {
                        DapiFault::FlashUnexpectedEnd
                    }
                    (cmd::FACT_CALIBRATION, errcode::CMD_SPECIFIC_1) => {
                        DapiFault::CalibrationWrongItem
                    }
                    (cmd::FACT_CALIBRATION, _) => DapiFault::CalibrationWrongStep,
                    _ => DapiFault::Undefined { code },
                }
            }
            _ => DapiFault::Undefined { code },
        };
        Some(fault)
    }
}

/// Severity of a catalogued device error, derived from the two high
/// bits of its identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorLevel {
    Info,
    Warning,
    Error,
    Fatal,
}

impl ErrorLevel {
    pub fn from_id(id: u16) -> Self {
        match (id >> 6) & 0x3 {
            0 => ErrorLevel::Info,
            1 => ErrorLevel::Warning,
            2 => ErrorLevel::Error,
            _ => ErrorLevel::Fatal,
        }
    }
}

impl fmt::Display for ErrorLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorLevel::Info => write!(f, "info"),
            ErrorLevel::Warning => write!(f, "warning"),
            ErrorLevel::Error => write!(f, "error"),
            ErrorLevel::Fatal => write!(f, "fatal"),
        }
    }
}

/// One catalogued device error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDescr {
    pub id: u16,
    pub name: String,
    pub level: ErrorLevel,
    /// Keyed by language code; `""` is the default language.
    pub descriptions: BTreeMap<String, String>,
}

impl ErrorDescr {
    pub fn descr(&self, lang: &str) -> Option<&str> {
        self.descriptions
            .get(lang)
            .or_else(|| self.descriptions.get(""))
            .map(String::as_str)
    }
}

/// The device error catalogue, keyed by error identifier.
#[derive(Debug, Clone, Default)]
pub struct ErrorCatalog {
    entries: BTreeMap<u16, ErrorDescr>,
}

impl ErrorCatalog {
    /// Parses the error-catalogue document.
    pub fn load(xml: &str) -> Result<Self, LoadError> {
        let doc = roxmltree::Document::parse(xml)?;
        let mut entries = BTreeMap::new();

        for node in doc
            .root_element()
            .children()
            .filter(|n| n.has_tag_name("error"))
        {
            let id_text = node.attribute("id").ok_or(LoadError::MissingAttr {
                element: "error",
                attr: "id",
            })?;
            let id = parse_id(id_text).ok_or_else(|| LoadError::BadAttr {
                element: "error",
                attr: "id",
                value: id_text.to_string(),
            })?;
            let name = node
                .attribute("name")
                .ok_or(LoadError::MissingAttr {
                    element: "error",
                    attr: "name",
                })?
                .to_string();

            let mut descriptions = BTreeMap::new();
            for descr in node.children().filter(|n| n.has_tag_name("descr")) {
                let lang = descr.attribute("lang").unwrap_or("").to_string();
                if let Some(text) = descr.text() {
                    descriptions.insert(lang, text.trim().to_string());
                }
            }

            entries.insert(
                id,
                ErrorDescr {
                    id,
                    name,
                    level: ErrorLevel::from_id(id),
                    descriptions,
                },
            );
        }

        Ok(Self { entries })
    }

    /// The catalogue shipped with the crate.
    pub fn default_catalog() -> Result<Self, LoadError> {
        Self::load(include_str!("../data/errors.xml"))
    }

    pub fn lookup(&self, id: u16) -> Option<&ErrorDescr> {
        self.entries.get(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_id(text: &str) -> Option<u16> {
    if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16).ok()
    } else {
        text.parse().ok()
    }
}
