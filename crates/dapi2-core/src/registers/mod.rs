//! Local model of the board's register bank.
//!
//! 256 16-bit registers, each carrying metadata (name, access mode,
//! bounds, bit fields) plus two runtime flags: *defined* (a value has
//! been seen, locally or from the board) and *modified* (a local
//! mutation not yet written to the board).
//!
//! The container owns every node. Groups, arrays and bit fields refer
//! to registers by address or name, never by reference, so there are
//! no ownership cycles.

pub mod loader;

use std::collections::{BTreeMap, HashMap};

use thiserror::Error;

use crate::common::word_to_ascii;
use crate::protocol::MAX_REGS_PER_MSG;

/// Number of addressable registers.
pub const REG_COUNT: usize = 256;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegError {
    #[error("register {name} is undefined")]
    Undefined { name: String },

    #[error("no register named {name}")]
    UnknownName { name: String },

    #[error("no register at address 0x{addr:02X}")]
    UnknownAddr { addr: u8 },

    #[error("no group named {name}")]
    UnknownGroup { name: String },

    #[error("no array named {name}")]
    UnknownArray { name: String },

    #[error("register {reg} has no field {field}")]
    UnknownField { reg: String, field: String },

    #[error("value 0x{value:04X} does not fit field {field} ({width} bits)")]
    FieldOverflow {
        field: String,
        value: u16,
        width: u8,
    },

    #[error("register {name} conflicts with an existing definition")]
    Duplicate { name: String },
}

/// Register access mode, as declared by the hardware description.
///
/// Enforced by the board, not locally: a read-only register can still
/// be mirrored into the local model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegAccess {
    ReadOnly,
    ReadWrite,
}

/// One named value of a bit field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Choice {
    pub name: String,
    pub value: u16,
    pub descriptions: BTreeMap<String, String>,
}

/// A bit field overlaid on a register.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BitField {
    pub name: String,
    pub offset: u8,
    pub width: u8,
    pub choices: Vec<Choice>,
}

impl BitField {
    pub fn mask(&self) -> u16 {
        (((1u32 << self.width) - 1) as u16) << self.offset
    }

    pub fn extract(&self, word: u16) -> u16 {
        (word & self.mask()) >> self.offset
    }

    pub fn insert(&self, word: u16, value: u16) -> u16 {
        (word & !self.mask()) | ((value << self.offset) & self.mask())
    }

    pub fn choice(&self, value: u16) -> Option<&Choice> {
        self.choices.iter().find(|c| c.value == value)
    }
}

/// Register metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Register {
    pub name: String,
    pub shortname: String,
    pub addr: u8,
    pub access: RegAccess,
    pub min: Option<u16>,
    pub max: Option<u16>,
    /// Keyed by language code; `""` is the default language.
    pub descriptions: BTreeMap<String, String>,
    pub fields: Vec<BitField>,
}

impl Register {
    pub fn descr(&self, lang: &str) -> Option<&str> {
        self.descriptions
            .get(lang)
            .or_else(|| self.descriptions.get(""))
            .map(String::as_str)
    }

    pub fn field(&self, name: &str) -> Option<&BitField> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// A register array: `count` consecutive registers from `base`,
/// materialized as members named `name0`, `name1`, ...
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegArray {
    pub name: String,
    pub base: u8,
    pub count: u8,
}

impl RegArray {
    /// Member addresses; extents past the end of the bank are cut off.
    pub fn addrs(&self) -> impl Iterator<Item = u8> + '_ {
        (self.base as usize..)
            .take(self.count as usize)
            .filter_map(|a| u8::try_from(a).ok())
    }
}

/// A named ordered set of register addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegGroup {
    pub name: String,
    pub addrs: Vec<u8>,
}

/// A value change, reported synchronously to subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegChange {
    pub addr: u8,
    pub old: u16,
    pub new: u16,
    /// False when this change defined the register.
    pub was_defined: bool,
}

type Subscriber = Box<dyn FnMut(&RegChange) + Send>;

/// The register container.
pub struct RegisterFile {
    values: [u16; REG_COUNT],
    defined: [bool; REG_COUNT],
    modified: [bool; REG_COUNT],
    regs: Vec<Register>,
    by_addr: [Option<usize>; REG_COUNT],
    by_name: HashMap<String, usize>,
    arrays: Vec<RegArray>,
    groups: Vec<RegGroup>,
    /// `(filter, callback)`; a `None` filter matches every address.
    ///
    /// Callbacks run synchronously inside `set`/`apply` and must not
    /// call back into the facade (the transport is half-duplex).
    subscribers: Vec<(Option<u8>, Subscriber)>,
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            values: [0; REG_COUNT],
            defined: [false; REG_COUNT],
            modified: [false; REG_COUNT],
            regs: Vec::new(),
            by_addr: [None; REG_COUNT],
            by_name: HashMap::new(),
            arrays: Vec::new(),
            groups: Vec::new(),
            subscribers: Vec::new(),
        }
    }

    // ------------------------------------------------------------------
    // Construction (used by the loader)
    // ------------------------------------------------------------------

    pub fn add_register(&mut self, reg: Register) -> Result<(), RegError> {
        if self.by_name.contains_key(&reg.name) || self.by_addr[reg.addr as usize].is_some() {
            return Err(RegError::Duplicate { name: reg.name });
        }
        let index = self.regs.len();
        self.by_addr[reg.addr as usize] = Some(index);
        self.by_name.insert(reg.name.clone(), index);
        self.regs.push(reg);
        Ok(())
    }

    pub fn add_array(&mut self, array: RegArray) -> Result<(), RegError> {
        if self.arrays.iter().any(|a| a.name == array.name) {
            return Err(RegError::Duplicate { name: array.name });
        }
        self.arrays.push(array);
        Ok(())
    }

    pub fn add_group(&mut self, group: RegGroup) -> Result<(), RegError> {
        if self.groups.iter().any(|g| g.name == group.name) {
            return Err(RegError::Duplicate { name: group.name });
        }
        self.groups.push(group);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Lookup
    // ------------------------------------------------------------------

    pub fn reg(&self, name: &str) -> Result<&Register, RegError> {
        self.by_name
            .get(name)
            .map(|&i| &self.regs[i])
            .ok_or_else(|| RegError::UnknownName {
                name: name.to_string(),
            })
    }

    pub fn reg_at(&self, addr: u8) -> Result<&Register, RegError> {
        self.by_addr[addr as usize]
            .map(|i| &self.regs[i])
            .ok_or(RegError::UnknownAddr { addr })
    }

    pub fn addr_of(&self, name: &str) -> Result<u8, RegError> {
        Ok(self.reg(name)?.addr)
    }

    pub fn array(&self, name: &str) -> Result<&RegArray, RegError> {
        self.arrays
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| RegError::UnknownArray {
                name: name.to_string(),
            })
    }

    pub fn group(&self, name: &str) -> Result<&RegGroup, RegError> {
        self.groups
            .iter()
            .find(|g| g.name == name)
            .ok_or_else(|| RegError::UnknownGroup {
                name: name.to_string(),
            })
    }

    pub fn groups(&self) -> impl Iterator<Item = &RegGroup> {
        self.groups.iter()
    }

    pub fn registers(&self) -> impl Iterator<Item = &Register> {
        self.regs.iter()
    }

    // ------------------------------------------------------------------
    // Values and flags
    // ------------------------------------------------------------------

    fn name_at(&self, addr: u8) -> String {
        self.by_addr[addr as usize]
            .map(|i| self.regs[i].name.clone())
            .unwrap_or_else(|| format!("0x{addr:02X}"))
    }

    /// Current value; undefined registers have no value.
    pub fn value(&self, addr: u8) -> Result<u16, RegError> {
        if !self.defined[addr as usize] {
            return Err(RegError::Undefined {
                name: self.name_at(addr),
            });
        }
        Ok(self.values[addr as usize])
    }

    pub fn value_by_name(&self, name: &str) -> Result<u16, RegError> {
        self.value(self.addr_of(name)?)
    }

    /// Value decoded as two ASCII characters (board type, board number).
    pub fn as_string(&self, name: &str) -> Result<String, RegError> {
        Ok(word_to_ascii(self.value_by_name(name)?))
    }

    pub fn is_defined(&self, addr: u8) -> bool {
        self.defined[addr as usize]
    }

    pub fn is_modified(&self, addr: u8) -> bool {
        self.modified[addr as usize]
    }

    /// Addresses of every modified register, ascending.
    pub fn modified_addrs(&self) -> Vec<u8> {
        (0..REG_COUNT)
            .filter(|&a| self.modified[a])
            .map(|a| a as u8)
            .collect()
    }

    /// Addresses of every undefined declared register, ascending.
    pub fn undefined_addrs(&self) -> Vec<u8> {
        let mut addrs: Vec<u8> = self
            .regs
            .iter()
            .map(|r| r.addr)
            .filter(|&a| !self.defined[a as usize])
            .collect();
        addrs.sort_unstable();
        addrs
    }

    /// Local mutation: defines the register and marks it modified when
    /// the value actually changed (or was undefined).
    pub fn set(&mut self, addr: u8, value: u16) {
        let was_defined = self.defined[addr as usize];
        let old = self.values[addr as usize];
        let changed = !was_defined || old != value;
        self.modified[addr as usize] = changed;
        self.store(addr, value, was_defined, old, changed);
    }

    pub fn set_by_name(&mut self, name: &str, value: u16) -> Result<(), RegError> {
        let addr = self.addr_of(name)?;
        self.set(addr, value);
        Ok(())
    }

    /// Mirror of a value confirmed by the board: defines the register
    /// and clears the modified flag.
    pub fn apply(&mut self, addr: u8, value: u16) {
        let was_defined = self.defined[addr as usize];
        let old = self.values[addr as usize];
        let changed = !was_defined || old != value;
        self.modified[addr as usize] = false;
        self.store(addr, value, was_defined, old, changed);
    }

    fn store(&mut self, addr: u8, value: u16, was_defined: bool, old: u16, changed: bool) {
        self.values[addr as usize] = value;
        self.defined[addr as usize] = true;
        if changed {
            let change = RegChange {
                addr,
                old,
                new: value,
                was_defined,
            };
            for (filter, callback) in self.subscribers.iter_mut() {
                if filter.is_none() || *filter == Some(addr) {
                    callback(&change);
                }
            }
        }
    }

    /// Forgets a value, returning the register to the undefined state.
    pub fn reset(&mut self, addr: u8) {
        self.defined[addr as usize] = false;
        self.modified[addr as usize] = false;
        self.values[addr as usize] = 0;
    }

    pub fn reset_all(&mut self) {
        for a in 0..REG_COUNT {
            self.reset(a as u8);
        }
    }

    // ------------------------------------------------------------------
    // Bit fields
    // ------------------------------------------------------------------

    pub fn field_value(&self, reg: &str, field: &str) -> Result<u16, RegError> {
        let r = self.reg(reg)?;
        let f = r.field(field).ok_or_else(|| RegError::UnknownField {
            reg: reg.to_string(),
            field: field.to_string(),
        })?;
        Ok(f.extract(self.value(r.addr)?))
    }

    /// Local read-modify-write of one field through its register.
    pub fn set_field(&mut self, reg: &str, field: &str, value: u16) -> Result<(), RegError> {
        let r = self.reg(reg)?;
        let f = r.field(field).ok_or_else(|| RegError::UnknownField {
            reg: reg.to_string(),
            field: field.to_string(),
        })?;
        if value > (f.mask() >> f.offset) {
            return Err(RegError::FieldOverflow {
                field: field.to_string(),
                value,
                width: f.width,
            });
        }
        let addr = r.addr;
        let f = f.clone();
        let word = self.value(addr)?;
        self.set(addr, f.insert(word, value));
        Ok(())
    }

    /// Same read-modify-write, but as a board-confirmed mirror.
    pub fn apply_field(&mut self, reg: &str, field: &str, value: u16) -> Result<(), RegError> {
        let r = self.reg(reg)?;
        let f = r
            .field(field)
            .cloned()
            .ok_or_else(|| RegError::UnknownField {
                reg: reg.to_string(),
                field: field.to_string(),
            })?;
        let addr = r.addr;
        let word = self.value(addr).unwrap_or(0);
        self.apply(addr, f.insert(word, value));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    /// An array is defined only when every member is.
    pub fn array_defined(&self, name: &str) -> Result<bool, RegError> {
        let array = self.array(name)?;
        Ok(array.addrs().all(|a| self.defined[a as usize]))
    }

    pub fn array_values(&self, name: &str) -> Result<Vec<u16>, RegError> {
        let array = self.array(name)?.clone();
        array.addrs().map(|a| self.value(a)).collect()
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// Subscribes to changes of one address, or of all when `addr` is
    /// `None`. Fan-out is synchronous.
    pub fn subscribe<F>(&mut self, addr: Option<u8>, callback: F)
    where
        F: FnMut(&RegChange) + Send + 'static,
    {
        self.subscribers.push((addr, Box::new(callback)));
    }
}

/// Splits a set of addresses into maximal consecutive runs, then caps
/// each run at the per-frame register limit. Returns `(base, count)`
/// pairs in ascending order.
pub fn plan_chunks(addrs: &[u8]) -> Vec<(u8, usize)> {
    let mut sorted: Vec<u8> = addrs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut chunks = Vec::new();
    let mut i = 0;
    while i < sorted.len() {
        let base = sorted[i];
        let mut len = 1;
        while i + len < sorted.len()
            && len < MAX_REGS_PER_MSG
            && sorted[i + len] == base + len as u8
        {
            len += 1;
        }
        chunks.push((base, len));
        i += len;
    }
    chunks
}
