//! DAPI facade.
//!
//! Composes the codec, the link and the register container into the
//! API the rest of the crate (and applications) talk to: batched
//! register reads and writes, dirty-register synchronization, and one
//! method per board command.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::common::{AccessLevel, BoardDate, BoardVersion};
use crate::derror::{DapiFault, ErrorCatalog};
use crate::protocol::constants::cmd;
use crate::protocol::{Message, Payload};
use crate::registers::loader::{self, LoadError};
use crate::registers::{RegError, RegisterFile, plan_chunks};
use crate::transport::{Channel, DapiLink, TransportError};

#[derive(thiserror::Error, Debug)]
pub enum DapiError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Fault(#[from] DapiFault),

    #[error(transparent)]
    Reg(#[from] RegError),

    #[error("unexpected reply: {reply}")]
    UnexpectedReply { reply: String },
}

/// Per-facade credentials and behavior switches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DapiConfig {
    pub user_password: u16,
    pub service_password: u16,
    pub factory_password: u16,
    /// Relaxes some sanity checks for bench work on bare boards.
    pub dev_mode: bool,
}

impl Default for DapiConfig {
    fn default() -> Self {
        Self {
            user_password: 0x0000,
            service_password: 0xE8E8,
            factory_password: 0xF3F3,
            dev_mode: false,
        }
    }
}

impl DapiConfig {
    pub fn password_for(&self, level: AccessLevel) -> u16 {
        match level {
            AccessLevel::No | AccessLevel::User => self.user_password,
            AccessLevel::Service => self.service_password,
            AccessLevel::Factory => self.factory_password,
        }
    }
}

/// The facade. Owns the link and the local register model.
pub struct Dapi<C: Channel> {
    link: DapiLink<C>,
    pub regs: RegisterFile,
    pub catalog: ErrorCatalog,
    config: DapiConfig,
}

impl<C: Channel> Dapi<C> {
    /// Builds a facade with the register map and error catalogue
    /// shipped with the crate.
    pub fn new(link: DapiLink<C>, config: DapiConfig) -> Result<Self, LoadError> {
        Ok(Self {
            link,
            regs: loader::default_registers()?,
            catalog: ErrorCatalog::default_catalog()?,
            config,
        })
    }

    /// Builds a facade with caller-provided descriptions.
    pub fn with_descriptions(
        link: DapiLink<C>,
        config: DapiConfig,
        regs: RegisterFile,
        catalog: ErrorCatalog,
    ) -> Self {
        Self {
            link,
            regs,
            catalog,
            config,
        }
    }

    pub fn config(&self) -> &DapiConfig {
        &self.config
    }

    pub fn link(&mut self) -> &mut DapiLink<C> {
        &mut self.link
    }

    /// Detects the board's baud rate by probing the identity registers,
    /// leaving the channel configured at the detected rate.
    pub fn open(&mut self) -> Result<u32, DapiError> {
        let btr = self.regs.addr_of("btr")?;
        let probe = Message::read_reg(btr, 4).map_err(TransportError::from)?;
        Ok(self.link.detect_baud_rate(&probe)?)
    }

    /// One exchange; an error reply surfaces as a typed fault.
    fn exchange(&mut self, msg: &Message) -> Result<Message, DapiError> {
        let reply = self.link.request(msg)?;
        if let Some(fault) = DapiFault::from_reply(&reply) {
            return Err(fault.into());
        }
        Ok(reply)
    }

    // ------------------------------------------------------------------
    // Register reads
    // ------------------------------------------------------------------

    /// Reads the given registers from the board, batching consecutive
    /// addresses into the fewest legal frames, and mirrors the values
    /// locally.
    #[instrument(skip(self, addrs))]
    pub fn read_registers(&mut self, addrs: &[u8]) -> Result<(), DapiError> {
        for (base, count) in plan_chunks(addrs) {
            let msg = Message::read_reg(base, count * 2).map_err(TransportError::from)?;
            let reply = self.exchange(&msg)?;
            let Message::RegValues { addr, data } = &reply else {
                return Err(DapiError::UnexpectedReply {
                    reply: reply.to_string(),
                });
            };
            if *addr != base || data.len() != count * 2 {
                return Err(DapiError::UnexpectedReply {
                    reply: reply.to_string(),
                });
            }
            for (i, word) in data.words().enumerate() {
                self.regs.apply(base + i as u8, word);
            }
        }
        Ok(())
    }

    pub fn read_register(&mut self, name: &str) -> Result<u16, DapiError> {
        let addr = self.regs.addr_of(name)?;
        self.read_registers(&[addr])?;
        Ok(self.regs.value(addr)?)
    }

    pub fn read_group(&mut self, name: &str) -> Result<(), DapiError> {
        let addrs = self.regs.group(name)?.addrs.clone();
        self.read_registers(&addrs)
    }

    /// Reads only the group members that have no local value yet.
    pub fn read_group_if_undefined(&mut self, name: &str) -> Result<(), DapiError> {
        let addrs: Vec<u8> = self
            .regs
            .group(name)?
            .addrs
            .iter()
            .copied()
            .filter(|&a| !self.regs.is_defined(a))
            .collect();
        if addrs.is_empty() {
            return Ok(());
        }
        self.read_registers(&addrs)
    }

    // ------------------------------------------------------------------
    // Register writes
    // ------------------------------------------------------------------

    /// Writes the current local values of the given registers to the
    /// board, batching like `read_registers`. The board echoes each
    /// chunk; the echo is what clears the modified flags.
    ///
    /// On a refused chunk the local flags stay set, so a later `sync`
    /// retries it; the board-side content of that chunk must be
    /// considered unknown and re-read.
    #[instrument(skip(self, addrs))]
    pub fn write_registers(&mut self, addrs: &[u8]) -> Result<(), DapiError> {
        for (base, count) in plan_chunks(addrs) {
            let mut values = Vec::with_capacity(count);
            for i in 0..count {
                values.push(self.regs.value(base + i as u8)?);
            }
            let msg = Message::write_reg(base, &values).map_err(TransportError::from)?;
            let reply = self.exchange(&msg)?;
            let Message::RegWritten { addr, data } = &reply else {
                return Err(DapiError::UnexpectedReply {
                    reply: reply.to_string(),
                });
            };
            if *addr != base {
                return Err(DapiError::UnexpectedReply {
                    reply: reply.to_string(),
                });
            }
            for (i, word) in data.words().enumerate() {
                self.regs.apply(base + i as u8, word);
            }
        }
        Ok(())
    }

    pub fn write_register(&mut self, name: &str, value: u16) -> Result<(), DapiError> {
        let addr = self.regs.addr_of(name)?;
        self.regs.set(addr, value);
        self.write_registers(&[addr])
    }

    /// Local bit-field mutation. An undefined parent is fetched from
    /// the board first, so the other bits are preserved; dev mode
    /// assumes zero instead of touching the wire.
    pub fn set_field(&mut self, reg: &str, field: &str, value: u16) -> Result<(), DapiError> {
        let addr = self.regs.addr_of(reg)?;
        if !self.regs.is_defined(addr) {
            if self.config.dev_mode {
                self.regs.apply(addr, 0);
            } else {
                self.read_registers(&[addr])?;
            }
        }
        Ok(self.regs.set_field(reg, field, value)?)
    }

    /// Pushes every locally modified register to the board.
    pub fn sync(&mut self) -> Result<(), DapiError> {
        let modified = self.regs.modified_addrs();
        if modified.is_empty() {
            return Ok(());
        }
        debug!(count = modified.len(), "syncing modified registers");
        self.write_registers(&modified)
    }

    // ------------------------------------------------------------------
    // Commands
    // ------------------------------------------------------------------

    /// Sends one command and returns the board's response.
    pub fn command(&mut self, id: u8, payload: Payload) -> Result<Message, DapiError> {
        let reply = self.exchange(&Message::command(id, payload))?;
        match reply {
            Message::Response { .. } => Ok(reply),
            _ => Err(DapiError::UnexpectedReply {
                reply: reply.to_string(),
            }),
        }
    }

    /// The named-command surface.
    pub fn cmd(&mut self) -> Commands<'_, C> {
        Commands { dapi: self }
    }
}

/// One method per board command.
///
/// Commands that change a register the board maintains also mirror the
/// change into the local container, so the model stays consistent
/// without a follow-up read.
pub struct Commands<'a, C: Channel> {
    dapi: &'a mut Dapi<C>,
}

impl<C: Channel> Commands<'_, C> {
    fn simple(&mut self, id: u8) -> Result<(), DapiError> {
        self.dapi.command(id, Payload::new())?;
        Ok(())
    }

    /// Reads `smr` first when it has no local value, so bit mirrors
    /// touch only the intended bit.
    fn ensure_smr(&mut self) -> Result<(), DapiError> {
        let addr = self.dapi.regs.addr_of("smr")?;
        if !self.dapi.regs.is_defined(addr) {
            self.dapi.read_registers(&[addr])?;
        }
        Ok(())
    }

    // ---- system ----

    pub fn reboot(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::REBOOT)
    }

    pub fn standby(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::STANDBY)?;
        let par = self.dapi.regs.addr_of("par")?;
        self.dapi.regs.apply(par, 0);
        Ok(())
    }

    /// The firmware expects an intermediate standby when switching
    /// directly between two peripherals; dev mode skips it.
    pub fn peripheral_activate(&mut self, par: u16) -> Result<(), DapiError> {
        let addr = self.dapi.regs.addr_of("par")?;
        if par != 0 && self.dapi.regs.value(addr).unwrap_or(0) != 0 && !self.dapi.config.dev_mode {
            self.standby()?;
        }
        self.dapi
            .command(cmd::PERIPHERAL_ACTIVATE, Payload::new().with_word(par))?;
        self.dapi.regs.apply(addr, par);
        Ok(())
    }

    pub fn emergency_stop(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::EMERGENCY_STOP)
    }

    /// Access-level handshake. The password defaults live in
    /// [`DapiConfig`]; a wrong one yields `ConnectionDenied`.
    pub fn connect(&mut self, level: AccessLevel, password: u16) -> Result<(), DapiError> {
        self.dapi.command(
            cmd::CONNECT,
            Payload::new().with_byte(level as u8).with_word(password),
        )?;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::DISCONNECT)
    }

    /// Serial number of the microcontroller die, read in word pairs.
    pub fn get_mc_sn(&mut self, index: u8) -> Result<u32, DapiError> {
        let reply = self
            .dapi
            .command(cmd::GET_MC_SN, Payload::new().with_byte(index))?;
        let Message::Response { data, .. } = &reply else {
            unreachable!("command() returns responses only");
        };
        data.dword(0).ok_or_else(|| DapiError::UnexpectedReply {
            reply: reply.to_string(),
        })
    }

    pub fn boot_flash(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::BOOT_FLASH)
    }

    // ---- motor ----

    /// Starts the motor; a non-zero `speed` also changes the speed
    /// setpoint, in which case `scr` is re-read (the board may clamp).
    pub fn motor_start(&mut self, speed: u16) -> Result<(), DapiError> {
        self.ensure_smr()?;
        self.dapi
            .command(cmd::MOTOR_START, Payload::new().with_word(speed))?;
        self.dapi.regs.apply_field("smr", "start", 1)?;
        if speed != 0 {
            let scr = self.dapi.regs.addr_of("scr")?;
            self.dapi.read_registers(&[scr])?;
        }
        Ok(())
    }

    pub fn motor_stop(&mut self) -> Result<(), DapiError> {
        self.ensure_smr()?;
        self.simple(cmd::MOTOR_STOP)?;
        self.dapi.regs.apply_field("smr", "start", 0)?;
        Ok(())
    }

    /// Lets the motor coast to a stop instead of braking.
    pub fn motor_freewheel_stop(&mut self) -> Result<(), DapiError> {
        self.ensure_smr()?;
        self.simple(cmd::MOTOR_FREEWHEEL_STOP)?;
        self.dapi.regs.apply_field("smr", "freewheel", 1)?;
        self.dapi.regs.apply_field("smr", "start", 0)?;
        Ok(())
    }

    pub fn motor_inc_speed(&mut self, inc: u16) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::MOTOR_INC_SPEED, Payload::new().with_word(inc))?;
        let scr = self.dapi.regs.addr_of("scr")?;
        if self.dapi.regs.is_defined(scr) {
            let rpm = self.dapi.regs.value(scr)?.saturating_add(inc);
            self.dapi.regs.apply(scr, rpm);
        }
        Ok(())
    }

    pub fn motor_dec_speed(&mut self, dec: u16) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::MOTOR_DEC_SPEED, Payload::new().with_word(dec))?;
        let scr = self.dapi.regs.addr_of("scr")?;
        if self.dapi.regs.is_defined(scr) {
            let rpm = self.dapi.regs.value(scr)?.saturating_sub(dec);
            self.dapi.regs.apply(scr, rpm);
        }
        Ok(())
    }

    /// Toggles the direction of rotation.
    pub fn motor_reverse(&mut self) -> Result<(), DapiError> {
        self.ensure_smr()?;
        self.simple(cmd::MOTOR_REVERSE)?;
        let reversed = self.dapi.regs.field_value("smr", "reverse")?;
        self.dapi.regs.apply_field("smr", "reverse", reversed ^ 1)?;
        Ok(())
    }

    // ---- light ----

    pub fn light_on(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::LIGHT_ON)?;
        self.dapi.regs.apply_field("smr", "light", 1)?;
        Ok(())
    }

    pub fn light_off(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::LIGHT_OFF)?;
        self.dapi.regs.apply_field("smr", "light", 0)?;
        Ok(())
    }

    pub fn light_intensity(&mut self, percent: u16) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::LIGHT_INTENSITY, Payload::new().with_word(percent))?;
        let lir = self.dapi.regs.addr_of("lir")?;
        self.dapi.regs.apply(lir, percent);
        Ok(())
    }

    /// Alternate (UV) light level; mirrored into `alr`.
    pub fn light_alternate(&mut self, level: u16) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::LIGHT_ALTERNATE, Payload::new().with_word(level))?;
        let alr = self.dapi.regs.addr_of("alr")?;
        self.dapi.regs.apply(alr, level);
        Ok(())
    }

    // ---- settings memory ----

    /// Stores the current set points into one memory slot.
    pub fn memory_store(&mut self, slot: u8) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::MEMORY_STORE, Payload::new().with_byte(slot))?;
        Ok(())
    }

    /// Recalls the set points stored in one memory slot.
    pub fn memory_recall(&mut self, slot: u8) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::MEMORY_RECALL, Payload::new().with_byte(slot))?;
        Ok(())
    }

    /// Reads one stored settings page (four words).
    pub fn memory_read(
        &mut self,
        peripheral: u8,
        memory: u8,
        page: u8,
    ) -> Result<[u16; 4], DapiError> {
        let reply = self.dapi.command(
            cmd::MEMORY_READ,
            Payload::new()
                .with_byte(peripheral)
                .with_byte(memory)
                .with_byte(page),
        )?;
        let Message::Response { data, .. } = &reply else {
            unreachable!("command() returns responses only");
        };
        match (data.word(0), data.word(1), data.word(2), data.word(3)) {
            (Some(a), Some(b), Some(c), Some(d)) => Ok([a, b, c, d]),
            _ => Err(DapiError::UnexpectedReply {
                reply: reply.to_string(),
            }),
        }
    }

    /// Resets the stored set points to their factory values.
    pub fn memory_reset(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::MEMORY_RESET)
    }

    // ---- factory ----

    pub fn fact_eeprom_reset(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::FACT_EEPROM_RESET)
    }

    /// Writes serial number, factory date and hardware version, and
    /// mirrors them locally.
    pub fn fact_set_sysinfo(
        &mut self,
        serial: u16,
        date: BoardDate,
        hardware: BoardVersion,
    ) -> Result<(), DapiError> {
        self.dapi.command(
            cmd::FACT_SET_SYSINFO,
            Payload::new()
                .with_word(serial)
                .with_word(date.to_word())
                .with_word(hardware.to_word()),
        )?;
        let snr = self.dapi.regs.addr_of("snr")?;
        let fdr = self.dapi.regs.addr_of("fdr")?;
        let hvr = self.dapi.regs.addr_of("hvr")?;
        self.dapi.regs.apply(snr, serial);
        self.dapi.regs.apply(fdr, date.to_word());
        self.dapi.regs.apply(hvr, hardware.to_word());
        Ok(())
    }

    /// Writes after-sale service information.
    pub fn fact_set_srvinfo(
        &mut self,
        service: u16,
        date: BoardDate,
        tag: u16,
    ) -> Result<(), DapiError> {
        self.dapi.command(
            cmd::FACT_SET_SRVINFO,
            Payload::new()
                .with_word(service)
                .with_word(date.to_word())
                .with_word(tag),
        )?;
        Ok(())
    }

    /// Runs one calibration step. Refusals come back as
    /// `CalibrationWrongItem` / `CalibrationWrongStep`.
    pub fn fact_calibration(&mut self, item: u8, step: u8) -> Result<Option<u16>, DapiError> {
        let reply = self.dapi.command(
            cmd::FACT_CALIBRATION,
            Payload::new().with_byte(item).with_byte(step),
        )?;
        let Message::Response { data, .. } = &reply else {
            unreachable!("command() returns responses only");
        };
        Ok(data.word(0))
    }

    // ---- firmware download ----

    pub fn flash_begin(&mut self, size: u32) -> Result<(), DapiError> {
        self.dapi
            .command(cmd::FLASH_BEGIN, Payload::new().with_dword(size))?;
        Ok(())
    }

    /// One 8-byte data chunk; shorter chunks are zero-padded by the
    /// caller.
    pub fn flash_data(&mut self, chunk: &[u8; 8]) -> Result<(), DapiError> {
        let payload = Payload::from_slice(chunk).map_err(TransportError::from)?;
        self.dapi.command(cmd::FLASH_DATA, payload)?;
        Ok(())
    }

    pub fn flash_end(&mut self) -> Result<(), DapiError> {
        self.simple(cmd::FLASH_END)
    }

    // ---- debug ----

    pub fn debug_read(&mut self, addr: u16) -> Result<u16, DapiError> {
        let reply = self
            .dapi
            .command(cmd::DEBUG_READ, Payload::new().with_word(addr))?;
        let Message::Response { data, .. } = &reply else {
            unreachable!("command() returns responses only");
        };
        data.word(0).ok_or_else(|| DapiError::UnexpectedReply {
            reply: reply.to_string(),
        })
    }

    pub fn debug_write(&mut self, addr: u16, value: u16) -> Result<(), DapiError> {
        self.dapi.command(
            cmd::DEBUG_WRITE,
            Payload::new().with_word(addr).with_word(value),
        )?;
        Ok(())
    }
}
