//! Board model.
//!
//! A [`Board`] sits on top of the facade and adds the product-level
//! behavior: identity, access-level lifecycle, workspaces, motor and
//! light control with a preferred path (command or register), settings
//! memory, firmware download and factory operations.

pub mod workspace;

use std::io::Read;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::common::{AccessLevel, BoardDate, BoardVersion};
use crate::dapi::{Dapi, DapiError};
use crate::derror::ErrorDescr;
use crate::registers::RegError;
use crate::transport::Channel;

pub use workspace::{Workspace, Workspaces};

/// Settle time after a firmware download, before reconnecting.
pub const WAIT_AFTER_REPROGRAMMING: Duration = Duration::from_secs(8);

/// Settle time after a plain reboot.
pub const WAIT_AFTER_REBOOT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum BoardError {
    #[error(transparent)]
    Dapi(#[from] DapiError),

    #[error(transparent)]
    Reg(#[from] RegError),

    #[error("board exposes no workspace besides standby")]
    NoWorkspace,

    #[error("no workspace with par {par}")]
    UnknownWorkspace { par: u16 },

    #[error("firmware image is empty")]
    EmptyFirmware,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Known board products, keyed by the `bnr` register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardKind {
    Generic,
    Mb30,
    Mb60,
}

impl BoardKind {
    pub fn from_bnr(bnr: &str) -> Self {
        match bnr {
            "30" => BoardKind::Mb30,
            "60" => BoardKind::Mb60,
            _ => BoardKind::Generic,
        }
    }
}

/// Preferred path for operations that exist both as a command and as a
/// register write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMode {
    Command,
    Register,
}

/// Events emitted by the board model.
#[derive(Debug, Clone)]
pub enum BoardEvent {
    /// The active workspace changed (locally or board-initiated).
    WorkspaceChanged { par: u16 },
    /// The granted access level changed.
    ConnectionChanged { level: AccessLevel },
    /// Firmware download progress, in bytes.
    FlashProgress { sent: u64, total: u64 },
}

/// Observer for board events. Implementations must not call back into
/// the board on the same thread: the transport is half-duplex.
pub trait BoardObserver: Send + Sync {
    fn on_event(&self, event: &BoardEvent);
}

/// No-op observer.
pub struct NullObserver;

impl BoardObserver for NullObserver {
    fn on_event(&self, _event: &BoardEvent) {}
}

/// Observer that logs events through tracing.
pub struct TracingObserver;

impl BoardObserver for TracingObserver {
    fn on_event(&self, event: &BoardEvent) {
        match event {
            BoardEvent::WorkspaceChanged { par } => info!(par, "workspace changed"),
            BoardEvent::ConnectionChanged { level } => info!(%level, "access level changed"),
            BoardEvent::FlashProgress { sent, total } => {
                debug!(sent, total, "firmware download progress");
            }
        }
    }
}

/// State shared with the register-change subscriptions.
struct Shared {
    workspaces: Mutex<Workspaces>,
    access: Mutex<AccessLevel>,
    observers: Mutex<Vec<Box<dyn BoardObserver>>>,
}

impl Shared {
    fn emit(&self, event: &BoardEvent) {
        for observer in self.observers.lock().unwrap().iter() {
            observer.on_event(event);
        }
    }
}

/// A connected board.
pub struct Board<C: Channel> {
    dapi: Dapi<C>,
    kind: BoardKind,
    mode: ControlMode,
    shared: Arc<Shared>,
}

impl<C: Channel> Board<C> {
    /// Identifies the board by reading `btr` and `bnr`, without
    /// touching anything else yet.
    pub fn new(mut dapi: Dapi<C>) -> Result<Self, BoardError> {
        let btr = dapi.regs.addr_of("btr")?;
        let bnr = dapi.regs.addr_of("bnr")?;
        dapi.read_registers(&[btr, bnr])?;
        let kind = BoardKind::from_bnr(&dapi.regs.as_string("bnr")?);
        info!(
            board = %dapi.regs.as_string("btr")?,
            number = %dapi.regs.as_string("bnr")?,
            ?kind,
            "board identified"
        );
        Ok(Self {
            dapi,
            kind,
            mode: ControlMode::Command,
            shared: Arc::new(Shared {
                workspaces: Mutex::new(Workspaces::default()),
                access: Mutex::new(AccessLevel::No),
                observers: Mutex::new(Vec::new()),
            }),
        })
    }

    pub fn kind(&self) -> BoardKind {
        self.kind
    }

    pub fn control_mode(&self) -> ControlMode {
        self.mode
    }

    pub fn set_control_mode(&mut self, mode: ControlMode) {
        self.mode = mode;
    }

    pub fn dapi(&mut self) -> &mut Dapi<C> {
        &mut self.dapi
    }

    pub fn add_observer(&self, observer: Box<dyn BoardObserver>) {
        self.shared.observers.lock().unwrap().push(observer);
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Reads every register group still undefined, enumerates the
    /// workspaces from `pcr[]` and wires the change subscriptions.
    #[instrument(skip(self))]
    pub fn initialize(&mut self) -> Result<(), BoardError> {
        for group in ["header", "system", "state", "setpoints", "ppa", "debug"] {
            self.dapi.read_group_if_undefined(group)?;
        }

        let pcr = self.dapi.regs.array_values("pcr")?;
        let mut workspaces = Workspaces::from_pcr(&pcr);
        if workspaces.standby_only() && !self.dapi.config().dev_mode {
            return Err(BoardError::NoWorkspace);
        }

        let par = self.dapi.regs.value_by_name("par")?;
        workspaces.activate_by_par(par);
        debug!(count = workspaces.len(), active = par, "workspaces enumerated");
        *self.shared.workspaces.lock().unwrap() = workspaces;

        let level = AccessLevel::from_bits(self.dapi.regs.field_value("scsr", "access")?);
        *self.shared.access.lock().unwrap() = level;

        // Board-initiated changes reach the model through the mirror,
        // so these fire for remote and local transitions alike.
        let par_addr = self.dapi.regs.addr_of("par")?;
        let shared = self.shared.clone();
        self.dapi.regs.subscribe(Some(par_addr), move |change| {
            shared.workspaces.lock().unwrap().activate_by_par(change.new);
            shared.emit(&BoardEvent::WorkspaceChanged { par: change.new });
        });

        let scsr_addr = self.dapi.regs.addr_of("scsr")?;
        let shared = self.shared.clone();
        self.dapi.regs.subscribe(Some(scsr_addr), move |change| {
            let level = AccessLevel::from_bits(change.new);
            let mut current = shared.access.lock().unwrap();
            if *current != level {
                *current = level;
                drop(current);
                shared.emit(&BoardEvent::ConnectionChanged { level });
            }
        });

        Ok(())
    }

    pub fn access_level(&self) -> AccessLevel {
        *self.shared.access.lock().unwrap()
    }

    /// Access-level handshake. An already-open session is closed
    /// first. `password` falls back to the configured one for `level`.
    #[instrument(skip(self, password))]
    pub fn connect(&mut self, level: AccessLevel, password: Option<u16>) -> Result<(), BoardError> {
        if self.access_level() != AccessLevel::No {
            self.dapi.cmd().disconnect()?;
            self.dapi.regs.apply_field("scsr", "access", AccessLevel::No as u16)?;
        }

        let password = password.unwrap_or_else(|| self.dapi.config().password_for(level));
        self.dapi.cmd().connect(level, password)?;

        // Mirror the granted level; fetch the rest of scsr when the
        // board has never been read.
        let scsr = self.dapi.regs.addr_of("scsr")?;
        if !self.dapi.regs.is_defined(scsr) {
            self.dapi.read_registers(&[scsr])?;
        }
        self.dapi.regs.apply_field("scsr", "access", level as u16)?;
        Ok(())
    }

    pub fn disconnect(&mut self) -> Result<(), BoardError> {
        self.dapi.cmd().disconnect()?;
        self.dapi
            .regs
            .apply_field("scsr", "access", AccessLevel::No as u16)?;
        Ok(())
    }

    /// Reboots the board. Every mirrored value is forgotten; callers
    /// wait [`WAIT_AFTER_REBOOT`] and re-initialize.
    pub fn reboot(&mut self) -> Result<(), BoardError> {
        self.dapi.cmd().reboot()?;
        self.dapi.regs.reset_all();
        *self.shared.access.lock().unwrap() = AccessLevel::No;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Workspaces
    // ------------------------------------------------------------------

    pub fn workspaces(&self) -> Vec<Workspace> {
        self.shared.workspaces.lock().unwrap().iter().cloned().collect()
    }

    pub fn active_workspace(&self) -> Option<Workspace> {
        self.shared.workspaces.lock().unwrap().active().cloned()
    }

    /// Activates the workspace selected by `par`, through the command
    /// or the register path depending on the control mode.
    #[instrument(skip(self))]
    pub fn set_workspace(&mut self, par: u16) -> Result<(), BoardError> {
        if self.shared.workspaces.lock().unwrap().by_par(par).is_none() {
            return Err(BoardError::UnknownWorkspace { par });
        }

        match self.mode {
            ControlMode::Command => {
                if par == 0 {
                    self.dapi.cmd().standby()?;
                } else {
                    self.dapi.cmd().peripheral_activate(par)?;
                }
            }
            ControlMode::Register => {
                self.dapi.write_register("par", par)?;
            }
        }
        Ok(())
    }

    pub fn standby(&mut self) -> Result<(), BoardError> {
        self.set_workspace(0)
    }

    // ------------------------------------------------------------------
    // Motor and light
    // ------------------------------------------------------------------

    fn write_smr_field(&mut self, field: &str, value: u16) -> Result<(), BoardError> {
        let smr = self.dapi.regs.addr_of("smr")?;
        self.dapi.set_field("smr", field, value)?;
        self.dapi.write_registers(&[smr])?;
        Ok(())
    }

    /// Starts the motor, optionally changing the speed setpoint in the
    /// same operation.
    pub fn start_motor(&mut self, speed: Option<u16>) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_start(speed.unwrap_or(0))?,
            ControlMode::Register => {
                let smr = self.dapi.regs.addr_of("smr")?;
                let mut addrs = vec![smr];
                if let Some(rpm) = speed {
                    let scr = self.dapi.regs.addr_of("scr")?;
                    self.dapi.regs.set(scr, rpm);
                    addrs.push(scr);
                }
                self.dapi.set_field("smr", "start", 1)?;
                self.dapi.write_registers(&addrs)?;
            }
        }
        Ok(())
    }

    pub fn stop_motor(&mut self) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_stop()?,
            ControlMode::Register => self.write_smr_field("start", 0)?,
        }
        Ok(())
    }

    /// Stops the motor without braking.
    pub fn freewheel_stop_motor(&mut self) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_freewheel_stop()?,
            ControlMode::Register => {
                let smr = self.dapi.regs.addr_of("smr")?;
                self.dapi.set_field("smr", "freewheel", 1)?;
                self.dapi.set_field("smr", "start", 0)?;
                self.dapi.write_registers(&[smr])?;
            }
        }
        Ok(())
    }

    /// Always the command path, whatever the control mode.
    pub fn emergency_stop(&mut self) -> Result<(), BoardError> {
        self.dapi.cmd().emergency_stop()?;
        self.dapi.regs.apply_field("smr", "start", 0)?;
        Ok(())
    }

    /// Changes the speed setpoint; always the register path, like the
    /// other setpoints.
    pub fn set_motor_speed(&mut self, rpm: u16) -> Result<(), BoardError> {
        Ok(self.dapi.write_register("scr", rpm)?)
    }

    /// Raises the speed setpoint by `inc`, clamped to the register's
    /// declared maximum on the register path.
    pub fn increase_motor_speed(&mut self, inc: u16) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_inc_speed(inc)?,
            ControlMode::Register => {
                let max = self.dapi.regs.reg("scr")?.max.unwrap_or(u16::MAX);
                let rpm = self
                    .dapi
                    .regs
                    .value_by_name("scr")?
                    .saturating_add(inc)
                    .min(max);
                self.dapi.write_register("scr", rpm)?;
            }
        }
        Ok(())
    }

    /// Lowers the speed setpoint by `dec`, clamped to the register's
    /// declared minimum on the register path.
    pub fn decrease_motor_speed(&mut self, dec: u16) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_dec_speed(dec)?,
            ControlMode::Register => {
                let min = self.dapi.regs.reg("scr")?.min.unwrap_or(0);
                let rpm = self
                    .dapi
                    .regs
                    .value_by_name("scr")?
                    .saturating_sub(dec)
                    .max(min);
                self.dapi.write_register("scr", rpm)?;
            }
        }
        Ok(())
    }

    pub fn set_light(&mut self, on: bool) -> Result<(), BoardError> {
        match (self.mode, on) {
            (ControlMode::Command, true) => self.dapi.cmd().light_on()?,
            (ControlMode::Command, false) => self.dapi.cmd().light_off()?,
            (ControlMode::Register, _) => self.write_smr_field("light", on as u16)?,
        }
        Ok(())
    }

    pub fn set_light_intensity(&mut self, percent: u16) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().light_intensity(percent)?,
            ControlMode::Register => self.dapi.write_register("lir", percent)?,
        }
        Ok(())
    }

    /// Light-follows-motor mode, a plain setpoint bit.
    pub fn set_light_auto(&mut self, on: bool) -> Result<(), BoardError> {
        self.write_smr_field("lightauto", on as u16)
    }

    /// Intensity of the alternate (UV) lamp.
    pub fn set_alternate_intensity(&mut self, percent: u16) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().light_alternate(percent)?,
            ControlMode::Register => self.dapi.write_register("alr", percent)?,
        }
        Ok(())
    }

    /// Whether an alternate lamp is fitted, from the status bits.
    pub fn has_alternate_light(&mut self) -> Result<bool, BoardError> {
        self.refresh("ssr2")?;
        Ok(self.dapi.regs.field_value("ssr2", "alt_lmp")? != 0)
    }

    /// Toggles the direction of rotation.
    pub fn reverse_motor(&mut self) -> Result<(), BoardError> {
        match self.mode {
            ControlMode::Command => self.dapi.cmd().motor_reverse()?,
            ControlMode::Register => {
                let reversed = self.dapi.regs.field_value("smr", "reverse").unwrap_or(0);
                self.write_smr_field("reverse", reversed ^ 1)?;
            }
        }
        Ok(())
    }

    /// Selects the direction explicitly, a plain setpoint bit.
    pub fn set_motor_reverse(&mut self, on: bool) -> Result<(), BoardError> {
        self.write_smr_field("reverse", on as u16)
    }

    /// Gear ratio of the attached hand piece; two adjacent setpoint
    /// registers, written in one frame.
    pub fn set_gear_ratio(&mut self, numerator: u16, denominator: u16) -> Result<(), BoardError> {
        let grnr = self.dapi.regs.addr_of("grnr")?;
        let grdr = self.dapi.regs.addr_of("grdr")?;
        self.dapi.regs.set(grnr, numerator);
        self.dapi.regs.set(grdr, denominator);
        self.dapi.write_registers(&[grnr, grdr])?;
        Ok(())
    }

    pub fn set_motor_current_limit(&mut self, milliamps: u16) -> Result<(), BoardError> {
        Ok(self.dapi.write_register("ccr", milliamps)?)
    }

    // ------------------------------------------------------------------
    // Measured values and status
    // ------------------------------------------------------------------

    /// Re-reads one register so measured values are never stale.
    fn refresh(&mut self, name: &str) -> Result<u16, BoardError> {
        let addr = self.dapi.regs.addr_of(name)?;
        self.dapi.read_registers(&[addr])?;
        Ok(self.dapi.regs.value(addr)?)
    }

    /// Actual motor speed in rpm, as measured by the board.
    pub fn measured_speed(&mut self) -> Result<u16, BoardError> {
        self.refresh("msr")
    }

    /// Actual motor current in mA.
    pub fn motor_current(&mut self) -> Result<u16, BoardError> {
        self.refresh("dcr")
    }

    /// Supply voltage in mV.
    pub fn power_supply_voltage(&mut self) -> Result<u16, BoardError> {
        self.refresh("psvr")
    }

    /// Raw reading of analog input 0 or 1.
    pub fn analog_input(&mut self, input: u8) -> Result<u16, BoardError> {
        match input {
            0 => self.refresh("an0r"),
            _ => self.refresh("an1r"),
        }
    }

    /// Cause of the last reset, from the `scsr.reset` bits.
    pub fn last_reset_cause(&mut self) -> Result<u16, BoardError> {
        self.refresh("scsr")?;
        Ok(self.dapi.regs.field_value("scsr", "reset")?)
    }

    /// Current warning/error state: re-reads `wer` and resolves the
    /// code against the catalogue. `None` when the board reports no
    /// error; a non-zero code without a catalogue entry yields
    /// `(code, None)`.
    pub fn device_error(&mut self) -> Result<Option<(u16, Option<ErrorDescr>)>, BoardError> {
        let code = self.refresh("wer")?;
        if code == 0 {
            return Ok(None);
        }
        Ok(Some((code, self.dapi.catalog.lookup(code).cloned())))
    }

    pub fn password_protected(&self) -> Result<bool, BoardError> {
        Ok(self.dapi.regs.field_value("scsr", "pwd")? != 0)
    }

    pub fn watchdog_enabled(&self) -> Result<bool, BoardError> {
        Ok(self.dapi.regs.field_value("scsr", "iwd")? != 0)
    }

    // ------------------------------------------------------------------
    // Settings memory
    // ------------------------------------------------------------------

    /// Stores the current set points into one memory slot.
    pub fn store_settings(&mut self, slot: u8) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().memory_store(slot)?)
    }

    /// Recalls the set points stored in one memory slot.
    pub fn recall_settings(&mut self, slot: u8) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().memory_recall(slot)?)
    }

    /// Resets the stored set points to their factory values.
    pub fn reset_settings(&mut self) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().memory_reset()?)
    }

    /// Reads one stored settings page.
    pub fn read_memory_page(
        &mut self,
        peripheral: u8,
        memory: u8,
        page: u8,
    ) -> Result<[u16; 4], BoardError> {
        Ok(self.dapi.cmd().memory_read(peripheral, memory, page)?)
    }

    /// Reads one full 16-word settings memory, page by page.
    pub fn read_memory_slot(&mut self, peripheral: u8, memory: u8) -> Result<[u16; 16], BoardError> {
        let mut words = [0u16; 16];
        for page in 0..4u8 {
            let chunk = self.dapi.cmd().memory_read(peripheral, memory, page)?;
            words[page as usize * 4..page as usize * 4 + 4].copy_from_slice(&chunk);
        }
        Ok(words)
    }

    // ------------------------------------------------------------------
    // Firmware download
    // ------------------------------------------------------------------

    /// Streams a firmware binary to the board: FLASH_BEGIN with the
    /// total size, the image in zero-padded 8-byte chunks, FLASH_END.
    ///
    /// On success the board reprograms itself and reboots; callers
    /// wait [`WAIT_AFTER_REPROGRAMMING`] before reconnecting.
    #[instrument(skip(self, stream))]
    pub fn flash_binary_firm<R: Read + ?Sized>(&mut self, stream: &mut R) -> Result<(), BoardError> {
        let mut image = Vec::new();
        stream.read_to_end(&mut image)?;
        if image.is_empty() {
            return Err(BoardError::EmptyFirmware);
        }
        let total = image.len() as u64;
        info!(total, "firmware download starting");

        self.dapi.cmd().flash_begin(image.len() as u32)?;
        let mut sent: u64 = 0;
        for chunk in image.chunks(8) {
            let mut padded = [0u8; 8];
            padded[..chunk.len()].copy_from_slice(chunk);
            self.dapi.cmd().flash_data(&padded)?;
            sent += chunk.len() as u64;
            self.shared.emit(&BoardEvent::FlashProgress { sent, total });
        }
        self.dapi.cmd().flash_end()?;
        info!(total, "firmware download complete");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Factory
    // ------------------------------------------------------------------

    pub fn set_sysinfo(
        &mut self,
        serial: u16,
        date: BoardDate,
        hardware: BoardVersion,
    ) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().fact_set_sysinfo(serial, date, hardware)?)
    }

    pub fn set_srvinfo(&mut self, service: u16, date: BoardDate, tag: u16) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().fact_set_srvinfo(service, date, tag)?)
    }

    /// Resets the board's EEPROM to factory values.
    pub fn factory_reset(&mut self) -> Result<(), BoardError> {
        Ok(self.dapi.cmd().fact_eeprom_reset()?)
    }

    pub fn calibrate(&mut self, item: u8, step: u8) -> Result<Option<u16>, BoardError> {
        Ok(self.dapi.cmd().fact_calibration(item, step)?)
    }

    // ------------------------------------------------------------------
    // Identity
    // ------------------------------------------------------------------

    pub fn board_type(&self) -> Result<String, BoardError> {
        Ok(self.dapi.regs.as_string("btr")?)
    }

    pub fn board_number(&self) -> Result<String, BoardError> {
        Ok(self.dapi.regs.as_string("bnr")?)
    }

    pub fn serial_number(&self) -> Result<u16, BoardError> {
        Ok(self.dapi.regs.value_by_name("snr")?)
    }

    pub fn firmware_version(&self) -> Result<BoardVersion, BoardError> {
        Ok(BoardVersion::from_word(self.dapi.regs.value_by_name("svr")?))
    }

    pub fn factory_date(&self) -> Result<BoardDate, BoardError> {
        Ok(BoardDate::from_word(self.dapi.regs.value_by_name("fdr")?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_bnr() {
        assert_eq!(BoardKind::from_bnr("30"), BoardKind::Mb30);
        assert_eq!(BoardKind::from_bnr("60"), BoardKind::Mb60);
        assert_eq!(BoardKind::from_bnr("99"), BoardKind::Generic);
        assert_eq!(BoardKind::from_bnr(""), BoardKind::Generic);
    }
}
