//! An emulated board implementing the slave side of the protocol,
//! used by the end-to-end scenarios. It answers through the `Channel`
//! trait, so the whole stack above it runs unmodified.

use std::collections::VecDeque;
use std::time::Duration;

use dapi2_core::protocol::constants::{ACK, NAK, cmd, errcode};
use dapi2_core::protocol::{FrameReader, Message, MsgType, Payload, ReaderStatus};
use dapi2_core::transport::{Channel, TransportError};
use dapi2_core::Side;

// Register addresses of the shipped map.
pub const BTR: u8 = 0x00;
pub const BNR: u8 = 0x01;
pub const SNR: u8 = 0x02;
pub const FDR: u8 = 0x03;
pub const HVR: u8 = 0x04;
pub const SVR: u8 = 0x05;
pub const SCSR: u8 = 0x0A;
pub const WER: u8 = 0x0C;
pub const PAR: u8 = 0x0D;
pub const SMR: u8 = 0x20;
pub const SCR: u8 = 0x21;
pub const LIR: u8 = 0x24;
pub const ALR: u8 = 0x25;
pub const PCR0: u8 = 0x30;

const USER_PASSWORD: u16 = 0x0000;
const SERVICE_PASSWORD: u16 = 0xE8E8;
const FACTORY_PASSWORD: u16 = 0xF3F3;

/// Last register address the emulated board answers for.
const TOP_ADDR: u8 = 0x47;

pub struct EmuBoard {
    pub regs: [u16; 256],
    reader: FrameReader,
    out: VecDeque<u8>,
    access: u8,
    /// Every decoded master message, in arrival order.
    pub received: Vec<Message>,
    /// When set, the board stays silent unless the line speed matches.
    pub active_baud: Option<u32>,
    current_baud: u32,
    /// Firmware download state.
    pub flash: Vec<u8>,
    flash_expected: usize,
    flashing: bool,
}

impl EmuBoard {
    /// A factory-fresh MB board with the given number, workspace 1
    /// active and two peripherals configured.
    pub fn new(number: &str) -> Self {
        let mut regs = [0u16; 256];
        regs[BTR as usize] = u16::from_be_bytes([b'M', b'B']);
        let n = number.as_bytes();
        regs[BNR as usize] = u16::from_be_bytes([n[0], n[1]]);
        regs[SNR as usize] = 1234;
        regs[FDR as usize] = (23 << 9) | (11 << 5) | 7; // 2023-11-07
        regs[HVR as usize] = 0x0102;
        regs[SVR as usize] = 0x0207;
        regs[PAR as usize] = 1;
        regs[PCR0 as usize] = 0x0101;
        regs[PCR0 as usize + 1] = 0x0201;

        Self {
            regs,
            reader: FrameReader::new(Side::Master),
            out: VecDeque::new(),
            access: 0,
            received: Vec::new(),
            active_baud: None,
            current_baud: 115_200,
            flash: Vec::new(),
            flash_expected: 0,
            flashing: false,
        }
    }

    pub fn commands(&self) -> Vec<u8> {
        self.received
            .iter()
            .filter_map(|m| match m {
                Message::Command { cmd, .. } => Some(*cmd),
                _ => None,
            })
            .collect()
    }

    fn read_only(addr: u8) -> bool {
        !matches!(addr, PAR | 0x0F | 0x20..=0x28 | 0x44..=0x47)
    }

    fn reply(&mut self, msg: Message) {
        self.out.push_back(ACK);
        self.out.extend(msg.to_bytes());
    }

    fn handle(&mut self, msg: Message) {
        self.received.push(msg.clone());
        let reply = match &msg {
            Message::ReadReg { addr, count } => self.handle_read(*addr, *count),
            Message::WriteReg { addr, data } => self.handle_write(*addr, data),
            Message::Command { cmd, data } => self.handle_command(*cmd, data),
            // Replies have no business arriving here.
            _ => Message::error(msg.mtype(), msg.addr(), errcode::MALFORMED_MESSAGE),
        };
        self.reply(reply);
    }

    fn handle_read(&self, addr: u8, count: u8) -> Message {
        let n = (count / 2) as usize;
        if addr as usize + n > TOP_ADDR as usize + 1 {
            return Message::error(MsgType::Read, addr, errcode::WRONG_ADDRESS);
        }
        let values: Vec<u16> = (0..n).map(|i| self.regs[addr as usize + i]).collect();
        Message::reg_values(addr, &values).unwrap()
    }

    fn handle_write(&mut self, addr: u8, data: &Payload) -> Message {
        let words: Vec<u16> = data.words().collect();
        if addr as usize + words.len() > TOP_ADDR as usize + 1 {
            return Message::error(MsgType::Write, addr, errcode::WRONG_ADDRESS);
        }
        for (i, _) in words.iter().enumerate() {
            let a = addr + i as u8;
            if Self::read_only(a) {
                return Message::error(MsgType::Write, a, errcode::READ_ONLY);
            }
        }
        for (i, &w) in words.iter().enumerate() {
            self.regs[addr as usize + i] = w;
        }
        Message::write_reg(addr, &words).unwrap()
    }

    fn handle_command(&mut self, id: u8, data: &Payload) -> Message {
        let ok = Message::response(id, Payload::new());
        match id {
            cmd::CONNECT => {
                let level = data.byte(0).unwrap_or(0);
                let password = match (data.byte(1), data.byte(2)) {
                    (Some(hi), Some(lo)) => Some(u16::from_be_bytes([hi, lo])),
                    _ => None,
                };
                let expected = match level {
                    0 | 1 => USER_PASSWORD,
                    2 => SERVICE_PASSWORD,
                    _ => FACTORY_PASSWORD,
                };
                if password == Some(expected) {
                    self.access = level;
                    self.regs[SCSR as usize] =
                        (self.regs[SCSR as usize] & !0x3) | (level as u16 & 0x3);
                    ok
                } else {
                    Message::error(MsgType::Command, id, 0x81)
                }
            }
            cmd::DISCONNECT => {
                self.access = 0;
                self.regs[SCSR as usize] &= !0x3;
                ok
            }
            cmd::REBOOT => {
                self.access = 0;
                self.regs[SCSR as usize] &= !0x3;
                ok
            }
            cmd::STANDBY => {
                self.regs[PAR as usize] = 0;
                ok
            }
            cmd::PERIPHERAL_ACTIVATE => {
                self.regs[PAR as usize] = data.word(0).unwrap_or(0);
                ok
            }
            cmd::MOTOR_START => {
                self.regs[SMR as usize] |= 0x0001;
                let speed = data.word(0).unwrap_or(0);
                if speed != 0 {
                    self.regs[SCR as usize] = speed;
                }
                ok
            }
            cmd::MOTOR_STOP => {
                self.regs[SMR as usize] &= !0x0001;
                ok
            }
            cmd::MOTOR_FREEWHEEL_STOP => {
                self.regs[SMR as usize] = (self.regs[SMR as usize] & !0x0001) | 0x0002;
                ok
            }
            cmd::MOTOR_INC_SPEED => {
                self.regs[SCR as usize] =
                    self.regs[SCR as usize].saturating_add(data.word(0).unwrap_or(0));
                ok
            }
            cmd::MOTOR_DEC_SPEED => {
                self.regs[SCR as usize] =
                    self.regs[SCR as usize].saturating_sub(data.word(0).unwrap_or(0));
                ok
            }
            cmd::MOTOR_REVERSE => {
                self.regs[SMR as usize] ^= 0x0004;
                ok
            }
            cmd::LIGHT_ON => {
                self.regs[SMR as usize] |= 0x0100;
                ok
            }
            cmd::LIGHT_OFF => {
                self.regs[SMR as usize] &= !0x0100;
                ok
            }
            cmd::LIGHT_INTENSITY => {
                self.regs[LIR as usize] = data.word(0).unwrap_or(0);
                ok
            }
            cmd::LIGHT_ALTERNATE => {
                self.regs[ALR as usize] = data.word(0).unwrap_or(0);
                ok
            }
            cmd::GET_MC_SN => Message::response(
                id,
                Payload::new().with_dword(0x0012_3456 + data.byte(0).unwrap_or(0) as u32),
            ),
            cmd::MEMORY_READ => {
                let p = data.byte(0).unwrap_or(0) as u16;
                let slot = data.byte(1).unwrap_or(0) as u16;
                let page = data.byte(2).unwrap_or(0) as u16;
                Message::response(
                    id,
                    Payload::new()
                        .with_word(p)
                        .with_word(slot)
                        .with_word(page)
                        .with_word(0xABCD),
                )
            }
            cmd::FLASH_BEGIN => {
                self.flash_expected = data.dword(0).unwrap_or(0) as usize;
                self.flash.clear();
                self.flashing = true;
                ok
            }
            cmd::FLASH_DATA => {
                if !self.flashing {
                    return Message::error(MsgType::Command, id, 0x82);
                }
                self.flash.extend_from_slice(data.as_slice());
                ok
            }
            cmd::FLASH_END => {
                if !self.flashing || self.flash.len() < self.flash_expected {
                    return Message::error(MsgType::Command, id, 0x82);
                }
                self.flashing = false;
                self.flash.truncate(self.flash_expected);
                ok
            }
            cmd::FACT_SET_SYSINFO => {
                if self.access < 3 {
                    return Message::error(MsgType::Command, id, errcode::ACCESS_DENIED);
                }
                self.regs[SNR as usize] = data.word(0).unwrap_or(0);
                self.regs[FDR as usize] = data.word(1).unwrap_or(0);
                self.regs[HVR as usize] = data.word(2).unwrap_or(0);
                ok
            }
            cmd::FACT_CALIBRATION => {
                let item = data.byte(0).unwrap_or(0);
                let step = data.byte(1).unwrap_or(0);
                if item > 2 {
                    Message::error(MsgType::Command, id, 0x81)
                } else if step > 3 {
                    Message::error(MsgType::Command, id, 0x82)
                } else {
                    Message::response(id, Payload::new().with_word(100 * item as u16 + step as u16))
                }
            }
            _ => ok,
        }
    }

    fn on_line(&self) -> bool {
        self.active_baud.is_none_or(|b| b == self.current_baud)
    }
}

impl Channel for EmuBoard {
    fn write(&mut self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.on_line() {
            return Ok(());
        }
        for &b in bytes {
            match self.reader.push(b) {
                ReaderStatus::Pending => {}
                ReaderStatus::Ack | ReaderStatus::Nak => self.reader.reset(),
                ReaderStatus::Complete(msg) => {
                    self.reader.reset();
                    self.handle(msg);
                }
                ReaderStatus::Failed(_) => {
                    self.reader.reset();
                    self.out.push_back(NAK);
                }
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, TransportError> {
        Ok(self.out.pop_front())
    }

    fn flush_input(&mut self) -> Result<(), TransportError> {
        self.out.clear();
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> Result<(), TransportError> {
        self.current_baud = baud;
        self.reader.reset();
        self.out.clear();
        Ok(())
    }

    fn descriptor(&self) -> String {
        format!("emu@{}", self.current_baud)
    }
}
