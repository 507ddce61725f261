//! End-to-end scenarios against the emulated board: the full stack
//! from board model down to frame bytes, with the emulator answering
//! on the other side of the channel.

mod common;

use std::sync::{Arc, Mutex};

use common::{ALR, EmuBoard, SCR, SMR, SNR, WER};
use dapi2_core::board::{Board, BoardError, BoardEvent, BoardObserver, ControlMode};
use dapi2_core::dapi::{Dapi, DapiConfig, DapiError};
use dapi2_core::derror::{DapiFault, ErrorLevel};
use dapi2_core::protocol::constants::cmd;
use dapi2_core::protocol::{Message, Payload};
use dapi2_core::transport::{DapiLink, LinkConfig};
use dapi2_core::AccessLevel;

fn dapi_on(emu: EmuBoard) -> Dapi<EmuBoard> {
    let link = DapiLink::new(emu, LinkConfig::default());
    Dapi::new(link, DapiConfig::default()).unwrap()
}

/// An identified, initialized MB-30 board.
fn board() -> Board<EmuBoard> {
    let mut board = Board::new(dapi_on(EmuBoard::new("30"))).unwrap();
    board.initialize().unwrap();
    board
}

struct Collect(Arc<Mutex<Vec<BoardEvent>>>);

impl BoardObserver for Collect {
    fn on_event(&self, event: &BoardEvent) {
        self.0.lock().unwrap().push(event.clone());
    }
}

fn observe(board: &Board<EmuBoard>) -> Arc<Mutex<Vec<BoardEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    board.add_observer(Box::new(Collect(events.clone())));
    events
}

#[test]
fn test_connect_and_read_serial_number() {
    let mut board = board();
    board.connect(AccessLevel::User, None).unwrap();

    assert_eq!(board.board_type().unwrap(), "MB");
    assert_eq!(board.board_number().unwrap(), "30");
    assert_eq!(board.serial_number().unwrap(), 1234);
    assert_eq!(board.access_level(), AccessLevel::User);

    let date = board.factory_date().unwrap();
    assert_eq!((date.year, date.month, date.day), (2023, 11, 7));
    assert_eq!(board.firmware_version().unwrap().to_string(), "2.07");
}

#[test]
fn test_connect_with_wrong_password_is_denied() {
    let mut board = board();
    let err = board
        .connect(AccessLevel::Service, Some(0x1234))
        .unwrap_err();
    assert!(matches!(
        err,
        BoardError::Dapi(DapiError::Fault(DapiFault::ConnectionDenied))
    ));
    assert_eq!(board.access_level(), AccessLevel::No);
}

#[test]
fn test_motor_start_in_register_mode() {
    let mut board = board();
    board.set_control_mode(ControlMode::Register);
    board.dapi().link().channel().received.clear();

    board.start_motor(Some(10_000)).unwrap();

    let dapi = board.dapi();
    assert_eq!(dapi.regs.field_value("smr", "start").unwrap(), 1);
    assert!(!dapi.regs.is_modified(SMR));
    assert!(!dapi.regs.is_modified(SCR));

    // Both setpoints landed on the board.
    let emu = board.dapi().link().channel();
    assert_eq!(emu.regs[SCR as usize], 10_000);
    assert_eq!(emu.regs[SMR as usize] & 0x0001, 1);

    // smr and scr are adjacent, so one frame wrote each exactly once.
    let writes: Vec<&Message> = emu
        .received
        .iter()
        .filter(|m| matches!(m, Message::WriteReg { .. }))
        .collect();
    assert_eq!(writes.len(), 1);
    assert_eq!(
        writes[0],
        &Message::write_reg(SMR, &[0x0001, 10_000]).unwrap()
    );
}

#[test]
fn test_light_on_via_command() {
    let mut board = board();
    board.dapi().link().channel().received.clear();

    board.set_light(true).unwrap();

    // Exactly one frame went out: COMMAND, no payload, id 0x41.
    let emu = board.dapi().link().channel();
    assert_eq!(emu.received, vec![Message::command(0x41, Payload::new())]);
    assert_eq!(emu.regs[SMR as usize] & 0x0100, 0x0100);

    // The local mirror followed without any read.
    assert_eq!(
        board.dapi().regs.field_value("smr", "light").unwrap(),
        1
    );
}

#[test]
fn test_flash_firmware_forty_bytes() {
    let mut board = board();
    let events = observe(&board);
    board.dapi().link().channel().received.clear();

    let image: Vec<u8> = (0u8..40).collect();
    board.flash_binary_firm(&mut &image[..]).unwrap();

    // FLASH_BEGIN, five data chunks, FLASH_END — in that order.
    let emu = board.dapi().link().channel();
    let mut expected = vec![cmd::FLASH_BEGIN];
    expected.extend(std::iter::repeat_n(cmd::FLASH_DATA, 5));
    expected.push(cmd::FLASH_END);
    assert_eq!(emu.commands(), expected);
    assert_eq!(emu.flash, image);

    let events = events.lock().unwrap();
    let progress: Vec<(u64, u64)> = events
        .iter()
        .filter_map(|e| match e {
            BoardEvent::FlashProgress { sent, total } => Some((*sent, *total)),
            _ => None,
        })
        .collect();
    assert_eq!(progress.len(), 5);
    assert_eq!(progress.last(), Some(&(40, 40)));
}

#[test]
fn test_writing_read_only_register_is_refused() {
    let mut board = board();
    let dapi = board.dapi();

    dapi.regs.set(SNR, 9999);
    let err = dapi.write_registers(&[SNR]).unwrap_err();
    assert!(matches!(
        err,
        DapiError::Fault(DapiFault::ReadOnly { addr }) if addr == SNR
    ));

    // Local model untouched by the refusal; the board kept its value.
    assert_eq!(dapi.regs.value(SNR).unwrap(), 9999);
    assert!(dapi.regs.is_modified(SNR));
    assert_eq!(board.dapi().link().channel().regs[SNR as usize], 1234);
}

#[test]
fn test_auto_baud_detection() {
    let mut emu = EmuBoard::new("30");
    emu.active_baud = Some(38_400);

    let mut dapi = dapi_on(emu);
    assert_eq!(dapi.open().unwrap(), 38_400);

    // The detected rate carries over to normal operation.
    let mut board = Board::new(dapi).unwrap();
    board.initialize().unwrap();
    assert_eq!(board.board_type().unwrap(), "MB");
}

#[test]
fn test_workspace_changes_emit_events() {
    let mut board = board();
    let events = observe(&board);

    // Initialized from par = 1.
    assert_eq!(board.active_workspace().unwrap().par, 1);
    assert_eq!(board.workspaces().len(), 3); // standby + two peripherals
    board.dapi().link().channel().received.clear();

    board.set_workspace(2).unwrap();
    assert_eq!(board.active_workspace().unwrap().par, 2);

    board.standby().unwrap();
    assert!(board.active_workspace().unwrap().is_standby());

    // Switching between two peripherals passes through standby.
    assert_eq!(
        board.dapi().link().channel().commands(),
        vec![cmd::STANDBY, cmd::PERIPHERAL_ACTIVATE, cmd::STANDBY]
    );

    let pars: Vec<u16> = events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            BoardEvent::WorkspaceChanged { par } => Some(*par),
            _ => None,
        })
        .collect();
    assert_eq!(pars, vec![0, 2, 0]);

    let err = board.set_workspace(7).unwrap_err();
    assert!(matches!(err, BoardError::UnknownWorkspace { par: 7 }));
}

#[test]
fn test_initialize_requires_a_workspace() {
    let mut emu = EmuBoard::new("30");
    emu.regs[0x30] = 0;
    emu.regs[0x31] = 0;

    let mut board = Board::new(dapi_on(emu)).unwrap();
    assert!(matches!(board.initialize(), Err(BoardError::NoWorkspace)));

    // Dev mode tolerates a bare board.
    let mut emu = EmuBoard::new("30");
    emu.regs[0x30] = 0;
    emu.regs[0x31] = 0;
    let link = DapiLink::new(emu, LinkConfig::default());
    let config = DapiConfig {
        dev_mode: true,
        ..DapiConfig::default()
    };
    let mut board = Board::new(Dapi::new(link, config).unwrap()).unwrap();
    board.initialize().unwrap();
    assert!(board.active_workspace().is_none() || board.active_workspace().unwrap().is_standby());
}

#[test]
fn test_measured_values_are_reread() {
    let mut board = board();

    board.dapi().link().channel().regs[0x12] = 7777;
    assert_eq!(board.measured_speed().unwrap(), 7777);

    // A second call must hit the wire again, not the mirror.
    board.dapi().link().channel().regs[0x12] = 8888;
    assert_eq!(board.measured_speed().unwrap(), 8888);
}

#[test]
fn test_settings_memory_roundtrip() {
    let mut board = board();
    let page = board.read_memory_page(1, 2, 0).unwrap();
    assert_eq!(page, [1, 2, 0, 0xABCD]);

    let slot = board.read_memory_slot(1, 2).unwrap();
    for page in 0..4u16 {
        assert_eq!(
            slot[page as usize * 4..page as usize * 4 + 4],
            [1, 2, page, 0xABCD]
        );
    }

    // Store and recall address a slot by number.
    board.dapi().link().channel().received.clear();
    board.store_settings(3).unwrap();
    board.recall_settings(3).unwrap();
    board.reset_settings().unwrap();
    let emu = board.dapi().link().channel();
    assert_eq!(
        emu.commands(),
        vec![cmd::MEMORY_STORE, cmd::MEMORY_RECALL, cmd::MEMORY_RESET]
    );
    assert_eq!(
        emu.received[0],
        Message::command(cmd::MEMORY_STORE, Payload::new().with_byte(3))
    );
}

#[test]
fn test_motor_commands_use_the_board_ids() {
    let mut board = board();
    board.dapi().link().channel().received.clear();

    board.start_motor(Some(2_500)).unwrap();
    let emu = board.dapi().link().channel();
    assert_eq!(
        emu.received[0],
        Message::command(0x22, Payload::new().with_word(2_500))
    );
    assert_eq!(emu.regs[SMR as usize] & 0x0001, 1);
    assert_eq!(emu.regs[SCR as usize], 2_500);
    // The setpoint mirror was re-read from the board.
    assert_eq!(board.dapi().regs.value_by_name("scr").unwrap(), 2_500);

    board.increase_motor_speed(300).unwrap();
    board.decrease_motor_speed(100).unwrap();
    assert_eq!(board.dapi().link().channel().regs[SCR as usize], 2_700);
    assert_eq!(board.dapi().regs.value_by_name("scr").unwrap(), 2_700);

    board.reverse_motor().unwrap();
    assert_eq!(board.dapi().link().channel().regs[SMR as usize] & 0x0004, 0x0004);

    board.freewheel_stop_motor().unwrap();
    let emu = board.dapi().link().channel();
    assert_eq!(emu.regs[SMR as usize] & 0x0003, 0x0002);

    assert_eq!(emu.commands(), vec![0x22, 0x23, 0x24, 0x25, 0x20]);
}

#[test]
fn test_alternate_light_level() {
    let mut board = board();
    board.dapi().link().channel().received.clear();

    board.set_alternate_intensity(60).unwrap();
    let emu = board.dapi().link().channel();
    assert_eq!(emu.commands(), vec![cmd::LIGHT_ALTERNATE]);
    assert_eq!(emu.regs[ALR as usize], 60);
    assert_eq!(board.dapi().regs.value_by_name("alr").unwrap(), 60);
}

#[test]
fn test_device_error_resolves_against_catalogue() {
    let mut board = board();
    assert!(board.device_error().unwrap().is_none());

    board.dapi().link().channel().regs[WER as usize] = 0x41;
    let (code, descr) = board.device_error().unwrap().unwrap();
    assert_eq!(code, 0x41);
    let descr = descr.unwrap();
    assert_eq!(descr.name, "MOTOR_STALLED");
    assert_eq!(descr.level, ErrorLevel::Warning);

    // Cleared on the board, cleared here: every call re-reads.
    board.dapi().link().channel().regs[WER as usize] = 0;
    assert!(board.device_error().unwrap().is_none());
}

#[test]
fn test_calibration_faults_are_typed() {
    let mut board = board();
    assert_eq!(board.calibrate(1, 2).unwrap(), Some(102));

    let err = board.calibrate(5, 0).unwrap_err();
    assert!(matches!(
        err,
        BoardError::Dapi(DapiError::Fault(DapiFault::CalibrationWrongItem))
    ));

    let err = board.calibrate(1, 9).unwrap_err();
    assert!(matches!(
        err,
        BoardError::Dapi(DapiError::Fault(DapiFault::CalibrationWrongStep))
    ));
}
