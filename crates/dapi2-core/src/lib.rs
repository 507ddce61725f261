//! DAPI2: binary register/command protocol for motor-control boards.
//!
//! This crate implements the full master side of the protocol: message
//! codec, stop-and-wait transport over serial or a TCP proxy, a local
//! register model loaded from a hardware description, and a board
//! model with workspaces, commands and firmware download.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: frame constants, CRC, message codec, frame reader
//! - **Transport**: byte channel abstraction (serial, proxy, mock) and
//!   the stop-and-wait link with ACK/NAK and retries
//! - **Registers**: local 16-bit register model with groups, arrays,
//!   bit fields, change signalling and dirty tracking
//! - **Derror**: command refusal taxonomy and the device error catalogue
//! - **Dapi**: facade composing codec + link + registers
//! - **Board**: product-level lifecycle, workspaces and operations
//!
//! # Example
//!
//! ```no_run
//! use dapi2_core::board::Board;
//! use dapi2_core::dapi::{Dapi, DapiConfig};
//! use dapi2_core::transport::{DapiLink, LinkConfig, SerialChannel};
//!
//! let channel = SerialChannel::open("/dev/ttyUSB0", 115_200).expect("open failed");
//! let link = DapiLink::new(channel, LinkConfig::default());
//! let mut dapi = Dapi::new(link, DapiConfig::default()).expect("bad register map");
//! dapi.open().expect("no board found");
//!
//! let mut board = Board::new(dapi).expect("identification failed");
//! board.initialize().expect("initialization failed");
//! println!("serial number: {}", board.serial_number().unwrap());
//! ```

pub mod board;
pub mod common;
pub mod dapi;
pub mod derror;
pub mod protocol;
pub mod registers;
pub mod transport;

// Re-exports for convenience
pub use board::{Board, BoardError, BoardEvent, BoardKind, BoardObserver, ControlMode};
pub use common::{AccessLevel, BoardDate, BoardVersion, Side};
pub use dapi::{Dapi, DapiConfig, DapiError};
pub use derror::{DapiFault, ErrorCatalog, ErrorLevel};
pub use protocol::{FrameReader, Message, MsgType, Payload};
pub use registers::{RegisterFile, plan_chunks};
pub use transport::{Channel, DapiLink, LinkConfig, MockChannel, ProxyChannel, SerialChannel, TransportError};
