//! Transport: channel abstraction, stop-and-wait link, serial and
//! proxy backends, plus a scripted mock.

pub mod link;
pub mod mock;
pub mod proxy;
pub mod serial;
pub mod traits;

pub use link::{DapiLink, Direction, LinkConfig, TraceFrame, TraceHook};
pub use mock::MockChannel;
pub use proxy::{ProxyChannel, ProxyEntry};
pub use serial::SerialChannel;
pub use traits::{Channel, TransportError};
