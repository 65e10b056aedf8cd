//! Serial transport for MicroPython boards.
//!
//! Provides:
//! - `SerialConnector` / `SerialLink` - raw REPL device links over `serialport`
//! - `SystemPortLister` - OS port enumeration
//! - `RawRepl` - the blocking raw REPL protocol itself

pub mod link;
pub mod ports;
pub mod raw_repl;

pub use link::{SerialConnector, SerialLink};
pub use ports::SystemPortLister;
pub use raw_repl::RawRepl;
