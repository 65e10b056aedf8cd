//! Core abstractions for a serial pyboard session controller.
//!
//! This crate provides the fundamental building blocks:
//! - `DeviceConnector` / `DeviceLink` / `PortLister` - the device adapter contract
//! - `ControllerError` - Typed failures and the teardown rule
//! - `ProtectedFiles` - Protected-file policy
//! - `OutputRouter` - Program log and device console sinks
//! - `ControllerConfig` - Host-provided settings
//! - `SimulatedBoard` - In-memory board for tests and offline use

pub mod config;
pub mod error;
pub mod literal;
pub mod output;
pub mod policy;
pub mod sim;
pub mod traits;

pub use config::ControllerConfig;
pub use error::ControllerError;
pub use output::{OutputRouter, Sink, SinkBuffer, SinkReader};
pub use policy::ProtectedFiles;
pub use sim::SimulatedBoard;
pub use traits::{BaudRate, ChunkCallback, DeviceConnector, DeviceError, DeviceLink, PortLister};
