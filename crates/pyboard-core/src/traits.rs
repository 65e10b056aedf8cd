//! Device protocol adapter contract.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported serial baud rates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum BaudRate {
    /// 9600 baud.
    B9600,
    /// 115200 baud.
    #[default]
    B115200,
}

impl BaudRate {
    /// All supported rates, default first.
    pub const ALL: [Self; 2] = [Self::B115200, Self::B9600];

    /// Numeric value in bits per second.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        match self {
            Self::B9600 => 9600,
            Self::B115200 => 115_200,
        }
    }
}

impl From<BaudRate> for u32 {
    fn from(baud: BaudRate) -> Self {
        baud.as_u32()
    }
}

impl TryFrom<u32> for BaudRate {
    type Error = UnsupportedBaudRate;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            9600 => Ok(Self::B9600),
            115_200 => Ok(Self::B115200),
            other => Err(UnsupportedBaudRate(other)),
        }
    }
}

impl fmt::Display for BaudRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u32())
    }
}

/// Baud rate outside the supported set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unsupported baud rate {0} (expected 115200 or 9600)")]
pub struct UnsupportedBaudRate(pub u32);

/// Adapter-level failure.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("Failed to open {port}: {reason}")]
    Open { port: String, reason: String },
    #[error("Timed out waiting for device")]
    Timeout,
    #[error("Raw REPL error: {0}")]
    RawRepl(String),
    #[error("Remote exception: {0}")]
    Remote(String),
    #[error("Device disconnected")]
    Disconnected,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Callback invoked with each output fragment while code executes.
pub type ChunkCallback<'a> = &'a (dyn Fn(&[u8]) + Send + Sync);

/// An open handle to a board.
///
/// Every method assumes exclusive access; callers serialize use through
/// `&mut self`. `put_file`, `remove_file` and `execute` expect the board to
/// already be in raw REPL mode.
#[async_trait]
pub trait DeviceLink: Send {
    /// Switch the remote interpreter into raw REPL mode.
    async fn enter_raw_repl(&mut self) -> Result<(), DeviceError>;

    /// Return the remote interpreter to the friendly REPL.
    async fn exit_raw_repl(&mut self) -> Result<(), DeviceError>;

    /// Execute `code`, streaming output fragments to `on_chunk` as they
    /// arrive. Returns the full concatenated output.
    async fn execute(
        &mut self,
        code: &str,
        on_chunk: ChunkCallback<'_>,
    ) -> Result<Vec<u8>, DeviceError>;

    /// Write `data` to `remote_name` on the board filesystem.
    async fn put_file(&mut self, data: &[u8], remote_name: &str) -> Result<(), DeviceError>;

    /// Remove `remote_name` from the board filesystem.
    async fn remove_file(&mut self, remote_name: &str) -> Result<(), DeviceError>;

    /// Release the underlying transport.
    async fn close(&mut self) -> Result<(), DeviceError>;
}

/// Opens links to boards.
#[async_trait]
pub trait DeviceConnector: Send + Sync {
    /// Open a link on `port` at `baud`.
    async fn open(&self, port: &str, baud: BaudRate) -> Result<Box<dyn DeviceLink>, DeviceError>;
}

/// Enumerates serial ports visible to the host.
#[async_trait]
pub trait PortLister: Send + Sync {
    /// Current port identifiers.
    async fn list_ports(&self) -> Result<Vec<String>, DeviceError>;
}
