//! Pyboard session control.
//!
//! Provides:
//! - `SessionManager` - connect/disconnect and FIFO execution of board operations
//! - `PortMonitor` - port presence polling and loss detection
//! - Remote filesystem snippets and listing parsing

pub mod fs;
pub mod manager;
pub mod monitor;
pub mod operation;
pub mod session;

pub use fs::RemoteFileEntry;
pub use manager::SessionManager;
pub use monitor::PortMonitor;
pub use operation::{Operation, OperationOutput};
pub use session::{SessionId, SessionState, SessionStatus};
