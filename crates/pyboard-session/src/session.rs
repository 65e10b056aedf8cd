//! The live binding between a port and an open device link.

use std::fmt;

use pyboard_core::{BaudRate, DeviceLink};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Session identifier, used to correlate log lines.
pub type SessionId = Uuid;

/// Connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "Disconnected",
            Self::Connecting => "Connecting",
            Self::Connected => "Connected",
        })
    }
}

/// Published view of the current session.
#[derive(Debug, Clone, Default)]
pub struct SessionStatus {
    pub state: SessionState,
    pub id: Option<SessionId>,
    pub port: Option<String>,
    pub baud: Option<BaudRate>,
    /// Cancelled when the bound port vanishes.
    pub(crate) lost: Option<CancellationToken>,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected)
    }

    pub(crate) fn connecting(port: &str, baud: BaudRate) -> Self {
        Self {
            state: SessionState::Connecting,
            id: None,
            port: Some(port.to_string()),
            baud: Some(baud),
            lost: None,
        }
    }
}

/// Open session, owned by the command serializer.
pub(crate) struct Session {
    pub id: SessionId,
    pub port: String,
    pub baud: BaudRate,
    pub link: Box<dyn DeviceLink>,
    pub lost: CancellationToken,
}

impl Session {
    pub fn new(port: String, baud: BaudRate, link: Box<dyn DeviceLink>) -> Self {
        Self {
            id: Uuid::new_v4(),
            port,
            baud,
            link,
            lost: CancellationToken::new(),
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: SessionState::Connected,
            id: Some(self.id),
            port: Some(self.port.clone()),
            baud: Some(self.baud),
            lost: Some(self.lost.clone()),
        }
    }
}
