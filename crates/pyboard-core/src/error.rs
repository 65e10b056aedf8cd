//! Controller error taxonomy.

use thiserror::Error;

use crate::traits::DeviceError;

/// Error returned by every controller operation.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },
    #[error("No raw REPL response from {port}")]
    HandshakeTimeout { port: String },
    #[error("Not connected")]
    NotConnected,
    #[error("Already connected to {0}")]
    AlreadyConnected(String),
    #[error("Protocol error: {0}")]
    Protocol(String),
    #[error("Remote execution failed: {0}")]
    RemoteExecution(String),
    #[error("{0} is protected")]
    ProtectedFile(String),
    #[error("Content is not valid UTF-8: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),
    #[error("Transport lost: {0}")]
    TransportLost(String),
    #[error("Malformed response: {0}")]
    MalformedResponse(String),
    #[error("Host I/O error: {0}")]
    HostIo(String),
}

impl ControllerError {
    /// Whether this failure tears the session down.
    #[must_use]
    pub const fn forces_disconnect(&self) -> bool {
        matches!(self, Self::Protocol(_) | Self::TransportLost(_))
    }

    /// Classify a failure from the body of a framed operation.
    #[must_use]
    pub fn from_device(err: DeviceError) -> Self {
        match err {
            DeviceError::Remote(traceback) => Self::RemoteExecution(traceback),
            DeviceError::Disconnected => Self::TransportLost("device disconnected".to_string()),
            DeviceError::Io(e) => Self::TransportLost(e.to_string()),
            DeviceError::Open { port, reason } => Self::PortUnavailable { port, reason },
            DeviceError::Timeout => Self::Protocol("device stopped responding".to_string()),
            DeviceError::RawRepl(msg) => Self::Protocol(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_protocol_and_transport_lost_force_disconnect() {
        assert!(ControllerError::Protocol("x".into()).forces_disconnect());
        assert!(ControllerError::TransportLost("x".into()).forces_disconnect());

        assert!(!ControllerError::NotConnected.forces_disconnect());
        assert!(!ControllerError::RemoteExecution("x".into()).forces_disconnect());
        assert!(!ControllerError::ProtectedFile("boot.py".into()).forces_disconnect());
        assert!(!ControllerError::MalformedResponse("x".into()).forces_disconnect());
        let encoding = String::from_utf8(vec![0xff]).unwrap_err();
        assert!(!ControllerError::from(encoding).forces_disconnect());
    }

    #[test]
    fn device_errors_map_onto_taxonomy() {
        assert!(matches!(
            ControllerError::from_device(DeviceError::Remote("OSError".into())),
            ControllerError::RemoteExecution(_)
        ));
        assert!(matches!(
            ControllerError::from_device(DeviceError::Disconnected),
            ControllerError::TransportLost(_)
        ));
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        assert!(matches!(
            ControllerError::from_device(DeviceError::Io(io)),
            ControllerError::TransportLost(_)
        ));
        assert!(matches!(
            ControllerError::from_device(DeviceError::RawRepl("no OK".into())),
            ControllerError::Protocol(_)
        ));
    }
}
