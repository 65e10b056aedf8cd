//! Operations accepted by the command serializer.

use std::fmt;

use crate::fs::RemoteFileEntry;

/// A request to run against the connected board.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// List a remote directory; `""` is the current directory.
    List { path: String },
    /// Read a remote file in `chunk_size` pieces.
    Read { path: String, chunk_size: usize },
    /// Store bytes under `remote_name`.
    Write {
        data: Vec<u8>,
        remote_name: String,
        allow_protected_override: bool,
    },
    /// Remove `remote_name`.
    Delete {
        remote_name: String,
        allow_protected_override: bool,
    },
    /// Run code, streaming output to the device console.
    RunSnippet { code: String },
    /// Echo `text` to the device console, then run it.
    RunFreeText { text: String },
}

impl Operation {
    /// Remote name touched by a destructive operation.
    #[must_use]
    pub fn protected_target(&self) -> Option<(&str, bool)> {
        match self {
            Self::Write {
                remote_name,
                allow_protected_override,
                ..
            }
            | Self::Delete {
                remote_name,
                allow_protected_override,
            } => Some((remote_name, *allow_protected_override)),
            _ => None,
        }
    }

    /// Whether the displayed listing is refreshed after success.
    #[must_use]
    pub const fn refreshes_listing(&self) -> bool {
        matches!(self, Self::Write { .. } | Self::Delete { .. })
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::List { path } if path.is_empty() => write!(f, "list"),
            Self::List { path } => write!(f, "list {path}"),
            Self::Read { path, .. } => write!(f, "read {path}"),
            Self::Write {
                data, remote_name, ..
            } => write!(f, "write {remote_name} ({} bytes)", data.len()),
            Self::Delete { remote_name, .. } => write!(f, "delete {remote_name}"),
            Self::RunSnippet { .. } => write!(f, "run snippet"),
            Self::RunFreeText { text } => write!(f, "run {text:?}"),
        }
    }
}

/// Successful result of an [`Operation`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationOutput {
    /// Entries from `List`.
    Listing(Vec<RemoteFileEntry>),
    /// File bytes from `Read`.
    Content(Vec<u8>),
    /// Everything printed by `RunSnippet` / `RunFreeText`.
    Output(Vec<u8>),
    /// `Write` or `Delete` completed.
    Done,
}
