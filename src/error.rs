//! Client error types.

use crate::agent::SessionId;
use crate::transport::TransportError;
use crate::variant::VariantError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Every failure the client surfaces.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The connection could not be opened or broke underneath us.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The connection is gone; every pending call on it has failed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The server answered with a structured error.
    #[error(transparent)]
    RemoteCall(#[from] RemoteCallError),

    #[error(transparent)]
    Variant(#[from] VariantError),

    #[error("malformed agent message: {0}")]
    MalformedAgentMessage(String),

    /// The server replied, but not with the values the method promises.
    #[error("invalid reply to {method}: {reason}")]
    InvalidReply { method: String, reason: String },

    #[error("failed to encode call arguments: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("session {0} has ended")]
    SessionEnded(SessionId),
}

impl Error {
    /// True when the connection is gone and all work on it is invalid.
    pub const fn is_connection_closed(&self) -> bool {
        matches!(self, Self::ConnectionClosed | Self::Transport(_))
    }

    /// True when the server rejected the call.
    pub const fn is_remote(&self) -> bool {
        matches!(self, Self::RemoteCall(_))
    }

    /// The server error, if this is one.
    pub const fn as_remote(&self) -> Option<&RemoteCallError> {
        match self {
            Self::RemoteCall(e) => Some(e),
            _ => None,
        }
    }
}

/// A structured error returned by the server for one call.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{method} failed: {message} ({name})")]
pub struct RemoteCallError {
    /// Remote method that failed.
    pub method: String,
    /// Error name chosen by the server, e.g. `re.frida.Error.ProcessNotFound`.
    pub name: String,
    pub message: String,
}

/// Broad classes of server errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteErrorKind {
    ProcessNotFound,
    ExecutableNotFound,
    PermissionDenied,
    InvalidArgument,
    NotSupported,
    InvalidOperation,
    Other,
}

impl RemoteCallError {
    pub fn kind(&self) -> RemoteErrorKind {
        let short = self.name.rsplit('.').next().unwrap_or(&self.name);
        match short {
            "ProcessNotFound" => RemoteErrorKind::ProcessNotFound,
            "ExecutableNotFound" | "ExecutableNotSupported" => RemoteErrorKind::ExecutableNotFound,
            "PermissionDenied" => RemoteErrorKind::PermissionDenied,
            "InvalidArgument" => RemoteErrorKind::InvalidArgument,
            "NotSupported" => RemoteErrorKind::NotSupported,
            "InvalidOperation" => RemoteErrorKind::InvalidOperation,
            _ => RemoteErrorKind::Other,
        }
    }
}
