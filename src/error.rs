//! Error types for snekrpc.
//!
//! Local failures are represented by [`RpcError`]. When an error crosses the
//! wire it is projected onto the closed [`ErrorKind`] taxonomy carried in
//! `ERROR` messages; the receiving side surfaces it as [`RpcError::Remote`].

use std::fmt;

use thiserror::Error;

/// Wire-level error taxonomy carried in `ERROR` messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Underlying byte channel failed.
    Transport,
    /// Encode/decode failed.
    Codec,
    /// Malformed frame or illegal message sequence.
    Protocol,
    /// No common codec during handshake.
    CodecNegotiation,
    /// Dispatch miss: no such service.
    UnknownService,
    /// Dispatch miss: no such command.
    UnknownCommand,
    /// Argument count/type mismatch.
    BadArguments,
    /// Peer or local cancellation.
    Cancelled,
    /// Deadline exceeded.
    Timeout,
    /// A user command failed.
    Command,
    /// Dispatcher bug; never expected.
    Internal,
}

impl ErrorKind {
    /// Canonical wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transport => "TransportError",
            ErrorKind::Codec => "CodecError",
            ErrorKind::Protocol => "ProtocolError",
            ErrorKind::CodecNegotiation => "CodecNegotiation",
            ErrorKind::UnknownService => "UnknownService",
            ErrorKind::UnknownCommand => "UnknownCommand",
            ErrorKind::BadArguments => "BadArguments",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Timeout => "TimeoutError",
            ErrorKind::Command => "CommandError",
            ErrorKind::Internal => "Internal",
        }
    }

    /// Parse a wire name. Unrecognized names map to `Internal` so a newer
    /// peer cannot crash an older one.
    pub fn from_wire(name: &str) -> ErrorKind {
        match name {
            "TransportError" => ErrorKind::Transport,
            "CodecError" => ErrorKind::Codec,
            "ProtocolError" => ErrorKind::Protocol,
            "CodecNegotiation" => ErrorKind::CodecNegotiation,
            "UnknownService" => ErrorKind::UnknownService,
            "UnknownCommand" => ErrorKind::UnknownCommand,
            "BadArguments" => ErrorKind::BadArguments,
            "Cancelled" => ErrorKind::Cancelled,
            "TimeoutError" => ErrorKind::Timeout,
            "CommandError" => ErrorKind::Command,
            _ => ErrorKind::Internal,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error reported by the remote peer via an `ERROR` message.
#[derive(Debug, Clone)]
pub struct RemoteError {
    /// Wire taxonomy kind.
    pub kind: ErrorKind,
    /// Human-readable description.
    pub message: String,
    /// Remote traceback, present only when the server exposes them.
    pub traceback: Option<String>,
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.traceback {
            Some(tb) if !tb.is_empty() => write!(f, "{}: {}\n{}", self.kind, self.message, tb),
            _ => write!(f, "{}: {}", self.kind, self.message),
        }
    }
}

/// Main error type for all snekrpc operations.
#[derive(Debug, Error)]
pub enum RpcError {
    /// I/O error on the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Transport failure that is not a plain I/O error.
    #[error("transport error: {0}")]
    Transport(String),

    /// The peer closed the connection (or it was closed locally).
    #[error("connection closed")]
    ConnectionClosed,

    /// Serialization or deserialization failed.
    #[error("codec error: {0}")]
    Codec(String),

    /// Malformed frame or illegal message sequence.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Handshake found no codec supported by both sides.
    #[error("no common codec: {0}")]
    CodecNegotiation(String),

    /// No service registered under the requested name.
    #[error("unknown service: {0}")]
    UnknownService(String),

    /// The service has no command with the requested name.
    #[error("unknown command: {0}")]
    UnknownCommand(String),

    /// Arguments did not match the command signature.
    #[error("bad arguments: {0}")]
    BadArguments(String),

    /// The call was cancelled, locally or by the peer.
    #[error("call cancelled")]
    Cancelled,

    /// A per-call deadline expired.
    #[error("deadline exceeded")]
    Timeout,

    /// Service/command registration conflict.
    #[error("registration error: {0}")]
    Registration(String),

    /// A command implementation failed.
    #[error("command error: {0}")]
    Command(String),

    /// Error reported by the remote peer.
    #[error("{0}")]
    Remote(RemoteError),

    /// Dispatcher invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl RpcError {
    /// Project this error onto the wire taxonomy.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RpcError::Io(_) | RpcError::Transport(_) | RpcError::ConnectionClosed => {
                ErrorKind::Transport
            }
            RpcError::Codec(_) => ErrorKind::Codec,
            RpcError::Protocol(_) => ErrorKind::Protocol,
            RpcError::CodecNegotiation(_) => ErrorKind::CodecNegotiation,
            RpcError::UnknownService(_) => ErrorKind::UnknownService,
            RpcError::UnknownCommand(_) => ErrorKind::UnknownCommand,
            RpcError::BadArguments(_) => ErrorKind::BadArguments,
            RpcError::Cancelled => ErrorKind::Cancelled,
            RpcError::Timeout => ErrorKind::Timeout,
            // Registration never crosses the wire.
            RpcError::Registration(_) => ErrorKind::Internal,
            RpcError::Command(_) => ErrorKind::Command,
            RpcError::Remote(remote) => remote.kind,
            RpcError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Reconstruct an error received in an `ERROR` message.
    pub fn from_wire(kind: ErrorKind, message: String, traceback: Option<String>) -> RpcError {
        RpcError::Remote(RemoteError {
            kind,
            message,
            traceback,
        })
    }

    /// Wire message text for this error (without the kind prefix).
    pub fn wire_message(&self) -> String {
        match self {
            RpcError::Remote(remote) => remote.message.clone(),
            other => other.to_string(),
        }
    }

    /// True for errors caused by the transport itself. Only these are
    /// eligible for connection-establishment retries.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            RpcError::Io(_) | RpcError::Transport(_) | RpcError::ConnectionClosed
        )
    }
}

impl From<serde_json::Error> for RpcError {
    fn from(err: serde_json::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<rmp_serde::encode::Error> for RpcError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for RpcError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        RpcError::Codec(err.to_string())
    }
}

/// Result type alias using RpcError.
pub type Result<T> = std::result::Result<T, RpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_roundtrip() {
        let kinds = [
            ErrorKind::Transport,
            ErrorKind::Codec,
            ErrorKind::Protocol,
            ErrorKind::CodecNegotiation,
            ErrorKind::UnknownService,
            ErrorKind::UnknownCommand,
            ErrorKind::BadArguments,
            ErrorKind::Cancelled,
            ErrorKind::Timeout,
            ErrorKind::Command,
            ErrorKind::Internal,
        ];
        for kind in kinds {
            assert_eq!(ErrorKind::from_wire(kind.as_str()), kind);
        }
    }

    #[test]
    fn test_unknown_wire_name_maps_to_internal() {
        assert_eq!(ErrorKind::from_wire("NoSuchKind"), ErrorKind::Internal);
    }

    #[test]
    fn test_error_kind_projection() {
        assert_eq!(
            RpcError::UnknownService("x".into()).kind(),
            ErrorKind::UnknownService
        );
        assert_eq!(RpcError::Cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(RpcError::ConnectionClosed.kind(), ErrorKind::Transport);
        let io = RpcError::Io(std::io::Error::new(std::io::ErrorKind::Other, "boom"));
        assert_eq!(io.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_remote_error_display() {
        let err = RpcError::from_wire(ErrorKind::Command, "it broke".into(), None);
        assert_eq!(err.to_string(), "CommandError: it broke");

        let err = RpcError::from_wire(
            ErrorKind::Command,
            "it broke".into(),
            Some("trace line".into()),
        );
        assert!(err.to_string().contains("trace line"));
    }

    #[test]
    fn test_is_transport() {
        assert!(RpcError::ConnectionClosed.is_transport());
        assert!(RpcError::Transport("reset".into()).is_transport());
        assert!(!RpcError::Cancelled.is_transport());
        assert!(!RpcError::Codec("bad".into()).is_transport());
    }
}
