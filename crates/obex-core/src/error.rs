//! Error types for the OBEX session engine.

use crate::packet::ResponseCode;
use crate::registry::{InstanceId, SessionHandle};
use thiserror::Error;

/// Engine API errors
///
/// Returned to the hosting application when a command cannot be applied.
/// Peer-visible failures never surface here: those are answered with an
/// OBEX response code instead.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Session handle is unknown or refers to a recycled slot
    #[error("unknown session: {0}")]
    UnknownSession(SessionHandle),

    /// No service instance with this id
    #[error("unknown service instance: {0}")]
    UnknownInstance(InstanceId),

    /// Service instance already enabled
    #[error("service instance {0} already enabled")]
    AlreadyEnabled(InstanceId),

    /// Service instance still has sessions outside the listening state
    #[error("service instance {0} has active sessions")]
    InstanceBusy(InstanceId),

    /// No session is connected from this peer
    #[error("no session for peer {0}")]
    UnknownPeer(crate::packet::PeerAddress),

    /// Configuration rejected at enable time
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resume record could not be encoded or decoded
    #[error("resume error: {0}")]
    Resume(#[from] ResumeError),
}

/// Request validation failures
///
/// Decided locally and answered with `BadRequest` (or the code given by
/// [`ProtocolError::response_code`]); never retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// A mandatory header is absent
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    /// Object name contains a path separator or a relative component
    #[error("invalid object name: {0:?}")]
    InvalidName(String),

    /// Object type is unknown or not offered by this service instance
    #[error("unsupported object type: {0:?}")]
    UnsupportedType(Option<String>),

    /// Requested operation is not valid in the current folder or state
    #[error("operation not allowed: {0}")]
    NotAllowed(&'static str),

    /// Peer packet length cannot hold a single body byte
    #[error("peer packet length {0} too small")]
    PacketTooSmall(u16),
}

impl ProtocolError {
    /// OBEX response code answered to the peer for this failure
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::NotAllowed(_) => ResponseCode::Forbidden,
            _ => ResponseCode::BadRequest,
        }
    }
}

/// Suspend record persistence errors
#[derive(Debug, Error)]
pub enum ResumeError {
    /// Record serialization failed
    #[error("record encoding failed: {0}")]
    Encode(String),

    /// Stored blob is not a valid record
    #[error("record decoding failed: {0}")]
    Decode(String),

    /// Record belongs to another peer
    #[error("record belongs to another peer")]
    PeerMismatch,
}

impl From<bincode::Error> for ResumeError {
    fn from(err: bincode::Error) -> Self {
        Self::Decode(err.to_string())
    }
}

/// Notification client errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NotifyError {
    /// Operation requires a connected client
    #[error("notification client not connected")]
    NotConnected,

    /// A push or connect is already outstanding
    #[error("notification client busy")]
    Busy,

    /// Peer refused the request
    #[error("peer answered {0:?}")]
    Rejected(ResponseCode),

    /// Peer did not answer in time
    #[error("response timeout")]
    Timeout,
}

/// Convenience alias for engine API results
pub type Result<T> = std::result::Result<T, EngineError>;

/// The engine task has stopped and no longer accepts input
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("engine task stopped")]
pub struct ServerClosed;
