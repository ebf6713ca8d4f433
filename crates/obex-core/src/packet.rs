//! Packet and buffer adapter.
//!
//! Requests reach the engine already decoded into [`Headers`]; the wire
//! encoding belongs to the transport layer. Outbound bodies are assembled in
//! a [`TransferBuffer`] whose capacity is derived from the negotiated packet
//! length, so a chunk can never overflow the packet it is sent in.

use crate::auth::{AuthChallenge, AuthDigest};
use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bytes reserved in every response packet for the response code, packet
/// length, connection id, length header and body header.
pub const RESPONSE_OVERHEAD: usize = 16;

/// Largest packet length the engine will negotiate
pub const MAX_PACKET_LEN: u16 = u16::MAX;

/// Folder listing object type
pub const TYPE_FOLDER_LISTING: &str = "x-obex/folder-listing";
/// Message listing object type
pub const TYPE_MESSAGE_LISTING: &str = "x-bt/MAP-msg-listing";
/// Message object type
pub const TYPE_MESSAGE: &str = "x-bt/message";
/// Message status object type
pub const TYPE_MESSAGE_STATUS: &str = "x-bt/messageStatus";
/// Inbox update object type
pub const TYPE_MESSAGE_UPDATE: &str = "x-bt/MAP-messageUpdate";
/// Notification registration object type
pub const TYPE_NOTIFICATION_REGISTRATION: &str = "x-bt/MAP-NotificationRegistration";
/// Event report object type (pushed by the notification client)
pub const TYPE_EVENT_REPORT: &str = "x-bt/MAP-event-report";

/// Folder-browsing service target (File Transfer profile)
pub const TARGET_FOLDER_BROWSING: [u8; 16] = [
    0xF9, 0xEC, 0x7B, 0xC4, 0x95, 0x3C, 0x11, 0xD2, 0x98, 0x4E, 0x52, 0x54, 0x00, 0xDC, 0x9E, 0x09,
];

/// Message access service target
pub const TARGET_MESSAGE_ACCESS: [u8; 16] = [
    0xBB, 0x58, 0x2B, 0x40, 0x42, 0x0C, 0x11, 0xDB, 0xB0, 0xDE, 0x08, 0x00, 0x20, 0x0C, 0x9A, 0x66,
];

/// Message notification service target
pub const TARGET_MESSAGE_NOTIFICATION: [u8; 16] = [
    0xBB, 0x58, 0x2B, 0x41, 0x42, 0x0C, 0x11, 0xDB, 0xB0, 0xDE, 0x08, 0x00, 0x20, 0x0C, 0x9A, 0x66,
];

/// Transport connection identifier assigned by the transport layer
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct ConnId(pub u32);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Bluetooth device address of the remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct PeerAddress(pub [u8; 6]);

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl std::str::FromStr for PeerAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut out {
            let part = parts.next().ok_or_else(|| format!("short address: {s}"))?;
            *byte = u8::from_str_radix(part, 16).map_err(|e| format!("{s}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("long address: {s}"));
        }
        Ok(Self(out))
    }
}

/// OBEX response codes used by the server engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// More data follows, client should re-request
    Continue,
    /// Request completed
    Ok,
    /// Partial content delivered
    PartialContent,
    /// Malformed or unsupported request
    BadRequest,
    /// Denied by policy or failed authentication
    Unauthorized,
    /// Understood but refused
    Forbidden,
    /// Object or folder not found
    NotFound,
    /// Precondition failed (e.g. folder not empty)
    PreconditionFailed,
    /// Server-side failure
    InternalError,
    /// Server cannot take the request now
    ServiceUnavailable,
    /// Storage is full
    StorageFull,
}

impl ResponseCode {
    /// Wire value with the final bit set
    #[must_use]
    pub fn as_u8(self) -> u8 {
        match self {
            Self::Continue => 0x90,
            Self::Ok => 0xA0,
            Self::PartialContent => 0xA6,
            Self::BadRequest => 0xC0,
            Self::Unauthorized => 0xC1,
            Self::Forbidden => 0xC3,
            Self::NotFound => 0xC4,
            Self::PreconditionFailed => 0xCC,
            Self::InternalError => 0xD0,
            Self::ServiceUnavailable => 0xD3,
            Self::StorageFull => 0xE0,
        }
    }

    /// Ok or PartialContent
    #[must_use]
    pub fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::PartialContent)
    }

    /// Anything other than Continue ends the request
    #[must_use]
    pub fn is_final(self) -> bool {
        self != Self::Continue
    }
}

/// MAP application parameters carried in the application-parameters header
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppParams {
    /// Maximum number of listing entries
    pub max_list_count: Option<u16>,
    /// Offset of the first listing entry
    pub list_start_offset: Option<u16>,
    /// Message type filter bitmask
    pub filter_message_type: Option<u8>,
    /// Read status filter
    pub filter_read_status: Option<u8>,
    /// Maximum subject length in listings
    pub subject_length: Option<u8>,
    /// Charset requested for message objects (0 native, 1 UTF-8)
    pub charset: Option<u8>,
    /// Include attachments in message objects
    pub attachment: Option<bool>,
    /// Status indicator for a status update (0 read, 1 deleted)
    pub status_indicator: Option<u8>,
    /// Status value for a status update
    pub status_value: Option<u8>,
    /// Notification registration on/off
    pub notification_status: Option<bool>,
    /// Listing size returned to the client
    pub listing_size: Option<u16>,
    /// New message indicator returned to the client
    pub new_message: Option<bool>,
    /// MAS instance id (event reports)
    pub mas_instance_id: Option<u8>,
}

/// Decoded OBEX headers
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// Object name
    pub name: Option<String>,
    /// Object type
    pub object_type: Option<String>,
    /// Declared object length
    pub length: Option<u64>,
    /// Body bytes
    pub body: Option<Vec<u8>>,
    /// The body header is End-of-Body
    pub end_of_body: bool,
    /// Connection id
    pub connection_id: Option<u32>,
    /// Target service UUID
    pub target: Option<Vec<u8>>,
    /// Who header (connect response)
    pub who: Option<Vec<u8>>,
    /// Application parameters
    pub app_params: Option<AppParams>,
    /// Authentication challenge (responses)
    pub auth_challenge: Option<AuthChallenge>,
    /// Session sequence number
    pub session_ssn: Option<u8>,
}

impl Headers {
    /// Headers carrying a name and type
    #[must_use]
    pub fn named(name: impl Into<String>, object_type: Option<&str>) -> Self {
        Self {
            name: Some(name.into()),
            object_type: object_type.map(str::to_string),
            ..Self::default()
        }
    }

    /// Fill missing fields from a later packet of the same request
    pub fn merge(&mut self, later: Headers) {
        self.name = self.name.take().or(later.name);
        self.object_type = self.object_type.take().or(later.object_type);
        self.length = self.length.or(later.length);
        self.connection_id = self.connection_id.or(later.connection_id);
        self.app_params = self.app_params.take().or(later.app_params);
        if later.body.is_some() {
            self.body = later.body;
            self.end_of_body = later.end_of_body;
        }
    }

    /// Body bytes, empty when the packet carries no body header
    #[must_use]
    pub fn body_bytes(&self) -> &[u8] {
        self.body.as_deref().unwrap_or_default()
    }
}

/// Connect request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectRequest {
    /// Maximum packet length the peer can receive
    pub max_packet_len: u16,
    /// Request headers (target, who)
    pub headers: Headers,
    /// Digest answering an earlier challenge
    pub auth: Option<AuthDigest>,
}

/// SetPath request parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetPathRequest {
    /// Child folder name; `None` or empty means root (unless `backup`)
    pub name: Option<String>,
    /// Go to the parent folder first
    pub backup: bool,
    /// Create the folder when it does not exist
    pub create: bool,
}

/// OBEX action identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ActionId {
    /// Copy an object
    Copy,
    /// Move or rename an object
    Move,
    /// Change object permissions
    SetPermissions,
}

/// Action request parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionRequest {
    /// Action to perform
    pub action: ActionId,
    /// Source object name
    pub name: String,
    /// Destination name (copy/move)
    pub dest_name: Option<String>,
    /// Permission bits (set-permissions)
    pub permissions: Option<u32>,
}

/// Reliable-session opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionOpcode {
    /// Create a reliable session
    Create,
    /// Close a reliable session
    Close,
    /// Suspend the session for later resumption
    Suspend,
    /// Resume a suspended session
    Resume,
    /// Change the session timeout
    SetTimeout,
}

/// Session-control request parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionControl {
    /// Requested opcode
    pub opcode: SessionOpcode,
    /// Next sequence number the client will use (resume)
    pub next_ssn: Option<u8>,
    /// Requested timeout in seconds (set-timeout)
    pub timeout_secs: Option<u32>,
}

/// Requests delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    /// Connect
    Connect(ConnectRequest),
    /// Disconnect
    Disconnect,
    /// Abort the current operation
    Abort,
    /// Put packet
    Put {
        /// Packet headers
        headers: Headers,
        /// Final bit
        final_bit: bool,
    },
    /// Get packet
    Get {
        /// Packet headers
        headers: Headers,
        /// Final bit
        final_bit: bool,
    },
    /// SetPath
    SetPath(SetPathRequest),
    /// Action
    Action(ActionRequest),
    /// Authentication response to a challenge
    AuthChallengeResponse(AuthDigest),
    /// Reliable-session control
    SessionControl(SessionControl),
    /// Transport link went down without a Disconnect
    LinkClosed,
}

impl Request {
    /// Response kind used to answer this request
    #[must_use]
    pub fn reply_kind(&self) -> Option<ReplyKind> {
        match self {
            Self::Connect(_) | Self::AuthChallengeResponse(_) => Some(ReplyKind::Connect),
            Self::Disconnect => Some(ReplyKind::Disconnect),
            Self::Abort => Some(ReplyKind::Abort),
            Self::Put { .. } => Some(ReplyKind::Put),
            Self::Get { .. } => Some(ReplyKind::Get),
            Self::SetPath(_) => Some(ReplyKind::SetPath),
            Self::Action(_) => Some(ReplyKind::Action),
            Self::SessionControl(_) => Some(ReplyKind::Session),
            Self::LinkClosed => None,
        }
    }

    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Connect(_) => "Connect",
            Self::Disconnect => "Disconnect",
            Self::Abort => "Abort",
            Self::Put { .. } => "Put",
            Self::Get { .. } => "Get",
            Self::SetPath(_) => "SetPath",
            Self::Action(_) => "Action",
            Self::AuthChallengeResponse(_) => "AuthChallengeResponse",
            Self::SessionControl(_) => "SessionControl",
            Self::LinkClosed => "LinkClosed",
        }
    }
}

/// Transport response functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReplyKind {
    /// ConnectResponse
    Connect,
    /// DisconnectResponse
    Disconnect,
    /// PutResponse
    Put,
    /// GetResponse
    Get,
    /// SetPathResponse
    SetPath,
    /// ActionResponse
    Action,
    /// AbortResponse
    Abort,
    /// SessionResponse
    Session,
}

/// A response handed back to the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Transport connection
    pub conn: ConnId,
    /// Which response function
    pub kind: ReplyKind,
    /// Response code
    pub code: ResponseCode,
    /// Response headers
    pub headers: Headers,
    /// Negotiated packet length (connect responses)
    pub max_packet_len: Option<u16>,
}

impl Reply {
    /// Body bytes carried by this reply
    #[must_use]
    pub fn body(&self) -> &[u8] {
        self.headers.body_bytes()
    }
}

/// Body capacity of a response packet for the negotiated packet length
pub fn body_capacity(packet_len: u16) -> Result<usize, ProtocolError> {
    let len = usize::from(packet_len);
    if len <= RESPONSE_OVERHEAD {
        return Err(ProtocolError::PacketTooSmall(packet_len));
    }
    Ok(len - RESPONSE_OVERHEAD)
}

/// Validate a single object name received from the peer
pub fn validate_name(name: &str) -> Result<&str, ProtocolError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }
    Ok(name)
}

/// Error returned when bytes do not fit a [`TransferBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferOverflow {
    /// Bytes offered
    pub offered: usize,
    /// Space left
    pub available: usize,
}

/// Owned body region of one outbound or inbound packet
///
/// `offset` counts bytes already placed, `bytes_left` the space still free;
/// their sum is always the capacity. The buffer is consumed by
/// [`TransferBuffer::into_body`] when the transport takes it, otherwise it is
/// dropped with the operation that owns it.
#[derive(Debug)]
pub struct TransferBuffer {
    data: Vec<u8>,
    capacity: usize,
}

impl TransferBuffer {
    /// Create an empty buffer for one packet body
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Bytes already placed
    #[must_use]
    pub fn offset(&self) -> usize {
        self.data.len()
    }

    /// Free space remaining
    #[must_use]
    pub fn bytes_left(&self) -> usize {
        self.capacity - self.data.len()
    }

    /// Body capacity of the packet
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// No space left
    #[must_use]
    pub fn is_full(&self) -> bool {
        self.bytes_left() == 0
    }

    /// Nothing placed yet
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Place all of `bytes`, or nothing if they do not fit
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), BufferOverflow> {
        if bytes.len() > self.bytes_left() {
            return Err(BufferOverflow {
                offered: bytes.len(),
                available: self.bytes_left(),
            });
        }
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    /// Place as much of `bytes` as fits and return how many were taken
    pub fn fill_from(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.bytes_left());
        self.data.extend_from_slice(&bytes[..n]);
        n
    }

    /// View of the placed bytes
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Hand the body to the transport
    #[must_use]
    pub fn into_body(self) -> Vec<u8> {
        self.data
    }
}
