//! Callout bridge: asynchronous storage requests and their completions.
//!
//! Every storage call the engine makes is a tagged [`StorageRequest`]. The
//! provider answers later with a [`Completion`] carrying the same
//! [`CalloutToken`]. A session keeps at most one token live; `Close` and
//! cleanup removals are *detached* (no token, no completion) so they never
//! hold a session busy.

use crate::packet::{PeerAddress, ResponseCode};
use crate::registry::{InstanceId, SessionHandle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Correlates one storage request with its completion
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CalloutToken(pub u64);

impl fmt::Display for CalloutToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "callout#{}", self.0)
    }
}

/// Open file handle issued by the storage provider
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHandle(pub u32);

/// MAP message handle (hexadecimal string on the wire)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageHandle(pub String);

impl fmt::Display for MessageHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How to open an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpenMode {
    /// Read from the start
    Read,
    /// Create or truncate for writing
    Create,
    /// Read starting at a byte offset (resume)
    ReadAt(u64),
    /// Write starting at a byte offset (resume)
    WriteAt(u64),
}

/// Access check mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessMode {
    /// Object exists
    Exists,
    /// Object is readable
    Read,
    /// Object is writable
    Write,
}

/// Message status field to change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StatusIndicator {
    /// Read flag
    Read,
    /// Deleted flag
    Deleted,
}

/// Message listing filter forwarded to the provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingFilter {
    /// Maximum entries
    pub max_count: Option<u16>,
    /// First entry offset
    pub start_offset: u16,
    /// Message type mask (bits set are excluded)
    pub message_type: Option<u8>,
    /// Read status (1 unread only, 2 read only)
    pub read_status: Option<u8>,
    /// Maximum subject length
    pub subject_length: Option<u8>,
}

/// Storage request kinds
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Callout {
    /// Open a file
    Open {
        /// Fully qualified path
        path: PathBuf,
        /// Open mode
        mode: OpenMode,
        /// Declared size for uploads
        size_hint: Option<u64>,
    },
    /// Read up to `max_len` bytes
    Read {
        /// Open handle
        handle: FileHandle,
        /// Maximum bytes to return
        max_len: usize,
    },
    /// Write bytes
    Write {
        /// Open handle
        handle: FileHandle,
        /// Bytes to append
        data: Vec<u8>,
    },
    /// Close a handle (detached)
    Close {
        /// Open handle
        handle: FileHandle,
    },
    /// Reposition a handle
    Seek {
        /// Open handle
        handle: FileHandle,
        /// Absolute byte offset
        offset: u64,
    },
    /// Next directory entry
    Enumerate {
        /// Directory path
        dir: PathBuf,
        /// Restart from the first entry
        reset: bool,
    },
    /// Existence/permission check
    Access {
        /// Fully qualified path
        path: PathBuf,
        /// Check mode
        mode: AccessMode,
    },
    /// Create a directory
    Mkdir {
        /// Fully qualified path
        path: PathBuf,
    },
    /// Remove an empty directory
    Rmdir {
        /// Fully qualified path
        path: PathBuf,
    },
    /// Remove a file
    Unlink {
        /// Fully qualified path
        path: PathBuf,
    },
    /// Move or copy
    Rename {
        /// Source path
        from: PathBuf,
        /// Destination path
        to: PathBuf,
        /// Copy instead of move
        copy: bool,
    },
    /// Change permissions
    Chmod {
        /// Fully qualified path
        path: PathBuf,
        /// OBEX permission bits
        permissions: u32,
    },
    /// Persist a suspend record
    SaveSession {
        /// Peer the record belongs to
        peer: PeerAddress,
        /// Opaque record
        record: Vec<u8>,
    },
    /// Fetch a suspend record
    LoadSession {
        /// Peer the record belongs to
        peer: PeerAddress,
    },
    /// Open a message for reading
    OpenMessage {
        /// Message handle
        handle: MessageHandle,
        /// Requested charset
        charset: u8,
        /// Include attachments
        attachment: bool,
    },
    /// Open a new message for writing into a folder
    PushMessage {
        /// Destination folder
        folder: PathBuf,
        /// Charset of the pushed object
        charset: u8,
    },
    /// Next message listing entry
    MessageListNext {
        /// Folder path
        folder: PathBuf,
        /// Restart from the first entry
        reset: bool,
        /// Listing filter
        filter: ListingFilter,
    },
    /// Change a message status flag
    SetMessageStatus {
        /// Message handle
        handle: MessageHandle,
        /// Which flag
        indicator: StatusIndicator,
        /// New value
        value: bool,
    },
    /// Ask the message store to refresh the inbox
    UpdateInbox,
}

impl Callout {
    /// Short name for logging
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Open { .. } => "open",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Close { .. } => "close",
            Self::Seek { .. } => "seek",
            Self::Enumerate { .. } => "enumerate",
            Self::Access { .. } => "access",
            Self::Mkdir { .. } => "mkdir",
            Self::Rmdir { .. } => "rmdir",
            Self::Unlink { .. } => "unlink",
            Self::Rename { .. } => "rename",
            Self::Chmod { .. } => "chmod",
            Self::SaveSession { .. } => "save-session",
            Self::LoadSession { .. } => "load-session",
            Self::OpenMessage { .. } => "open-message",
            Self::PushMessage { .. } => "push-message",
            Self::MessageListNext { .. } => "message-list-next",
            Self::SetMessageStatus { .. } => "set-message-status",
            Self::UpdateInbox => "update-inbox",
        }
    }
}

/// Directory entry returned by `Enumerate`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name
    pub name: String,
    /// Entry is a folder
    pub is_dir: bool,
    /// Size in bytes (files)
    pub size: u64,
    /// Modification time, `YYYYMMDDTHHMMSSZ`
    pub modified: Option<String>,
    /// User permission string, e.g. `RWD`
    pub user_perm: Option<String>,
}

/// Message listing entry returned by `MessageListNext`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntry {
    /// Message handle
    pub handle: MessageHandle,
    /// Subject (already truncated by the provider)
    pub subject: String,
    /// Timestamp, `YYYYMMDDTHHMMSS`
    pub datetime: String,
    /// Sender addressing
    pub sender: String,
    /// Recipient addressing
    pub recipient: String,
    /// Message type (`EMAIL`, `SMS_GSM`, ...)
    pub kind: String,
    /// Size in bytes
    pub size: u64,
    /// Read flag
    pub read: bool,
}

/// Successful callout results
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalloutOutput {
    /// Object opened
    Opened {
        /// Handle for subsequent calls
        handle: FileHandle,
        /// Object size if known
        size: Option<u64>,
    },
    /// New message opened for writing
    MessageCreated {
        /// Handle for subsequent writes
        handle: FileHandle,
        /// Handle assigned to the new message
        message: MessageHandle,
    },
    /// Bytes read
    Data {
        /// Bytes (never more than requested)
        bytes: Vec<u8>,
        /// No more data follows
        eof: bool,
    },
    /// Bytes written
    Written {
        /// Count written
        len: usize,
    },
    /// Next directory entry
    Entry(DirEntry),
    /// Next message listing entry
    Message(MessageEntry),
    /// Enumeration exhausted
    EndOfEntries,
    /// Access check result
    Access {
        /// Object is a folder
        is_dir: bool,
    },
    /// Suspend record
    SessionRecord(Vec<u8>),
    /// Generic success
    Done,
}

/// Storage provider failures
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StorageError {
    /// Path or handle does not exist
    #[error("not found")]
    NotFound,
    /// Directory not empty
    #[error("directory not empty")]
    NotEmpty,
    /// Permission denied by the store
    #[error("permission denied")]
    PermissionDenied,
    /// No space left
    #[error("storage full")]
    StorageFull,
    /// Store temporarily unavailable
    #[error("storage busy")]
    Busy,
    /// Call not supported by this provider
    #[error("unsupported")]
    Unsupported,
    /// Any other I/O failure
    #[error("i/o failure: {0}")]
    Io(String),
}

impl StorageError {
    /// Central mapping from storage status to OBEX response code
    #[must_use]
    pub fn response_code(&self) -> ResponseCode {
        match self {
            Self::NotFound => ResponseCode::NotFound,
            Self::NotEmpty => ResponseCode::PreconditionFailed,
            Self::PermissionDenied => ResponseCode::Forbidden,
            Self::StorageFull => ResponseCode::StorageFull,
            Self::Busy => ResponseCode::ServiceUnavailable,
            Self::Unsupported => ResponseCode::BadRequest,
            Self::Io(_) => ResponseCode::InternalError,
        }
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::DirectoryNotEmpty => Self::NotEmpty,
            ErrorKind::StorageFull => Self::StorageFull,
            _ => Self::Io(err.to_string()),
        }
    }
}

/// Result type carried by a completion
pub type CalloutResult = Result<CalloutOutput, StorageError>;

/// Request handed to the storage provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageRequest {
    /// Correlation token; `None` for detached calls
    pub token: Option<CalloutToken>,
    /// Issuing session
    pub session: SessionHandle,
    /// Service instance of the session
    pub instance: InstanceId,
    /// The call
    pub callout: Callout,
}

/// Completion returned by the storage provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Token of the request
    pub token: CalloutToken,
    /// Issuing session
    pub session: SessionHandle,
    /// Outcome
    pub result: CalloutResult,
}

impl StorageRequest {
    /// Build the completion answering this request
    ///
    /// Returns `None` for detached requests, which expect no answer.
    #[must_use]
    pub fn complete(&self, result: CalloutResult) -> Option<Completion> {
        self.token.map(|token| Completion {
            token,
            session: self.session,
            result,
        })
    }
}
