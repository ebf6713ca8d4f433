//! Transfer pipeline.
//!
//! An operation in progress is an [`ActiveOp`]: what it is
//! ([`OperationKind`]), what it is waiting for ([`Wait`]) and the scratch it
//! owns ([`Work`]). Because the wait state is a single enum, an operation is
//! always waiting on exactly one of: a callout, an access decision, or the
//! client's next request.
//!
//! The GET, PUT and listing algorithms live in the submodules as
//! `impl Session` blocks.

mod get;
mod listing;
mod put;

use crate::callout::{CalloutToken, FileHandle, ListingFilter, MessageHandle};
use crate::packet::{ReplyKind, TransferBuffer};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Operation tags recorded on a session and named in access requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Folder listing
    ListFolder,
    /// File download
    GetFile,
    /// File upload
    PutFile,
    /// Delete file or empty folder
    Delete,
    /// Folder navigation
    ChangeDir,
    /// Folder creation
    MakeDir,
    /// Copy object
    Copy,
    /// Move or rename object
    Move,
    /// Change permissions
    SetPermissions,
    /// Message download
    GetMessage,
    /// Message listing
    GetMessageListing,
    /// Message upload
    PushMessage,
    /// Message read/deleted status
    SetMessageStatus,
    /// Inbox refresh
    UpdateInbox,
    /// Event notification on/off
    SetNotificationRegistration,
    /// Reliable-session suspend
    Suspend,
    /// Reliable-session resume
    Resume,
}

impl OperationKind {
    /// Operations that disclose or mutate storage wait for the application
    #[must_use]
    pub fn requires_access(self) -> bool {
        matches!(
            self,
            Self::GetFile
                | Self::PutFile
                | Self::Delete
                | Self::MakeDir
                | Self::Copy
                | Self::Move
                | Self::SetPermissions
                | Self::GetMessage
                | Self::PushMessage
                | Self::SetMessageStatus
        )
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Work deferred until the pending callout completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    /// Continue the operation
    Nothing,
    /// Abort requested: release and answer the abort
    Abort,
    /// Disconnect or disable requested: tear the session down
    Close,
}

impl Deferred {
    /// Close wins over abort; nothing is ever downgraded
    pub(crate) fn upgrade(self, to: Deferred) -> Deferred {
        match (self, to) {
            (Deferred::Close, _) | (_, Deferred::Close) => Deferred::Close,
            (Deferred::Abort, _) | (_, Deferred::Abort) => Deferred::Abort,
            _ => Deferred::Nothing,
        }
    }
}

/// What an active operation is waiting for
#[derive(Debug)]
pub(crate) enum Wait {
    /// The next client request of this operation
    Client,
    /// A storage completion
    Callout {
        token: CalloutToken,
        deferred: Deferred,
    },
    /// The application's allow/deny
    Access(crate::access::AccessRequest),
}

/// Object addressed by a GET
#[derive(Debug, Clone)]
pub(crate) enum GetObject {
    File(PathBuf),
    Message {
        handle: MessageHandle,
        charset: u8,
        attachment: bool,
    },
}

/// Download scratch
#[derive(Debug)]
pub(crate) struct GetTransfer {
    pub object: GetObject,
    pub handle: Option<FileHandle>,
    /// Size reported by open
    pub total: Option<u64>,
    /// Cumulative bytes requested from the provider
    pub requested: u64,
    /// Bytes placed in responses
    pub sent: u64,
    /// Size of the chunk in the last response
    pub last_chunk: u64,
    /// Nothing sent yet (Length header goes in the first response)
    pub first: bool,
    /// Buffer being filled by the pending read
    pub buffer: Option<TransferBuffer>,
}

/// Destination of a PUT
#[derive(Debug, Clone)]
pub(crate) enum PutObject {
    File(PathBuf),
    Message { folder: PathBuf, charset: u8 },
}

/// Upload scratch
#[derive(Debug)]
pub(crate) struct PutTransfer {
    pub object: PutObject,
    pub handle: Option<FileHandle>,
    /// Handle assigned to a pushed message
    pub message: Option<MessageHandle>,
    /// Declared length
    pub expected: Option<u64>,
    /// Bytes written so far
    pub received: u64,
    /// Size of the last write
    pub last_chunk: u64,
    /// Client's final packet has arrived
    pub final_seen: bool,
    /// Body received while the object was not yet open
    pub pending: Vec<u8>,
}

/// Where listing entries come from
#[derive(Debug, Clone)]
pub(crate) enum ListingSource {
    Folder { dir: PathBuf, at_root: bool },
    Messages { folder: PathBuf, filter: ListingFilter },
}

/// Listing progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListingPhase {
    /// Enumerating entries
    Entries,
    /// Footer serialized, draining carry
    Finished,
}

/// Listing scratch
#[derive(Debug)]
pub(crate) struct ListingTransfer {
    pub source: ListingSource,
    pub phase: ListingPhase,
    /// Packet being assembled
    pub buffer: Option<TransferBuffer>,
    /// Serialized bytes that did not fit the previous packet
    pub carry: Vec<u8>,
    /// First enumerate issued
    pub started: bool,
    /// Only count entries (MAP listing size request)
    pub count_only: bool,
    /// An unread message was seen while counting
    pub new_message: bool,
    /// Entries serialized or counted
    pub entries: u64,
    /// Bytes placed in responses
    pub sent: u64,
}

/// Scratch for single-step path operations
#[derive(Debug, Clone)]
pub(crate) struct PathWork {
    pub path: PathBuf,
    pub dest: Option<PathBuf>,
    pub permissions: Option<u32>,
    /// Folder to switch to on success (set-path)
    pub folder: Option<Vec<String>>,
    /// Create the folder if missing (set-path)
    pub create: bool,
}

/// Scratch for MAP single-step operations
#[derive(Debug, Clone)]
pub(crate) struct MessageWork {
    pub handle: Option<MessageHandle>,
    pub indicator: Option<crate::callout::StatusIndicator>,
    pub value: bool,
}

/// Per-operation scratch
#[derive(Debug)]
pub(crate) enum Work {
    Get(GetTransfer),
    Put(PutTransfer),
    Listing(ListingTransfer),
    Path(PathWork),
    Message(MessageWork),
    Suspend(crate::resume::SuspendWork),
    Resume(crate::resume::ResumeWork),
}

impl Work {
    /// Open file handle owned by this work, if any
    pub(crate) fn handle(&self) -> Option<FileHandle> {
        match self {
            Work::Get(get) => get.handle,
            Work::Put(put) => put.handle,
            Work::Resume(resume) => resume.handle,
            Work::Suspend(suspend) => suspend.suspended.as_ref().and_then(|op| op.work.handle()),
            _ => None,
        }
    }
}

/// The operation a session is executing
#[derive(Debug)]
pub(crate) struct ActiveOp {
    pub kind: OperationKind,
    pub reply: ReplyKind,
    pub wait: Wait,
    pub work: Work,
}

impl ActiveOp {
    pub(crate) fn new(kind: OperationKind, reply: ReplyKind, work: Work) -> Self {
        Self {
            kind,
            reply,
            wait: Wait::Client,
            work,
        }
    }

    /// A callout is outstanding
    pub(crate) fn callout_pending(&self) -> bool {
        matches!(self.wait, Wait::Callout { .. })
    }

    /// Object name for events
    pub(crate) fn object_name(&self) -> Option<String> {
        match &self.work {
            Work::Get(get) => match &get.object {
                GetObject::File(path) => Some(path.display().to_string()),
                GetObject::Message { handle, .. } => Some(handle.to_string()),
            },
            Work::Put(put) => match (&put.object, &put.message) {
                (_, Some(handle)) => Some(handle.to_string()),
                (PutObject::File(path), None) => Some(path.display().to_string()),
                (PutObject::Message { folder, .. }, None) => Some(folder.display().to_string()),
            },
            Work::Listing(listing) => match &listing.source {
                ListingSource::Folder { dir, .. } => Some(dir.display().to_string()),
                ListingSource::Messages { folder, .. } => Some(folder.display().to_string()),
            },
            Work::Path(path) => Some(path.path.display().to_string()),
            Work::Message(msg) => msg.handle.as_ref().map(ToString::to_string),
            Work::Suspend(_) | Work::Resume(_) => None,
        }
    }
}
