//! Access gate.
//!
//! Operations that read or change the store pause for an allow/deny decision
//! from the hosting application. The pending [`AccessRequest`] is held in the
//! operation's wait state; a response only counts if the session is still
//! waiting and names the same operation.

use crate::callout::MessageHandle;
use crate::events::{AppEvent, Outbox, TimerEvent};
use crate::packet::{Headers, PeerAddress, ResponseCode};
use crate::registry::{InstanceId, SessionHandle};
use crate::session::{Release, Session};
use crate::transfer::{ActiveOp, GetObject, OperationKind, PutObject, Wait, Work};
use std::path::PathBuf;

/// Description of an operation awaiting the application's decision
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    /// Serial; access timeouts refer to it
    pub id: u64,
    /// Requesting session
    pub session: SessionHandle,
    /// Service instance
    pub instance: InstanceId,
    /// Remote device
    pub peer: PeerAddress,
    /// Operation to allow or deny
    pub operation: OperationKind,
    /// Object path, for file operations
    pub path: Option<PathBuf>,
    /// Destination path (copy/move)
    pub dest: Option<PathBuf>,
    /// Message handle (MAP)
    pub handle: Option<MessageHandle>,
    /// Declared object size (uploads)
    pub size: Option<u64>,
}

impl Session {
    /// Pause `op` for an access decision when its kind is gated, otherwise
    /// start it right away
    pub(crate) fn gate(&mut self, mut op: ActiveOp, out: &mut Outbox) {
        if !op.kind.requires_access() {
            self.proceed(op, out);
            return;
        }

        let (path, dest, handle, size) = describe(&op);
        let request = AccessRequest {
            id: out.next_request_id(),
            session: self.handle(),
            instance: self.instance(),
            peer: self.peer().unwrap_or_default(),
            operation: op.kind,
            path,
            dest,
            handle,
            size,
        };
        tracing::debug!(
            "{} waiting for access to {} (request {})",
            self.handle(),
            op.kind,
            request.id
        );

        if let Some(after) = self.access_timeout() {
            out.timer(
                after,
                TimerEvent::AccessTimeout {
                    session: self.handle(),
                    request_id: request.id,
                },
            );
        }
        out.app(AppEvent::AccessRequested(request.clone()));
        op.wait = Wait::Access(request);
        self.op = Some(op);
    }

    /// Apply the application's decision
    ///
    /// A response that does not match the pending request is stale and
    /// leaves the session untouched.
    pub(crate) fn on_access_response(
        &mut self,
        operation: OperationKind,
        allow: bool,
        out: &mut Outbox,
    ) {
        let matches = match self.op.as_ref().map(|op| &op.wait) {
            Some(Wait::Access(request)) => request.operation == operation,
            _ => false,
        };
        if !matches {
            tracing::warn!(
                "{} ignoring stale access response for {}",
                self.handle(),
                operation
            );
            return;
        }
        let Some(mut op) = self.op.take() else {
            return;
        };

        if allow {
            tracing::debug!("{} access to {} granted", self.handle(), operation);
            op.wait = Wait::Client;
            self.proceed(op, out);
        } else {
            tracing::info!("{} access to {} denied", self.handle(), operation);
            self.finish(
                op,
                ResponseCode::Unauthorized,
                Headers::default(),
                Release::Keep,
                out,
            );
        }
    }

    /// The application did not answer in time
    pub(crate) fn on_access_timeout(&mut self, request_id: u64, out: &mut Outbox) {
        let pending = matches!(
            self.op.as_ref().map(|op| &op.wait),
            Some(Wait::Access(request)) if request.id == request_id
        );
        if !pending {
            return;
        }
        let Some(op) = self.op.take() else {
            return;
        };
        tracing::warn!(
            "{} access request {} timed out for {}",
            self.handle(),
            request_id,
            op.kind
        );
        self.finish(
            op,
            ResponseCode::ServiceUnavailable,
            Headers::default(),
            Release::Keep,
            out,
        );
    }
}

type Described = (
    Option<PathBuf>,
    Option<PathBuf>,
    Option<MessageHandle>,
    Option<u64>,
);

fn describe(op: &ActiveOp) -> Described {
    match &op.work {
        Work::Get(get) => match &get.object {
            GetObject::File(path) => (Some(path.clone()), None, None, None),
            GetObject::Message { handle, .. } => (None, None, Some(handle.clone()), None),
        },
        Work::Put(put) => match &put.object {
            PutObject::File(path) => (Some(path.clone()), None, None, put.expected),
            PutObject::Message { folder, .. } => (Some(folder.clone()), None, None, put.expected),
        },
        Work::Path(path) => (Some(path.path.clone()), path.dest.clone(), None, None),
        Work::Message(msg) => (None, None, msg.handle.clone(), None),
        Work::Listing(_) | Work::Suspend(_) | Work::Resume(_) => (None, None, None, None),
    }
}
