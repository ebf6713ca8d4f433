//! Engine outputs and application-facing events.
//!
//! The engine never performs I/O itself. Handling one input appends
//! [`Output`]s to an [`Outbox`]; the driver (see [`crate::server`]) or a test
//! harness drains it and routes each output to the transport, the storage
//! provider or the hosting application.

use crate::access::AccessRequest;
use crate::callout::{Callout, CalloutToken, StorageRequest};
use crate::notify::NotifyEvent;
use crate::packet::{ConnId, Headers, PeerAddress, Reply, ReplyKind, ResponseCode};
use crate::registry::{InstanceId, SessionHandle};
use crate::transfer::OperationKind;
use std::time::Duration;

/// Events emitted to the hosting application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppEvent {
    /// Service instance is accepting connections
    Enabled {
        /// Instance
        instance: InstanceId,
    },
    /// Service instance stopped after all sessions drained
    Disabled {
        /// Instance
        instance: InstanceId,
    },
    /// Session connected
    Opened {
        /// Session
        session: SessionHandle,
        /// Remote device
        peer: PeerAddress,
    },
    /// Session closed
    Closed {
        /// Session
        session: SessionHandle,
        /// Remote device
        peer: PeerAddress,
    },
    /// Operation waits for an allow/deny decision
    AccessRequested(AccessRequest),
    /// Client answered the challenge, password needed to verify
    AuthRequested {
        /// Session
        session: SessionHandle,
        /// User id sent by the client
        user_id: Option<Vec<u8>>,
    },
    /// Bytes moved for the current operation
    Progress {
        /// Session
        session: SessionHandle,
        /// Operation
        operation: OperationKind,
        /// Bytes moved by this step
        bytes: u64,
        /// Declared total, if known
        total: Option<u64>,
    },
    /// Operation finished
    OperationComplete {
        /// Session
        session: SessionHandle,
        /// Operation
        operation: OperationKind,
        /// Final response code
        code: ResponseCode,
        /// Object name or handle involved
        object: Option<String>,
    },
    /// Client toggled event notifications (MAP)
    NotificationRegistration {
        /// Session
        session: SessionHandle,
        /// Service instance
        instance: InstanceId,
        /// Remote device to connect the notification client to
        peer: PeerAddress,
        /// On or off
        enabled: bool,
    },
    /// Status of the notification link to a peer (MAP)
    Notification {
        /// Service instance the reports come from
        instance: InstanceId,
        /// Remote device
        peer: PeerAddress,
        /// What happened
        event: NotifyEvent,
    },
}

/// Commands accepted from the hosting application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppCommand {
    /// Answer an access request
    AccessResponse {
        /// Session
        session: SessionHandle,
        /// Operation the answer refers to
        operation: OperationKind,
        /// Allow or deny
        allow: bool,
    },
    /// Password for a pending authentication
    AuthResponse {
        /// Session
        session: SessionHandle,
        /// Password
        password: Vec<u8>,
    },
    /// Start a service instance
    EnableService(crate::config::InstanceConfig),
    /// Stop a service instance after draining its sessions
    DisableService {
        /// Instance
        instance: InstanceId,
    },
    /// Remove an idle service instance
    StopInstance {
        /// Instance
        instance: InstanceId,
    },
    /// Close the session connected from a peer
    CloseSession {
        /// Remote device
        peer: PeerAddress,
    },
}

/// Commands to the transport layer other than replies
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCommand {
    /// Drop the connection
    Disconnect {
        /// Connection
        conn: ConnId,
    },
}

/// Timer the driver must arm
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerRequest {
    /// Delay before firing
    pub after: Duration,
    /// Event to deliver on expiry
    pub event: TimerEvent,
}

/// Timer expiry delivered back to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    /// The application did not answer an access request in time
    AccessTimeout {
        /// Session
        session: SessionHandle,
        /// Serial of the access request
        request_id: u64,
    },
}

/// One engine output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    /// Response to the transport
    Reply(Reply),
    /// Other transport command
    Transport(TransportCommand),
    /// Storage callout
    Storage(StorageRequest),
    /// Application event
    App(AppEvent),
    /// Timer to arm
    Timer(TimerRequest),
}

/// Collects outputs and issues callout tokens
#[derive(Debug, Default)]
pub struct Outbox {
    outputs: Vec<Output>,
    next_token: u64,
    next_request_id: u64,
}

impl Outbox {
    /// Create an empty outbox
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a reply
    pub fn reply(&mut self, conn: ConnId, kind: ReplyKind, code: ResponseCode, headers: Headers) {
        tracing::debug!("{} {:?} -> {:?}", conn, kind, code);
        self.outputs.push(Output::Reply(Reply {
            conn,
            kind,
            code,
            headers,
            max_packet_len: None,
        }));
    }

    /// Queue a fully built reply
    pub fn push_reply(&mut self, reply: Reply) {
        tracing::debug!("{} {:?} -> {:?}", reply.conn, reply.kind, reply.code);
        self.outputs.push(Output::Reply(reply));
    }

    /// Issue a callout that expects a completion
    pub fn callout(
        &mut self,
        session: SessionHandle,
        instance: InstanceId,
        callout: Callout,
    ) -> CalloutToken {
        self.next_token += 1;
        let token = CalloutToken(self.next_token);
        tracing::debug!("{} issue {} ({})", session, token, callout.name());
        self.outputs.push(Output::Storage(StorageRequest {
            token: Some(token),
            session,
            instance,
            callout,
        }));
        token
    }

    /// Issue a callout that expects no completion
    pub fn detached(&mut self, session: SessionHandle, instance: InstanceId, callout: Callout) {
        tracing::debug!("{} detached {}", session, callout.name());
        self.outputs.push(Output::Storage(StorageRequest {
            token: None,
            session,
            instance,
            callout,
        }));
    }

    /// Queue an application event
    pub fn app(&mut self, event: AppEvent) {
        self.outputs.push(Output::App(event));
    }

    /// Queue a transport command
    pub fn transport(&mut self, command: TransportCommand) {
        self.outputs.push(Output::Transport(command));
    }

    /// Queue a timer
    pub fn timer(&mut self, after: Duration, event: TimerEvent) {
        self.outputs.push(Output::Timer(TimerRequest { after, event }));
    }

    /// Serial for a new access request
    pub fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    /// Take all queued outputs
    pub fn drain(&mut self) -> Vec<Output> {
        std::mem::take(&mut self.outputs)
    }

    /// Queued outputs, oldest first
    #[must_use]
    pub fn pending(&self) -> &[Output] {
        &self.outputs
    }

    /// Nothing queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callout::FileHandle;

    #[test]
    fn test_tokens_are_unique() {
        let mut out = Outbox::new();
        let session = SessionHandle::new(1, 0);
        let a = out.callout(
            session,
            InstanceId(0),
            Callout::Read {
                handle: FileHandle(1),
                max_len: 4,
            },
        );
        let b = out.callout(session, InstanceId(0), Callout::UpdateInbox);
        assert_ne!(a, b);
        assert_eq!(out.drain().len(), 2);
        assert!(out.is_empty());
    }

    #[test]
    fn test_detached_has_no_token() {
        let mut out = Outbox::new();
        out.detached(
            SessionHandle::new(0, 0),
            InstanceId(0),
            Callout::Close {
                handle: FileHandle(3),
            },
        );
        match &out.pending()[0] {
            Output::Storage(req) => assert!(req.token.is_none()),
            other => panic!("unexpected output {other:?}"),
        }
    }
}
