//! Session state machine and operation coordinator.
//!
//! A [`Session`] serves one client connection of a service instance. Every
//! input is a [`SessionEvent`]; [`Session::transition`] maps the current
//! state and the event to an [`Action`] and the next state without touching
//! the session, and [`Session::handle_event`] then performs the action.
//!
//! ```text
//!            Connect                     Connect (auth)
//!  Listening ───────────► Connected ◄────────────────── WaitAuth
//!      ▲                     │  ▲                          ▲ │
//!      │        Disconnect / │  │ Resume                   │ │ bad digest /
//!      │         LinkClosed  ▼  │                 Connect  │ │ Disconnect
//!      └────────────────── Closing               (auth req)│ ▼
//!          (after pending         Listening ───────────────┘
//!           callout completes)
//! ```
//!
//! At most one operation runs per session. Abort and disconnect never cut a
//! pending storage callout short: they are recorded as [`Deferred`] work and
//! applied when the completion arrives. Releasing an operation consumes it, so
//! its handle is closed and its buffers are dropped exactly once.

use crate::auth::{AuthChallenge, AuthDigest};
use crate::callout::{
    AccessMode, Callout, CalloutOutput, CalloutResult, CalloutToken, OpenMode, StorageError,
};
use crate::config::{AuthConfig, EngineConfig, InstanceConfig, ObjectKind, Profile};
use crate::error::ProtocolError;
use crate::events::{AppEvent, Outbox, TransportCommand};
use crate::listing::{ListingRenderer, XmlListing};
use crate::packet::{
    ActionId, ActionRequest, ConnId, ConnectRequest, Headers, PeerAddress, Reply, ReplyKind,
    Request, ResponseCode, SessionControl, SessionOpcode, SetPathRequest, body_capacity,
    validate_name,
};
use crate::registry::{InstanceId, SessionHandle};
use crate::transfer::{
    ActiveOp, Deferred, GetObject, OperationKind, PathWork, PutObject, Wait, Work,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not part of an enabled instance
    Idle,
    /// Waiting for a client to connect
    Listening,
    /// Challenge sent, waiting for the client's digest and the password
    WaitAuth,
    /// Client connected
    Connected,
    /// Disconnect in progress, waiting for a pending callout
    Closing,
}

/// Inputs to a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Request from the transport
    Request {
        /// Transport connection
        conn: ConnId,
        /// Remote device
        peer: PeerAddress,
        /// Sequence number of the request
        ssn: u8,
        /// Decoded request
        request: Request,
    },
    /// Storage completion
    Completion {
        /// Token of the callout
        token: CalloutToken,
        /// Outcome
        result: CalloutResult,
    },
    /// Allow/deny from the application
    AccessResponse {
        /// Operation the answer refers to
        operation: OperationKind,
        /// Decision
        allow: bool,
    },
    /// Access decision timer fired
    AccessTimeout {
        /// Request serial
        request_id: u64,
    },
    /// Password for the pending challenge
    AuthResponse {
        /// Password
        password: Vec<u8>,
    },
    /// Application or instance shutdown closes the session
    LocalClose,
}

/// Work selected by [`Session::transition`]
#[derive(Debug, Clone)]
pub enum Action {
    /// Negotiate and enter Connected
    Accept {
        /// Connection
        conn: ConnId,
        /// Remote device
        peer: PeerAddress,
        /// Connect parameters
        connect: ConnectRequest,
    },
    /// Answer Unauthorized with a fresh challenge
    Challenge {
        /// Connection
        conn: ConnId,
        /// Remote device
        peer: PeerAddress,
        /// Connect parameters
        connect: ConnectRequest,
    },
    /// Client sent a digest, ask the application for the password
    RequestAuth {
        /// Connection
        conn: ConnId,
        /// Client digest
        digest: AuthDigest,
        /// Connect parameters, when the digest came with a new Connect
        connect: Option<ConnectRequest>,
    },
    /// Check the digest against the password
    VerifyAuth {
        /// Password
        password: Vec<u8>,
    },
    /// Give up on the pending authentication
    CancelAuth {
        /// Connection to answer a Disconnect on
        reply_to: Option<ConnId>,
    },
    /// Run a request inside the connected session
    Dispatch {
        /// Connection
        conn: ConnId,
        /// Request sequence number
        ssn: u8,
        /// Request
        request: Request,
    },
    /// Abort the current operation
    Abort {
        /// Connection
        conn: ConnId,
    },
    /// Tear the session down
    Disconnect {
        /// Connection to answer on; `None` when the link dropped
        reply_to: Option<ConnId>,
    },
    /// Persist the session for a later resume
    Suspend {
        /// Connection
        conn: ConnId,
        /// Request sequence number
        ssn: u8,
    },
    /// Restore a suspended session
    Resume {
        /// Connection
        conn: ConnId,
        /// Remote device
        peer: PeerAddress,
        /// Request sequence number
        ssn: u8,
        /// Session-control parameters
        control: SessionControl,
    },
    /// Acknowledge a session-control request that needs no work
    SessionAck {
        /// Connection
        conn: ConnId,
    },
    /// Route a storage completion
    Complete {
        /// Token
        token: CalloutToken,
        /// Outcome
        result: CalloutResult,
    },
    /// Apply an access decision
    AccessResponse {
        /// Operation
        operation: OperationKind,
        /// Decision
        allow: bool,
    },
    /// Expire an access request
    AccessTimeout {
        /// Request serial
        request_id: u64,
    },
    /// Locally initiated close
    LocalClose {
        /// Connection to drop
        conn: Option<ConnId>,
        /// Close happens during authentication
        authenticating: bool,
    },
    /// Answer without further work
    Answer {
        /// Connection
        conn: ConnId,
        /// Response function
        kind: ReplyKind,
        /// Code
        code: ResponseCode,
    },
    /// Drop the event
    Discard {
        /// Logged reason
        reason: &'static str,
    },
}

/// Result of [`Session::transition`]
#[derive(Debug, Clone)]
pub struct Transition {
    /// Work to perform
    pub action: Action,
    /// State entered before the action runs
    pub next: SessionState,
}

/// Whether a release removes a partially written upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Release {
    /// Keep whatever was written
    Keep,
    /// Remove an upload that did not complete
    DiscardPartial,
}

/// Settings shared by all sessions of an engine
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Largest packet the server accepts
    pub max_packet_len: u16,
    /// Authentication
    pub auth: AuthConfig,
    /// Access decision timeout
    pub access_timeout: Option<Duration>,
    /// Listing serializer
    pub renderer: Arc<dyn ListingRenderer>,
}

impl SessionSettings {
    /// Settings derived from the engine configuration
    #[must_use]
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            max_packet_len: config.max_packet_len,
            auth: config.auth.clone(),
            access_timeout: config.access_timeout,
            renderer: Arc::new(XmlListing),
        }
    }
}

/// Request headers collected from packets without the final bit
#[derive(Debug)]
struct PartialRequest {
    kind: ReplyKind,
    headers: Headers,
}

/// Challenge in flight
#[derive(Debug)]
struct PendingAuth {
    challenge: AuthChallenge,
    conn: ConnId,
    peer: PeerAddress,
    connect: ConnectRequest,
    digest: Option<AuthDigest>,
}

/// One client session of a service instance
#[derive(Debug)]
pub struct Session {
    handle: SessionHandle,
    instance: InstanceId,
    profile: Profile,
    kinds: Vec<ObjectKind>,
    root: PathBuf,
    local_packet_len: u16,
    auth_config: AuthConfig,
    access_timeout: Option<Duration>,
    pub(crate) renderer: Arc<dyn ListingRenderer>,

    state: SessionState,
    conn: Option<ConnId>,
    peer: Option<PeerAddress>,
    packet_len: u16,
    body_capacity: usize,
    connection_id: u32,
    folder: Vec<String>,
    pub(crate) ssn: u8,
    announced: bool,
    pub(crate) op: Option<ActiveOp>,
    partial: Option<PartialRequest>,
    auth: Option<PendingAuth>,
    releases: u64,
}

impl Session {
    /// Create a listening session for `instance`
    #[must_use]
    pub fn new(handle: SessionHandle, instance: &InstanceConfig, settings: &SessionSettings) -> Self {
        Self {
            handle,
            instance: instance.id,
            profile: instance.profile,
            kinds: instance.kinds.clone(),
            root: instance.root.clone(),
            local_packet_len: settings.max_packet_len,
            auth_config: settings.auth.clone(),
            access_timeout: settings.access_timeout,
            renderer: Arc::clone(&settings.renderer),
            state: SessionState::Listening,
            conn: None,
            peer: None,
            packet_len: 0,
            body_capacity: 0,
            connection_id: handle.index().wrapping_add(1),
            folder: Vec::new(),
            ssn: 0,
            announced: false,
            op: None,
            partial: None,
            auth: None,
            releases: 0,
        }
    }

    /// Session handle
    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle
    }

    /// Owning service instance
    #[must_use]
    pub fn instance(&self) -> InstanceId {
        self.instance
    }

    /// Served profile
    #[must_use]
    pub fn profile(&self) -> Profile {
        self.profile
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Can take a new connection
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.state == SessionState::Listening && self.op.is_none()
    }

    /// An operation is in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.op.is_some()
    }

    /// Operation in progress
    #[must_use]
    pub fn operation(&self) -> Option<OperationKind> {
        self.op.as_ref().map(|op| op.kind)
    }

    /// Token of the outstanding callout
    #[must_use]
    pub fn pending_callout(&self) -> Option<CalloutToken> {
        match self.op.as_ref().map(|op| &op.wait) {
            Some(Wait::Callout { token, .. }) => Some(*token),
            _ => None,
        }
    }

    /// Access request awaiting a decision
    #[must_use]
    pub fn pending_access(&self) -> Option<&crate::access::AccessRequest> {
        match self.op.as_ref().map(|op| &op.wait) {
            Some(Wait::Access(request)) => Some(request),
            _ => None,
        }
    }

    /// Connected peer
    #[must_use]
    pub fn peer(&self) -> Option<PeerAddress> {
        self.peer
    }

    /// Transport connection
    #[must_use]
    pub fn conn(&self) -> Option<ConnId> {
        self.conn
    }

    /// Negotiated packet length
    #[must_use]
    pub fn packet_len(&self) -> u16 {
        self.packet_len
    }

    /// Body bytes per response packet
    #[must_use]
    pub fn body_capacity(&self) -> usize {
        self.body_capacity
    }

    /// Connection id header value
    #[must_use]
    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Current folder, as components below the root
    #[must_use]
    pub fn folder(&self) -> &[String] {
        &self.folder
    }

    /// Operations released since creation
    #[must_use]
    pub fn releases(&self) -> u64 {
        self.releases
    }

    pub(crate) fn access_timeout(&self) -> Option<Duration> {
        self.access_timeout
    }

    pub(crate) fn current_conn(&self) -> ConnId {
        self.conn.unwrap_or_default()
    }

    /// Decide what `event` does in the current state
    #[must_use]
    pub fn transition(&self, event: SessionEvent) -> Transition {
        use SessionState::{Closing, Connected, Idle, Listening, WaitAuth};

        let state = self.state;
        let (action, next) = match (state, event) {
            (Connected, SessionEvent::Request { request: Request::LinkClosed, .. }) => {
                (Action::Disconnect { reply_to: None }, Closing)
            }
            (WaitAuth, SessionEvent::Request { request: Request::LinkClosed, .. }) => {
                (Action::CancelAuth { reply_to: None }, Listening)
            }
            (_, SessionEvent::Request { request: Request::LinkClosed, .. }) => {
                (Action::Discard { reason: "link closed" }, state)
            }

            (Idle | Closing, SessionEvent::Request { conn, request, .. }) => {
                (answer(conn, &request, ResponseCode::ServiceUnavailable), state)
            }

            (Listening, SessionEvent::Request { conn, peer, request: Request::Connect(connect), .. }) => {
                if self.auth_config.required {
                    (Action::Challenge { conn, peer, connect }, WaitAuth)
                } else {
                    (Action::Accept { conn, peer, connect }, Connected)
                }
            }
            (
                Listening,
                SessionEvent::Request { conn, peer, ssn, request: Request::SessionControl(control) },
            ) if control.opcode == SessionOpcode::Resume => {
                (Action::Resume { conn, peer, ssn, control }, Connected)
            }
            (
                Listening | Connected,
                SessionEvent::Request { conn, request: Request::SessionControl(control), .. },
            ) if matches!(
                control.opcode,
                SessionOpcode::Create | SessionOpcode::Close | SessionOpcode::SetTimeout
            ) =>
            {
                (Action::SessionAck { conn }, state)
            }
            (Listening, SessionEvent::Request { conn, request: Request::Disconnect, .. }) => {
                (answer(conn, &Request::Disconnect, ResponseCode::Ok), Listening)
            }
            (Listening, SessionEvent::Request { conn, request, .. }) => {
                (answer(conn, &request, ResponseCode::ServiceUnavailable), Listening)
            }

            (WaitAuth, SessionEvent::Request { conn, peer, request: Request::Connect(connect), .. }) => {
                match connect.auth.clone() {
                    Some(digest) => (
                        Action::RequestAuth { conn, digest, connect: Some(connect) },
                        WaitAuth,
                    ),
                    None => (Action::Challenge { conn, peer, connect }, WaitAuth),
                }
            }
            (
                WaitAuth,
                SessionEvent::Request { conn, request: Request::AuthChallengeResponse(digest), .. },
            ) => (Action::RequestAuth { conn, digest, connect: None }, WaitAuth),
            (WaitAuth, SessionEvent::Request { conn, request: Request::Disconnect, .. }) => {
                (Action::CancelAuth { reply_to: Some(conn) }, Listening)
            }
            (WaitAuth, SessionEvent::Request { conn, request, .. }) => {
                (answer(conn, &request, ResponseCode::ServiceUnavailable), WaitAuth)
            }
            (WaitAuth, SessionEvent::AuthResponse { password }) => {
                (Action::VerifyAuth { password }, WaitAuth)
            }
            (WaitAuth, SessionEvent::LocalClose) => (
                Action::LocalClose { conn: self.conn, authenticating: true },
                Listening,
            ),

            (Connected, SessionEvent::Request { conn, request: Request::Disconnect, .. }) => {
                (Action::Disconnect { reply_to: Some(conn) }, Closing)
            }
            (Connected, SessionEvent::Request { conn, request: Request::Abort, .. }) => {
                (Action::Abort { conn }, Connected)
            }
            (
                Connected,
                SessionEvent::Request { conn, ssn, request: Request::SessionControl(control), .. },
            ) if control.opcode == SessionOpcode::Suspend => (Action::Suspend { conn, ssn }, Connected),
            (
                Connected,
                SessionEvent::Request {
                    conn,
                    request:
                        request @ (Request::Connect(_)
                        | Request::AuthChallengeResponse(_)
                        | Request::SessionControl(_)),
                    ..
                },
            ) => (answer(conn, &request, ResponseCode::BadRequest), Connected),
            (Connected, SessionEvent::Request { conn, ssn, request, .. }) => {
                (Action::Dispatch { conn, ssn, request }, Connected)
            }
            (Connected, SessionEvent::AccessResponse { operation, allow }) => {
                (Action::AccessResponse { operation, allow }, Connected)
            }
            (Connected, SessionEvent::AccessTimeout { request_id }) => {
                (Action::AccessTimeout { request_id }, Connected)
            }
            (Connected, SessionEvent::LocalClose) => (
                Action::LocalClose { conn: self.conn, authenticating: false },
                Closing,
            ),

            // Completions are routed in every state so that a stale open
            // handle still gets closed.
            (_, SessionEvent::Completion { token, result }) => {
                (Action::Complete { token, result }, state)
            }
            (_, SessionEvent::AccessResponse { .. }) => (
                Action::Discard { reason: "no access request outstanding" },
                state,
            ),
            (_, SessionEvent::AccessTimeout { .. }) => {
                (Action::Discard { reason: "access timeout after close" }, state)
            }
            (_, SessionEvent::AuthResponse { .. }) => {
                (Action::Discard { reason: "no authentication pending" }, state)
            }
            (_, SessionEvent::LocalClose) => (Action::Discard { reason: "not connected" }, state),
        };

        Transition { action, next }
    }

    /// Apply one event
    pub fn handle_event(&mut self, event: SessionEvent, out: &mut Outbox) {
        let Transition { action, next } = self.transition(event);
        if next != self.state {
            tracing::debug!("{} state {:?} -> {:?}", self.handle, self.state, next);
        }
        self.state = next;
        self.perform(action, out);
    }

    fn perform(&mut self, action: Action, out: &mut Outbox) {
        match action {
            Action::Accept {
                conn,
                peer,
                connect,
            } => self.accept(conn, peer, &connect, out),
            Action::Challenge {
                conn,
                peer,
                connect,
            } => self.challenge(conn, peer, connect, out),
            Action::RequestAuth {
                conn,
                digest,
                connect,
            } => self.request_auth(conn, digest, connect, out),
            Action::VerifyAuth { password } => self.verify_auth(&password, out),
            Action::CancelAuth { reply_to } => {
                if let Some(conn) = reply_to {
                    out.reply(conn, ReplyKind::Disconnect, ResponseCode::Ok, Headers::default());
                }
                tracing::debug!("{} authentication abandoned", self.handle);
                self.reset_connection();
            }
            Action::Dispatch { conn, ssn, request } => self.dispatch(conn, ssn, request, out),
            Action::Abort { conn } => self.abort(conn, out),
            Action::Disconnect { reply_to } => {
                if let Some(conn) = reply_to {
                    out.reply(conn, ReplyKind::Disconnect, ResponseCode::Ok, Headers::default());
                }
                self.begin_close(out);
            }
            Action::Suspend { conn, ssn } => self.suspend(conn, ssn, out),
            Action::Resume {
                conn,
                peer,
                ssn,
                control,
            } => self.resume(conn, peer, ssn, control, out),
            Action::SessionAck { conn } => {
                out.reply(conn, ReplyKind::Session, ResponseCode::Ok, Headers::default());
            }
            Action::Complete { token, result } => self.on_completion(token, result, out),
            Action::AccessResponse { operation, allow } => {
                self.on_access_response(operation, allow, out);
            }
            Action::AccessTimeout { request_id } => self.on_access_timeout(request_id, out),
            Action::LocalClose {
                conn,
                authenticating,
            } => {
                if let Some(conn) = conn {
                    // A request held at the access gate still gets its answer
                    if let Some(op) = self.op.as_ref().filter(|op| matches!(op.wait, Wait::Access(_))) {
                        tracing::debug!("{} closing with {} awaiting access", self.handle, op.kind);
                        out.reply(conn, op.reply, ResponseCode::ServiceUnavailable, Headers::default());
                    }
                    out.transport(TransportCommand::Disconnect { conn });
                }
                if authenticating {
                    self.reset_connection();
                } else {
                    self.begin_close(out);
                }
            }
            Action::Answer { conn, kind, code } => out.reply(conn, kind, code, Headers::default()),
            Action::Discard { reason } => {
                tracing::debug!("{} discarding event: {}", self.handle, reason);
            }
        }
    }

    // ========================================================================
    // Connection
    // ========================================================================

    fn accept(&mut self, conn: ConnId, peer: PeerAddress, connect: &ConnectRequest, out: &mut Outbox) {
        let target = self.profile.target();
        if connect.headers.target.as_deref() != Some(&target[..]) {
            tracing::warn!("{} connect from {} names another service", self.handle, peer);
            out.reply(
                conn,
                ReplyKind::Connect,
                ResponseCode::ServiceUnavailable,
                Headers::default(),
            );
            self.reset_connection();
            return;
        }

        let negotiated = connect.max_packet_len.min(self.local_packet_len);
        let capacity = match body_capacity(negotiated) {
            Ok(capacity) => capacity,
            Err(err) => {
                tracing::warn!("{} rejecting connect from {}: {}", self.handle, peer, err);
                out.reply(conn, ReplyKind::Connect, err.response_code(), Headers::default());
                self.reset_connection();
                return;
            }
        };

        self.conn = Some(conn);
        self.peer = Some(peer);
        self.packet_len = negotiated;
        self.body_capacity = capacity;
        self.folder.clear();
        self.partial = None;
        self.auth = None;
        self.state = SessionState::Connected;
        self.announced = true;

        out.push_reply(Reply {
            conn,
            kind: ReplyKind::Connect,
            code: ResponseCode::Ok,
            headers: Headers {
                connection_id: Some(self.connection_id),
                who: Some(target.to_vec()),
                ..Headers::default()
            },
            max_packet_len: Some(negotiated),
        });
        out.app(AppEvent::Opened {
            session: self.handle,
            peer,
        });
        tracing::info!(
            "{} connected from {} (packet length {})",
            self.handle,
            peer,
            negotiated
        );
    }

    fn challenge(&mut self, conn: ConnId, peer: PeerAddress, connect: ConnectRequest, out: &mut Outbox) {
        let challenge = AuthChallenge::generate(
            self.auth_config.user_id_required,
            self.auth_config.realm.clone(),
        );
        out.reply(
            conn,
            ReplyKind::Connect,
            ResponseCode::Unauthorized,
            Headers {
                auth_challenge: Some(challenge.clone()),
                ..Headers::default()
            },
        );
        self.conn = Some(conn);
        self.peer = Some(peer);
        self.auth = Some(PendingAuth {
            challenge,
            conn,
            peer,
            connect,
            digest: None,
        });
        tracing::debug!("{} challenged {}", self.handle, peer);
    }

    fn request_auth(
        &mut self,
        conn: ConnId,
        digest: AuthDigest,
        connect: Option<ConnectRequest>,
        out: &mut Outbox,
    ) {
        let Some(pending) = self.auth.as_mut() else {
            let peer = self.peer.unwrap_or_default();
            self.challenge(conn, peer, connect.unwrap_or_default(), out);
            return;
        };
        if let Some(connect) = connect {
            pending.connect = connect;
        }
        pending.conn = conn;
        let user_id = digest.user_id.clone();
        pending.digest = Some(digest);
        out.app(AppEvent::AuthRequested {
            session: self.handle,
            user_id,
        });
    }

    fn verify_auth(&mut self, password: &[u8], out: &mut Outbox) {
        let Some(pending) = self.auth.take() else {
            tracing::warn!("{} password without pending challenge", self.handle);
            return;
        };
        let verified = match &pending.digest {
            Some(digest) => pending.challenge.verify(digest, password),
            None => {
                tracing::warn!("{} password before the client's digest", self.handle);
                self.auth = Some(pending);
                return;
            }
        };

        if verified {
            tracing::debug!("{} digest verified", self.handle);
            self.accept(pending.conn, pending.peer, &pending.connect, out);
        } else {
            tracing::warn!("{} authentication failed for {}", self.handle, pending.peer);
            out.reply(
                pending.conn,
                ReplyKind::Connect,
                ResponseCode::Unauthorized,
                Headers::default(),
            );
            self.reset_connection();
        }
    }

    fn reset_connection(&mut self) {
        self.conn = None;
        self.peer = None;
        self.packet_len = 0;
        self.body_capacity = 0;
        self.folder.clear();
        self.partial = None;
        self.auth = None;
        self.announced = false;
        self.state = SessionState::Listening;
    }

    /// Restore connection parameters of a resumed session
    pub(crate) fn restore_connection(&mut self, packet_len: u16, folder: Vec<String>) -> bool {
        match body_capacity(packet_len.min(self.local_packet_len)) {
            Ok(capacity) => {
                self.packet_len = packet_len.min(self.local_packet_len);
                self.body_capacity = capacity;
                self.folder = folder;
                true
            }
            Err(_) => false,
        }
    }

    /// Bind a transport connection without announcing the session
    pub(crate) fn bind(&mut self, conn: ConnId, peer: PeerAddress) {
        self.conn = Some(conn);
        self.peer = Some(peer);
    }

    /// Mark the session open toward the application
    pub(crate) fn announce(&mut self, out: &mut Outbox) {
        if let Some(peer) = self.peer {
            self.announced = true;
            out.app(AppEvent::Opened {
                session: self.handle,
                peer,
            });
        }
    }

    // ========================================================================
    // Teardown coordinator
    // ========================================================================

    fn abort(&mut self, conn: ConnId, out: &mut Outbox) {
        self.partial = None;
        if let Some(Wait::Callout { deferred, .. }) = self.op.as_mut().map(|op| &mut op.wait) {
            *deferred = deferred.upgrade(Deferred::Abort);
            tracing::debug!("{} abort deferred until the pending callout completes", self.handle);
            return;
        }
        if let Some(kind) = self.operation() {
            tracing::info!("{} aborted {}", self.handle, kind);
        }
        self.release_operation(Release::DiscardPartial, out);
        out.reply(conn, ReplyKind::Abort, ResponseCode::Ok, Headers::default());
    }

    fn begin_close(&mut self, out: &mut Outbox) {
        self.partial = None;
        if let Some(Wait::Callout { deferred, .. }) = self.op.as_mut().map(|op| &mut op.wait) {
            *deferred = deferred.upgrade(Deferred::Close);
            tracing::debug!("{} teardown deferred until the pending callout completes", self.handle);
            return;
        }
        self.finish_close(out);
    }

    /// Release everything and return to Listening
    pub(crate) fn finish_close(&mut self, out: &mut Outbox) {
        self.release_operation(Release::DiscardPartial, out);
        if self.announced {
            if let Some(peer) = self.peer {
                out.app(AppEvent::Closed {
                    session: self.handle,
                    peer,
                });
            }
        }
        tracing::info!("{} closed", self.handle);
        self.reset_connection();
    }

    /// Release the current operation, if any
    pub(crate) fn release_operation(&mut self, mode: Release, out: &mut Outbox) {
        if let Some(op) = self.op.take() {
            self.release(op, mode, out);
        }
    }

    /// Free everything an operation owns
    ///
    /// Taking the operation by value makes a second release of the same
    /// operation impossible.
    pub(crate) fn release(&mut self, op: ActiveOp, mode: Release, out: &mut Outbox) {
        self.releases += 1;
        if let Some(handle) = op.work.handle() {
            out.detached(self.handle, self.instance, Callout::Close { handle });
        }
        if mode == Release::DiscardPartial {
            if let Work::Put(put) = &op.work {
                if let (PutObject::File(path), Some(_)) = (&put.object, put.handle) {
                    tracing::info!("{} removing partial upload {}", self.handle, path.display());
                    out.detached(self.handle, self.instance, Callout::Unlink { path: path.clone() });
                }
            }
        }
        tracing::debug!("{} released {}", self.handle, op.kind);
    }

    // ========================================================================
    // Operation plumbing
    // ========================================================================

    /// Issue `callout` and park `op` until its completion
    pub(crate) fn issue(&mut self, mut op: ActiveOp, callout: Callout, out: &mut Outbox) {
        let token = out.callout(self.handle, self.instance, callout);
        op.wait = Wait::Callout {
            token,
            deferred: Deferred::Nothing,
        };
        self.op = Some(op);
    }

    /// Answer Continue and wait for the client's next packet
    pub(crate) fn await_client(&mut self, mut op: ActiveOp, headers: Headers, out: &mut Outbox) {
        out.reply(self.current_conn(), op.reply, ResponseCode::Continue, headers);
        op.wait = Wait::Client;
        self.op = Some(op);
    }

    /// Release `op` and send its final response
    pub(crate) fn finish(
        &mut self,
        op: ActiveOp,
        code: ResponseCode,
        headers: Headers,
        mode: Release,
        out: &mut Outbox,
    ) {
        let operation = op.kind;
        let reply = op.reply;
        let object = op.object_name();
        self.release(op, mode, out);
        out.reply(self.current_conn(), reply, code, headers);
        out.app(AppEvent::OperationComplete {
            session: self.handle,
            operation,
            code,
            object,
        });
    }

    /// Finish `op` with the code mapped from a storage failure
    pub(crate) fn fail(&mut self, op: ActiveOp, err: &StorageError, mode: Release, out: &mut Outbox) {
        tracing::warn!("{} {} failed: {}", self.handle, op.kind, err);
        self.finish(op, err.response_code(), Headers::default(), mode, out);
    }

    /// Start a (possibly access-approved) operation
    pub(crate) fn proceed(&mut self, op: ActiveOp, out: &mut Outbox) {
        let callout = match &op.work {
            Work::Get(get) => match &get.object {
                GetObject::File(path) => Callout::Open {
                    path: path.clone(),
                    mode: OpenMode::Read,
                    size_hint: None,
                },
                GetObject::Message {
                    handle,
                    charset,
                    attachment,
                } => Callout::OpenMessage {
                    handle: handle.clone(),
                    charset: *charset,
                    attachment: *attachment,
                },
            },
            Work::Put(put) => match &put.object {
                PutObject::File(path) => Callout::Open {
                    path: path.clone(),
                    mode: OpenMode::Create,
                    size_hint: put.expected,
                },
                PutObject::Message { folder, charset } => Callout::PushMessage {
                    folder: folder.clone(),
                    charset: *charset,
                },
            },
            Work::Listing(_) => {
                self.listing_start(op, out);
                return;
            }
            Work::Path(work) => match (op.kind, &work.dest) {
                (OperationKind::MakeDir, _) => Callout::Mkdir {
                    path: work.path.clone(),
                },
                (OperationKind::Copy | OperationKind::Move, Some(dest)) => Callout::Rename {
                    from: work.path.clone(),
                    to: dest.clone(),
                    copy: op.kind == OperationKind::Copy,
                },
                (OperationKind::SetPermissions, _) => Callout::Chmod {
                    path: work.path.clone(),
                    permissions: work.permissions.unwrap_or_default(),
                },
                _ => Callout::Access {
                    path: work.path.clone(),
                    mode: AccessMode::Exists,
                },
            },
            Work::Message(work) => match (&work.handle, work.indicator) {
                (Some(handle), Some(indicator)) => Callout::SetMessageStatus {
                    handle: handle.clone(),
                    indicator,
                    value: work.value,
                },
                _ => Callout::UpdateInbox,
            },
            Work::Suspend(_) | Work::Resume(_) => {
                tracing::error!("{} {} cannot be gated", self.handle, op.kind);
                self.finish(
                    op,
                    ResponseCode::InternalError,
                    Headers::default(),
                    Release::Keep,
                    out,
                );
                return;
            }
        };
        self.issue(op, callout, out);
    }

    fn on_completion(&mut self, token: CalloutToken, result: CalloutResult, out: &mut Outbox) {
        let deferred = match self.op.as_ref().map(|op| &op.wait) {
            Some(Wait::Callout {
                token: pending,
                deferred,
            }) if *pending == token => *deferred,
            _ => {
                tracing::warn!("{} ignoring stale completion {}", self.handle, token);
                if let Ok(
                    CalloutOutput::Opened { handle, .. } | CalloutOutput::MessageCreated { handle, .. },
                ) = &result
                {
                    out.detached(self.handle, self.instance, Callout::Close { handle: *handle });
                }
                return;
            }
        };
        let Some(mut op) = self.op.take() else {
            return;
        };
        op.wait = Wait::Client;
        self.adopt(&mut op, &result, out);

        match deferred {
            Deferred::Close => {
                self.op = Some(op);
                self.finish_close(out);
            }
            Deferred::Abort => {
                tracing::info!("{} aborted {} after completion", self.handle, op.kind);
                self.release(op, Release::DiscardPartial, out);
                out.reply(
                    self.current_conn(),
                    ReplyKind::Abort,
                    ResponseCode::Ok,
                    Headers::default(),
                );
            }
            Deferred::Nothing => self.advance(op, result, out),
        }
    }

    /// Take ownership of a handle produced by an open
    fn adopt(&mut self, op: &mut ActiveOp, result: &CalloutResult, out: &mut Outbox) {
        let (handle, message) = match result {
            Ok(CalloutOutput::Opened { handle, .. }) => (*handle, None),
            Ok(CalloutOutput::MessageCreated { handle, message }) => (*handle, Some(message.clone())),
            _ => return,
        };
        match &mut op.work {
            Work::Get(get) => get.handle = Some(handle),
            Work::Put(put) => {
                put.handle = Some(handle);
                if message.is_some() {
                    put.message = message;
                }
            }
            Work::Resume(resume) => resume.handle = Some(handle),
            _ => {
                tracing::warn!("{} {} got an unexpected open handle", self.handle, op.kind);
                out.detached(self.handle, self.instance, Callout::Close { handle });
            }
        }
    }

    fn advance(&mut self, op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        match &op.work {
            Work::Get(_) => self.get_step(op, result, out),
            Work::Put(_) => self.put_step(op, result, out),
            Work::Listing(_) => self.listing_step(op, result, out),
            Work::Path(_) => self.path_step(op, result, out),
            Work::Message(_) => match result {
                Ok(_) => self.finish(op, ResponseCode::Ok, Headers::default(), Release::Keep, out),
                Err(err) => self.fail(op, &err, Release::Keep, out),
            },
            Work::Suspend(_) => self.suspend_step(op, result, out),
            Work::Resume(_) => self.resume_step(op, result, out),
        }
    }

    // ========================================================================
    // Request dispatch
    // ========================================================================

    fn dispatch(&mut self, conn: ConnId, ssn: u8, request: Request, out: &mut Outbox) {
        self.ssn = ssn;
        let Some(kind) = request.reply_kind() else {
            return;
        };

        if let Request::Get { headers, .. } | Request::Put { headers, .. } = &request {
            if headers
                .connection_id
                .is_some_and(|id| id != self.connection_id)
            {
                tracing::warn!("{} request for another connection id", self.handle);
                out.reply(conn, kind, ResponseCode::ServiceUnavailable, Headers::default());
                return;
            }
        }

        if let Some(op) = &self.op {
            if !matches!(op.wait, Wait::Client) {
                tracing::warn!(
                    "{} {} while {} is pending",
                    self.handle,
                    request.name(),
                    op.kind
                );
                out.reply(conn, kind, ResponseCode::ServiceUnavailable, Headers::default());
                return;
            }
        }

        let result = match request {
            Request::Get { headers, final_bit } => self.on_get(headers, final_bit, out),
            Request::Put { headers, final_bit } => self.on_put(headers, final_bit, out),
            Request::SetPath(req) => {
                self.supersede(out);
                self.start_setpath(req, out)
            }
            Request::Action(req) => {
                self.supersede(out);
                self.start_action(req, out)
            }
            other => {
                tracing::warn!("{} unexpected {}", self.handle, other.name());
                Err(ProtocolError::NotAllowed("request in connected session"))
            }
        };

        if let Err(err) = result {
            tracing::warn!("{} rejecting request: {}", self.handle, err);
            out.reply(conn, kind, err.response_code(), Headers::default());
        }
    }

    /// Drop an operation the client walked away from
    pub(crate) fn supersede(&mut self, out: &mut Outbox) {
        if let Some(kind) = self.operation() {
            tracing::warn!("{} {} superseded by a new request", self.handle, kind);
            self.release_operation(Release::DiscardPartial, out);
        }
        self.partial = None;
    }

    /// Remember headers of a request whose final packet is still to come
    pub(crate) fn hold_partial(&mut self, kind: ReplyKind, headers: Headers, out: &mut Outbox) {
        let headers = match self.partial.take() {
            Some(mut held) if held.kind == kind => {
                held.headers.merge(headers);
                held.headers
            }
            _ => headers,
        };
        self.partial = Some(PartialRequest { kind, headers });
        out.reply(self.current_conn(), kind, ResponseCode::Continue, Headers::default());
    }

    /// Combine held headers with the final packet
    pub(crate) fn complete_partial(&mut self, kind: ReplyKind, headers: Headers) -> Headers {
        match self.partial.take() {
            Some(mut held) if held.kind == kind => {
                held.headers.merge(headers);
                held.headers
            }
            _ => headers,
        }
    }

    /// Refuse an object type this instance does not offer
    pub(crate) fn require(&self, kind: ObjectKind, object_type: &str) -> Result<(), ProtocolError> {
        if self.kinds.contains(&kind) {
            Ok(())
        } else {
            Err(ProtocolError::UnsupportedType(Some(object_type.to_string())))
        }
    }

    /// Absolute path of a folder given as components below the root
    pub(crate) fn folder_path(&self, folder: &[String]) -> PathBuf {
        let mut path = self.root.clone();
        path.extend(folder);
        path
    }

    /// Path of `name` inside the current folder
    pub(crate) fn child_path(&self, name: &str) -> Result<PathBuf, ProtocolError> {
        let name = validate_name(name)?;
        Ok(self.folder_path(&self.folder).join(name))
    }

    /// Folder named relative to the current one; `..` climbs, a leading `/`
    /// starts at the root
    pub(crate) fn resolve_relative(&self, dest: &str) -> Result<Vec<String>, ProtocolError> {
        let mut folder = if dest.starts_with('/') {
            Vec::new()
        } else {
            self.folder.clone()
        };
        for part in dest.split('/') {
            match part {
                "" | "." => {}
                ".." => {
                    if folder.pop().is_none() {
                        return Err(ProtocolError::InvalidName(dest.to_string()));
                    }
                }
                name => folder.push(validate_name(name)?.to_string()),
            }
        }
        if folder.is_empty() {
            return Err(ProtocolError::InvalidName(dest.to_string()));
        }
        Ok(folder)
    }

    fn start_setpath(&mut self, req: SetPathRequest, out: &mut Outbox) -> Result<(), ProtocolError> {
        let conn = self.current_conn();
        let mut folder = self.folder.clone();
        if req.backup && folder.pop().is_none() {
            out.reply(conn, ReplyKind::SetPath, ResponseCode::NotFound, Headers::default());
            return Ok(());
        }

        match req.name.as_deref() {
            None | Some("") => {
                if !req.backup {
                    folder.clear();
                }
                tracing::debug!("{} folder now /{}", self.handle, folder.join("/"));
                self.folder = folder;
                out.reply(conn, ReplyKind::SetPath, ResponseCode::Ok, Headers::default());
                Ok(())
            }
            Some(name) => {
                folder.push(validate_name(name)?.to_string());
                let path = self.folder_path(&folder);
                let create = req.create && self.profile == Profile::FileTransfer;
                let op = ActiveOp::new(
                    OperationKind::ChangeDir,
                    ReplyKind::SetPath,
                    Work::Path(PathWork {
                        path,
                        dest: None,
                        permissions: None,
                        folder: Some(folder),
                        create,
                    }),
                );
                self.gate(op, out);
                Ok(())
            }
        }
    }

    fn start_action(&mut self, req: ActionRequest, out: &mut Outbox) -> Result<(), ProtocolError> {
        self.require(ObjectKind::Files, "action")?;
        let path = self.child_path(&req.name)?;
        let (kind, dest, permissions) = match req.action {
            ActionId::Copy | ActionId::Move => {
                let dest = req
                    .dest_name
                    .as_deref()
                    .ok_or(ProtocolError::MissingHeader("DestName"))?;
                let folder = self.resolve_relative(dest)?;
                let kind = if req.action == ActionId::Copy {
                    OperationKind::Copy
                } else {
                    OperationKind::Move
                };
                (kind, Some(self.folder_path(&folder)), None)
            }
            ActionId::SetPermissions => {
                let permissions = req
                    .permissions
                    .ok_or(ProtocolError::MissingHeader("Permissions"))?;
                (OperationKind::SetPermissions, None, Some(permissions))
            }
        };

        let op = ActiveOp::new(
            kind,
            ReplyKind::Action,
            Work::Path(PathWork {
                path,
                dest,
                permissions,
                folder: None,
                create: false,
            }),
        );
        self.gate(op, out);
        Ok(())
    }

    /// Delete requested by a PUT without body
    pub(crate) fn start_delete(&mut self, name: &str, out: &mut Outbox) -> Result<(), ProtocolError> {
        let path = self.child_path(name)?;
        let op = ActiveOp::new(
            OperationKind::Delete,
            ReplyKind::Put,
            Work::Path(PathWork {
                path,
                dest: None,
                permissions: None,
                folder: None,
                create: false,
            }),
        );
        self.gate(op, out);
        Ok(())
    }

    fn path_step(&mut self, mut op: ActiveOp, result: CalloutResult, out: &mut Outbox) {
        let Work::Path(work) = &op.work else {
            return;
        };
        let path = work.path.clone();
        let folder = work.folder.clone();
        let create = work.create;

        match (op.kind, result) {
            (OperationKind::ChangeDir, Err(StorageError::NotFound)) if create => {
                tracing::debug!("{} creating missing folder {}", self.handle, path.display());
                op.kind = OperationKind::MakeDir;
                self.gate(op, out);
            }
            (_, Err(err)) => self.fail(op, &err, Release::Keep, out),
            (OperationKind::Delete, Ok(CalloutOutput::Access { is_dir })) => {
                let callout = if is_dir {
                    Callout::Rmdir { path }
                } else {
                    Callout::Unlink { path }
                };
                self.issue(op, callout, out);
            }
            (OperationKind::ChangeDir, Ok(CalloutOutput::Access { is_dir: false })) => {
                self.finish(op, ResponseCode::NotFound, Headers::default(), Release::Keep, out);
            }
            (OperationKind::ChangeDir | OperationKind::MakeDir, Ok(_)) => {
                if let Some(folder) = folder {
                    tracing::debug!("{} folder now /{}", self.handle, folder.join("/"));
                    self.folder = folder;
                }
                self.finish(op, ResponseCode::Ok, Headers::default(), Release::Keep, out);
            }
            (_, Ok(_)) => self.finish(op, ResponseCode::Ok, Headers::default(), Release::Keep, out),
        }
    }
}

fn answer(conn: ConnId, request: &Request, code: ResponseCode) -> Action {
    match request.reply_kind() {
        Some(kind) => Action::Answer { conn, kind, code },
        None => Action::Discard {
            reason: "no response function",
        },
    }
}
