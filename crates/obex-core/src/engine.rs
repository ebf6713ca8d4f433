//! Engine façade.
//!
//! The [`Engine`] owns every service instance and session. It is driven by
//! four kinds of input (transport requests, storage completions, application
//! commands and timer expiries) and answers with [`Output`]s collected in an
//! outbox that the caller drains after each input.
//!
//! The engine is single-threaded: the caller serializes inputs. Other threads
//! may consult the [`SharedIndex`] for peer lookups and the busy flag.

use crate::callout::Completion;
use crate::config::{EngineConfig, InstanceConfig};
use crate::error::{EngineError, Result};
use crate::events::{AppCommand, AppEvent, Outbox, Output, TimerEvent};
use crate::listing::ListingRenderer;
use crate::packet::{ConnId, Headers, PeerAddress, Request, ResponseCode};
use crate::registry::{InstanceId, InstanceState, Registry, ServiceInstance, SessionHandle, SharedIndex};
use crate::session::{Session, SessionEvent, SessionSettings, SessionState};
use crate::transfer::OperationKind;
use std::collections::HashMap;
use std::sync::Arc;

/// Request delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportEvent {
    /// Service instance the connection was accepted on
    pub instance: InstanceId,
    /// Transport connection
    pub conn: ConnId,
    /// Remote device
    pub peer: PeerAddress,
    /// Session sequence number of the request
    pub ssn: u8,
    /// Decoded request
    pub request: Request,
}

/// OBEX server session engine
#[derive(Debug)]
pub struct Engine {
    config: EngineConfig,
    settings: SessionSettings,
    registry: Registry,
    conns: HashMap<ConnId, SessionHandle>,
    index: Arc<SharedIndex>,
    outbox: Outbox,
}

impl Engine {
    /// Create an engine with no service instances
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        let settings = SessionSettings::from_config(&config);
        Self {
            config,
            settings,
            registry: Registry::new(),
            conns: HashMap::new(),
            index: Arc::new(SharedIndex::new()),
            outbox: Outbox::new(),
        }
    }

    /// Replace the listing serializer used by sessions created afterwards
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn ListingRenderer>) -> Self {
        self.settings.renderer = renderer;
        self
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Shared peer index
    #[must_use]
    pub fn index(&self) -> Arc<SharedIndex> {
        Arc::clone(&self.index)
    }

    /// Session behind `handle`
    #[must_use]
    pub fn session(&self, handle: SessionHandle) -> Option<&Session> {
        self.registry.get(handle)
    }

    /// Sessions in the pool of `instance`
    #[must_use]
    pub fn sessions(&self, instance: InstanceId) -> Vec<SessionHandle> {
        self.registry
            .instance(instance)
            .map(|i| i.sessions.clone())
            .unwrap_or_default()
    }

    /// Session serving `conn`
    #[must_use]
    pub fn session_for(&self, conn: ConnId) -> Option<SessionHandle> {
        self.conns.get(&conn).copied()
    }

    /// Enabled instances
    #[must_use]
    pub fn instances(&self) -> Vec<InstanceId> {
        self.registry.instance_ids()
    }

    /// Take every output queued so far
    pub fn drain(&mut self) -> Vec<Output> {
        self.outbox.drain()
    }

    // ========================================================================
    // Service lifecycle
    // ========================================================================

    /// Publish a service instance with a pool of listening sessions
    ///
    /// # Errors
    ///
    /// Returns `EngineError::InvalidConfig` for a bad configuration and
    /// `EngineError::AlreadyEnabled` if the id is taken.
    pub fn enable_service(&mut self, config: InstanceConfig) -> Result<()> {
        self.config.validate()?;
        config.validate()?;
        if self.registry.instance(config.id).is_some() {
            return Err(EngineError::AlreadyEnabled(config.id));
        }

        let mut sessions = Vec::with_capacity(config.max_sessions);
        for _ in 0..config.max_sessions {
            let handle = self.registry.allocate();
            self.registry
                .place(handle, Session::new(handle, &config, &self.settings));
            sessions.push(handle);
        }

        let id = config.id;
        tracing::info!(
            "Enabled {} ({:?}, {} sessions) at {}",
            id,
            config.profile,
            sessions.len(),
            config.root.display()
        );
        self.registry.add_instance(ServiceInstance {
            config,
            state: InstanceState::Enabled,
            sessions,
        });
        self.outbox.app(AppEvent::Enabled { instance: id });
        Ok(())
    }

    /// Stop accepting connections, close every session and remove the
    /// instance once all of them have drained
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownInstance` if the id is not enabled.
    pub fn disable_service(&mut self, id: InstanceId) -> Result<()> {
        let instance = self
            .registry
            .instance_mut(id)
            .ok_or(EngineError::UnknownInstance(id))?;
        instance.state = InstanceState::Disabling;
        let sessions = instance.sessions.clone();
        tracing::info!("Disabling {}", id);

        for handle in sessions {
            self.deliver(handle, SessionEvent::LocalClose);
        }
        self.reap(id);
        Ok(())
    }

    /// Remove an instance whose sessions are all idle
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownInstance` if the id is not enabled and
    /// `EngineError::InstanceBusy` if a session is connected or working.
    pub fn stop_instance(&mut self, id: InstanceId) -> Result<()> {
        let instance = self
            .registry
            .instance(id)
            .ok_or(EngineError::UnknownInstance(id))?;
        let busy = instance
            .sessions
            .iter()
            .any(|h| self.registry.get(*h).is_some_and(|s| !s.is_listening()));
        if busy {
            return Err(EngineError::InstanceBusy(id));
        }
        self.remove_instance(id);
        Ok(())
    }

    /// Close the session connected from `peer`
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownPeer` if no session serves the peer.
    pub fn close_session(&mut self, peer: PeerAddress) -> Result<()> {
        let handle = self
            .index
            .lookup(&peer)
            .ok_or(EngineError::UnknownPeer(peer))?;
        self.deliver(handle, SessionEvent::LocalClose);
        Ok(())
    }

    /// Answer an access request
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownSession` for a stale handle.
    pub fn access_response(
        &mut self,
        session: SessionHandle,
        operation: OperationKind,
        allow: bool,
    ) -> Result<()> {
        self.known(session)?;
        self.deliver(session, SessionEvent::AccessResponse { operation, allow });
        Ok(())
    }

    /// Supply the password for a pending authentication
    ///
    /// # Errors
    ///
    /// Returns `EngineError::UnknownSession` for a stale handle.
    pub fn auth_response(&mut self, session: SessionHandle, password: Vec<u8>) -> Result<()> {
        self.known(session)?;
        self.deliver(session, SessionEvent::AuthResponse { password });
        Ok(())
    }

    // ========================================================================
    // Inputs
    // ========================================================================

    /// Apply an application command
    ///
    /// # Errors
    ///
    /// Propagates the error of the command's method.
    pub fn handle_app(&mut self, command: AppCommand) -> Result<()> {
        match command {
            AppCommand::AccessResponse {
                session,
                operation,
                allow,
            } => self.access_response(session, operation, allow),
            AppCommand::AuthResponse { session, password } => self.auth_response(session, password),
            AppCommand::EnableService(config) => self.enable_service(config),
            AppCommand::DisableService { instance } => self.disable_service(instance),
            AppCommand::StopInstance { instance } => self.stop_instance(instance),
            AppCommand::CloseSession { peer } => self.close_session(peer),
        }
    }

    /// Apply a transport request
    pub fn handle_transport(&mut self, event: TransportEvent) {
        let TransportEvent {
            instance,
            conn,
            peer,
            ssn,
            request,
        } = event;
        tracing::trace!("{} {} from {}", conn, request.name(), peer);

        let handle = match self.conns.get(&conn) {
            Some(handle) => *handle,
            None => match self.accept_conn(instance, conn, &request) {
                Some(handle) => handle,
                None => return,
            },
        };
        self.deliver(
            handle,
            SessionEvent::Request {
                conn,
                peer,
                ssn,
                request,
            },
        );
    }

    /// Apply a storage completion
    pub fn handle_completion(&mut self, completion: Completion) {
        let Completion {
            token,
            session,
            result,
        } = completion;
        if self.registry.get(session).is_none() {
            tracing::debug!("completion {} for removed {}", token, session);
            return;
        }
        self.deliver(session, SessionEvent::Completion { token, result });
    }

    /// Apply a timer expiry
    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event {
            TimerEvent::AccessTimeout {
                session,
                request_id,
            } => {
                if self.registry.get(session).is_some() {
                    self.deliver(session, SessionEvent::AccessTimeout { request_id });
                }
            }
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn known(&self, session: SessionHandle) -> Result<()> {
        self.registry
            .get(session)
            .map(|_| ())
            .ok_or(EngineError::UnknownSession(session))
    }

    /// Bind a new connection to a listening session of `instance`
    fn accept_conn(&mut self, instance: InstanceId, conn: ConnId, request: &Request) -> Option<SessionHandle> {
        if matches!(request, Request::LinkClosed) {
            return None;
        }
        let enabled = self
            .registry
            .instance(instance)
            .is_some_and(|i| i.state == InstanceState::Enabled);
        let handle = if enabled {
            self.registry.find_listening(instance)
        } else {
            None
        };

        match handle {
            Some(handle) => {
                tracing::debug!("{} bound to {}", conn, handle);
                self.conns.insert(conn, handle);
                Some(handle)
            }
            None => {
                tracing::warn!("{} refused: {} has no free session", conn, instance);
                if let Some(kind) = request.reply_kind() {
                    self.outbox
                        .reply(conn, kind, ResponseCode::ServiceUnavailable, Headers::default());
                }
                None
            }
        }
    }

    fn deliver(&mut self, handle: SessionHandle, event: SessionEvent) {
        let Some(session) = self.registry.get_mut(handle) else {
            tracing::warn!("event for unknown {}", handle);
            return;
        };
        let before = session.state();
        let before_peer = session.peer();
        session.handle_event(event, &mut self.outbox);
        let after = session.state();
        let peer = session.peer();
        let instance = session.instance();

        if after == SessionState::Connected && before != SessionState::Connected {
            if let Some(peer) = peer {
                self.index.insert(peer, handle);
            }
        }
        if matches!(after, SessionState::Listening | SessionState::Idle) {
            if let Some(peer) = before_peer {
                self.index.remove(&peer, handle);
            }
            self.conns.retain(|_, bound| *bound != handle);
        }

        self.index
            .set_busy(self.registry.sessions().any(Session::is_busy));
        self.reap(instance);
    }

    /// Finish a disable once every session is back to listening
    fn reap(&mut self, id: InstanceId) {
        let Some(instance) = self.registry.instance(id) else {
            return;
        };
        if instance.state != InstanceState::Disabling {
            return;
        }
        let drained = instance
            .sessions
            .iter()
            .all(|h| self.registry.get(*h).is_none_or(Session::is_listening));
        if drained {
            self.remove_instance(id);
        }
    }

    fn remove_instance(&mut self, id: InstanceId) {
        let Some(instance) = self.registry.remove_instance(id) else {
            return;
        };
        for handle in instance.sessions {
            self.registry.remove(handle);
            self.conns.retain(|_, bound| *bound != handle);
        }
        tracing::info!("Disabled {}", id);
        self.outbox.app(AppEvent::Disabled { instance: id });
    }
}
