//! Synchronous engine harness.

use super::mem_store::MemStore;
use obex_core::events::TimerRequest;
use obex_core::packet::ConnectRequest;
use obex_core::{
    AccessRequest, AppEvent, Callout, CalloutResult, ConnId, Engine, EngineConfig, Headers,
    InstanceConfig, InstanceId, OperationKind, Output, PeerAddress, Reply, Request, ResponseCode,
    Session, SessionHandle, StorageRequest, TransportCommand, TransportEvent,
};
use std::collections::{HashMap, VecDeque};

/// Remote device used by every harness connection
pub const PEER: PeerAddress = PeerAddress([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

/// Root folder of the harness instance
pub const ROOT: &str = "/obex";

/// How the harness answers access requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessPolicy {
    /// Allow immediately
    Allow,
    /// Deny immediately
    Deny,
    /// Leave pending until the test answers
    Manual,
}

/// Engine plus an in-memory store, stepped one input at a time
#[derive(Debug)]
pub struct Harness {
    /// Engine under test
    pub engine: Engine,
    /// Backing store
    pub store: MemStore,
    /// Execute callouts against the store as soon as they are issued
    pub auto_complete: bool,
    /// Access answer policy
    pub access: AccessPolicy,
    /// Every reply, in order
    pub replies: Vec<Reply>,
    /// Every application event, in order
    pub events: Vec<AppEvent>,
    /// Every callout issued, detached ones included
    pub issued: Vec<Callout>,
    /// Callouts waiting for a completion
    pub pending: VecDeque<StorageRequest>,
    /// Timer requests
    pub timers: Vec<TimerRequest>,
    /// Link commands
    pub commands: Vec<TransportCommand>,
    instance: InstanceId,
    conn: ConnId,
    ssn: u8,
    answers: VecDeque<(SessionHandle, OperationKind, bool)>,
    outstanding: HashMap<SessionHandle, usize>,
    peak_outstanding: usize,
}

impl Harness {
    /// File transfer instance at [`ROOT`] over `store`
    #[must_use]
    pub fn ftp(store: MemStore) -> Self {
        Self::new(EngineConfig::default(), InstanceConfig::file_transfer(ROOT), store)
    }

    /// Engine with one enabled instance
    ///
    /// # Panics
    ///
    /// Panics if the instance cannot be enabled.
    #[must_use]
    pub fn new(config: EngineConfig, instance: InstanceConfig, store: MemStore) -> Self {
        let id = instance.id;
        let mut engine = Engine::new(config);
        engine.enable_service(instance).expect("enable instance");
        let mut harness = Self {
            engine,
            store,
            auto_complete: true,
            access: AccessPolicy::Allow,
            replies: Vec::new(),
            events: Vec::new(),
            issued: Vec::new(),
            pending: VecDeque::new(),
            timers: Vec::new(),
            commands: Vec::new(),
            instance: id,
            conn: ConnId(1),
            ssn: 0,
            answers: VecDeque::new(),
            outstanding: HashMap::new(),
            peak_outstanding: 0,
        };
        harness.pump();
        harness
    }

    // ========================================================================
    // Client side
    // ========================================================================

    /// Send one request and return the replies it produced
    pub fn request(&mut self, request: Request) -> Vec<Reply> {
        let before = self.replies.len();
        let event = TransportEvent {
            instance: self.instance,
            conn: self.conn,
            peer: PEER,
            ssn: self.ssn,
            request,
        };
        self.ssn = self.ssn.wrapping_add(1);
        self.engine.handle_transport(event);
        self.pump();
        self.replies[before..].to_vec()
    }

    /// Connect with `max_packet_len` and return the connect reply
    ///
    /// # Panics
    ///
    /// Panics if the engine does not answer.
    pub fn connect(&mut self, max_packet_len: u16) -> Reply {
        let target = self
            .engine
            .session(self.session_handle())
            .map(|s| s.profile().target().to_vec());
        let replies = self.request(Request::Connect(ConnectRequest {
            max_packet_len,
            headers: Headers {
                target,
                ..Headers::default()
            },
            auth: None,
        }));
        replies.last().cloned().expect("connect reply")
    }

    /// GET `headers`, following Continue until a final response
    pub fn get(&mut self, headers: Headers) -> Vec<Reply> {
        let mut replies = self.request(Request::Get {
            headers,
            final_bit: true,
        });
        while replies
            .last()
            .is_some_and(|r| r.code == ResponseCode::Continue)
        {
            let next = self.request(Request::Get {
                headers: Headers::default(),
                final_bit: true,
            });
            if next.is_empty() {
                break;
            }
            replies.extend(next);
        }
        replies
    }

    /// PUT `data` as `name` in chunks of `chunk` bytes
    pub fn put(&mut self, name: &str, data: &[u8], chunk: usize) -> Vec<Reply> {
        let chunks: Vec<&[u8]> = if data.is_empty() {
            vec![&[]]
        } else {
            data.chunks(chunk.max(1)).collect()
        };
        let last = chunks.len() - 1;
        let mut replies = Vec::new();
        for (i, part) in chunks.into_iter().enumerate() {
            let mut headers = Headers {
                body: Some(part.to_vec()),
                end_of_body: i == last,
                ..Headers::default()
            };
            if i == 0 {
                headers.name = Some(name.to_string());
                headers.length = Some(data.len() as u64);
            }
            let step = self.request(Request::Put {
                headers,
                final_bit: i == last,
            });
            let stop = step.last().is_none_or(|r| r.code != ResponseCode::Continue);
            replies.extend(step);
            if stop {
                break;
            }
        }
        replies
    }

    /// Drop the link without a Disconnect
    pub fn link_closed(&mut self) {
        self.request(Request::LinkClosed);
    }

    // ========================================================================
    // Collaborator side
    // ========================================================================

    /// Complete the oldest pending callout with `result`
    ///
    /// # Panics
    ///
    /// Panics if no callout is pending.
    pub fn complete_next(&mut self, result: CalloutResult) {
        let request = self.pending.pop_front().expect("pending callout");
        self.finish_callout(&request, result);
        self.pump();
    }

    /// Execute the oldest pending callout against the store
    ///
    /// # Panics
    ///
    /// Panics if no callout is pending.
    pub fn serve_next(&mut self) {
        let request = self.pending.pop_front().expect("pending callout");
        let result = self.store.execute(&request.callout);
        self.finish_callout(&request, result);
        self.pump();
    }

    /// Answer the most recent access request
    ///
    /// # Panics
    ///
    /// Panics if no access request was made.
    pub fn answer_access(&mut self, allow: bool) {
        let request = self.last_access_request().expect("access request");
        self.engine
            .access_response(request.session, request.operation, allow)
            .expect("live session");
        self.pump();
    }

    /// Deliver every timer requested so far
    pub fn fire_timers(&mut self) {
        for timer in std::mem::take(&mut self.timers) {
            self.engine.handle_timer(timer.event);
            self.pump();
        }
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// The instance's first session
    ///
    /// # Panics
    ///
    /// Panics if the instance was removed.
    #[must_use]
    pub fn session_handle(&self) -> SessionHandle {
        self.engine.sessions(self.instance)[0]
    }

    /// The instance's first session
    ///
    /// # Panics
    ///
    /// Panics if the instance was removed.
    #[must_use]
    pub fn session(&self) -> &Session {
        self.engine
            .session(self.session_handle())
            .expect("session exists")
    }

    /// Most recent access request
    #[must_use]
    pub fn last_access_request(&self) -> Option<AccessRequest> {
        self.events.iter().rev().find_map(|event| match event {
            AppEvent::AccessRequested(request) => Some(request.clone()),
            _ => None,
        })
    }

    /// Sum of all Progress events
    #[must_use]
    pub fn progress_bytes(&self) -> u64 {
        self.events
            .iter()
            .map(|event| match event {
                AppEvent::Progress { bytes, .. } => *bytes,
                _ => 0,
            })
            .sum()
    }

    /// Operation results reported to the application
    #[must_use]
    pub fn completed(&self) -> Vec<(OperationKind, ResponseCode)> {
        self.events
            .iter()
            .filter_map(|event| match event {
                AppEvent::OperationComplete {
                    operation, code, ..
                } => Some((*operation, *code)),
                _ => None,
            })
            .collect()
    }

    /// Most callouts any one session had outstanding at once
    #[must_use]
    pub fn peak_outstanding(&self) -> usize {
        self.peak_outstanding
    }

    /// Callouts named `name` issued so far
    #[must_use]
    pub fn issued_named(&self, name: &str) -> usize {
        self.issued.iter().filter(|c| c.name() == name).count()
    }

    // ========================================================================
    // Routing
    // ========================================================================

    /// Route engine outputs until the engine is quiet
    pub fn pump(&mut self) {
        loop {
            let outputs = self.engine.drain();
            if outputs.is_empty() {
                if let Some((session, operation, allow)) = self.answers.pop_front() {
                    // A session may be gone by now; stale answers are fine
                    let _ = self.engine.access_response(session, operation, allow);
                    continue;
                }
                if self.auto_complete {
                    if let Some(request) = self.pending.pop_front() {
                        let result = self.store.execute(&request.callout);
                        self.finish_callout(&request, result);
                        continue;
                    }
                }
                return;
            }
            for output in outputs {
                self.record(output);
            }
        }
    }

    fn record(&mut self, output: Output) {
        match output {
            Output::Reply(reply) => self.replies.push(reply),
            Output::Transport(command) => self.commands.push(command),
            Output::Timer(timer) => self.timers.push(timer),
            Output::App(event) => {
                if let AppEvent::AccessRequested(request) = &event {
                    match self.access {
                        AccessPolicy::Allow => {
                            self.answers
                                .push_back((request.session, request.operation, true));
                        }
                        AccessPolicy::Deny => {
                            self.answers
                                .push_back((request.session, request.operation, false));
                        }
                        AccessPolicy::Manual => {}
                    }
                }
                self.events.push(event);
            }
            Output::Storage(request) => {
                self.issued.push(request.callout.clone());
                if request.token.is_none() {
                    let _ = self.store.execute(&request.callout);
                    return;
                }
                let count = self.outstanding.entry(request.session).or_default();
                *count += 1;
                self.peak_outstanding = self.peak_outstanding.max(*count);
                self.pending.push_back(request);
            }
        }
    }

    fn finish_callout(&mut self, request: &StorageRequest, result: CalloutResult) {
        if let Some(count) = self.outstanding.get_mut(&request.session) {
            *count = count.saturating_sub(1);
        }
        if let Some(completion) = request.complete(result) {
            self.engine.handle_completion(completion);
        }
    }
}
