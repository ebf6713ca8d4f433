//! Tokio driver for the engine.
//!
//! [`spawn`] moves an [`Engine`] into a task that owns it exclusively. All
//! inputs arrive over one channel, so the engine sees them strictly one at a
//! time; outputs are routed to three sinks (transport, storage, application).
//! Timer requests become sleeping tasks that feed their expiry back into the
//! input channel.
//!
//! The task also drives the MAP notification clients. A notification
//! registration asks the transport to open a link to the peer
//! ([`TransportOutput::OpenNotify`]); the transport reports the link and the
//! peer's responses back through [`ServerHandle::notify`].

use crate::callout::{Completion, StorageRequest};
use crate::config::NotifyConfig;
use crate::engine::{Engine, TransportEvent};
use crate::error::{NotifyError, ServerClosed};
use crate::events::{AppCommand, AppEvent, Output, TimerEvent, TransportCommand};
use crate::notify::{ClientOutput, ClientRequest, NotificationClient, NotifyEvent};
use crate::packet::{ConnId, Headers, PeerAddress, Reply, ResponseCode};
use crate::registry::InstanceId;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default depth of the input queue
pub const DEFAULT_QUEUE_DEPTH: usize = 256;

/// Inputs accepted by the engine task
#[derive(Debug)]
pub enum Input {
    /// Transport request
    Transport(TransportEvent),
    /// Storage completion
    Completion(Completion),
    /// Application command
    App(AppCommand),
    /// Timer expiry
    Timer(TimerEvent),
    /// Notification link activity
    Notify(NotifyInput),
    /// Notification response timer expiry
    NotifyTimeout {
        /// Peer of the client that armed the timer
        peer: PeerAddress,
        /// Serial the timer was armed with
        serial: u64,
    },
    /// Stop the task and hand the engine back
    Shutdown,
}

/// Notification link activity reported by the transport or the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NotifyInput {
    /// Link requested with [`TransportOutput::OpenNotify`] is up
    LinkOpened {
        /// Peer
        peer: PeerAddress,
        /// Link
        conn: ConnId,
    },
    /// Link could not be opened
    LinkFailed {
        /// Peer
        peer: PeerAddress,
    },
    /// Response from the peer's notification service
    Response {
        /// Peer
        peer: PeerAddress,
        /// Response code
        code: ResponseCode,
        /// Response headers
        headers: Headers,
        /// Packet size from a Connect response
        max_packet_len: Option<u16>,
    },
    /// Link dropped
    LinkClosed {
        /// Peer
        peer: PeerAddress,
    },
    /// Event report the application wants delivered
    Report {
        /// Peer
        peer: PeerAddress,
        /// Encoded event report object
        report: Vec<u8>,
    },
}

/// Output for the transport layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutput {
    /// Response to send
    Reply(Reply),
    /// Link command
    Command(TransportCommand),
    /// Open a link to the peer's notification service
    OpenNotify {
        /// Peer
        peer: PeerAddress,
    },
    /// Request to send on a notification link
    Notify {
        /// Link
        conn: ConnId,
        /// Request
        request: ClientRequest,
    },
}

/// Destinations of engine outputs
#[derive(Debug)]
pub struct Sinks {
    /// Replies and link commands
    pub transport: mpsc::Sender<TransportOutput>,
    /// Storage requests
    pub storage: mpsc::Sender<StorageRequest>,
    /// Application events
    pub events: mpsc::Sender<AppEvent>,
}

/// Cloneable sender of engine inputs
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::Sender<Input>,
}

impl ServerHandle {
    /// Deliver a transport request
    ///
    /// # Errors
    ///
    /// Returns `ServerClosed` once the engine task has stopped.
    pub async fn transport(&self, event: TransportEvent) -> Result<(), ServerClosed> {
        self.send(Input::Transport(event)).await
    }

    /// Deliver a storage completion
    ///
    /// # Errors
    ///
    /// Returns `ServerClosed` once the engine task has stopped.
    pub async fn complete(&self, completion: Completion) -> Result<(), ServerClosed> {
        self.send(Input::Completion(completion)).await
    }

    /// Deliver an application command
    ///
    /// # Errors
    ///
    /// Returns `ServerClosed` once the engine task has stopped.
    pub async fn command(&self, command: AppCommand) -> Result<(), ServerClosed> {
        self.send(Input::App(command)).await
    }

    /// Deliver notification link activity
    ///
    /// # Errors
    ///
    /// Returns `ServerClosed` once the engine task has stopped.
    pub async fn notify(&self, input: NotifyInput) -> Result<(), ServerClosed> {
        self.send(Input::Notify(input)).await
    }

    /// Stop the engine task
    ///
    /// # Errors
    ///
    /// Returns `ServerClosed` if the task already stopped.
    pub async fn shutdown(&self) -> Result<(), ServerClosed> {
        self.send(Input::Shutdown).await
    }

    async fn send(&self, input: Input) -> Result<(), ServerClosed> {
        self.tx.send(input).await.map_err(|_| ServerClosed)
    }
}

/// Run `engine` on its own task
///
/// The task ends on [`ServerHandle::shutdown`] or when every handle is
/// dropped, and returns the engine.
#[must_use]
pub fn spawn(engine: Engine, sinks: Sinks, queue_depth: usize) -> (ServerHandle, JoinHandle<Engine>) {
    let (tx, rx) = mpsc::channel(queue_depth.max(1));
    let handle = ServerHandle { tx: tx.clone() };
    let task = tokio::spawn(run(engine, rx, tx.downgrade(), sinks));
    (handle, task)
}

/// Work produced by the notification clients
#[derive(Debug)]
enum Dispatch {
    Transport(TransportOutput),
    Event(AppEvent),
    Timer {
        after: Duration,
        peer: PeerAddress,
        serial: u64,
    },
}

/// Notification clients, one per peer
#[derive(Debug)]
struct Notifiers {
    config: NotifyConfig,
    clients: HashMap<PeerAddress, NotificationClient>,
}

impl Notifiers {
    fn new(config: NotifyConfig) -> Self {
        Self {
            config,
            clients: HashMap::new(),
        }
    }

    fn register(&mut self, instance: InstanceId, peer: PeerAddress, enabled: bool) -> Vec<Dispatch> {
        if enabled {
            if self.clients.contains_key(&peer) {
                tracing::debug!("notification client for {} already running", peer);
                return Vec::new();
            }
            let client = NotificationClient::new(peer, instance, self.config.clone());
            self.clients.insert(peer, client);
            return vec![Dispatch::Transport(TransportOutput::OpenNotify { peer })];
        }
        let Some(client) = self.clients.get_mut(&peer) else {
            return Vec::new();
        };
        if client.conn().is_none() {
            // Link never came up
            self.clients.remove(&peer);
            return Vec::new();
        }
        self.apply(peer, |client, out| client.disconnect(out))
    }

    fn input(&mut self, input: NotifyInput) -> Vec<Dispatch> {
        match input {
            NotifyInput::LinkOpened { peer, conn } => {
                if !self.clients.contains_key(&peer) {
                    tracing::warn!("notification link to {} no longer wanted", peer);
                    return vec![Dispatch::Transport(TransportOutput::Command(
                        TransportCommand::Disconnect { conn },
                    ))];
                }
                self.apply(peer, |client, out| {
                    if let Err(e) = client.connect(conn, out) {
                        tracing::warn!("notification client {}: {}", client.peer(), e);
                    }
                })
            }
            NotifyInput::LinkFailed { peer } => match self.clients.remove(&peer) {
                Some(client) => {
                    tracing::warn!("could not open notification link to {}", peer);
                    vec![Dispatch::Event(AppEvent::Notification {
                        instance: client.instance(),
                        peer,
                        event: NotifyEvent::Failed(NotifyError::NotConnected),
                    })]
                }
                None => Vec::new(),
            },
            NotifyInput::Response {
                peer,
                code,
                headers,
                max_packet_len,
            } => self.apply(peer, |client, out| {
                client.on_response(code, &headers, max_packet_len, out);
            }),
            NotifyInput::LinkClosed { peer } => {
                self.apply(peer, |client, out| client.on_link_closed(out))
            }
            NotifyInput::Report { peer, report } => self.apply(peer, |client, out| {
                if let Err(e) = client.send_event(report, out) {
                    tracing::warn!("event report for {} not sent: {}", client.peer(), e);
                }
            }),
        }
    }

    fn timeout(&mut self, peer: PeerAddress, serial: u64) -> Vec<Dispatch> {
        self.apply(peer, |client, out| client.on_timeout(serial, out))
    }

    /// Run `f` on the client for `peer` and translate what it asks for
    fn apply<F>(&mut self, peer: PeerAddress, f: F) -> Vec<Dispatch>
    where
        F: FnOnce(&mut NotificationClient, &mut Vec<ClientOutput>),
    {
        let Some(client) = self.clients.get_mut(&peer) else {
            tracing::debug!("no notification client for {}", peer);
            return Vec::new();
        };
        let before = client.conn();
        let mut out = Vec::new();
        f(client, &mut out);
        let conn = client.conn().or(before);
        let instance = client.instance();

        let mut work = Vec::with_capacity(out.len());
        let mut finished = false;
        for output in out {
            match output {
                ClientOutput::Send(request) => {
                    if let Some(conn) = conn {
                        work.push(Dispatch::Transport(TransportOutput::Notify { conn, request }));
                    }
                }
                ClientOutput::DropLink => {
                    if let Some(conn) = conn {
                        work.push(Dispatch::Transport(TransportOutput::Command(
                            TransportCommand::Disconnect { conn },
                        )));
                    }
                }
                ClientOutput::ArmTimer { after, serial } => {
                    work.push(Dispatch::Timer { after, peer, serial });
                }
                ClientOutput::Event(event) => {
                    finished |= matches!(event, NotifyEvent::Disconnected | NotifyEvent::Failed(_));
                    work.push(Dispatch::Event(AppEvent::Notification {
                        instance,
                        peer,
                        event,
                    }));
                }
            }
        }
        if finished {
            self.clients.remove(&peer);
        }
        work
    }
}

async fn run(
    mut engine: Engine,
    mut rx: mpsc::Receiver<Input>,
    timers: mpsc::WeakSender<Input>,
    sinks: Sinks,
) -> Engine {
    tracing::info!("OBEX engine task started");
    let mut notifiers = Notifiers::new(engine.config().notify.clone());

    // Outputs queued before the task started (e.g. Enabled events)
    route(engine.drain(), &sinks, &timers, &mut notifiers).await;

    while let Some(input) = rx.recv().await {
        match input {
            Input::Transport(event) => engine.handle_transport(event),
            Input::Completion(completion) => engine.handle_completion(completion),
            Input::App(command) => {
                if let Err(e) = engine.handle_app(command) {
                    tracing::warn!("Application command failed: {}", e);
                }
            }
            Input::Timer(event) => engine.handle_timer(event),
            Input::Notify(input) => {
                let work = notifiers.input(input);
                dispatch(work, &sinks, &timers).await;
                continue;
            }
            Input::NotifyTimeout { peer, serial } => {
                let work = notifiers.timeout(peer, serial);
                dispatch(work, &sinks, &timers).await;
                continue;
            }
            Input::Shutdown => break,
        }
        route(engine.drain(), &sinks, &timers, &mut notifiers).await;
    }

    tracing::info!("OBEX engine task stopped");
    engine
}

async fn route(
    outputs: Vec<Output>,
    sinks: &Sinks,
    timers: &mpsc::WeakSender<Input>,
    notifiers: &mut Notifiers,
) {
    for output in outputs {
        let delivered = match output {
            Output::Reply(reply) => sinks.transport.send(TransportOutput::Reply(reply)).await.is_ok(),
            Output::Transport(command) => sinks
                .transport
                .send(TransportOutput::Command(command))
                .await
                .is_ok(),
            Output::Storage(request) => sinks.storage.send(request).await.is_ok(),
            Output::App(event) => {
                let work = match &event {
                    AppEvent::NotificationRegistration {
                        instance,
                        peer,
                        enabled,
                        ..
                    } => notifiers.register(*instance, *peer, *enabled),
                    _ => Vec::new(),
                };
                let delivered = sinks.events.send(event).await.is_ok();
                dispatch(work, sinks, timers).await;
                delivered
            }
            Output::Timer(timer) => {
                if let Some(tx) = timers.upgrade() {
                    tokio::spawn(async move {
                        tokio::time::sleep(timer.after).await;
                        let _ = tx.send(Input::Timer(timer.event)).await;
                    });
                }
                true
            }
        };
        if !delivered {
            tracing::warn!("Output sink closed, dropping output");
        }
    }
}

async fn dispatch(work: Vec<Dispatch>, sinks: &Sinks, timers: &mpsc::WeakSender<Input>) {
    for item in work {
        let delivered = match item {
            Dispatch::Transport(output) => sinks.transport.send(output).await.is_ok(),
            Dispatch::Event(event) => sinks.events.send(event).await.is_ok(),
            Dispatch::Timer { after, peer, serial } => {
                if let Some(tx) = timers.upgrade() {
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = tx.send(Input::NotifyTimeout { peer, serial }).await;
                    });
                }
                true
            }
        };
        if !delivered {
            tracing::warn!("Output sink closed, dropping notification output");
        }
    }
}
