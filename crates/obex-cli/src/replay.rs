//! Scripted client sessions against a local store.
//!
//! A script is a JSON document listing client requests. The replayer plays
//! the client side: it sends each request to a spawned engine, follows GET
//! and PUT continuations, answers authentication with the configured
//! password and access requests with a fixed policy.

use crate::config::Config;
use crate::progress::{TransferProgress, format_bytes};
use console::style;
use obex_core::auth::AuthDigest;
use obex_core::packet::{
    ActionId, ActionRequest, AppParams, ConnectRequest, SessionControl, SessionOpcode,
    SetPathRequest, body_capacity,
};
use obex_core::server::{self, NotifyInput, ServerHandle, Sinks, TransportOutput};
use obex_core::{
    AppCommand, AppEvent, ConnId, Engine, Headers, InstanceId, PeerAddress, Reply, Request,
    ResponseCode, TransportCommand, TransportEvent,
};
use obex_files::FsStore;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Default peer address used when the script names none
const DEFAULT_PEER: PeerAddress = PeerAddress([0x00, 0x1A, 0x7D, 0xDA, 0x71, 0x13]);

/// Transport connection id used by the replayed client
const REPLAY_CONN: ConnId = ConnId(1);

/// A replay script
#[derive(Debug, Clone, Deserialize)]
pub struct Script {
    /// Client address, `AA:BB:CC:DD:EE:FF`
    #[serde(default)]
    pub peer: Option<String>,
    /// Service instance to connect to
    #[serde(default)]
    pub instance: u8,
    /// Requests in order
    pub steps: Vec<Step>,
}

fn default_packet_len() -> u16 {
    0x2000
}

/// One client request
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Step {
    /// Connect to the instance's target
    Connect {
        /// Client receive packet length
        #[serde(default = "default_packet_len")]
        max_packet_len: u16,
        /// Password answering an authentication challenge
        #[serde(default)]
        password: Option<String>,
    },
    /// Download an object or listing
    Get {
        /// Object name
        #[serde(default)]
        name: Option<String>,
        /// Object type
        #[serde(default, rename = "type")]
        object_type: Option<String>,
        /// MAP application parameters
        #[serde(default)]
        params: Option<AppParams>,
        /// Write the object here instead of printing it
        #[serde(default)]
        save_as: Option<PathBuf>,
    },
    /// Upload an object
    Put {
        /// Object name
        name: String,
        /// Object type
        #[serde(default, rename = "type")]
        object_type: Option<String>,
        /// Inline body
        #[serde(default)]
        text: Option<String>,
        /// Body read from a local file
        #[serde(default)]
        file: Option<PathBuf>,
        /// MAP application parameters
        #[serde(default)]
        params: Option<AppParams>,
    },
    /// Delete an object
    Delete {
        /// Object name
        name: String,
    },
    /// Change folder
    SetPath {
        /// Child folder; none or empty goes to the root
        #[serde(default)]
        name: Option<String>,
        /// Go to the parent first
        #[serde(default)]
        up: bool,
        /// Create the folder if missing
        #[serde(default)]
        create: bool,
    },
    /// Copy an object
    Copy {
        /// Source name
        name: String,
        /// Destination name
        dest: String,
    },
    /// Move or rename an object
    Move {
        /// Source name
        name: String,
        /// Destination name
        dest: String,
    },
    /// Set permissions
    Chmod {
        /// Object name
        name: String,
        /// OBEX permission bits
        permissions: u32,
    },
    /// Abort the current operation
    Abort,
    /// Disconnect
    Disconnect,
    /// Suspend the reliable session
    Suspend,
    /// Resume a suspended session
    Resume,
}

impl Step {
    fn label(&self) -> String {
        match self {
            Self::Connect { .. } => "CONNECT".to_string(),
            Self::Get {
                name, object_type, ..
            } => format!(
                "GET {}",
                name.as_deref()
                    .or(object_type.as_deref())
                    .unwrap_or_default()
            ),
            Self::Put { name, .. } => format!("PUT {name}"),
            Self::Delete { name } => format!("DELETE {name}"),
            Self::SetPath { name, up, .. } => format!(
                "SETPATH {}{}",
                if *up { "../" } else { "" },
                name.as_deref().unwrap_or_default()
            ),
            Self::Copy { name, dest } => format!("COPY {name} -> {dest}"),
            Self::Move { name, dest } => format!("MOVE {name} -> {dest}"),
            Self::Chmod { name, permissions } => format!("CHMOD {name} {permissions:#08x}"),
            Self::Abort => "ABORT".to_string(),
            Self::Disconnect => "DISCONNECT".to_string(),
            Self::Suspend => "SUSPEND".to_string(),
            Self::Resume => "RESUME".to_string(),
        }
    }
}

/// Result of one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    /// Step label
    pub step: String,
    /// Final response code
    pub code: ResponseCode,
    /// Body bytes moved
    pub bytes: usize,
}

/// Answer given to every access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Allow everything
    Allow,
    /// Deny everything
    Deny,
}

/// Client side of a replayed session
pub struct Replayer {
    server: ServerHandle,
    engine_task: JoinHandle<Engine>,
    storage_task: JoinHandle<FsStore>,
    transport: mpsc::Receiver<TransportOutput>,
    events: mpsc::Receiver<AppEvent>,
    policy: Policy,
    password: Option<Vec<u8>>,
    instance: InstanceId,
    peer: PeerAddress,
    target: Vec<u8>,
    ssn: u8,
    packet_len: u16,
    connection_id: Option<u32>,
    wait: Duration,
}

impl Replayer {
    /// Start an engine and storage worker for `config` and connect a client to `instance`
    ///
    /// # Errors
    ///
    /// Returns an error if the instance is not configured or cannot be enabled.
    pub fn start(
        config: &Config,
        root: Option<&Path>,
        script: &Script,
        policy: Policy,
    ) -> anyhow::Result<Self> {
        let instance = InstanceId(script.instance);
        let instances = config.instance_configs(root);
        let target = instances
            .iter()
            .find(|i| i.id == instance)
            .map(|i| i.profile.target().to_vec())
            .ok_or_else(|| anyhow::anyhow!("Instance {} is not configured", script.instance))?;

        let peer = match &script.peer {
            Some(peer) => peer.parse().map_err(|e: String| anyhow::anyhow!(e))?,
            None => DEFAULT_PEER,
        };

        let mut engine = Engine::new(config.engine_config());
        let mut store = FsStore::new(&config.storage.state_dir);
        for instance in instances {
            std::fs::create_dir_all(&instance.root)?;
            store = store.with_instance(instance.id, &instance.root);
            engine.enable_service(instance)?;
        }

        let depth = config.engine.queue_depth;
        let (transport_tx, transport) = mpsc::channel(depth);
        let (storage_tx, storage_rx) = mpsc::channel(depth);
        let (events_tx, events) = mpsc::channel(depth);
        let (server, engine_task) = server::spawn(
            engine,
            Sinks {
                transport: transport_tx,
                storage: storage_tx,
                events: events_tx,
            },
            depth,
        );
        let storage_task = obex_files::spawn(store, storage_rx, server.clone());

        Ok(Self {
            server,
            engine_task,
            storage_task,
            transport,
            events,
            policy,
            password: config.auth.password.clone().map(String::into_bytes),
            instance,
            peer,
            target,
            ssn: 0,
            packet_len: default_packet_len(),
            connection_id: None,
            wait: Duration::from_secs(config.engine.access_timeout_secs.max(5) + 5),
        })
    }

    /// Play every step, stopping at the first link loss
    ///
    /// # Errors
    ///
    /// Returns an error if the engine stops answering.
    pub async fn run(&mut self, steps: &[Step]) -> anyhow::Result<Vec<Outcome>> {
        let mut outcomes = Vec::with_capacity(steps.len());
        for step in steps {
            let label = step.label();
            let (code, bytes) = self.step(step).await?;
            let shown = if code.is_success() {
                style(format!("{code:?}")).green()
            } else {
                style(format!("{code:?}")).red()
            };
            println!("{label:<40} {shown} ({})", format_bytes(bytes as u64));
            outcomes.push(Outcome {
                step: label,
                code,
                bytes,
            });
        }
        Ok(outcomes)
    }

    /// Stop the engine and the storage worker
    ///
    /// # Errors
    ///
    /// Returns an error if either task panicked.
    pub async fn shutdown(self) -> anyhow::Result<()> {
        let _ = self.server.shutdown().await;
        drop(self.server);
        let engine = self.engine_task.await?;
        tracing::debug!("engine stopped with {} instances", engine.instances().len());
        drop(engine);
        let store = self.storage_task.await?;
        if store.open_handles() > 0 {
            tracing::warn!("{} handles left open", store.open_handles());
        }
        Ok(())
    }

    async fn step(&mut self, step: &Step) -> anyhow::Result<(ResponseCode, usize)> {
        match step {
            Step::Connect {
                max_packet_len,
                password,
            } => self.connect(*max_packet_len, password.as_deref()).await,
            Step::Get {
                name,
                object_type,
                params,
                save_as,
            } => {
                let headers = Headers {
                    name: name.clone(),
                    object_type: object_type.clone(),
                    app_params: params.clone(),
                    ..Headers::default()
                };
                self.get(headers, save_as.as_deref()).await
            }
            Step::Put {
                name,
                object_type,
                text,
                file,
                params,
            } => {
                let data = match (text, file) {
                    (Some(text), _) => text.clone().into_bytes(),
                    (None, Some(file)) => tokio::fs::read(file).await?,
                    (None, None) => Vec::new(),
                };
                let headers = Headers {
                    app_params: params.clone(),
                    ..Headers::named(name.clone(), object_type.as_deref())
                };
                self.put(headers, &data).await
            }
            Step::Delete { name } => {
                let headers = self.with_connection(Headers::named(name.clone(), None));
                let reply = self
                    .exchange(Request::Put {
                        headers,
                        final_bit: true,
                    })
                    .await?;
                Ok((reply.code, 0))
            }
            Step::SetPath { name, up, create } => {
                let reply = self
                    .exchange(Request::SetPath(SetPathRequest {
                        name: name.clone(),
                        backup: *up,
                        create: *create,
                    }))
                    .await?;
                Ok((reply.code, 0))
            }
            Step::Copy { name, dest } | Step::Move { name, dest } => {
                let action = if matches!(step, Step::Copy { .. }) {
                    ActionId::Copy
                } else {
                    ActionId::Move
                };
                self.action(action, name, Some(dest.clone()), None).await
            }
            Step::Chmod { name, permissions } => {
                self.action(ActionId::SetPermissions, name, None, Some(*permissions))
                    .await
            }
            Step::Abort => Ok((self.exchange(Request::Abort).await?.code, 0)),
            Step::Disconnect => {
                let reply = self.exchange(Request::Disconnect).await?;
                self.connection_id = None;
                Ok((reply.code, 0))
            }
            Step::Suspend => self.session(SessionOpcode::Suspend).await,
            Step::Resume => self.session(SessionOpcode::Resume).await,
        }
    }

    async fn connect(
        &mut self,
        max_packet_len: u16,
        password: Option<&str>,
    ) -> anyhow::Result<(ResponseCode, usize)> {
        let mut request = ConnectRequest {
            max_packet_len,
            headers: Headers {
                target: Some(self.target.clone()),
                ..Headers::default()
            },
            auth: None,
        };
        let mut reply = self.exchange(Request::Connect(request.clone())).await?;
        if reply.code == ResponseCode::Unauthorized {
            if let Some(challenge) = reply.headers.auth_challenge.clone() {
                let password = password
                    .ok_or_else(|| anyhow::anyhow!("Server requires authentication; step has no password"))?;
                request.auth = Some(AuthDigest::answer(&challenge, password.as_bytes(), None));
                reply = self.exchange(Request::Connect(request)).await?;
            }
        }
        if reply.code == ResponseCode::Ok {
            self.packet_len = reply.max_packet_len.unwrap_or(max_packet_len);
            self.connection_id = reply.headers.connection_id;
        }
        Ok((reply.code, 0))
    }

    async fn get(
        &mut self,
        headers: Headers,
        save_as: Option<&Path>,
    ) -> anyhow::Result<(ResponseCode, usize)> {
        let label = headers
            .name
            .clone()
            .or_else(|| headers.object_type.clone())
            .unwrap_or_default();
        let mut headers = self.with_connection(headers);
        let mut body = Vec::new();
        let mut progress: Option<TransferProgress> = None;

        let code = loop {
            let reply = self
                .exchange(Request::Get {
                    headers,
                    final_bit: true,
                })
                .await?;
            let bar = progress
                .get_or_insert_with(|| TransferProgress::new(reply.headers.length, &label));
            bar.advance(reply.body().len());
            body.extend_from_slice(reply.body());
            if reply.code != ResponseCode::Continue {
                bar.finish_with_message(format!("{label}: {:?}", reply.code));
                if let Some(params) = &reply.headers.app_params {
                    if let Some(size) = params.listing_size {
                        println!("listing size: {size}");
                    }
                }
                break reply.code;
            }
            headers = self.with_connection(Headers::default());
        };

        if code == ResponseCode::Ok {
            match save_as {
                Some(path) => tokio::fs::write(path, &body).await?,
                None if !body.is_empty() => println!("{}", String::from_utf8_lossy(&body)),
                None => {}
            }
        }
        Ok((code, body.len()))
    }

    async fn put(&mut self, headers: Headers, data: &[u8]) -> anyhow::Result<(ResponseCode, usize)> {
        let capacity = body_capacity(self.packet_len)?;
        let label = headers.name.clone().unwrap_or_default();
        let progress = TransferProgress::new(Some(data.len() as u64), &label);
        let mut first = Some(Headers {
            length: Some(data.len() as u64),
            ..headers
        });

        let mut chunks: Vec<&[u8]> = data.chunks(capacity).collect();
        if chunks.is_empty() {
            chunks.push(&[]);
        }
        let last = chunks.len() - 1;
        let mut sent = 0;
        for (i, chunk) in chunks.into_iter().enumerate() {
            let is_last = i == last;
            let headers = self.with_connection(Headers {
                body: Some(chunk.to_vec()),
                end_of_body: is_last,
                ..first.take().unwrap_or_default()
            });
            let reply = self
                .exchange(Request::Put {
                    headers,
                    final_bit: is_last,
                })
                .await?;
            sent += chunk.len();
            progress.advance(chunk.len());
            let expected = if is_last {
                ResponseCode::Ok
            } else {
                ResponseCode::Continue
            };
            if reply.code != expected || is_last {
                progress.finish_with_message(format!("{label}: {:?}", reply.code));
                if let Some(handle) = reply.headers.name.as_deref().filter(|_| is_last) {
                    println!("new handle: {handle}");
                }
                return Ok((reply.code, sent));
            }
        }
        Ok((ResponseCode::InternalError, sent))
    }

    async fn action(
        &mut self,
        action: ActionId,
        name: &str,
        dest_name: Option<String>,
        permissions: Option<u32>,
    ) -> anyhow::Result<(ResponseCode, usize)> {
        let reply = self
            .exchange(Request::Action(ActionRequest {
                action,
                name: name.to_string(),
                dest_name,
                permissions,
            }))
            .await?;
        Ok((reply.code, 0))
    }

    async fn session(&mut self, opcode: SessionOpcode) -> anyhow::Result<(ResponseCode, usize)> {
        let next_ssn = (opcode == SessionOpcode::Resume).then_some(self.ssn);
        let reply = self
            .exchange(Request::SessionControl(SessionControl {
                opcode,
                next_ssn,
                timeout_secs: None,
            }))
            .await?;
        Ok((reply.code, 0))
    }

    fn with_connection(&self, headers: Headers) -> Headers {
        Headers {
            connection_id: headers.connection_id.or(self.connection_id),
            ..headers
        }
    }

    /// Send one request and wait for its reply, serving app events meanwhile
    async fn exchange(&mut self, request: Request) -> anyhow::Result<Reply> {
        tracing::debug!("-> {}", request.name());
        self.server
            .transport(TransportEvent {
                instance: self.instance,
                conn: REPLAY_CONN,
                peer: self.peer,
                ssn: self.ssn,
                request,
            })
            .await?;
        self.ssn = self.ssn.wrapping_add(1);

        let deadline = tokio::time::sleep(self.wait);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                Some(output) = self.transport.recv() => match output {
                    TransportOutput::Reply(reply) => {
                        tracing::debug!("<- {:?} {:?}", reply.kind, reply.code);
                        return Ok(reply);
                    }
                    TransportOutput::Command(TransportCommand::Disconnect { conn }) => {
                        anyhow::bail!("Server dropped connection {}", conn.0);
                    }
                    TransportOutput::OpenNotify { peer } => {
                        tracing::info!("Peer {} wants notifications, replay has no link for them", peer);
                        self.server.notify(NotifyInput::LinkFailed { peer }).await?;
                    }
                    TransportOutput::Notify { conn, request } => {
                        tracing::debug!("Notification request on {} ignored: {:?}", conn.0, request);
                    }
                },
                Some(event) = self.events.recv() => self.on_event(event).await?,
                () = &mut deadline => anyhow::bail!("No reply within {:?}", self.wait),
            }
        }
    }

    async fn on_event(&mut self, event: AppEvent) -> anyhow::Result<()> {
        match event {
            AppEvent::AccessRequested(request) => {
                let allow = self.policy == Policy::Allow;
                let object = request
                    .path
                    .as_ref()
                    .map(|p| p.display().to_string())
                    .or_else(|| request.handle.as_ref().map(ToString::to_string))
                    .unwrap_or_default();
                tracing::info!(
                    "{} {:?} {} -> {}",
                    request.session,
                    request.operation,
                    object,
                    if allow { "allow" } else { "deny" }
                );
                self.server
                    .command(AppCommand::AccessResponse {
                        session: request.session,
                        operation: request.operation,
                        allow,
                    })
                    .await?;
            }
            AppEvent::AuthRequested { session, .. } => {
                let password = self.password.clone().unwrap_or_default();
                self.server
                    .command(AppCommand::AuthResponse { session, password })
                    .await?;
            }
            AppEvent::Progress {
                session,
                operation,
                bytes,
                total,
            } => {
                tracing::trace!("{} {:?} +{} of {:?}", session, operation, bytes, total);
            }
            AppEvent::OperationComplete {
                session,
                operation,
                code,
                object,
            } => {
                tracing::info!(
                    "{} {:?} {} finished {:?}",
                    session,
                    operation,
                    object.unwrap_or_default(),
                    code
                );
            }
            other => tracing::debug!("{:?}", other),
        }
        Ok(())
    }
}

/// Load a script file
///
/// # Errors
///
/// Returns an error if the file cannot be read or is not a valid script.
pub fn load_script(path: &Path) -> anyhow::Result<Script> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}
