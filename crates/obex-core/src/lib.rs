//! # OBEX Core
//!
//! Server session engine for the Bluetooth OBEX File Transfer (FTP) and
//! Message Access (MAP) profiles.
//!
//! This crate provides:
//! - The per-session state machine (connect, authenticate, serve, close)
//! - Multi-packet GET/PUT transfers and folder/message listings
//! - The application access gate with optional timeout
//! - Tagged storage callouts with stale-completion handling
//! - Reliable-session suspend and resume
//! - The MAP notification client
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         Engine                                   │
//! │   (service instances, session pools, connection routing)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Session                                  │
//! │   (state machine, one active operation, one live callout)       │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                         Outbox                                   │
//! │   (replies, storage callouts, app events, timers)               │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The engine performs no I/O. Every input returns immediately and leaves
//! its effects in the outbox; [`server::spawn`] runs an engine on a tokio
//! task and routes those effects over channels.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod access;
pub mod auth;
pub mod callout;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod listing;
pub mod notify;
pub mod packet;
pub mod registry;
pub mod resume;
pub mod server;
pub mod session;
pub mod transfer;

pub use access::AccessRequest;
pub use callout::{
    Callout, CalloutOutput, CalloutResult, CalloutToken, Completion, DirEntry, FileHandle,
    MessageEntry, MessageHandle, StorageError, StorageRequest,
};
pub use config::{EngineConfig, InstanceConfig, ObjectKind, Profile};
pub use engine::{Engine, TransportEvent};
pub use error::{EngineError, ProtocolError, Result};
pub use events::{AppCommand, AppEvent, Output, TimerEvent, TransportCommand};
pub use listing::{ListingRenderer, XmlListing};
pub use notify::{NotificationClient, NotifyEvent};
pub use packet::{ConnId, Headers, PeerAddress, Reply, ReplyKind, Request, ResponseCode};
pub use registry::{InstanceId, SessionHandle, SharedIndex};
pub use resume::SuspendRecord;
pub use session::{Session, SessionState};
pub use transfer::OperationKind;
