//! # OBEX Files
//!
//! Filesystem storage provider for the obexd engine.
//!
//! This crate provides:
//! - File open/read/write/seek with a provider-side handle table
//! - Folder enumeration from per-session directory snapshots
//! - A message store (one object file plus JSON metadata per message)
//! - Suspend record persistence keyed by peer address
//! - A tokio worker that answers engine callouts

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod messages;
pub mod store;
pub mod worker;

pub use messages::{MessageMeta, store_message};
pub use store::FsStore;
pub use worker::{serve, spawn};
