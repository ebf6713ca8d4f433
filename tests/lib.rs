//! Shared fixtures for the OBEX integration tests.
//!
//! [`fixtures::Harness`] drives an [`obex_core::Engine`] synchronously
//! against an in-memory store, so a test can step through a session one
//! event at a time and hold any callout or access request open.

pub mod fixtures;
