//! Test fixtures

mod harness;
mod mem_store;

pub use harness::{AccessPolicy, Harness, PEER};
pub use mem_store::MemStore;
