//! Service instances and the session arena.
//!
//! Sessions live in a slot arena owned by the engine. A [`SessionHandle`]
//! carries the slot generation, so a handle kept by the application after its
//! session was removed can never reach the slot's next occupant.
//!
//! Lookups that other threads need (peer address to session, "is any session
//! busy") live in [`SharedIndex`], which is safe to read concurrently while
//! the engine mutates sessions.

use crate::config::InstanceConfig;
use crate::packet::PeerAddress;
use crate::session::Session;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Service instance identifier (the MAS instance id for message access)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId(pub u8);

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "instance#{}", self.0)
    }
}

/// Generation-checked reference to a session slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionHandle {
    index: u32,
    generation: u32,
}

impl SessionHandle {
    /// Build a handle from its parts
    #[must_use]
    pub fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Slot index
    #[must_use]
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation
    #[must_use]
    pub fn generation(self) -> u32 {
        self.generation
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}.{}", self.index, self.generation)
    }
}

/// Concurrently readable session index
#[derive(Debug, Default)]
pub struct SharedIndex {
    peers: DashMap<PeerAddress, SessionHandle>,
    busy: AtomicBool,
}

impl SharedIndex {
    /// Create an empty index
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Session connected from `peer`
    #[must_use]
    pub fn lookup(&self, peer: &PeerAddress) -> Option<SessionHandle> {
        self.peers.get(peer).map(|entry| *entry.value())
    }

    /// Record the session connected from `peer`
    pub fn insert(&self, peer: PeerAddress, session: SessionHandle) {
        self.peers.insert(peer, session);
    }

    /// Forget `peer`, but only if it still maps to `session`
    pub fn remove(&self, peer: &PeerAddress, session: SessionHandle) {
        self.peers.remove_if(peer, |_, current| *current == session);
    }

    /// Number of connected peers
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// No connected peers
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Some session has an operation in progress
    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub(crate) fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Release);
    }
}

/// Lifecycle of a service instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    /// Accepting connections
    Enabled,
    /// Disable requested, waiting for sessions to drain
    Disabling,
}

/// A published service and its session pool
#[derive(Debug)]
pub struct ServiceInstance {
    /// Configuration it was enabled with
    pub config: InstanceConfig,
    /// Lifecycle state
    pub state: InstanceState,
    /// Sessions in the pool
    pub sessions: Vec<SessionHandle>,
}

#[derive(Debug)]
struct Slot {
    generation: u32,
    session: Option<Session>,
}

/// Owner of all instances and sessions
#[derive(Debug, Default)]
pub struct Registry {
    instances: BTreeMap<InstanceId, ServiceInstance>,
    slots: Vec<Slot>,
    free: Vec<u32>,
}

impl Registry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a slot and hand back its handle
    ///
    /// The slot stays empty until [`Registry::place`] stores a session.
    pub fn allocate(&mut self) -> SessionHandle {
        if let Some(index) = self.free.pop() {
            let slot = &self.slots[index as usize];
            return SessionHandle::new(index, slot.generation);
        }
        let index = u32::try_from(self.slots.len()).unwrap_or(u32::MAX);
        self.slots.push(Slot {
            generation: 0,
            session: None,
        });
        SessionHandle::new(index, 0)
    }

    /// Store a session in the slot reserved for `handle`
    pub fn place(&mut self, handle: SessionHandle, session: Session) {
        if let Some(slot) = self.slots.get_mut(handle.index as usize) {
            if slot.generation == handle.generation {
                slot.session = Some(session);
            }
        }
    }

    /// Remove a session and retire its handle
    pub fn remove(&mut self, handle: SessionHandle) -> Option<Session> {
        let slot = self.slots.get_mut(handle.index as usize)?;
        if slot.generation != handle.generation {
            return None;
        }
        let session = slot.session.take();
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(handle.index);
        session
    }

    /// Session behind `handle`, if the handle is current
    #[must_use]
    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.slots
            .get(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_ref())
    }

    /// Mutable session behind `handle`, if the handle is current
    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
            .and_then(|slot| slot.session.as_mut())
    }

    /// Iterate over live sessions
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.slots.iter().filter_map(|slot| slot.session.as_ref())
    }

    /// Register an instance
    pub fn add_instance(&mut self, instance: ServiceInstance) {
        self.instances.insert(instance.config.id, instance);
    }

    /// Drop an instance record
    pub fn remove_instance(&mut self, id: InstanceId) -> Option<ServiceInstance> {
        self.instances.remove(&id)
    }

    /// Instance by id
    #[must_use]
    pub fn instance(&self, id: InstanceId) -> Option<&ServiceInstance> {
        self.instances.get(&id)
    }

    /// Mutable instance by id
    pub fn instance_mut(&mut self, id: InstanceId) -> Option<&mut ServiceInstance> {
        self.instances.get_mut(&id)
    }

    /// Ids of all instances
    #[must_use]
    pub fn instance_ids(&self) -> Vec<InstanceId> {
        self.instances.keys().copied().collect()
    }

    /// A pooled session of `id` that can take a new connection
    #[must_use]
    pub fn find_listening(&self, id: InstanceId) -> Option<SessionHandle> {
        let instance = self.instances.get(&id)?;
        instance
            .sessions
            .iter()
            .copied()
            .find(|handle| self.get(*handle).is_some_and(Session::is_listening))
    }
}
