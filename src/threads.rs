// Copyright (C) 2025 Ryan Daum <ryan.daum@gmail.com> This program is free
// software: you can redistribute it and/or modify it under the terms of the GNU
// General Public License as published by the Free Software Foundation, version
// 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along with
// this program. If not, see <https://www.gnu.org/licenses/>.
//

//! Mutator and collector thread lifecycle.
//!
//! Every thread that touches the heap registers here and receives a
//! [`MutatorContext`] holding the engine's per-thread allocator state.
//! Collector threads spawned on the engine's behalf register as collectors
//! and may never act as mutators.

use crate::error::{BindingError, ProtocolViolation};
use std::cell::UnsafeCell;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::thread::ThreadId;

type FastMap<K, V> = papaya::HashMap<K, V, ahash::RandomState>;

/// Stable identity of a registered mutator. Ids grow in registration order
/// and are never reused, which gives thread scans a stable order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MutatorId(u64);

impl MutatorId {
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    pub const fn from_u64(raw: u64) -> Self {
        Self(raw)
    }
}

/// Kind tag on an engine thread-spawn request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum GcThreadKind {
    Controller = 0,
    Worker = 1,
}

impl TryFrom<i32> for GcThreadKind {
    type Error = BindingError;

    fn try_from(kind: i32) -> Result<Self, Self::Error> {
        match kind {
            0 => Ok(GcThreadKind::Controller),
            1 => Ok(GcThreadKind::Worker),
            other => Err(BindingError::UnknownThreadKind(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    Mutator(MutatorId),
    Collector(GcThreadKind),
}

/// Per-thread state for one mutator.
///
/// The engine state is only touched by the owning thread, or by a collector
/// while that thread is parked at a safe point.
pub struct MutatorContext<M> {
    id: MutatorId,
    thread: ThreadId,
    name: Option<String>,
    state: UnsafeCell<Option<M>>,
}

// SAFETY: `state` is accessed by the owning thread while running and by
// collector threads only while the owner is suspended. The handshake
// guarantees those windows never overlap.
unsafe impl<M: Send> Sync for MutatorContext<M> {}

impl<M> MutatorContext<M> {
    pub fn id(&self) -> MutatorId {
        self.id
    }

    pub fn thread(&self) -> ThreadId {
        self.thread
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The engine state, or `None` once the mutator has been deregistered.
    ///
    /// # Safety
    ///
    /// Caller must be the owning thread, or a collector while the owner is
    /// suspended. No other reference to the state may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn state_mut(&self) -> Option<&mut M> {
        unsafe { (*self.state.get()).as_mut() }
    }

    /// # Safety
    ///
    /// Same contract as [`MutatorContext::state_mut`].
    unsafe fn take_state(&self) -> Option<M> {
        unsafe { (*self.state.get()).take() }
    }
}

impl<M> std::fmt::Debug for MutatorContext<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutatorContext")
            .field("id", &self.id)
            .field("thread", &self.thread)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// A collector thread spawned at the engine's request.
#[derive(Debug, Clone)]
pub struct SpawnedThread {
    pub kind: GcThreadKind,
    pub name: String,
}

/// Process-wide map from OS thread to its role and context.
pub struct ThreadRegistry<M> {
    next_id: AtomicU64,
    next_spawn: AtomicUsize,
    by_thread: FastMap<ThreadId, Arc<MutatorContext<M>>>,
    by_id: FastMap<MutatorId, Arc<MutatorContext<M>>>,
    collectors: FastMap<ThreadId, GcThreadKind>,
    spawned: boxcar::Vec<SpawnedThread>,
}

impl<M: Send + 'static> Default for ThreadRegistry<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Send + 'static> ThreadRegistry<M> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            next_spawn: AtomicUsize::new(0),
            by_thread: FastMap::with_hasher(ahash::RandomState::new()),
            by_id: FastMap::with_hasher(ahash::RandomState::new()),
            collectors: FastMap::with_hasher(ahash::RandomState::new()),
            spawned: boxcar::Vec::new(),
        }
    }

    /// Register the calling thread as a mutator. `make_state` receives the
    /// new id and builds the engine's allocator state.
    pub fn register_current(
        &self,
        name: Option<String>,
        make_state: impl FnOnce(MutatorId) -> M,
    ) -> Result<Arc<MutatorContext<M>>, BindingError> {
        let thread = std::thread::current().id();
        if self.by_thread.pin().contains_key(&thread) || self.collectors.pin().contains_key(&thread)
        {
            return Err(BindingError::AlreadyRegistered(thread));
        }
        let id = MutatorId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let context = Arc::new(MutatorContext {
            id,
            thread,
            name,
            state: UnsafeCell::new(Some(make_state(id))),
        });
        self.by_id.pin().insert(id, context.clone());
        self.by_thread.pin().insert(thread, context.clone());
        tracing::debug!(target: "gcbridge", mutator = id.0, ?thread, "mutator registered");
        Ok(context)
    }

    /// Remove the calling thread's mutator. Returns the engine state so the
    /// caller can hand it back to the engine. Callers hold off stops for the
    /// duration, see [`crate::handshake::Coordinator::leave_world`].
    pub fn deregister_current(&self) -> Result<(MutatorId, Option<M>), ProtocolViolation> {
        let thread = std::thread::current().id();
        let context = self
            .by_thread
            .pin()
            .remove(&thread)
            .cloned()
            .ok_or(ProtocolViolation::UnregisteredThread(thread))?;
        let id = context.id;
        self.by_id.pin().remove(&id);
        tracing::debug!(target: "gcbridge", mutator = id.0, ?thread, "mutator deregistered");
        // SAFETY: we are the owning thread, and the world cannot stop while
        // the caller holds the coordinator.
        let state = unsafe { context.take_state() };
        Ok((id, state))
    }

    pub fn register_collector(&self, kind: GcThreadKind) -> Result<(), ProtocolViolation> {
        let thread = std::thread::current().id();
        if self.by_thread.pin().contains_key(&thread) {
            return Err(ProtocolViolation::MutatorAsCollector(thread));
        }
        self.collectors.pin().insert(thread, kind);
        Ok(())
    }

    pub fn deregister_collector(&self) {
        let thread = std::thread::current().id();
        self.collectors.pin().remove(&thread);
    }

    /// Record a spawn request and return its thread name. Names are unique
    /// even when requests race.
    pub fn record_spawn(&self, kind: GcThreadKind) -> String {
        let index = self.next_spawn.fetch_add(1, Ordering::Relaxed);
        let role = match kind {
            GcThreadKind::Controller => "controller",
            GcThreadKind::Worker => "worker",
        };
        let name = format!("gcbridge-{role}-{index}");
        self.spawned.push(SpawnedThread {
            kind,
            name: name.clone(),
        });
        name
    }

    pub fn spawned(&self) -> impl Iterator<Item = &SpawnedThread> {
        self.spawned.iter().map(|(_, t)| t)
    }

    /// Run `f` against the calling thread's context. Lock-free.
    #[inline]
    pub fn with_current<R>(&self, f: impl FnOnce(&MutatorContext<M>) -> R) -> Option<R> {
        let thread = std::thread::current().id();
        let map = self.by_thread.pin();
        map.get(&thread).map(|context| f(context))
    }

    pub fn current(&self) -> Option<Arc<MutatorContext<M>>> {
        let thread = std::thread::current().id();
        self.by_thread.pin().get(&thread).cloned()
    }

    pub fn get(&self, id: MutatorId) -> Option<Arc<MutatorContext<M>>> {
        self.by_id.pin().get(&id).cloned()
    }

    /// Like [`ThreadRegistry::current`] but the calling thread must be a
    /// registered mutator.
    pub fn require_mutator(&self) -> Result<Arc<MutatorContext<M>>, ProtocolViolation> {
        let thread = std::thread::current().id();
        if let Some(context) = self.current() {
            return Ok(context);
        }
        if self.collectors.pin().contains_key(&thread) {
            Err(ProtocolViolation::CollectorAsMutator(thread))
        } else {
            Err(ProtocolViolation::UnregisteredThread(thread))
        }
    }

    /// The calling thread must be a collector thread.
    pub fn require_collector(&self) -> Result<GcThreadKind, ProtocolViolation> {
        let thread = std::thread::current().id();
        if let Some(kind) = self.collectors.pin().get(&thread) {
            return Ok(*kind);
        }
        if self.by_thread.pin().contains_key(&thread) {
            Err(ProtocolViolation::MutatorAsCollector(thread))
        } else {
            Err(ProtocolViolation::UnregisteredThread(thread))
        }
    }

    pub fn role_of(&self, thread: ThreadId) -> Option<ThreadRole> {
        if let Some(context) = self.by_thread.pin().get(&thread) {
            return Some(ThreadRole::Mutator(context.id));
        }
        self.collectors
            .pin()
            .get(&thread)
            .map(|kind| ThreadRole::Collector(*kind))
    }

    pub fn is_mutator(&self, thread: ThreadId) -> bool {
        matches!(self.role_of(thread), Some(ThreadRole::Mutator(_)))
    }

    pub fn mutator_count(&self) -> usize {
        self.by_id.len()
    }

    /// Live mutators in registration order.
    pub fn mutators(&self) -> Vec<Arc<MutatorContext<M>>> {
        let mut all: Vec<_> = self.by_id.pin().values().cloned().collect();
        all.sort_unstable_by_key(|c| c.id);
        all
    }

    pub fn mutator_ids(&self) -> Vec<MutatorId> {
        self.mutators().iter().map(|c| c.id).collect()
    }
}
