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

//! Stop-the-world handshake.
//!
//! ```text
//! Running -> SuspendRequested -> Suspended -> ResumeRequested -> Running
//! ```
//!
//! The prologue runs before suspension is requested and the epilogue runs
//! before any mutator is released. The generation counter is bumped before
//! release, and blocked mutators are woken after it. Threads leave the
//! world only while it is `Running`, under the state lock.

mod monitor;

pub use monitor::{GenerationCounter, GenerationSnapshot, Monitor};

use crate::error::ProtocolViolation;
use crate::upcalls::ThreadControl;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorldState {
    Running,
    SuspendRequested,
    Suspended,
    ResumeRequested,
}

impl WorldState {
    fn successor(self) -> WorldState {
        match self {
            WorldState::Running => WorldState::SuspendRequested,
            WorldState::SuspendRequested => WorldState::Suspended,
            WorldState::Suspended => WorldState::ResumeRequested,
            WorldState::ResumeRequested => WorldState::Running,
        }
    }
}

#[derive(Debug)]
pub struct Coordinator {
    state: Monitor<WorldState>,
    generation: GenerationCounter,
}

impl Default for Coordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl Coordinator {
    pub const fn new() -> Self {
        Self {
            state: Monitor::new(WorldState::Running),
            generation: GenerationCounter::new(),
        }
    }

    pub fn state(&self) -> WorldState {
        *self.state.lock()
    }

    pub fn is_world_stopped(&self) -> bool {
        self.state() != WorldState::Running
    }

    pub fn generation(&self) -> &GenerationCounter {
        &self.generation
    }

    fn advance(&self, to: WorldState) -> Result<(), ProtocolViolation> {
        let from = self.state.update(|state| {
            let from = *state;
            if from.successor() == to {
                *state = to;
            }
            from
        });
        if from.successor() != to {
            return Err(ProtocolViolation::IllegalTransition { from, to });
        }
        tracing::debug!(target: "gcbridge", ?from, ?to, "world state");
        Ok(())
    }

    /// Run `prologue`, then park every mutator.
    pub fn stop_the_world(
        &self,
        threads: &dyn ThreadControl,
        prologue: impl FnOnce(),
    ) -> Result<(), ProtocolViolation> {
        self.advance(WorldState::SuspendRequested)?;
        prologue();
        threads.suspend_all();
        self.advance(WorldState::Suspended)
    }

    /// Run `epilogue`, bump the generation, release the mutators and wake
    /// those blocked waiting for this cycle. Returns the new generation.
    pub fn start_the_world(
        &self,
        threads: &dyn ThreadControl,
        epilogue: impl FnOnce(),
    ) -> Result<u64, ProtocolViolation> {
        self.advance(WorldState::ResumeRequested)?;
        epilogue();
        let generation = self.generation.bump();
        threads.resume_all();
        self.advance(WorldState::Running)?;
        self.generation.notify_waiters();
        tracing::debug!(target: "gcbridge", generation, "mutators resumed");
        Ok(generation)
    }

    /// Run `depart` while the world is running, holding the state lock so
    /// no stop can begin until it returns. A thread that arrives mid-cycle
    /// waits in its safe region for the world to restart first.
    pub fn leave_world<R>(&self, threads: &dyn ThreadControl, depart: impl FnOnce() -> R) -> R {
        {
            let state = self.state.lock();
            if *state == WorldState::Running {
                return depart();
            }
        }
        threads.enter_safe_region();
        let result = {
            let state = self.state.wait_until(|s| *s == WorldState::Running);
            let result = depart();
            drop(state);
            result
        };
        threads.leave_safe_region();
        result
    }

    /// Park the calling mutator until a cycle that started after this call
    /// completes. `request` triggers the collection; it runs after the
    /// generation snapshot and before the thread enters its safe region.
    pub fn block_for_gc(&self, threads: &dyn ThreadControl, request: impl FnOnce()) -> u64 {
        let snapshot = self.generation.snapshot();
        request();
        threads.enter_safe_region();
        let generation = self.generation.wait_past(snapshot);
        threads.leave_safe_region();
        generation
    }
}
