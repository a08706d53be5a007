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

use parking_lot::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// A value guarded by one lock, with a condition variable for waiting on
/// changes to it.
#[derive(Debug, Default)]
pub struct Monitor<T> {
    value: Mutex<T>,
    changed: Condvar,
}

impl<T> Monitor<T> {
    pub const fn new(value: T) -> Self {
        Self {
            value: Mutex::new(value),
            changed: Condvar::new(),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.value.lock()
    }

    /// Mutate the value and wake every waiter.
    pub fn update<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let result = {
            let mut guard = self.value.lock();
            f(&mut guard)
        };
        self.changed.notify_all();
        result
    }

    pub fn notify_all(&self) {
        // Taking the lock orders this wakeup after any in-progress check.
        drop(self.value.lock());
        self.changed.notify_all();
    }

    /// Block until `ready` holds. Spurious wakeups are absorbed here.
    pub fn wait_until(&self, mut ready: impl FnMut(&T) -> bool) -> MutexGuard<'_, T> {
        let mut guard = self.value.lock();
        while !ready(&guard) {
            self.changed.wait(&mut guard);
        }
        guard
    }

    /// As [`Monitor::wait_until`], giving up after `timeout`.
    pub fn wait_until_for(
        &self,
        timeout: Duration,
        mut ready: impl FnMut(&T) -> bool,
    ) -> Option<MutexGuard<'_, T>> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.value.lock();
        while !ready(&guard) {
            if self.changed.wait_until(&mut guard, deadline).timed_out() {
                return ready(&guard).then_some(guard);
            }
        }
        Some(guard)
    }
}

/// Counter value observed before requesting a collection. Only
/// [`GenerationCounter::snapshot`] creates one, so a wait always has a
/// snapshot that predates it.
#[must_use = "a snapshot is only useful for waiting"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationSnapshot(u64);

impl GenerationSnapshot {
    pub fn value(self) -> u64 {
        self.0
    }
}

/// Number of completed stop-the-world cycles.
#[derive(Debug, Default)]
pub struct GenerationCounter {
    monitor: Monitor<u64>,
}

impl GenerationCounter {
    pub const fn new() -> Self {
        Self {
            monitor: Monitor::new(0),
        }
    }

    pub fn current(&self) -> u64 {
        *self.monitor.lock()
    }

    pub fn snapshot(&self) -> GenerationSnapshot {
        GenerationSnapshot(self.current())
    }

    /// Record one completed cycle without waking anyone yet.
    pub(crate) fn bump(&self) -> u64 {
        let mut guard = self.monitor.lock();
        *guard += 1;
        *guard
    }

    pub(crate) fn notify_waiters(&self) {
        self.monitor.notify_all();
    }

    /// Block until a cycle has completed after `snapshot` was taken.
    pub fn wait_past(&self, snapshot: GenerationSnapshot) -> u64 {
        *self.monitor.wait_until(|&g| g > snapshot.0)
    }

    pub fn wait_past_for(&self, snapshot: GenerationSnapshot, timeout: Duration) -> Option<u64> {
        self.monitor
            .wait_until_for(timeout, |&g| g > snapshot.0)
            .map(|g| *g)
    }

    /// Snapshot, run `request`, then wait for the next cycle. The snapshot
    /// precedes the request so a cycle that completes before the wait
    /// begins is still seen.
    pub fn block_until_next(&self, request: impl FnOnce()) -> u64 {
        let snapshot = self.snapshot();
        request();
        self.wait_past(snapshot)
    }
}
