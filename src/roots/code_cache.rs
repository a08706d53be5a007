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

//! References embedded in compiled code.
//!
//! The JIT registers the slots of each installed code blob. New blobs sit in
//! the nursery until the next code-cache scan promotes them. Each blob is
//! claimed at most once per cycle, whether reached from a thread's frames or
//! from the code-cache scan.

use crate::closure::SlotVisitor;
use crate::slot::RefSlot;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identity of a compiled code blob, as assigned by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub usize);

#[derive(Debug)]
struct CodeEntry {
    slots: Box<[RefSlot]>,
    claimed_epoch: AtomicU64,
}

impl CodeEntry {
    fn try_claim(&self, epoch: u64) -> bool {
        let mut seen = self.claimed_epoch.load(Ordering::Acquire);
        while seen < epoch {
            match self.claimed_epoch.compare_exchange_weak(
                seen,
                epoch,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => seen = current,
            }
        }
        false
    }
}

type CodeMap = BTreeMap<CodeId, Arc<CodeEntry>>;

#[derive(Debug, Default)]
pub struct CodeRootTable {
    nursery: Mutex<CodeMap>,
    mature: Mutex<CodeMap>,
    epoch: AtomicU64,
}

impl CodeRootTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the slots embedded in `code`, replacing any earlier entry.
    pub fn register(&self, code: CodeId, slots: impl IntoIterator<Item = RefSlot>) {
        let entry = Arc::new(CodeEntry {
            slots: slots.into_iter().collect(),
            claimed_epoch: AtomicU64::new(0),
        });
        self.mature.lock().remove(&code);
        self.nursery.lock().insert(code, entry);
    }

    pub fn unregister(&self, code: CodeId) -> bool {
        let in_nursery = self.nursery.lock().remove(&code).is_some();
        let in_mature = self.mature.lock().remove(&code).is_some();
        in_nursery || in_mature
    }

    /// Start a new claim epoch. Called once per cycle, before scanning.
    pub fn begin_cycle(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn current_epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    fn lookup(&self, code: CodeId) -> Option<Arc<CodeEntry>> {
        if let Some(entry) = self.mature.lock().get(&code) {
            return Some(entry.clone());
        }
        self.nursery.lock().get(&code).cloned()
    }

    /// Report `code`'s slots unless it was already claimed this cycle.
    /// Returns the number of slots reported.
    pub fn claim_and_visit(&self, code: CodeId, visitor: &mut dyn SlotVisitor) -> usize {
        let Some(entry) = self.lookup(code) else {
            return 0;
        };
        if !entry.try_claim(self.current_epoch()) {
            return 0;
        }
        for slot in entry.slots.iter() {
            visitor.visit_slot(*slot);
        }
        entry.slots.len()
    }

    /// Report every unclaimed blob, mature first, then promote the nursery.
    pub fn scan(&self, visitor: &mut dyn SlotVisitor) -> usize {
        let epoch = self.current_epoch();
        let mut mature = self.mature.lock();
        let nursery = std::mem::take(&mut *self.nursery.lock());
        let mut reported = 0;
        for entry in mature.values().chain(nursery.values()) {
            if entry.try_claim(epoch) {
                for slot in entry.slots.iter() {
                    visitor.visit_slot(*slot);
                }
                reported += entry.slots.len();
            }
        }
        mature.extend(nursery);
        reported
    }

    /// Blobs claimed in the current cycle.
    pub fn claimed(&self) -> Vec<CodeId> {
        let epoch = self.current_epoch();
        let claimed_in = |map: &CodeMap| -> Vec<CodeId> {
            map.iter()
                .filter(|(_, e)| e.claimed_epoch.load(Ordering::Acquire) == epoch)
                .map(|(id, _)| *id)
                .collect()
        };
        let mut all = claimed_in(&self.mature.lock());
        all.extend(claimed_in(&self.nursery.lock()));
        all.sort_unstable();
        all
    }

    pub fn nursery_len(&self) -> usize {
        self.nursery.lock().len()
    }

    pub fn mature_len(&self) -> usize {
        self.mature.lock().len()
    }
}
