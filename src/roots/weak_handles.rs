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

use crate::slot::RefSlot;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// Weak handles registered with the binding.
///
/// Every registered handle is updated after each cycle until it is
/// unregistered. Handles created since the last reference-counting root
/// scan also sit in the nursery, which only a
/// [`LiveFilter::NonStuckOnly`](crate::upcalls::LiveFilter) scan consumes.
#[derive(Debug, Default)]
pub struct WeakHandleTable {
    registered: Mutex<BTreeSet<RefSlot>>,
    nursery: Mutex<Vec<RefSlot>>,
}

impl WeakHandleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, slot: RefSlot) {
        if self.registered.lock().insert(slot) {
            self.nursery.lock().push(slot);
        }
    }

    /// Forget `slot`. Returns whether it was registered.
    pub fn unregister(&self, slot: RefSlot) -> bool {
        if !self.registered.lock().remove(&slot) {
            return false;
        }
        self.nursery.lock().retain(|s| *s != slot);
        true
    }

    pub fn take_nursery(&self) -> Vec<RefSlot> {
        std::mem::take(&mut *self.nursery.lock())
    }

    pub fn nursery_len(&self) -> usize {
        self.nursery.lock().len()
    }

    /// Every registered handle, in address order.
    pub fn registered(&self) -> Vec<RefSlot> {
        self.registered.lock().iter().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.registered.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
