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

//! The runtime-to-engine direction.
//!
//! Whatever collector sits behind the binding implements [`GcEngine`]. The
//! binding never assumes an algorithm: barriers forward to the hooks below,
//! and liveness questions during weak processing are answered here.

use crate::slot::{RefSlot, SlotRange};
use crate::threads::MutatorId;
use crate::weak::ForwardingWord;
use mmtk::util::{Address, ObjectReference};

pub trait GcEngine: Send + Sync + 'static {
    /// Per-thread allocator state. Owned by the binding's registry, only
    /// ever touched by the owning thread or by a collector while that
    /// thread is parked.
    type Mutator: Send + 'static;

    fn bind_mutator(&self, id: MutatorId) -> Self::Mutator;

    fn destroy_mutator(&self, mutator: Self::Mutator) {
        drop(mutator)
    }

    /// Called before `target` is stored into `slot` of `src`. The old value
    /// is still in the slot.
    fn object_reference_write_pre(
        &self,
        mutator: &mut Self::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    );

    /// Called after the store. `target` is always the raw reference, never
    /// the compressed form.
    fn object_reference_write_post(
        &self,
        mutator: &mut Self::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    );

    /// Out-of-line path for a store that has already happened.
    fn object_reference_write_slow(
        &self,
        mutator: &mut Self::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        self.object_reference_write_pre(mutator, src, slot, target);
        self.object_reference_write_post(mutator, src, slot, target);
    }

    fn array_copy_pre(&self, mutator: &mut Self::Mutator, src: SlotRange, dst: SlotRange);
    fn array_copy_post(&self, mutator: &mut Self::Mutator, src: SlotRange, dst: SlotRange);

    /// Ask for a collection on behalf of `requester`. The binding waits for
    /// the generation to advance afterwards, so an engine that already
    /// parked the requester until the cycle finished is fine too.
    fn request_collection(&self, requester: MutatorId);

    fn is_live(&self, object: ObjectReference) -> bool;

    /// New location of `object` if it was moved in the current cycle.
    fn forwarded(&self, object: ObjectReference) -> Option<ObjectReference> {
        ForwardingWord::load(object).target()
    }

    /// Reference count for counting collectors. Tracing engines report 1
    /// for live objects.
    fn reference_count(&self, object: ObjectReference) -> usize {
        usize::from(self.is_live(object))
    }

    /// Bounds of the managed heap, if the engine reserves a contiguous one.
    fn heap_range(&self) -> Option<(Address, Address)> {
        None
    }

    /// Fast-path check for object-remembering barriers.
    fn object_is_unlogged(&self, object: ObjectReference) -> bool {
        let _ = object;
        true
    }

    /// Fast-path check for field-logging barriers.
    fn field_is_unlogged(&self, slot: RefSlot) -> bool {
        let _ = slot;
        true
    }
}
