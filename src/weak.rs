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

//! Weak references, weak roots and reference enqueueing.

use crate::config::WeakProcessingMode;
use crate::engine::GcEngine;
use crate::slot::{PointerCodec, RefSlot, field_slot};
use crate::upcalls::{CycleHooks, LayoutOffsets};
use mmtk::util::{Address, ObjectReference};

/// First header word of an object, as the engine leaves it when copying.
///
/// Bits 63..56 are the forwarding state, bits 55..0 the new address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardingWord(usize);

impl ForwardingWord {
    const STATE_SHIFT: u32 = 56;
    const FORWARDED: usize = 0b10 << Self::STATE_SHIFT;
    const POINTER_MASK: usize = (1 << Self::STATE_SHIFT) - 1;

    pub const fn from_raw(bits: usize) -> Self {
        Self(bits)
    }

    pub const fn to_raw(self) -> usize {
        self.0
    }

    /// Read the header word of `object`.
    pub fn load(object: ObjectReference) -> Self {
        // SAFETY: every object starts with a header word.
        Self(unsafe { object.to_raw_address().load::<usize>() })
    }

    /// The word an engine writes when it moves an object to `target`.
    pub fn forwarded_to(target: ObjectReference) -> Self {
        Self(Self::FORWARDED | (target.to_raw_address().as_usize() & Self::POINTER_MASK))
    }

    pub const fn is_forwarded(self) -> bool {
        self.0 >> Self::STATE_SHIFT != 0
    }

    pub fn target(self) -> Option<ObjectReference> {
        if !self.is_forwarded() {
            return None;
        }
        // SAFETY: the low bits of a forwarded header are an object address.
        ObjectReference::from_raw_address(unsafe { Address::from_usize(self.0 & Self::POINTER_MASK) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeakSlotOutcome {
    Null,
    Kept,
    Forwarded(ObjectReference),
    Cleared,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WeakUpdateStats {
    pub visited: usize,
    pub kept: usize,
    pub forwarded: usize,
    pub cleared: usize,
}

impl WeakUpdateStats {
    fn record(&mut self, outcome: WeakSlotOutcome) {
        self.visited += 1;
        match outcome {
            WeakSlotOutcome::Null => {}
            WeakSlotOutcome::Kept => self.kept += 1,
            WeakSlotOutcome::Forwarded(_) => self.forwarded += 1,
            WeakSlotOutcome::Cleared => self.cleared += 1,
        }
    }
}

/// Liveness oracle for weak slots, after the engine has finished tracing.
pub struct WeakProcessor<'a, E> {
    engine: &'a E,
    codec: PointerCodec,
    mode: WeakProcessingMode,
}

impl<'a, E: GcEngine> WeakProcessor<'a, E> {
    pub fn new(engine: &'a E, codec: PointerCodec, mode: WeakProcessingMode) -> Self {
        Self {
            engine,
            codec,
            mode,
        }
    }

    fn in_heap(&self, object: ObjectReference) -> bool {
        match self.engine.heap_range() {
            Some((start, end)) => {
                let addr = object.to_raw_address();
                addr >= start && addr < end
            }
            None => true,
        }
    }

    pub fn is_alive(&self, object: ObjectReference) -> bool {
        match self.mode {
            WeakProcessingMode::Tracing => {
                self.engine.forwarded(object).is_some() || self.engine.is_live(object)
            }
            WeakProcessingMode::ReferenceCounting => {
                self.in_heap(object)
                    && (self.engine.forwarded(object).is_some()
                        || self.engine.reference_count(object) > 0)
            }
        }
    }

    /// Rewrite a forwarded referent, clear a dead one.
    pub fn update_slot(&self, slot: RefSlot) -> WeakSlotOutcome {
        let Some(object) = slot.load_with(&self.codec) else {
            return WeakSlotOutcome::Null;
        };
        if self.mode == WeakProcessingMode::ReferenceCounting && !self.in_heap(object) {
            slot.clear();
            return WeakSlotOutcome::Cleared;
        }
        if let Some(to) = self.engine.forwarded(object) {
            slot.store_with(&self.codec, Some(to));
            return WeakSlotOutcome::Forwarded(to);
        }
        if self.is_alive(object) {
            WeakSlotOutcome::Kept
        } else {
            slot.clear();
            WeakSlotOutcome::Cleared
        }
    }

    pub fn update_all(&self, slots: impl IntoIterator<Item = RefSlot>) -> WeakUpdateStats {
        let mut stats = WeakUpdateStats::default();
        for slot in slots {
            stats.record(self.update_slot(slot));
        }
        tracing::debug!(
            target: "gcbridge",
            visited = stats.visited,
            forwarded = stats.forwarded,
            cleared = stats.cleared,
            mode = ?self.mode,
            "weak slots updated"
        );
        stats
    }
}

/// Field access on `java.lang.ref.Reference`-like objects.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceFields {
    referent: usize,
    discovered: usize,
    compressed: bool,
    codec: PointerCodec,
}

impl ReferenceFields {
    pub fn new(layout: &LayoutOffsets, compressed: bool, codec: PointerCodec) -> Self {
        Self {
            referent: layout.referent,
            discovered: layout.discovered,
            compressed,
            codec,
        }
    }

    pub fn referent_slot(&self, reference: ObjectReference) -> RefSlot {
        field_slot(reference, self.referent, self.compressed)
    }

    pub fn get_referent(&self, reference: ObjectReference) -> Option<ObjectReference> {
        self.referent_slot(reference).load_with(&self.codec)
    }

    pub fn set_referent(&self, reference: ObjectReference, referent: Option<ObjectReference>) {
        self.referent_slot(reference)
            .store_with(&self.codec, referent)
    }

    pub fn clear_referent(&self, reference: ObjectReference) {
        self.set_referent(reference, None)
    }

    pub fn get_discovered(&self, reference: ObjectReference) -> Option<ObjectReference> {
        field_slot(reference, self.discovered, self.compressed).load_with(&self.codec)
    }

    fn set_discovered(&self, reference: ObjectReference, next: Option<ObjectReference>) {
        field_slot(reference, self.discovered, self.compressed).store_with(&self.codec, next)
    }

    /// Chain `refs` through their discovered field and prepend the chain to
    /// the host's pending list. Returns the number of references enqueued.
    pub fn enqueue(&self, refs: &[ObjectReference], hooks: &dyn CycleHooks) -> usize {
        let (Some(&head), Some(&tail)) = (refs.first(), refs.last()) else {
            return 0;
        };
        for pair in refs.windows(2) {
            self.set_discovered(pair[0], Some(pair[1]));
        }
        let old_head = hooks.swap_reference_pending_list(Some(head));
        self.set_discovered(tail, old_head);
        hooks.schedule_finalizer();
        tracing::debug!(target: "gcbridge", count = refs.len(), "references enqueued");
        refs.len()
    }
}
