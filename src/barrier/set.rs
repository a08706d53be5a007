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

use super::{Barrier, Decorators, StoreOperand};
use crate::engine::GcEngine;
use crate::slot::{PointerCodec, RefSlot, SlotRange};
use mmtk::util::{Address, ObjectReference};
use mmtk::vm::slot::MemorySlice;
use std::marker::PhantomData;

/// What the generic store path left in the register: the encoded value
/// for narrow slots, the raw address otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoredValue {
    pub bits: usize,
    pub narrow: bool,
}

impl StoredValue {
    /// Undo the in-place encoding so the engine sees a raw reference.
    #[inline]
    pub fn decompress(self, codec: &PointerCodec) -> Option<ObjectReference> {
        if self.narrow {
            codec.decode(self.bits as u32)
        } else {
            // SAFETY: zero maps to None; anything else was a reference.
            ObjectReference::from_raw_address(unsafe { Address::from_usize(self.bits) })
        }
    }
}

/// The generic store path. Returns the value as it was written.
#[inline]
pub fn raw_store(codec: &PointerCodec, slot: RefSlot, value: Option<ObjectReference>) -> StoredValue {
    let bits = if slot.is_narrow() {
        codec.encode(value) as usize
    } else {
        value.map_or(0, |o| o.to_raw_address().as_usize())
    };
    slot.store_bits(bits);
    StoredValue {
        bits,
        narrow: slot.is_narrow(),
    }
}

/// Store and copy paths wrapped in barrier `B`.
pub struct BarrierSet<B> {
    _barrier: PhantomData<B>,
}

impl<B: Barrier> BarrierSet<B> {
    /// Barriered store of `operand` into `slot` of `src`.
    ///
    /// Pre-barrier, raw store, post-barrier. The raw store encodes the value
    /// for narrow slots; the post-barrier gets it decoded again.
    #[inline]
    pub fn store_reference<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        codec: &PointerCodec,
        decorators: Decorators,
        src: ObjectReference,
        slot: RefSlot,
        operand: StoreOperand,
    ) {
        let value = operand.value();
        if B::elide(decorators, operand) {
            raw_store(codec, slot, value);
            return;
        }
        if !decorators.contains(Decorators::AS_NO_KEEPALIVE) {
            B::write_pre(engine, mutator, src, slot, value);
        }
        let stored = raw_store(codec, slot, value);
        let value = stored.decompress(codec);
        B::write_post(engine, mutator, src, slot, value);
    }

    /// Bulk copy of `src` into `dst`. The barrier hooks run once each for
    /// the whole copy, including an empty one.
    pub fn copy_references<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        decorators: Decorators,
        src: SlotRange,
        dst: SlotRange,
    ) {
        let barriered = decorators.contains(Decorators::IN_HEAP);
        let needs_pre = barriered && !decorators.contains(Decorators::IS_DEST_UNINITIALIZED);
        if needs_pre {
            B::array_copy_pre(engine, mutator, src, dst);
        }
        if !src.is_empty() {
            SlotRange::copy(&src, &dst);
        }
        if barriered {
            B::array_copy_post(engine, mutator, src, dst);
        }
    }
}
