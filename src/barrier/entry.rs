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

use super::{Barrier, BarrierSet, Decorators, FieldLoggingBarrier, NoBarrier, ObjectBarrier, StoreOperand};
use crate::config::BarrierSelector;
use crate::engine::GcEngine;
use crate::slot::{PointerCodec, RefSlot, SlotRange};
use mmtk::util::ObjectReference;

type WriteFn<E> =
    fn(&E, &mut <E as GcEngine>::Mutator, ObjectReference, RefSlot, Option<ObjectReference>);
type CopyFn<E> = fn(&E, &mut <E as GcEngine>::Mutator, SlotRange, SlotRange);
type StoreFn<E> = fn(
    &E,
    &mut <E as GcEngine>::Mutator,
    &PointerCodec,
    Decorators,
    ObjectReference,
    RefSlot,
    StoreOperand,
);
type BulkCopyFn<E> = fn(&E, &mut <E as GcEngine>::Mutator, Decorators, SlotRange, SlotRange);

/// Out-of-line barrier entry points, monomorphised for one barrier and
/// chosen once at start-up. Compiled code and the `extern "C"` shims call
/// through this table.
pub struct BarrierEntryPoints<E: GcEngine> {
    pub kind: BarrierSelector,
    pub skip_const_null: bool,
    pub write_pre: WriteFn<E>,
    pub write_post: WriteFn<E>,
    pub write_slow: WriteFn<E>,
    pub array_copy_pre: CopyFn<E>,
    pub array_copy_post: CopyFn<E>,
    pub store: StoreFn<E>,
    pub copy: BulkCopyFn<E>,
}

impl<E: GcEngine> Clone for BarrierEntryPoints<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E: GcEngine> Copy for BarrierEntryPoints<E> {}

impl<E: GcEngine> std::fmt::Debug for BarrierEntryPoints<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierEntryPoints")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl<E: GcEngine> BarrierEntryPoints<E> {
    pub fn for_barrier<B: Barrier>() -> Self {
        Self {
            kind: B::KIND,
            skip_const_null: B::SKIP_CONST_NULL,
            write_pre: B::write_pre::<E>,
            write_post: B::write_post::<E>,
            write_slow: B::write_slow::<E>,
            array_copy_pre: B::array_copy_pre::<E>,
            array_copy_post: B::array_copy_post::<E>,
            store: BarrierSet::<B>::store_reference::<E>,
            copy: BarrierSet::<B>::copy_references::<E>,
        }
    }

    pub fn select(selector: BarrierSelector) -> Self {
        match selector {
            BarrierSelector::None => Self::for_barrier::<NoBarrier>(),
            BarrierSelector::Object => Self::for_barrier::<ObjectBarrier>(),
            BarrierSelector::Field => Self::for_barrier::<FieldLoggingBarrier>(),
        }
    }

    /// The elision test of the installed barrier.
    #[inline]
    pub fn can_elide(&self, decorators: Decorators, operand: StoreOperand) -> bool {
        super::can_elide(decorators, operand, self.skip_const_null)
    }
}
