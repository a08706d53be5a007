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

//! Barrier dispatch.
//!
//! Every compiler tier calls the same barrier around each reference store
//! and bulk copy. The concrete barrier is picked once at start-up from
//! [`BarrierSelector`](crate::config::BarrierSelector) and is a type
//! parameter from then on, so the hot path is monomorphic.

mod concrete;
mod entry;
mod set;

pub use concrete::{FieldLoggingBarrier, NoBarrier, ObjectBarrier};
pub use entry::BarrierEntryPoints;
pub use set::{BarrierSet, StoredValue, raw_store};

use crate::config::BarrierSelector;
use crate::engine::GcEngine;
use crate::slot::{RefSlot, SlotRange};
use mmtk::util::ObjectReference;

bitflags::bitflags! {
    /// Static facts about an access site, known to the compiler.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Decorators: u32 {
        /// Destination is a heap object field or array element.
        const IN_HEAP = 1 << 0;
        /// Destination is off-heap (stack, global, handle).
        const IN_NATIVE = 1 << 1;
        /// The store must not keep the old value alive.
        const AS_NO_KEEPALIVE = 1 << 2;
        const IS_ARRAY = 1 << 3;
        /// Bulk copy into freshly allocated memory; there are no old values.
        const IS_DEST_UNINITIALIZED = 1 << 4;
    }
}

/// The value side of a store as the compiler sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOperand {
    /// A null constant in the instruction stream.
    ConstNull,
    /// A register value, which may still be null at run time.
    Value(Option<ObjectReference>),
}

impl StoreOperand {
    pub fn value(self) -> Option<ObjectReference> {
        match self {
            StoreOperand::ConstNull => None,
            StoreOperand::Value(v) => v,
        }
    }
}

/// Whether a store needs no barrier at all. Pure: every tier evaluates it
/// the same way for the same site.
#[inline]
pub fn can_elide(decorators: Decorators, operand: StoreOperand, skip_const_null: bool) -> bool {
    if !decorators.contains(Decorators::IN_HEAP) {
        return true;
    }
    skip_const_null && matches!(operand, StoreOperand::ConstNull)
}

/// Which code is executing a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerTier {
    Interpreter,
    Baseline,
    Optimizing,
}

impl CompilerTier {
    pub const ALL: [CompilerTier; 3] = [
        CompilerTier::Interpreter,
        CompilerTier::Baseline,
        CompilerTier::Optimizing,
    ];

    /// Compiled tiers inline the elision test and the barrier's fast-path
    /// check; the interpreter calls the out-of-line entry points for both.
    pub fn inlines_fast_path(self) -> bool {
        !matches!(self, CompilerTier::Interpreter)
    }
}

/// A write-barrier policy. Implementations are zero-sized; all hooks are
/// static so a [`BarrierSet`] over them compiles to direct calls.
///
/// Hooks never allocate and never block. Anything that might (flushing a
/// full log buffer, say) is the engine's business inside its slow path.
pub trait Barrier: Send + Sync + 'static {
    const KIND: BarrierSelector;

    /// Whether a store of a null constant needs no barrier.
    const SKIP_CONST_NULL: bool;

    fn write_pre<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    );

    fn write_post<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    );

    /// Out-of-line call for a store that already happened, bypassing the
    /// fast-path checks.
    fn write_slow<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        Self::write_pre(engine, mutator, src, slot, target);
        Self::write_post(engine, mutator, src, slot, target);
    }

    fn array_copy_pre<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    );

    fn array_copy_post<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    );

    #[inline]
    fn elide(decorators: Decorators, operand: StoreOperand) -> bool {
        can_elide(decorators, operand, Self::SKIP_CONST_NULL)
    }
}
