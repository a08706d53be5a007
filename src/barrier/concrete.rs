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

use super::Barrier;
use crate::config::BarrierSelector;
use crate::engine::GcEngine;
use crate::slot::{RefSlot, SlotRange};
use mmtk::util::ObjectReference;

/// For non-generational stop-the-world plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBarrier;

impl Barrier for NoBarrier {
    const KIND: BarrierSelector = BarrierSelector::None;
    const SKIP_CONST_NULL: bool = true;

    #[inline(always)]
    fn write_pre<E: GcEngine>(
        _: &E,
        _: &mut E::Mutator,
        _: ObjectReference,
        _: RefSlot,
        _: Option<ObjectReference>,
    ) {
    }

    #[inline(always)]
    fn write_post<E: GcEngine>(
        _: &E,
        _: &mut E::Mutator,
        _: ObjectReference,
        _: RefSlot,
        _: Option<ObjectReference>,
    ) {
    }

    #[inline(always)]
    fn array_copy_pre<E: GcEngine>(_: &E, _: &mut E::Mutator, _: SlotRange, _: SlotRange) {}

    #[inline(always)]
    fn array_copy_post<E: GcEngine>(_: &E, _: &mut E::Mutator, _: SlotRange, _: SlotRange) {}
}

/// Object-remembering post-write barrier for generational plans. The first
/// store into an object since the last cycle logs the whole object;
/// storing a null constant cannot create an edge and is skipped.
#[derive(Debug, Clone, Copy, Default)]
pub struct ObjectBarrier;

impl Barrier for ObjectBarrier {
    const KIND: BarrierSelector = BarrierSelector::Object;
    const SKIP_CONST_NULL: bool = true;

    #[inline(always)]
    fn write_pre<E: GcEngine>(
        _: &E,
        _: &mut E::Mutator,
        _: ObjectReference,
        _: RefSlot,
        _: Option<ObjectReference>,
    ) {
    }

    #[inline(always)]
    fn write_post<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        if engine.object_is_unlogged(src) {
            engine.object_reference_write_post(mutator, src, slot, target);
        }
    }

    fn write_slow<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        engine.object_reference_write_slow(mutator, src, slot, target);
    }

    fn array_copy_pre<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    ) {
        engine.array_copy_pre(mutator, src, dst);
    }

    fn array_copy_post<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    ) {
        engine.array_copy_post(mutator, src, dst);
    }
}

/// Field-logging pre-write barrier for reference-counting and concurrent
/// plans. Logs the old value of each field once per cycle, so even a null
/// constant store has to go through it.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldLoggingBarrier;

impl Barrier for FieldLoggingBarrier {
    const KIND: BarrierSelector = BarrierSelector::Field;
    const SKIP_CONST_NULL: bool = false;

    #[inline(always)]
    fn write_pre<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        if engine.field_is_unlogged(slot) {
            engine.object_reference_write_pre(mutator, src, slot, target);
        }
    }

    #[inline(always)]
    fn write_post<E: GcEngine>(
        _: &E,
        _: &mut E::Mutator,
        _: ObjectReference,
        _: RefSlot,
        _: Option<ObjectReference>,
    ) {
    }

    fn write_slow<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        engine.object_reference_write_slow(mutator, src, slot, target);
    }

    fn array_copy_pre<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    ) {
        engine.array_copy_pre(mutator, src, dst);
    }

    fn array_copy_post<E: GcEngine>(
        engine: &E,
        mutator: &mut E::Mutator,
        src: SlotRange,
        dst: SlotRange,
    ) {
        engine.array_copy_post(mutator, src, dst);
    }
}
