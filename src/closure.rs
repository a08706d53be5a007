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

//! Edge-buffer handoff between root producers and the engine.
//!
//! The engine owns buffer storage. A producer (the host's root walkers, via
//! [`RootsClosure`]) fills a buffer to capacity, hands it back through
//! [`SlotSink::flush`] and continues in the fresh buffer it gets in return.
//! For hosts that cannot call Rust directly the same protocol is exposed as
//! the C-shaped [`SlotsClosure`].

use crate::slot::RefSlot;
use std::ffi::c_void;
use std::mem::ManuallyDrop;

/// Receives reference slots one at a time.
pub trait SlotVisitor {
    fn visit_slot(&mut self, slot: RefSlot);
}

impl<F: FnMut(RefSlot)> SlotVisitor for F {
    #[inline]
    fn visit_slot(&mut self, slot: RefSlot) {
        self(slot)
    }
}

/// Consumer end of the edge-buffer protocol.
pub trait SlotSink {
    /// Capacity of the first buffer a producer should fill.
    fn buffer_capacity(&self) -> usize;

    /// Take ownership of a filled buffer and return an empty one whose
    /// capacity is at least that of `filled`.
    fn flush(&mut self, filled: Vec<RefSlot>) -> Vec<RefSlot>;
}

impl<S: SlotSink + ?Sized> SlotSink for &mut S {
    fn buffer_capacity(&self) -> usize {
        (**self).buffer_capacity()
    }

    fn flush(&mut self, filled: Vec<RefSlot>) -> Vec<RefSlot> {
        (**self).flush(filled)
    }
}

/// Keeps every batch it is handed.
#[derive(Debug, Clone)]
pub struct VecSink {
    capacity: usize,
    batches: Vec<Vec<RefSlot>>,
}

impl VecSink {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            batches: Vec::new(),
        }
    }

    pub fn batches(&self) -> &[Vec<RefSlot>] {
        &self.batches
    }

    pub fn slots(&self) -> impl Iterator<Item = RefSlot> + '_ {
        self.batches.iter().flatten().copied()
    }

    pub fn into_slots(self) -> Vec<RefSlot> {
        self.batches.into_iter().flatten().collect()
    }

    pub fn len(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl SlotSink for VecSink {
    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn flush(&mut self, filled: Vec<RefSlot>) -> Vec<RefSlot> {
        let capacity = filled.capacity().max(self.capacity);
        self.batches.push(filled);
        Vec::with_capacity(capacity)
    }
}

/// Drops everything. Used for weak edges that must not become roots.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardSink;

impl SlotSink for DiscardSink {
    fn buffer_capacity(&self) -> usize {
        64
    }

    fn flush(&mut self, mut filled: Vec<RefSlot>) -> Vec<RefSlot> {
        filled.clear();
        filled
    }
}

/// Producer end: a [`SlotVisitor`] that batches into a [`SlotSink`].
///
/// Whatever is buffered when the closure is dropped is flushed.
pub struct RootsClosure<'s, S: SlotSink + ?Sized> {
    sink: &'s mut S,
    buffer: Vec<RefSlot>,
    reported: usize,
    #[cfg(debug_assertions)]
    seen: ahash::AHashSet<RefSlot>,
}

impl<'s, S: SlotSink + ?Sized> RootsClosure<'s, S> {
    pub fn new(sink: &'s mut S) -> Self {
        let capacity = sink.buffer_capacity().max(1);
        Self {
            sink,
            buffer: Vec::with_capacity(capacity),
            reported: 0,
            #[cfg(debug_assertions)]
            seen: ahash::AHashSet::new(),
        }
    }

    /// Slots reported so far, buffered or flushed.
    pub fn reported(&self) -> usize {
        self.reported
    }

    /// Flush what is buffered and return the total count.
    pub fn finish(mut self) -> usize {
        self.flush_remaining();
        self.reported
    }

    fn renew(&mut self) {
        let capacity = self.buffer.capacity();
        let filled = std::mem::take(&mut self.buffer);
        let mut fresh = self.sink.flush(filled);
        debug_assert!(fresh.is_empty(), "sink returned a non-empty buffer");
        fresh.clear();
        if fresh.capacity() < capacity {
            tracing::warn!(
                target: "gcbridge",
                expected = capacity,
                got = fresh.capacity(),
                "sink returned a smaller buffer"
            );
            fresh.reserve_exact(capacity);
        }
        self.buffer = fresh;
    }

    fn flush_remaining(&mut self) {
        if !self.buffer.is_empty() {
            let filled = std::mem::take(&mut self.buffer);
            // The returned buffer is not needed; dropping it frees it.
            drop(self.sink.flush(filled));
        }
    }
}

impl<S: SlotSink + ?Sized> SlotVisitor for RootsClosure<'_, S> {
    #[inline]
    fn visit_slot(&mut self, slot: RefSlot) {
        #[cfg(debug_assertions)]
        debug_assert!(self.seen.insert(slot), "{slot:?} reported twice in one scan");
        tracing::trace!(target: "gcbridge", ?slot, "root slot");
        self.buffer.push(slot);
        self.reported += 1;
        if self.buffer.len() >= self.buffer.capacity() {
            self.renew();
        }
    }
}

impl<S: SlotSink + ?Sized> Drop for RootsClosure<'_, S> {
    fn drop(&mut self) {
        self.flush_remaining();
    }
}

/// Buffer handed across the C boundary.
#[repr(C)]
#[derive(Debug)]
pub struct NewBuffer {
    pub ptr: *mut RefSlot,
    pub capacity: usize,
}

pub type ReportSlotsFn =
    extern "C" fn(ptr: *mut RefSlot, length: usize, capacity: usize, data: *mut c_void) -> NewBuffer;

/// C-shaped closure over a [`SlotSink`].
///
/// Call with a null `ptr` to obtain the first buffer. Afterwards pass each
/// filled buffer back to receive the next one; hand the last, unfilled
/// buffer to [`release_buffer`].
#[repr(C)]
#[derive(Debug)]
pub struct SlotsClosure {
    pub func: ReportSlotsFn,
    pub data: *mut c_void,
}

impl SlotsClosure {
    /// The closure borrows `sink` for as long as the host holds it; it must
    /// not be invoked after `sink` is dropped.
    pub fn for_sink<S: SlotSink>(sink: &mut S) -> Self {
        Self {
            func: report_slots_and_renew_buffer::<S>,
            data: sink as *mut S as *mut c_void,
        }
    }

    /// # Safety
    ///
    /// `ptr`/`length`/`capacity` must come from a buffer this closure
    /// handed out, or `ptr` must be null. The sink must still be alive.
    pub unsafe fn invoke(&self, ptr: *mut RefSlot, length: usize, capacity: usize) -> NewBuffer {
        (self.func)(ptr, length, capacity, self.data)
    }
}

fn into_new_buffer(buffer: Vec<RefSlot>) -> NewBuffer {
    let mut buffer = ManuallyDrop::new(buffer);
    NewBuffer {
        ptr: buffer.as_mut_ptr(),
        capacity: buffer.capacity(),
    }
}

extern "C" fn report_slots_and_renew_buffer<S: SlotSink>(
    ptr: *mut RefSlot,
    length: usize,
    capacity: usize,
    data: *mut c_void,
) -> NewBuffer {
    // SAFETY: `data` was produced by `SlotsClosure::for_sink::<S>`.
    let sink = unsafe { &mut *(data as *mut S) };
    if ptr.is_null() {
        return into_new_buffer(Vec::with_capacity(sink.buffer_capacity().max(1)));
    }
    // SAFETY: the buffer was allocated by this module with these parts.
    let filled = unsafe { Vec::from_raw_parts(ptr, length, capacity) };
    if filled.is_empty() {
        return into_new_buffer(filled);
    }
    let mut fresh = sink.flush(filled);
    if fresh.capacity() < capacity {
        fresh.reserve_exact(capacity);
    }
    into_new_buffer(fresh)
}

/// Free a buffer obtained from a [`SlotsClosure`] without reporting it.
///
/// # Safety
///
/// The parts must describe a buffer handed out by a [`SlotsClosure`] that
/// has not been returned or released yet.
#[unsafe(export_name = "gcbridge_release_buffer")]
pub unsafe extern "C" fn release_buffer(ptr: *mut RefSlot, length: usize, capacity: usize) {
    if !ptr.is_null() {
        drop(unsafe { Vec::from_raw_parts(ptr, length, capacity) });
    }
}
