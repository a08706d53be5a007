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

//! The process-wide binding over MMTk.
//!
//! [`initialize`] builds the engine from [`BindingOptions`], installs the
//! single global [`Binding`] and starts the engine's collector threads.
//! Compiled code reaches the barriers through the `gcbridge_*` symbols
//! below.

mod mmtk_binding;

pub use mmtk_binding::{HostVM, MmtkEngine};

use crate::binding::Binding;
use crate::config::BindingOptions;
use crate::error::{BindingError, fatal};
use crate::slot::{PointerCodec, RefSlot, SlotRange};
use crate::upcalls::Upcalls;
use mmtk::util::opaque_pointer::VMThread;
use mmtk::util::options::PlanSelector;
use mmtk::util::{Address, ObjectReference};
use mmtk::{AllocationSemantics, MMTKBuilder, memory_manager};
use once_cell::sync::OnceCell;

static BINDING: OnceCell<Binding<MmtkEngine>> = OnceCell::new();

const ALLOC_ALIGNMENT: usize = 8;

/// Build the engine and install the global binding. Fails on a second
/// call, on invalid options, and on engine options MMTk rejects.
pub fn initialize(
    options: BindingOptions,
    upcalls: Upcalls,
) -> Result<&'static Binding<MmtkEngine>, BindingError> {
    if BINDING.get().is_some() {
        return Err(BindingError::AlreadyInstalled);
    }
    options.validate()?;

    let mut builder = MMTKBuilder::new();
    if !options.mmtk.contains_key("plan") {
        builder.options.plan.set(PlanSelector::MarkSweep);
    }
    for (key, value) in &options.mmtk {
        if !builder.set_option(key, value) {
            return Err(BindingError::EngineOption {
                key: key.clone(),
                value: value.clone(),
            });
        }
    }
    let mmtk = Box::leak(memory_manager::mmtk_init(&builder));

    let compressed = options.compressed_pointers;
    let binding = Binding::new(options, upcalls, MmtkEngine::new(mmtk))?;
    BINDING
        .set(binding)
        .map_err(|_| BindingError::AlreadyInstalled)?;
    let binding = BINDING.get().ok_or(BindingError::NotInitialized)?;
    if compressed {
        PointerCodec::install_global(binding.codec())?;
    }

    memory_manager::initialize_collection(mmtk, VMThread::UNINITIALIZED);
    tracing::info!(target: "gcbridge", compressed, "MMTk binding initialized");
    Ok(binding)
}

pub fn is_initialized() -> bool {
    BINDING.get().is_some()
}

pub fn try_binding() -> Option<&'static Binding<MmtkEngine>> {
    BINDING.get()
}

/// The global binding. Calling this before [`initialize`] is fatal.
pub fn binding() -> &'static Binding<MmtkEngine> {
    match BINDING.get() {
        Some(binding) => binding,
        None => fatal(BindingError::NotInitialized),
    }
}

/// Allocate `size` bytes for the calling mutator. `None` when the heap is
/// exhausted.
pub fn alloc(size: usize) -> Option<ObjectReference> {
    binding().with_mutator(|mutator| {
        let addr = memory_manager::alloc(
            mutator,
            size,
            ALLOC_ALIGNMENT,
            0,
            AllocationSemantics::Default,
        );
        let object = ObjectReference::from_raw_address(addr)?;
        memory_manager::post_alloc(mutator, object, size, AllocationSemantics::Default);
        Some(object)
    })
}

fn object(raw: usize) -> Option<ObjectReference> {
    // SAFETY: zero maps to None; anything else came from compiled code as a
    // reference.
    ObjectReference::from_raw_address(unsafe { Address::from_usize(raw) })
}

fn range(object_raw: usize, start: usize, count: usize, narrow: bool) -> SlotRange {
    // SAFETY: compiled code passes the element base of a live array.
    SlotRange::new(object(object_raw), unsafe { Address::from_usize(start) }, count, narrow)
}

/// Slots arrive tagged, as produced by [`RefSlot`]'s raw form.
fn slot(raw: usize) -> RefSlot {
    RefSlot::from_raw(raw)
}

#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_write_pre(src: usize, slot_raw: usize, target: usize) {
    if let Some(src) = object(src) {
        binding().write_pre(src, slot(slot_raw), object(target));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_write_post(src: usize, slot_raw: usize, target: usize) {
    if let Some(src) = object(src) {
        binding().write_post(src, slot(slot_raw), object(target));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_write_slow(src: usize, slot_raw: usize, target: usize) {
    if let Some(src) = object(src) {
        binding().write_slow(src, slot(slot_raw), object(target));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_array_copy_pre(
    src_object: usize,
    src_start: usize,
    dst_object: usize,
    dst_start: usize,
    count: usize,
    narrow: bool,
) {
    binding().array_copy_pre(
        range(src_object, src_start, count, narrow),
        range(dst_object, dst_start, count, narrow),
    );
}

#[unsafe(no_mangle)]
pub extern "C" fn gcbridge_array_copy_post(
    src_object: usize,
    src_start: usize,
    dst_object: usize,
    dst_start: usize,
    count: usize,
    narrow: bool,
) {
    binding().array_copy_post(
        range(src_object, src_start, count, narrow),
        range(dst_object, dst_start, count, narrow),
    );
}
