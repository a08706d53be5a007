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

//! MMTk `VMBinding` on top of the global [`Binding`].

use super::binding;
use crate::binding::{Binding, OutOfMemory};
use crate::closure::SlotSink;
use crate::engine::GcEngine;
use crate::roots::{RootCategory, ThreadSelector};
use crate::slot::{RefSlot, SlotRange};
use crate::threads::{GcThreadKind, MutatorId};
use mmtk::scheduler::GCWorker;
use mmtk::util::alloc::AllocationError;
use mmtk::util::copy::{CopySemantics, GCWorkerCopyContext};
use mmtk::util::opaque_pointer::*;
use mmtk::util::{Address, ObjectReference};
use mmtk::vm::{
    ActivePlan, Collection, GCThreadContext, ObjectModel, ObjectTracerContext, ReferenceGlue,
    RootsWorkFactory, Scanning, SlotVisitor as EngineSlotVisitor, VMBinding, VMGlobalLogBitSpec,
    VMLocalForwardingBitsSpec, VMLocalForwardingPointerSpec, VMLocalLOSMarkNurserySpec,
    VMLocalMarkBitSpec,
};
use mmtk::plan::MutatorContext;
use mmtk::vm::slot::MemorySlice;
use mmtk::{MMTK, Mutator, memory_manager};

const OBJECT_ALIGNMENT: usize = 8;

#[derive(Default)]
pub struct HostVM;

impl VMBinding for HostVM {
    type VMObjectModel = Self;
    type VMActivePlan = Self;
    type VMCollection = Self;
    type VMScanning = Self;
    type VMReferenceGlue = Self;
    type VMSlot = RefSlot;
    type VMMemorySlice = SlotRange;
}

/// Mutator ids travel through MMTk as the thread pointer.
pub(crate) fn mutator_tls(id: MutatorId) -> VMMutatorThread {
    // SAFETY: the pointer is never dereferenced, only handed back to us.
    let addr = unsafe { Address::from_usize(id.as_u64() as usize) };
    VMMutatorThread(VMThread(OpaquePointer::from_address(addr)))
}

pub(crate) fn mutator_id(tls: VMMutatorThread) -> MutatorId {
    MutatorId::from_u64(tls.0.0.to_address().as_usize() as u64)
}

/// [`GcEngine`] over an MMTk instance.
pub struct MmtkEngine {
    mmtk: &'static MMTK<HostVM>,
}

impl MmtkEngine {
    pub fn new(mmtk: &'static MMTK<HostVM>) -> Self {
        Self { mmtk }
    }

    pub fn mmtk(&self) -> &'static MMTK<HostVM> {
        self.mmtk
    }
}

impl GcEngine for MmtkEngine {
    type Mutator = Box<Mutator<HostVM>>;

    fn bind_mutator(&self, id: MutatorId) -> Self::Mutator {
        memory_manager::bind_mutator(self.mmtk, mutator_tls(id))
    }

    fn destroy_mutator(&self, mut mutator: Self::Mutator) {
        memory_manager::destroy_mutator(&mut mutator);
    }

    #[inline]
    fn object_reference_write_pre(
        &self,
        mutator: &mut Self::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        memory_manager::object_reference_write_pre(mutator, src, slot, target);
    }

    #[inline]
    fn object_reference_write_post(
        &self,
        mutator: &mut Self::Mutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        memory_manager::object_reference_write_post(mutator, src, slot, target);
    }

    fn array_copy_pre(&self, mutator: &mut Self::Mutator, src: SlotRange, dst: SlotRange) {
        // The memory_manager wrapper demands a `'static` mutator borrow; call the
        // mutator's barrier directly, as that wrapper does.
        debug_assert_eq!(src.bytes(), dst.bytes());
        mutator.barrier().memory_region_copy_pre(src, dst);
    }

    fn array_copy_post(&self, mutator: &mut Self::Mutator, src: SlotRange, dst: SlotRange) {
        // The memory_manager wrapper demands a `'static` mutator borrow; call the
        // mutator's barrier directly, as that wrapper does.
        debug_assert_eq!(src.bytes(), dst.bytes());
        mutator.barrier().memory_region_copy_post(src, dst);
    }

    /// MMTk parks the requester itself through [`Collection::block_for_gc`];
    /// the binding's own wait then returns immediately.
    fn request_collection(&self, requester: MutatorId) {
        memory_manager::handle_user_collection_request(self.mmtk, mutator_tls(requester));
    }

    fn is_live(&self, object: ObjectReference) -> bool {
        object.is_live()
    }

    fn forwarded(&self, object: ObjectReference) -> Option<ObjectReference> {
        object.get_forwarded_object()
    }

    fn heap_range(&self) -> Option<(Address, Address)> {
        let layout = mmtk::util::heap::vm_layout::vm_layout();
        Some((layout.heap_start, layout.heap_end))
    }
}

impl ActivePlan<HostVM> for HostVM {
    fn number_of_mutators() -> usize {
        binding().mutator_count()
    }

    fn is_mutator(_tls: VMThread) -> bool {
        binding()
            .registry()
            .is_mutator(std::thread::current().id())
    }

    fn mutator(tls: VMMutatorThread) -> &'static mut Mutator<HostVM> {
        let binding = binding();
        let id = mutator_id(tls);
        let Some(context) = binding.registry().get(id) else {
            binding.violation(crate::error::ProtocolViolation::UnknownMutator(id))
        };
        // SAFETY: MMTk asks for a mutator either from its own thread or
        // while the world is stopped. The state is boxed and outlives the
        // registration.
        match unsafe { context.state_mut() } {
            Some(state) => unsafe { &mut *(state.as_mut() as *mut Mutator<HostVM>) },
            None => binding.violation(crate::error::ProtocolViolation::UnknownMutator(id)),
        }
    }

    fn mutators<'a>() -> Box<dyn Iterator<Item = &'a mut Mutator<HostVM>> + 'a> {
        let contexts = binding().mutators();
        Box::new(contexts.into_iter().filter_map(|context| {
            // SAFETY: only iterated while mutators are parked.
            unsafe { context.state_mut() }
                .map(|state| unsafe { &mut *(state.as_mut() as *mut Mutator<HostVM>) })
        }))
    }
}

impl Collection<HostVM> for HostVM {
    fn stop_all_mutators<F>(_tls: VMWorkerThread, mut mutator_visitor: F)
    where
        F: FnMut(&'static mut Mutator<HostVM>),
    {
        let binding = binding();
        binding.stop_all_mutators(binding.options().class_unloading, |context| {
            // SAFETY: the owner is parked for the rest of the cycle.
            if let Some(state) = unsafe { context.state_mut() } {
                mutator_visitor(unsafe { &mut *(state.as_mut() as *mut Mutator<HostVM>) });
            }
        });
    }

    fn resume_mutators(_tls: VMWorkerThread) {
        binding().resume_mutators();
    }

    fn block_for_gc(_tls: VMMutatorThread) {
        binding().block_for_gc();
    }

    fn spawn_gc_thread(_tls: VMThread, ctx: GCThreadContext<HostVM>) {
        match ctx {
            GCThreadContext::Worker(worker) => {
                Binding::spawn_gc_thread(binding(), GcThreadKind::Worker as i32, move |binding| {
                    worker.run(
                        VMWorkerThread(VMThread::UNINITIALIZED),
                        binding.engine().mmtk(),
                    )
                });
            }
        }
    }

    fn out_of_memory(_tls: VMThread, err_kind: AllocationError) {
        binding().out_of_memory(out_of_memory_kind(err_kind));
    }

    fn schedule_finalization(_tls: VMWorkerThread) {
        binding().upcalls().hooks().schedule_finalizer();
    }
}

pub(crate) fn out_of_memory_kind(err_kind: AllocationError) -> OutOfMemory {
    match err_kind {
        AllocationError::HeapOutOfMemory => OutOfMemory::Heap,
        AllocationError::MmapOutOfMemory => OutOfMemory::AddressSpace,
    }
}

impl ObjectModel<HostVM> for HostVM {
    const GLOBAL_LOG_BIT_SPEC: VMGlobalLogBitSpec = VMGlobalLogBitSpec::side_first();
    const LOCAL_FORWARDING_POINTER_SPEC: VMLocalForwardingPointerSpec =
        VMLocalForwardingPointerSpec::side_first();
    const LOCAL_FORWARDING_BITS_SPEC: VMLocalForwardingBitsSpec =
        VMLocalForwardingBitsSpec::side_first();
    const LOCAL_MARK_BIT_SPEC: VMLocalMarkBitSpec = VMLocalMarkBitSpec::in_header(0);
    const LOCAL_LOS_MARK_NURSERY_SPEC: VMLocalLOSMarkNurserySpec =
        VMLocalLOSMarkNurserySpec::in_header(8);
    const OBJECT_REF_OFFSET_LOWER_BOUND: isize = 0;

    fn copy(
        from: ObjectReference,
        semantics: CopySemantics,
        context: &mut GCWorkerCopyContext<HostVM>,
    ) -> ObjectReference {
        let bytes = Self::get_current_size(from);
        let dst = context.alloc_copy(from, bytes, OBJECT_ALIGNMENT, 0, semantics);
        // SAFETY: `dst` is a fresh allocation of `bytes` bytes.
        unsafe {
            std::ptr::copy_nonoverlapping::<u8>(
                from.to_raw_address().to_ptr(),
                dst.to_mut_ptr(),
                bytes,
            )
        };
        // SAFETY: the copy allocator never returns zero.
        let to = unsafe { ObjectReference::from_raw_address_unchecked(dst) };
        context.post_copy(to, bytes, semantics);
        to
    }

    fn copy_to(from: ObjectReference, to: ObjectReference, _region: Address) -> Address {
        let bytes = Self::get_current_size(from);
        let dst = to.to_raw_address();
        if dst != from.to_raw_address() {
            // SAFETY: the engine reserved `bytes` at `to`; regions may overlap.
            unsafe {
                std::ptr::copy::<u8>(from.to_raw_address().to_ptr(), dst.to_mut_ptr(), bytes)
            };
        }
        dst + bytes
    }

    fn get_current_size(object: ObjectReference) -> usize {
        binding().object_size(object)
    }

    fn get_size_when_copied(object: ObjectReference) -> usize {
        Self::get_current_size(object)
    }

    fn get_align_when_copied(_object: ObjectReference) -> usize {
        OBJECT_ALIGNMENT
    }

    fn get_align_offset_when_copied(_object: ObjectReference) -> usize {
        0
    }

    fn get_reference_when_copied_to(_from: ObjectReference, to: Address) -> ObjectReference {
        // SAFETY: copy targets are never zero.
        unsafe { ObjectReference::from_raw_address_unchecked(to) }
    }

    fn get_type_descriptor(_reference: ObjectReference) -> &'static [i8] {
        &[]
    }

    fn ref_to_object_start(object: ObjectReference) -> Address {
        object.to_raw_address()
    }

    fn ref_to_header(object: ObjectReference) -> Address {
        object.to_raw_address()
    }

    fn dump_object(object: ObjectReference) {
        let binding = binding();
        tracing::info!(
            target: "gcbridge",
            object = %object.to_raw_address(),
            class = binding.class_name(object).as_deref().unwrap_or("?"),
            "{}",
            binding.dump_object(object)
        );
    }
}

/// Turns each filled root buffer into one engine work packet.
pub(crate) struct FactorySink<F> {
    factory: F,
    capacity: usize,
    packets: usize,
}

impl<F: RootsWorkFactory<RefSlot>> FactorySink<F> {
    pub(crate) fn new(factory: F, capacity: usize) -> Self {
        Self {
            factory,
            capacity: capacity.max(1),
            packets: 0,
        }
    }

    pub(crate) fn packets(&self) -> usize {
        self.packets
    }
}

impl<F: RootsWorkFactory<RefSlot>> SlotSink for FactorySink<F> {
    fn buffer_capacity(&self) -> usize {
        self.capacity
    }

    fn flush(&mut self, filled: Vec<RefSlot>) -> Vec<RefSlot> {
        let capacity = filled.capacity().max(self.capacity);
        self.packets += 1;
        self.factory.create_process_roots_work(filled);
        Vec::with_capacity(capacity)
    }
}

impl Scanning<HostVM> for HostVM {
    fn scan_object<SV: EngineSlotVisitor<RefSlot>>(
        _tls: VMWorkerThread,
        object: ObjectReference,
        slot_visitor: &mut SV,
    ) {
        binding().scan_object(object, &mut |slot: RefSlot| slot_visitor.visit_slot(slot));
    }

    fn notify_initial_thread_scan_complete(_partial_scan: bool, _tls: VMWorkerThread) {}

    fn scan_roots_in_mutator_thread(
        _tls: VMWorkerThread,
        mutator: &'static mut Mutator<HostVM>,
        factory: impl RootsWorkFactory<RefSlot>,
    ) {
        let binding = binding();
        let id = mutator_id(mutator.mutator_tls);
        let mut sink = FactorySink::new(factory, binding.options().root_buffer_capacity);
        if let Err(violation) = binding
            .roots()
            .scan_thread_roots(ThreadSelector::One(id), &mut sink)
        {
            binding.violation(violation);
        }
    }

    /// Every category except thread stacks, each into its own packets.
    fn scan_vm_specific_roots(_tls: VMWorkerThread, factory: impl RootsWorkFactory<RefSlot>) {
        let binding = binding();
        let options = binding.options();
        let roots = binding.roots();
        for &category in RootCategory::strong(options.weak_processing) {
            if category == RootCategory::ThreadStacks {
                continue;
            }
            let mut sink = FactorySink::new(factory.clone(), options.root_buffer_capacity);
            if let Err(violation) = roots.scan(category, &mut sink) {
                binding.violation(violation);
            }
        }
    }

    fn supports_return_barrier() -> bool {
        false
    }

    fn prepare_for_roots_re_scanning() {}

    fn process_weak_refs(
        _worker: &mut GCWorker<HostVM>,
        _tracer_context: impl ObjectTracerContext<HostVM>,
    ) -> bool {
        let binding = binding();
        binding.update_weak_processor(binding.options().weak_processing);
        if binding.unloading_this_cycle() {
            binding.unload_classes();
        }
        false
    }
}

impl ReferenceGlue<HostVM> for HostVM {
    type FinalizableType = ObjectReference;

    fn set_referent(reference: ObjectReference, referent: ObjectReference) {
        binding()
            .reference_fields()
            .set_referent(reference, Some(referent))
    }

    fn get_referent(object: ObjectReference) -> Option<ObjectReference> {
        binding().reference_fields().get_referent(object)
    }

    fn clear_referent(reference: ObjectReference) {
        binding().reference_fields().clear_referent(reference)
    }

    fn enqueue_references(references: &[ObjectReference], _tls: VMWorkerThread) {
        binding().enqueue_references(references);
    }
}
