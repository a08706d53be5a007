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

//! The binding object.
//!
//! One [`Binding`] per process ties the host's upcall table to an engine.
//! Mutator threads call into it for barriers and to block for a
//! collection; engine threads call into it to stop and resume the world,
//! scan roots and process weak references.

use crate::barrier::{BarrierEntryPoints, CompilerTier, Decorators, StoreOperand, raw_store};
use crate::closure::{DiscardSink, SlotVisitor, VecSink};
use crate::config::{BindingOptions, WeakProcessingMode};
use crate::engine::GcEngine;
use crate::error::{BindingError, ProtocolViolation};
use crate::handshake::Coordinator;
use crate::roots::{CodeId, CodeRootTable, RootScanner, WeakHandleTable};
use crate::slot::{PointerCodec, RefSlot, SlotRange};
use crate::threads::{GcThreadKind, MutatorContext, MutatorId, ThreadRegistry};
use crate::upcalls::{ClassLoaderScan, LayoutOffsets, Upcalls};
use crate::weak::{ReferenceFields, WeakProcessor, WeakUpdateStats};
use mmtk::util::ObjectReference;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub const ADDRESS_SPACE_EXHAUSTED: &str =
    "Unable to acquire more memory from the OS. Out of system resources.";

/// Allocation failures the engine reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutOfMemory {
    /// The heap is full. The allocation already returned null to its caller.
    Heap,
    /// Mapping more memory failed. Nothing can make progress.
    AddressSpace,
}

pub struct Binding<E: GcEngine> {
    options: BindingOptions,
    upcalls: Upcalls,
    engine: E,
    codec: PointerCodec,
    registry: ThreadRegistry<E::Mutator>,
    coordinator: Coordinator,
    code_roots: CodeRootTable,
    weak_handles: WeakHandleTable,
    barriers: BarrierEntryPoints<E>,
    unloading: AtomicBool,
}

impl<E: GcEngine> Binding<E> {
    /// Bind `engine` to the host. With compressed pointers the codec is
    /// derived from the engine's heap range; an engine without one needs
    /// [`Binding::with_codec`].
    pub fn new(options: BindingOptions, upcalls: Upcalls, engine: E) -> Result<Self, BindingError> {
        let codec = match (options.compressed_pointers, engine.heap_range()) {
            (false, _) => PointerCodec::IDENTITY,
            (true, Some((start, end))) => PointerCodec::for_heap_range(start, end),
            (true, None) => {
                return Err(BindingError::Config(
                    "compressed_pointers needs an engine heap range or an explicit codec".into(),
                ));
            }
        };
        Self::with_codec(options, upcalls, engine, codec)
    }

    /// As [`Binding::new`], encoding narrow slots with `codec`.
    pub fn with_codec(
        options: BindingOptions,
        upcalls: Upcalls,
        engine: E,
        codec: PointerCodec,
    ) -> Result<Self, BindingError> {
        options.validate()?;
        let barriers = BarrierEntryPoints::select(options.barrier);
        tracing::info!(
            target: "gcbridge",
            barrier = ?options.barrier,
            compressed = options.compressed_pointers,
            codec_base = codec.base(),
            codec_shift = codec.shift(),
            weak_processing = ?options.weak_processing,
            "binding initialized"
        );
        Ok(Self {
            options,
            upcalls,
            engine,
            codec,
            registry: ThreadRegistry::new(),
            coordinator: Coordinator::new(),
            code_roots: CodeRootTable::new(),
            weak_handles: WeakHandleTable::new(),
            barriers,
            unloading: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &BindingOptions {
        &self.options
    }

    pub fn upcalls(&self) -> &Upcalls {
        &self.upcalls
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn codec(&self) -> PointerCodec {
        self.codec
    }

    pub fn registry(&self) -> &ThreadRegistry<E::Mutator> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn barriers(&self) -> &BarrierEntryPoints<E> {
        &self.barriers
    }

    pub fn generation(&self) -> u64 {
        self.coordinator.generation().current()
    }

    /// Log `violation` and hand it to the host's terminate upcall.
    #[cold]
    pub fn violation(&self, violation: ProtocolViolation) -> ! {
        tracing::error!(target: "gcbridge", %violation, "protocol violation");
        self.upcalls
            .threads()
            .terminate(&format!("protocol violation: {violation}"))
    }

    // Mutator lifecycle

    /// Register the calling thread and bind an allocator for it. The thread
    /// is deregistered when the guard drops.
    pub fn register_mutator(&self, name: Option<String>) -> Result<MutatorGuard<'_, E>, BindingError> {
        let context = self
            .registry
            .register_current(name, |id| self.engine.bind_mutator(id))?;
        Ok(MutatorGuard {
            binding: self,
            id: context.id(),
            _not_send: PhantomData,
        })
    }

    /// Remove the calling thread and destroy its allocator. A thread that
    /// leaves mid-cycle waits in its safe region until the world restarts,
    /// so a collector never sees its state disappear.
    pub fn deregister_mutator(&self) {
        if self.registry.current().is_none() {
            self.violation(ProtocolViolation::UnregisteredThread(
                std::thread::current().id(),
            ));
        }
        let removed = self.coordinator.leave_world(self.upcalls.threads(), || {
            match self.registry.deregister_current() {
                Ok((_, Some(state))) => {
                    self.engine.destroy_mutator(state);
                    Ok(())
                }
                Ok((_, None)) => Ok(()),
                Err(violation) => Err(violation),
            }
        });
        if let Err(violation) = removed {
            self.violation(violation);
        }
    }

    /// Run `f` on the calling thread's allocator state.
    #[inline]
    pub fn with_mutator<R>(&self, f: impl FnOnce(&mut E::Mutator) -> R) -> R {
        // SAFETY: `with_current` only yields the calling thread's own context.
        let result = self
            .registry
            .with_current(|context| unsafe { context.state_mut() }.map(f));
        match result {
            Some(Some(r)) => r,
            _ => {
                let violation = match self.registry.require_mutator() {
                    Err(violation) => violation,
                    Ok(context) => ProtocolViolation::UnknownMutator(context.id()),
                };
                self.violation(violation)
            }
        }
    }

    pub fn mutators(&self) -> Vec<Arc<MutatorContext<E::Mutator>>> {
        self.registry.mutators()
    }

    pub fn mutator_count(&self) -> usize {
        self.registry.mutator_count()
    }

    /// Fulfil an engine request for a collector thread. `kind` is the raw
    /// tag the engine passed: 0 for the controller, 1 for a worker.
    pub fn spawn_gc_thread<H, F>(binding: H, kind: i32, body: F)
    where
        H: Deref<Target = Self> + Send + 'static,
        F: FnOnce(&Self) + Send + 'static,
    {
        let kind = match GcThreadKind::try_from(kind) {
            Ok(kind) => kind,
            Err(_) => binding.violation(ProtocolViolation::UnexpectedThreadKind(kind)),
        };
        let name = binding.registry.record_spawn(kind);
        tracing::debug!(target: "gcbridge", ?kind, thread = %name, "spawning collector thread");

        let upcalls = binding.upcalls.clone();
        let thread_body = Box::new(move || {
            if let Err(violation) = binding.registry.register_collector(kind) {
                binding.violation(violation);
            }
            body(&*binding);
            binding.registry.deregister_collector();
        });
        if let Err(source) = upcalls.threads().spawn_thread(kind, &name, thread_body) {
            let error = BindingError::SpawnFailed { kind, source };
            tracing::error!(target: "gcbridge", %error, "collector thread not started");
            upcalls.threads().terminate(&error.to_string());
        }
    }

    // Handshake

    /// Stop every mutator, then pass each one to `visit` in registration
    /// order. Must be called from a collector thread.
    pub fn stop_all_mutators(
        &self,
        unload_classes: bool,
        mut visit: impl FnMut(&MutatorContext<E::Mutator>),
    ) {
        if let Err(violation) = self.registry.require_collector() {
            self.violation(violation);
        }
        self.unloading.store(unload_classes, Ordering::Release);
        let hooks = self.upcalls.hooks();
        let stopped = self.coordinator.stop_the_world(self.upcalls.threads(), || {
            let epoch = self.code_roots.begin_cycle();
            hooks.code_cache_prologue();
            if unload_classes {
                hooks.clear_claimed_marks();
            }
            hooks.derived_pointers_clear();
            tracing::debug!(target: "gcbridge", epoch, unload_classes, "cycle prologue");
        });
        if let Err(violation) = stopped {
            self.violation(violation);
        }
        for mutator in self.registry.mutators() {
            visit(&mutator);
        }
    }

    /// Run the epilogue and release the mutators. Returns the generation
    /// of the cycle that just completed.
    pub fn resume_mutators(&self) -> u64 {
        if let Err(violation) = self.registry.require_collector() {
            self.violation(violation);
        }
        let hooks = self.upcalls.hooks();
        let resumed = self.coordinator.start_the_world(self.upcalls.threads(), || {
            if self.options.relocate_code {
                for code in self.code_roots.claimed() {
                    hooks.fix_code_relocations(code);
                }
            }
            hooks.code_cache_epilogue();
            hooks.derived_pointers_update();
        });
        self.unloading.store(false, Ordering::Release);
        match resumed {
            Ok(generation) => generation,
            Err(violation) => self.violation(violation),
        }
    }

    /// Whether the cycle in progress was started with class unloading.
    pub fn unloading_this_cycle(&self) -> bool {
        self.unloading.load(Ordering::Acquire)
    }

    pub fn is_world_stopped(&self) -> bool {
        self.coordinator.is_world_stopped()
    }

    /// Park the calling mutator until the collection the engine already
    /// decided on has completed.
    pub fn block_for_gc(&self) -> u64 {
        let mutator = match self.registry.require_mutator() {
            Ok(context) => context.id(),
            Err(violation) => self.violation(violation),
        };
        tracing::debug!(target: "gcbridge", mutator = mutator.as_u64(), "blocking for gc");
        self.coordinator.block_for_gc(self.upcalls.threads(), || {})
    }

    /// Request a collection and wait for it. Returns the generation the
    /// caller woke at, always greater than the one it started at.
    pub fn collect(&self) -> u64 {
        let mutator = match self.registry.require_mutator() {
            Ok(context) => context.id(),
            Err(violation) => self.violation(violation),
        };
        self.coordinator.block_for_gc(self.upcalls.threads(), || {
            self.engine.request_collection(mutator)
        })
    }

    pub fn out_of_memory(&self, kind: OutOfMemory) {
        match kind {
            OutOfMemory::Heap => {
                tracing::debug!(target: "gcbridge", "heap exhausted; allocation returns null");
            }
            OutOfMemory::AddressSpace => {
                tracing::error!(target: "gcbridge", "address space exhausted");
                self.upcalls.threads().terminate(ADDRESS_SPACE_EXHAUSTED)
            }
        }
    }

    // Barriers

    pub fn write_pre(&self, src: ObjectReference, slot: RefSlot, target: Option<ObjectReference>) {
        let write_pre = self.barriers.write_pre;
        self.with_mutator(|m| write_pre(&self.engine, m, src, slot, target))
    }

    pub fn write_post(&self, src: ObjectReference, slot: RefSlot, target: Option<ObjectReference>) {
        let write_post = self.barriers.write_post;
        self.with_mutator(|m| write_post(&self.engine, m, src, slot, target))
    }

    pub fn write_slow(&self, src: ObjectReference, slot: RefSlot, target: Option<ObjectReference>) {
        let write_slow = self.barriers.write_slow;
        self.with_mutator(|m| write_slow(&self.engine, m, src, slot, target))
    }

    pub fn array_copy_pre(&self, src: SlotRange, dst: SlotRange) {
        let pre = self.barriers.array_copy_pre;
        self.with_mutator(|m| pre(&self.engine, m, src, dst))
    }

    pub fn array_copy_post(&self, src: SlotRange, dst: SlotRange) {
        let post = self.barriers.array_copy_post;
        self.with_mutator(|m| post(&self.engine, m, src, dst))
    }

    /// A barriered reference store as `tier` performs it. Compiled tiers use
    /// the inlined store; the interpreter goes through the out-of-line
    /// entry points. Both apply the same elision test.
    pub fn store_reference(
        &self,
        tier: CompilerTier,
        decorators: Decorators,
        src: ObjectReference,
        slot: RefSlot,
        operand: StoreOperand,
    ) {
        tracing::trace!(target: "gcbridge", ?tier, ?slot, "reference store");
        if tier.inlines_fast_path() {
            let store = self.barriers.store;
            return self.with_mutator(|m| {
                store(&self.engine, m, &self.codec, decorators, src, slot, operand)
            });
        }
        let value = operand.value();
        if self.barriers.can_elide(decorators, operand) {
            raw_store(&self.codec, slot, value);
            return;
        }
        if !decorators.contains(Decorators::AS_NO_KEEPALIVE) {
            self.write_pre(src, slot, value);
        }
        let stored = raw_store(&self.codec, slot, value);
        self.write_post(src, slot, stored.decompress(&self.codec));
    }

    pub fn copy_references(&self, decorators: Decorators, src: SlotRange, dst: SlotRange) {
        let copy = self.barriers.copy;
        self.with_mutator(|m| copy(&self.engine, m, decorators, src, dst))
    }

    // Roots

    pub fn roots(&self) -> RootScanner<'_, E::Mutator> {
        RootScanner::new(
            &self.upcalls,
            &self.registry,
            &self.code_roots,
            &self.weak_handles,
            &self.options,
        )
    }

    pub fn code_roots(&self) -> &CodeRootTable {
        &self.code_roots
    }

    pub fn register_code_roots(&self, code: CodeId, slots: impl IntoIterator<Item = RefSlot>) {
        self.code_roots.register(code, slots)
    }

    pub fn unregister_code(&self, code: CodeId) -> bool {
        self.code_roots.unregister(code)
    }

    /// Track a weak handle. It is updated after every cycle, and cleared
    /// once its referent dies, until [`Binding::unregister_weak_handle`].
    pub fn register_weak_handle(&self, slot: RefSlot) {
        self.weak_handles.register(slot)
    }

    pub fn unregister_weak_handle(&self, slot: RefSlot) -> bool {
        self.weak_handles.unregister(slot)
    }

    pub fn weak_handles(&self) -> &WeakHandleTable {
        &self.weak_handles
    }

    // Objects

    pub fn scan_object(&self, object: ObjectReference, visitor: &mut dyn SlotVisitor) {
        self.upcalls.objects().scan_object(object, visitor)
    }

    pub fn object_size(&self, object: ObjectReference) -> usize {
        self.upcalls.objects().object_size(object)
    }

    pub fn dump_object(&self, object: ObjectReference) -> String {
        self.upcalls.objects().dump_object(object)
    }

    pub fn class_name(&self, object: ObjectReference) -> Option<String> {
        self.upcalls.objects().class_name(object)
    }

    pub fn layout(&self) -> &LayoutOffsets {
        self.upcalls.layout()
    }

    /// Static reference fields of a class mirror, narrow when pointers are
    /// compressed.
    pub fn static_reference_slots(&self, mirror: ObjectReference) -> SlotRange {
        self.layout()
            .static_reference_slots(mirror, self.options.compressed_pointers)
    }

    // Weak references

    pub fn weak_processor(&self, mode: WeakProcessingMode) -> WeakProcessor<'_, E> {
        WeakProcessor::new(&self.engine, self.codec, mode)
    }

    /// Update every entry of the host's weak storage and every registered
    /// weak handle: forwarded referents are rewritten, dead ones cleared.
    pub fn update_weak_processor(&self, mode: WeakProcessingMode) -> WeakUpdateStats {
        let mut sink = VecSink::with_capacity(self.options.root_buffer_capacity);
        self.roots()
            .scan_weak_processor_roots(&mut sink, crate::upcalls::LiveFilter::All);
        let handles = self.weak_handles.registered();
        self.weak_processor(mode)
            .update_all(sink.slots().chain(handles))
    }

    /// Let the host unload classes whose loaders died, then null out weak
    /// class-loader edges to dead objects.
    pub fn unload_classes(&self) -> WeakUpdateStats {
        let weak = self.weak_processor(self.options.weak_processing);
        self.upcalls
            .hooks()
            .unload_classes(&|object: ObjectReference| weak.is_alive(object));
        let mut weak_edges = VecSink::with_capacity(self.options.root_buffer_capacity);
        self.roots().scan_class_loader_graph_roots(
            &mut DiscardSink,
            &mut weak_edges,
            ClassLoaderScan::LiveFiltered,
        );
        weak.update_all(weak_edges.slots())
    }

    pub fn reference_fields(&self) -> ReferenceFields {
        ReferenceFields::new(
            self.upcalls.layout(),
            self.options.compressed_pointers,
            self.codec,
        )
    }

    pub fn enqueue_references(&self, refs: &[ObjectReference]) -> usize {
        self.reference_fields().enqueue(refs, self.upcalls.hooks())
    }
}

/// Keeps the calling thread registered as a mutator. Not `Send`: it must
/// be dropped on the thread that created it.
pub struct MutatorGuard<'b, E: GcEngine> {
    binding: &'b Binding<E>,
    id: MutatorId,
    _not_send: PhantomData<*const ()>,
}

impl<E: GcEngine> MutatorGuard<'_, E> {
    pub fn id(&self) -> MutatorId {
        self.id
    }
}

impl<E: GcEngine> Drop for MutatorGuard<'_, E> {
    fn drop(&mut self) {
        self.binding.deregister_mutator();
    }
}
