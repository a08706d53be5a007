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

//! In-process stand-ins for both sides of the binding.
//!
//! [`SimRuntime`] plays the host: a bump-allocated heap, root tables per
//! category, and a safepoint monitor that parks mutators when asked.
//! [`SimEngine`] plays the collector: it records barrier traffic and runs
//! a non-moving mark-sweep cycle through the binding's own entry points.

use crate::binding::Binding;
use crate::closure::{SlotVisitor, VecSink};
use crate::engine::GcEngine;
use crate::handshake::Monitor;
use crate::roots::{CodeId, RootCategory};
use crate::slot::{PointerCodec, RefSlot, SlotRange, field_slot};
use crate::threads::MutatorId;
use crate::upcalls::{
    ClassLoaderScan, CycleHooks, LayoutQueries, LiveFilter, ObjectIntrospection, RootEnumeration,
    ThreadControl,
};
use crate::weak::ForwardingWord;
use mmtk::util::{Address, ObjectReference};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::ThreadId;

/// Route `tracing` output through the test harness. Filtered by
/// `GCBRIDGE_LOG`, silent by default. Safe to call from every test.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_env("GCBRIDGE_LOG")
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("off"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

const HEAP_WORDS: usize = 1 << 20;
const HEADER_WORDS: usize = 2;
pub const REFERENT_OFFSET: usize = 16;
pub const DISCOVERED_OFFSET: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimKind {
    Plain,
    /// Referent at 16 (weak), discovered at 24 (strong).
    Reference,
}

#[derive(Debug, Clone, Copy)]
struct SimObject {
    fields: usize,
    kind: SimKind,
    freed: bool,
}

struct Arena {
    words: NonNull<u64>,
    len: usize,
    next: AtomicUsize,
    objects: Mutex<BTreeMap<usize, SimObject>>,
}

// SAFETY: the arena is plain memory; object metadata is behind a lock and
// slot contents are only raced by tests that synchronize on the handshake.
unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Drop for Arena {
    fn drop(&mut self) {
        let slice = std::ptr::slice_from_raw_parts_mut(self.words.as_ptr(), self.len);
        // SAFETY: produced by `Box::leak` in `SimHeap::new` with this length.
        drop(unsafe { Box::from_raw(slice) });
    }
}

/// Bump-pointer heap. Word 0 of every object is the header, word 1 its
/// class tag, fields follow. Memory is never reused, so a swept object
/// stays readable and [`SimHeap::is_freed`] can tell it was collected.
#[derive(Clone)]
pub struct SimHeap {
    arena: Arc<Arena>,
}

impl Default for SimHeap {
    fn default() -> Self {
        Self::new()
    }
}

impl SimHeap {
    pub fn new() -> Self {
        let words: &mut [u64] = Box::leak(vec![0u64; HEAP_WORDS].into_boxed_slice());
        Self {
            arena: Arc::new(Arena {
                words: NonNull::from(&mut words[0]),
                len: HEAP_WORDS,
                next: AtomicUsize::new(0),
                objects: Mutex::new(BTreeMap::new()),
            }),
        }
    }

    pub fn start(&self) -> Address {
        Address::from_ptr(self.arena.words.as_ptr())
    }

    pub fn end(&self) -> Address {
        self.start() + HEAP_WORDS * 8
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.start() && addr < self.end()
    }

    fn alloc_kind(&self, fields: usize, kind: SimKind) -> ObjectReference {
        let words = HEADER_WORDS + fields;
        let index = self.arena.next.fetch_add(words, Ordering::Relaxed);
        assert!(index + words <= HEAP_WORDS, "sim heap exhausted");
        let addr = self.start() + index * 8;
        // SAFETY: freshly bumped, in bounds and word aligned.
        unsafe { (addr + 8usize).store::<usize>(kind as usize) };
        self.arena.objects.lock().insert(
            addr.as_usize(),
            SimObject {
                fields,
                kind,
                freed: false,
            },
        );
        ObjectReference::from_raw_address(addr).expect("arena addresses are non-zero")
    }

    pub fn alloc(&self, fields: usize) -> ObjectReference {
        self.alloc_kind(fields, SimKind::Plain)
    }

    pub fn alloc_reference(&self, referent: Option<ObjectReference>) -> ObjectReference {
        let reference = self.alloc_kind(2, SimKind::Reference);
        field_slot(reference, REFERENT_OFFSET, false).store_with(&PointerCodec::IDENTITY, referent);
        reference
    }

    fn object(&self, object: ObjectReference) -> Option<SimObject> {
        self.arena
            .objects
            .lock()
            .get(&object.to_raw_address().as_usize())
            .copied()
    }

    pub fn kind(&self, object: ObjectReference) -> Option<SimKind> {
        self.object(object).map(|o| o.kind)
    }

    /// Strong reference fields of `object`.
    pub fn strong_fields(&self, object: ObjectReference) -> Vec<RefSlot> {
        match self.object(object) {
            Some(SimObject {
                kind: SimKind::Reference,
                ..
            }) => vec![field_slot(object, DISCOVERED_OFFSET, false)],
            Some(o) => (0..o.fields)
                .map(|i| field_slot(object, 16 + i * 8, false))
                .collect(),
            None => Vec::new(),
        }
    }

    pub fn size_of(&self, object: ObjectReference) -> usize {
        self.object(object)
            .map_or(0, |o| (HEADER_WORDS + o.fields) * 8)
    }

    /// Install a forwarding header on `from` pointing at `to`.
    pub fn forward(&self, from: ObjectReference, to: ObjectReference) {
        // SAFETY: `from` is an object of this heap.
        unsafe {
            from.to_raw_address()
                .store::<usize>(ForwardingWord::forwarded_to(to).to_raw())
        };
    }

    pub fn new_cell(&self, object: Option<ObjectReference>) -> RootCell {
        let cell = RootCell(Arc::new(AtomicUsize::new(0)));
        cell.set(object);
        cell
    }

    pub fn is_freed(&self, object: ObjectReference) -> bool {
        self.object(object).is_none_or(|o| o.freed)
    }

    pub fn live_objects(&self) -> usize {
        self.arena
            .objects
            .lock()
            .values()
            .filter(|o| !o.freed)
            .count()
    }

    /// Live reference objects, in allocation order.
    pub fn references(&self) -> Vec<ObjectReference> {
        self.arena
            .objects
            .lock()
            .iter()
            .filter(|(_, o)| o.kind == SimKind::Reference && !o.freed)
            .filter_map(|(addr, _)| {
                // SAFETY: keys are object addresses.
                ObjectReference::from_raw_address(unsafe { Address::from_usize(*addr) })
            })
            .collect()
    }

    /// Free every object `is_live` rejects. Returns how many were freed.
    pub fn sweep(&self, is_live: impl Fn(ObjectReference) -> bool) -> usize {
        let mut freed = 0;
        for (addr, object) in self.arena.objects.lock().iter_mut() {
            if object.freed {
                continue;
            }
            // SAFETY: keys are object addresses.
            let Some(reference) = ObjectReference::from_raw_address(unsafe { Address::from_usize(*addr) })
            else {
                continue;
            };
            if !is_live(reference) {
                object.freed = true;
                freed += 1;
            }
        }
        freed
    }
}

/// An off-heap reference location with a stable address.
#[derive(Debug, Clone)]
pub struct RootCell(Arc<AtomicUsize>);

impl RootCell {
    pub fn slot(&self) -> RefSlot {
        RefSlot::wide(Address::from_ptr(self.0.as_ptr()))
    }

    pub fn get(&self) -> Option<ObjectReference> {
        self.slot().load_with(&PointerCodec::IDENTITY)
    }

    pub fn set(&self, object: Option<ObjectReference>) {
        self.slot().store_with(&PointerCodec::IDENTITY, object)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookEvent {
    CodeCachePrologue,
    CodeCacheEpilogue,
    ClearClaimedMarks,
    DerivedPointersClear,
    DerivedPointersUpdate,
    FixRelocations(CodeId),
    UnloadClasses,
}

/// Threads running managed code, and those of them parked in a safe region.
#[derive(Debug, Default)]
struct Safepoint {
    requested: bool,
    attached: HashSet<ThreadId>,
    parked: HashSet<ThreadId>,
}

impl Safepoint {
    fn all_parked(&self) -> bool {
        self.attached.is_subset(&self.parked)
    }
}

/// The host side.
pub struct SimRuntime {
    heap: SimHeap,
    safepoint: Monitor<Safepoint>,
    roots: Mutex<HashMap<RootCategory, Vec<RootCell>>>,
    stacks: Mutex<BTreeMap<MutatorId, Vec<RootCell>>>,
    thread_code: Mutex<BTreeMap<MutatorId, Vec<CodeId>>>,
    cld_edges: Mutex<Vec<(bool, RootCell)>>,
    hook_events: Mutex<Vec<HookEvent>>,
    unloaded_checks: Mutex<Vec<(ObjectReference, bool)>>,
    pending: Mutex<Option<ObjectReference>>,
    finalizer_runs: AtomicUsize,
}

impl Default for SimRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl SimRuntime {
    pub fn new() -> Self {
        Self {
            heap: SimHeap::new(),
            safepoint: Monitor::new(Safepoint::default()),
            roots: Mutex::new(HashMap::new()),
            stacks: Mutex::new(BTreeMap::new()),
            thread_code: Mutex::new(BTreeMap::new()),
            cld_edges: Mutex::new(Vec::new()),
            hook_events: Mutex::new(Vec::new()),
            unloaded_checks: Mutex::new(Vec::new()),
            pending: Mutex::new(None),
            finalizer_runs: AtomicUsize::new(0),
        }
    }

    pub fn heap(&self) -> &SimHeap {
        &self.heap
    }

    pub fn new_cell(&self, object: Option<ObjectReference>) -> RootCell {
        self.heap.new_cell(object)
    }

    pub fn add_root(&self, category: RootCategory, object: Option<ObjectReference>) -> RootCell {
        let cell = self.new_cell(object);
        self.roots
            .lock()
            .entry(category)
            .or_default()
            .push(cell.clone());
        cell
    }

    pub fn add_stack_root(&self, mutator: MutatorId, object: Option<ObjectReference>) -> RootCell {
        let cell = self.new_cell(object);
        self.stacks
            .lock()
            .entry(mutator)
            .or_default()
            .push(cell.clone());
        cell
    }

    pub fn add_thread_code(&self, mutator: MutatorId, code: CodeId) {
        self.thread_code
            .lock()
            .entry(mutator)
            .or_default()
            .push(code);
    }

    pub fn add_cld_edge(&self, weak: bool, object: Option<ObjectReference>) -> RootCell {
        let cell = self.new_cell(object);
        self.cld_edges.lock().push((weak, cell.clone()));
        cell
    }

    pub fn hook_events(&self) -> Vec<HookEvent> {
        self.hook_events.lock().clone()
    }

    pub fn unloaded_checks(&self) -> Vec<(ObjectReference, bool)> {
        self.unloaded_checks.lock().clone()
    }

    pub fn pending_head(&self) -> Option<ObjectReference> {
        *self.pending.lock()
    }

    pub fn finalizer_runs(&self) -> usize {
        self.finalizer_runs.load(Ordering::SeqCst)
    }

    pub fn world_stopped(&self) -> bool {
        self.safepoint.lock().requested
    }

    /// The calling thread starts running managed code. Waits out a stop.
    pub fn attach_mutator(&self) {
        let mut safepoint = self.safepoint.wait_until(|s| !s.requested);
        safepoint.attached.insert(std::thread::current().id());
    }

    /// Leaving managed code counts as reaching a safe point.
    pub fn detach_mutator(&self) {
        let thread = std::thread::current().id();
        self.safepoint.update(|s| s.attached.remove(&thread));
    }

    /// Park here if a stop has been requested.
    pub fn safepoint_poll(&self) {
        if self.safepoint.lock().requested {
            self.enter_safe_region();
            self.leave_safe_region();
        }
    }

    fn record(&self, event: HookEvent) {
        self.hook_events.lock().push(event);
    }

    fn visit_category(&self, category: RootCategory, visitor: &mut dyn SlotVisitor) {
        let cells = self.roots.lock().get(&category).cloned().unwrap_or_default();
        for cell in cells {
            visitor.visit_slot(cell.slot());
        }
    }
}

impl ThreadControl for SimRuntime {
    fn suspend_all(&self) {
        self.safepoint.update(|s| s.requested = true);
        drop(self.safepoint.wait_until(Safepoint::all_parked));
    }

    fn resume_all(&self) {
        self.safepoint.update(|s| s.requested = false);
    }

    fn enter_safe_region(&self) {
        let thread = std::thread::current().id();
        self.safepoint.update(|s| s.parked.insert(thread));
    }

    fn leave_safe_region(&self) {
        {
            let mut safepoint = self.safepoint.wait_until(|s| !s.requested);
            safepoint.parked.remove(&std::thread::current().id());
        }
        self.safepoint.notify_all();
    }

    fn terminate(&self, reason: &str) -> ! {
        panic!("{reason}")
    }
}

impl RootEnumeration for SimRuntime {
    fn thread_stack(&self, mutator: MutatorId, visitor: &mut dyn SlotVisitor) {
        let cells = self.stacks.lock().get(&mutator).cloned().unwrap_or_default();
        for cell in cells {
            visitor.visit_slot(cell.slot());
        }
    }

    fn thread_code(&self, mutator: MutatorId, code: &mut dyn FnMut(CodeId)) {
        let blobs = self
            .thread_code
            .lock()
            .get(&mutator)
            .cloned()
            .unwrap_or_default();
        for blob in blobs {
            code(blob);
        }
    }

    fn vm_threads(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::VmThreads, visitor)
    }

    fn universe(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::Universe, visitor)
    }

    fn jni_handles(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::JniHandles, visitor)
    }

    fn object_synchronizer(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::ObjectSynchronizer, visitor)
    }

    fn management(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::Management, visitor)
    }

    fn jvmti_export(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::JvmtiExport, visitor)
    }

    fn aot_loader(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::AotLoader, visitor)
    }

    fn system_dictionary(&self, visitor: &mut dyn SlotVisitor) {
        self.visit_category(RootCategory::SystemDictionary, visitor)
    }

    fn string_table(&self, visitor: &mut dyn SlotVisitor, _filter: LiveFilter) {
        self.visit_category(RootCategory::StringTable, visitor)
    }

    fn class_loader_graph(
        &self,
        strong: &mut dyn SlotVisitor,
        weak: &mut dyn SlotVisitor,
        _policy: ClassLoaderScan,
    ) {
        let edges = self.cld_edges.lock().clone();
        for (is_weak, cell) in edges {
            if is_weak {
                weak.visit_slot(cell.slot());
            } else {
                strong.visit_slot(cell.slot());
            }
        }
    }

    fn weak_processor(&self, visitor: &mut dyn SlotVisitor, _filter: LiveFilter) {
        self.visit_category(RootCategory::WeakProcessor, visitor)
    }
}

impl ObjectIntrospection for SimRuntime {
    fn scan_object(&self, object: ObjectReference, visitor: &mut dyn SlotVisitor) {
        for slot in self.heap.strong_fields(object) {
            visitor.visit_slot(slot);
        }
    }

    fn object_size(&self, object: ObjectReference) -> usize {
        self.heap.size_of(object)
    }

    fn dump_object(&self, object: ObjectReference) -> String {
        format!(
            "{:?}@{} size={}",
            self.heap.kind(object),
            object.to_raw_address(),
            self.heap.size_of(object)
        )
    }

    fn class_name(&self, object: ObjectReference) -> Option<String> {
        self.heap.kind(object).map(|kind| format!("{kind:?}"))
    }
}

impl CycleHooks for SimRuntime {
    fn code_cache_prologue(&self) {
        self.record(HookEvent::CodeCachePrologue)
    }

    fn code_cache_epilogue(&self) {
        self.record(HookEvent::CodeCacheEpilogue)
    }

    fn clear_claimed_marks(&self) {
        self.record(HookEvent::ClearClaimedMarks)
    }

    fn derived_pointers_clear(&self) {
        self.record(HookEvent::DerivedPointersClear)
    }

    fn derived_pointers_update(&self) {
        self.record(HookEvent::DerivedPointersUpdate)
    }

    fn fix_code_relocations(&self, code: CodeId) {
        self.record(HookEvent::FixRelocations(code))
    }

    fn schedule_finalizer(&self) {
        self.finalizer_runs.fetch_add(1, Ordering::SeqCst);
    }

    fn unload_classes(&self, is_alive: &dyn Fn(ObjectReference) -> bool) {
        self.record(HookEvent::UnloadClasses);
        let edges = self.cld_edges.lock().clone();
        let mut checks = self.unloaded_checks.lock();
        for (_, cell) in edges.iter().filter(|(weak, _)| *weak) {
            if let Some(object) = cell.get() {
                checks.push((object, is_alive(object)));
            }
        }
    }

    fn swap_reference_pending_list(
        &self,
        head: Option<ObjectReference>,
    ) -> Option<ObjectReference> {
        std::mem::replace(&mut *self.pending.lock(), head)
    }
}

impl LayoutQueries for SimRuntime {
    fn referent_offset(&self) -> i64 {
        REFERENT_OFFSET as i64
    }

    fn discovered_offset(&self) -> i64 {
        DISCOVERED_OFFSET as i64
    }

    fn class_klass_offset(&self) -> i64 {
        8
    }

    fn class_loader_data_offset(&self) -> i64 {
        8
    }

    fn static_fields_offset(&self) -> i64 {
        24
    }

    fn static_oop_field_count_offset(&self) -> i64 {
        16
    }

    fn layout_checksum(&self) -> u64 {
        0x5eed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BarrierEvent {
    Pre {
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    },
    Post {
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    },
    ArrayCopyPre {
        src: SlotRange,
        dst: SlotRange,
    },
    ArrayCopyPost {
        src: SlotRange,
        dst: SlotRange,
    },
}

#[derive(Debug)]
pub struct SimMutator {
    pub id: MutatorId,
    pub stores: usize,
}

#[derive(Debug, Default)]
struct Control {
    requested: bool,
    shutdown: bool,
    running: bool,
}

/// The engine side: a non-moving mark-sweep collector over [`SimHeap`].
pub struct SimEngine {
    heap: Option<SimHeap>,
    marks: Mutex<HashSet<ObjectReference>>,
    logged: Mutex<HashSet<ObjectReference>>,
    events: Mutex<Vec<BarrierEvent>>,
    old_values: Mutex<Vec<Option<ObjectReference>>>,
    bound: Mutex<Vec<MutatorId>>,
    destroyed: AtomicUsize,
    control: Monitor<Control>,
    cycles: AtomicUsize,
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SimEngine {
    /// An engine with no heap of its own. Barrier hooks never read slots.
    pub fn new() -> Self {
        Self::build(None)
    }

    pub fn with_heap(heap: SimHeap) -> Self {
        Self::build(Some(heap))
    }

    fn build(heap: Option<SimHeap>) -> Self {
        Self {
            heap,
            marks: Mutex::new(HashSet::new()),
            logged: Mutex::new(HashSet::new()),
            events: Mutex::new(Vec::new()),
            old_values: Mutex::new(Vec::new()),
            bound: Mutex::new(Vec::new()),
            destroyed: AtomicUsize::new(0),
            control: Monitor::new(Control::default()),
            cycles: AtomicUsize::new(0),
        }
    }

    /// Mutator state for driving barriers without a binding.
    pub fn detached_mutator(&self) -> SimMutator {
        SimMutator {
            id: MutatorId::from_u64(0),
            stores: 0,
        }
    }

    pub fn mark(&self, object: ObjectReference) {
        self.marks.lock().insert(object);
    }

    pub fn set_logged(&self, object: ObjectReference) {
        self.logged.lock().insert(object);
    }

    pub fn barrier_events(&self) -> Vec<BarrierEvent> {
        self.events.lock().clone()
    }

    pub fn old_values_seen(&self) -> Vec<Option<ObjectReference>> {
        self.old_values.lock().clone()
    }

    pub fn bound_mutators(&self) -> Vec<MutatorId> {
        self.bound.lock().clone()
    }

    pub fn destroyed_mutators(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    pub fn cycles(&self) -> usize {
        self.cycles.load(Ordering::SeqCst)
    }

    fn in_heap(&self, addr: Address) -> bool {
        self.heap.as_ref().is_some_and(|heap| heap.contains(addr))
    }

    /// Spawn the controller thread through the binding. It runs one cycle
    /// per batch of requests until [`SimEngine::shutdown`].
    pub fn start_controller(binding: Arc<Binding<SimEngine>>) {
        binding.engine().control.update(|c| c.running = true);
        Binding::spawn_gc_thread(binding, 0, |binding| {
            while binding.engine().wait_for_request() {
                binding.engine().run_cycle(binding);
            }
            binding.engine().control.update(|c| c.running = false);
        });
    }

    /// Stop the controller and wait until any cycle in flight is done.
    pub fn shutdown(&self) {
        self.control.update(|c| c.shutdown = true);
        drop(self.control.wait_until(|c| !c.running));
    }

    fn wait_for_request(&self) -> bool {
        let mut control = self.control.wait_until(|c| c.requested || c.shutdown);
        if control.shutdown {
            return false;
        }
        control.requested = false;
        true
    }

    /// One stop-the-world mark-sweep cycle. Must run on a collector thread.
    pub fn run_cycle(&self, binding: &Binding<SimEngine>) -> u64 {
        let options = binding.options();
        let codec = binding.codec();
        self.marks.lock().clear();
        binding.stop_all_mutators(options.class_unloading, |_| {});

        let scanned = binding
            .roots()
            .scan_categories(RootCategory::strong(options.weak_processing), |_| {
                VecSink::with_capacity(options.root_buffer_capacity)
            });
        let scanned = match scanned {
            Ok(scanned) => scanned,
            Err(violation) => binding.violation(violation),
        };

        {
            let mut marks = self.marks.lock();
            let mut work = Vec::new();
            for (_, sink) in &scanned {
                for slot in sink.slots() {
                    if let Some(object) = slot.load_with(&codec) {
                        if marks.insert(object) {
                            work.push(object);
                        }
                    }
                }
            }
            while let Some(object) = work.pop() {
                binding.scan_object(object, &mut |slot: RefSlot| {
                    if let Some(child) = slot.load_with(&codec) {
                        if marks.insert(child) {
                            work.push(child);
                        }
                    }
                });
            }
        }

        // Reference objects that survived but whose referent did not.
        let fields = binding.reference_fields();
        let dead_referents: Vec<_> = self
            .heap
            .iter()
            .flat_map(|heap| heap.references())
            .filter(|r| self.is_live(*r))
            .filter(|r| fields.get_referent(*r).is_some_and(|o| !self.is_live(o)))
            .collect();
        for reference in &dead_referents {
            fields.clear_referent(*reference);
        }
        binding.enqueue_references(&dead_referents);

        binding.update_weak_processor(options.weak_processing);
        if binding.unloading_this_cycle() {
            binding.unload_classes();
        }
        let freed = self
            .heap
            .as_ref()
            .map_or(0, |heap| heap.sweep(|o| self.is_live(o)));
        let generation = binding.resume_mutators();
        self.cycles.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(target: "gcbridge", generation, freed, "sim cycle complete");
        generation
    }
}

impl GcEngine for SimEngine {
    type Mutator = SimMutator;

    fn bind_mutator(&self, id: MutatorId) -> SimMutator {
        self.bound.lock().push(id);
        SimMutator { id, stores: 0 }
    }

    fn destroy_mutator(&self, mutator: SimMutator) {
        let _ = mutator;
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }

    fn object_reference_write_pre(
        &self,
        mutator: &mut SimMutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        mutator.stores += 1;
        if !slot.is_narrow() && self.in_heap(slot.address()) {
            self.old_values
                .lock()
                .push(slot.load_with(&PointerCodec::IDENTITY));
        }
        self.events
            .lock()
            .push(BarrierEvent::Pre { src, slot, target });
    }

    fn object_reference_write_post(
        &self,
        mutator: &mut SimMutator,
        src: ObjectReference,
        slot: RefSlot,
        target: Option<ObjectReference>,
    ) {
        mutator.stores += 1;
        self.events
            .lock()
            .push(BarrierEvent::Post { src, slot, target });
    }

    fn array_copy_pre(&self, _mutator: &mut SimMutator, src: SlotRange, dst: SlotRange) {
        self.events
            .lock()
            .push(BarrierEvent::ArrayCopyPre { src, dst });
    }

    fn array_copy_post(&self, _mutator: &mut SimMutator, src: SlotRange, dst: SlotRange) {
        self.events
            .lock()
            .push(BarrierEvent::ArrayCopyPost { src, dst });
    }

    fn request_collection(&self, requester: MutatorId) {
        tracing::trace!(target: "gcbridge", requester = requester.as_u64(), "sim collection requested");
        self.control.update(|c| c.requested = true);
    }

    fn is_live(&self, object: ObjectReference) -> bool {
        self.marks.lock().contains(&object)
    }

    fn forwarded(&self, object: ObjectReference) -> Option<ObjectReference> {
        if self.in_heap(object.to_raw_address()) {
            ForwardingWord::load(object).target()
        } else {
            None
        }
    }

    fn heap_range(&self) -> Option<(Address, Address)> {
        self.heap.as_ref().map(|heap| (heap.start(), heap.end()))
    }

    fn object_is_unlogged(&self, object: ObjectReference) -> bool {
        !self.logged.lock().contains(&object)
    }
}
