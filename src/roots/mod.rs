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

//! Root scanning dispatch.
//!
//! One entry point per [`RootCategory`]. Each walks a host structure through
//! the upcall table and feeds slots to a [`SlotSink`] through a
//! [`RootsClosure`], so no category needs its roots to fit one buffer.
//! Categories are independent of each other and may be scanned in
//! parallel; within a category the traversal order is fixed.

mod code_cache;
mod weak_handles;

pub use code_cache::{CodeId, CodeRootTable};
pub use weak_handles::WeakHandleTable;

use crate::closure::{DiscardSink, RootsClosure, SlotSink, SlotVisitor};
use crate::config::{BindingOptions, WeakProcessingMode};
use crate::error::ProtocolViolation;
use crate::slot::RefSlot;
use crate::threads::{MutatorId, ThreadRegistry};
use crate::upcalls::{ClassLoaderScan, LiveFilter, Upcalls};
use rayon::prelude::*;
use std::cell::RefCell;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RootCategory {
    ThreadStacks,
    VmThreads,
    Universe,
    JniHandles,
    ObjectSynchronizer,
    Management,
    JvmtiExport,
    AotLoader,
    SystemDictionary,
    CodeCache,
    StringTable,
    ClassLoaderGraph,
    WeakProcessor,
}

impl RootCategory {
    pub const ALL: [RootCategory; 13] = [
        RootCategory::ThreadStacks,
        RootCategory::VmThreads,
        RootCategory::Universe,
        RootCategory::JniHandles,
        RootCategory::ObjectSynchronizer,
        RootCategory::Management,
        RootCategory::JvmtiExport,
        RootCategory::AotLoader,
        RootCategory::SystemDictionary,
        RootCategory::CodeCache,
        RootCategory::StringTable,
        RootCategory::ClassLoaderGraph,
        RootCategory::WeakProcessor,
    ];

    /// Categories that keep objects alive for a cycle. Weak-processor
    /// entries are only roots for reference-counting collection, where
    /// nursery weak referents must survive until their counts are known.
    pub fn strong(mode: WeakProcessingMode) -> &'static [RootCategory] {
        match mode {
            WeakProcessingMode::Tracing => &Self::ALL[..12],
            WeakProcessingMode::ReferenceCounting => &Self::ALL,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            RootCategory::ThreadStacks => "thread_stacks",
            RootCategory::VmThreads => "vm_threads",
            RootCategory::Universe => "universe",
            RootCategory::JniHandles => "jni_handles",
            RootCategory::ObjectSynchronizer => "object_synchronizer",
            RootCategory::Management => "management",
            RootCategory::JvmtiExport => "jvmti_export",
            RootCategory::AotLoader => "aot_loader",
            RootCategory::SystemDictionary => "system_dictionary",
            RootCategory::CodeCache => "code_cache",
            RootCategory::StringTable => "string_table",
            RootCategory::ClassLoaderGraph => "class_loader_graph",
            RootCategory::WeakProcessor => "weak_processor",
        }
    }
}

/// Which mutators a thread-stack scan covers.
#[derive(Debug, Clone, Copy)]
pub enum ThreadSelector<'a> {
    All,
    One(MutatorId),
    Subset(&'a [MutatorId]),
}

macro_rules! simple_root_scans {
    ($($category:ident => $walker:ident),* $(,)?) => {
        paste::paste! {
            $(
                #[doc = concat!("Report the host's `", stringify!($walker), "` roots.")]
                pub fn [<scan_ $walker _roots>](&self, sink: &mut dyn SlotSink) -> usize {
                    let mut closure = RootsClosure::new(sink);
                    self.upcalls.roots().$walker(&mut closure);
                    let slots = closure.finish();
                    log_scan(RootCategory::$category, slots);
                    slots
                }
            )*
        }
    };
}

fn log_scan(category: RootCategory, slots: usize) {
    tracing::debug!(target: "gcbridge", category = category.name(), slots, "roots scanned");
}

/// A view over the binding's root sources for one scan request.
pub struct RootScanner<'a, M> {
    upcalls: &'a Upcalls,
    registry: &'a ThreadRegistry<M>,
    code_roots: &'a CodeRootTable,
    weak_handles: &'a WeakHandleTable,
    options: &'a BindingOptions,
}

impl<'a, M: Send + 'static> RootScanner<'a, M> {
    pub fn new(
        upcalls: &'a Upcalls,
        registry: &'a ThreadRegistry<M>,
        code_roots: &'a CodeRootTable,
        weak_handles: &'a WeakHandleTable,
        options: &'a BindingOptions,
    ) -> Self {
        Self {
            upcalls,
            registry,
            code_roots,
            weak_handles,
            options,
        }
    }

    simple_root_scans! {
        VmThreads => vm_threads,
        Universe => universe,
        JniHandles => jni_handles,
        ObjectSynchronizer => object_synchronizer,
        Management => management,
        JvmtiExport => jvmti_export,
        AotLoader => aot_loader,
        SystemDictionary => system_dictionary,
    }

    /// Filter the configured collector wants for weak-table categories.
    pub fn default_filter(&self) -> LiveFilter {
        match self.options.weak_processing {
            WeakProcessingMode::Tracing => LiveFilter::All,
            WeakProcessingMode::ReferenceCounting => LiveFilter::NonStuckOnly,
        }
    }

    /// Scan one category with the configured policy.
    pub fn scan(
        &self,
        category: RootCategory,
        sink: &mut dyn SlotSink,
    ) -> Result<usize, ProtocolViolation> {
        let filter = self.default_filter();
        let slots = match category {
            RootCategory::ThreadStacks => self.scan_thread_roots(ThreadSelector::All, sink)?,
            RootCategory::VmThreads => self.scan_vm_threads_roots(sink),
            RootCategory::Universe => self.scan_universe_roots(sink),
            RootCategory::JniHandles => self.scan_jni_handles_roots(sink),
            RootCategory::ObjectSynchronizer => self.scan_object_synchronizer_roots(sink),
            RootCategory::Management => self.scan_management_roots(sink),
            RootCategory::JvmtiExport => self.scan_jvmti_export_roots(sink),
            RootCategory::AotLoader => self.scan_aot_loader_roots(sink),
            RootCategory::SystemDictionary => self.scan_system_dictionary_roots(sink),
            RootCategory::CodeCache => self.scan_code_cache_roots(sink),
            RootCategory::StringTable => self.scan_string_table_roots(sink, filter),
            RootCategory::ClassLoaderGraph => {
                if self.options.class_unloading {
                    // Weak edges are dropped; unloading decides their fate.
                    self.scan_class_loader_graph_roots(
                        sink,
                        &mut DiscardSink,
                        ClassLoaderScan::LiveFiltered,
                    )
                } else {
                    self.scan_class_loader_graph_all_strong(sink)
                }
            }
            RootCategory::WeakProcessor => self.scan_weak_processor_roots(sink, filter),
        };
        Ok(slots)
    }

    /// Scan each of `categories` into its own sink, on the rayon pool when
    /// parallel root scanning is enabled. Results keep the input order.
    pub fn scan_categories<S, F>(
        &self,
        categories: &[RootCategory],
        make_sink: F,
    ) -> Result<Vec<(RootCategory, S)>, ProtocolViolation>
    where
        S: SlotSink + Send,
        F: Fn(RootCategory) -> S + Sync,
    {
        let run = |&category: &RootCategory| {
            let mut sink = make_sink(category);
            self.scan(category, &mut sink).map(|_| (category, sink))
        };
        if self.options.parallel_root_scan {
            categories.par_iter().map(run).collect()
        } else {
            categories.iter().map(run).collect()
        }
    }

    pub fn scan_thread_roots(
        &self,
        selector: ThreadSelector<'_>,
        sink: &mut dyn SlotSink,
    ) -> Result<usize, ProtocolViolation> {
        let ids = match selector {
            ThreadSelector::All => self.registry.mutator_ids(),
            ThreadSelector::One(id) => vec![id],
            ThreadSelector::Subset(ids) => {
                let mut ids = ids.to_vec();
                ids.sort_unstable();
                ids.dedup();
                ids
            }
        };
        if let Some(missing) = ids.iter().find(|id| self.registry.get(**id).is_none()) {
            return Err(ProtocolViolation::UnknownMutator(*missing));
        }
        let mut closure = RootsClosure::new(sink);
        for id in ids {
            self.visit_thread(id, &mut closure);
        }
        let slots = closure.finish();
        log_scan(RootCategory::ThreadStacks, slots);
        Ok(slots)
    }

    /// Stack slots and code-embedded slots of one thread. With relocating
    /// collectors the frames are walked first so every blob the thread
    /// claims is known before its relocations are fixed.
    fn visit_thread(&self, id: MutatorId, visitor: &mut dyn SlotVisitor) {
        let roots = self.upcalls.roots();
        if self.options.relocate_code {
            roots.thread_stack(id, visitor);
            self.visit_thread_code(id, visitor);
        } else {
            self.visit_thread_code(id, visitor);
            roots.thread_stack(id, visitor);
        }
    }

    fn visit_thread_code(&self, id: MutatorId, visitor: &mut dyn SlotVisitor) {
        self.upcalls.roots().thread_code(id, &mut |code: CodeId| {
            self.code_roots.claim_and_visit(code, &mut *visitor);
        });
    }

    pub fn scan_code_cache_roots(&self, sink: &mut dyn SlotSink) -> usize {
        let mut closure = RootsClosure::new(sink);
        self.code_roots.scan(&mut closure);
        let slots = closure.finish();
        log_scan(RootCategory::CodeCache, slots);
        slots
    }

    pub fn scan_string_table_roots(&self, sink: &mut dyn SlotSink, filter: LiveFilter) -> usize {
        let mut closure = RootsClosure::new(sink);
        self.upcalls.roots().string_table(&mut closure, filter);
        let slots = closure.finish();
        log_scan(RootCategory::StringTable, slots);
        slots
    }

    /// Strong edges go to `strong`, weak edges to `weak`. Returns the
    /// number of strong slots.
    pub fn scan_class_loader_graph_roots(
        &self,
        strong: &mut dyn SlotSink,
        weak: &mut dyn SlotSink,
        policy: ClassLoaderScan,
    ) -> usize {
        let mut strong = RootsClosure::new(strong);
        let mut weak = RootsClosure::new(weak);
        self.upcalls
            .roots()
            .class_loader_graph(&mut strong, &mut weak, policy);
        let weak_slots = weak.finish();
        let slots = strong.finish();
        tracing::debug!(
            target: "gcbridge",
            category = RootCategory::ClassLoaderGraph.name(),
            slots,
            weak_slots,
            ?policy,
            "roots scanned"
        );
        slots
    }

    /// Both partitions into one sink, for cycles that never unload.
    fn scan_class_loader_graph_all_strong(&self, sink: &mut dyn SlotSink) -> usize {
        let closure = RefCell::new(RootsClosure::new(sink));
        let mut strong = |slot: RefSlot| closure.borrow_mut().visit_slot(slot);
        let mut weak = |slot: RefSlot| closure.borrow_mut().visit_slot(slot);
        self.upcalls
            .roots()
            .class_loader_graph(&mut strong, &mut weak, ClassLoaderScan::AllStrong);
        let slots = closure.into_inner().finish();
        log_scan(RootCategory::ClassLoaderGraph, slots);
        slots
    }

    /// Host weak storage, plus nursery weak handles under
    /// [`LiveFilter::NonStuckOnly`]. Handles registered with the binding
    /// must not also be reported by the host's walker; the binding updates
    /// them itself after every cycle.
    pub fn scan_weak_processor_roots(&self, sink: &mut dyn SlotSink, filter: LiveFilter) -> usize {
        let mut closure = RootsClosure::new(sink);
        self.upcalls.roots().weak_processor(&mut closure, filter);
        if filter == LiveFilter::NonStuckOnly {
            for slot in self.weak_handles.take_nursery() {
                closure.visit_slot(slot);
            }
        }
        let slots = closure.finish();
        log_scan(RootCategory::WeakProcessor, slots);
        slots
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::closure::VecSink;
    use crate::testing::SimRuntime;
    use crate::upcalls::Upcalls;
    use std::sync::Arc;

    struct Fixture {
        host: Arc<SimRuntime>,
        upcalls: Upcalls,
        registry: ThreadRegistry<()>,
        code_roots: CodeRootTable,
        weak_handles: WeakHandleTable,
        options: BindingOptions,
    }

    impl Fixture {
        fn new(options: BindingOptions) -> Self {
            let host = Arc::new(SimRuntime::new());
            Self {
                upcalls: Upcalls::from_host(host.clone()).unwrap(),
                host,
                registry: ThreadRegistry::new(),
                code_roots: CodeRootTable::new(),
                weak_handles: WeakHandleTable::new(),
                options,
            }
        }

        fn scanner(&self) -> RootScanner<'_, ()> {
            RootScanner::new(
                &self.upcalls,
                &self.registry,
                &self.code_roots,
                &self.weak_handles,
                &self.options,
            )
        }
    }

    #[test]
    fn test_simple_category_reports_every_root() {
        let fx = Fixture::new(BindingOptions::default());
        let objs: Vec<_> = (0..5).map(|_| fx.host.heap().alloc(1)).collect();
        let cells: Vec<_> = objs
            .iter()
            .map(|o| fx.host.add_root(RootCategory::Universe, Some(*o)))
            .collect();

        let mut sink = VecSink::with_capacity(2);
        assert_eq!(fx.scanner().scan_universe_roots(&mut sink), 5);
        let mut got = sink.into_slots();
        got.sort();
        let mut want: Vec<_> = cells.iter().map(|c| c.slot()).collect();
        want.sort();
        assert_eq!(got, want);
    }

    #[test]
    fn test_unknown_mutator_in_selector() {
        let fx = Fixture::new(BindingOptions::default());
        let mut sink = VecSink::with_capacity(4);
        let err = fx
            .scanner()
            .scan_thread_roots(ThreadSelector::One(MutatorId::from_u64(42)), &mut sink)
            .unwrap_err();
        assert_eq!(err, ProtocolViolation::UnknownMutator(MutatorId::from_u64(42)));
    }

    #[test]
    fn test_zero_mutators_scan_is_empty() {
        let fx = Fixture::new(BindingOptions::default());
        let mut sink = VecSink::with_capacity(4);
        assert_eq!(
            fx.scanner()
                .scan_thread_roots(ThreadSelector::All, &mut sink)
                .unwrap(),
            0
        );
        assert!(sink.is_empty());
    }

    #[test]
    fn test_thread_code_claimed_once_across_threads() {
        let fx = Fixture::new(BindingOptions::default());
        let me = fx.registry.register_current(None, |_| ()).unwrap().id();
        let obj = fx.host.heap().alloc(1);
        let code_cell = fx.host.new_cell(Some(obj));
        fx.code_roots.register(CodeId(9), [code_cell.slot()]);
        // The same blob is on the stack twice.
        fx.host.add_thread_code(me, CodeId(9));
        fx.host.add_thread_code(me, CodeId(9));
        let stack_cell = fx.host.add_stack_root(me, Some(obj));

        fx.code_roots.begin_cycle();
        let mut sink = VecSink::with_capacity(8);
        let n = fx
            .scanner()
            .scan_thread_roots(ThreadSelector::Subset(&[me, me]), &mut sink)
            .unwrap();
        assert_eq!(n, 2);
        let slots = sink.into_slots();
        assert!(slots.contains(&stack_cell.slot()));
        assert!(slots.contains(&code_cell.slot()));

        // Already claimed by the thread scan.
        let mut sink = VecSink::with_capacity(8);
        assert_eq!(fx.scanner().scan_code_cache_roots(&mut sink), 0);
    }

    #[test]
    fn test_code_order_follows_relocation_mode() {
        for relocate_code in [false, true] {
            let fx = Fixture::new(BindingOptions {
                relocate_code,
                ..BindingOptions::default()
            });
            let me = fx.registry.register_current(None, |_| ()).unwrap().id();
            let obj = fx.host.heap().alloc(1);
            let code_cell = fx.host.new_cell(Some(obj));
            fx.code_roots.register(CodeId(1), [code_cell.slot()]);
            fx.host.add_thread_code(me, CodeId(1));
            let stack_cell = fx.host.add_stack_root(me, Some(obj));

            fx.code_roots.begin_cycle();
            let mut sink = VecSink::with_capacity(8);
            fx.scanner()
                .scan_thread_roots(ThreadSelector::One(me), &mut sink)
                .unwrap();
            let expected = if relocate_code {
                vec![stack_cell.slot(), code_cell.slot()]
            } else {
                vec![code_cell.slot(), stack_cell.slot()]
            };
            assert_eq!(sink.into_slots(), expected);
            fx.registry.deregister_current().unwrap();
        }
    }

    #[test]
    fn test_class_loader_graph_partitions() {
        let fx = Fixture::new(BindingOptions::default());
        let heap = fx.host.heap();
        let strong = fx.host.add_cld_edge(false, Some(heap.alloc(1)));
        let weak = fx.host.add_cld_edge(true, Some(heap.alloc(1)));

        let mut strong_sink = VecSink::with_capacity(4);
        let mut weak_sink = VecSink::with_capacity(4);
        let n = fx.scanner().scan_class_loader_graph_roots(
            &mut strong_sink,
            &mut weak_sink,
            ClassLoaderScan::LiveFiltered,
        );
        assert_eq!(n, 1);
        assert_eq!(strong_sink.into_slots(), vec![strong.slot()]);
        assert_eq!(weak_sink.into_slots(), vec![weak.slot()]);

        // Without unloading, weak edges are kept alive as roots.
        let fx2 = Fixture::new(BindingOptions {
            class_unloading: false,
            ..BindingOptions::default()
        });
        fx2.host.add_cld_edge(false, Some(heap.alloc(1)));
        fx2.host.add_cld_edge(true, Some(heap.alloc(1)));
        let mut sink = VecSink::with_capacity(4);
        assert_eq!(
            fx2.scanner()
                .scan(RootCategory::ClassLoaderGraph, &mut sink)
                .unwrap(),
            2
        );
        let mut sink = VecSink::with_capacity(4);
        assert_eq!(
            fx.scanner()
                .scan(RootCategory::ClassLoaderGraph, &mut sink)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_weak_handles_only_under_non_stuck_filter() {
        let fx = Fixture::new(BindingOptions::default());
        let handle = fx.host.new_cell(Some(fx.host.heap().alloc(1)));
        fx.weak_handles.register(handle.slot());

        let mut sink = VecSink::with_capacity(4);
        assert_eq!(
            fx.scanner()
                .scan_weak_processor_roots(&mut sink, LiveFilter::All),
            0
        );
        assert_eq!(fx.weak_handles.nursery_len(), 1);

        let mut sink = VecSink::with_capacity(4);
        assert_eq!(
            fx.scanner()
                .scan_weak_processor_roots(&mut sink, LiveFilter::NonStuckOnly),
            1
        );
        assert_eq!(fx.weak_handles.nursery_len(), 0);
    }

    #[test]
    fn test_parallel_and_sequential_agree() {
        let mk = |parallel_root_scan| {
            Fixture::new(BindingOptions {
                parallel_root_scan,
                ..BindingOptions::default()
            })
        };
        for fx in [mk(false), mk(true)] {
            for category in [
                RootCategory::Universe,
                RootCategory::JniHandles,
                RootCategory::SystemDictionary,
            ] {
                for _ in 0..3 {
                    fx.host.add_root(category, Some(fx.host.heap().alloc(0)));
                }
            }
            let results = fx
                .scanner()
                .scan_categories(RootCategory::strong(WeakProcessingMode::Tracing), |_| {
                    VecSink::with_capacity(2)
                })
                .unwrap();
            let counts: Vec<_> = results.iter().map(|(c, s)| (*c, s.len())).collect();
            assert_eq!(counts.len(), 12);
            assert_eq!(counts[0].0, RootCategory::ThreadStacks);
            let total: usize = counts.iter().map(|(_, n)| n).sum();
            assert_eq!(total, 9);
        }
    }
}
