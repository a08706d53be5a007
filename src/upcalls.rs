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

//! Services the host runtime provides to the binding.
//!
//! The host implements the traits below and hands them over once through
//! [`UpcallsBuilder`]. A table that is missing any part is rejected at
//! build time, so nothing on the collection path has to cope with an
//! absent service.

use crate::closure::SlotVisitor;
use crate::error::BindingError;
use crate::roots::CodeId;
use crate::slot::SlotRange;
use crate::threads::{GcThreadKind, MutatorId};
use mmtk::util::{Address, ObjectReference};
use std::sync::Arc;

/// Which entries of a weak table a scan should report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LiveFilter {
    #[default]
    All,
    /// Only entries whose referents are not yet known to be retained.
    /// Used by reference-counting collectors for nursery roots.
    NonStuckOnly,
}

/// Policy for the class-loader graph's strong pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClassLoaderScan {
    /// Every loader is a root.
    AllStrong,
    /// Only loaders already known to be live.
    LiveFiltered,
}

/// Thread suspension and thread creation.
pub trait ThreadControl: Send + Sync {
    /// Request every mutator to reach a safe point and return once all have.
    fn suspend_all(&self);

    /// Release every mutator parked by [`ThreadControl::suspend_all`].
    fn resume_all(&self);

    /// The calling mutator is about to block; treat it as parked.
    fn enter_safe_region(&self);

    /// The calling mutator wants to run again. Must not return while the
    /// world is stopped.
    fn leave_safe_region(&self);

    fn spawn_thread(
        &self,
        kind: GcThreadKind,
        name: &str,
        body: Box<dyn FnOnce() + Send + 'static>,
    ) -> std::io::Result<()> {
        let _ = kind;
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(body)
            .map(drop)
    }

    /// Stop the process. Must not return.
    fn terminate(&self, reason: &str) -> !;
}

/// One walker per root category.
pub trait RootEnumeration: Send + Sync {
    fn thread_stack(&self, mutator: MutatorId, visitor: &mut dyn SlotVisitor);

    /// Compiled code with frames on `mutator`'s stack.
    fn thread_code(&self, mutator: MutatorId, code: &mut dyn FnMut(CodeId));

    fn vm_threads(&self, visitor: &mut dyn SlotVisitor);
    fn universe(&self, visitor: &mut dyn SlotVisitor);
    fn jni_handles(&self, visitor: &mut dyn SlotVisitor);
    fn object_synchronizer(&self, visitor: &mut dyn SlotVisitor);
    fn management(&self, visitor: &mut dyn SlotVisitor);
    fn jvmti_export(&self, visitor: &mut dyn SlotVisitor);
    fn aot_loader(&self, visitor: &mut dyn SlotVisitor);
    fn system_dictionary(&self, visitor: &mut dyn SlotVisitor);
    fn string_table(&self, visitor: &mut dyn SlotVisitor, filter: LiveFilter);

    /// Strong and weak edges of the class-loader graph, in one walk.
    fn class_loader_graph(
        &self,
        strong: &mut dyn SlotVisitor,
        weak: &mut dyn SlotVisitor,
        policy: ClassLoaderScan,
    );

    fn weak_processor(&self, visitor: &mut dyn SlotVisitor, filter: LiveFilter);
}

pub trait ObjectIntrospection: Send + Sync {
    /// Report every reference field of `object`.
    fn scan_object(&self, object: ObjectReference, visitor: &mut dyn SlotVisitor);
    fn object_size(&self, object: ObjectReference) -> usize;
    fn dump_object(&self, object: ObjectReference) -> String;
    fn class_name(&self, object: ObjectReference) -> Option<String>;
}

/// Bookkeeping the host runs around a cycle.
pub trait CycleHooks: Send + Sync {
    fn code_cache_prologue(&self);
    fn code_cache_epilogue(&self);
    fn clear_claimed_marks(&self);

    fn derived_pointers_clear(&self) {}
    fn derived_pointers_update(&self) {}

    /// Rewrite references embedded in `code` after objects moved.
    fn fix_code_relocations(&self, code: CodeId);

    fn schedule_finalizer(&self);

    /// Unload classes whose loaders are dead, purging host dictionaries.
    fn unload_classes(&self, is_alive: &dyn Fn(ObjectReference) -> bool);

    /// Install `head` as the pending-reference list and return the old head.
    fn swap_reference_pending_list(&self, head: Option<ObjectReference>)
    -> Option<ObjectReference>;
}

/// Raw layout facts. Values are validated by [`LayoutOffsets::query`].
pub trait LayoutQueries: Send + Sync {
    fn referent_offset(&self) -> i64;
    fn discovered_offset(&self) -> i64;
    fn class_klass_offset(&self) -> i64;
    fn class_loader_data_offset(&self) -> i64;
    fn static_fields_offset(&self) -> i64;
    fn static_oop_field_count_offset(&self) -> i64;
    fn layout_checksum(&self) -> u64;
}

/// Byte offsets into host objects, validated once at install time.
///
/// `referent` and `discovered` drive reference processing. The class
/// offsets are for engine adapters that trace class mirrors and loaders
/// themselves, see [`LayoutOffsets::static_reference_slots`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutOffsets {
    pub referent: usize,
    pub discovered: usize,
    pub class_klass: usize,
    pub class_loader_data: usize,
    pub static_fields: usize,
    pub static_oop_field_count: usize,
    pub checksum: u64,
}

impl LayoutOffsets {
    pub fn query(layout: &dyn LayoutQueries) -> Result<Self, BindingError> {
        fn non_negative(name: &'static str, value: i64) -> Result<usize, BindingError> {
            usize::try_from(value).map_err(|_| BindingError::InvalidLayoutOffset { name, value })
        }
        // 0 and -1 are the host's "not computed yet" markers for these.
        fn computed(name: &'static str, value: i64) -> Result<usize, BindingError> {
            if value == 0 || value == -1 {
                return Err(BindingError::InvalidLayoutOffset { name, value });
            }
            non_negative(name, value)
        }

        Ok(Self {
            referent: non_negative("referent_offset", layout.referent_offset())?,
            discovered: non_negative("discovered_offset", layout.discovered_offset())?,
            class_klass: computed("class_klass_offset", layout.class_klass_offset())?,
            class_loader_data: computed(
                "class_loader_data_offset",
                layout.class_loader_data_offset(),
            )?,
            static_fields: non_negative("static_fields_offset", layout.static_fields_offset())?,
            static_oop_field_count: non_negative(
                "static_oop_field_count_offset",
                layout.static_oop_field_count_offset(),
            )?,
            checksum: layout.layout_checksum(),
        })
    }

    /// The host's class descriptor behind a class mirror.
    pub fn mirror_klass(&self, mirror: ObjectReference) -> Address {
        // SAFETY: `mirror` is a live class mirror and the offset was
        // validated against the host's layout.
        unsafe { (mirror.to_raw_address() + self.class_klass).load::<Address>() }
    }

    /// The loader-data pointer stored in a class loader object.
    pub fn loader_data(&self, loader: ObjectReference) -> Address {
        // SAFETY: as for `mirror_klass`.
        unsafe { (loader.to_raw_address() + self.class_loader_data).load::<Address>() }
    }

    /// Reference slots holding a mirror's static fields.
    pub fn static_reference_slots(&self, mirror: ObjectReference, narrow: bool) -> SlotRange {
        let base = mirror.to_raw_address();
        // SAFETY: as for `mirror_klass`.
        let count = unsafe { (base + self.static_oop_field_count).load::<i32>() };
        SlotRange::new(
            Some(mirror),
            base + self.static_fields,
            usize::try_from(count).unwrap_or(0),
            narrow,
        )
    }
}

/// The installed upcall table. Read-only once built.
#[derive(Clone)]
pub struct Upcalls {
    threads: Arc<dyn ThreadControl>,
    roots: Arc<dyn RootEnumeration>,
    objects: Arc<dyn ObjectIntrospection>,
    hooks: Arc<dyn CycleHooks>,
    layout: LayoutOffsets,
}

impl Upcalls {
    pub fn builder() -> UpcallsBuilder {
        UpcallsBuilder::default()
    }

    /// Build from one host object that implements every service.
    pub fn from_host<H>(host: Arc<H>) -> Result<Self, BindingError>
    where
        H: ThreadControl
            + RootEnumeration
            + ObjectIntrospection
            + CycleHooks
            + LayoutQueries
            + 'static,
    {
        UpcallsBuilder::default()
            .threads(host.clone())
            .roots(host.clone())
            .objects(host.clone())
            .hooks(host.clone())
            .layout(&*host)
            .build()
    }

    #[inline]
    pub fn threads(&self) -> &dyn ThreadControl {
        &*self.threads
    }

    #[inline]
    pub fn roots(&self) -> &dyn RootEnumeration {
        &*self.roots
    }

    #[inline]
    pub fn objects(&self) -> &dyn ObjectIntrospection {
        &*self.objects
    }

    #[inline]
    pub fn hooks(&self) -> &dyn CycleHooks {
        &*self.hooks
    }

    #[inline]
    pub fn layout(&self) -> &LayoutOffsets {
        &self.layout
    }
}

impl std::fmt::Debug for Upcalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Upcalls")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

#[derive(Default)]
pub struct UpcallsBuilder {
    threads: Option<Arc<dyn ThreadControl>>,
    roots: Option<Arc<dyn RootEnumeration>>,
    objects: Option<Arc<dyn ObjectIntrospection>>,
    hooks: Option<Arc<dyn CycleHooks>>,
    layout: Option<Result<LayoutOffsets, BindingError>>,
}

impl UpcallsBuilder {
    pub fn threads(mut self, threads: Arc<dyn ThreadControl>) -> Self {
        self.threads = Some(threads);
        self
    }

    pub fn roots(mut self, roots: Arc<dyn RootEnumeration>) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn objects(mut self, objects: Arc<dyn ObjectIntrospection>) -> Self {
        self.objects = Some(objects);
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn CycleHooks>) -> Self {
        self.hooks = Some(hooks);
        self
    }

    /// Queries the offsets now; an invalid value surfaces from `build`.
    pub fn layout(mut self, layout: &dyn LayoutQueries) -> Self {
        self.layout = Some(LayoutOffsets::query(layout));
        self
    }

    pub fn build(self) -> Result<Upcalls, BindingError> {
        let upcalls = Upcalls {
            threads: self.threads.ok_or(BindingError::MissingUpcall("threads"))?,
            roots: self.roots.ok_or(BindingError::MissingUpcall("roots"))?,
            objects: self.objects.ok_or(BindingError::MissingUpcall("objects"))?,
            hooks: self.hooks.ok_or(BindingError::MissingUpcall("hooks"))?,
            layout: self.layout.ok_or(BindingError::MissingUpcall("layout"))??,
        };
        tracing::debug!(
            target: "gcbridge",
            checksum = upcalls.layout.checksum,
            "upcall table validated"
        );
        Ok(upcalls)
    }
}
