//! Process-wide runtime state: the ordered loaded-image list, the locks
//! guarding it, the dynamic reference graph, interpose tables, weak-def
//! map, TLS registry, and notifier lists.
//!
//! All compound operations (dlopen bodies, notifier dispatch, GC) are
//! serialized by recursive locks so an initializer is free to re-enter
//! `dlopen`. Only [`RuntimeState::is_memory_immutable`] is lock-free; it
//! walks an append-only linked list of permanent ranges.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicPtr, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;

use crate::arena::WritableWindow;
use crate::config::ProcessConfig;
use crate::errors::{LaunchErrorInfo, LaunchErrorKind};
use crate::helpers::LibSystemHelpers;
use crate::loader::{Loader, LoaderRef, MissingFlatLazySymbol};
use crate::prebuilt_set::PrebuiltLoaderSet;
use crate::syscall::SyscallShim;

/// Number of weak-def resolutions after which the side map is built.
const WEAK_DEF_MAP_THRESHOLD: u64 = 5000;

/// Recursive lock in the shape of `os_unfair_recursive_lock`: the owning
/// thread may re-acquire, and a forked child can forcibly reset it.
pub struct RecursiveLock {
    inner: Mutex<LockState>,
    cond: Condvar,
}

#[derive(Default)]
struct LockState {
    owner: Option<ThreadId>,
    depth: u32,
}

impl RecursiveLock {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(LockState::default()),
            cond: Condvar::new(),
        }
    }

    pub fn acquire(&self) {
        let me = std::thread::current().id();
        let mut st = self.inner.lock().unwrap();
        while st.owner.is_some() && st.owner != Some(me) {
            st = self.cond.wait(st).unwrap();
        }
        st.owner = Some(me);
        st.depth += 1;
    }

    pub fn release(&self) {
        let mut st = self.inner.lock().unwrap();
        debug_assert_eq!(st.owner, Some(std::thread::current().id()));
        st.depth -= 1;
        if st.depth == 0 {
            st.owner = None;
            self.cond.notify_one();
        }
    }

    pub fn with<R>(&self, work: impl FnOnce() -> R) -> R {
        self.acquire();
        let result = work();
        self.release();
        result
    }

    /// Forked children inherit a lock that was held by the forking
    /// thread; reset it to the released state.
    pub fn reset_in_forked_child(&self) {
        let mut st = self.inner.lock().unwrap();
        st.owner = None;
        st.depth = 0;
    }
}

impl Default for RecursiveLock {
    fn default() -> Self {
        Self::new()
    }
}

/// The lock set of the runtime, mirroring its C counterpart: compound
/// operations hold these while the per-collection mutexes below stay
/// short-lived.
#[derive(Default)]
pub struct RuntimeLocks {
    pub loaders: RecursiveLock,
    pub notifiers: RecursiveLock,
    pub tlv_infos: RecursiveLock,
    pub api: RecursiveLock,
    /// log emission never takes the other locks
    pub log_serializer: Mutex<()>,
}

/// Replacements applied during binding unless a specific tuple matched.
#[derive(Clone, Copy)]
pub struct InterposeTupleAll {
    pub replacement: usize,
    pub replacee: usize,
}

/// Per-image exception: not applied to `only_image`, which preserves the
/// interposer's ability to call through to the previous implementation.
#[derive(Clone)]
pub struct InterposeTupleSpecific {
    pub only_image: Arc<Loader>,
    pub replacement: usize,
    pub replacee: usize,
}

#[derive(Clone)]
pub struct WeakDefMapValue {
    pub target_loader: Arc<Loader>,
    pub target_runtime_offset: u64,
    pub is_code: bool,
    pub is_weak_def: bool,
}

#[derive(Clone)]
pub struct TlvInfo {
    pub loader: Arc<Loader>,
    pub key: u64,
    pub initial_content_offset: u64,
    pub initial_content_size: u32,
}

pub type ImageNotifier = Box<dyn Fn(usize, isize) + Send + Sync>;
pub type LoadNotifier = Box<dyn Fn(usize, &str, bool) + Send + Sync>;
pub type BulkLoadNotifier = Box<dyn Fn(&[usize], &[&str]) + Send + Sync>;
pub type ObjCMappedNotifier = Box<dyn Fn(&[usize], &[&str]) + Send + Sync>;
pub type ObjCSingleNotifier = Box<dyn Fn(usize, &str) + Send + Sync>;

#[derive(Default)]
pub struct Notifiers {
    pub add_image: Vec<ImageNotifier>,
    pub remove_image: Vec<ImageNotifier>,
    pub load_image: Vec<LoadNotifier>,
    pub bulk_load_image: Vec<BulkLoadNotifier>,
    pub objc_mapped: Option<ObjCMappedNotifier>,
    pub objc_init: Option<ObjCSingleNotifier>,
    pub objc_unmapped: Option<ObjCSingleNotifier>,
}

/// One cache patch-back applied this launch, so a saved set can replay
/// it without re-resolving.
#[derive(Clone)]
pub struct RecordedCachePatch {
    pub cache_dylib_index: u16,
    pub cache_dylib_vm_offset: u32,
    pub target_loader: Arc<Loader>,
    pub target_runtime_offset: u64,
}

/// Per-process runtime side of an attached PrebuiltLoaderSet: the mmapped
/// records stay read-only, so lifecycle state and load addresses live in
/// these parallel arrays indexed by `LoaderRef::index`.
pub struct PrebuiltSetRuntime {
    pub set: Arc<PrebuiltLoaderSet>,
    pub handles: Vec<Arc<Loader>>,
    pub states: Vec<AtomicU8>,
    pub load_addrs: Vec<AtomicUsize>,
}

struct PermanentRangeNode {
    next: AtomicPtr<PermanentRangeNode>,
    ranges: Vec<(usize, usize, u8, Arc<Loader>)>,
}

pub struct RuntimeState {
    pub config: Arc<ProcessConfig>,
    pub locks: RuntimeLocks,
    syscalls: Arc<dyn SyscallShim>,
    helpers: Mutex<Option<Arc<dyn LibSystemHelpers>>>,

    pub(crate) loaded: Mutex<Vec<Arc<Loader>>>,
    main_executable_loader: Mutex<Option<Arc<Loader>>>,

    pub(crate) interposing_tuples_all: Mutex<Vec<InterposeTupleAll>>,
    pub(crate) interposing_tuples_specific: Mutex<Vec<InterposeTupleSpecific>>,

    weak_def_resolve_count: AtomicUsize,
    pub(crate) weak_def_map: Mutex<Option<HashMap<String, WeakDefMapValue>>>,

    pub(crate) notifiers: Mutex<Notifiers>,
    pub(crate) tlv_infos: Mutex<Vec<TlvInfo>>,
    pub(crate) registered_dofs: Mutex<Vec<(Arc<Loader>, i32)>>,
    pub(crate) missing_flat_lazy_symbols: Mutex<Vec<MissingFlatLazySymbol>>,
    dynamic_references: Mutex<Vec<(Arc<Loader>, Arc<Loader>)>>,
    dlopen_ref_counts: Mutex<Vec<(Arc<Loader>, u32)>>,
    pub(crate) dynamic_never_unloads: Mutex<Vec<Arc<Loader>>>,

    permanent_ranges: AtomicPtr<PermanentRangeNode>,

    process_set: Mutex<Option<PrebuiltSetRuntime>>,
    cached_dylibs_set: Mutex<Option<PrebuiltSetRuntime>>,
    must_be_missing_paths: Mutex<Vec<String>>,

    pub(crate) gc_count: AtomicI32,
    has_overridden_cached_dylib: AtomicBool,
    wrote_prebuilt_loader_set: AtomicBool,
    /// cache patch-backs applied this launch, replayed by a saved set
    recorded_cache_patches: Mutex<Vec<RecordedCachePatch>>,

    pub writable: WritableWindow,
    launch_error: Mutex<LaunchErrorInfo>,

    /// sentinel address lazy binds point at when the symbol is missing
    missing_symbol_sentinel: Box<u64>,
}

impl RuntimeState {
    pub fn new(config: Arc<ProcessConfig>, syscalls: Arc<dyn SyscallShim>) -> Self {
        Self {
            config,
            locks: RuntimeLocks::default(),
            syscalls,
            helpers: Mutex::new(None),
            loaded: Mutex::new(Vec::new()),
            main_executable_loader: Mutex::new(None),
            interposing_tuples_all: Mutex::new(Vec::new()),
            interposing_tuples_specific: Mutex::new(Vec::new()),
            weak_def_resolve_count: AtomicUsize::new(0),
            weak_def_map: Mutex::new(None),
            notifiers: Mutex::new(Notifiers::default()),
            tlv_infos: Mutex::new(Vec::new()),
            registered_dofs: Mutex::new(Vec::new()),
            missing_flat_lazy_symbols: Mutex::new(Vec::new()),
            dynamic_references: Mutex::new(Vec::new()),
            dlopen_ref_counts: Mutex::new(Vec::new()),
            dynamic_never_unloads: Mutex::new(Vec::new()),
            permanent_ranges: AtomicPtr::new(std::ptr::null_mut()),
            process_set: Mutex::new(None),
            cached_dylibs_set: Mutex::new(None),
            must_be_missing_paths: Mutex::new(Vec::new()),
            gc_count: AtomicI32::new(0),
            has_overridden_cached_dylib: AtomicBool::new(false),
            wrote_prebuilt_loader_set: AtomicBool::new(false),
            recorded_cache_patches: Mutex::new(Vec::new()),
            writable: WritableWindow::new(),
            launch_error: Mutex::new(LaunchErrorInfo::default()),
            missing_symbol_sentinel: Box::new(0),
        }
    }

    pub fn syscalls(&self) -> &dyn SyscallShim {
        self.syscalls.as_ref()
    }

    pub fn syscalls_arc(&self) -> Arc<dyn SyscallShim> {
        Arc::clone(&self.syscalls)
    }

    pub fn set_helpers(&self, helpers: Arc<dyn LibSystemHelpers>) {
        *self.helpers.lock().unwrap() = Some(helpers);
    }

    pub fn helpers(&self) -> Option<Arc<dyn LibSystemHelpers>> {
        self.helpers.lock().unwrap().clone()
    }

    /// Address lazy binds are pointed at when their symbol is missing.
    pub fn missing_symbol_sentinel_addr(&self) -> usize {
        &*self.missing_symbol_sentinel as *const u64 as usize
    }

    // ---- loaded list ----

    pub fn add(&self, loader: Arc<Loader>) {
        self.loaded.lock().unwrap().push(loader);
    }

    pub fn with_loaded<R>(&self, f: impl FnOnce(&[Arc<Loader>]) -> R) -> R {
        f(&self.loaded.lock().unwrap())
    }

    pub fn loaded_count(&self) -> usize {
        self.loaded.lock().unwrap().len()
    }

    pub fn loaded_at(&self, index: usize) -> Option<Arc<Loader>> {
        self.loaded.lock().unwrap().get(index).cloned()
    }

    pub fn set_main_loader(&self, loader: Arc<Loader>) {
        *self.main_executable_loader.lock().unwrap() = Some(loader);
    }

    pub fn main_loader(&self) -> Option<Arc<Loader>> {
        self.main_executable_loader.lock().unwrap().clone()
    }

    /// Loader whose mapped segments contain `addr`.
    pub fn loader_containing_address(&self, addr: usize) -> Option<Arc<Loader>> {
        self.with_loaded(|loaded| {
            loaded
                .iter()
                .find(|l| l.contains(self, addr).is_some())
                .cloned()
        })
    }

    /// Flat-lookup order puts inserted dylibs ahead of the main
    /// executable, whatever order they were instantiated in.
    pub(crate) fn move_before(&self, movers: &[Arc<Loader>], pivot: &Arc<Loader>) {
        let mut loaded = self.loaded.lock().unwrap();
        let Some(pivot_pos) = loaded.iter().position(|l| Arc::ptr_eq(l, pivot)) else {
            return;
        };
        let mut extracted = Vec::new();
        loaded.retain(|l| {
            if movers.iter().any(|m| Arc::ptr_eq(m, l)) {
                extracted.push(Arc::clone(l));
                false
            } else {
                true
            }
        });
        let insert_at = loaded
            .iter()
            .position(|l| Arc::ptr_eq(l, pivot))
            .unwrap_or(pivot_pos);
        for (i, loader) in extracted.into_iter().enumerate() {
            loaded.insert(insert_at + i, loader);
        }
    }

    pub(crate) fn remove_loaders(&self, removing: &[Arc<Loader>]) {
        let mut loaded = self.loaded.lock().unwrap();
        loaded.retain(|l| !removing.iter().any(|r| Arc::ptr_eq(l, r)));
    }

    // ---- dlopen reference counts ----

    /// Absent entry means zero; `neverUnload` loaders never get entries.
    pub fn inc_dl_ref_count(&self, loader: &Arc<Loader>) {
        if loader.never_unload() {
            return;
        }
        let mut counts = self.dlopen_ref_counts.lock().unwrap();
        for (l, count) in counts.iter_mut() {
            if Arc::ptr_eq(l, loader) {
                *count += 1;
                return;
            }
        }
        counts.push((Arc::clone(loader), 1));
    }

    /// Returns true when the count reached zero and a GC should run.
    pub fn dec_dl_ref_count(&self, loader: &Arc<Loader>) -> bool {
        if loader.never_unload() {
            return false;
        }
        let mut counts = self.dlopen_ref_counts.lock().unwrap();
        if let Some(pos) = counts.iter().position(|(l, _)| Arc::ptr_eq(l, loader)) {
            counts[pos].1 -= 1;
            if counts[pos].1 == 0 {
                counts.remove(pos);
                return true;
            }
        }
        false
    }

    pub fn dl_ref_count(&self, loader: &Arc<Loader>) -> u32 {
        self.dlopen_ref_counts
            .lock()
            .unwrap()
            .iter()
            .find(|(l, _)| Arc::ptr_eq(l, loader))
            .map_or(0, |(_, c)| *c)
    }

    pub(crate) fn loaders_with_ref_counts(&self) -> Vec<Arc<Loader>> {
        self.dlopen_ref_counts
            .lock()
            .unwrap()
            .iter()
            .map(|(l, _)| Arc::clone(l))
            .collect()
    }

    // ---- dynamic references (flat-lookup and dlopen edges) ----

    pub fn add_dynamic_reference(&self, from: &Arc<Loader>, to: &Arc<Loader>) {
        if to.never_unload() || Arc::ptr_eq(from, to) {
            return;
        }
        let mut refs = self.dynamic_references.lock().unwrap();
        if refs
            .iter()
            .any(|(f, t)| Arc::ptr_eq(f, from) && Arc::ptr_eq(t, to))
        {
            return;
        }
        log::debug!(
            "dynamic reference {} -> {}",
            from.leaf_name(),
            to.leaf_name()
        );
        refs.push((Arc::clone(from), Arc::clone(to)));
    }

    pub fn with_dynamic_references<R>(
        &self,
        f: impl FnOnce(&[(Arc<Loader>, Arc<Loader>)]) -> R,
    ) -> R {
        f(&self.dynamic_references.lock().unwrap())
    }

    pub(crate) fn remove_dynamic_dependencies(&self, removee: &Arc<Loader>) {
        self.dynamic_references
            .lock()
            .unwrap()
            .retain(|(f, t)| !Arc::ptr_eq(f, removee) && !Arc::ptr_eq(t, removee));
    }

    pub fn add_dynamic_never_unload(&self, loader: &Arc<Loader>) {
        let mut pinned = self.dynamic_never_unloads.lock().unwrap();
        if !pinned.iter().any(|l| Arc::ptr_eq(l, loader)) {
            pinned.push(Arc::clone(loader));
        }
    }

    // ---- weak-def side map ----

    /// Counts resolutions; once past the threshold the map is built so
    /// later dlopens can coalesce without re-walking every image.
    pub fn note_weak_def_resolve(&self) {
        let n = self.weak_def_resolve_count.fetch_add(1, Ordering::Relaxed);
        if n + 1 == WEAK_DEF_MAP_THRESHOLD as usize {
            let mut map = self.weak_def_map.lock().unwrap();
            if map.is_none() {
                *map = Some(HashMap::new());
            }
        }
    }

    pub fn weak_def_map_record(&self, name: &str, value: WeakDefMapValue) {
        if let Some(map) = self.weak_def_map.lock().unwrap().as_mut() {
            map.insert(name.to_owned(), value);
        }
    }

    pub fn weak_def_map_lookup(&self, name: &str) -> Option<WeakDefMapValue> {
        self.weak_def_map.lock().unwrap().as_ref()?.get(name).cloned()
    }

    /// Force-create the map (used once coalescing starts at launch).
    pub fn enable_weak_def_map(&self) {
        let mut map = self.weak_def_map.lock().unwrap();
        if map.is_none() {
            *map = Some(HashMap::new());
        }
    }

    // ---- missing flat-lazy symbols ----

    pub fn add_missing_flat_lazy_symbol(
        &self,
        loader: &Arc<Loader>,
        symbol_name: &str,
        bind_loc: usize,
    ) {
        self.missing_flat_lazy_symbols
            .lock()
            .unwrap()
            .push(MissingFlatLazySymbol {
                loader: Arc::clone(loader),
                symbol_name: symbol_name.to_owned(),
                bind_loc,
            });
    }

    pub fn has_missing_flat_lazy_symbols(&self) -> bool {
        !self.missing_flat_lazy_symbols.lock().unwrap().is_empty()
    }

    pub(crate) fn remove_missing_flat_lazy_symbols(&self, removing: &[Arc<Loader>]) {
        self.missing_flat_lazy_symbols
            .lock()
            .unwrap()
            .retain(|m| !removing.iter().any(|r| Arc::ptr_eq(&m.loader, r)));
    }

    // ---- interposing ----

    /// Applies interpose tuples to a bind result: specific tuples for the
    /// image being fixed up win over the generic table.
    pub fn apply_interposing(&self, value: usize, for_loader: Option<&Arc<Loader>>) -> usize {
        if let Some(ldr) = for_loader {
            for tuple in self.interposing_tuples_specific.lock().unwrap().iter() {
                if tuple.replacee == value && Arc::ptr_eq(&tuple.only_image, ldr) {
                    return tuple.replacement;
                }
            }
        }
        for tuple in self.interposing_tuples_all.lock().unwrap().iter() {
            if tuple.replacee == value {
                if for_loader.is_none_or(|ldr| {
                    !self
                        .interposing_tuples_specific
                        .lock()
                        .unwrap()
                        .iter()
                        .any(|s| s.replacee == value && Arc::ptr_eq(&s.only_image, ldr))
                }) {
                    return tuple.replacement;
                }
            }
        }
        value
    }

    pub fn has_interpose_tuples(&self) -> bool {
        !self.interposing_tuples_all.lock().unwrap().is_empty()
    }

    // ---- permanent ranges (lock-free queries) ----

    /// Publishes the segment ranges of never-unload loaders. Append-only;
    /// release ordering pairs with the acquire in the reader.
    pub fn add_permanent_ranges(&self, loaders: &[Arc<Loader>]) {
        let mut ranges = Vec::new();
        for loader in loaders {
            let base = loader.load_address(self);
            if base == 0 {
                continue;
            }
            for region in loader.regions() {
                let start = base + region.vm_offset as usize;
                let end = start + region.file_size as usize;
                ranges.push((start, end, region.perms, Arc::clone(loader)));
            }
        }
        if ranges.is_empty() {
            return;
        }
        let node = Box::into_raw(Box::new(PermanentRangeNode {
            next: AtomicPtr::new(std::ptr::null_mut()),
            ranges,
        }));
        let mut head = self.permanent_ranges.load(Ordering::Acquire);
        loop {
            // SAFETY: nodes are never freed, so head remains valid
            unsafe { (*node).next.store(head, Ordering::Relaxed) };
            match self.permanent_ranges.compare_exchange_weak(
                head,
                node,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    /// True iff `[addr, addr+len)` lies inside a read-only mapped range of
    /// a never-unload image. Lock-free.
    pub fn is_memory_immutable(&self, addr: usize, len: usize) -> bool {
        self.in_permanent_range(addr, addr + len)
            .is_some_and(|perms| perms & 0x2 == 0)
    }

    pub fn in_permanent_range(&self, start: usize, end: usize) -> Option<u8> {
        let mut node = self.permanent_ranges.load(Ordering::Acquire);
        while !node.is_null() {
            // SAFETY: nodes are append-only and never freed
            let n = unsafe { &*node };
            for (rstart, rend, perms, _) in &n.ranges {
                if start >= *rstart && end <= *rend {
                    return Some(*perms);
                }
            }
            node = n.next.load(Ordering::Acquire);
        }
        None
    }

    // ---- prebuilt loader sets ----

    pub fn attach_prebuilt_set(&self, runtime: PrebuiltSetRuntime, app: bool) {
        let slot = if app {
            &self.process_set
        } else {
            &self.cached_dylibs_set
        };
        *slot.lock().unwrap() = Some(runtime);
    }

    pub fn detach_process_prebuilt_set(&self) {
        *self.process_set.lock().unwrap() = None;
    }

    pub fn with_prebuilt_set<R>(
        &self,
        app: bool,
        f: impl FnOnce(&PrebuiltSetRuntime) -> R,
    ) -> Option<R> {
        let slot = if app {
            &self.process_set
        } else {
            &self.cached_dylibs_set
        };
        slot.lock().unwrap().as_ref().map(f)
    }

    pub fn prebuilt_state_byte(&self, ref_: LoaderRef) -> u8 {
        self.with_prebuilt_set(ref_.from_app(), |rt| {
            rt.states
                .get(ref_.index() as usize)
                .map_or(0, |s| s.load(Ordering::Acquire))
        })
        .unwrap_or(0)
    }

    pub fn set_prebuilt_state_byte(&self, ref_: LoaderRef, value: u8) {
        self.with_prebuilt_set(ref_.from_app(), |rt| {
            if let Some(s) = rt.states.get(ref_.index() as usize) {
                s.store(value, Ordering::Release);
            }
        });
    }

    pub fn prebuilt_load_address(&self, ref_: LoaderRef) -> usize {
        self.with_prebuilt_set(ref_.from_app(), |rt| {
            rt.load_addrs
                .get(ref_.index() as usize)
                .map_or(0, |a| a.load(Ordering::Acquire))
        })
        .unwrap_or(0)
    }

    pub fn set_prebuilt_load_address(&self, ref_: LoaderRef, addr: usize) {
        self.with_prebuilt_set(ref_.from_app(), |rt| {
            if let Some(a) = rt.load_addrs.get(ref_.index() as usize) {
                a.store(addr, Ordering::Release);
            }
        });
    }

    pub fn prebuilt_handle(&self, ref_: LoaderRef) -> Option<Arc<Loader>> {
        self.with_prebuilt_set(ref_.from_app(), |rt| {
            rt.handles.get(ref_.index() as usize).cloned()
        })
        .flatten()
    }

    /// Valid prebuilt loader for `path`, the app set winning over the
    /// dyld-cache set.
    pub fn find_prebuilt_loader(&self, path: &str) -> Option<Arc<Loader>> {
        for app in [true, false] {
            let found = self
                .with_prebuilt_set(app, |rt| {
                    rt.handles.iter().find(|h| h.matches_path(path)).cloned()
                })
                .flatten();
            if let Some(h) = found {
                if h.prebuilt().is_some_and(|p| p.is_valid(self)) {
                    return Some(h);
                }
            }
        }
        None
    }

    // ---- must-be-missing paths ----

    /// Paths whose absence a future PrebuiltLoaderSet depends on; if one
    /// appears later the saved set must be invalidated.
    pub fn note_must_be_missing(&self, path: &str) {
        if path.starts_with('@') {
            return;
        }
        let mut paths = self.must_be_missing_paths.lock().unwrap();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_owned());
        }
    }

    pub fn must_be_missing_paths(&self) -> Vec<String> {
        self.must_be_missing_paths.lock().unwrap().clone()
    }

    // ---- misc flags ----

    /// TLV registration for an image, if it declared thread-locals.
    pub fn tlv_info_for(&self, loader: &Arc<Loader>) -> Option<TlvInfo> {
        self.tlv_infos
            .lock()
            .unwrap()
            .iter()
            .find(|i| Arc::ptr_eq(&i.loader, loader))
            .cloned()
    }

    pub fn record_cache_patch(&self, patch: RecordedCachePatch) {
        self.recorded_cache_patches.lock().unwrap().push(patch);
    }

    pub fn recorded_cache_patches(&self) -> Vec<RecordedCachePatch> {
        self.recorded_cache_patches.lock().unwrap().clone()
    }

    pub fn set_has_overridden_cached_dylib(&self) {
        self.has_overridden_cached_dylib.store(true, Ordering::Relaxed);
    }

    pub fn has_overridden_cached_dylib(&self) -> bool {
        self.has_overridden_cached_dylib.load(Ordering::Relaxed)
    }

    pub fn set_saved_prebuilt_loader_set(&self) {
        self.wrote_prebuilt_loader_set.store(true, Ordering::Relaxed);
    }

    pub fn did_save_prebuilt_loader_set(&self) -> bool {
        self.wrote_prebuilt_loader_set.load(Ordering::Relaxed)
    }

    // ---- launch failure reporting ----

    pub fn set_launch_missing_dylib(&self, missing_path: &str, client: &str) {
        let mut err = self.launch_error.lock().unwrap();
        err.kind = Some(LaunchErrorKind::DylibMissing);
        err.target_dylib_path = missing_path.to_owned();
        err.client_of_dylib_path = client.to_owned();
    }

    pub fn set_launch_missing_symbol(&self, symbol: &str, expected_in: &str, client: &str) {
        let mut err = self.launch_error.lock().unwrap();
        err.kind = Some(LaunchErrorKind::SymbolMissing);
        err.symbol = Some(symbol.to_owned());
        err.target_dylib_path = expected_in.to_owned();
        err.client_of_dylib_path = client.to_owned();
    }

    pub fn launch_error(&self) -> LaunchErrorInfo {
        self.launch_error.lock().unwrap().clone()
    }

    // ---- fork integration ----

    /// Before fork: quiesce the runtime by taking every recursive lock.
    pub fn take_locks_before_fork(&self) {
        self.locks.loaders.acquire();
        self.locks.notifiers.acquire();
        self.locks.tlv_infos.acquire();
    }

    /// Parent side after fork: plain release.
    pub fn release_locks_in_fork_parent(&self) {
        self.locks.tlv_infos.release();
        self.locks.notifiers.release();
        self.locks.loaders.release();
    }

    /// Child side after fork: the owning thread no longer exists, so the
    /// locks are forcibly reinitialized.
    pub fn reset_locks_in_fork_child(&self) {
        self.locks.loaders.reset_in_forked_child();
        self.locks.notifiers.reset_in_forked_child();
        self.locks.tlv_infos.reset_in_forked_child();
    }

    pub fn log(&self, msg: std::fmt::Arguments<'_>) {
        let _serialized = self.locks.log_serializer.lock().unwrap();
        log::info!("{msg}");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn recursive_lock_reenters_on_same_thread() {
        let lock = RecursiveLock::new();
        lock.with(|| {
            lock.with(|| {
                lock.with(|| {});
            });
        });
        // fully released: another thread can take it
        std::thread::scope(|s| {
            s.spawn(|| lock.with(|| {})).join().unwrap();
        });
    }

    #[test]
    fn recursive_lock_blocks_other_threads() {
        use std::sync::atomic::AtomicBool;
        let lock = Arc::new(RecursiveLock::new());
        let entered = Arc::new(AtomicBool::new(false));

        lock.acquire();
        let l2 = Arc::clone(&lock);
        let e2 = Arc::clone(&entered);
        let handle = std::thread::spawn(move || {
            l2.with(|| e2.store(true, Ordering::SeqCst));
        });
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        lock.release();
        handle.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
    }

    #[test]
    fn forked_child_reset_clears_ownership() {
        let lock = RecursiveLock::new();
        lock.acquire();
        lock.reset_in_forked_child();
        // reset state allows a fresh acquire/release pair
        lock.acquire();
        lock.release();
    }
}
