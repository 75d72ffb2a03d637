//! The dyld API surface exported to loaded code: dlopen/dlsym/dlclose,
//! image introspection, notification registration, TLS entry points, and
//! the fork hooks.
//!
//! Every load/unload body runs under the recursive API lock so observers
//! outside the loader see atomic transitions; initializers are free to
//! re-enter `dlopen` on the same thread.

use std::cell::RefCell;
use std::sync::{Arc, OnceLock};

use crate::config::LogFlags;
use crate::errors::Diagnostics;
use crate::helpers::{LibSystemHelpers, TlvTermFunc};
use crate::loader::{self, LoadOptions, Loader, LoaderState};
use crate::resolve::{self, DlsymMode};
use crate::state::RuntimeState;

bitflags::bitflags! {
    /// `dlopen` mode bits, matching the platform's values.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RtldMode: u32 {
        const LAZY = 0x1;
        const NOW = 0x2;
        const LOCAL = 0x4;
        const GLOBAL = 0x8;
        const NOLOAD = 0x10;
        const NODELETE = 0x80;
        const FIRST = 0x100;
    }
}

/// Opaque handle returned by [`DyldApis::dlopen`].
#[derive(Clone)]
pub struct DlHandle {
    loader: Arc<Loader>,
    first_only: bool,
}

impl DlHandle {
    pub fn loader(&self) -> &Arc<Loader> {
        &self.loader
    }
}

/// `dlsym` pseudo-handles.
pub enum DlsymHandle {
    Default,
    SelfImage,
    Next,
    MainOnly,
    Handle(DlHandle),
}

/// `dladdr` result.
pub struct DlInfo {
    pub fname: String,
    pub fbase: usize,
    pub sname: Option<String>,
    pub saddr: Option<usize>,
}

/// `_dyld_find_unwind_sections` result.
#[derive(Default)]
pub struct UnwindSections {
    pub mh: usize,
    pub dwarf_section: usize,
    pub dwarf_section_length: u64,
    pub compact_unwind_section: usize,
    pub compact_unwind_section_length: u64,
}

thread_local! {
    // dlerror text is per-thread and heap-owned so concurrent callers
    // never share a buffer
    static DLERROR: RefCell<Option<String>> = const { RefCell::new(None) };
}

fn set_dlerror(msg: String) {
    DLERROR.with(|slot| *slot.borrow_mut() = Some(msg));
}

pub struct DyldApis {
    state: Arc<RuntimeState>,
}

static PROCESS_APIS: OnceLock<DyldApis> = OnceLock::new();

/// Installs the process-scoped API instance. Called exactly once from
/// the launch entry point; the legacy C-shaped shims go through it.
pub fn bootstrap(state: Arc<RuntimeState>) -> &'static DyldApis {
    PROCESS_APIS.get_or_init(|| DyldApis { state })
}

pub fn process_apis() -> Option<&'static DyldApis> {
    PROCESS_APIS.get()
}

impl DyldApis {
    pub fn new(state: Arc<RuntimeState>) -> Self {
        Self { state }
    }

    pub fn state(&self) -> &RuntimeState {
        &self.state
    }

    // ---- dynamic linking ----

    pub fn dlopen(&self, path: Option<&str>, mode: RtldMode) -> Option<DlHandle> {
        self.dlopen_from(path, mode, 0)
    }

    /// `dlopen` with an explicit caller address, which anchors
    /// `@loader_path` and rpath expansion in the caller's image.
    pub fn dlopen_from(
        &self,
        path: Option<&str>,
        mode: RtldMode,
        caller_addr: usize,
    ) -> Option<DlHandle> {
        let state = &*self.state;
        if state.config.log_enabled(LogFlags::APIS) {
            log::info!("dlopen({}, {mode:?})", path.unwrap_or("NULL"));
        }

        // dlopen(NULL) is the main program
        let Some(path) = path else {
            let main = state.main_loader()?;
            return Some(DlHandle {
                loader: main,
                first_only: mode.contains(RtldMode::FIRST),
            });
        };

        state.locks.api.with(|| self.dlopen_locked(path, mode, caller_addr))
    }

    fn dlopen_locked(&self, path: &str, mode: RtldMode, caller_addr: usize) -> Option<DlHandle> {
        let state = &*self.state;
        let mut diag = Diagnostics::new();

        let caller = if caller_addr != 0 {
            state.loader_containing_address(caller_addr)
        } else {
            None
        };
        let chain = caller.map(|image| loader::LoadChain {
            previous: None,
            image,
        });

        let options = LoadOptions {
            launching: false,
            can_be_dylib: true,
            can_be_bundle: true,
            use_fallback_paths: true,
            rtld_local: mode.contains(RtldMode::LOCAL) && !mode.contains(RtldMode::GLOBAL),
            rtld_no_delete: mode.contains(RtldMode::NODELETE),
            rtld_no_load: mode.contains(RtldMode::NOLOAD),
            rpath_stack: chain.as_ref(),
            ..Default::default()
        };

        let before: Vec<Arc<Loader>> = state.with_loaded(|l| l.to_vec());
        let Some(opened) = loader::get_loader(&mut diag, state, path, &options) else {
            if !mode.contains(RtldMode::NOLOAD) {
                set_dlerror(format!("dlopen({path}): {}", diag.message()));
            }
            return None;
        };

        // promotions on an already-open image
        if mode.contains(RtldMode::NODELETE) {
            opened.set_attr(crate::loader::ATTR_LEAVE_MAPPED, true);
        }
        if mode.contains(RtldMode::GLOBAL) {
            opened.set_attr(crate::loader::ATTR_HIDDEN_FROM_FLAT, false);
        }

        let already_initialized = opened.loader_state(state) == LoaderState::Initialized;
        if !already_initialized {
            if opened.load_dependents(&mut diag, state, &options).is_err() {
                set_dlerror(format!("dlopen({path}): {}", diag.message()));
                self.unwind_partial_load(&before);
                return None;
            }

            let after: Vec<Arc<Loader>> = state.with_loaded(|l| l.to_vec());
            let new_loaders: Vec<Arc<Loader>> = after
                .iter()
                .filter(|l| !before.iter().any(|b| Arc::ptr_eq(b, l)))
                .cloned()
                .collect();

            if self.fixup_new_loaders(&mut diag, &new_loaders).is_err() {
                set_dlerror(format!("dlopen({path}): {}", diag.message()));
                self.unwind_partial_load(&before);
                return None;
            }
            crate::launch::apply_cache_patches_for_overrides(state, &new_loaders);

            crate::notifier::notify_load(state, &new_loaders);

            let permanent: Vec<Arc<Loader>> = new_loaders
                .iter()
                .filter(|l| l.never_unload() && !l.dylib_in_dyld_cache())
                .cloned()
                .collect();
            if !permanent.is_empty() {
                state.add_permanent_ranges(&permanent);
            }

            // binds that missed at launch may resolve against the new set
            crate::fixups::rebind_missing_flat_lazy_symbols(state);

            crate::init::run_initializers_bottom_up_plus_upward_links(state, &opened);
        }

        state.inc_dl_ref_count(&opened);
        Some(DlHandle {
            loader: opened,
            first_only: mode.contains(RtldMode::FIRST),
        })
    }

    fn fixup_new_loaders(
        &self,
        diag: &mut Diagnostics,
        new_loaders: &[Arc<Loader>],
    ) -> Result<(), crate::errors::LoadError> {
        let state = &*self.state;
        let inert;
        let cache = match state.config.shared_cache.as_deref() {
            Some(cache) => cache,
            None => {
                inert = crate::cache::DyldCache::new(0, 0, [0; 16], false);
                &inert
            }
        };
        let mut writer = crate::cache::DataConstLazyWriter::new(cache, state.syscalls());
        for loader in new_loaders.iter().rev() {
            loader.apply_fixups(diag, state, &mut writer, true)?;
        }
        Ok(())
    }

    /// A failed dlopen leaves nothing behind: images mapped for it are
    /// reaped immediately.
    fn unwind_partial_load(&self, before: &[Arc<Loader>]) {
        let state = &*self.state;
        let after: Vec<Arc<Loader>> = state.with_loaded(|l| l.to_vec());
        let orphans: Vec<Arc<Loader>> = after
            .iter()
            .filter(|l| !before.iter().any(|b| Arc::ptr_eq(b, l)))
            .filter(|l| !l.never_unload() && !l.dylib_in_dyld_cache())
            .cloned()
            .collect();
        if orphans.is_empty() {
            return;
        }
        state.remove_loaders(&orphans);
        for orphan in &orphans {
            state.remove_dynamic_dependencies(orphan);
            orphan.unmap(state, false);
            if let Some(jit) = orphan.jit() {
                jit.clear_dependents();
            }
            orphan.poison();
        }
    }

    pub fn dlclose(&self, handle: &DlHandle) -> i32 {
        let state = &*self.state;
        if state.config.log_enabled(LogFlags::APIS) {
            log::info!("dlclose({})", handle.loader.path());
        }
        if !handle.loader.has_magic() {
            set_dlerror("dlclose(): invalid handle".to_owned());
            return -1;
        }
        state.locks.api.with(|| {
            if state.dec_dl_ref_count(&handle.loader) {
                crate::reaper::garbage_collect(state);
            }
        });
        0
    }

    pub fn dlsym(
        &self,
        handle: &DlsymHandle,
        name: &str,
        caller_addr: usize,
    ) -> Option<usize> {
        let state = &*self.state;
        // C callers pass "malloc"; the mach-o namespace has "_malloc"
        let underscored = format!("_{name}");

        let mode = match handle {
            DlsymHandle::Default => DlsymMode::Default,
            DlsymHandle::MainOnly => DlsymMode::MainOnly,
            DlsymHandle::SelfImage => {
                let caller = state.loader_containing_address(caller_addr)?;
                DlsymMode::SelfAndDeps(caller)
            }
            DlsymHandle::Next => {
                let caller = state.loader_containing_address(caller_addr)?;
                DlsymMode::Next(caller)
            }
            DlsymHandle::Handle(h) => {
                if !h.loader.has_magic() {
                    set_dlerror("dlsym(): invalid handle".to_owned());
                    return None;
                }
                DlsymMode::Handle {
                    loader: Arc::clone(&h.loader),
                    first_only: h.first_only,
                }
            }
        };

        match resolve::dlsym_search(state, &underscored, &mode)
            .or_else(|| resolve::dlsym_search(state, name, &mode))
        {
            Some((_, addr)) => Some(addr),
            None => {
                set_dlerror(format!("dlsym(): symbol not found: {name}"));
                None
            }
        }
    }

    pub fn dlerror(&self) -> Option<String> {
        DLERROR.with(|slot| slot.borrow_mut().take())
    }

    pub fn dladdr(&self, addr: usize) -> Option<DlInfo> {
        let state = &*self.state;
        let loader = state.loader_containing_address(addr)?;
        let (sname, saddr) = match resolve::nearest_symbol_in_image(state, &loader, addr) {
            Some((name, sym_addr)) => (Some(name), Some(sym_addr)),
            None => (None, None),
        };
        Some(DlInfo {
            fname: loader.path().to_owned(),
            fbase: loader.load_address(state),
            sname,
            saddr,
        })
    }

    /// Checks whether a dlopen of `path` could succeed, without keeping
    /// anything loaded.
    pub fn dlopen_preflight(&self, path: &str) -> bool {
        let state = &*self.state;
        if loader::already_loaded(state, path).is_some() {
            return true;
        }
        if let Some(cache) = state.config.shared_cache.as_deref() {
            if cache.index_of_path(path).is_some() {
                return true;
            }
        }
        let syscalls = state.syscalls();
        let Ok(fd) = syscalls.open(path, crate::syscall::OpenFlags::READ, 0) else {
            return false;
        };
        let compatible = (|| {
            let stat = syscalls.fstat(fd).ok()?;
            let mut buf = vec![0u8; (stat.size as usize).min(0x8000)];
            syscalls.pread(fd, &mut buf, 0).ok()?;
            crate::mach::select_slice(path, &buf, state.config.arch).ok()
        })()
        .is_some();
        syscalls.close(fd);
        compatible
    }

    // ---- introspection ----

    pub fn image_count(&self) -> usize {
        self.state.loaded_count()
    }

    pub fn image_header(&self, index: usize) -> Option<usize> {
        let loader = self.state.loaded_at(index)?;
        Some(loader.load_address(&self.state))
    }

    pub fn image_name(&self, index: usize) -> Option<String> {
        let loader = self.state.loaded_at(index)?;
        Some(loader.path().to_owned())
    }

    pub fn image_slide(&self, index: usize) -> Option<isize> {
        let state = &*self.state;
        let loader = state.loaded_at(index)?;
        let image = loader.image(state)?;
        Some(loader.load_address(state) as isize - image.preferred_base() as isize)
    }

    pub fn image_uuid(&self, mh: usize) -> Option<[u8; 16]> {
        let state = &*self.state;
        state.with_loaded(|loaded| {
            loaded
                .iter()
                .find(|l| l.load_address(state) == mh)
                .map(|l| l.uuid())
        })
    }

    pub fn image_path_containing_address(&self, addr: usize) -> Option<String> {
        let loader = self.state.loader_containing_address(addr)?;
        Some(loader.path().to_owned())
    }

    pub fn images_for_addresses(&self, addrs: &[usize]) -> Vec<Option<DlInfo>> {
        addrs.iter().map(|&a| self.dladdr(a)).collect()
    }

    pub fn prog_image_header(&self) -> Option<usize> {
        let main = self.state.main_loader()?;
        Some(main.load_address(&self.state))
    }

    pub fn find_unwind_sections(&self, addr: usize) -> Option<UnwindSections> {
        let state = &*self.state;
        let loader = state.loader_containing_address(addr)?;
        let image = loader.image(state)?;
        let base = loader.load_address(state);
        let mut result = UnwindSections {
            mh: base,
            ..Default::default()
        };
        if let Some(eh) = image.find_section("__TEXT", "__eh_frame") {
            result.dwarf_section = base + eh.vm_offset as usize;
            result.dwarf_section_length = eh.size;
        }
        if let Some(cu) = image.find_section("__TEXT", "__unwind_info") {
            result.compact_unwind_section = base + cu.vm_offset as usize;
            result.compact_unwind_section_length = cu.size;
        }
        Some(result)
    }

    // ---- versioning ----

    pub fn active_platform(&self) -> u32 {
        self.state.config.platform.0
    }

    pub fn is_simulator_platform(&self) -> bool {
        self.state.config.platform.is_simulator()
    }

    pub fn sdk_version(&self, mh: usize) -> Option<u32> {
        self.platform_version_of(mh).map(|(_, _, sdk)| sdk)
    }

    pub fn min_os_version(&self, mh: usize) -> Option<u32> {
        self.platform_version_of(mh).map(|(_, min_os, _)| min_os)
    }

    pub fn program_sdk_at_least(&self, version: u32) -> bool {
        let main = match self.state.main_loader() {
            Some(m) => m.load_address(&self.state),
            None => return false,
        };
        self.sdk_version(main).is_some_and(|sdk| sdk >= version)
    }

    fn platform_version_of(&self, mh: usize) -> Option<(u32, u32, u32)> {
        let state = &*self.state;
        let loader = state.with_loaded(|loaded| {
            loaded
                .iter()
                .find(|l| l.load_address(state) == mh)
                .cloned()
        })?;
        loader.image(state)?.platform_version()
    }

    // ---- notifications ----

    pub fn register_func_for_add_image(&self, func: crate::state::ImageNotifier) {
        crate::notifier::add_notify_add_image(&self.state, func);
    }

    pub fn register_func_for_remove_image(&self, func: crate::state::ImageNotifier) {
        crate::notifier::add_notify_remove_image(&self.state, func);
    }

    pub fn register_for_image_loads(&self, func: crate::state::LoadNotifier) {
        crate::notifier::add_notify_load_image(&self.state, func);
    }

    pub fn register_for_bulk_image_loads(&self, func: crate::state::BulkLoadNotifier) {
        crate::notifier::add_notify_bulk_load_image(&self.state, func);
    }

    pub fn objc_notify_register(
        &self,
        mapped: crate::state::ObjCMappedNotifier,
        init: crate::state::ObjCSingleNotifier,
        unmapped: crate::state::ObjCSingleNotifier,
    ) {
        crate::notifier::set_objc_notifiers(&self.state, mapped, init, unmapped);
    }

    // ---- TLS ----

    pub fn tlv_atexit(&self, func: TlvTermFunc, obj_addr: usize) {
        crate::tlv::add_termination_func(&self.state, func, obj_addr);
    }

    pub fn tlv_exit(&self) {
        crate::tlv::exit_tlv(&self.state);
    }

    /// The linker-seeded thunk that must never actually run: reaching it
    /// means the image's TLV descriptors were never prepared.
    pub fn tlv_bootstrap(&self) -> ! {
        log::error!("_tlv_bootstrap called: TLV descriptors were not rewritten");
        std::process::abort();
    }

    pub fn tlv_get_addr(&self, key: u64, offset: usize) -> usize {
        crate::tlv::tlv_get_addr(&self.state, key, offset)
    }

    // ---- fork ----

    pub fn atfork_prepare(&self) {
        self.state.locks.api.acquire();
        self.state.take_locks_before_fork();
    }

    pub fn atfork_parent(&self) {
        self.state.release_locks_in_fork_parent();
        self.state.locks.api.release();
    }

    pub fn fork_child(&self) {
        self.state.reset_locks_in_fork_child();
        self.state.locks.api.reset_in_forked_child();
    }

    // ---- host wiring ----

    /// Installed by libSystem's initializer once it is far enough along
    /// to serve upcalls.
    pub fn set_libsystem_helpers(&self, helpers: Arc<dyn LibSystemHelpers>) {
        self.state.set_helpers(helpers);
        crate::tlv::finish_pending_tlv_setup(&self.state);
    }
}
