//! One `Loader` per mapped mach-o image.
//!
//! `Loader` is a small shared header plus a kind payload: a
//! [`JustInTimeLoader`] built at runtime from a freshly mapped image, or a
//! [`PrebuiltLoader`] interpreting a serialized record inside a
//! [`crate::prebuilt_set::PrebuiltLoaderSet`]. Every public method
//! validates the header magic before dispatching so a corrupted loader
//! pointer is rejected rather than followed.

pub mod jit;
pub mod prebuilt;

use std::sync::Arc;
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU8, AtomicUsize, Ordering};

pub use jit::JustInTimeLoader;
pub use prebuilt::{BindTargetRef, DylibPatch, PrebuiltLoader};

use crate::cache::DataConstLazyWriter;
use crate::config::leaf_name;
use crate::errors::{Diagnostics, LoadError};
use crate::mach::{self, DependentKind, MachImage};
use crate::state::RuntimeState;
use crate::syscall::{CodeSignatureInFile, FileId, OpenFlags, Prot};

/// 'l4yd'
pub const LOADER_MAGIC: u32 = 0x6c34_7964;

/// Poison value the reaper scribbles over a dead loader's header.
pub const LOADER_MAGIC_DEAD: u32 = 0xdeadbeef;

/// Compact `(set, index)` handle for a PrebuiltLoader: 15-bit index into
/// a set, one bit selecting the app set over the dyld-cache set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoaderRef(u16);

impl LoaderRef {
    const MISSING_WEAK_INDEX: u16 = 0x7fff;

    pub fn new(from_app: bool, index: u16) -> Self {
        debug_assert!(index <= Self::MISSING_WEAK_INDEX);
        Self((index & 0x7fff) | if from_app { 0x8000 } else { 0 })
    }

    pub fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u16 {
        self.0
    }

    pub fn index(self) -> u16 {
        self.0 & 0x7fff
    }

    pub fn from_app(self) -> bool {
        self.0 & 0x8000 != 0
    }

    /// Sentinel recorded for a weak-linked dependent that was missing
    /// when the set was built.
    pub fn missing_weak_image() -> Self {
        Self::new(false, Self::MISSING_WEAK_INDEX)
    }

    pub fn is_missing_weak_image(self) -> bool {
        self.index() == Self::MISSING_WEAK_INDEX && !self.from_app()
    }
}

// attribute bits shared by both loader kinds
pub const ATTR_IN_DYLD_CACHE: u16 = 1 << 0;
pub const ATTR_HAS_OBJC: u16 = 1 << 1;
pub const ATTR_MAY_HAVE_PLUS_LOAD: u16 = 1 << 2;
pub const ATTR_HAS_READ_ONLY_DATA: u16 = 1 << 3;
pub const ATTR_NEVER_UNLOAD: u16 = 1 << 4;
pub const ATTR_LEAVE_MAPPED: u16 = 1 << 5;
pub const ATTR_HIDDEN_FROM_FLAT: u16 = 1 << 6;

/// Lifecycle states. JustInTimeLoaders begin at `Mapped`; PrebuiltLoaders
/// walk the validation states first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LoaderState {
    Unknown = 0,
    BeingValidated = 1,
    NotMapped = 2,
    Mapped = 3,
    MappingDependents = 4,
    DependentsMapped = 5,
    FixedUp = 6,
    BeingInitialized = 7,
    Initialized = 8,
    Invalid = 255,
}

impl LoaderState {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::BeingValidated,
            2 => Self::NotMapped,
            3 => Self::Mapped,
            4 => Self::MappingDependents,
            5 => Self::DependentsMapped,
            6 => Self::FixedUp,
            7 => Self::BeingInitialized,
            8 => Self::Initialized,
            255 => Self::Invalid,
            _ => Self::Unknown,
        }
    }
}

/// Options threaded through dependent discovery and `dlopen`.
#[derive(Clone, Copy, Default)]
pub struct LoadOptions<'a> {
    pub launching: bool,
    pub static_linkage: bool,
    pub can_be_missing: bool,
    pub rtld_local: bool,
    pub rtld_no_delete: bool,
    pub rtld_no_load: bool,
    pub inserted_dylib: bool,
    pub can_be_dylib: bool,
    pub can_be_bundle: bool,
    pub can_be_executable: bool,
    pub force_unloadable: bool,
    pub use_fallback_paths: bool,
    pub rpath_stack: Option<&'a LoadChain<'a>>,
}

/// Stack of images currently being loaded, used for `@rpath` expansion.
pub struct LoadChain<'a> {
    pub previous: Option<&'a LoadChain<'a>>,
    pub image: Arc<Loader>,
}

/// Outcome of a symbol lookup.
#[derive(Clone)]
pub enum ResolvedTarget {
    /// no symbol involved, fixup location just gets the slide added
    Rebase,
    Image { loader: Arc<Loader>, offset: u64 },
    Absolute { value: u64 },
}

#[derive(Clone)]
pub struct ResolvedSymbol {
    pub target: ResolvedTarget,
    pub name: String,
    pub is_code: bool,
    pub is_weak_def: bool,
    /// lazy bind that found nothing; points at the sentinel and was
    /// recorded for post-dlopen rebinding
    pub is_missing_lazy: bool,
}

impl ResolvedSymbol {
    pub fn absolute(name: &str, value: u64) -> Self {
        Self {
            target: ResolvedTarget::Absolute { value },
            name: name.to_owned(),
            is_code: false,
            is_weak_def: false,
            is_missing_lazy: false,
        }
    }

    /// Runtime address this resolution denotes.
    pub fn resolved_address(&self, state: &RuntimeState) -> usize {
        match &self.target {
            ResolvedTarget::Rebase => 0,
            ResolvedTarget::Image { loader, offset } => {
                loader.load_address(state).wrapping_add(*offset as usize)
            }
            ResolvedTarget::Absolute { value } => *value as usize,
        }
    }
}

/// Segment map entry, stored in PrebuiltLoaders and generated on the fly
/// by JustInTimeLoaders, consumed by `map_segments`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Region {
    pub vm_offset: u64,
    pub perms: u8,
    pub is_zero_fill: bool,
    pub read_only_data: bool,
    pub file_offset: u32,
    pub file_size: u32,
}

impl Region {
    const VM_OFFSET_BITS: u64 = 59;

    /// Packs into the serialized two-word form:
    /// `vmOffset:59 | perms:3 | isZeroFill:1 | readOnlyData:1`, then
    /// `fileOffset:32 | fileSize:32`.
    pub fn to_words(&self) -> (u64, u64) {
        debug_assert!(self.vm_offset < (1 << Self::VM_OFFSET_BITS));
        let word0 = (self.vm_offset & ((1 << Self::VM_OFFSET_BITS) - 1))
            | (u64::from(self.perms & 0x7) << 59)
            | (u64::from(self.is_zero_fill) << 62)
            | (u64::from(self.read_only_data) << 63);
        let word1 = u64::from(self.file_offset) | (u64::from(self.file_size) << 32);
        (word0, word1)
    }

    pub fn from_words(word0: u64, word1: u64) -> Self {
        Self {
            vm_offset: word0 & ((1 << Self::VM_OFFSET_BITS) - 1),
            perms: ((word0 >> 59) & 0x7) as u8,
            is_zero_fill: (word0 >> 62) & 1 != 0,
            read_only_data: (word0 >> 63) != 0,
            file_offset: (word1 & 0xffff_ffff) as u32,
            file_size: (word1 >> 32) as u32,
        }
    }

    pub fn prot(&self) -> Prot {
        let mut prot = Prot::empty();
        if self.perms & 1 != 0 {
            prot |= Prot::READ;
        }
        if self.perms & 2 != 0 {
            prot |= Prot::WRITE;
        }
        if self.perms & 4 != 0 {
            prot |= Prot::EXEC;
        }
        prot
    }

    /// `file_size` carries the region's mapped span; for zero-fill
    /// regions that is the zero-fill size, not a file extent.
    pub fn from_segment(seg: &mach::SegmentInfo) -> Self {
        let zero_fill = seg.file_size == 0 && seg.vm_size != 0;
        Self {
            vm_offset: seg.vm_offset,
            perms: (seg.init_prot & 0x7) as u8,
            is_zero_fill: zero_fill,
            read_only_data: seg.read_only_data,
            file_offset: seg.file_offset as u32,
            file_size: if zero_fill {
                seg.vm_size as u32
            } else {
                seg.file_size as u32
            },
        }
    }
}

/// Identity checks recorded for files outside the shared cache. At least
/// one of the two checks is set for any on-disk file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileValidationInfo {
    pub slice_offset: u64,
    pub inode: u64,
    pub mtime: u64,
    pub cd_hash: [u8; 20],
    pub check_inode_mtime: bool,
    pub check_cd_hash: bool,
}

/// Binds whose flat-namespace lazy lookup found nothing at launch;
/// re-checked after each dlopen.
#[derive(Clone)]
pub struct MissingFlatLazySymbol {
    pub loader: Arc<Loader>,
    pub symbol_name: String,
    pub bind_loc: usize,
}

pub struct Loader {
    magic: AtomicU32,
    attrs: AtomicU16,
    pub ref_: LoaderRef,
    /// lifecycle for jit loaders; prebuilt loaders keep theirs in the
    /// per-process state array so the record itself stays read-only
    state: AtomicU8,
    load_address: AtomicUsize,
    kind: LoaderKind,
}

pub enum LoaderKind {
    Jit(JustInTimeLoader),
    Prebuilt(PrebuiltLoader),
}

impl Loader {
    pub(crate) fn new_jit(attrs: u16, jit: JustInTimeLoader, load_address: usize) -> Arc<Self> {
        Arc::new(Self {
            magic: AtomicU32::new(LOADER_MAGIC),
            attrs: AtomicU16::new(attrs),
            ref_: LoaderRef::new(false, 0),
            state: AtomicU8::new(LoaderState::Mapped as u8),
            load_address: AtomicUsize::new(load_address),
            kind: LoaderKind::Jit(jit),
        })
    }

    pub(crate) fn new_prebuilt(attrs: u16, ref_: LoaderRef, pb: PrebuiltLoader) -> Arc<Self> {
        Arc::new(Self {
            magic: AtomicU32::new(LOADER_MAGIC),
            attrs: AtomicU16::new(attrs),
            ref_,
            state: AtomicU8::new(LoaderState::Unknown as u8),
            load_address: AtomicUsize::new(0),
            kind: LoaderKind::Prebuilt(pb),
        })
    }

    /// Magic gate on every dispatch; a stale or scribbled-over loader
    /// header must never be followed.
    fn checked(&self) -> &Self {
        let magic = self.magic.load(Ordering::Relaxed);
        assert!(
            magic == LOADER_MAGIC,
            "loader magic invalid (0x{magic:x}), refusing dispatch"
        );
        self
    }

    pub fn has_magic(&self) -> bool {
        self.magic.load(Ordering::Relaxed) == LOADER_MAGIC
    }

    pub(crate) fn poison(&self) {
        self.magic.store(LOADER_MAGIC_DEAD, Ordering::Relaxed);
    }

    pub fn is_prebuilt(&self) -> bool {
        matches!(self.checked().kind, LoaderKind::Prebuilt(_))
    }

    pub fn jit(&self) -> Option<&JustInTimeLoader> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => Some(j),
            LoaderKind::Prebuilt(_) => None,
        }
    }

    pub fn prebuilt(&self) -> Option<&PrebuiltLoader> {
        match &self.checked().kind {
            LoaderKind::Prebuilt(p) => Some(p),
            LoaderKind::Jit(_) => None,
        }
    }

    // attribute accessors

    fn attr(&self, bit: u16) -> bool {
        self.attrs.load(Ordering::Relaxed) & bit != 0
    }

    pub(crate) fn attrs_raw(&self) -> u16 {
        self.attrs.load(Ordering::Relaxed)
    }

    pub(crate) fn set_attr(&self, bit: u16, value: bool) {
        if value {
            self.attrs.fetch_or(bit, Ordering::Relaxed);
        } else {
            self.attrs.fetch_and(!bit, Ordering::Relaxed);
        }
    }

    pub fn dylib_in_dyld_cache(&self) -> bool {
        self.attr(ATTR_IN_DYLD_CACHE)
    }

    pub fn has_objc(&self) -> bool {
        self.attr(ATTR_HAS_OBJC)
    }

    pub fn may_have_plus_load(&self) -> bool {
        self.attr(ATTR_MAY_HAVE_PLUS_LOAD)
    }

    pub fn has_read_only_data(&self) -> bool {
        self.attr(ATTR_HAS_READ_ONLY_DATA)
    }

    pub fn never_unload(&self) -> bool {
        self.attr(ATTR_NEVER_UNLOAD)
    }

    pub fn leave_mapped(&self) -> bool {
        self.attr(ATTR_LEAVE_MAPPED)
    }

    /// RTLD_LOCAL images do not participate in flat lookup.
    pub fn hidden_from_flat(&self) -> bool {
        self.attr(ATTR_HIDDEN_FROM_FLAT)
    }

    // lifecycle

    pub fn loader_state(&self, state: &RuntimeState) -> LoaderState {
        match &self.checked().kind {
            LoaderKind::Jit(_) => LoaderState::from_u8(self.state.load(Ordering::Acquire)),
            LoaderKind::Prebuilt(p) => p.loader_state(state),
        }
    }

    pub(crate) fn set_loader_state(&self, state: &RuntimeState, new: LoaderState) {
        match &self.checked().kind {
            LoaderKind::Jit(_) => self.state.store(new as u8, Ordering::Release),
            LoaderKind::Prebuilt(p) => p.set_loader_state(state, new),
        }
    }

    pub fn load_address(&self, state: &RuntimeState) -> usize {
        match &self.checked().kind {
            LoaderKind::Jit(_) => self.load_address.load(Ordering::Acquire),
            LoaderKind::Prebuilt(p) => p.load_address(state),
        }
    }

    pub(crate) fn set_load_address(&self, state: &RuntimeState, addr: usize) {
        match &self.checked().kind {
            LoaderKind::Jit(_) => self.load_address.store(addr, Ordering::Release),
            LoaderKind::Prebuilt(p) => p.set_load_address(state, addr),
        }
    }

    // "virtual" methods

    pub fn path(&self) -> &str {
        match &self.checked().kind {
            LoaderKind::Jit(j) => &j.path,
            LoaderKind::Prebuilt(p) => p.path(),
        }
    }

    pub fn leaf_name(&self) -> &str {
        leaf_name(self.path())
    }

    pub fn matches_path(&self, path: &str) -> bool {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.matches_path(path),
            LoaderKind::Prebuilt(p) => p.matches_path(path),
        }
    }

    pub fn file_id(&self) -> FileId {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.file_id,
            LoaderKind::Prebuilt(p) => p.file_id(),
        }
    }

    pub fn dependent_count(&self) -> usize {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.dependent_count(),
            LoaderKind::Prebuilt(p) => p.dependent_count(),
        }
    }

    /// `None` for a weak-link miss.
    pub fn dependent(&self, state: &RuntimeState, index: usize) -> Option<Arc<Loader>> {
        self.dependent_with_kind(state, index).map(|(l, _)| l)
    }

    pub fn dependent_with_kind(
        &self,
        state: &RuntimeState,
        index: usize,
    ) -> Option<(Arc<Loader>, DependentKind)> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.dependent_with_kind(index),
            LoaderKind::Prebuilt(p) => p.dependent_with_kind(state, index),
        }
    }

    pub fn vm_space(&self) -> u64 {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.vm_space,
            LoaderKind::Prebuilt(p) => p.vm_space(),
        }
    }

    /// `(runtime offset, size)` of the exports trie, if the image has one.
    pub fn exports_trie(&self) -> Option<(u64, u32)> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.exports_trie,
            LoaderKind::Prebuilt(p) => p.exports_trie(),
        }
    }

    pub fn represents_cached_dylib_index(&self, index: u16) -> bool {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.cache_index == Some(index),
            LoaderKind::Prebuilt(p) => p.cached_dylib_index() == Some(index),
        }
    }

    /// Patch table and overridden cache index when this image is a root
    /// replacing a dylib the shared cache already bound.
    pub fn overrides_dylib_in_cache(&self) -> Option<(Vec<DylibPatch>, u16)> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.cache_override().map(|o| (o.patches, o.index)),
            LoaderKind::Prebuilt(p) => p.override_patches(),
        }
    }

    /// Segment containing `addr`, as `(seg_start, seg_size, perms)`.
    pub fn contains(&self, state: &RuntimeState, addr: usize) -> Option<(usize, u64, u8)> {
        let base = self.load_address(state);
        if base == 0 {
            return None;
        }
        for region in self.regions() {
            let start = base + region.vm_offset as usize;
            let size = u64::from(region.file_size);
            if addr >= start && (addr as u64) < start as u64 + size {
                return Some((start, size, region.perms));
            }
        }
        None
    }

    pub fn regions(&self) -> Vec<Region> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.regions.clone(),
            LoaderKind::Prebuilt(p) => p.regions(),
        }
    }

    pub fn uuid(&self) -> [u8; 16] {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.uuid,
            LoaderKind::Prebuilt(p) => p.uuid(),
        }
    }

    /// `LC_RPATH` entries. Prebuilt records don't carry them; their
    /// dependents were resolved when the set was built.
    pub fn rpaths(&self) -> Vec<String> {
        match &self.checked().kind {
            LoaderKind::Jit(j) => j.rpaths.clone(),
            LoaderKind::Prebuilt(_) => Vec::new(),
        }
    }

    /// Mapped view of this image for section walks.
    pub fn image<'a>(&self, state: &RuntimeState) -> Option<MachImage<'a>> {
        let base = self.load_address(state);
        if base == 0 {
            return None;
        }
        // SAFETY: the loader's mapping spans vm_space bytes and lives at
        // least until the reaper unmaps it, which cannot race a caller
        // holding the loaders lock
        unsafe { MachImage::from_mapped(base, self.vm_space() as usize) }.ok()
    }

    pub fn load_dependents(
        self: &Arc<Self>,
        diag: &mut Diagnostics,
        state: &RuntimeState,
        options: &LoadOptions<'_>,
    ) -> Result<(), LoadError> {
        match &self.checked().kind {
            LoaderKind::Jit(_) => jit::load_dependents(self, diag, state, options),
            LoaderKind::Prebuilt(_) => prebuilt::load_dependents(self, diag, state, options),
        }
    }

    pub fn apply_fixups(
        self: &Arc<Self>,
        diag: &mut Diagnostics,
        state: &RuntimeState,
        cache_writer: &mut DataConstLazyWriter<'_>,
        allow_lazy_binds: bool,
    ) -> Result<(), LoadError> {
        match &self.checked().kind {
            LoaderKind::Jit(_) => jit::apply_fixups(self, diag, state, cache_writer, allow_lazy_binds),
            LoaderKind::Prebuilt(_) => {
                prebuilt::apply_fixups(self, diag, state, cache_writer, allow_lazy_binds)
            }
        }
    }

    pub fn has_been_fixed_up(&self, state: &RuntimeState) -> bool {
        self.loader_state(state) as u8 >= LoaderState::FixedUp as u8
    }

    /// Advances `NotStarted -> BeingInitialized`; returns false when this
    /// image is already initializing or done (cycle or repeat).
    pub fn begin_initializers(&self, state: &RuntimeState) -> bool {
        let current = self.loader_state(state);
        if matches!(
            current,
            LoaderState::BeingInitialized | LoaderState::Initialized
        ) {
            return false;
        }
        self.set_loader_state(state, LoaderState::BeingInitialized);
        true
    }

    pub fn set_initialized(&self, state: &RuntimeState) {
        self.set_loader_state(state, LoaderState::Initialized);
    }

    /// Unmaps the image's reservation. `force` overrides `leaveMapped`.
    pub fn unmap(&self, state: &RuntimeState, force: bool) {
        if (self.leave_mapped() || self.never_unload()) && !force {
            return;
        }
        if self.dylib_in_dyld_cache() {
            return;
        }
        let base = self.load_address(state);
        if base != 0 {
            state.syscalls().munmap(base, self.vm_space() as usize);
        }
    }
}

/// Search `state.loaded` for a loader with this exact path.
pub fn already_loaded(state: &RuntimeState, load_path: &str) -> Option<Arc<Loader>> {
    state.with_loaded(|loaded| {
        loaded
            .iter()
            .find(|l| l.matches_path(load_path))
            .cloned()
    })
}

/// Resolves `load_path` to an existing or newly instantiated loader.
///
/// The tie-break order is: raw `@rpath/` forms against loaded images,
/// shared-cache alias canonicalization, then each candidate produced by
/// path expansion checked against loaded images, prebuilt loaders, the
/// filesystem, and the cache, in that order. A final `realpath` retry
/// covers symlinks into the cache.
pub fn get_loader(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    load_path: &str,
    options: &LoadOptions<'_>,
) -> Option<Arc<Loader>> {
    let result = get_loader_inner(diag, state, load_path, options, true);
    if result.is_none() && (options.can_be_missing || options.rtld_no_load) {
        // soft miss: the accumulated candidate errors must not leak into
        // a later dlerror
        diag.clear();
    }
    result
}

fn get_loader_inner(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    load_path: &str,
    options: &LoadOptions<'_>,
    allow_realpath_retry: bool,
) -> Option<Arc<Loader>> {
    // 1. a previous dlopen may have recorded the raw @rpath/ form
    if load_path.starts_with("@rpath/") {
        if let Some(existing) = already_loaded(state, load_path) {
            return Some(existing);
        }
    }

    // leaf-only dlopen names retry as @rpath/<leaf>, but only against
    // images that are already loaded
    if !load_path.contains('/') {
        let rpath_form = format!("@rpath/{load_path}");
        if let Some(existing) = already_loaded(state, &rpath_form) {
            return Some(existing);
        }
        if let Some(existing) = state.with_loaded(|loaded| {
            loaded
                .iter()
                .find(|l| l.leaf_name() == load_path)
                .cloned()
        }) {
            return Some(existing);
        }
    }

    // 2. canonicalize shared-cache aliases
    let canonical: String;
    let mut lookup_path = load_path;
    if let Some(cache) = state.config.shared_cache.as_deref() {
        if let Some(idx) = cache.index_of_path(load_path) {
            if let Some(dylib) = cache.dylib(idx) {
                if dylib.install_name != load_path {
                    canonical = dylib.install_name.clone();
                    lookup_path = &canonical;
                }
            }
        }
    }

    // 3. expand and probe candidates
    let mut found: Option<Arc<Loader>> = None;
    crate::path::for_each_path(
        diag,
        state,
        lookup_path,
        options,
        &mut |diag, candidate, _variant, stop| {
            if let Some(loader) = probe_candidate(diag, state, candidate, options) {
                found = Some(loader);
                *stop = true;
            }
        },
    );
    if found.is_some() {
        return found;
    }

    // 4. one realpath retry covers `..` and symlink-into-cache forms
    if allow_realpath_retry {
        if let Ok(real) = state.syscalls().realpath(lookup_path) {
            if real != lookup_path {
                return get_loader_inner(diag, state, &real, options, false);
            }
        }
    }

    if !diag.has_error() {
        diag.error(&LoadError::FileNotFound {
            path: load_path.to_owned(),
        });
    }
    None
}

fn probe_candidate(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    candidate: &str,
    options: &LoadOptions<'_>,
) -> Option<Arc<Loader>> {
    let cache = state.config.shared_cache.as_deref();
    let cache_index = cache.and_then(|c| c.index_of_path(candidate));

    // an already-loaded image wins: by path, file identity, or cache index
    let stat = state.syscalls().stat(candidate).ok();
    let file_id = stat.as_ref().map(FileId::from);
    let loaded_match = state.with_loaded(|loaded| {
        loaded
            .iter()
            .find(|l| {
                if l.matches_path(candidate) {
                    return true;
                }
                if let Some(fid) = file_id {
                    if fid.is_valid() && l.file_id() == fid {
                        return true;
                    }
                }
                if let Some(idx) = cache_index {
                    if l.represents_cached_dylib_index(idx) {
                        return true;
                    }
                }
                false
            })
            .cloned()
    });
    if loaded_match.is_some() {
        return loaded_match;
    }

    // RTLD_NOLOAD never constructs a new loader
    if options.rtld_no_load {
        return None;
    }

    // a valid PrebuiltLoader skips re-parsing entirely
    if let Some(loader) = state.find_prebuilt_loader(candidate) {
        if prebuilt::materialize(diag, state, &loader, options).is_ok() {
            return Some(loader);
        }
        return None;
    }

    // on a customer cache, don't stat unoverridable cached paths at all
    let skip_disk = cache_index.is_some()
        && state.config.is_customer_cache()
        && cache
            .and_then(|c| c.dylib(cache_index.unwrap()))
            .is_some_and(|d| !d.overridable);

    if !skip_disk {
        match &stat {
            Some(st) if st.is_regular_file() => {
                // a file on disk that shadows a cached dylib is a root:
                // it overrides the cache
                let overrides_cache = cache_index;
                match jit::make_disk_loader(diag, state, candidate, options, overrides_cache) {
                    Ok(loader) => return Some(loader),
                    Err(err) => {
                        diag.error(&err);
                        return None;
                    }
                }
            }
            Some(_) => {
                diag.error(&LoadError::NotAFile {
                    path: candidate.to_owned(),
                });
            }
            None => {}
        }
    }

    if let Some(idx) = cache_index {
        match jit::make_cache_loader(diag, state, candidate, options, idx) {
            Ok(loader) => return Some(loader),
            Err(err) => {
                diag.error(&err);
                return None;
            }
        }
    }

    if stat.is_none() && !skip_disk {
        diag.error(&LoadError::FileNotFound {
            path: candidate.to_owned(),
        });
        // remember paths whose absence a saved PrebuiltLoaderSet depends on
        state.note_must_be_missing(candidate);
    }
    None
}

/// Maps an image's segments per its region table and returns the base
/// address. Follows spec'd order: open, slice-select, revalidate,
/// code-sign attach, reserve, map, fair-play fixups, close.
pub fn map_segments(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    vm_space: u64,
    code_signature: &CodeSignatureInFile,
    regions: &[Region],
    file_validation: &FileValidationInfo,
    uuid: &[u8; 16],
) -> Result<usize, LoadError> {
    let syscalls = state.syscalls();
    let fd = syscalls
        .open(path, OpenFlags::READ, 0)
        .map_err(|e| match e {
            crate::syscall::SyscallError::Perm => LoadError::PermissionDenied {
                path: path.to_owned(),
            },
            _ => LoadError::FileNotFound {
                path: path.to_owned(),
            },
        })?;
    let result = map_segments_fd(
        diag,
        state,
        fd,
        path,
        vm_space,
        code_signature,
        regions,
        file_validation,
        uuid,
    );
    syscalls.close(fd);
    result
}

fn map_segments_fd(
    _diag: &mut Diagnostics,
    state: &RuntimeState,
    fd: i32,
    path: &str,
    vm_space: u64,
    code_signature: &CodeSignatureInFile,
    regions: &[Region],
    file_validation: &FileValidationInfo,
    uuid: &[u8; 16],
) -> Result<usize, LoadError> {
    let syscalls = state.syscalls();
    let stat = syscalls.fstat(fd).map_err(|_| LoadError::NotAFile {
        path: path.to_owned(),
    })?;

    // revalidate against what the PrebuiltLoader recorded
    if file_validation.check_inode_mtime
        && (stat.inode != file_validation.inode || stat.mtime != file_validation.mtime)
    {
        return Err(LoadError::PrebuiltLoaderInvalid {
            reason: format!("file changed since prebuilt loader was built: '{path}'"),
        });
    }
    if file_validation.check_cd_hash {
        let computed = compute_cd_hash(syscalls, fd, &stat, code_signature);
        if computed != file_validation.cd_hash {
            return Err(LoadError::PrebuiltLoaderInvalid {
                reason: format!("file cdHash changed since prebuilt loader was built: '{path}'"),
            });
        }
    }

    if code_signature.size != 0 {
        if let Err(kernel_reason) = syscalls.check_code_signature(fd, path, code_signature) {
            return Err(LoadError::CodeSignatureInvalid {
                path: path.to_owned(),
                kernel_reason,
                uuid: format_uuid(uuid),
            });
        }
    }

    let slice_offset = file_validation.slice_offset;
    let base = syscalls
        .vm_allocate(vm_space as usize)
        .map_err(|_| LoadError::Other(format!("vm_allocate({vm_space:#x}) failed for '{path}'")))?;

    let log_segments = state
        .config
        .log_enabled(crate::config::LogFlags::SEGMENTS);

    for region in regions {
        if region.is_zero_fill || region.file_size == 0 {
            continue;
        }
        let addr = base + region.vm_offset as usize;
        let mapped = syscalls.mmap(
            addr,
            region.file_size as usize,
            region.prot(),
            Some(fd),
            slice_offset + u64::from(region.file_offset),
        );
        match mapped {
            Ok(at) => {
                if log_segments {
                    log::info!(
                        "mapped {:#018x}..{:#018x} {}{}{} {}",
                        at,
                        at + region.file_size as usize,
                        if region.perms & 1 != 0 { "r" } else { "-" },
                        if region.perms & 2 != 0 { "w" } else { "-" },
                        if region.perms & 4 != 0 { "x" } else { "-" },
                        path
                    );
                }
            }
            Err(_) => {
                syscalls.vm_deallocate(base, vm_space as usize);
                return Err(LoadError::Other(format!(
                    "mmap of segment at {:#x} failed for '{path}'",
                    region.vm_offset
                )));
            }
        }
    }

    // the first region must contain the mach header
    let first_ok = regions
        .first()
        .is_some_and(|r| r.vm_offset == 0 && !r.is_zero_fill);
    let header_ok = first_ok && {
        // SAFETY: region 0 was just mapped at base with at least 4 bytes
        let magic = unsafe { *(base as *const u32) };
        magic == goblin::mach::header::MH_MAGIC_64 || magic == goblin::mach::header::MH_MAGIC
    };
    if !header_ok {
        syscalls.vm_deallocate(base, vm_space as usize);
        return Err(LoadError::MachOMalformed {
            path: path.to_owned(),
            reason: "mapped file does not start with a mach header".to_owned(),
        });
    }

    // SAFETY: the full reservation at base is mapped or reserved
    if let Ok(image) = unsafe { MachImage::from_mapped(base, vm_space as usize) } {
        for (crypt_off, crypt_size) in image.fairplay_ranges() {
            syscalls
                .mremap_encrypted(base + crypt_off as usize, crypt_size as usize)
                .map_err(|_| LoadError::Other(format!("mremap_encrypted failed for '{path}'")))?;
        }
    }

    Ok(base)
}

/// cdhash of the image's code-signature blob; images without a signature
/// hash their first page so validation still has something to pin.
pub fn compute_cd_hash(
    syscalls: &dyn crate::syscall::SyscallShim,
    fd: i32,
    stat: &crate::syscall::Stat,
    code_signature: &CodeSignatureInFile,
) -> [u8; 20] {
    use sha2::{Digest, Sha256};

    let (offset, len) = if code_signature.size != 0 {
        (u64::from(code_signature.file_offset), code_signature.size as usize)
    } else {
        (0, (stat.size as usize).min(0x1000))
    };
    let mut buf = vec![0u8; len];
    let mut hash = [0u8; 20];
    if syscalls.pread(fd, &mut buf, offset).is_ok() {
        let digest = Sha256::digest(&buf);
        hash.copy_from_slice(&digest[..20]);
    }
    hash
}

pub fn format_uuid(uuid: &[u8; 16]) -> String {
    format!(
        "{:02X}{:02X}{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}-{:02X}{:02X}{:02X}{:02X}{:02X}{:02X}",
        uuid[0], uuid[1], uuid[2], uuid[3], uuid[4], uuid[5], uuid[6], uuid[7],
        uuid[8], uuid[9], uuid[10], uuid[11], uuid[12], uuid[13], uuid[14], uuid[15]
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn loader_ref_packs_app_bit() {
        let r = LoaderRef::new(true, 42);
        assert_eq!(r.index(), 42);
        assert!(r.from_app());
        let c = LoaderRef::new(false, 7);
        assert!(!c.from_app());
        assert_eq!(c.index(), 7);
        assert!(LoaderRef::missing_weak_image().is_missing_weak_image());
        assert!(!r.is_missing_weak_image());
    }

    #[test]
    fn region_round_trips_through_packed_words() {
        let region = Region {
            vm_offset: 0x1_0000,
            perms: 0x3,
            is_zero_fill: true,
            read_only_data: true,
            file_offset: 0x4000,
            file_size: 0x2000,
        };
        let (w0, w1) = region.to_words();
        assert_eq!(Region::from_words(w0, w1), region);
    }

    #[test]
    fn uuid_formatting() {
        let uuid = [
            0xA1, 0xB2, 0xC3, 0xD4, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A,
            0x0B, 0x0C,
        ];
        assert_eq!(format_uuid(&uuid), "A1B2C3D4-0102-0304-0506-0708090A0B0C");
    }
}
