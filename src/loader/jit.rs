//! Loader built at runtime from a freshly mapped image.
//!
//! A JustInTimeLoader owns everything it learned from parsing the file:
//! segment regions, dependent requests, the exports-trie location, and —
//! once fixups run — the resolved bind targets that a later
//! PrebuiltLoaderSet serialization wants.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::cache::DataConstLazyWriter;
use crate::config::LogFlags;
use crate::errors::{Diagnostics, LoadError};
use crate::fixups;
use crate::mach::{DependentKind, DependentRequest, MachImage, select_slice};
use crate::state::RuntimeState;
use crate::syscall::{CodeSignatureInFile, FileId, OpenFlags};

use super::{
    ATTR_HAS_OBJC, ATTR_HAS_READ_ONLY_DATA, ATTR_HIDDEN_FROM_FLAT, ATTR_IN_DYLD_CACHE,
    ATTR_LEAVE_MAPPED, ATTR_MAY_HAVE_PLUS_LOAD, ATTR_NEVER_UNLOAD, FileValidationInfo, LoadChain,
    LoadOptions, Loader, LoaderState, Region, map_segments,
};

/// Root-over-cache bookkeeping: which cached dylib this image replaces
/// and where each patched export's implementation lives in the override.
#[derive(Clone)]
pub struct CacheOverride {
    pub index: u16,
    pub patches: Vec<super::DylibPatch>,
}

/// A bind target as resolved at fixup time, kept so the launch can be
/// serialized into a PrebuiltLoaderSet afterwards.
#[derive(Clone)]
pub enum ResolvedBindTarget {
    Image { loader: Arc<Loader>, offset: u64 },
    Absolute(u64),
}

pub struct JustInTimeLoader {
    pub path: String,
    /// install name, when it differs from the load path
    pub alt_install_name: Option<String>,
    pub file_id: FileId,
    pub slice_offset: u64,
    pub vm_space: u64,
    pub uuid: [u8; 16],
    pub regions: Vec<Region>,
    pub rpaths: Vec<String>,
    pub dep_requests: Vec<DependentRequest>,
    pub(crate) dependents: Mutex<Vec<Option<(Arc<Loader>, DependentKind)>>>,
    /// `(runtime offset, size)` of the exports trie
    pub exports_trie: Option<(u64, u32)>,
    pub code_signature: CodeSignatureInFile,
    /// backed by this cached dylib (no file on disk was mapped)
    pub cache_index: Option<u16>,
    pub(crate) override_of_cache: Mutex<Option<CacheOverride>>,
    pub file_validation: FileValidationInfo,
    pub has_initializers: bool,
    pub(crate) fixed_up: AtomicBool,
    pub(crate) bind_targets: Mutex<Vec<ResolvedBindTarget>>,
}

impl JustInTimeLoader {
    pub fn matches_path(&self, path: &str) -> bool {
        self.path == path
            || self
                .alt_install_name
                .as_deref()
                .is_some_and(|alt| alt == path)
    }

    pub fn dependent_count(&self) -> usize {
        self.dep_requests.len()
    }

    pub fn dependent_with_kind(&self, index: usize) -> Option<(Arc<Loader>, DependentKind)> {
        self.dependents.lock().unwrap().get(index)?.clone()
    }

    pub(crate) fn clear_dependents(&self) {
        self.dependents.lock().unwrap().clear();
    }

    pub(crate) fn record_bind_target(&self, target: ResolvedBindTarget) {
        self.bind_targets.lock().unwrap().push(target);
    }

    pub fn resolved_bind_targets(&self) -> Vec<ResolvedBindTarget> {
        self.bind_targets.lock().unwrap().clone()
    }

    pub fn cache_override(&self) -> Option<CacheOverride> {
        self.override_of_cache.lock().unwrap().clone()
    }
}

struct ParsedImage {
    install_name: Option<String>,
    uuid: [u8; 16],
    regions: Vec<Region>,
    vm_space: u64,
    rpaths: Vec<String>,
    dep_requests: Vec<DependentRequest>,
    exports_trie: Option<(u64, u32)>,
    code_signature: CodeSignatureInFile,
    has_objc: bool,
    may_have_plus_load: bool,
    has_read_only_data: bool,
    has_initializers: bool,
    has_tlvs: bool,
}

fn parse_image(
    path: &str,
    image: &MachImage<'_>,
    state: &RuntimeState,
    options: &LoadOptions<'_>,
) -> Result<ParsedImage, LoadError> {
    // file-type gate: what the request said it may be
    let type_ok = (image.is_dylib() && options.can_be_dylib)
        || (image.is_bundle() && options.can_be_bundle)
        || (image.is_main_executable() && options.can_be_executable);
    if !type_ok {
        return Err(LoadError::MachOMalformed {
            path: path.to_owned(),
            reason: format!(
                "mach-o file type {} is not loadable here",
                image.header().file_type
            ),
        });
    }

    // platform mismatch is a warning, not a refusal
    if let Some((platform, _min_os, _sdk)) = image.platform_version() {
        let process = state.config.platform;
        let compatible = platform == process.0
            || (process.is_catalyst() && platform == crate::config::PLATFORM_MACOS);
        if !compatible {
            log::warn!(
                "'{path}' was built for platform {platform}, process is {}",
                process.name()
            );
        }
    }

    let segments = image.segments();
    let regions: Vec<Region> = segments.iter().map(Region::from_segment).collect();
    if regions.is_empty() {
        return Err(LoadError::MachOMalformed {
            path: path.to_owned(),
            reason: "no mappable segments".to_owned(),
        });
    }

    let exports_trie = image.exports_trie().and_then(|range| {
        let vm_off = segments.iter().find_map(|s| {
            let fo = u64::from(range.file_offset);
            if fo >= s.file_offset && fo < s.file_offset + s.file_size {
                Some(s.vm_offset + (fo - s.file_offset))
            } else {
                None
            }
        })?;
        Some((vm_off, range.size))
    });

    Ok(ParsedImage {
        install_name: image.install_name(),
        uuid: image.uuid(),
        vm_space: image.vm_space(),
        rpaths: image.rpaths(),
        dep_requests: image.dependents(),
        exports_trie,
        code_signature: image
            .code_signature()
            .map(|r| CodeSignatureInFile {
                file_offset: r.file_offset,
                size: r.size,
            })
            .unwrap_or_default(),
        has_objc: image.has_objc(),
        may_have_plus_load: image.may_have_plus_load(),
        has_read_only_data: segments.iter().any(|s| s.read_only_data),
        has_initializers: !image.initializer_offsets(image.preferred_base()).is_empty(),
        has_tlvs: image.has_tlvs(),
        regions,
    })
}

fn attrs_for(parsed: &ParsedImage, options: &LoadOptions<'_>, in_cache: bool) -> u16 {
    let mut attrs = 0u16;
    if in_cache {
        attrs |= ATTR_IN_DYLD_CACHE | ATTR_NEVER_UNLOAD;
    }
    if parsed.has_objc {
        attrs |= ATTR_HAS_OBJC;
    }
    if parsed.may_have_plus_load {
        attrs |= ATTR_MAY_HAVE_PLUS_LOAD;
    }
    if parsed.has_read_only_data {
        attrs |= ATTR_HAS_READ_ONLY_DATA;
    }
    // anything wired into launch, or holding state that cannot be torn
    // down (ObjC classes, TLV blocks), must never unload
    if (options.launching || parsed.has_objc || parsed.has_tlvs) && !options.force_unloadable {
        attrs |= ATTR_NEVER_UNLOAD;
    }
    if options.rtld_no_delete {
        attrs |= ATTR_LEAVE_MAPPED;
    }
    if options.rtld_local {
        attrs |= ATTR_HIDDEN_FROM_FLAT;
    }
    attrs
}

/// Builds a loader for a file on disk: slice selection, parse, map, and
/// registration in `state.loaded` (in discovery order).
pub fn make_disk_loader(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    options: &LoadOptions<'_>,
    overrides_cache: Option<u16>,
) -> Result<Arc<Loader>, LoadError> {
    let syscalls = state.syscalls();
    let fd = syscalls.open(path, OpenFlags::READ, 0).map_err(|e| match e {
        crate::syscall::SyscallError::Perm => LoadError::PermissionDenied {
            path: path.to_owned(),
        },
        _ => LoadError::FileNotFound {
            path: path.to_owned(),
        },
    })?;
    let stat = syscalls.fstat(fd).map_err(|_| {
        syscalls.close(fd);
        LoadError::NotAFile {
            path: path.to_owned(),
        }
    })?;
    let mut buf = vec![0u8; stat.size as usize];
    let read = syscalls.pread(fd, &mut buf, 0).unwrap_or(0);
    syscalls.close(fd);
    buf.truncate(read);

    let (slice_offset, slice_len) = select_slice(path, &buf, state.config.arch)?;
    let slice = buf
        .get(slice_offset as usize..(slice_offset + slice_len) as usize)
        .ok_or_else(|| LoadError::MachOMalformed {
            path: path.to_owned(),
            reason: "slice extends past end of file".to_owned(),
        })?;
    let image = MachImage::parse(slice, false).map_err(|e| rewrite_path(e, path))?;
    let parsed = parse_image(path, &image, state, options)?;

    let mut map_validation = FileValidationInfo {
        slice_offset,
        ..Default::default()
    };
    let base = map_segments(
        diag,
        state,
        path,
        parsed.vm_space,
        &parsed.code_signature,
        &parsed.regions,
        &map_validation,
        &parsed.uuid,
    )?;

    // what a saved PrebuiltLoaderSet will revalidate next launch
    map_validation.inode = stat.inode;
    map_validation.mtime = stat.mtime;
    map_validation.check_inode_mtime = true;

    let alt_install_name = parsed
        .install_name
        .clone()
        .filter(|name| name != path);

    let jit = JustInTimeLoader {
        path: path.to_owned(),
        alt_install_name,
        file_id: FileId::from(&stat),
        slice_offset,
        vm_space: parsed.vm_space,
        uuid: parsed.uuid,
        regions: parsed.regions.clone(),
        rpaths: parsed.rpaths.clone(),
        dep_requests: parsed.dep_requests.clone(),
        dependents: Mutex::new(Vec::new()),
        exports_trie: parsed.exports_trie,
        code_signature: parsed.code_signature,
        cache_index: None,
        override_of_cache: Mutex::new(overrides_cache.map(|index| CacheOverride {
            index,
            patches: Vec::new(),
        })),
        file_validation: map_validation,
        has_initializers: parsed.has_initializers,
        fixed_up: AtomicBool::new(false),
        bind_targets: Mutex::new(Vec::new()),
    };

    let loader = Loader::new_jit(attrs_for(&parsed, options, false), jit, base);
    if state.config.log_enabled(LogFlags::LIBRARIES) {
        log::info!("loaded '{path}' at {base:#x}");
    }
    if overrides_cache.is_some() {
        state.set_has_overridden_cached_dylib();
        log::debug!("'{path}' overrides dylib in shared cache");
    }
    state.add(Arc::clone(&loader));
    crate::tlv::set_up_tlvs(state, &loader);
    Ok(loader)
}

/// Builds a loader over an image that lives inside the shared cache; no
/// file is opened, the cache mapping is the image.
pub fn make_cache_loader(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    path: &str,
    options: &LoadOptions<'_>,
    cache_index: u16,
) -> Result<Arc<Loader>, LoadError> {
    let _ = diag;
    let cache = state
        .config
        .shared_cache
        .as_deref()
        .ok_or_else(|| LoadError::Other("no shared cache attached".to_owned()))?;
    let dylib = cache
        .dylib(cache_index)
        .ok_or_else(|| LoadError::Other(format!("bad cache index {cache_index}")))?;
    let base = cache.base_addr + dylib.mh_vm_offset as usize;

    // SAFETY: the shared cache mapping is process-lifetime
    let image = unsafe { MachImage::from_mapped(base, dylib.vm_size as usize) }
        .map_err(|e| rewrite_path(e, path))?;
    let cache_options = LoadOptions {
        can_be_dylib: true,
        ..*options
    };
    let parsed = parse_image(path, &image, state, &cache_options)?;

    let jit = JustInTimeLoader {
        path: dylib.install_name.clone(),
        alt_install_name: None,
        file_id: FileId::none(),
        slice_offset: 0,
        vm_space: parsed.vm_space,
        uuid: parsed.uuid,
        regions: parsed.regions.clone(),
        rpaths: parsed.rpaths.clone(),
        dep_requests: parsed.dep_requests.clone(),
        dependents: Mutex::new(Vec::new()),
        exports_trie: parsed.exports_trie,
        code_signature: parsed.code_signature,
        cache_index: Some(cache_index),
        override_of_cache: Mutex::new(None),
        file_validation: FileValidationInfo::default(),
        has_initializers: parsed.has_initializers,
        fixed_up: AtomicBool::new(false),
        bind_targets: Mutex::new(Vec::new()),
    };

    let loader = Loader::new_jit(attrs_for(&parsed, options, true), jit, base);
    if state.config.log_enabled(LogFlags::LIBRARIES) {
        log::info!("using cached dylib '{path}'");
    }
    state.add(Arc::clone(&loader));
    crate::tlv::set_up_tlvs(state, &loader);
    Ok(loader)
}

/// Builds the loader for the main executable, which the kernel already
/// mapped at `config.main_executable_addr`.
pub fn make_main_executable_loader(state: &RuntimeState) -> Result<Arc<Loader>, LoadError> {
    let path = state.config.main_executable_path.clone();
    let base = state.config.main_executable_addr;
    let options = LoadOptions {
        launching: true,
        static_linkage: true,
        can_be_executable: true,
        use_fallback_paths: true,
        ..Default::default()
    };

    // SAFETY: the kernel's mapping of the main executable is
    // process-lifetime; the header is at its base
    let header = unsafe { &*(base as *const crate::mach::MachHeader) };
    let cmds_len = header.header_size() + header.size_commands as usize;
    // SAFETY: header + load commands are within the mapped __TEXT segment
    let header_image = unsafe { MachImage::from_mapped(base, cmds_len) }
        .map_err(|e| rewrite_path(e, &path))?;
    let vm_space = header_image.vm_space();
    // SAFETY: as above, now spanning the whole image
    let image = unsafe { MachImage::from_mapped(base, vm_space as usize) }
        .map_err(|e| rewrite_path(e, &path))?;
    let parsed = parse_image(&path, &image, state, &options)?;

    let stat = state.syscalls().stat(&path).unwrap_or_default();
    let jit = JustInTimeLoader {
        path: path.clone(),
        alt_install_name: None,
        file_id: FileId::from(&stat),
        slice_offset: 0,
        vm_space: parsed.vm_space,
        uuid: parsed.uuid,
        regions: parsed.regions.clone(),
        rpaths: parsed.rpaths.clone(),
        dep_requests: parsed.dep_requests.clone(),
        dependents: Mutex::new(Vec::new()),
        exports_trie: parsed.exports_trie,
        code_signature: parsed.code_signature,
        cache_index: None,
        override_of_cache: Mutex::new(None),
        file_validation: FileValidationInfo {
            inode: stat.inode,
            mtime: stat.mtime,
            check_inode_mtime: stat.inode != 0,
            ..Default::default()
        },
        has_initializers: parsed.has_initializers,
        fixed_up: AtomicBool::new(false),
        bind_targets: Mutex::new(Vec::new()),
    };
    let mut attrs = attrs_for(&parsed, &options, false);
    attrs |= super::ATTR_NEVER_UNLOAD;
    let loader = Loader::new_jit(attrs, jit, base);
    state.add(Arc::clone(&loader));
    state.set_main_loader(Arc::clone(&loader));
    crate::tlv::set_up_tlvs(state, &loader);
    Ok(loader)
}

fn rewrite_path(err: LoadError, path: &str) -> LoadError {
    match err {
        LoadError::MachOMalformed { reason, .. } => LoadError::MachOMalformed {
            path: path.to_owned(),
            reason,
        },
        other => other,
    }
}

/// Recursive dependent discovery: resolve each load command, then recurse
/// into the children, giving the loaded-list its bottom-up launch order.
pub fn load_dependents(
    loader: &Arc<Loader>,
    diag: &mut Diagnostics,
    state: &RuntimeState,
    options: &LoadOptions<'_>,
) -> Result<(), LoadError> {
    let current = loader.loader_state(state);
    if current as u8 >= LoaderState::MappingDependents as u8 {
        return Ok(());
    }
    loader.set_loader_state(state, LoaderState::MappingDependents);

    let jit = loader
        .jit()
        .expect("load_dependents(jit) dispatched on prebuilt loader");
    let chain = LoadChain {
        previous: options.rpath_stack,
        image: Arc::clone(loader),
    };

    let mut children: Vec<Option<(Arc<Loader>, DependentKind)>> = Vec::new();
    for request in &jit.dep_requests {
        let dep_options = LoadOptions {
            can_be_missing: request.kind == DependentKind::WeakLink,
            rtld_no_load: false,
            rtld_local: false,
            rtld_no_delete: false,
            inserted_dylib: false,
            can_be_dylib: true,
            can_be_bundle: false,
            can_be_executable: false,
            use_fallback_paths: true,
            static_linkage: true,
            rpath_stack: Some(&chain),
            ..*options
        };
        match super::get_loader(diag, state, &request.path, &dep_options) {
            Some(child) => children.push(Some((child, request.kind))),
            None => {
                if request.kind == DependentKind::WeakLink {
                    children.push(None);
                    continue;
                }
                let err = LoadError::DylibMissing {
                    path: request.path.clone(),
                    referenced_from: jit.path.clone(),
                };
                if options.launching {
                    state.set_launch_missing_dylib(&request.path, &jit.path);
                }
                loader.set_loader_state(state, LoaderState::Mapped);
                diag.error(&err);
                return Err(err);
            }
        }
    }
    *jit.dependents.lock().unwrap() = children.clone();

    for child in children.into_iter().flatten() {
        let (child, kind) = child;
        // upward edges are resolved later by the initializer walk; the
        // child is already mapped, recursing would loop
        if kind == DependentKind::Upward {
            continue;
        }
        child.load_dependents(diag, state, options)?;
    }

    loader.set_loader_state(state, LoaderState::DependentsMapped);
    Ok(())
}

pub fn apply_fixups(
    loader: &Arc<Loader>,
    diag: &mut Diagnostics,
    state: &RuntimeState,
    cache_writer: &mut DataConstLazyWriter<'_>,
    allow_lazy_binds: bool,
) -> Result<(), LoadError> {
    let jit = loader
        .jit()
        .expect("apply_fixups(jit) dispatched on prebuilt loader");
    if jit.fixed_up.swap(true, Ordering::AcqRel) {
        return Ok(());
    }

    // cached dylibs were pre-bound by the cache builder; they only need
    // patch-back when something overrides them, handled elsewhere
    if loader.dylib_in_dyld_cache() {
        loader.set_loader_state(state, LoaderState::FixedUp);
        return Ok(());
    }

    fixups::apply_fixups_generic(diag, state, loader, cache_writer, allow_lazy_binds)?;
    loader.set_loader_state(state, LoaderState::FixedUp);
    if state.config.log_enabled(LogFlags::FIXUPS) {
        log::info!("fixed up '{}'", jit.path);
    }
    Ok(())
}

/// Builds the DylibPatch table for a root that overrides a cached dylib:
/// one entry per patched export of the overridden dylib, resolved in the
/// override image. Terminated by the `-1` sentinel at serialization time.
pub fn build_override_patch_table(state: &RuntimeState, loader: &Arc<Loader>) {
    use super::DylibPatch;

    let Some(cache) = state.config.shared_cache.as_deref() else {
        return;
    };
    let Some(jit) = loader.jit() else { return };
    let mut override_slot = jit.override_of_cache.lock().unwrap();
    let Some(ovr) = override_slot.as_mut() else {
        return;
    };

    let mut patches = Vec::new();
    for export_offset in cache.patched_exports_of(ovr.index) {
        let impl_offset = cache
            .export_name_for(ovr.index, export_offset)
            .and_then(|name| {
                crate::resolve::search_one_image(state, loader, &name).map(|(_, off)| off as i64)
            });
        patches.push(DylibPatch {
            override_offset_of_impl: impl_offset.unwrap_or(DylibPatch::MISSING_SYMBOL),
        });
    }
    ovr.patches = patches;
}

#[cfg(test)]
pub(crate) fn make_test_loader(path: &str, rpaths: Vec<String>) -> Arc<Loader> {
    make_test_loader_with_deps(path, rpaths, Vec::new())
}

#[cfg(test)]
pub(crate) fn make_test_loader_with_deps(
    path: &str,
    rpaths: Vec<String>,
    deps: Vec<(Arc<Loader>, DependentKind)>,
) -> Arc<Loader> {
    let dep_requests = deps
        .iter()
        .map(|(l, kind)| DependentRequest {
            path: l.path().to_owned(),
            kind: *kind,
        })
        .collect();
    let jit = JustInTimeLoader {
        path: path.to_owned(),
        alt_install_name: None,
        file_id: FileId::none(),
        slice_offset: 0,
        vm_space: 0x4000,
        uuid: [0; 16],
        regions: Vec::new(),
        rpaths,
        dep_requests,
        dependents: Mutex::new(deps.into_iter().map(Some).collect()),
        exports_trie: None,
        code_signature: CodeSignatureInFile::default(),
        cache_index: None,
        override_of_cache: Mutex::new(None),
        file_validation: FileValidationInfo::default(),
        has_initializers: false,
        fixed_up: AtomicBool::new(false),
        bind_targets: Mutex::new(Vec::new()),
    };
    Loader::new_jit(0, jit, 0)
}
