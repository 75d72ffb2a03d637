//! The on-disk PrebuiltLoaderSet: a self-contained, pointer-free blob of
//! serialized loader records plus the validation metadata that decides
//! whether the whole set may be trusted on a later launch.
//!
//! Little-endian throughout; every reference is an offset within the
//! blob. The file carries a boot token in its `com.apple.dyld` extended
//! attribute; a token mismatch (new OS, new main executable) means the
//! file is ignored without being read.
//!
//! Header layout:
//! ```text
//!  0  u32  magic 'sp4d'
//!  4  u32  version hash (must equal PREBUILT_LOADER_VERSION_HASH)
//!  8  u32  total length
//! 12  u32  loader count
//! 16  u32  loader-offsets array offset (u32 per loader)
//! 20  u32  cache patch count
//! 24  u32  cache patch table offset (16 bytes per entry)
//! 28  u32  dyld cache uuid offset (0 = none, 16 bytes)
//! 32  u32  must-be-missing path count
//! 36  u32  must-be-missing path table offset (NUL-separated)
//! 40  u32  objc selector hash table offset (0 = none)
//! 44  u32  objc class hash table offset (0 = none)
//! 48  u32  objc protocol hash table offset (0 = none)
//! 52  u32  reserved
//! 56  u64  objc protocol class cache offset
//! 64  ...  payload
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicUsize};

use scroll::{Pread, Pwrite};

use crate::arena::BumpArena;
use crate::errors::LoadError;
use crate::loader::jit::ResolvedBindTarget;
use crate::loader::prebuilt::{
    self, BindTargetRef, DylibPatch, NO_CACHE_INDEX, NO_UNZIPPERED_TWIN, PrebuiltLoader,
    RECORD_HEADER_SIZE,
};
use crate::loader::{LOADER_MAGIC, Loader, LoaderRef, Region};
use crate::state::{PrebuiltSetRuntime, RuntimeState};
use crate::syscall::OpenFlags;

/// 'sp4d'
pub const SET_MAGIC: u32 = 0x7370_3464;

/// Bumped whenever the serialized layout changes; a mismatch silently
/// demotes the set.
pub const PREBUILT_LOADER_VERSION_HASH: u32 = 0x9a31_c5d2;

pub const BOOT_TOKEN_XATTR: &str = "com.apple.dyld";
pub const MAX_BOOT_TOKEN_SIZE: usize = 128;

const HEADER_SIZE: usize = 64;

/// A cache location patched during the recorded launch, replayed when
/// the set is used.
#[derive(Debug, Clone, Copy)]
pub struct CachePatch {
    pub cache_dylib_index: u32,
    pub cache_dylib_vm_offset: u32,
    pub patch_to: BindTargetRef,
}

pub struct PrebuiltLoaderSet {
    bytes: Vec<u8>,
}

impl PrebuiltLoaderSet {
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Arc<Self>, LoadError> {
        let set = Arc::new(Self { bytes });
        if !set.has_valid_magic() {
            return Err(LoadError::PrebuiltLoaderInvalid {
                reason: "bad magic or version hash".to_owned(),
            });
        }
        Ok(set)
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    fn read_u32(&self, off: usize) -> u32 {
        self.bytes.pread_with(off, scroll::LE).unwrap_or(0)
    }

    pub fn has_valid_magic(&self) -> bool {
        self.bytes.len() >= HEADER_SIZE
            && self.read_u32(0) == SET_MAGIC
            && self.read_u32(4) == PREBUILT_LOADER_VERSION_HASH
            && self.read_u32(8) as usize == self.bytes.len()
    }

    pub fn loader_count(&self) -> usize {
        self.read_u32(12) as usize
    }

    pub fn record_offset(&self, index: u16) -> Option<usize> {
        if usize::from(index) >= self.loader_count() {
            return None;
        }
        let array = self.read_u32(16) as usize;
        Some(self.read_u32(array + usize::from(index) * 4) as usize)
    }

    pub fn cache_uuid(&self) -> Option<[u8; 16]> {
        let off = self.read_u32(28) as usize;
        if off == 0 {
            return None;
        }
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(self.bytes.get(off..off + 16)?);
        Some(uuid)
    }

    pub fn for_each_must_be_missing_path(&self, mut f: impl FnMut(&str, &mut bool)) {
        let count = self.read_u32(32) as usize;
        let mut off = self.read_u32(36) as usize;
        let mut stop = false;
        for _ in 0..count {
            let Some(tail) = self.bytes.get(off..) else {
                return;
            };
            let Some(end) = tail.iter().position(|&b| b == 0) else {
                return;
            };
            if let Ok(path) = std::str::from_utf8(&tail[..end]) {
                f(path, &mut stop);
                if stop {
                    return;
                }
            }
            off += end + 1;
        }
    }

    pub fn for_each_cache_patch(&self, mut f: impl FnMut(&CachePatch)) {
        let count = self.read_u32(20) as usize;
        let table = self.read_u32(24) as usize;
        for i in 0..count {
            let off = table + i * 16;
            let patch = CachePatch {
                cache_dylib_index: self.read_u32(off),
                cache_dylib_vm_offset: self.read_u32(off + 4),
                patch_to: BindTargetRef::from_raw(
                    self.bytes.pread_with(off + 8, scroll::LE).unwrap_or(0),
                ),
            };
            f(&patch);
        }
    }

    pub fn objc_selector_hash_table(&self) -> Option<u32> {
        match self.read_u32(40) {
            0 => None,
            off => Some(off),
        }
    }

    pub fn objc_class_hash_table(&self) -> Option<u32> {
        match self.read_u32(44) {
            0 => None,
            off => Some(off),
        }
    }

    pub fn objc_protocol_hash_table(&self) -> Option<u32> {
        match self.read_u32(48) {
            0 => None,
            off => Some(off),
        }
    }

    pub fn find_index(&self, path: &str) -> Option<u16> {
        for i in 0..self.loader_count() as u16 {
            let off = self.record_offset(i)?;
            let pb = PrebuiltLoaderHeaderView {
                bytes: &self.bytes,
                off,
            };
            if pb.matches_path(path) {
                return Some(i);
            }
        }
        None
    }

    /// Whole-set validation: header, recorded cache uuid, and every
    /// must-be-missing path still absent. Loader-level file validation is
    /// separate (`PrebuiltLoader::is_valid`).
    pub fn is_valid(&self, state: &RuntimeState) -> bool {
        if !self.has_valid_magic() {
            return false;
        }
        if let Some(recorded_uuid) = self.cache_uuid() {
            let current = state.config.shared_cache.as_deref().map(|c| c.uuid);
            if current != Some(recorded_uuid) {
                log::debug!("prebuilt loader set invalid: built against a different dyld cache");
                return false;
            }
        }
        let mut all_missing = true;
        self.for_each_must_be_missing_path(|path, stop| {
            if state.syscalls().stat(path).is_ok() {
                log::debug!("prebuilt loader set invalid: '{path}' now exists");
                all_missing = false;
                *stop = true;
            }
        });
        all_missing
    }
}

/// Borrowed record view used before handles exist.
struct PrebuiltLoaderHeaderView<'a> {
    bytes: &'a [u8],
    off: usize,
}

impl PrebuiltLoaderHeaderView<'_> {
    fn cstr(&self, rel: usize) -> &str {
        if rel == 0 {
            return "";
        }
        let start = self.off + rel;
        let tail = &self.bytes[start.min(self.bytes.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    fn matches_path(&self, path: &str) -> bool {
        let path_off: u16 = self.bytes.pread_with(self.off + 8, scroll::LE).unwrap_or(0);
        let alt_off: u16 = self.bytes.pread_with(self.off + 10, scroll::LE).unwrap_or(0);
        self.cstr(path_off as usize) == path || (alt_off != 0 && self.cstr(alt_off as usize) == path)
    }
}

/// Builds the per-process runtime arrays and loader handles for a set and
/// attaches them to the state.
pub fn attach(state: &RuntimeState, set: Arc<PrebuiltLoaderSet>, app: bool) {
    let count = set.loader_count();
    let mut handles = Vec::with_capacity(count);
    for i in 0..count as u16 {
        let Some(off) = set.record_offset(i) else {
            continue;
        };
        let record = PrebuiltLoader::new(Arc::clone(&set), off);
        let attrs = record.flags() & 0x3f; // low bits mirror loader attrs
        let ref_ = LoaderRef::new(app, i);
        handles.push(Loader::new_prebuilt(attrs, ref_, record));
    }
    let states = (0..count).map(|_| AtomicU8::new(0)).collect();
    let load_addrs = (0..count).map(|_| AtomicUsize::new(0)).collect();
    state.attach_prebuilt_set(
        PrebuiltSetRuntime {
            set,
            handles,
            states,
            load_addrs,
        },
        app,
    );
}

// ---- serialization ----

struct RecordLayout {
    record: Vec<u8>,
}

impl RecordLayout {
    fn put_u16(&mut self, off: usize, v: u16) {
        let _ = self.record.pwrite_with(v, off, scroll::LE);
    }

    fn put_u32(&mut self, off: usize, v: u32) {
        let _ = self.record.pwrite_with(v, off, scroll::LE);
    }

    fn put_u64(&mut self, off: usize, v: u64) {
        let _ = self.record.pwrite_with(v, off, scroll::LE);
    }

    fn append(&mut self, bytes: &[u8]) -> usize {
        let off = self.record.len();
        self.record.extend_from_slice(bytes);
        off
    }

    fn append_cstr(&mut self, s: &str) -> usize {
        let off = self.record.len();
        self.record.extend_from_slice(s.as_bytes());
        self.record.push(0);
        off
    }

    fn align(&mut self, to: usize) {
        while self.record.len() % to != 0 {
            self.record.push(0);
        }
    }
}

/// Maps a live loader to the LoaderRef it will have in the saved world:
/// jit loaders get app refs by loaded order, prebuilt loaders keep theirs.
fn ref_for_loader(
    loader: &Arc<Loader>,
    index_map: &[(Arc<Loader>, u16)],
) -> Option<LoaderRef> {
    if loader.is_prebuilt() {
        return Some(loader.ref_);
    }
    index_map
        .iter()
        .find(|(l, _)| Arc::ptr_eq(l, loader))
        .map(|(_, i)| LoaderRef::new(true, *i))
}

fn serialize_loader(
    loader: &Arc<Loader>,
    index: u16,
    index_map: &[(Arc<Loader>, u16)],
) -> Result<Vec<u8>, LoadError> {
    let jit = loader.jit().ok_or_else(|| LoadError::PrebuiltLoaderInvalid {
        reason: "only just-in-time loaders serialize".to_owned(),
    })?;

    let mut out = RecordLayout {
        record: vec![0u8; RECORD_HEADER_SIZE],
    };
    out.put_u32(0, LOADER_MAGIC);

    let mut flags = loader.attrs_raw() & 0x3f;
    if jit.has_initializers {
        flags |= prebuilt::PBF_HAS_INITIALIZERS;
    }
    if jit.cache_override().is_some() {
        flags |= prebuilt::PBF_OVERRIDES_CACHE;
    }
    out.put_u16(4, flags);
    out.put_u16(6, LoaderRef::new(true, index).raw());

    let path_off = out.append_cstr(&jit.path);
    out.put_u16(8, path_off as u16);
    if let Some(alt) = &jit.alt_install_name {
        let alt_off = out.append_cstr(alt);
        out.put_u16(10, alt_off as u16);
    }

    if jit.file_validation.check_inode_mtime || jit.file_validation.check_cd_hash {
        out.align(8);
        let fv = &jit.file_validation;
        let mut blob = Vec::with_capacity(46);
        blob.extend_from_slice(&fv.slice_offset.to_le_bytes());
        blob.extend_from_slice(&fv.inode.to_le_bytes());
        blob.extend_from_slice(&fv.mtime.to_le_bytes());
        blob.extend_from_slice(&fv.cd_hash);
        blob.push(u8::from(fv.check_inode_mtime));
        blob.push(u8::from(fv.check_cd_hash));
        let fv_off = out.append(&blob);
        out.put_u16(12, fv_off as u16);
    }

    out.align(8);
    let regions_off = out.append(&[]);
    for region in &jit.regions {
        let (w0, w1) = region.to_words();
        out.append(&w0.to_le_bytes());
        out.append(&w1.to_le_bytes());
    }
    out.put_u16(14, regions_off as u16);
    out.put_u16(16, jit.regions.len() as u16);

    // dependents
    let deps = jit.dependents.lock().unwrap().clone();
    if !deps.is_empty() {
        out.align(2);
        let deps_off = out.record.len();
        let mut kinds = Vec::with_capacity(deps.len());
        let mut heterogeneous = false;
        for dep in &deps {
            let (raw_ref, kind) = match dep {
                Some((dep_loader, kind)) => {
                    let r = ref_for_loader(dep_loader, index_map).ok_or_else(|| {
                        LoadError::PrebuiltLoaderInvalid {
                            reason: format!(
                                "dependent '{}' has no stable loader ref",
                                dep_loader.path()
                            ),
                        }
                    })?;
                    (r.raw(), *kind as u8)
                }
                None => (LoaderRef::missing_weak_image().raw(), 1),
            };
            if kind != 0 {
                heterogeneous = true;
            }
            out.append(&raw_ref.to_le_bytes());
            kinds.push(kind);
        }
        out.put_u16(18, deps_off as u16);
        out.put_u16(20, deps.len() as u16);
        if heterogeneous {
            let kinds_off = out.append(&kinds);
            out.put_u16(22, kinds_off as u16);
        }
    }

    out.put_u16(24, jit.cache_index.unwrap_or(NO_CACHE_INDEX));
    out.put_u16(26, NO_UNZIPPERED_TWIN);

    // patch table for cache overrides
    if let Some(ovr) = jit.cache_override() {
        out.align(8);
        let table_off = out.record.len();
        for patch in &ovr.patches {
            out.append(&patch.override_offset_of_impl.to_le_bytes());
        }
        out.append(&DylibPatch::END_OF_PATCH_TABLE.to_le_bytes());
        out.put_u32(48, table_off as u32);
        out.put_u16(76, ovr.index);
    } else {
        out.put_u16(76, NO_CACHE_INDEX);
    }

    if let Some((trie_off, trie_size)) = jit.exports_trie {
        out.put_u64(52, trie_off);
        out.put_u32(60, trie_size);
    }
    out.put_u32(64, jit.vm_space as u32);
    out.put_u32(68, jit.code_signature.file_offset);
    out.put_u32(72, jit.code_signature.size);

    let uuid_dst = 80;
    out.record[uuid_dst..uuid_dst + 16].copy_from_slice(&jit.uuid);

    // bind targets last: their offsets are the 32-bit fields
    out.align(8);
    let targets = jit.resolved_bind_targets();
    let bt_off = out.record.len();
    for target in &targets {
        let encoded = match target {
            ResolvedBindTarget::Image { loader: l, offset } => {
                let r = ref_for_loader(l, index_map).ok_or_else(|| {
                    LoadError::PrebuiltLoaderInvalid {
                        reason: format!("bind target '{}' has no stable loader ref", l.path()),
                    }
                })?;
                BindTargetRef::for_image(r, *offset as i64)
            }
            ResolvedBindTarget::Absolute(v) => BindTargetRef::absolute(*v as i64),
        };
        out.append(&encoded.raw().to_le_bytes());
    }
    out.put_u32(28, bt_off as u32);
    out.put_u32(32, targets.len() as u32);

    Ok(out.record)
}

/// Serializes the whole launch into a fresh set blob. Every loaded image
/// must be serializable or the save is abandoned.
pub fn make_launch_set(state: &RuntimeState) -> Result<Vec<u8>, LoadError> {
    let loaders = state.with_loaded(|loaded| loaded.to_vec());
    let index_map: Vec<(Arc<Loader>, u16)> = loaders
        .iter()
        .enumerate()
        .map(|(i, l)| (Arc::clone(l), i as u16))
        .collect();

    let mut arena = BumpArena::new(state.syscalls_arc());
    arena.zero_fill(HEADER_SIZE);

    // loader-offsets array placeholder
    let offsets_array = arena.current_offset();
    arena.zero_fill(loaders.len() * 4);

    let mut record_offsets = Vec::with_capacity(loaders.len());
    for (i, loader) in loaders.iter().enumerate() {
        arena.align(8);
        let record = serialize_loader(loader, i as u16, &index_map)?;
        record_offsets.push(arena.current_offset() as u32);
        arena.append(&record);
    }

    // cache patches
    arena.align(8);
    let patches = state.recorded_cache_patches();
    let patch_off = arena.current_offset();
    let mut patch_count = 0u32;
    for patch in &patches {
        let Some(r) = ref_for_loader(&patch.target_loader, &index_map) else {
            continue;
        };
        let target = BindTargetRef::for_image(r, patch.target_runtime_offset as i64);
        arena.append(&u32::from(patch.cache_dylib_index).to_le_bytes());
        arena.append(&patch.cache_dylib_vm_offset.to_le_bytes());
        arena.append(&target.raw().to_le_bytes());
        patch_count += 1;
    }

    // must-be-missing paths
    let missing = state.must_be_missing_paths();
    let missing_off = arena.current_offset();
    for path in &missing {
        arena.append(path.as_bytes());
        arena.append(&[0]);
    }

    // dyld cache uuid
    let mut uuid_off = 0u32;
    if let Some(cache) = state.config.shared_cache.as_deref() {
        arena.align(8);
        uuid_off = arena.current_offset() as u32;
        arena.append(&cache.uuid);
    }

    arena.align(8);
    let total = arena.size();
    let mut bytes = arena.bytes().to_vec();
    let mut put = |off: usize, v: u32| {
        let _ = bytes.pwrite_with(v, off, scroll::LE);
    };
    put(0, SET_MAGIC);
    put(4, PREBUILT_LOADER_VERSION_HASH);
    put(8, total as u32);
    put(12, loaders.len() as u32);
    put(16, offsets_array as u32);
    put(20, patch_count);
    put(24, patch_off as u32);
    put(28, uuid_off);
    put(32, missing.len() as u32);
    put(36, missing_off as u32);
    for (i, off) in record_offsets.iter().enumerate() {
        let _ = bytes.pwrite_with(*off, offsets_array + i * 4, scroll::LE);
    }
    Ok(bytes)
}

/// Computes the boot token: cdhash of the main executable, the dyld uuid,
/// and a hash of the main executable's path.
pub fn compute_boot_token(state: &RuntimeState) -> Vec<u8> {
    use sha2::{Digest, Sha256};

    let mut token = Vec::with_capacity(MAX_BOOT_TOKEN_SIZE);
    let syscalls = state.syscalls();
    let path = &state.config.main_executable_path;
    if let Ok(fd) = syscalls.open(path, OpenFlags::READ, 0) {
        if let Ok(stat) = syscalls.fstat(fd) {
            let hash = crate::loader::compute_cd_hash(
                syscalls,
                fd,
                &stat,
                &crate::syscall::CodeSignatureInFile::default(),
            );
            token.extend_from_slice(&hash);
        }
        syscalls.close(fd);
    }
    token.extend_from_slice(&state.config.dyld_uuid);
    let path_hash = Sha256::digest(path.as_bytes());
    token.extend_from_slice(&path_hash[..16]);
    token
}

/// Loads the process's saved set, honoring the boot-token gate. Returns
/// `None` (never an error) when the set must be ignored.
pub fn load_process_set(state: &RuntimeState) -> Option<Arc<PrebuiltLoaderSet>> {
    let path = state.config.prebuilt_loader_set_path.as_deref()?;
    let syscalls = state.syscalls();

    let expected_token = compute_boot_token(state);
    match syscalls.get_file_attribute(path, BOOT_TOKEN_XATTR) {
        Ok(found) if found == expected_token => {}
        _ => {
            log::debug!("prebuilt loader set at '{path}' has stale boot token");
            return None;
        }
    }

    let fd = syscalls.open(path, OpenFlags::READ, 0).ok()?;
    let stat = syscalls.fstat(fd).ok();
    let mut bytes = vec![0u8; stat.map_or(0, |s| s.size as usize)];
    let read = syscalls.pread(fd, &mut bytes, 0).unwrap_or(0);
    syscalls.close(fd);
    bytes.truncate(read);

    let set = PrebuiltLoaderSet::from_bytes(bytes).ok()?;
    if !set.is_valid(state) {
        return None;
    }
    Some(set)
}

/// Atomically writes the set and stamps the boot token. Refused when the
/// launch used interposing, has unresolved flat lazies, or DYLD_* vars.
pub fn save_process_set(state: &RuntimeState, bytes: &[u8]) -> Result<(), LoadError> {
    if state.has_interpose_tuples() {
        return Err(LoadError::PrebuiltLoaderInvalid {
            reason: "cannot save: process uses interposing".to_owned(),
        });
    }
    if state.has_missing_flat_lazy_symbols() {
        return Err(LoadError::PrebuiltLoaderInvalid {
            reason: "cannot save: unresolved flat lazy symbols".to_owned(),
        });
    }
    if state.config.path_overrides.env_vars_used {
        return Err(LoadError::PrebuiltLoaderInvalid {
            reason: "cannot save: DYLD_* environment overrides active".to_owned(),
        });
    }
    let path = state
        .config
        .prebuilt_loader_set_path
        .as_deref()
        .ok_or_else(|| LoadError::PrebuiltLoaderInvalid {
            reason: "no prebuilt loader set path configured".to_owned(),
        })?;

    let syscalls = state.syscalls();
    let tmp_path = format!("{path}.tmp");
    let fd = syscalls
        .open(
            &tmp_path,
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE,
            0o644,
        )
        .map_err(|e| LoadError::Other(format!("cannot create '{tmp_path}': {e}")))?;
    let wrote = syscalls.write(fd, bytes);
    syscalls.close(fd);
    if wrote.map_or(true, |n| n != bytes.len()) {
        syscalls.unlink(&tmp_path);
        return Err(LoadError::Other(format!("short write to '{tmp_path}'")));
    }
    syscalls
        .rename(&tmp_path, path)
        .map_err(|e| LoadError::Other(format!("cannot rename into '{path}': {e}")))?;

    let token = compute_boot_token(state);
    let _ = syscalls.set_file_attribute(path, BOOT_TOKEN_XATTR, &token);
    state.set_saved_prebuilt_loader_set();
    log::debug!("saved prebuilt loader set to '{path}' ({} bytes)", bytes.len());
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    fn empty_set_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; HEADER_SIZE];
        let _ = bytes.pwrite_with(SET_MAGIC, 0, scroll::LE);
        let _ = bytes.pwrite_with(PREBUILT_LOADER_VERSION_HASH, 4, scroll::LE);
        let _ = bytes.pwrite_with(HEADER_SIZE as u32, 8, scroll::LE);
        bytes
    }

    #[test]
    fn header_validation_rejects_bad_magic() {
        let good = empty_set_bytes();
        assert!(PrebuiltLoaderSet::from_bytes(good).is_ok());

        let mut bad_magic = empty_set_bytes();
        bad_magic[0] = 0;
        assert!(PrebuiltLoaderSet::from_bytes(bad_magic).is_err());

        let mut bad_version = empty_set_bytes();
        bad_version[4] ^= 0xff;
        assert!(PrebuiltLoaderSet::from_bytes(bad_version).is_err());

        let mut bad_length = empty_set_bytes();
        bad_length.push(0);
        assert!(PrebuiltLoaderSet::from_bytes(bad_length).is_err());
    }

    #[test]
    fn must_be_missing_paths_round_trip() {
        let mut bytes = empty_set_bytes();
        let table_off = bytes.len();
        bytes.extend_from_slice(b"/usr/lib/libnothere.dylib\0/opt/gone.dylib\0");
        let total = bytes.len() as u32;
        let _ = bytes.pwrite_with(total, 8, scroll::LE);
        let _ = bytes.pwrite_with(2u32, 32, scroll::LE);
        let _ = bytes.pwrite_with(table_off as u32, 36, scroll::LE);

        let set = PrebuiltLoaderSet::from_bytes(bytes).unwrap();
        let mut paths = Vec::new();
        set.for_each_must_be_missing_path(|p, _| paths.push(p.to_owned()));
        assert_eq!(paths, ["/usr/lib/libnothere.dylib", "/opt/gone.dylib"]);
    }
}
