//! Loader materialized from a serialized record in a PrebuiltLoaderSet.
//!
//! The record is read in place from the mmapped set — every accessor is a
//! little-endian read at a fixed offset — and never written. Per-process
//! lifecycle state lives in the parallel byte array owned by
//! [`RuntimeState`], keyed by the loader's ref.
//!
//! Record layout (offsets from the record start, all LE). Fields up to
//! `bindTargetRefsOffset` are 16-bit; from there on 32-bit, because bind
//! target arrays can be large:
//!
//! ```text
//!  0  u32  magic 'l4yd'
//!  4  u16  flags
//!  6  u16  loader ref (raw)
//!  8  u16  path offset
//! 10  u16  alt path offset (0 = none)
//! 12  u16  file validation offset (0 = none)
//! 14  u16  regions offset
//! 16  u16  regions count
//! 18  u16  dependent loader-ref array offset (0 = none)
//! 20  u16  dependent count
//! 22  u16  dependent kind array offset (0 = all normal)
//! 24  u16  cached dylib index (0xffff = not cache resident)
//! 26  u16  index of unzippered twin (0xffff = none)
//! 28  u32  bind target refs offset
//! 32  u32  bind target refs count
//! 36  u32  override bind target refs offset
//! 40  u32  override bind target refs count
//! 44  u32  objc binary info offset (0 = none)
//! 48  u32  patch table offset (0 = none)
//! 52  u64  exports trie runtime offset
//! 60  u32  exports trie size
//! 64  u32  vm space
//! 68  u32  code signature file offset
//! 72  u32  code signature size
//! 76  u16  overridden cache dylib index (0xffff = none)
//! 78  u16  reserved
//! 80  u8x16 uuid
//! 96  ...  variable-length data
//! ```

use std::sync::Arc;

use scroll::Pread;

use crate::cache::DataConstLazyWriter;
use crate::errors::{Diagnostics, LoadError};
use crate::mach::DependentKind;
use crate::prebuilt_set::PrebuiltLoaderSet;
use crate::state::RuntimeState;
use crate::syscall::{CodeSignatureInFile, FileId};

use super::{
    FileValidationInfo, LoadOptions, Loader, LoaderRef, LoaderState, Region, ResolvedSymbol,
    ResolvedTarget,
};

pub const NO_UNZIPPERED_TWIN: u16 = 0xffff;
pub const NO_CACHE_INDEX: u16 = 0xffff;

// record flag bits (low bits mirror the runtime loader attrs)
pub const PBF_IN_DYLD_CACHE: u16 = 1 << 0;
pub const PBF_HAS_OBJC: u16 = 1 << 1;
pub const PBF_MAY_HAVE_PLUS_LOAD: u16 = 1 << 2;
pub const PBF_HAS_READ_ONLY_DATA: u16 = 1 << 3;
pub const PBF_NEVER_UNLOAD: u16 = 1 << 4;
pub const PBF_LEAVE_MAPPED: u16 = 1 << 5;
pub const PBF_HAS_INITIALIZERS: u16 = 1 << 8;
pub const PBF_OVERRIDABLE: u16 = 1 << 9;
pub const PBF_SUPPORTS_CATALYST: u16 = 1 << 10;
pub const PBF_OVERRIDES_CACHE: u16 = 1 << 11;

pub const RECORD_HEADER_SIZE: usize = 96;

// field offsets
const OFF_MAGIC: usize = 0;
const OFF_FLAGS: usize = 4;
const OFF_LOADER_REF: usize = 6;
const OFF_PATH: usize = 8;
const OFF_ALT_PATH: usize = 10;
const OFF_FILE_VALIDATION: usize = 12;
const OFF_REGIONS: usize = 14;
const OFF_REGIONS_COUNT: usize = 16;
const OFF_DEP_REFS: usize = 18;
const OFF_DEP_COUNT: usize = 20;
const OFF_DEP_KINDS: usize = 22;
const OFF_CACHE_INDEX: usize = 24;
const OFF_TWIN_INDEX: usize = 26;
const OFF_BIND_TARGETS: usize = 28;
const OFF_BIND_TARGETS_COUNT: usize = 32;
const OFF_OVERRIDE_BIND_TARGETS: usize = 36;
const OFF_OVERRIDE_BIND_TARGETS_COUNT: usize = 40;
const OFF_OBJC_INFO: usize = 44;
const OFF_PATCH_TABLE: usize = 48;
const OFF_EXPORTS_TRIE: usize = 52;
const OFF_EXPORTS_TRIE_SIZE: usize = 60;
const OFF_VM_SPACE: usize = 64;
const OFF_CODE_SIG: usize = 68;
const OFF_CODE_SIG_SIZE: usize = 72;
const OFF_OVERRIDDEN_INDEX: usize = 76;
const OFF_UUID: usize = 80;

/// Patch-table entry for a root overriding a cached dylib. One entry per
/// patched export of the overridden dylib; the table ends with the `-1`
/// sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DylibPatch {
    pub override_offset_of_impl: i64,
}

impl DylibPatch {
    pub const END_OF_PATCH_TABLE: i64 = -1;
    /// The override image lacks the symbol; users are patched to null.
    pub const MISSING_SYMBOL: i64 = i64::MIN;
}

/// 64-bit tagged value encoding a bind target: either image-relative
/// (loader ref + signed runtime offset split into high8/low39 so offsets
/// up to ±256GB encode) or a sign-extended absolute constant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindTargetRef(u64);

impl BindTargetRef {
    const KIND_ABSOLUTE: u64 = 1 << 63;
    const LOW39_MASK: u64 = (1 << 39) - 1;

    /// Encodes an image-relative target. Traps when the offset cannot be
    /// represented; the round trip must be exact.
    pub fn for_image(ref_: LoaderRef, offset: i64) -> Self {
        let high8 = ((offset as u64) >> 56) & 0xff;
        let low39 = (offset as u64) & Self::LOW39_MASK;
        let raw = u64::from(ref_.raw()) | (high8 << 16) | (low39 << 24);
        let encoded = Self(raw);
        assert_eq!(
            encoded.offset(),
            offset,
            "bind target offset {offset:#x} does not round-trip"
        );
        encoded
    }

    pub fn absolute(value: i64) -> Self {
        let encoded = Self(((value as u64) & !Self::KIND_ABSOLUTE) | Self::KIND_ABSOLUTE);
        assert_eq!(
            encoded.absolute_value(),
            value,
            "absolute bind target {value:#x} does not round-trip"
        );
        encoded
    }

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn is_absolute(self) -> bool {
        self.0 & Self::KIND_ABSOLUTE != 0
    }

    pub fn loader_ref(self) -> LoaderRef {
        debug_assert!(!self.is_absolute());
        LoaderRef::from_raw((self.0 & 0xffff) as u16)
    }

    /// Signed runtime offset: `high8 << 56 | sign_extend(low39)`.
    pub fn offset(self) -> i64 {
        debug_assert!(!self.is_absolute());
        let high8 = (self.0 >> 16) & 0xff;
        let mut low39 = (self.0 >> 24) & Self::LOW39_MASK;
        if low39 & (1 << 38) != 0 {
            low39 |= !Self::LOW39_MASK; // sign extend
        }
        ((high8 << 56) | (low39 & 0x00ff_ffff_ffff_ffff)) as i64
    }

    pub fn absolute_value(self) -> i64 {
        debug_assert!(self.is_absolute());
        let v = self.0 & !Self::KIND_ABSOLUTE;
        // sign-extend 63 -> 64 bits
        ((v << 1) as i64) >> 1
    }

    /// Runtime address this target denotes.
    pub fn value(self, state: &RuntimeState) -> u64 {
        if self.is_absolute() {
            return self.absolute_value() as u64;
        }
        let base = state.prebuilt_load_address(self.loader_ref());
        (base as i64 + self.offset()) as u64
    }

    pub fn from_resolved(state: &RuntimeState, resolved: &ResolvedSymbol) -> Option<Self> {
        match &resolved.target {
            ResolvedTarget::Image { loader, offset } => {
                if loader.ref_.is_missing_weak_image() {
                    return None;
                }
                Some(Self::for_image(loader.ref_, *offset as i64))
            }
            ResolvedTarget::Absolute { value } => Some(Self::absolute(*value as i64)),
            ResolvedTarget::Rebase => None,
        }
    }
}

/// Read-only view of one serialized loader record.
pub struct PrebuiltLoader {
    set: Arc<PrebuiltLoaderSet>,
    record_offset: usize,
}

impl PrebuiltLoader {
    pub fn new(set: Arc<PrebuiltLoaderSet>, record_offset: usize) -> Self {
        Self { set, record_offset }
    }

    fn bytes(&self) -> &[u8] {
        &self.set.bytes()[self.record_offset..]
    }

    fn read_u16(&self, off: usize) -> u16 {
        self.bytes().pread_with(off, scroll::LE).unwrap_or(0)
    }

    fn read_u32(&self, off: usize) -> u32 {
        self.bytes().pread_with(off, scroll::LE).unwrap_or(0)
    }

    fn read_u64(&self, off: usize) -> u64 {
        self.bytes().pread_with(off, scroll::LE).unwrap_or(0)
    }

    fn cstr_at(&self, off: usize) -> &str {
        if off == 0 {
            return "";
        }
        let tail = &self.bytes()[off.min(self.bytes().len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
        std::str::from_utf8(&tail[..end]).unwrap_or("")
    }

    pub fn record_magic_valid(&self) -> bool {
        self.read_u32(OFF_MAGIC) == super::LOADER_MAGIC
    }

    pub fn flags(&self) -> u16 {
        self.read_u16(OFF_FLAGS)
    }

    pub fn loader_ref(&self) -> LoaderRef {
        LoaderRef::from_raw(self.read_u16(OFF_LOADER_REF))
    }

    pub fn path(&self) -> &str {
        self.cstr_at(self.read_u16(OFF_PATH) as usize)
    }

    pub fn alt_path(&self) -> Option<&str> {
        let off = self.read_u16(OFF_ALT_PATH);
        if off == 0 {
            None
        } else {
            Some(self.cstr_at(off as usize))
        }
    }

    pub fn matches_path(&self, path: &str) -> bool {
        self.path() == path || self.alt_path() == Some(path)
    }

    pub fn uuid(&self) -> [u8; 16] {
        let mut uuid = [0u8; 16];
        if let Some(src) = self.bytes().get(OFF_UUID..OFF_UUID + 16) {
            uuid.copy_from_slice(src);
        }
        uuid
    }

    pub fn file_validation(&self) -> Option<FileValidationInfo> {
        let off = self.read_u16(OFF_FILE_VALIDATION) as usize;
        if off == 0 {
            return None;
        }
        let b = self.bytes();
        let mut cd_hash = [0u8; 20];
        cd_hash.copy_from_slice(b.get(off + 24..off + 44)?);
        Some(FileValidationInfo {
            slice_offset: b.pread_with(off, scroll::LE).ok()?,
            inode: b.pread_with(off + 8, scroll::LE).ok()?,
            mtime: b.pread_with(off + 16, scroll::LE).ok()?,
            cd_hash,
            check_inode_mtime: b.get(off + 44).copied().unwrap_or(0) != 0,
            check_cd_hash: b.get(off + 45).copied().unwrap_or(0) != 0,
        })
    }

    pub fn file_id(&self) -> FileId {
        self.file_validation()
            .map(|fv| FileId {
                inode: fv.inode,
                mtime: fv.mtime,
            })
            .unwrap_or_default()
    }

    pub fn regions(&self) -> Vec<Region> {
        let off = self.read_u16(OFF_REGIONS) as usize;
        let count = self.read_u16(OFF_REGIONS_COUNT) as usize;
        let mut regions = Vec::with_capacity(count);
        for i in 0..count {
            let w0 = self.read_u64(off + i * 16);
            let w1 = self.read_u64(off + i * 16 + 8);
            regions.push(Region::from_words(w0, w1));
        }
        regions
    }

    pub fn dependent_count(&self) -> usize {
        self.read_u16(OFF_DEP_COUNT) as usize
    }

    pub fn dependent_ref(&self, index: usize) -> Option<LoaderRef> {
        if index >= self.dependent_count() {
            return None;
        }
        let off = self.read_u16(OFF_DEP_REFS) as usize;
        if off == 0 {
            return None;
        }
        Some(LoaderRef::from_raw(self.read_u16(off + index * 2)))
    }

    pub fn dependent_kind(&self, index: usize) -> DependentKind {
        let off = self.read_u16(OFF_DEP_KINDS) as usize;
        if off == 0 {
            return DependentKind::Normal;
        }
        DependentKind::from_u8(self.bytes().get(off + index).copied().unwrap_or(0))
    }

    pub fn dependent_with_kind(
        &self,
        state: &RuntimeState,
        index: usize,
    ) -> Option<(Arc<Loader>, DependentKind)> {
        let ref_ = self.dependent_ref(index)?;
        if ref_.is_missing_weak_image() {
            return None;
        }
        let handle = state.prebuilt_handle(ref_)?;
        Some((handle, self.dependent_kind(index)))
    }

    pub fn cached_dylib_index(&self) -> Option<u16> {
        match self.read_u16(OFF_CACHE_INDEX) {
            NO_CACHE_INDEX => None,
            idx => Some(idx),
        }
    }

    pub fn twin_index(&self) -> Option<u16> {
        match self.read_u16(OFF_TWIN_INDEX) {
            NO_UNZIPPERED_TWIN => None,
            idx => Some(idx),
        }
    }

    pub fn exports_trie(&self) -> Option<(u64, u32)> {
        let size = self.read_u32(OFF_EXPORTS_TRIE_SIZE);
        if size == 0 {
            return None;
        }
        Some((self.read_u64(OFF_EXPORTS_TRIE), size))
    }

    pub fn vm_space(&self) -> u64 {
        u64::from(self.read_u32(OFF_VM_SPACE))
    }

    pub fn code_signature(&self) -> CodeSignatureInFile {
        CodeSignatureInFile {
            file_offset: self.read_u32(OFF_CODE_SIG),
            size: self.read_u32(OFF_CODE_SIG_SIZE),
        }
    }

    pub fn bind_targets(&self) -> Vec<BindTargetRef> {
        self.read_bind_target_array(OFF_BIND_TARGETS, OFF_BIND_TARGETS_COUNT)
    }

    pub fn override_bind_targets(&self) -> Vec<BindTargetRef> {
        self.read_bind_target_array(OFF_OVERRIDE_BIND_TARGETS, OFF_OVERRIDE_BIND_TARGETS_COUNT)
    }

    fn read_bind_target_array(&self, off_field: usize, count_field: usize) -> Vec<BindTargetRef> {
        let off = self.read_u32(off_field) as usize;
        let count = self.read_u32(count_field) as usize;
        let mut targets = Vec::with_capacity(count);
        for i in 0..count {
            targets.push(BindTargetRef::from_raw(self.read_u64(off + i * 8)));
        }
        targets
    }

    pub fn objc_binary_info_offset(&self) -> Option<u32> {
        match self.read_u32(OFF_OBJC_INFO) {
            0 => None,
            off => Some(off),
        }
    }

    /// `(patch table, overridden cache dylib index)` when this record is
    /// a root over a cached dylib.
    pub fn override_patches(&self) -> Option<(Vec<DylibPatch>, u16)> {
        let overridden = match self.read_u16(OFF_OVERRIDDEN_INDEX) {
            NO_CACHE_INDEX => return None,
            idx => idx,
        };
        let table_off = self.read_u32(OFF_PATCH_TABLE) as usize;
        let mut patches = Vec::new();
        if table_off != 0 {
            let mut i = 0;
            loop {
                let raw = self.read_u64(table_off + i * 8) as i64;
                if raw == DylibPatch::END_OF_PATCH_TABLE {
                    break;
                }
                patches.push(DylibPatch {
                    override_offset_of_impl: raw,
                });
                i += 1;
            }
        }
        Some((patches, overridden))
    }

    // ---- per-process state ----

    pub fn loader_state(&self, state: &RuntimeState) -> LoaderState {
        LoaderState::from_u8(state.prebuilt_state_byte(self.loader_ref()))
    }

    pub fn set_loader_state(&self, state: &RuntimeState, new: LoaderState) {
        state.set_prebuilt_state_byte(self.loader_ref(), new as u8);
    }

    pub fn load_address(&self, state: &RuntimeState) -> usize {
        if let Some(idx) = self.cached_dylib_index() {
            if let Some(cache) = state.config.shared_cache.as_deref() {
                if let Some(addr) = cache.dylib_load_address(idx) {
                    return addr;
                }
            }
        }
        state.prebuilt_load_address(self.loader_ref())
    }

    pub fn set_load_address(&self, state: &RuntimeState, addr: usize) {
        state.set_prebuilt_load_address(self.loader_ref(), addr);
    }

    /// Validation walk: `unknown -> beingValidated -> notMapped`, or
    /// `invalid` when the recorded file identity no longer matches. A dep
    /// going invalid invalidates this record too.
    pub fn is_valid(&self, state: &RuntimeState) -> bool {
        match self.loader_state(state) {
            LoaderState::Unknown => {}
            LoaderState::BeingValidated => return true, // cycle, assume ok
            LoaderState::Invalid => return false,
            _ => return true,
        }
        self.set_loader_state(state, LoaderState::BeingValidated);

        if !self.record_magic_valid() {
            self.set_loader_state(state, LoaderState::Invalid);
            return false;
        }

        // cache-resident dylibs validate at the set level (cache uuid)
        if self.cached_dylib_index().is_none() {
            if let Some(fv) = self.file_validation() {
                if fv.check_inode_mtime {
                    match state.syscalls().stat(self.path()) {
                        Ok(st) if st.inode == fv.inode && st.mtime == fv.mtime => {}
                        _ => {
                            log::debug!(
                                "prebuilt loader for '{}' invalid: file changed",
                                self.path()
                            );
                            self.set_loader_state(state, LoaderState::Invalid);
                            return false;
                        }
                    }
                }
            }
        }

        for i in 0..self.dependent_count() {
            let Some(ref_) = self.dependent_ref(i) else {
                continue;
            };
            if ref_.is_missing_weak_image() {
                continue;
            }
            let Some(dep) = state.prebuilt_handle(ref_) else {
                self.set_loader_state(state, LoaderState::Invalid);
                return false;
            };
            let dep_valid = dep.prebuilt().is_some_and(|p| p.is_valid(state));
            if !dep_valid {
                self.set_loader_state(state, LoaderState::Invalid);
                return false;
            }
        }

        self.set_loader_state(state, LoaderState::NotMapped);
        true
    }
}

/// Ensures the record's image is mapped and registered in `state.loaded`.
pub fn materialize(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    options: &LoadOptions<'_>,
) -> Result<(), LoadError> {
    let pb = loader
        .prebuilt()
        .expect("materialize dispatched on jit loader");
    if !pb.is_valid(state) {
        return Err(LoadError::PrebuiltLoaderInvalid {
            reason: format!("'{}' failed validation", pb.path()),
        });
    }
    let current = pb.loader_state(state);
    if current as u8 >= LoaderState::Mapped as u8 && current != LoaderState::Invalid {
        return Ok(());
    }

    if let Some(idx) = pb.cached_dylib_index() {
        // the cache mapping is the image
        let cache = state
            .config
            .shared_cache
            .as_deref()
            .ok_or_else(|| LoadError::PrebuiltLoaderInvalid {
                reason: "cache-resident record without a shared cache".to_owned(),
            })?;
        let addr = cache
            .dylib_load_address(idx)
            .ok_or_else(|| LoadError::PrebuiltLoaderInvalid {
                reason: format!("cache index {idx} out of range"),
            })?;
        pb.set_load_address(state, addr);
    } else {
        let regions = pb.regions();
        let fv = pb.file_validation().unwrap_or_default();
        let base = super::map_segments(
            diag,
            state,
            pb.path(),
            pb.vm_space(),
            &pb.code_signature(),
            &regions,
            &fv,
            &pb.uuid(),
        )?;
        pb.set_load_address(state, base);
    }
    pb.set_loader_state(state, LoaderState::Mapped);
    state.add(Arc::clone(loader));
    crate::tlv::set_up_tlvs(state, loader);
    let _ = options;
    Ok(())
}

pub fn load_dependents(
    loader: &Arc<Loader>,
    diag: &mut Diagnostics,
    state: &RuntimeState,
    options: &LoadOptions<'_>,
) -> Result<(), LoadError> {
    let pb = loader
        .prebuilt()
        .expect("load_dependents dispatched on jit loader");
    let current = pb.loader_state(state);
    if current as u8 >= LoaderState::MappingDependents as u8 {
        return Ok(());
    }
    pb.set_loader_state(state, LoaderState::MappingDependents);

    for i in 0..pb.dependent_count() {
        let Some((dep, kind)) = pb.dependent_with_kind(state, i) else {
            continue; // missing weak image
        };
        materialize(diag, state, &dep, options)?;
        if kind == DependentKind::Upward {
            continue;
        }
        dep.load_dependents(diag, state, options)?;
    }

    pb.set_loader_state(state, LoaderState::DependentsMapped);
    Ok(())
}

pub fn apply_fixups(
    loader: &Arc<Loader>,
    diag: &mut Diagnostics,
    state: &RuntimeState,
    cache_writer: &mut DataConstLazyWriter<'_>,
    allow_lazy_binds: bool,
) -> Result<(), LoadError> {
    let _ = allow_lazy_binds;
    let pb = loader
        .prebuilt()
        .expect("apply_fixups dispatched on jit loader");
    if pb.loader_state(state) as u8 >= LoaderState::FixedUp as u8 {
        return Ok(());
    }

    // cache-resident images were pre-bound by the cache builder
    if pb.cached_dylib_index().is_none() {
        let targets: Vec<u64> = pb.bind_targets().iter().map(|t| t.value(state)).collect();
        crate::fixups::apply_prebound(diag, state, loader, &targets, cache_writer)?;
    }

    pb.set_loader_state(state, LoaderState::FixedUp);
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bind_target_image_round_trip() {
        let ref_ = LoaderRef::new(true, 12);
        for offset in [
            0i64,
            0x1000,
            -0x1000,
            (1i64 << 38) - 1,
            -(1i64 << 38),
            0x3f_0000_0000_0000_00,
        ] {
            let t = BindTargetRef::for_image(ref_, offset);
            assert!(!t.is_absolute());
            assert_eq!(t.loader_ref(), ref_);
            assert_eq!(t.offset(), offset, "offset {offset:#x}");
            // round-trips through the raw word too
            assert_eq!(BindTargetRef::from_raw(t.raw()), t);
        }
    }

    #[test]
    fn bind_target_absolute_round_trip() {
        for value in [0i64, 1, -1, 0x7fff_ffff_ffff, -0x4000_0000_0000] {
            let t = BindTargetRef::absolute(value);
            assert!(t.is_absolute());
            assert_eq!(t.absolute_value(), value);
        }
    }

    #[test]
    #[should_panic(expected = "does not round-trip")]
    fn bind_target_offset_overflow_traps() {
        // bit 39..55 set without the high8 pattern cannot encode
        let _ = BindTargetRef::for_image(LoaderRef::new(false, 0), 1i64 << 45);
    }

    #[test]
    fn dylib_patch_sentinels() {
        assert_eq!(DylibPatch::END_OF_PATCH_TABLE, -1);
        assert_ne!(DylibPatch::MISSING_SYMBOL, DylibPatch::END_OF_PATCH_TABLE);
    }
}
