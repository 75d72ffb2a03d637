//! Read-only view of the dyld shared cache.
//!
//! The loader never builds a cache, it only consumes one: looking up
//! cached dylibs by install name (or alias), walking the patch tables
//! that say where a cached export is used, and temporarily flipping the
//! cache's `__DATA_CONST` writable while patches land.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::ptrauth::PointerMetaData;
use crate::syscall::{Prot, SyscallShim};

/// One dylib baked into the shared cache.
#[derive(Debug, Clone)]
pub struct CachedDylib {
    pub install_name: String,
    /// equivalent names the cache's alias trie maps to this dylib
    pub aliases: Vec<String>,
    /// mach header location as an offset from the cache base
    pub mh_vm_offset: u64,
    pub vm_size: u64,
    /// roots may replace this dylib (development caches, unzippered twins)
    pub overridable: bool,
    /// macOS twin index of a Catalyst dylib, if part of an unzippered twin
    pub twin_index: Option<u16>,
    /// `(symbol name, export vm offset)` pairs, consulted when a root
    /// overriding this dylib needs to patch the cache's users
    pub export_symbols: Vec<(String, u32)>,
}

/// One use-site of a cached export, from the cache's patch info.
#[derive(Debug, Clone, Copy)]
pub struct PatchLocation {
    /// where the pointer lives, as an offset from the cache base
    pub user_vm_offset: u64,
    pub addend: i64,
    pub pmd: PointerMetaData,
}

/// Process-wide mapped shared cache.
pub struct DyldCache {
    pub base_addr: usize,
    pub slide: u64,
    pub uuid: [u8; 16],
    /// development caches allow roots and get their files stat'ed
    pub development: bool,
    pub dylibs: Vec<CachedDylib>,
    /// (dylib index, export vm offset within that dylib) -> users
    patch_info: HashMap<(u16, u32), Vec<PatchLocation>>,
    /// cache `__DATA_CONST` regions, absolute address ranges
    data_const_ranges: Vec<(usize, usize)>,
    writer_count: Mutex<u32>,
}

impl DyldCache {
    pub fn new(base_addr: usize, slide: u64, uuid: [u8; 16], development: bool) -> Self {
        Self {
            base_addr,
            slide,
            uuid,
            development,
            dylibs: Vec::new(),
            patch_info: HashMap::new(),
            data_const_ranges: Vec::new(),
            writer_count: Mutex::new(0),
        }
    }

    pub fn add_dylib(&mut self, dylib: CachedDylib) -> u16 {
        self.dylibs.push(dylib);
        (self.dylibs.len() - 1) as u16
    }

    pub fn add_patch_locations(
        &mut self,
        dylib_index: u16,
        export_vm_offset: u32,
        users: Vec<PatchLocation>,
    ) {
        self.patch_info
            .entry((dylib_index, export_vm_offset))
            .or_default()
            .extend(users);
    }

    pub fn add_data_const_range(&mut self, start: usize, len: usize) {
        self.data_const_ranges.push((start, start + len));
    }

    /// Canonicalizes a load path to a cached dylib index, consulting the
    /// alias table the way the cache's name trie does.
    pub fn index_of_path(&self, path: &str) -> Option<u16> {
        self.dylibs.iter().position(|d| {
            d.install_name == path || d.aliases.iter().any(|a| a == path)
        }).map(|i| i as u16)
    }

    pub fn dylib(&self, index: u16) -> Option<&CachedDylib> {
        self.dylibs.get(index as usize)
    }

    pub fn dylib_load_address(&self, index: u16) -> Option<usize> {
        self.dylib(index)
            .map(|d| self.base_addr + d.mh_vm_offset as usize)
    }

    pub fn contains_address(&self, addr: usize) -> bool {
        self.dylibs.iter().any(|d| {
            let start = self.base_addr + d.mh_vm_offset as usize;
            addr >= start && addr < start + d.vm_size as usize
        })
    }

    /// Users of the given cached export. The walker deduplicates by cache
    /// offset, so an offset re-exported under two names enumerates once.
    pub fn for_each_patch_location(
        &self,
        dylib_index: u16,
        export_vm_offset: u32,
        mut f: impl FnMut(&PatchLocation),
    ) {
        if let Some(users) = self.patch_info.get(&(dylib_index, export_vm_offset)) {
            let mut seen = Vec::with_capacity(users.len());
            for user in users {
                if seen.contains(&user.user_vm_offset) {
                    continue;
                }
                seen.push(user.user_vm_offset);
                f(user);
            }
        }
    }

    /// Export name for a recorded cache offset. Re-exports can alias one
    /// offset under two names; the first recorded name wins.
    pub fn export_name_for(&self, dylib_index: u16, export_vm_offset: u32) -> Option<String> {
        self.dylib(dylib_index)?
            .export_symbols
            .iter()
            .find(|(_, off)| *off == export_vm_offset)
            .map(|(name, _)| name.clone())
    }

    /// All exports of a dylib that have recorded users, for override
    /// patch-table construction.
    pub fn patched_exports_of(&self, dylib_index: u16) -> Vec<u32> {
        let mut offsets: Vec<u32> = self
            .patch_info
            .keys()
            .filter(|(idx, _)| *idx == dylib_index)
            .map(|(_, off)| *off)
            .collect();
        offsets.sort_unstable();
        offsets
    }

    fn protect_data_const(&self, shim: &dyn SyscallShim, prot: Prot) {
        for &(start, end) in &self.data_const_ranges {
            let _ = shim.mprotect(start, end - start, prot);
        }
    }

    fn inc_writer(&self, shim: &dyn SyscallShim) {
        let mut count = self.writer_count.lock().unwrap();
        *count += 1;
        if *count == 1 {
            self.protect_data_const(shim, Prot::READ | Prot::WRITE);
        }
    }

    fn dec_writer(&self, shim: &dyn SyscallShim) {
        let mut count = self.writer_count.lock().unwrap();
        *count -= 1;
        if *count == 0 {
            self.protect_data_const(shim, Prot::READ);
        }
    }
}

/// Scoped writable access to the cache's `__DATA_CONST`.
///
/// The lazy form defers the mprotect until the first write so patch walks
/// that find nothing to do never dirty the cache pages. Writers nest; the
/// last one out restores read-only.
pub struct DataConstLazyWriter<'a> {
    cache: &'a DyldCache,
    shim: &'a dyn SyscallShim,
    made_writable: bool,
}

impl<'a> DataConstLazyWriter<'a> {
    pub fn new(cache: &'a DyldCache, shim: &'a dyn SyscallShim) -> Self {
        Self {
            cache,
            shim,
            made_writable: false,
        }
    }

    /// Idempotent; call before every write.
    pub fn make_writable(&mut self) {
        if !self.made_writable {
            self.made_writable = true;
            self.cache.inc_writer(self.shim);
        }
    }
}

impl Drop for DataConstLazyWriter<'_> {
    fn drop(&mut self) {
        if self.made_writable {
            self.cache.dec_writer(self.shim);
        }
    }
}

/// Non-lazy variant: writable for its whole scope.
pub struct DataConstScopedWriter<'a>(DataConstLazyWriter<'a>);

impl<'a> DataConstScopedWriter<'a> {
    pub fn new(cache: &'a DyldCache, shim: &'a dyn SyscallShim) -> Self {
        let mut inner = DataConstLazyWriter::new(cache, shim);
        inner.make_writable();
        Self(inner)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_cache() -> DyldCache {
        let mut cache = DyldCache::new(0x7fff_0000_0000, 0, [7; 16], true);
        cache.add_dylib(CachedDylib {
            install_name: "/usr/lib/libSystem.B.dylib".into(),
            aliases: vec!["/usr/lib/libSystem.dylib".into()],
            mh_vm_offset: 0x1000,
            vm_size: 0x4000,
            overridable: true,
            twin_index: None,
            export_symbols: vec![("_malloc".into(), 0x100)],
        });
        cache
    }

    #[test]
    fn alias_resolves_to_same_index() {
        let cache = sample_cache();
        assert_eq!(cache.index_of_path("/usr/lib/libSystem.B.dylib"), Some(0));
        assert_eq!(cache.index_of_path("/usr/lib/libSystem.dylib"), Some(0));
        assert_eq!(cache.index_of_path("/usr/lib/libc.dylib"), None);
    }

    #[test]
    fn patch_walk_dedupes_by_offset() {
        let mut cache = sample_cache();
        let loc = PatchLocation {
            user_vm_offset: 0x8000,
            addend: 0,
            pmd: PointerMetaData::default(),
        };
        // same use-site recorded under a re-exported name as well
        cache.add_patch_locations(0, 0x100, vec![loc, loc]);
        let mut count = 0;
        cache.for_each_patch_location(0, 0x100, |_| count += 1);
        assert_eq!(count, 1);
    }
}
