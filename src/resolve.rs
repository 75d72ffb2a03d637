//! Symbol search across two-level, flat, and weak-coalescing namespaces.
//!
//! A request names a library ordinal, a symbol, and whether the bind is
//! weak-import or lazy. Two-level requests search exactly one dependent
//! (chasing re-export edges); flat and weak-coalesce requests walk the
//! loaded list in order. Successful cross-image flat/weak lookups add a
//! dynamic-reference edge so the reaper keeps the definer alive.

use std::sync::Arc;

use crate::errors::{Diagnostics, LoadError};
use crate::loader::{Loader, ResolvedSymbol, ResolvedTarget};
use crate::mach::{
    self, EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE, EXPORT_SYMBOL_FLAGS_KIND_MASK,
    EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION,
};
use crate::state::{RuntimeState, WeakDefMapValue};

// Library ordinal encodings for bind requests.
pub const ORDINAL_SELF: i64 = -1;
pub const ORDINAL_MAIN_EXECUTABLE: i64 = -2;
pub const ORDINAL_FLAT: i64 = -3;
pub const ORDINAL_WEAK_COALESCE: i64 = -4;

#[derive(Clone, Copy)]
pub struct SymbolRequest<'a> {
    pub lib_ordinal: i64,
    pub name: &'a str,
    pub weak_import: bool,
    pub lazy_bind: bool,
}

/// Invoked when a weak-coalesce pass picks a definition that overrides a
/// weak def the shared cache already bound, so the cache can be patched.
pub type CacheWeakDefOverride<'a> =
    dyn FnMut(u16, u32, &ResolvedSymbol) + 'a;

/// A definition found in one image: `(definer, runtime offset, flags)`.
#[derive(Clone)]
struct Definition {
    loader: Arc<Loader>,
    offset: u64,
    is_absolute: bool,
    absolute_value: u64,
    is_weak: bool,
}

/// Search one image for an exported symbol, chasing re-export edges.
/// Returns `(defining loader, runtime offset)`.
pub fn search_one_image(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    name: &str,
) -> Option<(Arc<Loader>, u64)> {
    match find_definition(state, loader, name)? {
        Definition {
            is_absolute: false,
            loader,
            offset,
            ..
        } => Some((loader, offset)),
        _ => None,
    }
}

fn find_definition(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    name: &str,
) -> Option<Definition> {
    let image = loader.image(state)?;

    let entry = if let Some((trie_offset, trie_size)) = loader.exports_trie() {
        let trie = image.vm_bytes(trie_offset, trie_size as usize)?;
        mach::trie_lookup(trie, name)
    } else {
        mach::symtab_lookup(&image, name).map(|mut e| {
            e.value = e.value.wrapping_sub(image.preferred_base());
            e
        })
    }?;

    if let Some(ordinal) = entry.reexport_ordinal {
        // re-export: the definition really lives in dependent #ordinal,
        // possibly under a different name
        if ordinal == 0 || ordinal as usize > loader.dependent_count() {
            return None;
        }
        let dep = loader.dependent(state, ordinal as usize - 1)?;
        let target_name = entry.imported_name.as_deref().unwrap_or(name);
        return find_definition(state, &dep, target_name);
    }

    if entry.flags & EXPORT_SYMBOL_FLAGS_KIND_MASK == EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE {
        return Some(Definition {
            loader: Arc::clone(loader),
            offset: 0,
            is_absolute: true,
            absolute_value: entry.value,
            is_weak: false,
        });
    }

    Some(Definition {
        loader: Arc::clone(loader),
        offset: entry.value,
        is_absolute: false,
        absolute_value: 0,
        is_weak: entry.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION != 0,
    })
}

fn definition_to_symbol(def: Definition, name: &str) -> ResolvedSymbol {
    if def.is_absolute {
        return ResolvedSymbol::absolute(name, def.absolute_value);
    }
    ResolvedSymbol {
        name: name.to_owned(),
        is_code: false,
        is_weak_def: def.is_weak,
        is_missing_lazy: false,
        target: ResolvedTarget::Image {
            loader: def.loader,
            offset: def.offset,
        },
    }
}

/// Resolve one bind request issued by `from_loader`.
pub fn resolve_symbol(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    from_loader: &Arc<Loader>,
    request: &SymbolRequest<'_>,
    mut cache_patcher: Option<&mut CacheWeakDefOverride<'_>>,
) -> Result<ResolvedSymbol, LoadError> {
    let found = match request.lib_ordinal {
        ORDINAL_SELF => find_definition(state, from_loader, request.name),
        ORDINAL_MAIN_EXECUTABLE => state
            .main_loader()
            .and_then(|main| find_definition(state, &main, request.name)),
        ORDINAL_FLAT => {
            let result = flat_lookup(state, request.name);
            if let Some(def) = &result {
                state.add_dynamic_reference(from_loader, &def.loader);
            }
            result
        }
        ORDINAL_WEAK_COALESCE => {
            let result = weak_coalesce_lookup(state, request.name, cache_patcher.as_deref_mut());
            if let Some(def) = &result {
                state.add_dynamic_reference(from_loader, &def.loader);
            }
            result
        }
        n if n >= 1 => {
            let index = (n - 1) as usize;
            if index >= from_loader.dependent_count() {
                None
            } else {
                match from_loader.dependent(state, index) {
                    Some(dep) => find_definition(state, &dep, request.name),
                    // weak-linked dependent that was missing
                    None => None,
                }
            }
        }
        _ => None,
    };

    if let Some(def) = found {
        return Ok(definition_to_symbol(def, request.name));
    }

    // misses, in decreasing softness
    if request.weak_import {
        return Ok(ResolvedSymbol::absolute(request.name, 0));
    }
    if request.lazy_bind {
        let mut sym = ResolvedSymbol::absolute(
            request.name,
            state.missing_symbol_sentinel_addr() as u64,
        );
        sym.is_missing_lazy = true;
        return Ok(sym);
    }

    let expected_in = expected_in_name(state, from_loader, request.lib_ordinal);
    let err = LoadError::SymbolMissing {
        name: request.name.to_owned(),
        expected_in,
        referenced_from: from_loader.path().to_owned(),
    };
    diag.error(&err);
    Err(err)
}

fn expected_in_name(state: &RuntimeState, loader: &Arc<Loader>, ordinal: i64) -> String {
    match ordinal {
        ORDINAL_SELF => loader.path().to_owned(),
        ORDINAL_MAIN_EXECUTABLE => state
            .main_loader()
            .map_or_else(|| "main executable".to_owned(), |m| m.path().to_owned()),
        ORDINAL_FLAT => "flat namespace".to_owned(),
        ORDINAL_WEAK_COALESCE => "weak coalesced symbols".to_owned(),
        n if n >= 1 => loader
            .dependent(state, (n - 1) as usize)
            .map_or_else(|| format!("dependent #{n}"), |d| d.path().to_owned()),
        _ => "unknown namespace".to_owned(),
    }
}

/// Flat namespace: every loaded image in insertion order, skipping
/// RTLD_LOCAL images.
fn flat_lookup(state: &RuntimeState, name: &str) -> Option<Definition> {
    let candidates = state.with_loaded(|loaded| loaded.to_vec());
    for loader in &candidates {
        if loader.hidden_from_flat() {
            continue;
        }
        if let Some(def) = find_definition(state, loader, name) {
            return Some(def);
        }
    }
    None
}

/// Weak coalescing: first definition wins, except a non-weak definition
/// overrides any prior weak one. Cached weak defs that lose to an
/// on-disk override are reported to the cache patcher.
fn weak_coalesce_lookup(
    state: &RuntimeState,
    name: &str,
    cache_patcher: Option<&mut CacheWeakDefOverride<'_>>,
) -> Option<Definition> {
    state.note_weak_def_resolve();

    if let Some(cached) = state.weak_def_map_lookup(name) {
        return Some(Definition {
            loader: cached.target_loader,
            offset: cached.target_runtime_offset,
            is_absolute: false,
            absolute_value: 0,
            is_weak: cached.is_weak_def,
        });
    }

    let candidates = state.with_loaded(|loaded| loaded.to_vec());
    let mut defs: Vec<Definition> = Vec::new();
    for loader in &candidates {
        if loader.hidden_from_flat() {
            continue;
        }
        if let Some(def) = find_definition(state, loader, name) {
            defs.push(def);
        }
    }
    if defs.is_empty() {
        return None;
    }

    let mut chosen = 0;
    for (i, def) in defs.iter().enumerate().skip(1) {
        if !def.is_weak && defs[chosen].is_weak {
            chosen = i;
            break;
        }
    }

    let winner = defs[chosen].clone();

    // cached dylibs were pre-bound to their own weak def; patch their
    // users when a non-cache image won the coalescing
    if let Some(patcher) = cache_patcher {
        if !winner.loader.dylib_in_dyld_cache() {
            let resolved = definition_to_symbol(winner.clone(), name);
            if let Some(cache) = state.config.shared_cache.as_deref() {
                for (i, def) in defs.iter().enumerate() {
                    if i == chosen || !def.loader.dylib_in_dyld_cache() {
                        continue;
                    }
                    if let Some(idx) = cache.index_of_path(def.loader.path()) {
                        patcher(idx, def.offset as u32, &resolved);
                    }
                }
            }
        }
    }

    state.weak_def_map_record(
        name,
        WeakDefMapValue {
            target_loader: Arc::clone(&winner.loader),
            target_runtime_offset: winner.offset,
            is_code: false,
            is_weak_def: winner.is_weak,
        },
    );

    Some(winner)
}

/// dlsym handle semantics.
pub enum DlsymMode {
    /// RTLD_DEFAULT: every image in load order
    Default,
    /// RTLD_SELF: the caller's image, then its dependents
    SelfAndDeps(Arc<Loader>),
    /// RTLD_NEXT: images after the caller in load order
    Next(Arc<Loader>),
    /// RTLD_MAIN_ONLY
    MainOnly,
    /// explicit handle; `first_only` is RTLD_FIRST
    Handle {
        loader: Arc<Loader>,
        first_only: bool,
    },
}

/// Search for `dlsym`, returning the definer and the resolved address
/// with interposing applied.
pub fn dlsym_search(
    state: &RuntimeState,
    name: &str,
    mode: &DlsymMode,
) -> Option<(Arc<Loader>, usize)> {
    let found = match mode {
        DlsymMode::Default => {
            let candidates = state.with_loaded(|loaded| loaded.to_vec());
            candidates
                .iter()
                .filter(|l| !l.hidden_from_flat())
                .find_map(|l| search_one_image(state, l, name))
        }
        DlsymMode::SelfAndDeps(caller) => search_image_and_deps(state, caller, name),
        DlsymMode::Next(caller) => {
            let candidates = state.with_loaded(|loaded| loaded.to_vec());
            let after = candidates
                .iter()
                .position(|l| Arc::ptr_eq(l, caller))
                .map_or(0, |i| i + 1);
            candidates[after..]
                .iter()
                .find_map(|l| search_one_image(state, l, name))
        }
        DlsymMode::MainOnly => {
            let main = state.main_loader()?;
            search_one_image(state, &main, name)
        }
        DlsymMode::Handle { loader, first_only } => {
            if *first_only {
                search_one_image(state, loader, name)
            } else {
                search_image_and_deps(state, loader, name)
            }
        }
    }?;

    let (definer, offset) = found;
    let addr = definer.load_address(state).wrapping_add(offset as usize);
    let addr = state.apply_interposing(addr, None);
    Some((definer, addr))
}

fn search_image_and_deps(
    state: &RuntimeState,
    root: &Arc<Loader>,
    name: &str,
) -> Option<(Arc<Loader>, u64)> {
    let mut visited: Vec<*const Loader> = Vec::new();
    let mut queue: Vec<Arc<Loader>> = vec![Arc::clone(root)];
    while let Some(loader) = queue.pop() {
        let key = Arc::as_ptr(&loader);
        if visited.contains(&key) {
            continue;
        }
        visited.push(key);
        if let Some(found) = search_one_image(state, &loader, name) {
            return Some(found);
        }
        for i in 0..loader.dependent_count() {
            if let Some(dep) = loader.dependent(state, i) {
                queue.push(dep);
            }
        }
    }
    None
}

/// Nearest preceding exported symbol for `dladdr`, from the symbol table.
pub fn nearest_symbol_in_image(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    addr: usize,
) -> Option<(String, usize)> {
    use goblin::mach::symbols::SIZEOF_NLIST_64;
    use scroll::Pread;

    let base = loader.load_address(state);
    if base == 0 || addr < base {
        return None;
    }
    let target_offset = (addr - base) as u64;
    let image = loader.image(state)?;
    let preferred = image.preferred_base();
    let symtab = image.symtab()?;
    let strtab = image.file_bytes(u64::from(symtab.str_off), symtab.str_size as usize)?;
    let syms = image.file_bytes(
        u64::from(symtab.sym_off),
        symtab.num_syms as usize * SIZEOF_NLIST_64,
    )?;

    let mut best: Option<(u64, String)> = None;
    for i in 0..symtab.num_syms as usize {
        let off = i * SIZEOF_NLIST_64;
        let n_strx: u32 = syms.pread_with(off, scroll::LE).ok()?;
        let n_type: u8 = syms.pread_with(off + 4, scroll::LE).ok()?;
        let n_value: u64 = syms.pread_with(off + 8, scroll::LE).ok()?;
        // defined symbols only
        if n_type & 0x0e != 0x0e {
            continue;
        }
        let sym_offset = n_value.wrapping_sub(preferred);
        if sym_offset > target_offset {
            continue;
        }
        if best.as_ref().is_none_or(|(b, _)| sym_offset > *b) {
            let tail = strtab.get(n_strx as usize..)?;
            let end = tail.iter().position(|&b| b == 0)?;
            if let Ok(name) = std::str::from_utf8(&tail[..end]) {
                best = Some((sym_offset, name.to_owned()));
            }
        }
    }
    best.map(|(offset, name)| (name, base + offset as usize))
}
