//! `__interpose` section handling.
//!
//! Before fixups run at launch, every non-cached image is scanned for
//! interpose tuples. The generic table rewrites all binds to a replacee;
//! per-image exceptions keep the interposer itself bound to the previous
//! implementation so it can call through.

use std::sync::Arc;

use crate::cache::DataConstLazyWriter;
use crate::config::LogFlags;
use crate::loader::{Loader, ResolvedSymbol, ResolvedTarget};
use crate::state::{InterposeTupleAll, InterposeTupleSpecific, RuntimeState};

/// Scans `new_loaders` for `__interpose` sections and merges their tuples
/// into the runtime tables. No-op when the security policy forbids
/// interposing.
///
/// The section itself is pre-fixup at this point, so the tuple is read
/// through the image's fixup metadata: the replacement slot is a rebase
/// (a local function), the replacee slot a bind whose symbol is resolved
/// here.
pub fn build_interposing_tables(state: &RuntimeState, new_loaders: &[Arc<Loader>]) {
    if !state.config.security.allow_interposing {
        return;
    }

    for loader in new_loaders {
        if loader.dylib_in_dyld_cache() {
            continue;
        }
        let Some(image) = loader.image(state) else {
            continue;
        };
        let mut section = None;
        for seg in ["__DATA", "__DATA_CONST", "__AUTH_CONST"] {
            section = image.find_section(seg, "__interpose");
            if section.is_some() {
                break;
            }
        }
        let Some(section) = section else {
            continue;
        };
        let base = loader.load_address(state);
        let preferred = image.preferred_base();
        let tuple_count = section.size as usize / 16;
        if tuple_count == 0 {
            continue;
        }

        let bind_sites = crate::fixups::collect_bind_sites(state, loader);
        let mut diag = crate::errors::Diagnostics::new();

        for i in 0..tuple_count {
            let replacement_off = section.vm_offset + (i as u64) * 16;
            let replacee_off = replacement_off + 8;

            // replacement: local implementation, recorded as a rebase
            let Some(target) =
                crate::fixups::read_prefixup_rebase_target(state, loader, replacement_off)
            else {
                continue;
            };
            let replacement = (base as u64 + target.wrapping_sub(preferred)) as usize;

            // replacee: external symbol, recorded as a bind
            let Some(site) = bind_sites.iter().find(|s| s.vm_offset == replacee_off) else {
                continue;
            };
            let request = crate::resolve::SymbolRequest {
                lib_ordinal: site.lib_ordinal,
                name: &site.name,
                weak_import: site.weak_import,
                lazy_bind: false,
            };
            let Ok(resolved) =
                crate::resolve::resolve_symbol(&mut diag, state, loader, &request, None)
            else {
                diag.clear();
                continue;
            };
            let replacee = resolved.resolved_address(state);

            add_tuple(state, loader, replacement, replacee);

            // a replacee living in a root that overrides a cached dylib
            // also needs its cache-side address interposed, or cached
            // callers keep the old implementation
            if let Some(cache_addr) = cache_side_address(state, replacee) {
                if cache_addr != replacee {
                    add_tuple(state, loader, replacement, cache_addr);
                }
            }

            if state.config.log_enabled(LogFlags::INTERPOSING) {
                log::info!(
                    "interpose {replacee:#x} -> {replacement:#x} ({}) from '{}'",
                    site.name,
                    loader.path()
                );
            }
        }
    }
}

fn add_tuple(
    state: &RuntimeState,
    interposer: &Arc<Loader>,
    replacement: usize,
    replacee: usize,
) {
    let mut all = state.interposing_tuples_all.lock().unwrap();
    let mut specific = state.interposing_tuples_specific.lock().unwrap();

    // the interposer keeps seeing the previous implementation, which is
    // either the original or an earlier interposer's replacement
    let previous = all
        .iter()
        .find(|t| t.replacee == replacee)
        .map_or(replacee, |t| t.replacement);
    specific.push(InterposeTupleSpecific {
        only_image: Arc::clone(interposer),
        replacement: previous,
        replacee,
    });

    if let Some(existing) = all.iter_mut().find(|t| t.replacee == replacee) {
        existing.replacement = replacement;
    } else {
        all.push(InterposeTupleAll {
            replacement,
            replacee,
        });
    }
}

/// If `addr` lies in an image overriding a cached dylib, the equivalent
/// address inside the cache (found through the export tables).
fn cache_side_address(state: &RuntimeState, addr: usize) -> Option<usize> {
    let cache = state.config.shared_cache.as_deref()?;
    let owner = state.loader_containing_address(addr)?;
    let (_, overridden) = owner.overrides_dylib_in_cache()?;
    let offset = (addr - owner.load_address(state)) as u64;
    let dylib = cache.dylib(overridden)?;
    // match by exported symbol offset in the override image
    let image = owner.image(state)?;
    let trie_range = owner.exports_trie()?;
    let trie = image.vm_bytes(trie_range.0, trie_range.1 as usize)?;
    for (name, cache_off) in &dylib.export_symbols {
        if let Some(entry) = crate::mach::trie_lookup(trie, name) {
            if entry.value == offset {
                return Some(cache.base_addr + dylib.mh_vm_offset as usize + *cache_off as usize);
            }
        }
    }
    None
}

/// Rewrites shared-cache bindings already pointing at interposed
/// functions: every cache user of a replacee gets the replacement.
pub fn apply_interposing_to_cache(state: &RuntimeState) {
    let Some(cache) = state.config.shared_cache.as_deref() else {
        return;
    };
    let tuples = state.interposing_tuples_all.lock().unwrap().clone();
    if tuples.is_empty() {
        return;
    }
    let mut writer = DataConstLazyWriter::new(cache, state.syscalls());
    for tuple in &tuples {
        // locate the replacee inside the cache
        let Some((idx, dylib)) = cache
            .dylibs
            .iter()
            .enumerate()
            .find(|(_, d)| {
                let start = cache.base_addr + d.mh_vm_offset as usize;
                tuple.replacee >= start && tuple.replacee < start + d.vm_size as usize
            })
        else {
            continue;
        };
        let export_offset =
            (tuple.replacee - (cache.base_addr + dylib.mh_vm_offset as usize)) as u32;
        let resolved = ResolvedSymbol {
            target: ResolvedTarget::Absolute {
                value: tuple.replacement as u64,
            },
            name: String::new(),
            is_code: true,
            is_weak_def: false,
            is_missing_lazy: false,
        };
        crate::fixups::patch_cache_users(state, &mut writer, idx as u16, export_offset, &resolved);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PLATFORM_MACOS, Platform, ProcessConfig};
    use crate::loader::jit::make_test_loader;
    use crate::mach::Arch;
    use crate::syscall::test_shim::AnonShim;

    fn test_state() -> RuntimeState {
        let config = ProcessConfig::new("/app/Main", Platform(PLATFORM_MACOS), Arch::Arm64);
        RuntimeState::new(Arc::new(config), Arc::new(AnonShim))
    }

    #[test]
    fn first_interposer_chains_to_original() {
        let state = test_state();
        let interposer = make_test_loader("/app/libtrace.dylib", vec![]);
        add_tuple(&state, &interposer, 0x2000, 0x1000);

        // everyone else sees the replacement
        assert_eq!(state.apply_interposing(0x1000, None), 0x2000);
        // the interposer still sees the original
        assert_eq!(state.apply_interposing(0x1000, Some(&interposer)), 0x1000);
    }

    #[test]
    fn second_interposer_chains_to_first() {
        let state = test_state();
        let first = make_test_loader("/app/liba.dylib", vec![]);
        let second = make_test_loader("/app/libb.dylib", vec![]);
        add_tuple(&state, &first, 0x2000, 0x1000);
        add_tuple(&state, &second, 0x3000, 0x1000);

        assert_eq!(state.apply_interposing(0x1000, None), 0x3000);
        // the second interposer calls through to the first
        assert_eq!(state.apply_interposing(0x1000, Some(&second)), 0x2000);
        // the first still reaches the original
        assert_eq!(state.apply_interposing(0x1000, Some(&first)), 0x1000);
    }
}
