//! Top-level launch sequence.
//!
//! Bootstraps the runtime, loads the main executable with its inserted
//! dylibs and transitive dependents (through the PrebuiltLoaderSet when a
//! valid one exists), builds interpose tables, applies fixups bottom-up,
//! dispatches load notifications, runs initializers, and hands back the
//! entry point.

use std::sync::Arc;

use crate::cache::DataConstLazyWriter;
use crate::errors::{Diagnostics, LoadError};
use crate::loader::{self, LoadOptions, Loader};
use crate::prebuilt_set;
use crate::state::RuntimeState;

pub struct LaunchResult {
    pub main_loader: Arc<Loader>,
    /// runtime address of `LC_MAIN`'s entry, zero for dylib hosts
    pub entry_addr: usize,
}

pub fn launch(state: &RuntimeState) -> Result<LaunchResult, LoadError> {
    state.locks.api.with(|| launch_locked(state))
}

fn launch_locked(state: &RuntimeState) -> Result<LaunchResult, LoadError> {
    let mut diag = Diagnostics::new();

    // a saved PrebuiltLoaderSet skips re-parsing the whole launch; any
    // validation failure silently demotes to a just-in-time launch
    let mut used_prebuilt = false;
    if let Some(set) = prebuilt_set::load_process_set(state) {
        prebuilt_set::attach(state, set, true);
        used_prebuilt = try_prebuilt_launch(&mut diag, state);
        if !used_prebuilt {
            // anything a partial prebuilt attempt put in the loaded list
            // must go before the just-in-time retry
            let leftover = state.with_loaded(|l| l.to_vec());
            if !leftover.is_empty() {
                state.remove_loaders(&leftover);
            }
            state.detach_process_prebuilt_set();
            diag.clear();
            log::debug!("prebuilt loader set abandoned, falling back to just-in-time launch");
        }
    }

    let main_loader = match state.main_loader() {
        Some(main) if used_prebuilt => main,
        _ => crate::loader::jit::make_main_executable_loader(state)?,
    };

    let launch_options = LoadOptions {
        launching: true,
        static_linkage: true,
        can_be_dylib: true,
        use_fallback_paths: true,
        ..Default::default()
    };

    // DYLD_INSERT_LIBRARIES, positioned ahead of main in flat order
    let mut inserted: Vec<Arc<Loader>> = Vec::new();
    if !used_prebuilt {
        for path in state.config.path_overrides.insert_paths.clone() {
            let options = LoadOptions {
                inserted_dylib: true,
                ..launch_options
            };
            match loader::get_loader(&mut diag, state, &path, &options) {
                Some(l) => inserted.push(l),
                None => {
                    if state.config.security.allow_insert_failures {
                        log::warn!("could not load inserted library '{path}'");
                        diag.clear();
                    } else {
                        return Err(LoadError::DylibMissing {
                            path,
                            referenced_from: "DYLD_INSERT_LIBRARIES".to_owned(),
                        });
                    }
                }
            }
        }
        if !inserted.is_empty() {
            state.move_before(&inserted, &main_loader);
        }

        main_loader.load_dependents(&mut diag, state, &launch_options)?;
        for ins in &inserted {
            ins.load_dependents(&mut diag, state, &launch_options)?;
        }
    }

    let all_loaded = state.with_loaded(|l| l.to_vec());

    // interpose tuples must exist before any bind is written
    crate::interpose::build_interposing_tables(state, &all_loaded);

    apply_fixups_bottom_up(&mut diag, state, &all_loaded)?;

    // roots that shadow cached dylibs patch the cache's users now that
    // their own exports are resolved
    apply_cache_patches_for_overrides(state, &all_loaded);
    crate::interpose::apply_interposing_to_cache(state);

    crate::notifier::notify_load(state, &all_loaded);

    let permanent: Vec<Arc<Loader>> = all_loaded
        .iter()
        .filter(|l| l.never_unload() && !l.dylib_in_dyld_cache())
        .cloned()
        .collect();
    state.add_permanent_ranges(&permanent);

    crate::init::run_initializers_bottom_up_plus_upward_links(state, &main_loader);

    // launch bind-up is done: close the writable window so long-term
    // structures page read-only
    state.writable.dec();

    maybe_save_prebuilt_set(state, used_prebuilt);

    let entry_addr = main_loader
        .image(state)
        .and_then(|image| image.entry_offset())
        .map_or(0, |off| main_loader.load_address(state) + off as usize);

    Ok(LaunchResult {
        main_loader,
        entry_addr,
    })
}

/// Attempts the whole launch through the attached set. Returns false on
/// any validation failure, leaving the state clean enough to retry
/// just-in-time.
fn try_prebuilt_launch(diag: &mut Diagnostics, state: &RuntimeState) -> bool {
    let main_path = state.config.main_executable_path.clone();
    let Some(handle) = state.find_prebuilt_loader(&main_path) else {
        return false;
    };
    let valid = handle.prebuilt().is_some_and(|p| p.is_valid(state));
    if !valid {
        return false;
    }

    // the kernel mapped main already; record its address instead of
    // re-mapping
    handle.set_load_address(state, state.config.main_executable_addr);
    handle.set_loader_state(state, crate::loader::LoaderState::Mapped);
    state.add(Arc::clone(&handle));
    state.set_main_loader(Arc::clone(&handle));

    let options = LoadOptions {
        launching: true,
        static_linkage: true,
        can_be_dylib: true,
        use_fallback_paths: true,
        ..Default::default()
    };
    if handle.load_dependents(diag, state, &options).is_err() {
        return false;
    }
    true
}

fn apply_fixups_bottom_up(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loaders: &[Arc<Loader>],
) -> Result<(), LoadError> {
    // without a shared cache the writer is inert, but the call shape is
    // shared
    let inert;
    let cache = match state.config.shared_cache.as_deref() {
        Some(cache) => cache,
        None => {
            inert = crate::cache::DyldCache::new(0, 0, [0; 16], false);
            &inert
        }
    };
    let mut writer = DataConstLazyWriter::new(cache, state.syscalls());
    let result = fixup_all(diag, state, loaders, &mut writer);
    if let Err(err) = &result {
        if let LoadError::SymbolMissing {
            name,
            expected_in,
            referenced_from,
        } = err
        {
            state.set_launch_missing_symbol(name, expected_in, referenced_from);
        }
    }
    result
}

fn fixup_all(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loaders: &[Arc<Loader>],
    writer: &mut DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    // dependents were appended after their parents; walking the list in
    // reverse fixes leaves before the images binding against them
    for loader in loaders.iter().rev() {
        loader.apply_fixups(diag, state, writer, true)?;
    }
    Ok(())
}

/// For every root overriding a cached dylib: compute its patch table and
/// rewrite the cache's uses of each patched export.
pub fn apply_cache_patches_for_overrides(state: &RuntimeState, loaders: &[Arc<Loader>]) {
    let Some(cache) = state.config.shared_cache.as_deref() else {
        return;
    };
    let mut writer = DataConstLazyWriter::new(cache, state.syscalls());
    for loader in loaders {
        crate::loader::jit::build_override_patch_table(state, loader);
        let Some((patches, overridden)) = loader.overrides_dylib_in_cache() else {
            continue;
        };
        let exports = cache.patched_exports_of(overridden);
        for (patch, export_offset) in patches.iter().zip(exports) {
            let resolved = match patch.override_offset_of_impl {
                crate::loader::DylibPatch::MISSING_SYMBOL => {
                    crate::loader::ResolvedSymbol::absolute("", 0)
                }
                offset => crate::loader::ResolvedSymbol {
                    target: crate::loader::ResolvedTarget::Image {
                        loader: Arc::clone(loader),
                        offset: offset as u64,
                    },
                    name: cache
                        .export_name_for(overridden, export_offset)
                        .unwrap_or_default(),
                    is_code: true,
                    is_weak_def: false,
                    is_missing_lazy: false,
                },
            };
            crate::fixups::patch_cache_users(state, &mut writer, overridden, export_offset, &resolved);
        }
    }
}

/// Saving is double-gated: the config policy switch, and nothing in the
/// launch that a saved set cannot reproduce.
fn maybe_save_prebuilt_set(state: &RuntimeState, used_prebuilt: bool) {
    if used_prebuilt || !state.config.allow_prebuilt_saving {
        return;
    }
    match prebuilt_set::make_launch_set(state) {
        Ok(bytes) => {
            if let Err(err) = prebuilt_set::save_process_set(state, &bytes) {
                log::debug!("not saving prebuilt loader set: {err}");
            }
        }
        Err(err) => log::debug!("cannot serialize launch: {err}"),
    }
}
