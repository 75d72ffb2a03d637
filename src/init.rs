//! Initializer and terminator sequencing.
//!
//! Initializers run bottom-up across the dependency graph with a
//! three-state marker per image so cycles terminate. Upward edges are
//! deferred to a dangling list revisited after the main walk, which also
//! handles dangling-upward-from-dangling-upward chains.

use std::sync::Arc;

use crate::config::LogFlags;
use crate::loader::Loader;
use crate::mach::DependentKind;
use crate::state::RuntimeState;

/// Signature of a `__mod_init_func` entry.
type Initializer = unsafe extern "C" fn(i32, usize, usize, usize, *const crate::config::ProgramVars);

/// Signature of a `__mod_term_func` entry.
type Terminator = unsafe extern "C" fn();

pub fn run_initializers_bottom_up_plus_upward_links(state: &RuntimeState, loader: &Arc<Loader>) {
    let mut dangling: Vec<Arc<Loader>> = Vec::new();
    run_initializers_bottom_up(state, loader, &mut dangling);

    // dangling upward deps may themselves discover more dangling upwards
    while let Some(upward) = dangling.pop() {
        run_initializers_bottom_up(state, &upward, &mut dangling);
    }
}

pub fn run_initializers_bottom_up(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    dangling_upwards: &mut Vec<Arc<Loader>>,
) {
    if !loader.begin_initializers(state) {
        return; // already running or done
    }

    for i in 0..loader.dependent_count() {
        let Some((dep, kind)) = loader.dependent_with_kind(state, i) else {
            continue;
        };
        if kind == DependentKind::Upward {
            if !dangling_upwards.iter().any(|l| Arc::ptr_eq(l, &dep)) {
                dangling_upwards.push(dep);
            }
            continue;
        }
        run_initializers_bottom_up(state, &dep, dangling_upwards);
    }

    crate::notifier::notify_objc_init(state, loader);
    run_image_initializers(state, loader);
    loader.set_initialized(state);
}

fn run_image_initializers(state: &RuntimeState, loader: &Arc<Loader>) {
    let Some(image) = loader.image(state) else {
        return;
    };
    let base = loader.load_address(state);
    let offsets = image.initializer_offsets(image.preferred_base());
    if offsets.is_empty() {
        return;
    }
    let vars = state.config.program_vars;
    let pv = &state.config.program_vars as *const crate::config::ProgramVars;
    for offset in offsets {
        if state.config.log_enabled(LogFlags::INITIALIZERS) {
            log::info!(
                "running initializer {:#x} in '{}'",
                base + offset as usize,
                loader.path()
            );
        }
        // SAFETY: the offset came from the image's own initializer
        // sections; the segment holding it is mapped executable
        unsafe {
            let func: Initializer = std::mem::transmute(base + offset as usize);
            func(vars.argc, vars.argv, vars.envp, vars.apple, pv);
        }
    }
}

/// Static terminators, in reverse discovery order. arm64e binaries have
/// no `__mod_term_func` support; platform policy skips them entirely.
pub fn run_static_terminators(state: &RuntimeState, loader: &Arc<Loader>) {
    if state.config.arch.uses_pointer_auth() {
        return;
    }
    let Some(image) = loader.image(state) else {
        return;
    };
    let base = loader.load_address(state);
    let mut offsets = image.terminator_offsets(image.preferred_base());
    offsets.reverse();
    for offset in offsets {
        if state.config.log_enabled(LogFlags::INITIALIZERS) {
            log::info!(
                "running terminator {:#x} in '{}'",
                base + offset as usize,
                loader.path()
            );
        }
        // SAFETY: offset from the image's own terminator section
        unsafe {
            let func: Terminator = std::mem::transmute(base + offset as usize);
            func();
        }
    }
}

/// `__cxa_finalize_ranges` over an image's executable segments, ahead of
/// unmapping it.
pub fn finalize_ranges(state: &RuntimeState, loader: &Arc<Loader>) {
    let Some(helpers) = state.helpers() else {
        return;
    };
    let base = loader.load_address(state);
    if base == 0 {
        return;
    }
    let ranges: Vec<(usize, usize)> = loader
        .regions()
        .iter()
        .filter(|r| r.perms & 0x4 != 0)
        .map(|r| (base + r.vm_offset as usize, r.file_size as usize))
        .collect();
    if !ranges.is_empty() {
        helpers.cxa_finalize_ranges(&ranges);
    }
}
