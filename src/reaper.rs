//! Mark-and-sweep unloader behind `dlclose`.
//!
//! Triggered when a dlopen reference count reaches zero. Re-entrant
//! triggers (a terminator calling `dlclose`) collapse into one extra
//! iteration of the outer loop instead of recursing.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::loader::Loader;
use crate::state::RuntimeState;

pub fn garbage_collect(state: &RuntimeState) {
    let prev = state.gc_count.fetch_add(1, Ordering::SeqCst);
    if prev != 0 {
        // a collection is already running; it will notice and re-iterate
        return;
    }
    loop {
        state.locks.loaders.with(|| collect_once(state));
        let remaining = state.gc_count.fetch_sub(1, Ordering::SeqCst);
        if remaining == 1 {
            break;
        }
        // requests arrived mid-collection; fold them into one more pass
        state.gc_count.store(1, Ordering::SeqCst);
    }
}

fn collect_once(state: &RuntimeState) {
    // snapshot of what could go away at all
    let loaded = state.with_loaded(|l| l.to_vec());
    let unloadable: Vec<Arc<Loader>> = loaded
        .iter()
        .filter(|l| !l.dylib_in_dyld_cache() && !l.never_unload())
        .cloned()
        .collect();
    if unloadable.is_empty() {
        return;
    }

    // mark roots: anything pinned by construction, by an open handle, or
    // by a callback registration that cannot be undone
    let mut in_use: Vec<Arc<Loader>> = loaded
        .iter()
        .filter(|l| l.dylib_in_dyld_cache() || l.never_unload())
        .cloned()
        .collect();
    for loader in state.loaders_with_ref_counts() {
        push_unique(&mut in_use, loader);
    }
    for loader in state.dynamic_never_unloads.lock().unwrap().iter() {
        push_unique(&mut in_use, Arc::clone(loader));
    }
    if let Some(main) = state.main_loader() {
        push_unique(&mut in_use, main);
    }

    // propagate through static dependents and dynamic references until
    // the in-use set stops growing
    let mut i = 0;
    while i < in_use.len() {
        let loader = Arc::clone(&in_use[i]);
        i += 1;
        for d in 0..loader.dependent_count() {
            if let Some(dep) = loader.dependent(state, d) {
                push_unique(&mut in_use, dep);
            }
        }
        state.with_dynamic_references(|refs| {
            for (from, to) in refs {
                if Arc::ptr_eq(from, &loader) {
                    push_unique(&mut in_use, Arc::clone(to));
                }
            }
        });
    }

    let dead: Vec<Arc<Loader>> = unloadable
        .iter()
        .filter(|l| !in_use.iter().any(|u| Arc::ptr_eq(u, l)))
        .cloned()
        .collect();
    if dead.is_empty() {
        return;
    }

    log::debug!(
        "reaper: unloading {}",
        dead.iter()
            .map(|l| l.leaf_name())
            .collect::<Vec<_>>()
            .join(", ")
    );

    // terminators first, in reverse discovery order
    for loader in dead.iter().rev() {
        crate::init::finalize_ranges(state, loader);
        crate::init::run_static_terminators(state, loader);
    }

    crate::notifier::notify_unload(state, &dead);

    state.remove_loaders(&dead);
    for loader in &dead {
        state.remove_dynamic_dependencies(loader);
    }
    state.remove_missing_flat_lazy_symbols(&dead);
    scrub_weak_def_map(state, &dead);

    for loader in &dead {
        loader.unmap(state, false);
        // break Arc cycles through the dependents arrays and make any
        // stale pointer to this loader fail its magic check
        if let Some(jit) = loader.jit() {
            jit.clear_dependents();
        }
        loader.poison();
    }
}

fn push_unique(set: &mut Vec<Arc<Loader>>, loader: Arc<Loader>) {
    if !set.iter().any(|l| Arc::ptr_eq(l, &loader)) {
        set.push(loader);
    }
}

/// Weak-def map entries pointing into a dying image are dropped. Keys are
/// owned strings, so no key storage lives in the unloading image.
fn scrub_weak_def_map(state: &RuntimeState, dead: &[Arc<Loader>]) {
    let mut map = state.weak_def_map.lock().unwrap();
    if let Some(map) = map.as_mut() {
        map.retain(|_, v| !dead.iter().any(|d| Arc::ptr_eq(d, &v.target_loader)));
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::{PLATFORM_MACOS, Platform, ProcessConfig};
    use crate::loader::jit::make_test_loader;
    use crate::mach::{Arch, DependentKind};
    use crate::syscall::test_shim::AnonShim;

    fn test_state() -> RuntimeState {
        let config = ProcessConfig::new("/app/Main", Platform(PLATFORM_MACOS), Arch::Arm64);
        RuntimeState::new(Arc::new(config), Arc::new(AnonShim))
    }

    #[test]
    fn sweep_removes_unreferenced_images_and_their_deps() {
        let state = test_state();
        let bar = make_test_loader("/opt/libBar.dylib", vec![]);
        let foo = crate::loader::jit::make_test_loader_with_deps(
            "/opt/libFoo.dylib",
            vec![],
            vec![(Arc::clone(&bar), DependentKind::Normal)],
        );
        state.add(Arc::clone(&foo));
        state.add(Arc::clone(&bar));

        state.inc_dl_ref_count(&foo);
        assert_eq!(state.dl_ref_count(&foo), 1);

        // still referenced: nothing unloads
        garbage_collect(&state);
        assert_eq!(state.loaded_count(), 2);

        assert!(state.dec_dl_ref_count(&foo));
        garbage_collect(&state);
        assert_eq!(state.loaded_count(), 0);
        assert!(!foo.has_magic());
        assert!(!bar.has_magic());
    }

    #[test]
    fn dynamic_reference_pins_target() {
        let state = test_state();
        let holder = make_test_loader("/opt/libHolder.dylib", vec![]);
        let target = make_test_loader("/opt/libTarget.dylib", vec![]);
        state.add(Arc::clone(&holder));
        state.add(Arc::clone(&target));
        state.inc_dl_ref_count(&holder);
        state.add_dynamic_reference(&holder, &target);

        garbage_collect(&state);
        // holder has a refcount and pins target through the edge
        assert_eq!(state.loaded_count(), 2);

        state.dec_dl_ref_count(&holder);
        garbage_collect(&state);
        assert_eq!(state.loaded_count(), 0);
    }
}
