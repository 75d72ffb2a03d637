//! Image event notification: registered add/remove/load callbacks, the
//! ObjC runtime hooks, debugger/kdebug breadcrumbs, and dtrace probe
//! registration.
//!
//! Registration replays history: a newly registered add-image callback is
//! invoked for every image already loaded, so late registrars observe a
//! consistent world.

use std::sync::Arc;

use crate::loader::Loader;
use crate::state::{
    BulkLoadNotifier, ImageNotifier, LoadNotifier, ObjCMappedNotifier, ObjCSingleNotifier,
    RuntimeState,
};

const KDBG_CODE_MAP: u32 = 1;
const KDBG_CODE_UNMAP: u32 = 2;

fn slide_of(state: &RuntimeState, loader: &Arc<Loader>) -> isize {
    let base = loader.load_address(state);
    match loader.image(state) {
        Some(image) => (base as i64 - image.preferred_base() as i64) as isize,
        None => 0,
    }
}

pub fn add_notify_add_image(state: &RuntimeState, func: ImageNotifier) {
    state.locks.notifiers.with(|| {
        // replay for everything already loaded
        let loaded = state.with_loaded(|l| l.to_vec());
        for loader in &loaded {
            let mh = loader.load_address(state);
            if mh != 0 {
                func(mh, slide_of(state, loader));
            }
        }
        state.notifiers.lock().unwrap().add_image.push(func);
    });
}

pub fn add_notify_remove_image(state: &RuntimeState, func: ImageNotifier) {
    state.locks.notifiers.with(|| {
        state.notifiers.lock().unwrap().remove_image.push(func);
    });
}

pub fn add_notify_load_image(state: &RuntimeState, func: LoadNotifier) {
    state.locks.notifiers.with(|| {
        let loaded = state.with_loaded(|l| l.to_vec());
        for loader in &loaded {
            let mh = loader.load_address(state);
            if mh != 0 {
                func(mh, loader.path(), !loader.never_unload());
            }
        }
        state.notifiers.lock().unwrap().load_image.push(func);
    });
}

pub fn add_notify_bulk_load_image(state: &RuntimeState, func: BulkLoadNotifier) {
    state.locks.notifiers.with(|| {
        let loaded = state.with_loaded(|l| l.to_vec());
        let mhs: Vec<usize> = loaded.iter().map(|l| l.load_address(state)).collect();
        let paths: Vec<&str> = loaded.iter().map(|l| l.path()).collect();
        if !mhs.is_empty() {
            func(&mhs, &paths);
        }
        state.notifiers.lock().unwrap().bulk_load_image.push(func);
    });
}

pub fn set_objc_notifiers(
    state: &RuntimeState,
    mapped: ObjCMappedNotifier,
    init: ObjCSingleNotifier,
    unmapped: ObjCSingleNotifier,
) {
    state.locks.notifiers.with(|| {
        // the ObjC runtime registers late; hand it every ObjC image that
        // is already mapped
        let loaded = state.with_loaded(|l| l.to_vec());
        let objc: Vec<&Arc<Loader>> = loaded.iter().filter(|l| l.has_objc()).collect();
        if !objc.is_empty() {
            let mhs: Vec<usize> = objc.iter().map(|l| l.load_address(state)).collect();
            let paths: Vec<&str> = objc.iter().map(|l| l.path()).collect();
            mapped(&mhs, &paths);
        }
        let mut notifiers = state.notifiers.lock().unwrap();
        notifiers.objc_mapped = Some(mapped);
        notifiers.objc_init = Some(init);
        notifiers.objc_unmapped = Some(unmapped);
    });
}

/// Dispatched after mapping + fixups, before initializers.
pub fn notify_load(state: &RuntimeState, new_loaders: &[Arc<Loader>]) {
    state.locks.notifiers.with(|| {
        let notifiers = state.notifiers.lock().unwrap();
        let mhs: Vec<usize> = new_loaders.iter().map(|l| l.load_address(state)).collect();
        let paths: Vec<&str> = new_loaders.iter().map(|l| l.path()).collect();

        for (loader, mh) in new_loaders.iter().zip(&mhs) {
            for func in &notifiers.add_image {
                func(*mh, slide_of(state, loader));
            }
            for func in &notifiers.load_image {
                func(*mh, loader.path(), !loader.never_unload());
            }
        }
        for func in &notifiers.bulk_load_image {
            func(&mhs, &paths);
        }

        let objc_indices: Vec<usize> = new_loaders
            .iter()
            .enumerate()
            .filter(|(_, l)| l.has_objc())
            .map(|(i, _)| i)
            .collect();
        if !objc_indices.is_empty() {
            if let Some(mapped) = &notifiers.objc_mapped {
                let objc_mhs: Vec<usize> = objc_indices.iter().map(|&i| mhs[i]).collect();
                let objc_paths: Vec<&str> = objc_indices.iter().map(|&i| paths[i]).collect();
                mapped(&objc_mhs, &objc_paths);
            }
        }
        drop(notifiers);

        notify_debugger_load(state, new_loaders);
        notify_dtrace(state, new_loaders);
    });
}

pub fn notify_unload(state: &RuntimeState, removing: &[Arc<Loader>]) {
    state.locks.notifiers.with(|| {
        let notifiers = state.notifiers.lock().unwrap();
        for loader in removing {
            let mh = loader.load_address(state);
            if let Some(unmapped) = &notifiers.objc_unmapped {
                if loader.has_objc() {
                    unmapped(mh, loader.path());
                }
            }
            for func in &notifiers.remove_image {
                func(mh, slide_of(state, loader));
            }
        }
        drop(notifiers);

        // dtrace probes registered at load time get unregistered
        let mut dofs = state.registered_dofs.lock().unwrap();
        dofs.retain(|(loader, id)| {
            if removing.iter().any(|r| Arc::ptr_eq(r, loader)) {
                state.syscalls().dtrace_unregister_user_probe(*id);
                false
            } else {
                true
            }
        });
        drop(dofs);

        for loader in removing {
            state.syscalls().kdebug_trace_dyld_image(
                KDBG_CODE_UNMAP,
                loader.path(),
                &loader.uuid(),
                0,
                0,
                loader.load_address(state),
            );
        }
    });
}

/// `+load` notification, fired per image during the initializer walk.
pub fn notify_objc_init(state: &RuntimeState, loader: &Arc<Loader>) {
    if !loader.may_have_plus_load() {
        return;
    }
    let mh = loader.load_address(state);
    let notifiers = state.notifiers.lock().unwrap();
    if let Some(func) = &notifiers.objc_init {
        func(mh, loader.path());
    }
}

/// Debugger breadcrumbs: the kernel trace points gdb/lldb key off.
fn notify_debugger_load(state: &RuntimeState, new_loaders: &[Arc<Loader>]) {
    for loader in new_loaders {
        let fid = loader.file_id();
        state.syscalls().kdebug_trace_dyld_image(
            KDBG_CODE_MAP,
            loader.path(),
            &loader.uuid(),
            fid.inode,
            0,
            loader.load_address(state),
        );
    }
}

fn notify_dtrace(state: &RuntimeState, new_loaders: &[Arc<Loader>]) {
    for loader in new_loaders {
        let Some(image) = loader.image(state) else {
            continue;
        };
        let Some(dof) = image.dof_section() else {
            continue;
        };
        let Some(blob) = image.vm_bytes(dof.vm_offset, dof.size as usize) else {
            continue;
        };
        if let Some(id) = state.syscalls().dtrace_register_user_probes(blob) {
            state
                .registered_dofs
                .lock()
                .unwrap()
                .push((Arc::clone(loader), id));
        }
    }
}
