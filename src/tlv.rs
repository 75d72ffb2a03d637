//! Thread-local variable support.
//!
//! At image-map time each TLV-bearing image gets a pthread key and a
//! registry entry describing its initial-content template. The image's
//! TLV descriptors are patched to call the host's `tlv_get_addr` thunk,
//! whose slow path lands in [`instantiate_tlvs`]: allocate a per-thread
//! block, copy the template, stash it under the key.
//!
//! `_tlv_atexit` keeps a per-thread chain of termination callbacks in
//! cache-line-sized nodes of seven entries each, run in reverse order at
//! thread exit (or at `exit_tlv` for process exit).

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::helpers::TlvTermFunc;
use crate::loader::Loader;
use crate::state::{RuntimeState, TlvInfo};

/// One `_tlv_atexit` registration.
#[repr(C)]
#[derive(Clone, Copy)]
struct TlvTerminator {
    func: Option<TlvTermFunc>,
    obj_addr: usize,
}

const TERMINATORS_PER_NODE: usize = 7;

/// One cache line: a next pointer, a count, and seven entries.
#[repr(C)]
struct TlvTerminatorList {
    next: *mut TlvTerminatorList,
    count: usize,
    entries: [TlvTerminator; TERMINATORS_PER_NODE],
}

/// Key under which the terminator chain head is stored, lazily created.
static TERMINATORS_KEY: AtomicU64 = AtomicU64::new(0);

/// Registers an image's thread-local variables. Called at map time; when
/// the host helpers are not up yet (early launch), the registration is
/// completed later by [`finish_pending_tlv_setup`].
pub fn set_up_tlvs(state: &RuntimeState, loader: &Arc<Loader>) {
    let Some(image) = loader.image(state) else {
        return;
    };
    let Some(layout) = image.tlv_layout() else {
        return;
    };

    state.locks.tlv_infos.with(|| {
        {
            let infos = state.tlv_infos.lock().unwrap();
            if infos.iter().any(|i| Arc::ptr_eq(&i.loader, loader)) {
                return;
            }
        }
        let key = match state.helpers() {
            Some(helpers) => helpers.pthread_key_create_free().unwrap_or(0),
            None => 0,
        };
        state.tlv_infos.lock().unwrap().push(TlvInfo {
            loader: Arc::clone(loader),
            key,
            initial_content_offset: layout.content_offset,
            initial_content_size: layout.content_size,
        });
        if key != 0 {
            patch_descriptors(state, loader, key);
        }
    });
}

/// Allocates keys and patches descriptors for images registered before
/// the host helper table arrived.
pub fn finish_pending_tlv_setup(state: &RuntimeState) {
    let Some(helpers) = state.helpers() else {
        return;
    };
    state.locks.tlv_infos.with(|| {
        let pending: Vec<Arc<Loader>> = state
            .tlv_infos
            .lock()
            .unwrap()
            .iter()
            .filter(|i| i.key == 0)
            .map(|i| Arc::clone(&i.loader))
            .collect();
        for loader in pending {
            let Ok(key) = helpers.pthread_key_create_free() else {
                continue;
            };
            let mut infos = state.tlv_infos.lock().unwrap();
            if let Some(info) = infos.iter_mut().find(|i| Arc::ptr_eq(&i.loader, &loader)) {
                info.key = key;
            }
            drop(infos);
            patch_descriptors(state, &loader, key);
        }
    });
}

/// Rewrites each TLV descriptor to `{thunk, key, offset}` with the host's
/// fast-path thunk and the allocated key.
fn patch_descriptors(state: &RuntimeState, loader: &Arc<Loader>, key: u64) {
    let Some(helpers) = state.helpers() else {
        return;
    };
    let Some(image) = loader.image(state) else {
        return;
    };
    let Some(layout) = image.tlv_layout() else {
        return;
    };
    let base = loader.load_address(state);
    let thunk = helpers.tlv_get_addr_func();
    let descriptor_size = 24usize; // thunk, key, offset on 64-bit
    let count = layout.descriptors.size as usize / descriptor_size;
    for i in 0..count {
        let desc = base + layout.descriptors.vm_offset as usize + i * descriptor_size;
        // SAFETY: descriptor addresses come from the image's own
        // __thread_vars section inside its writable data segment
        unsafe {
            (desc as *mut usize).write_unaligned(thunk);
            ((desc + 8) as *mut u64).write_unaligned(key);
        }
    }
}

/// Slow path behind the TLV thunk: first touch of an image's TLVs on
/// this thread.
pub fn instantiate_tlvs(state: &RuntimeState, key: u64) -> usize {
    let Some(helpers) = state.helpers() else {
        return 0;
    };

    let existing = helpers.pthread_getspecific(key);
    if existing != 0 {
        return existing;
    }

    let info = state.locks.tlv_infos.with(|| {
        state
            .tlv_infos
            .lock()
            .unwrap()
            .iter()
            .find(|i| i.key == key)
            .cloned()
    });
    let Some(info) = info else {
        return 0;
    };

    let size = info.initial_content_size as usize;
    let block = helpers.malloc(size.max(1));
    if block == 0 {
        return 0;
    }
    let template = info.loader.load_address(state) + info.initial_content_offset as usize;
    // SAFETY: the template lives in the image's mapped data (zero-fill
    // portions read as zero); block was just allocated with `size` bytes
    unsafe {
        std::ptr::copy_nonoverlapping(template as *const u8, block as *mut u8, size);
    }
    helpers.pthread_setspecific(key, block);
    block
}

/// `tlv_get_addr` slow path: per-thread block for `key`, plus `offset`.
pub fn tlv_get_addr(state: &RuntimeState, key: u64, offset: usize) -> usize {
    let block = instantiate_tlvs(state, key);
    if block == 0 { 0 } else { block + offset }
}

fn terminators_key(state: &RuntimeState) -> u64 {
    let key = TERMINATORS_KEY.load(Ordering::Acquire);
    if key != 0 {
        return key;
    }
    let Some(helpers) = state.helpers() else {
        return 0;
    };
    let Ok(new_key) = helpers.pthread_key_create_thread_exit() else {
        return 0;
    };
    match TERMINATORS_KEY.compare_exchange(0, new_key, Ordering::AcqRel, Ordering::Acquire) {
        Ok(_) => new_key,
        Err(existing) => existing,
    }
}

/// `_tlv_atexit(func, obj)`: push onto the calling thread's chain.
pub fn add_termination_func(state: &RuntimeState, func: TlvTermFunc, obj_addr: usize) {
    let Some(helpers) = state.helpers() else {
        return;
    };
    let key = terminators_key(state);
    if key == 0 {
        return;
    }

    let mut head = helpers.pthread_getspecific(key) as *mut TlvTerminatorList;
    // SAFETY: head is either null or a node we allocated below
    let needs_node = head.is_null() || unsafe { (*head).count } == TERMINATORS_PER_NODE;
    if needs_node {
        let raw = helpers.malloc(std::mem::size_of::<TlvTerminatorList>());
        if raw == 0 {
            return;
        }
        let node = raw as *mut TlvTerminatorList;
        // SAFETY: freshly allocated, sized for the struct
        unsafe {
            (*node).next = head;
            (*node).count = 0;
        }
        helpers.pthread_setspecific(key, raw);
        head = node;
    }
    // SAFETY: head is valid and has room
    unsafe {
        let count = (*head).count;
        (*head).entries[count] = TlvTerminator {
            func: Some(func),
            obj_addr,
        };
        (*head).count = count + 1;
    }
}

/// Runs the calling thread's terminator chain in reverse registration
/// order. Entries added during finalization (nested `_tlv_atexit`) are
/// picked up because each iteration re-reads the head.
pub fn exit_tlv(state: &RuntimeState) {
    let Some(helpers) = state.helpers() else {
        return;
    };
    let key = TERMINATORS_KEY.load(Ordering::Acquire);
    if key == 0 {
        return;
    }

    loop {
        let head = helpers.pthread_getspecific(key) as *mut TlvTerminatorList;
        if head.is_null() {
            break;
        }
        // SAFETY: head chain nodes are only written by this thread
        let entry = unsafe {
            if (*head).count == 0 {
                let next = (*head).next;
                helpers.pthread_setspecific(key, next as usize);
                helpers.free(head as usize);
                continue;
            }
            (*head).count -= 1;
            (*head).entries[(*head).count]
        };
        if let Some(func) = entry.func {
            func(entry.obj_addr);
        }
    }
    helpers.pthread_setspecific(key, 0);
}

/// Thread-exit finalizer invoked by the pthread key destructor.
pub fn finalize_list_tlv(state: &RuntimeState) {
    exit_tlv(state);
}
