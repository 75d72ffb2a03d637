//! Monotonic allocator backing long-lived runtime data.
//!
//! Grows by whole pages via fresh anonymous mappings; [`BumpArena::finalize`]
//! trims to a page boundary and flips the mapping read-only so that once
//! launch bind-up is done the loader metadata is paged clean. A
//! [`WritableWindow`] counter lets authorized mutators temporarily flip the
//! finalized region back to read-write.

use std::sync::{Arc, Mutex};

use crate::syscall::{Prot, SyscallShim};

pub struct BumpArena {
    shim: Arc<dyn SyscallShim>,
    start: usize,
    capacity: usize,
    used: usize,
}

impl BumpArena {
    pub fn new(shim: Arc<dyn SyscallShim>) -> Self {
        Self {
            shim,
            start: 0,
            capacity: 0,
            used: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.used
    }

    /// Appends `bytes` and returns the offset of the copy within the arena.
    pub fn append(&mut self, bytes: &[u8]) -> usize {
        let offset = self.reserve(bytes.len());
        // SAFETY: reserve() guarantees [start+offset, +len) is inside the
        // live anonymous mapping and unaliased
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.start + offset) as *mut u8,
                bytes.len(),
            );
        }
        offset
    }

    pub fn zero_fill(&mut self, len: usize) -> usize {
        // fresh anonymous pages are already zero
        self.reserve(len)
    }

    pub fn align(&mut self, multiple_of: usize) {
        let rem = self.used % multiple_of;
        if rem != 0 {
            self.zero_fill(multiple_of - rem);
        }
    }

    /// Offset of the next append. Stable across growth, unlike addresses.
    pub fn current_offset(&self) -> usize {
        self.used
    }

    pub fn bytes(&self) -> &[u8] {
        if self.used == 0 {
            return &[];
        }
        // SAFETY: [start, start+used) is initialized arena content
        unsafe { std::slice::from_raw_parts(self.start as *const u8, self.used) }
    }

    /// Patch previously appended content in place.
    pub fn write_at(&mut self, offset: usize, bytes: &[u8]) {
        assert!(offset + bytes.len() <= self.used);
        // SAFETY: bounds asserted against the live mapping
        unsafe {
            std::ptr::copy_nonoverlapping(
                bytes.as_ptr(),
                (self.start + offset) as *mut u8,
                bytes.len(),
            );
        }
    }

    fn reserve(&mut self, len: usize) -> usize {
        if self.used + len > self.capacity {
            self.grow(self.used + len);
        }
        let offset = self.used;
        self.used += len;
        offset
    }

    fn grow(&mut self, needed: usize) {
        let page = self.shim.page_size();
        let new_capacity = (needed + page).next_multiple_of(page).max(self.capacity * 2);
        let new_start = self
            .shim
            .mmap(0, new_capacity, Prot::READ | Prot::WRITE, None, 0)
            .expect("anonymous mapping for arena growth");
        if self.capacity != 0 {
            // SAFETY: old mapping still valid until the munmap below
            unsafe {
                std::ptr::copy_nonoverlapping(
                    self.start as *const u8,
                    new_start as *mut u8,
                    self.used,
                );
            }
            self.shim.munmap(self.start, self.capacity);
        }
        self.start = new_start;
        self.capacity = new_capacity;
    }

    /// Trims to a page boundary, maps the content read-only, and consumes
    /// the arena. Subsequent writes through stale pointers trap.
    pub fn finalize(mut self) -> FinalizedArena {
        let page = self.shim.page_size();
        let final_len = self.used.next_multiple_of(page);
        if final_len < self.capacity {
            self.shim.munmap(self.start + final_len, self.capacity - final_len);
        }
        if final_len != 0 {
            let _ = self.shim.mprotect(self.start, final_len, Prot::READ);
        }
        let region = FinalizedArena {
            shim: Arc::clone(&self.shim),
            addr: self.start,
            len: final_len,
            used: self.used,
        };
        self.capacity = 0; // defuse Drop
        region
    }
}

impl Drop for BumpArena {
    fn drop(&mut self) {
        if self.capacity != 0 {
            self.shim.munmap(self.start, self.capacity);
        }
    }
}

/// Read-only result of [`BumpArena::finalize`].
pub struct FinalizedArena {
    shim: Arc<dyn SyscallShim>,
    addr: usize,
    len: usize,
    used: usize,
}

impl FinalizedArena {
    pub fn address(&self) -> usize {
        self.addr
    }

    pub fn mapped_len(&self) -> usize {
        self.len
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the finalized mapping stays alive for the lifetime of self
        unsafe { std::slice::from_raw_parts(self.addr as *const u8, self.used) }
    }

    pub(crate) fn protect(&self, prot: Prot) {
        if self.len != 0 {
            let _ = self.shim.mprotect(self.addr, self.len, prot);
        }
    }
}

/// Reference-counted writable window over one or more finalized regions.
///
/// `inc` flips the regions read-write when the count leaves zero; the
/// outermost `dec` restores read-only. The count and region list share one
/// dedicated mutex (spec'd separately from the recursive runtime locks).
pub struct WritableWindow {
    inner: Mutex<WindowState>,
}

struct WindowState {
    count: i32,
    regions: Vec<Arc<FinalizedArena>>,
}

impl WritableWindow {
    /// The window starts open: launch runs with the arena writable and the
    /// orchestrator performs the closing `dec` once bind-up is complete.
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WindowState {
                count: 1,
                regions: Vec::new(),
            }),
        }
    }

    pub fn track(&self, region: Arc<FinalizedArena>) {
        let mut st = self.inner.lock().unwrap();
        if st.count > 0 {
            region.protect(Prot::READ | Prot::WRITE);
        }
        st.regions.push(region);
    }

    pub fn inc(&self) {
        let mut st = self.inner.lock().unwrap();
        st.count += 1;
        if st.count == 1 {
            for r in &st.regions {
                r.protect(Prot::READ | Prot::WRITE);
            }
        }
    }

    pub fn dec(&self) {
        let mut st = self.inner.lock().unwrap();
        st.count -= 1;
        if st.count == 0 {
            for r in &st.regions {
                r.protect(Prot::READ);
            }
        }
    }
}

impl Default for WritableWindow {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::syscall::test_shim::AnonShim;

    fn arena() -> BumpArena {
        BumpArena::new(Arc::new(AnonShim))
    }

    #[test]
    fn append_survives_growth() {
        let mut a = arena();
        let first = a.append(b"hello");
        // force at least one regrowth
        for _ in 0..64 {
            a.append(&[0xabu8; 1024]);
        }
        assert_eq!(first, 0);
        assert_eq!(&a.bytes()[..5], b"hello");
        assert_eq!(a.bytes()[5..][..1024], [0xab; 1024]);
    }

    #[test]
    fn align_pads_with_zeros() {
        let mut a = arena();
        a.append(b"abc");
        a.align(8);
        assert_eq!(a.size(), 8);
        assert_eq!(&a.bytes()[3..8], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn finalize_trims_to_page() {
        let mut a = arena();
        a.append(&[1u8; 100]);
        let fin = a.finalize();
        assert_eq!(fin.mapped_len(), 0x1000);
        assert_eq!(fin.bytes().len(), 100);
        assert_eq!(fin.bytes()[0], 1);
    }

    #[test]
    fn writable_window_is_refcounted() {
        let w = WritableWindow::new();
        // launch leaves the window open once; nested pairs must balance
        w.inc();
        w.dec();
        w.dec(); // closes the launch-time window
        w.inc();
        w.dec();
    }
}
