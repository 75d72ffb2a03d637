//! Upcall vtable into the host system library.
//!
//! A handful of objects have an ABI that demands system malloc or
//! pthread machinery (dlerror strings, TLV block storage, terminator
//! nodes), so once libSystem is initialized it hands the loader this
//! helper table. The table is versioned: the loader must check
//! [`LibSystemHelpers::version`] before calling any method whose index is
//! newer than version 1.

/// Termination callback registered via `_tlv_atexit`.
pub type TlvTermFunc = fn(obj_addr: usize);

/// Method indices by version:
/// v1: malloc/free/malloc_size, pthread key + specific, cxa hooks,
///     exit/getenv, tlv_get_addr_func
/// v2: mkstemp
pub trait LibSystemHelpers: Send + Sync {
    fn version(&self) -> u32;

    fn malloc(&self, size: usize) -> usize;
    fn free(&self, ptr: usize);
    fn malloc_size(&self, ptr: usize) -> usize;

    /// Creates a pthread key whose destructor frees the value.
    fn pthread_key_create_free(&self) -> Result<u64, ()>;
    /// Creates a pthread key whose destructor runs the TLV finalizer at
    /// thread exit.
    fn pthread_key_create_thread_exit(&self) -> Result<u64, ()>;
    fn pthread_getspecific(&self, key: u64) -> usize;
    fn pthread_setspecific(&self, key: u64, value: usize) -> i32;

    fn cxa_atexit(&self, func: TlvTermFunc, arg: usize, dso: usize);
    fn cxa_finalize_ranges(&self, ranges: &[(usize, usize)]);

    fn exit(&self, code: i32) -> !;
    fn getenv(&self, key: &str) -> Option<String>;

    /// v2 and later.
    fn mkstemp(&self, _template: &str) -> Option<(i32, String)> {
        None
    }

    /// Address of the fast-path TLV thunk exported by libdyld.
    fn tlv_get_addr_func(&self) -> usize;
}
