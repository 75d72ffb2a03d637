//! Process-lifetime Mach-O loader core.
//!
//! One [`loader::Loader`] exists per mapped image, driving dependent
//! discovery, segment mapping, fixup application, and initializer
//! sequencing. [`state::RuntimeState`] coordinates the loaded-image list,
//! symbol resolution, interposing, TLS, and the mark-and-sweep unloader
//! behind `dlclose`. Launches can be replayed from an on-disk
//! [`prebuilt_set::PrebuiltLoaderSet`] that pre-computes the dependency
//! graph and bind targets.
//!
//! The kernel surface is injected via [`syscall::SyscallShim`]; a real
//! unix implementation lives in [`host`], and everything above it is
//! host-agnostic so the whole engine can be driven hermetically.

pub mod api;
pub mod arena;
pub mod cache;
pub mod config;
pub mod errors;
pub mod fixups;
pub mod helpers;
pub mod init;
pub mod interpose;
pub mod launch;
pub mod loader;
pub mod mach;
pub mod notifier;
pub mod path;
pub mod prebuilt_set;
pub mod ptrauth;
pub mod reaper;
pub mod resolve;
pub mod state;
pub mod syscall;
pub mod tlv;

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        pub mod host;
    }
}
