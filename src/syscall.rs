//! The injected capability bundle the loader uses to touch the kernel.
//!
//! Nothing in this crate calls the OS directly; every open/mmap/stat goes
//! through a [`SyscallShim`] handed in at bootstrap. The real unix-backed
//! implementation lives in [`crate::host`]; tests inject an in-memory one.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum SyscallError {
    #[error("no such file or directory")]
    NoEnt,
    #[error("operation not permitted")]
    Perm,
    #[error("mmap failed")]
    MapFailed,
    #[error("kern_return {0}")]
    Kern(i32),
    #[error("errno {0}")]
    Errno(i32),
}

impl SyscallError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            2 => Self::NoEnt,  // ENOENT
            1 => Self::Perm,   // EPERM
            13 => Self::Perm,  // EACCES
            other => Self::Errno(other),
        }
    }
}

pub type SyscallResult<T> = Result<T, SyscallError>;

/// Subset of `struct stat` the loader consults.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stat {
    pub device: u64,
    pub inode: u64,
    pub mtime: u64,
    pub mode: u32,
    pub size: u64,
}

impl Stat {
    const S_IFMT: u32 = 0o170000;
    const S_IFREG: u32 = 0o100000;

    pub fn is_regular_file(&self) -> bool {
        (self.mode & Self::S_IFMT) == Self::S_IFREG
    }
}

/// Identity of a file on disk, used to detect that a library changed
/// between launches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileId {
    pub inode: u64,
    pub mtime: u64,
}

impl FileId {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.inode != 0 || self.mtime != 0
    }
}

impl From<&Stat> for FileId {
    fn from(st: &Stat) -> Self {
        Self {
            inode: st.inode,
            mtime: st.mtime,
        }
    }
}

bitflags::bitflags! {
    /// VM protection bits for mmap/mprotect requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u8 {
        const READ = 1;
        const WRITE = 2;
        const EXEC = 4;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 0;
        const WRITE = 1;
        const CREATE = 0o100;
        const TRUNCATE = 0o1000;
    }
}

/// Location of the code-signature blob within a linked image file.
#[derive(Debug, Clone, Copy, Default)]
pub struct CodeSignatureInFile {
    pub file_offset: u32,
    pub size: u32,
}

/// Capability bundle injected by the host.
///
/// Addresses are plain `usize` so the trait stays implementable by an
/// in-memory fixture; only the fixup writers reinterpret them as pointers.
pub trait SyscallShim: Sync + Send {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> SyscallResult<i32>;
    fn close(&self, fd: i32);
    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> SyscallResult<usize>;
    fn write(&self, fd: i32, buf: &[u8]) -> SyscallResult<usize>;
    fn stat(&self, path: &str) -> SyscallResult<Stat>;
    fn fstat(&self, fd: i32) -> SyscallResult<Stat>;

    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: Prot,
        fd: Option<i32>,
        file_offset: u64,
    ) -> SyscallResult<usize>;
    fn munmap(&self, addr: usize, len: usize);
    fn mprotect(&self, addr: usize, len: usize, prot: Prot) -> SyscallResult<()>;

    /// Reserve `len` bytes of address space with no backing permissions.
    fn vm_allocate(&self, len: usize) -> SyscallResult<usize>;
    fn vm_deallocate(&self, addr: usize, len: usize);

    fn realpath(&self, path: &str) -> SyscallResult<String>;
    fn rename(&self, from: &str, to: &str) -> SyscallResult<()>;
    fn unlink(&self, path: &str);

    /// Register the code-signature blob with the kernel
    /// (`F_ADDFILESIGS_RETURN` then `F_CHECK_LV`). On refusal the error
    /// string is whatever message the kernel supplied.
    fn check_code_signature(
        &self,
        fd: i32,
        path: &str,
        sig: &CodeSignatureInFile,
    ) -> Result<(), String> {
        let _ = (fd, path, sig);
        Ok(())
    }

    /// `F_NOCACHE`, advisory.
    fn fcntl_nocache(&self, _fd: i32) {}

    /// Decrypt-map a fair-play region in place (`mremap_encrypted`).
    fn mremap_encrypted(&self, _addr: usize, _len: usize) -> SyscallResult<()> {
        Ok(())
    }

    fn kdebug_trace_dyld_image(
        &self,
        _code: u32,
        _path: &str,
        _uuid: &[u8; 16],
        _fsobjid: u64,
        _fsid: u64,
        _load_addr: usize,
    ) {
    }

    /// Extended attribute used for the PrebuiltLoaderSet boot token.
    fn get_file_attribute(&self, path: &str, name: &str) -> SyscallResult<Vec<u8>>;
    fn set_file_attribute(&self, path: &str, name: &str, value: &[u8]) -> SyscallResult<()>;

    /// Hand a DOF blob to dtrace; returns a registration id for later
    /// unregistration.
    fn dtrace_register_user_probes(&self, _blob: &[u8]) -> Option<i32> {
        None
    }
    fn dtrace_unregister_user_probe(&self, _registration_id: i32) {}

    fn page_size(&self) -> usize {
        0x1000
    }
}

#[cfg(test)]
pub(crate) mod test_shim {
    use super::*;

    /// Minimal shim for unit tests: anonymous mappings come from leaked
    /// heap buffers, everything file-shaped fails with ENOENT.
    pub struct AnonShim;

    impl SyscallShim for AnonShim {
        fn open(&self, _path: &str, _flags: OpenFlags, _mode: u32) -> SyscallResult<i32> {
            Err(SyscallError::NoEnt)
        }
        fn close(&self, _fd: i32) {}
        fn pread(&self, _fd: i32, _buf: &mut [u8], _offset: u64) -> SyscallResult<usize> {
            Err(SyscallError::NoEnt)
        }
        fn write(&self, _fd: i32, _buf: &[u8]) -> SyscallResult<usize> {
            Err(SyscallError::NoEnt)
        }
        fn stat(&self, _path: &str) -> SyscallResult<Stat> {
            Err(SyscallError::NoEnt)
        }
        fn fstat(&self, _fd: i32) -> SyscallResult<Stat> {
            Err(SyscallError::NoEnt)
        }
        fn mmap(
            &self,
            _addr: usize,
            len: usize,
            _prot: Prot,
            fd: Option<i32>,
            _file_offset: u64,
        ) -> SyscallResult<usize> {
            if fd.is_some() {
                return Err(SyscallError::MapFailed);
            }
            let buf = vec![0u8; len].into_boxed_slice();
            Ok(Box::leak(buf).as_mut_ptr() as usize)
        }
        fn munmap(&self, _addr: usize, _len: usize) {}
        fn mprotect(&self, _addr: usize, _len: usize, _prot: Prot) -> SyscallResult<()> {
            Ok(())
        }
        fn vm_allocate(&self, len: usize) -> SyscallResult<usize> {
            self.mmap(0, len, Prot::READ | Prot::WRITE, None, 0)
        }
        fn vm_deallocate(&self, _addr: usize, _len: usize) {}
        fn realpath(&self, path: &str) -> SyscallResult<String> {
            Ok(path.to_owned())
        }
        fn rename(&self, _from: &str, _to: &str) -> SyscallResult<()> {
            Err(SyscallError::NoEnt)
        }
        fn unlink(&self, _path: &str) {}
        fn get_file_attribute(&self, _path: &str, _name: &str) -> SyscallResult<Vec<u8>> {
            Err(SyscallError::NoEnt)
        }
        fn set_file_attribute(&self, _path: &str, _name: &str, _value: &[u8]) -> SyscallResult<()> {
            Err(SyscallError::NoEnt)
        }
    }
}
