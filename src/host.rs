//! Real unix-backed [`SyscallShim`].
//!
//! Everything funnels through `libc`; macOS additionally gets the mach
//! `vm_allocate` reservation path, the code-signing fcntls, and real
//! xattr syscalls. Production processes inject this; tests inject an
//! in-memory fixture instead.

#![cfg(unix)]

use std::ffi::CString;

use crate::syscall::{
    CodeSignatureInFile, OpenFlags, Prot, Stat, SyscallError, SyscallResult, SyscallShim,
};

pub struct HostSyscalls;

fn cstring(path: &str) -> SyscallResult<CString> {
    CString::new(path).map_err(|_| SyscallError::Errno(libc::EINVAL))
}

fn errno() -> SyscallError {
    SyscallError::from_errno(std::io::Error::last_os_error().raw_os_error().unwrap_or(0))
}

fn stat_from_raw(st: &libc::stat) -> Stat {
    Stat {
        device: st.st_dev as u64,
        inode: st.st_ino,
        mtime: st.st_mtime as u64,
        mode: st.st_mode as u32,
        size: st.st_size as u64,
    }
}

fn raw_prot(prot: Prot) -> i32 {
    let mut raw = 0;
    if prot.contains(Prot::READ) {
        raw |= libc::PROT_READ;
    }
    if prot.contains(Prot::WRITE) {
        raw |= libc::PROT_WRITE;
    }
    if prot.contains(Prot::EXEC) {
        raw |= libc::PROT_EXEC;
    }
    raw
}

impl SyscallShim for HostSyscalls {
    fn open(&self, path: &str, flags: OpenFlags, mode: u32) -> SyscallResult<i32> {
        let c_path = cstring(path)?;
        let mut raw_flags = if flags.contains(OpenFlags::WRITE) {
            libc::O_WRONLY
        } else {
            libc::O_RDONLY
        };
        if flags.contains(OpenFlags::CREATE) {
            raw_flags |= libc::O_CREAT;
        }
        if flags.contains(OpenFlags::TRUNCATE) {
            raw_flags |= libc::O_TRUNC;
        }
        // SAFETY: syscall
        let fd = unsafe { libc::open(c_path.as_ptr(), raw_flags, mode as libc::c_uint) };
        if fd < 0 { Err(errno()) } else { Ok(fd) }
    }

    fn close(&self, fd: i32) {
        // SAFETY: syscall
        unsafe { libc::close(fd) };
    }

    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        // SAFETY: syscall with a buffer we own
        let n = unsafe {
            libc::pread(
                fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                offset as libc::off_t,
            )
        };
        if n < 0 { Err(errno()) } else { Ok(n as usize) }
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SyscallResult<usize> {
        // SAFETY: syscall
        let n = unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) };
        if n < 0 { Err(errno()) } else { Ok(n as usize) }
    }

    fn stat(&self, path: &str) -> SyscallResult<Stat> {
        let c_path = cstring(path)?;
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: syscall filling the stat buffer
        let rc = unsafe { libc::stat(c_path.as_ptr(), st.as_mut_ptr()) };
        if rc != 0 {
            return Err(errno());
        }
        // SAFETY: stat() succeeded
        let st = unsafe { st.assume_init() };
        Ok(stat_from_raw(&st))
    }

    fn fstat(&self, fd: i32) -> SyscallResult<Stat> {
        let mut st = std::mem::MaybeUninit::<libc::stat>::uninit();
        // SAFETY: syscall filling the stat buffer
        let rc = unsafe { libc::fstat(fd, st.as_mut_ptr()) };
        if rc != 0 {
            return Err(errno());
        }
        // SAFETY: fstat() succeeded
        let st = unsafe { st.assume_init() };
        Ok(stat_from_raw(&st))
    }

    fn mmap(
        &self,
        addr: usize,
        len: usize,
        prot: Prot,
        fd: Option<i32>,
        file_offset: u64,
    ) -> SyscallResult<usize> {
        let (raw_fd, flags) = match fd {
            Some(fd) => (fd, libc::MAP_PRIVATE | libc::MAP_FIXED),
            None => (-1, libc::MAP_PRIVATE | libc::MAP_ANON),
        };
        let flags = if addr == 0 && fd.is_some() {
            libc::MAP_PRIVATE
        } else {
            flags
        };
        // SAFETY: syscall; MAP_FIXED targets lie inside a reservation we
        // made with vm_allocate
        let result = unsafe {
            libc::mmap(
                addr as *mut libc::c_void,
                len,
                raw_prot(prot),
                flags,
                raw_fd,
                file_offset as libc::off_t,
            )
        };
        if result == libc::MAP_FAILED {
            Err(SyscallError::MapFailed)
        } else {
            Ok(result as usize)
        }
    }

    fn munmap(&self, addr: usize, len: usize) {
        // SAFETY: syscall over a mapping this shim created
        unsafe { libc::munmap(addr as *mut libc::c_void, len) };
    }

    fn mprotect(&self, addr: usize, len: usize, prot: Prot) -> SyscallResult<()> {
        // SAFETY: syscall
        let rc = unsafe { libc::mprotect(addr as *mut libc::c_void, len, raw_prot(prot)) };
        if rc != 0 { Err(errno()) } else { Ok(()) }
    }

    fn vm_allocate(&self, len: usize) -> SyscallResult<usize> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                let mut addr: mach2::vm_types::mach_vm_address_t = 0;
                // SAFETY: mach trap reserving address space in this task
                let kr = unsafe {
                    mach2::vm::mach_vm_allocate(
                        mach2::traps::mach_task_self(),
                        &mut addr,
                        len as u64,
                        mach2::vm_statistics::VM_FLAGS_ANYWHERE,
                    )
                };
                if kr != mach2::kern_return::KERN_SUCCESS {
                    return Err(SyscallError::Kern(kr));
                }
                Ok(addr as usize)
            } else {
                // elsewhere a PROT_NONE anonymous mapping is the
                // equivalent reservation
                // SAFETY: syscall
                let result = unsafe {
                    libc::mmap(
                        std::ptr::null_mut(),
                        len,
                        libc::PROT_NONE,
                        libc::MAP_PRIVATE | libc::MAP_ANON,
                        -1,
                        0,
                    )
                };
                if result == libc::MAP_FAILED {
                    Err(SyscallError::MapFailed)
                } else {
                    Ok(result as usize)
                }
            }
        }
    }

    fn vm_deallocate(&self, addr: usize, len: usize) {
        self.munmap(addr, len);
    }

    fn realpath(&self, path: &str) -> SyscallResult<String> {
        let c_path = cstring(path)?;
        let mut buf = vec![0u8; libc::PATH_MAX as usize];
        // SAFETY: syscall with a PATH_MAX buffer
        let result = unsafe { libc::realpath(c_path.as_ptr(), buf.as_mut_ptr().cast()) };
        if result.is_null() {
            return Err(errno());
        }
        let end = buf.iter().position(|&b| b == 0).unwrap_or(0);
        String::from_utf8(buf[..end].to_vec()).map_err(|_| SyscallError::Errno(libc::EINVAL))
    }

    fn rename(&self, from: &str, to: &str) -> SyscallResult<()> {
        let c_from = cstring(from)?;
        let c_to = cstring(to)?;
        // SAFETY: syscall
        let rc = unsafe { libc::rename(c_from.as_ptr(), c_to.as_ptr()) };
        if rc != 0 { Err(errno()) } else { Ok(()) }
    }

    fn unlink(&self, path: &str) {
        if let Ok(c_path) = cstring(path) {
            // SAFETY: syscall
            unsafe { libc::unlink(c_path.as_ptr()) };
        }
    }

    #[cfg(target_os = "macos")]
    fn check_code_signature(
        &self,
        fd: i32,
        path: &str,
        sig: &CodeSignatureInFile,
    ) -> Result<(), String> {
        // F_ADDFILESIGS_RETURN then F_CHECK_LV, from usr/include/sys/fcntl.h
        const F_ADDFILESIGS_RETURN: i32 = 97;
        const F_CHECK_LV: i32 = 98;

        #[repr(C)]
        struct FsignatureAdd {
            fs_file_start: i64,
            fs_blob_start: i64,
            fs_blob_size: usize,
            fs_fsignatures_size: usize,
            fs_cdhash: [u8; 20],
            fs_hash_type: i32,
        }

        let mut args = FsignatureAdd {
            fs_file_start: 0,
            fs_blob_start: i64::from(sig.file_offset),
            fs_blob_size: sig.size as usize,
            fs_fsignatures_size: 0,
            fs_cdhash: [0; 20],
            fs_hash_type: 0,
        };
        // SAFETY: syscall with a properly sized argument struct
        let rc = unsafe { libc::fcntl(fd, F_ADDFILESIGS_RETURN, &mut args) };
        if rc == -1 {
            return Err(format!(
                "F_ADDFILESIGS_RETURN failed for '{path}': {}",
                std::io::Error::last_os_error()
            ));
        }

        #[repr(C)]
        struct FchecklvSiginfo {
            lv_file_start: i64,
            lv_error_message_size: usize,
            lv_error_message: [u8; 1500],
        }
        let mut check = FchecklvSiginfo {
            lv_file_start: 0,
            lv_error_message_size: 1500,
            lv_error_message: [0; 1500],
        };
        // SAFETY: syscall with a properly sized argument struct
        let rc = unsafe { libc::fcntl(fd, F_CHECK_LV, &mut check) };
        if rc == -1 {
            let end = check
                .lv_error_message
                .iter()
                .position(|&b| b == 0)
                .unwrap_or(0);
            return Err(String::from_utf8_lossy(&check.lv_error_message[..end]).into_owned());
        }
        Ok(())
    }

    fn fcntl_nocache(&self, fd: i32) {
        #[cfg(target_os = "macos")]
        {
            // SAFETY: syscall
            unsafe { libc::fcntl(fd, libc::F_NOCACHE, 1) };
        }
        let _ = fd;
    }

    fn get_file_attribute(&self, path: &str, name: &str) -> SyscallResult<Vec<u8>> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                let c_path = cstring(path)?;
                let c_name = cstring(name)?;
                let mut buf = vec![0u8; 512];
                // SAFETY: syscall with our buffer
                let n = unsafe {
                    libc::getxattr(
                        c_path.as_ptr(),
                        c_name.as_ptr(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                        0,
                    )
                };
                if n < 0 {
                    return Err(errno());
                }
                buf.truncate(n as usize);
                Ok(buf)
            } else if #[cfg(target_os = "linux")] {
                let c_path = cstring(path)?;
                let c_name = cstring(name)?;
                let mut buf = vec![0u8; 512];
                // SAFETY: syscall with our buffer
                let n = unsafe {
                    libc::getxattr(
                        c_path.as_ptr(),
                        c_name.as_ptr(),
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                    )
                };
                if n < 0 {
                    return Err(errno());
                }
                buf.truncate(n as usize);
                Ok(buf)
            } else {
                let _ = (path, name);
                Err(SyscallError::NoEnt)
            }
        }
    }

    fn set_file_attribute(&self, path: &str, name: &str, value: &[u8]) -> SyscallResult<()> {
        cfg_if::cfg_if! {
            if #[cfg(target_os = "macos")] {
                let c_path = cstring(path)?;
                let c_name = cstring(name)?;
                // SAFETY: syscall
                let rc = unsafe {
                    libc::setxattr(
                        c_path.as_ptr(),
                        c_name.as_ptr(),
                        value.as_ptr().cast(),
                        value.len(),
                        0,
                        0,
                    )
                };
                if rc != 0 { Err(errno()) } else { Ok(()) }
            } else if #[cfg(target_os = "linux")] {
                let c_path = cstring(path)?;
                let c_name = cstring(name)?;
                // SAFETY: syscall
                let rc = unsafe {
                    libc::setxattr(
                        c_path.as_ptr(),
                        c_name.as_ptr(),
                        value.as_ptr().cast(),
                        value.len(),
                        0,
                    )
                };
                if rc != 0 { Err(errno()) } else { Ok(()) }
            } else {
                let _ = (path, name, value);
                Err(SyscallError::NoEnt)
            }
        }
    }

    fn page_size(&self) -> usize {
        // SAFETY: trivial syscall
        let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if sz <= 0 { 0x1000 } else { sz as usize }
    }
}

/// Read-only mapping of a PrebuiltLoaderSet file, for embedders that want
/// the zero-copy path instead of the shim's read-into-memory fallback.
pub fn map_loader_set_file(path: &str) -> std::io::Result<memmap2::Mmap> {
    let file = std::fs::File::open(path)?;
    // SAFETY: mapping a file we just opened read-only
    unsafe { memmap2::Mmap::map(&file) }
}
