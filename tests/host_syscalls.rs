//! Exercises the real unix syscall shim against actual files.
#![cfg(unix)]

use std::io::Write;

use dyld_runtime::syscall::{OpenFlags, Prot, SyscallShim};

#[test]
fn open_stat_pread_round_trip() {
    let shim = dyld_runtime::host::HostSyscalls;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(b"\xcf\xfa\xed\xfeloader bytes").unwrap();
    file.flush().unwrap();
    let path = file.path().to_str().unwrap().to_owned();

    let st = shim.stat(&path).expect("stat");
    assert!(st.is_regular_file());
    assert_eq!(st.size, 16);
    assert_ne!(st.inode, 0);

    let fd = shim.open(&path, OpenFlags::READ, 0).expect("open");
    let fst = shim.fstat(fd).expect("fstat");
    assert_eq!(fst.inode, st.inode);

    let mut buf = [0u8; 6];
    let n = shim.pread(fd, &mut buf, 4).expect("pread");
    assert_eq!(n, 6);
    assert_eq!(&buf, b"loader");
    shim.close(fd);

    assert!(matches!(
        shim.open("/no/such/file/anywhere", OpenFlags::READ, 0),
        Err(dyld_runtime::syscall::SyscallError::NoEnt)
    ));
}

#[test]
fn anonymous_mappings_and_protection() {
    let shim = dyld_runtime::host::HostSyscalls;
    let page = shim.page_size();
    assert!(page >= 0x1000);

    let addr = shim
        .mmap(0, page, Prot::READ | Prot::WRITE, None, 0)
        .expect("anonymous mmap");
    // SAFETY: freshly mapped read-write page
    unsafe {
        (addr as *mut u64).write(0x5ca1_ab1e);
        assert_eq!((addr as *const u64).read(), 0x5ca1_ab1e);
    }
    shim.mprotect(addr, page, Prot::READ).expect("mprotect");
    shim.munmap(addr, page);

    let reservation = shim.vm_allocate(4 * page).expect("vm_allocate");
    assert_ne!(reservation, 0);
    shim.vm_deallocate(reservation, 4 * page);
}

#[test]
fn rename_replaces_atomically() {
    let shim = dyld_runtime::host::HostSyscalls;
    let dir = tempfile::tempdir().expect("temp dir");
    let from = dir.path().join("set.tmp");
    let to = dir.path().join("set");
    std::fs::write(&from, b"serialized").unwrap();
    std::fs::write(&to, b"old").unwrap();

    shim.rename(from.to_str().unwrap(), to.to_str().unwrap())
        .expect("rename");
    assert_eq!(std::fs::read(&to).unwrap(), b"serialized");
    assert!(!from.exists());

    let real = shim.realpath(to.to_str().unwrap()).expect("realpath");
    assert!(real.ends_with("/set"));
}
