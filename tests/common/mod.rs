//! Shared fixtures for the loader integration tests: an in-memory
//! filesystem behind the syscall shim, a mock libSystem helper table,
//! and a builder that emits small but structurally valid Mach-O images
//! (opcode-based fixups, export tries, interpose sections).

// not every test file uses every fixture
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use dyld_runtime::helpers::{LibSystemHelpers, TlvTermFunc};
use dyld_runtime::syscall::{
    OpenFlags, Prot, Stat, SyscallError, SyscallResult, SyscallShim,
};

// ---- in-memory filesystem ----

#[derive(Clone)]
struct FileEntry {
    bytes: Arc<Vec<u8>>,
    stat: Stat,
}

struct OpenFile {
    path: String,
    write_buf: Option<Vec<u8>>,
}

pub struct MockFs {
    files: Mutex<HashMap<String, FileEntry>>,
    fds: Mutex<HashMap<i32, OpenFile>>,
    xattrs: Mutex<HashMap<(String, String), Vec<u8>>>,
    next_fd: AtomicI32,
    next_inode: AtomicU64,
    pub kdebug_events: Mutex<Vec<(u32, String)>>,
}

impl MockFs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            files: Mutex::new(HashMap::new()),
            fds: Mutex::new(HashMap::new()),
            xattrs: Mutex::new(HashMap::new()),
            next_fd: AtomicI32::new(3),
            next_inode: AtomicU64::new(100),
            kdebug_events: Mutex::new(Vec::new()),
        })
    }

    pub fn add_file(&self, path: &str, bytes: Vec<u8>) {
        let inode = self.next_inode.fetch_add(1, Ordering::Relaxed);
        let stat = Stat {
            device: 1,
            inode,
            mtime: 1_700_000_000 + inode,
            mode: 0o100644,
            size: bytes.len() as u64,
        };
        self.files.lock().unwrap().insert(
            path.to_owned(),
            FileEntry {
                bytes: Arc::new(bytes),
                stat,
            },
        );
    }

    /// Re-creates the file with a fresh inode/mtime, as an installer
    /// replacing a library would.
    pub fn touch(&self, path: &str) {
        let existing = self.files.lock().unwrap().get(path).cloned();
        if let Some(entry) = existing {
            self.add_file(path, entry.bytes.as_ref().clone());
        }
    }

    pub fn file_bytes(&self, path: &str) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.bytes.as_ref().clone())
    }

    pub fn has_file(&self, path: &str) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }
}

impl SyscallShim for MockFs {
    fn open(&self, path: &str, flags: OpenFlags, _mode: u32) -> SyscallResult<i32> {
        let writing = flags.contains(OpenFlags::WRITE);
        if !writing && !self.files.lock().unwrap().contains_key(path) {
            return Err(SyscallError::NoEnt);
        }
        if writing && flags.contains(OpenFlags::CREATE) {
            self.add_file(path, Vec::new());
        }
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.fds.lock().unwrap().insert(
            fd,
            OpenFile {
                path: path.to_owned(),
                write_buf: writing.then(Vec::new),
            },
        );
        Ok(fd)
    }

    fn close(&self, fd: i32) {
        let entry = self.fds.lock().unwrap().remove(&fd);
        if let Some(open) = entry {
            if let Some(buf) = open.write_buf {
                if !buf.is_empty() {
                    self.add_file(&open.path, buf);
                }
            }
        }
    }

    fn pread(&self, fd: i32, buf: &mut [u8], offset: u64) -> SyscallResult<usize> {
        let path = {
            let fds = self.fds.lock().unwrap();
            fds.get(&fd).ok_or(SyscallError::Errno(9))?.path.clone()
        };
        let files = self.files.lock().unwrap();
        let entry = files.get(&path).ok_or(SyscallError::NoEnt)?;
        let start = (offset as usize).min(entry.bytes.len());
        let n = buf.len().min(entry.bytes.len() - start);
        buf[..n].copy_from_slice(&entry.bytes[start..start + n]);
        Ok(n)
    }

    fn write(&self, fd: i32, buf: &[u8]) -> SyscallResult<usize> {
        let mut fds = self.fds.lock().unwrap();
        let open = fds.get_mut(&fd).ok_or(SyscallError::Errno(9))?;
        match &mut open.write_buf {
            Some(out) => {
                out.extend_from_slice(buf);
                Ok(buf.len())
            }
            None => Err(SyscallError::Perm),
        }
    }

    fn stat(&self, path: &str) -> SyscallResult<Stat> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|e| e.stat)
            .ok_or(SyscallError::NoEnt)
    }

    fn fstat(&self, fd: i32) -> SyscallResult<Stat> {
        let path = {
            let fds = self.fds.lock().unwrap();
            fds.get(&fd).ok_or(SyscallError::Errno(9))?.path.clone()
        };
        self.stat(&path)
    }

    fn mmap(
        &self,
        addr: usize,
        len: usize,
        _prot: Prot,
        fd: Option<i32>,
        file_offset: u64,
    ) -> SyscallResult<usize> {
        match fd {
            None => {
                let buf = vec![0u8; len].into_boxed_slice();
                Ok(Box::leak(buf).as_mut_ptr() as usize)
            }
            Some(fd) => {
                // file mappings land inside a reservation we made: copy
                // the file content into it
                if addr == 0 {
                    return Err(SyscallError::MapFailed);
                }
                let mut tmp = vec![0u8; len];
                let n = self.pread(fd, &mut tmp, file_offset)?;
                // SAFETY: addr lies inside a leaked reservation from
                // vm_allocate
                unsafe {
                    std::ptr::copy_nonoverlapping(tmp.as_ptr(), addr as *mut u8, n);
                }
                Ok(addr)
            }
        }
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
        if self.files.lock().unwrap().contains_key(path) {
            Ok(path.to_owned())
        } else {
            Err(SyscallError::NoEnt)
        }
    }

    fn rename(&self, from: &str, to: &str) -> SyscallResult<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files.remove(from).ok_or(SyscallError::NoEnt)?;
        files.insert(to.to_owned(), entry);
        Ok(())
    }

    fn unlink(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    fn kdebug_trace_dyld_image(
        &self,
        code: u32,
        path: &str,
        _uuid: &[u8; 16],
        _fsobjid: u64,
        _fsid: u64,
        _load_addr: usize,
    ) {
        self.kdebug_events
            .lock()
            .unwrap()
            .push((code, path.to_owned()));
    }

    fn get_file_attribute(&self, path: &str, name: &str) -> SyscallResult<Vec<u8>> {
        self.xattrs
            .lock()
            .unwrap()
            .get(&(path.to_owned(), name.to_owned()))
            .cloned()
            .ok_or(SyscallError::NoEnt)
    }

    fn set_file_attribute(&self, path: &str, name: &str, value: &[u8]) -> SyscallResult<()> {
        self.xattrs
            .lock()
            .unwrap()
            .insert((path.to_owned(), name.to_owned()), value.to_vec());
        Ok(())
    }
}

// ---- mock libSystem helpers ----

pub struct MockHelpers {
    next_key: AtomicU64,
    specifics: Mutex<HashMap<(std::thread::ThreadId, u64), usize>>,
    pub finalized_ranges: Mutex<Vec<(usize, usize)>>,
}

impl MockHelpers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_key: AtomicU64::new(1),
            specifics: Mutex::new(HashMap::new()),
            finalized_ranges: Mutex::new(Vec::new()),
        })
    }
}

impl LibSystemHelpers for MockHelpers {
    fn version(&self) -> u32 {
        2
    }

    fn malloc(&self, size: usize) -> usize {
        let buf = vec![0u8; size.max(1)].into_boxed_slice();
        Box::leak(buf).as_mut_ptr() as usize
    }

    fn free(&self, _ptr: usize) {}

    fn malloc_size(&self, _ptr: usize) -> usize {
        0
    }

    fn pthread_key_create_free(&self) -> Result<u64, ()> {
        Ok(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn pthread_key_create_thread_exit(&self) -> Result<u64, ()> {
        Ok(self.next_key.fetch_add(1, Ordering::Relaxed))
    }

    fn pthread_getspecific(&self, key: u64) -> usize {
        let tid = std::thread::current().id();
        *self.specifics.lock().unwrap().get(&(tid, key)).unwrap_or(&0)
    }

    fn pthread_setspecific(&self, key: u64, value: usize) -> i32 {
        let tid = std::thread::current().id();
        self.specifics.lock().unwrap().insert((tid, key), value);
        0
    }

    fn cxa_atexit(&self, _func: TlvTermFunc, _arg: usize, _dso: usize) {}

    fn cxa_finalize_ranges(&self, ranges: &[(usize, usize)]) {
        self.finalized_ranges
            .lock()
            .unwrap()
            .extend_from_slice(ranges);
    }

    fn exit(&self, code: i32) -> ! {
        std::process::exit(code)
    }

    fn getenv(&self, _key: &str) -> Option<String> {
        None
    }

    fn tlv_get_addr_func(&self) -> usize {
        // the tests drive the slow path directly; a recognizable
        // non-zero sentinel is all the descriptors need
        t_sentinel()
    }
}

fn t_sentinel() -> usize {
    static SENTINEL: u8 = 0;
    &SENTINEL as *const u8 as usize
}

// ---- synthetic Mach-O builder ----

const MH_MAGIC_64: u32 = 0xfeedfacf;
const CPU_TYPE_ARM64: u32 = 0x0100000c;
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const LC_SEGMENT_64: u32 = 0x19;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | 0x80000000;
const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | 0x80000000;
const LC_RPATH: u32 = 0x1c | 0x80000000;
const LC_UUID: u32 = 0x1b;
const LC_MAIN: u32 = 0x28 | 0x80000000;
const LC_DYLD_INFO_ONLY: u32 = 0x22 | 0x80000000;
const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | 0x80000000;

pub const SEG_TEXT_SIZE: u64 = 0x1000;
pub const SEG_DATA_SIZE: u64 = 0x1000;
pub const DATA_VM_OFFSET: u64 = 0x1000;
pub const LINKEDIT_VM_OFFSET: u64 = 0x2000;

/// Where bind slot `i` lands within the image (inside `__DATA`).
pub fn bind_slot_vm_offset(i: usize) -> u64 {
    DATA_VM_OFFSET + (i as u64) * 8
}

pub const TLV_DESCRIPTORS_VM_OFFSET: u64 = DATA_VM_OFFSET + 0xc00;
pub const TLV_CONTENT_VM_OFFSET: u64 = DATA_VM_OFFSET + 0xc18;

#[derive(Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    Normal,
    Weak,
    Upward,
}

#[derive(Clone)]
pub struct BindSpec {
    /// slot index within __DATA (8 bytes apart)
    pub slot: usize,
    /// wire encoding: 1..N dependent, 0 self, -1 main, -2 flat, -3 weak
    pub ordinal: i64,
    pub name: String,
    pub weak_import: bool,
}

#[derive(Clone)]
pub struct ExportSpec {
    pub name: String,
    /// vm offset of the "implementation" (usually in __TEXT)
    pub offset: u64,
    pub weak_def: bool,
}

pub struct ImageBuilder {
    executable: bool,
    install_name: Option<String>,
    deps: Vec<(String, DepKind)>,
    rpaths: Vec<String>,
    exports: Vec<ExportSpec>,
    binds: Vec<BindSpec>,
    /// __DATA slots holding unslid local pointers to rebase
    rebases: Vec<(usize, u64)>,
    objc: bool,
    /// (replacement vm offset, replacee bind name + ordinal)
    interpose: Vec<(u64, String, i64)>,
    tlv_template: Option<Vec<u8>>,
    uuid: [u8; 16],
}

impl ImageBuilder {
    pub fn dylib(install_name: &str) -> Self {
        Self {
            executable: false,
            install_name: Some(install_name.to_owned()),
            deps: Vec::new(),
            rpaths: Vec::new(),
            exports: Vec::new(),
            binds: Vec::new(),
            rebases: Vec::new(),
            objc: false,
            interpose: Vec::new(),
            tlv_template: None,
            uuid: *b"synthetic-image!",
        }
    }

    pub fn executable() -> Self {
        Self {
            executable: true,
            install_name: None,
            ..Self::dylib("")
        }
    }

    pub fn dep(mut self, path: &str) -> Self {
        self.deps.push((path.to_owned(), DepKind::Normal));
        self
    }

    pub fn weak_dep(mut self, path: &str) -> Self {
        self.deps.push((path.to_owned(), DepKind::Weak));
        self
    }

    pub fn upward_dep(mut self, path: &str) -> Self {
        self.deps.push((path.to_owned(), DepKind::Upward));
        self
    }

    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpaths.push(rpath.to_owned());
        self
    }

    pub fn export(mut self, name: &str, offset: u64) -> Self {
        self.exports.push(ExportSpec {
            name: name.to_owned(),
            offset,
            weak_def: false,
        });
        self
    }

    pub fn weak_export(mut self, name: &str, offset: u64) -> Self {
        self.exports.push(ExportSpec {
            name: name.to_owned(),
            offset,
            weak_def: true,
        });
        self
    }

    pub fn bind(mut self, slot: usize, ordinal: i64, name: &str) -> Self {
        self.binds.push(BindSpec {
            slot,
            ordinal,
            name: name.to_owned(),
            weak_import: false,
        });
        self
    }

    pub fn weak_import_bind(mut self, slot: usize, ordinal: i64, name: &str) -> Self {
        self.binds.push(BindSpec {
            slot,
            ordinal,
            name: name.to_owned(),
            weak_import: true,
        });
        self
    }

    pub fn rebase(mut self, slot: usize, unslid_target: u64) -> Self {
        self.rebases.push((slot, unslid_target));
        self
    }

    pub fn objc(mut self) -> Self {
        self.objc = true;
        self
    }

    /// Adds an interpose tuple: replacement is a local function at
    /// `replacement_offset`, replacee an import named `replacee`.
    pub fn interpose(mut self, replacement_offset: u64, replacee: &str, ordinal: i64) -> Self {
        self.interpose
            .push((replacement_offset, replacee.to_owned(), ordinal));
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> Self {
        self.uuid = uuid;
        self
    }

    /// Declares one thread-local variable whose initial content is
    /// `template`.
    pub fn tlv(mut self, template: &[u8]) -> Self {
        self.tlv_template = Some(template.to_vec());
        self
    }

    pub fn build(&self) -> Vec<u8> {
        // interpose tuples occupy __DATA slots after a fixed offset;
        // replacement slots are rebases, replacee slots binds
        const INTERPOSE_FIRST_SLOT: usize = 64;
        let mut rebases = self.rebases.clone();
        let mut binds = self.binds.clone();
        for (i, (replacement_offset, replacee, ordinal)) in self.interpose.iter().enumerate() {
            let slot = INTERPOSE_FIRST_SLOT + i * 2;
            rebases.push((slot, *replacement_offset));
            binds.push(BindSpec {
                slot: slot + 1,
                ordinal: *ordinal,
                name: replacee.clone(),
                weak_import: false,
            });
        }

        let trie = build_export_trie(&self.exports);
        let (rebase_stream, bind_stream) = build_opcode_streams(&rebases, &binds);

        // __LINKEDIT layout
        let rebase_off = 0usize;
        let bind_off = rebase_off + rebase_stream.len();
        let trie_off = bind_off + bind_stream.len();
        let linkedit_len = trie_off + trie.len();

        // load commands
        let mut cmds: Vec<Vec<u8>> = Vec::new();

        let mut data_sections: Vec<(String, u64, u64, u32)> = Vec::new();
        // name, vm offset (absolute), size, flags
        if self.objc {
            data_sections.push(("__objc_imageinfo".into(), DATA_VM_OFFSET + 0xe00, 8, 0));
            data_sections.push(("__objc_classlist".into(), DATA_VM_OFFSET + 0xe08, 8, 0));
        }
        if !self.interpose.is_empty() {
            data_sections.push((
                "__interpose".into(),
                bind_slot_vm_offset(INTERPOSE_FIRST_SLOT),
                (self.interpose.len() * 16) as u64,
                0,
            ));
        }
        if let Some(template) = &self.tlv_template {
            const S_THREAD_LOCAL_REGULAR: u32 = 0x11;
            const S_THREAD_LOCAL_VARIABLES: u32 = 0x13;
            data_sections.push((
                "__thread_vars".into(),
                TLV_DESCRIPTORS_VM_OFFSET,
                24,
                S_THREAD_LOCAL_VARIABLES,
            ));
            data_sections.push((
                "__thread_data".into(),
                TLV_CONTENT_VM_OFFSET,
                template.len() as u64,
                S_THREAD_LOCAL_REGULAR,
            ));
        }

        cmds.push(segment_command(
            "__TEXT",
            0,
            SEG_TEXT_SIZE,
            0,
            SEG_TEXT_SIZE,
            0x5,
            &[],
        ));
        cmds.push(segment_command(
            "__DATA",
            DATA_VM_OFFSET,
            SEG_DATA_SIZE,
            DATA_VM_OFFSET,
            SEG_DATA_SIZE,
            0x3,
            &data_sections,
        ));
        cmds.push(segment_command(
            "__LINKEDIT",
            LINKEDIT_VM_OFFSET,
            linkedit_len.next_multiple_of(0x1000) as u64,
            LINKEDIT_VM_OFFSET,
            linkedit_len as u64,
            0x1,
            &[],
        ));

        if let Some(name) = &self.install_name {
            if !name.is_empty() {
                cmds.push(dylib_command(LC_ID_DYLIB, name));
            }
        }
        for (path, kind) in &self.deps {
            let cmd = match kind {
                DepKind::Normal => LC_LOAD_DYLIB,
                DepKind::Weak => LC_LOAD_WEAK_DYLIB,
                DepKind::Upward => LC_LOAD_UPWARD_DYLIB,
            };
            cmds.push(dylib_command(cmd, path));
        }
        for rpath in &self.rpaths {
            cmds.push(rpath_command(rpath));
        }
        cmds.push(uuid_command(&self.uuid));
        if self.executable {
            cmds.push(main_command(0x800));
        }

        let le_base = LINKEDIT_VM_OFFSET as u32;
        cmds.push(dyld_info_command(
            le_base + rebase_off as u32,
            rebase_stream.len() as u32,
            le_base + bind_off as u32,
            bind_stream.len() as u32,
        ));
        if !trie.is_empty() {
            cmds.push(linkedit_data_command(
                LC_DYLD_EXPORTS_TRIE,
                le_base + trie_off as u32,
                trie.len() as u32,
            ));
        }

        let size_commands: usize = cmds.iter().map(Vec::len).sum();
        assert!(32 + size_commands < 0x800, "load commands overflow __TEXT");

        let total_len = LINKEDIT_VM_OFFSET as usize + linkedit_len;
        let mut image = vec![0u8; total_len];

        // mach header
        put_u32(&mut image, 0, MH_MAGIC_64);
        put_u32(&mut image, 4, CPU_TYPE_ARM64);
        put_u32(&mut image, 8, 0); // cpusubtype
        put_u32(
            &mut image,
            12,
            if self.executable { MH_EXECUTE } else { MH_DYLIB },
        );
        put_u32(&mut image, 16, cmds.len() as u32);
        put_u32(&mut image, 20, size_commands as u32);
        put_u32(&mut image, 24, 0); // flags

        let mut off = 32;
        for cmd in &cmds {
            image[off..off + cmd.len()].copy_from_slice(cmd);
            off += cmd.len();
        }

        // pre-seed rebase slots with their unslid values, as the static
        // linker would have
        for (slot, unslid) in &rebases {
            let off = bind_slot_vm_offset(*slot) as usize;
            image[off..off + 8].copy_from_slice(&unslid.to_le_bytes());
        }

        if let Some(template) = &self.tlv_template {
            let off = TLV_CONTENT_VM_OFFSET as usize;
            image[off..off + template.len()].copy_from_slice(template);
        }

        // linkedit payload
        let le = LINKEDIT_VM_OFFSET as usize;
        image[le + rebase_off..le + rebase_off + rebase_stream.len()]
            .copy_from_slice(&rebase_stream);
        image[le + bind_off..le + bind_off + bind_stream.len()].copy_from_slice(&bind_stream);
        image[le + trie_off..le + trie_off + trie.len()].copy_from_slice(&trie);

        image
    }
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut Vec<u8>, v: u64) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn pad_to(cmd: &mut Vec<u8>, multiple: usize) {
    while cmd.len() % multiple != 0 {
        cmd.push(0);
    }
}

fn segment_command(
    name: &str,
    vm_addr: u64,
    vm_size: u64,
    file_off: u64,
    file_size: u64,
    prot: u32,
    sections: &[(String, u64, u64, u32)],
) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&LC_SEGMENT_64.to_le_bytes());
    cmd.extend_from_slice(&0u32.to_le_bytes()); // size patched below
    let mut seg_name = [0u8; 16];
    seg_name[..name.len()].copy_from_slice(name.as_bytes());
    cmd.extend_from_slice(&seg_name);
    put_u64(&mut cmd, vm_addr);
    put_u64(&mut cmd, vm_size);
    put_u64(&mut cmd, file_off);
    put_u64(&mut cmd, file_size);
    cmd.extend_from_slice(&(prot as i32).to_le_bytes()); // maxprot
    cmd.extend_from_slice(&(prot as i32).to_le_bytes()); // initprot
    cmd.extend_from_slice(&(sections.len() as u32).to_le_bytes());
    cmd.extend_from_slice(&0u32.to_le_bytes()); // flags
    for (sect_name, vm_off, size, flags) in sections {
        let mut sn = [0u8; 16];
        sn[..sect_name.len()].copy_from_slice(sect_name.as_bytes());
        cmd.extend_from_slice(&sn);
        cmd.extend_from_slice(&seg_name);
        put_u64(&mut cmd, *vm_off); // addr (preferred base is 0)
        put_u64(&mut cmd, *size);
        cmd.extend_from_slice(&(*vm_off as u32).to_le_bytes()); // file offset
        cmd.extend_from_slice(&3u32.to_le_bytes()); // align
        cmd.extend_from_slice(&0u32.to_le_bytes()); // reloff
        cmd.extend_from_slice(&0u32.to_le_bytes()); // nreloc
        cmd.extend_from_slice(&flags.to_le_bytes());
        cmd.extend_from_slice(&[0u8; 12]); // reserved
    }
    let len = cmd.len() as u32;
    cmd[4..8].copy_from_slice(&len.to_le_bytes());
    cmd
}

fn dylib_command(cmd_kind: u32, path: &str) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&cmd_kind.to_le_bytes());
    cmd.extend_from_slice(&0u32.to_le_bytes());
    cmd.extend_from_slice(&24u32.to_le_bytes()); // name offset
    cmd.extend_from_slice(&0u32.to_le_bytes()); // timestamp
    cmd.extend_from_slice(&0x1_0000u32.to_le_bytes()); // current version
    cmd.extend_from_slice(&0x1_0000u32.to_le_bytes()); // compat version
    cmd.extend_from_slice(path.as_bytes());
    cmd.push(0);
    pad_to(&mut cmd, 8);
    let len = cmd.len() as u32;
    cmd[4..8].copy_from_slice(&len.to_le_bytes());
    cmd
}

fn rpath_command(rpath: &str) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&LC_RPATH.to_le_bytes());
    cmd.extend_from_slice(&0u32.to_le_bytes());
    cmd.extend_from_slice(&12u32.to_le_bytes()); // path offset
    cmd.extend_from_slice(rpath.as_bytes());
    cmd.push(0);
    pad_to(&mut cmd, 8);
    let len = cmd.len() as u32;
    cmd[4..8].copy_from_slice(&len.to_le_bytes());
    cmd
}

fn uuid_command(uuid: &[u8; 16]) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&LC_UUID.to_le_bytes());
    cmd.extend_from_slice(&24u32.to_le_bytes());
    cmd.extend_from_slice(uuid);
    cmd
}

fn main_command(entry_off: u64) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&LC_MAIN.to_le_bytes());
    cmd.extend_from_slice(&24u32.to_le_bytes());
    put_u64(&mut cmd, entry_off);
    put_u64(&mut cmd, 0);
    cmd
}

fn dyld_info_command(
    rebase_off: u32,
    rebase_size: u32,
    bind_off: u32,
    bind_size: u32,
) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&LC_DYLD_INFO_ONLY.to_le_bytes());
    cmd.extend_from_slice(&48u32.to_le_bytes());
    for v in [
        rebase_off,
        rebase_size,
        bind_off,
        bind_size,
        0, // weak bind
        0,
        0, // lazy bind
        0,
        0, // export (the trie goes through LC_DYLD_EXPORTS_TRIE)
        0,
    ] {
        cmd.extend_from_slice(&v.to_le_bytes());
    }
    cmd
}

fn linkedit_data_command(kind: u32, data_off: u32, data_size: u32) -> Vec<u8> {
    let mut cmd = Vec::new();
    cmd.extend_from_slice(&kind.to_le_bytes());
    cmd.extend_from_slice(&16u32.to_le_bytes());
    cmd.extend_from_slice(&data_off.to_le_bytes());
    cmd.extend_from_slice(&data_size.to_le_bytes());
    cmd
}

fn uleb(mut v: u64, out: &mut Vec<u8>) {
    loop {
        let mut byte = (v & 0x7f) as u8;
        v >>= 7;
        if v != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if v == 0 {
            break;
        }
    }
}

/// Fixed three-byte ULEB, legal padding for forward references.
fn uleb3(v: u64, out: &mut Vec<u8>) {
    assert!(v < (1 << 21));
    out.push(((v & 0x7f) as u8) | 0x80);
    out.push((((v >> 7) & 0x7f) as u8) | 0x80);
    out.push(((v >> 14) & 0x7f) as u8);
}

/// Flat trie: a single root fanning out one full-name edge per export.
fn build_export_trie(exports: &[ExportSpec]) -> Vec<u8> {
    if exports.is_empty() {
        return Vec::new();
    }
    const WEAK_DEF_FLAG: u64 = 0x04;

    let mut trie = Vec::new();
    trie.push(0u8); // root terminal size
    trie.push(exports.len() as u8);
    let mut fixups = Vec::new();
    for export in exports {
        trie.extend_from_slice(export.name.as_bytes());
        trie.push(0);
        fixups.push(trie.len());
        uleb3(0, &mut trie); // child offset patched below
    }
    for (export, fixup) in exports.iter().zip(fixups) {
        let node_off = trie.len() as u64;
        let mut patched = Vec::new();
        uleb3(node_off, &mut patched);
        trie[fixup..fixup + 3].copy_from_slice(&patched);

        let mut payload = Vec::new();
        uleb(if export.weak_def { WEAK_DEF_FLAG } else { 0 }, &mut payload);
        uleb(export.offset, &mut payload);
        uleb(payload.len() as u64, &mut trie);
        trie.extend_from_slice(&payload);
        trie.push(0); // no children
    }
    trie
}

fn build_opcode_streams(rebases: &[(usize, u64)], binds: &[BindSpec]) -> (Vec<u8>, Vec<u8>) {
    const REBASE_SET_TYPE_IMM: u8 = 0x10;
    const REBASE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
    const REBASE_DO_REBASE_IMM_TIMES: u8 = 0x50;
    const BIND_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
    const BIND_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
    const BIND_SET_SYMBOL: u8 = 0x40;
    const BIND_SET_TYPE_IMM: u8 = 0x50;
    const BIND_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
    const BIND_DO_BIND: u8 = 0x90;
    const SEG_DATA_INDEX: u8 = 1;

    let mut rebase_stream = Vec::new();
    if !rebases.is_empty() {
        rebase_stream.push(REBASE_SET_TYPE_IMM | 1);
        for (slot, _) in rebases {
            rebase_stream.push(REBASE_SET_SEGMENT_AND_OFFSET_ULEB | SEG_DATA_INDEX);
            uleb((*slot as u64) * 8, &mut rebase_stream);
            rebase_stream.push(REBASE_DO_REBASE_IMM_TIMES | 1);
        }
        rebase_stream.push(0); // DONE
    }

    let mut bind_stream = Vec::new();
    if !binds.is_empty() {
        for bind in binds {
            if bind.ordinal >= 0 {
                bind_stream.push(BIND_SET_DYLIB_ORDINAL_IMM | (bind.ordinal as u8 & 0xf));
            } else {
                bind_stream.push(BIND_SET_DYLIB_SPECIAL_IMM | ((bind.ordinal as u8) & 0xf));
            }
            let flags = if bind.weak_import { 1u8 } else { 0 };
            bind_stream.push(BIND_SET_SYMBOL | flags);
            bind_stream.extend_from_slice(bind.name.as_bytes());
            bind_stream.push(0);
            bind_stream.push(BIND_SET_TYPE_IMM | 1);
            bind_stream.push(BIND_SET_SEGMENT_AND_OFFSET_ULEB | SEG_DATA_INDEX);
            uleb((bind.slot as u64) * 8, &mut bind_stream);
            bind_stream.push(BIND_DO_BIND);
        }
        bind_stream.push(0); // DONE
    }

    (rebase_stream, bind_stream)
}

// ---- process bootstrap helpers ----

/// Maps an image the way the kernel maps the main executable: reserve the
/// vm space and copy each segment in.
pub fn kernel_map(shim: &dyn SyscallShim, bytes: &[u8]) -> usize {
    let total = bytes.len().next_multiple_of(0x1000);
    let base = shim.vm_allocate(total).expect("reservation");
    // the builder's images are position-zero based with vm == file layout
    // SAFETY: base points at a fresh writable reservation of `total`
    unsafe {
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), base as *mut u8, bytes.len());
    }
    base
}

/// Reads the pointer-sized value at `base + vm_offset` of a mapped image.
pub fn read_slot(base: usize, vm_offset: u64) -> u64 {
    // SAFETY: test images stay mapped for the process lifetime
    unsafe { ((base + vm_offset as usize) as *const u64).read_unaligned() }
}
