//! Helpers for walking Mach-O images, both as file buffers and as mapped
//! memory, expanding on what `goblin` provides.
//!
//! goblin covers the file-level pieces (fat headers, nlist entries, the
//! header/section constants); the load-command walk over a *mapped* image
//! is done with raw structs because the linkedit of a mapped image is
//! addressed by vm offset, not file offset.

use goblin::mach::constants::{
    S_MOD_INIT_FUNC_POINTERS, S_MOD_TERM_FUNC_POINTERS, S_THREAD_LOCAL_REGULAR,
    S_THREAD_LOCAL_VARIABLES, S_THREAD_LOCAL_ZEROFILL, SECTION_TYPE,
    cputype::{CPU_TYPE_ARM, CPU_TYPE_ARM64, CPU_TYPE_X86, CPU_TYPE_X86_64},
};
use goblin::mach::MultiArch;
use goblin::mach::fat::{FAT_CIGAM, FAT_MAGIC, FatArch};
use goblin::mach::header::{MH_BUNDLE, MH_DYLIB, MH_EXECUTE, MH_MAGIC, MH_MAGIC_64};
use goblin::mach::load_command::{
    LC_CODE_SIGNATURE, LC_DYLD_INFO, LC_DYLD_INFO_ONLY, LC_DYSYMTAB, LC_ENCRYPTION_INFO_64,
    LC_ID_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_MAIN, LC_REEXPORT_DYLIB,
    LC_ROUTINES_64, LC_RPATH, LC_SEGMENT, LC_SEGMENT_64, LC_SYMTAB, LC_UUID,
};
use scroll::Pread;

use crate::errors::LoadError;

// Commands goblin does not yet name (usr/include/mach-o/loader.h)
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// Section type missing from goblin's list
pub const S_INIT_FUNC_OFFSETS: u32 = 0x16;

pub const CPU_SUBTYPE_ARM64E: u32 = 2;
pub const CPU_SUBTYPE_MASK: u32 = 0x00ff_ffff;

// usr/include/mach-o/loader.h
#[repr(C)]
#[derive(Clone, Copy)]
pub struct MachHeader {
    pub magic: u32,         // mach magic number identifier
    pub cpu_type: u32,      // cpu_type_t cpu specifier
    pub cpu_sub_type: u32,  // cpu_subtype_t machine specifier
    pub file_type: u32,     // type of file
    pub num_commands: u32,  // number of load commands
    pub size_commands: u32, // size of all the load commands
    pub flags: u32,
}

impl MachHeader {
    pub fn is_64(&self) -> bool {
        self.magic == MH_MAGIC_64
    }

    pub fn header_size(&self) -> usize {
        if self.is_64() { 32 } else { 28 }
    }
}

// usr/include/mach-o/loader.h
#[repr(C)]
pub struct LoadCommandBase {
    pub cmd: u32,      // type of load command
    pub cmd_size: u32, // total size of the command in bytes
}

#[repr(C)]
pub struct SegmentCommand64 {
    cmd: u32,
    cmd_size: u32,
    pub segment_name: [u8; 16],
    pub vm_addr: u64,
    pub vm_size: u64,
    pub file_off: u64,
    pub file_size: u64,
    pub max_prot: i32,
    pub init_prot: i32,
    pub num_sections: u32,
    pub flags: u32,
}

#[repr(C)]
pub struct SegmentCommand32 {
    cmd: u32,
    cmd_size: u32,
    pub segment_name: [u8; 16],
    pub vm_addr: u32,
    pub vm_size: u32,
    pub file_off: u32,
    pub file_size: u32,
    pub max_prot: i32,
    pub init_prot: i32,
    pub num_sections: u32,
    pub flags: u32,
}

#[repr(C)]
pub struct Section64 {
    pub section_name: [u8; 16],
    pub segment_name: [u8; 16],
    pub addr: u64,
    pub size: u64,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    reserved1: u32,
    reserved2: u32,
    reserved3: u32,
}

#[repr(C)]
pub struct Section32 {
    pub section_name: [u8; 16],
    pub segment_name: [u8; 16],
    pub addr: u32,
    pub size: u32,
    pub offset: u32,
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    reserved1: u32,
    reserved2: u32,
}

#[repr(C)]
pub struct Dylib {
    pub name: u32, // offset from the load command start to the pathname
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

#[repr(C)]
pub struct DylibCommand {
    cmd: u32,
    cmd_size: u32,
    pub dylib: Dylib,
}

#[repr(C)]
pub struct RpathCommand {
    cmd: u32,
    cmd_size: u32,
    pub path: u32, // offset from the load command start
}

#[repr(C)]
pub struct UuidCommand {
    cmd: u32,
    cmd_size: u32,
    pub uuid: [u8; 16],
}

#[repr(C)]
pub struct LinkeditDataCommand {
    cmd: u32,
    cmd_size: u32,
    pub data_off: u32,
    pub data_size: u32,
}

#[repr(C)]
pub struct DyldInfoCommand {
    cmd: u32,
    cmd_size: u32,
    pub rebase_off: u32,
    pub rebase_size: u32,
    pub bind_off: u32,
    pub bind_size: u32,
    pub weak_bind_off: u32,
    pub weak_bind_size: u32,
    pub lazy_bind_off: u32,
    pub lazy_bind_size: u32,
    pub export_off: u32,
    pub export_size: u32,
}

#[repr(C)]
pub struct SymtabCommand {
    cmd: u32,
    cmd_size: u32,
    pub sym_off: u32,
    pub num_syms: u32,
    pub str_off: u32,
    pub str_size: u32,
}

#[repr(C)]
pub struct DysymtabCommand {
    cmd: u32,
    cmd_size: u32,
    pub ilocalsym: u32,
    pub nlocalsym: u32,
    pub iextdefsym: u32,
    pub nextdefsym: u32,
    pub iundefsym: u32,
    pub nundefsym: u32,
    pub tocoff: u32,
    pub ntoc: u32,
    pub modtaboff: u32,
    pub nmodtab: u32,
    pub extrefsymoff: u32,
    pub nextrefsyms: u32,
    pub indirectsymoff: u32,
    pub nindirectsyms: u32,
    pub extreloff: u32,
    pub nextrel: u32,
    pub locreloff: u32,
    pub nlocrel: u32,
}

#[repr(C)]
pub struct EntryPointCommand {
    cmd: u32,
    cmd_size: u32,
    pub entry_off: u64,
    pub stack_size: u64,
}

#[repr(C)]
pub struct BuildVersionCommand {
    cmd: u32,
    cmd_size: u32,
    pub platform: u32,
    pub min_os: u32, // x.y.z encoded as nibbles xxxx.yy.zz
    pub sdk: u32,
    pub num_tools: u32,
}

#[repr(C)]
pub struct VersionMinCommand {
    cmd: u32,
    cmd_size: u32,
    pub version: u32,
    pub sdk: u32,
}

#[repr(C)]
pub struct EncryptionInfoCommand64 {
    cmd: u32,
    cmd_size: u32,
    pub crypt_off: u32,
    pub crypt_size: u32,
    pub crypt_id: u32,
    pad: u32,
}

#[repr(C)]
pub struct RoutinesCommand64 {
    cmd: u32,
    cmd_size: u32,
    pub init_address: u64,
    pub init_module: u64,
    reserved: [u64; 6],
}

/// Architecture slices the loader knows how to grade.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X86_64,
    Arm64,
    Arm64e,
    Arm,
    I386,
}

impl Arch {
    pub fn name(self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::Arm64e => "arm64e",
            Self::Arm => "arm",
            Self::I386 => "i386",
        }
    }

    pub fn is_64(self) -> bool {
        matches!(self, Self::X86_64 | Self::Arm64 | Self::Arm64e)
    }

    pub fn uses_pointer_auth(self) -> bool {
        matches!(self, Self::Arm64e)
    }

    fn matches_cputype(self, cputype: u32, cpusubtype: u32) -> bool {
        let sub = cpusubtype & CPU_SUBTYPE_MASK;
        match self {
            Self::X86_64 => cputype == CPU_TYPE_X86_64,
            Self::Arm64 => cputype == CPU_TYPE_ARM64 && sub != CPU_SUBTYPE_ARM64E,
            Self::Arm64e => cputype == CPU_TYPE_ARM64 && sub == CPU_SUBTYPE_ARM64E,
            Self::Arm => cputype == CPU_TYPE_ARM,
            Self::I386 => cputype == CPU_TYPE_X86,
        }
    }

    /// Slices this process will accept, best grade first. An arm64e
    /// process can run plain arm64 slices; the reverse never holds.
    fn accepted(self) -> &'static [Arch] {
        match self {
            Self::X86_64 => &[Self::X86_64],
            Self::Arm64 => &[Self::Arm64],
            Self::Arm64e => &[Self::Arm64e, Self::Arm64],
            Self::Arm => &[Self::Arm],
            Self::I386 => &[Self::I386],
        }
    }
}

/// Picks the best slice of a (possibly fat) file for `arch`.
///
/// Returns `(slice_offset, slice_len)`. Thin files return `(0, len)` after
/// an architecture check.
pub fn select_slice(path: &str, bytes: &[u8], arch: Arch) -> Result<(u64, u64), LoadError> {
    let malformed = |reason: &str| LoadError::MachOMalformed {
        path: path.to_owned(),
        reason: reason.to_owned(),
    };
    if bytes.len() < 8 {
        return Err(malformed("file too short"));
    }
    let raw_magic: u32 = bytes.pread_with(0, scroll::BE).map_err(|_| malformed("truncated magic"))?;
    if raw_magic == FAT_MAGIC || raw_magic == FAT_CIGAM {
        let arches = MultiArch::new(bytes)
            .and_then(|multi| multi.arches())
            .map_err(|e| malformed(&e.to_string()))?;
        for wanted in arch.accepted() {
            if let Some(slice) = arches
                .iter()
                .find(|a| wanted.matches_cputype(a.cputype, a.cpusubtype))
            {
                return Ok((u64::from(slice.offset), u64::from(slice.size)));
            }
        }
        let found = arches
            .iter()
            .map(|a| format!("0x{:x}/0x{:x}", a.cputype, a.cpusubtype))
            .collect::<Vec<_>>()
            .join(" ");
        return Err(LoadError::ArchitectureUnsupported {
            path: path.to_owned(),
            needed: arch.name(),
            found,
        });
    }

    // thin file; verify the header's cputype before accepting slice 0
    let magic: u32 = bytes.pread_with(0, scroll::LE).map_err(|_| malformed("truncated magic"))?;
    if magic != MH_MAGIC_64 && magic != MH_MAGIC {
        return Err(malformed("not a mach-o or fat file"));
    }
    let cputype: u32 = bytes.pread_with(4, scroll::LE).map_err(|_| malformed("truncated header"))?;
    let cpusubtype: u32 = bytes.pread_with(8, scroll::LE).map_err(|_| malformed("truncated header"))?;
    if !arch
        .accepted()
        .iter()
        .any(|w| w.matches_cputype(cputype, cpusubtype))
    {
        return Err(LoadError::ArchitectureUnsupported {
            path: path.to_owned(),
            needed: arch.name(),
            found: format!("0x{cputype:x}/0x{cpusubtype:x}"),
        });
    }
    Ok((0, bytes.len() as u64))
}

/// How a dependent was requested by its load command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DependentKind {
    Normal = 0,
    WeakLink = 1,
    Reexport = 2,
    Upward = 3,
}

impl DependentKind {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::WeakLink,
            2 => Self::Reexport,
            3 => Self::Upward,
            _ => Self::Normal,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DependentRequest {
    pub path: String,
    pub kind: DependentKind,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    pub vm_offset: u64, // relative to the image's preferred base
    pub vm_size: u64,
    pub file_offset: u64,
    pub file_size: u64,
    pub init_prot: i32,
    pub read_only_data: bool, // __DATA_CONST
}

impl SegmentInfo {
    pub fn writable(&self) -> bool {
        (self.init_prot & 0x2) != 0
    }

    pub fn executable(&self) -> bool {
        (self.init_prot & 0x4) != 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LinkeditRange {
    pub file_offset: u32,
    pub size: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct SectionRange {
    pub vm_offset: u64,
    pub size: u64,
    pub section_type: u32,
}

/// A parsed view of one Mach-O image.
///
/// `mapped` selects how content is addressed: a mapped image reads
/// sections and linkedit by vm offset, a file buffer by file offset.
pub struct MachImage<'a> {
    bytes: &'a [u8],
    mapped: bool,
    header: MachHeader,
}

pub struct LoadCommandsIter<'a> {
    buffer: &'a [u8],
    count: u32,
}

impl<'a> Iterator for LoadCommandsIter<'a> {
    // (cmd, raw command bytes)
    type Item = (u32, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        if self.count == 0 || self.buffer.len() < std::mem::size_of::<LoadCommandBase>() {
            return None;
        }
        // SAFETY: length checked above; LoadCommandBase is two u32s
        let header = unsafe { &*(self.buffer.as_ptr().cast::<LoadCommandBase>()) };
        let size = header.cmd_size as usize;
        // This would mean we've been lied to by the MachHeader and either
        // the size_commands field was too small, or num_commands too large
        if size < std::mem::size_of::<LoadCommandBase>() || size > self.buffer.len() {
            return None;
        }
        let raw = &self.buffer[..size];
        self.count -= 1;
        self.buffer = &self.buffer[size..];
        Some((header.cmd, raw))
    }
}

/// View a raw command buffer as the given command struct.
///
/// SAFETY contract is length: the iterator has already verified cmd_size
/// covers the buffer, so the cast only needs the struct to fit.
fn command<T>(raw: &[u8]) -> Option<&T> {
    if raw.len() < std::mem::size_of::<T>() {
        return None;
    }
    // SAFETY: size checked, all command structs are repr(C) plain data
    Some(unsafe { &*(raw.as_ptr().cast::<T>()) })
}

fn command_string(raw: &[u8], offset: u32) -> Option<String> {
    let tail = raw.get(offset as usize..)?;
    let end = tail.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&tail[..end]).ok().map(str::to_owned)
}

fn c_name(name: &[u8; 16]) -> &str {
    let end = name.iter().position(|&b| b == 0).unwrap_or(16);
    std::str::from_utf8(&name[..end]).unwrap_or("")
}

impl<'a> MachImage<'a> {
    pub fn parse(bytes: &'a [u8], mapped: bool) -> Result<Self, LoadError> {
        let malformed = |reason: &str| LoadError::MachOMalformed {
            path: String::new(),
            reason: reason.to_owned(),
        };
        if bytes.len() < 32 {
            return Err(malformed("buffer smaller than mach_header"));
        }
        // SAFETY: length checked; the header struct is plain data
        let header = unsafe { *(bytes.as_ptr().cast::<MachHeader>()) };
        if header.magic != MH_MAGIC_64 && header.magic != MH_MAGIC {
            return Err(malformed("bad mach_header magic"));
        }
        let cmds_end = header.header_size() + header.size_commands as usize;
        if cmds_end > bytes.len() {
            return Err(malformed("load commands extend past buffer"));
        }
        Ok(Self {
            bytes,
            mapped,
            header,
        })
    }

    /// View an image that has already been mapped into this process.
    ///
    /// # Safety
    /// `base..base + vm_size` must be a live readable mapping for `'a`.
    pub unsafe fn from_mapped(base: usize, vm_size: usize) -> Result<MachImage<'a>, LoadError> {
        let bytes = unsafe { std::slice::from_raw_parts(base as *const u8, vm_size) };
        Self::parse(bytes, true)
    }

    pub fn header(&self) -> &MachHeader {
        &self.header
    }

    pub fn is_main_executable(&self) -> bool {
        self.header.file_type == MH_EXECUTE
    }

    pub fn is_dylib(&self) -> bool {
        self.header.file_type == MH_DYLIB
    }

    pub fn is_bundle(&self) -> bool {
        self.header.file_type == MH_BUNDLE
    }

    pub fn commands(&self) -> LoadCommandsIter<'a> {
        let start = self.header.header_size();
        let end = start + self.header.size_commands as usize;
        LoadCommandsIter {
            buffer: &self.bytes[start..end],
            count: self.header.num_commands,
        }
    }

    pub fn install_name(&self) -> Option<String> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd != LC_ID_DYLIB {
                return None;
            }
            let dc: &DylibCommand = command(raw)?;
            command_string(raw, dc.dylib.name)
        })
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.commands()
            .find_map(|(cmd, raw)| {
                if cmd != LC_UUID {
                    return None;
                }
                command::<UuidCommand>(raw).map(|u| u.uuid)
            })
            .unwrap_or_default()
    }

    pub fn dependents(&self) -> Vec<DependentRequest> {
        let mut deps = Vec::new();
        for (cmd, raw) in self.commands() {
            let kind = match cmd {
                LC_LOAD_DYLIB => DependentKind::Normal,
                LC_LOAD_WEAK_DYLIB => DependentKind::WeakLink,
                LC_REEXPORT_DYLIB => DependentKind::Reexport,
                LC_LOAD_UPWARD_DYLIB => DependentKind::Upward,
                _ => continue,
            };
            if let Some(dc) = command::<DylibCommand>(raw) {
                if let Some(path) = command_string(raw, dc.dylib.name) {
                    deps.push(DependentRequest { path, kind });
                }
            }
        }
        deps
    }

    pub fn rpaths(&self) -> Vec<String> {
        let mut rpaths = Vec::new();
        for (cmd, raw) in self.commands() {
            if cmd != LC_RPATH {
                continue;
            }
            if let Some(rc) = command::<RpathCommand>(raw) {
                if let Some(path) = command_string(raw, rc.path) {
                    rpaths.push(path);
                }
            }
        }
        rpaths
    }

    /// Segment table in load-command order. `vm_offset` is relative to
    /// the first segment's vm address, so the text segment is at 0.
    pub fn segments(&self) -> Vec<SegmentInfo> {
        let mut segs: Vec<SegmentInfo> = Vec::new();
        let mut preferred_base: Option<u64> = None;
        for (cmd, raw) in self.commands() {
            let (name, vm_addr, vm_size, file_off, file_size, init_prot) = if cmd == LC_SEGMENT_64 {
                match command::<SegmentCommand64>(raw) {
                    Some(s) => (
                        c_name(&s.segment_name).to_owned(),
                        s.vm_addr,
                        s.vm_size,
                        s.file_off,
                        s.file_size,
                        s.init_prot,
                    ),
                    None => continue,
                }
            } else if cmd == LC_SEGMENT {
                match command::<SegmentCommand32>(raw) {
                    Some(s) => (
                        c_name(&s.segment_name).to_owned(),
                        u64::from(s.vm_addr),
                        u64::from(s.vm_size),
                        u64::from(s.file_off),
                        u64::from(s.file_size),
                        s.init_prot,
                    ),
                    None => continue,
                }
            } else {
                continue;
            };
            if name == "__PAGEZERO" {
                continue;
            }
            let base = *preferred_base.get_or_insert(vm_addr);
            let read_only_data = name == "__DATA_CONST" || name == "__AUTH_CONST";
            segs.push(SegmentInfo {
                name,
                vm_offset: vm_addr - base,
                vm_size,
                file_offset: file_off,
                file_size,
                init_prot,
                read_only_data,
            });
        }
        segs
    }

    /// Per-segment `vmaddr - preferred_base` deltas in load-command order,
    /// including `__PAGEZERO`. Fixup opcodes index segments this way.
    pub fn raw_segment_vm_deltas(&self) -> Vec<i64> {
        let base = self.preferred_base() as i64;
        let mut deltas = Vec::new();
        for (cmd, raw) in self.commands() {
            if cmd == LC_SEGMENT_64 {
                if let Some(s) = command::<SegmentCommand64>(raw) {
                    deltas.push(s.vm_addr as i64 - base);
                }
            } else if cmd == LC_SEGMENT {
                if let Some(s) = command::<SegmentCommand32>(raw) {
                    deltas.push(i64::from(s.vm_addr) - base);
                }
            }
        }
        deltas
    }

    /// Unslid address of the mach header, needed to convert nlist values
    /// (unslid vm addresses) into runtime offsets.
    pub fn preferred_base(&self) -> u64 {
        for (cmd, raw) in self.commands() {
            if cmd == LC_SEGMENT_64 {
                if let Some(s) = command::<SegmentCommand64>(raw) {
                    if c_name(&s.segment_name) != "__PAGEZERO" {
                        return s.vm_addr;
                    }
                }
            } else if cmd == LC_SEGMENT {
                if let Some(s) = command::<SegmentCommand32>(raw) {
                    if c_name(&s.segment_name) != "__PAGEZERO" {
                        return u64::from(s.vm_addr);
                    }
                }
            }
        }
        0
    }

    pub fn vm_space(&self) -> u64 {
        self.segments()
            .iter()
            .map(|s| s.vm_offset + s.vm_size)
            .max()
            .unwrap_or(0)
    }

    fn linkedit_range(&self, wanted: u32) -> Option<LinkeditRange> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd != wanted {
                return None;
            }
            command::<LinkeditDataCommand>(raw).map(|lc| LinkeditRange {
                file_offset: lc.data_off,
                size: lc.data_size,
            })
        })
    }

    pub fn dyld_info(&self) -> Option<&DyldInfoCommand> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd == LC_DYLD_INFO || cmd == LC_DYLD_INFO_ONLY {
                command::<DyldInfoCommand>(raw)
            } else {
                None
            }
        })
    }

    pub fn chained_fixups(&self) -> Option<LinkeditRange> {
        self.linkedit_range(LC_DYLD_CHAINED_FIXUPS)
    }

    /// Exports trie location: `LC_DYLD_EXPORTS_TRIE` on newer images,
    /// the dyld-info export range on older ones.
    pub fn exports_trie(&self) -> Option<LinkeditRange> {
        if let Some(r) = self.linkedit_range(LC_DYLD_EXPORTS_TRIE) {
            return Some(r);
        }
        self.dyld_info().and_then(|di| {
            if di.export_size == 0 {
                None
            } else {
                Some(LinkeditRange {
                    file_offset: di.export_off,
                    size: di.export_size,
                })
            }
        })
    }

    pub fn symtab(&self) -> Option<&SymtabCommand> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd == LC_SYMTAB {
                command::<SymtabCommand>(raw)
            } else {
                None
            }
        })
    }

    pub fn dysymtab(&self) -> Option<&DysymtabCommand> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd == LC_DYSYMTAB {
                command::<DysymtabCommand>(raw)
            } else {
                None
            }
        })
    }

    pub fn code_signature(&self) -> Option<LinkeditRange> {
        self.linkedit_range(LC_CODE_SIGNATURE)
    }

    pub fn entry_offset(&self) -> Option<u64> {
        self.commands().find_map(|(cmd, raw)| {
            if cmd == LC_MAIN {
                command::<EntryPointCommand>(raw).map(|e| e.entry_off)
            } else {
                None
            }
        })
    }

    /// `(platform, min_os, sdk)` from LC_BUILD_VERSION, falling back to
    /// the old version-min commands.
    pub fn platform_version(&self) -> Option<(u32, u32, u32)> {
        for (cmd, raw) in self.commands() {
            match cmd {
                LC_BUILD_VERSION => {
                    if let Some(bv) = command::<BuildVersionCommand>(raw) {
                        return Some((bv.platform, bv.min_os, bv.sdk));
                    }
                }
                LC_VERSION_MIN_MACOSX => {
                    if let Some(vm) = command::<VersionMinCommand>(raw) {
                        return Some((crate::config::PLATFORM_MACOS, vm.version, vm.sdk));
                    }
                }
                LC_VERSION_MIN_IPHONEOS => {
                    if let Some(vm) = command::<VersionMinCommand>(raw) {
                        return Some((crate::config::PLATFORM_IOS, vm.version, vm.sdk));
                    }
                }
                _ => {}
            }
        }
        None
    }

    /// Encrypted fair-play ranges that need `mremap_encrypted` after
    /// mapping. Only present on ARM slices of store apps.
    pub fn fairplay_ranges(&self) -> Vec<(u64, u64)> {
        let mut ranges = Vec::new();
        for (cmd, raw) in self.commands() {
            if cmd != LC_ENCRYPTION_INFO_64 {
                continue;
            }
            if let Some(ec) = command::<EncryptionInfoCommand64>(raw) {
                if ec.crypt_id != 0 {
                    ranges.push((u64::from(ec.crypt_off), u64::from(ec.crypt_size)));
                }
            }
        }
        ranges
    }

    fn for_each_section(&self, mut f: impl FnMut(&str, &str, SectionRange)) {
        let mut preferred_base: Option<u64> = None;
        for (cmd, raw) in self.commands() {
            if cmd == LC_SEGMENT_64 {
                let Some(seg) = command::<SegmentCommand64>(raw) else {
                    continue;
                };
                if c_name(&seg.segment_name) != "__PAGEZERO" {
                    preferred_base.get_or_insert(seg.vm_addr);
                }
                let base = preferred_base.unwrap_or(seg.vm_addr);
                let sections = &raw[std::mem::size_of::<SegmentCommand64>()..];
                for chunk in sections.chunks_exact(std::mem::size_of::<Section64>()) {
                    // SAFETY: chunks_exact guarantees the length
                    let sect = unsafe { &*(chunk.as_ptr().cast::<Section64>()) };
                    f(
                        c_name(&sect.segment_name),
                        c_name(&sect.section_name),
                        SectionRange {
                            vm_offset: sect.addr - base,
                            size: sect.size,
                            section_type: sect.flags & SECTION_TYPE,
                        },
                    );
                }
            } else if cmd == LC_SEGMENT {
                let Some(seg) = command::<SegmentCommand32>(raw) else {
                    continue;
                };
                if c_name(&seg.segment_name) != "__PAGEZERO" {
                    preferred_base.get_or_insert(u64::from(seg.vm_addr));
                }
                let base = preferred_base.unwrap_or(u64::from(seg.vm_addr));
                let sections = &raw[std::mem::size_of::<SegmentCommand32>()..];
                for chunk in sections.chunks_exact(std::mem::size_of::<Section32>()) {
                    // SAFETY: chunks_exact guarantees the length
                    let sect = unsafe { &*(chunk.as_ptr().cast::<Section32>()) };
                    f(
                        c_name(&sect.segment_name),
                        c_name(&sect.section_name),
                        SectionRange {
                            vm_offset: u64::from(sect.addr) - base,
                            size: u64::from(sect.size),
                            section_type: sect.flags & SECTION_TYPE,
                        },
                    );
                }
            }
        }
    }

    pub fn find_section(&self, seg_name: &str, sect_name: &str) -> Option<SectionRange> {
        let mut found = None;
        self.for_each_section(|seg, sect, range| {
            if found.is_none() && seg == seg_name && sect == sect_name {
                found = Some(range);
            }
        });
        found
    }

    pub fn has_objc(&self) -> bool {
        self.find_section("__DATA", "__objc_imageinfo").is_some()
            || self.find_section("__DATA_CONST", "__objc_imageinfo").is_some()
    }

    /// Conservative: any ObjC class list may carry a +load.
    pub fn may_have_plus_load(&self) -> bool {
        self.has_objc()
            && (self.find_section("__DATA", "__objc_nlclslist").is_some()
                || self.find_section("__DATA", "__objc_classlist").is_some()
                || self.find_section("__DATA_CONST", "__objc_classlist").is_some())
    }

    /// Initializer locations as vm offsets, in section order.
    pub fn initializer_offsets(&self, slide_base: u64) -> Vec<u64> {
        let mut inits = Vec::new();
        for (cmd, raw) in self.commands() {
            if cmd == LC_ROUTINES_64 {
                if let Some(rc) = command::<RoutinesCommand64>(raw) {
                    inits.push(rc.init_address);
                }
            }
        }
        self.for_each_section(|_, _, range| match range.section_type {
            S_MOD_INIT_FUNC_POINTERS => {
                let count = range.size as usize / std::mem::size_of::<u64>();
                for i in 0..count {
                    if let Some(ptr) = self.read_u64_at_vm_offset(range.vm_offset + (i as u64) * 8) {
                        // pointers in the section are unslid vm addresses
                        inits.push(ptr.wrapping_sub(slide_base));
                    }
                }
            }
            S_INIT_FUNC_OFFSETS => {
                let count = range.size as usize / std::mem::size_of::<u32>();
                for i in 0..count {
                    if let Some(bytes) = self.vm_bytes(range.vm_offset + (i as u64) * 4, 4) {
                        if let Ok(off) = bytes.pread_with::<u32>(0, scroll::LE) {
                            inits.push(u64::from(off));
                        }
                    }
                }
            }
            _ => {}
        });
        inits
    }

    /// Static terminator locations (`__mod_term_func`), as vm offsets.
    pub fn terminator_offsets(&self, slide_base: u64) -> Vec<u64> {
        let mut terms = Vec::new();
        self.for_each_section(|_, _, range| {
            if range.section_type == S_MOD_TERM_FUNC_POINTERS {
                let count = range.size as usize / std::mem::size_of::<u64>();
                for i in 0..count {
                    if let Some(ptr) = self.read_u64_at_vm_offset(range.vm_offset + (i as u64) * 8) {
                        terms.push(ptr.wrapping_sub(slide_base));
                    }
                }
            }
        });
        terms
    }

    /// TLV layout: descriptor section plus the initial-content template
    /// range covering regular + zerofill thread-local sections.
    pub fn tlv_layout(&self) -> Option<TlvLayout> {
        let descriptors = self.find_section("__DATA", "__thread_vars")?;
        let mut content_start = u64::MAX;
        let mut content_end = 0u64;
        self.for_each_section(|_, _, range| {
            if matches!(
                range.section_type,
                S_THREAD_LOCAL_REGULAR | S_THREAD_LOCAL_ZEROFILL
            ) {
                content_start = content_start.min(range.vm_offset);
                content_end = content_end.max(range.vm_offset + range.size);
            }
        });
        if content_start > content_end {
            content_start = 0;
            content_end = 0;
        }
        Some(TlvLayout {
            descriptors,
            content_offset: content_start,
            content_size: (content_end - content_start) as u32,
        })
    }

    pub fn has_tlvs(&self) -> bool {
        let mut found = false;
        self.for_each_section(|_, _, range| {
            if range.section_type == S_THREAD_LOCAL_VARIABLES {
                found = true;
            }
        });
        found
    }

    /// DTrace DOF section, handed to the shim for probe registration.
    pub fn dof_section(&self) -> Option<SectionRange> {
        self.find_section("__DATA", "__dof")
            .or_else(|| self.find_section("__TEXT", "__dof"))
    }

    fn file_offset_to_vm_offset(&self, file_offset: u64) -> Option<u64> {
        self.segments().iter().find_map(|s| {
            if file_offset >= s.file_offset && file_offset < s.file_offset + s.file_size {
                Some(s.vm_offset + (file_offset - s.file_offset))
            } else {
                None
            }
        })
    }

    fn vm_offset_to_file_offset(&self, vm_offset: u64) -> Option<u64> {
        self.segments().iter().find_map(|s| {
            if vm_offset >= s.vm_offset && vm_offset < s.vm_offset + s.file_size {
                Some(s.file_offset + (vm_offset - s.vm_offset))
            } else {
                None
            }
        })
    }

    /// Content addressed by vm offset, valid for both view kinds.
    pub fn vm_bytes(&self, vm_offset: u64, len: usize) -> Option<&'a [u8]> {
        let start = if self.mapped {
            vm_offset
        } else {
            self.vm_offset_to_file_offset(vm_offset)?
        } as usize;
        self.bytes.get(start..start + len)
    }

    /// Content addressed by file offset (linkedit ranges).
    pub fn file_bytes(&self, file_offset: u64, len: usize) -> Option<&'a [u8]> {
        let start = if self.mapped {
            self.file_offset_to_vm_offset(file_offset)?
        } else {
            file_offset
        } as usize;
        self.bytes.get(start..start + len)
    }

    fn read_u64_at_vm_offset(&self, vm_offset: u64) -> Option<u64> {
        self.vm_bytes(vm_offset, 8)?
            .pread_with::<u64>(0, scroll::LE)
            .ok()
    }
}

/// Decoded result of an exports-trie lookup.
#[derive(Debug, Clone)]
pub struct TrieEntry {
    pub flags: u64,
    /// vm offset for regular symbols, constant for absolute ones
    pub value: u64,
    /// re-export: ordinal of the dependent holding the real definition
    pub reexport_ordinal: Option<u64>,
    /// re-export under a different name
    pub imported_name: Option<String>,
}

pub const EXPORT_SYMBOL_FLAGS_KIND_MASK: u64 = 0x03;
pub const EXPORT_SYMBOL_FLAGS_KIND_ABSOLUTE: u64 = 0x02;
pub const EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION: u64 = 0x04;
pub const EXPORT_SYMBOL_FLAGS_REEXPORT: u64 = 0x08;
pub const EXPORT_SYMBOL_FLAGS_STUB_AND_RESOLVER: u64 = 0x10;

fn read_uleb(bytes: &[u8], offset: &mut usize) -> Option<u64> {
    let mut result: u64 = 0;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*offset)?;
        *offset += 1;
        result |= u64::from(byte & 0x7f).checked_shl(shift)?;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
        if shift > 63 {
            return None;
        }
    }
}

/// Single-symbol lookup in an exports trie.
///
/// dyld walks the trie edge-by-edge for one name rather than materializing
/// every export, so this mirrors that instead of using goblin's bulk walk.
pub fn trie_lookup(trie: &[u8], symbol: &str) -> Option<TrieEntry> {
    let name = symbol.as_bytes();
    let mut node = 0usize;
    let mut matched = 0usize;
    loop {
        let mut p = node;
        let terminal_size = read_uleb(trie, &mut p)?;
        if matched == name.len() {
            if terminal_size == 0 {
                return None;
            }
            let flags = read_uleb(trie, &mut p)?;
            if flags & EXPORT_SYMBOL_FLAGS_REEXPORT != 0 {
                let ordinal = read_uleb(trie, &mut p)?;
                let tail = trie.get(p..)?;
                let end = tail.iter().position(|&b| b == 0)?;
                let imported = std::str::from_utf8(&tail[..end]).ok()?;
                return Some(TrieEntry {
                    flags,
                    value: 0,
                    reexport_ordinal: Some(ordinal),
                    imported_name: if imported.is_empty() {
                        None
                    } else {
                        Some(imported.to_owned())
                    },
                });
            }
            let value = read_uleb(trie, &mut p)?;
            // stub-and-resolver exports carry a second value (the resolver);
            // the loader binds the stub, so only the first matters here
            return Some(TrieEntry {
                flags,
                value,
                reexport_ordinal: None,
                imported_name: None,
            });
        }

        // skip terminal payload to the child count
        let mut child_p = p + terminal_size as usize;
        let child_count = *trie.get(child_p)?;
        child_p += 1;
        let mut next_node = None;
        for _ in 0..child_count {
            let edge_start = child_p;
            let edge_len = trie.get(edge_start..)?.iter().position(|&b| b == 0)?;
            let edge = &trie[edge_start..edge_start + edge_len];
            child_p = edge_start + edge_len + 1;
            let child_offset = read_uleb(trie, &mut child_p)?;
            if next_node.is_none() && name[matched..].starts_with(edge) {
                next_node = Some((child_offset as usize, matched + edge_len));
            }
        }
        let (n, m) = next_node?;
        node = n;
        matched = m;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TlvLayout {
    pub descriptors: SectionRange,
    pub content_offset: u64,
    pub content_size: u32,
}

/// Scan the symbol table for an exported symbol; the fallback when an
/// image carries no exports trie.
pub fn symtab_lookup(image: &MachImage<'_>, symbol: &str) -> Option<TrieEntry> {
    use goblin::mach::symbols::SIZEOF_NLIST_64;

    const N_EXT: u8 = 0x01;
    const N_TYPE: u8 = 0x0e;
    const N_SECT: u8 = 0x0e;
    const N_WEAK_DEF: u16 = 0x0080;

    let symtab = image.symtab()?;
    let strtab = image.file_bytes(u64::from(symtab.str_off), symtab.str_size as usize)?;
    let syms = image.file_bytes(
        u64::from(symtab.sym_off),
        symtab.num_syms as usize * SIZEOF_NLIST_64,
    )?;
    for i in 0..symtab.num_syms as usize {
        let off = i * SIZEOF_NLIST_64;
        let n_strx: u32 = syms.pread_with(off, scroll::LE).ok()?;
        let n_type: u8 = syms.pread_with(off + 4, scroll::LE).ok()?;
        let n_desc: u16 = syms.pread_with(off + 6, scroll::LE).ok()?;
        let n_value: u64 = syms.pread_with(off + 8, scroll::LE).ok()?;
        // only exported symbols defined in a section participate
        if n_type & N_EXT == 0 || (n_type & N_TYPE) != N_SECT {
            continue;
        }
        let tail = strtab.get(n_strx as usize..)?;
        let end = tail.iter().position(|&b| b == 0)?;
        if &tail[..end] == symbol.as_bytes() {
            return Some(TrieEntry {
                flags: if n_desc & N_WEAK_DEF != 0 {
                    EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION
                } else {
                    0
                },
                // nlist values are unslid vm addresses; the caller
                // subtracts the preferred base
                value: n_value,
                reexport_ordinal: None,
                imported_name: None,
            });
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;

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

    /// Hand-built trie exporting `_foo` (regular, offset 0x1000) and
    /// `_fut` (weak, offset 0x2000).
    fn sample_trie() -> Vec<u8> {
        let mut t = Vec::new();
        // node 0: no terminal, one child edge "_f"
        t.push(0); // terminal size
        t.push(1); // child count
        t.extend_from_slice(b"_f\0");
        let fixup_child0 = t.len();
        t.push(0); // offset placeholder

        // node A: edges "oo" and "ut"
        let node_a = t.len();
        t.push(0);
        t.push(2);
        t.extend_from_slice(b"oo\0");
        let fixup_oo = t.len();
        t.push(0);
        t.extend_from_slice(b"ut\0");
        let fixup_ut = t.len();
        t.push(0);

        // node foo: terminal, flags 0, offset 0x1000
        let node_foo = t.len();
        let mut payload = Vec::new();
        uleb(0, &mut payload);
        uleb(0x1000, &mut payload);
        uleb(payload.len() as u64, &mut t);
        t.extend_from_slice(&payload);
        t.push(0); // no children

        // node fut: terminal, weak flag, offset 0x2000
        let node_fut = t.len();
        let mut payload = Vec::new();
        uleb(EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, &mut payload);
        uleb(0x2000, &mut payload);
        uleb(payload.len() as u64, &mut t);
        t.extend_from_slice(&payload);
        t.push(0);

        t[fixup_child0] = node_a as u8;
        t[fixup_oo] = node_foo as u8;
        t[fixup_ut] = node_fut as u8;
        t
    }

    #[test]
    fn trie_lookup_finds_terminal() {
        let trie = sample_trie();
        let foo = trie_lookup(&trie, "_foo").unwrap();
        assert_eq!(foo.value, 0x1000);
        assert_eq!(foo.flags, 0);

        let fut = trie_lookup(&trie, "_fut").unwrap();
        assert_eq!(fut.value, 0x2000);
        assert_ne!(fut.flags & EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION, 0);
    }

    #[test]
    fn trie_lookup_misses_cleanly() {
        let trie = sample_trie();
        assert!(trie_lookup(&trie, "_bar").is_none());
        assert!(trie_lookup(&trie, "_fo").is_none());
        assert!(trie_lookup(&trie, "_fool").is_none());
    }

    #[test]
    fn uleb_decoding_rejects_overlong() {
        let bytes = [0x80u8; 12];
        let mut off = 0;
        assert!(read_uleb(&bytes, &mut off).is_none());
    }
}
