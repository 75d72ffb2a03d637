//! Applies rebases and binds to a newly mapped image.
//!
//! Three encodings, newest first: chained fixups walked in place,
//! ULEB opcode streams from `LC_DYLD_INFO`, and the original relocation
//! tables. Every write goes through one funnel that applies interposing,
//! signs the pointer on arm64e, and honors the bindings log flag.

use std::sync::Arc;

use scroll::Pread;

use crate::errors::{Diagnostics, LoadError};
use crate::loader::jit::ResolvedBindTarget;
use crate::loader::{Loader, ResolvedSymbol, ResolvedTarget};
use crate::ptrauth::{PointerMetaData, sign_pointer};
use crate::resolve::{self, SymbolRequest};
use crate::state::RuntimeState;

// usr/include/mach-o/fixup-chains.h
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_32: u16 = 3;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;

pub const DYLD_CHAINED_IMPORT: u32 = 1;
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xffff;
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;

// usr/include/mach-o/loader.h rebase opcodes
const REBASE_OPCODE_MASK: u8 = 0xf0;
const REBASE_IMMEDIATE_MASK: u8 = 0x0f;
const REBASE_OPCODE_DONE: u8 = 0x00;
const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

// usr/include/mach-o/loader.h bind opcodes
const BIND_OPCODE_MASK: u8 = 0xf0;
const BIND_IMMEDIATE_MASK: u8 = 0x0f;
const BIND_OPCODE_DONE: u8 = 0x00;
const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
const BIND_OPCODE_DO_BIND: u8 = 0x90;
const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;

const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;

/// Translates the wire special-ordinal encoding (`BIND_SPECIAL_DYLIB_*`)
/// to the resolver's contract.
fn wire_ordinal_to_resolver(wire: i64) -> i64 {
    match wire {
        0 => resolve::ORDINAL_SELF,
        -1 => resolve::ORDINAL_MAIN_EXECUTABLE,
        -2 => resolve::ORDINAL_FLAT,
        -3 => resolve::ORDINAL_WEAK_COALESCE,
        n => n,
    }
}

fn read_uleb(bytes: &[u8], p: &mut usize) -> Option<u64> {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*p)?;
        *p += 1;
        result |= u64::from(byte & 0x7f).checked_shl(shift)?;
        if byte & 0x80 == 0 {
            return Some(result);
        }
        shift += 7;
    }
}

fn read_sleb(bytes: &[u8], p: &mut usize) -> Option<i64> {
    let mut result = 0i64;
    let mut shift = 0u32;
    loop {
        let byte = *bytes.get(*p)?;
        *p += 1;
        if shift > 63 {
            return None;
        }
        result |= i64::from(byte & 0x7f) << shift;
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= -1i64 << shift;
            }
            return Some(result);
        }
    }
}

fn malformed(loader: &Loader, reason: &str) -> LoadError {
    LoadError::MachOMalformed {
        path: loader.path().to_owned(),
        reason: reason.to_owned(),
    }
}

/// One funnel for every fixup store.
fn write_fixup(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    loc: usize,
    value: u64,
    pmd: &PointerMetaData,
    is_64: bool,
    symbol: Option<&str>,
) {
    let interposed = if symbol.is_some() {
        state.apply_interposing(value as usize, Some(loader)) as u64
    } else {
        value
    };
    let signed = sign_pointer(interposed, loc, pmd);
    if state
        .config
        .log_enabled(crate::config::LogFlags::BINDINGS)
    {
        match symbol {
            Some(name) => log::info!("bind {loc:#x} = {signed:#x} ({name})"),
            None => log::info!("rebase {loc:#x} = {signed:#x}"),
        }
    }
    // SAFETY: loc lies inside this loader's freshly mapped writable
    // segments; callers computed it from the image's own fixup metadata
    unsafe {
        if is_64 {
            (loc as *mut u64).write_unaligned(signed);
        } else {
            (loc as *mut u32).write_unaligned(signed as u32);
        }
    }
}

/// Entry point used by the jit loader.
pub fn apply_fixups_generic(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
    allow_lazy_binds: bool,
) -> Result<(), LoadError> {
    let image = loader
        .image(state)
        .ok_or_else(|| malformed(loader, "image not mapped"))?;

    if let Some(chained) = image.chained_fixups() {
        let data = image
            .file_bytes(u64::from(chained.file_offset), chained.size as usize)
            .ok_or_else(|| malformed(loader, "chained fixups out of range"))?;
        return apply_chained(diag, state, loader, &image, data, cache_writer);
    }

    if let Some(info) = image.dyld_info() {
        let di = OpcodeStreams {
            rebase: image.file_bytes(u64::from(info.rebase_off), info.rebase_size as usize),
            bind: image.file_bytes(u64::from(info.bind_off), info.bind_size as usize),
            weak_bind: image.file_bytes(u64::from(info.weak_bind_off), info.weak_bind_size as usize),
            lazy_bind: image.file_bytes(u64::from(info.lazy_bind_off), info.lazy_bind_size as usize),
        };
        return apply_opcodes(diag, state, loader, &image, &di, cache_writer, allow_lazy_binds);
    }

    apply_relocations(diag, state, loader, &image, cache_writer)
}

struct OpcodeStreams<'a> {
    rebase: Option<&'a [u8]>,
    bind: Option<&'a [u8]>,
    weak_bind: Option<&'a [u8]>,
    lazy_bind: Option<&'a [u8]>,
}

fn resolve_and_write(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    loc: usize,
    request: &SymbolRequest<'_>,
    addend: i64,
    pmd: &PointerMetaData,
    is_64: bool,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    let mut patcher = |cache_idx: u16, export_off: u32, resolved: &ResolvedSymbol| {
        patch_cache_users(state, cache_writer, cache_idx, export_off, resolved);
    };
    let resolved = resolve::resolve_symbol(
        diag,
        state,
        loader,
        request,
        Some(&mut patcher as &mut resolve::CacheWeakDefOverride<'_>),
    )?;

    if resolved.is_missing_lazy {
        state.add_missing_flat_lazy_symbol(loader, request.name, loc);
    }

    if let Some(jit) = loader.jit() {
        jit.record_bind_target(match &resolved.target {
            ResolvedTarget::Image { loader: l, offset } => ResolvedBindTarget::Image {
                loader: Arc::clone(l),
                offset: *offset,
            },
            _ => ResolvedBindTarget::Absolute(resolved.resolved_address(state) as u64),
        });
    }

    let value = (resolved.resolved_address(state) as i64 + addend) as u64;
    write_fixup(state, loader, loc, value, pmd, is_64, Some(request.name));
    Ok(())
}

/// Redirects every recorded cache use of an overridden export to the new
/// implementation, flipping `__DATA_CONST` writable for the duration.
pub fn patch_cache_users(
    state: &RuntimeState,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
    cache_dylib_index: u16,
    export_vm_offset: u32,
    resolved: &ResolvedSymbol,
) {
    let Some(cache) = state.config.shared_cache.as_deref() else {
        return;
    };
    if let ResolvedTarget::Image { loader, offset } = &resolved.target {
        state.record_cache_patch(crate::state::RecordedCachePatch {
            cache_dylib_index,
            cache_dylib_vm_offset: export_vm_offset,
            target_loader: Arc::clone(loader),
            target_runtime_offset: *offset,
        });
    }
    let new_value = resolved.resolved_address(state) as u64;
    let mut wrote = false;
    cache.for_each_patch_location(cache_dylib_index, export_vm_offset, |patch| {
        cache_writer.make_writable();
        wrote = true;
        let loc = cache.base_addr + patch.user_vm_offset as usize;
        let value = (new_value as i64 + patch.addend) as u64;
        let signed = sign_pointer(value, loc, &patch.pmd);
        // SAFETY: patch locations come from the cache's own patch table
        // and __DATA_CONST was made writable above
        unsafe { (loc as *mut u64).write_unaligned(signed) };
        log::debug!(
            "cache patch: dylib {cache_dylib_index} +{export_vm_offset:#x} user {loc:#x} -> {signed:#x} ({})",
            resolved.name
        );
    });

    // unzippered twins share users; patch the twin's table too
    if wrote {
        if let Some(twin) = cache
            .dylib(cache_dylib_index)
            .and_then(|d| d.twin_index)
        {
            cache.for_each_patch_location(twin, export_vm_offset, |patch| {
                cache_writer.make_writable();
                let loc = cache.base_addr + patch.user_vm_offset as usize;
                let value = (new_value as i64 + patch.addend) as u64;
                let signed = sign_pointer(value, loc, &patch.pmd);
                // SAFETY: as above
                unsafe { (loc as *mut u64).write_unaligned(signed) };
            });
        }
    }
}

// ---- opcode path ----

fn apply_opcodes(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    image: &crate::mach::MachImage<'_>,
    streams: &OpcodeStreams<'_>,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
    allow_lazy_binds: bool,
) -> Result<(), LoadError> {
    let base = loader.load_address(state);
    let seg_deltas = image.raw_segment_vm_deltas();
    let is_64 = image.header().is_64();
    let slide = base as u64 - image.preferred_base();

    if let Some(rebases) = streams.rebase {
        run_rebase_opcodes(loader, rebases, &seg_deltas, base, slide, state, is_64)?;
    }
    if let Some(binds) = streams.bind {
        run_bind_opcodes(
            diag, state, loader, binds, &seg_deltas, base, is_64, false, false, cache_writer,
        )?;
    }
    if let Some(weak) = streams.weak_bind {
        run_bind_opcodes(
            diag, state, loader, weak, &seg_deltas, base, is_64, true, false, cache_writer,
        )?;
    }
    if let Some(lazy) = streams.lazy_bind {
        // dyld4 has no lazy stubs: lazy binds are resolved up front, the
        // lazy flag only softens a miss
        let lazy_flag = allow_lazy_binds;
        run_bind_opcodes(
            diag, state, loader, lazy, &seg_deltas, base, is_64, false, lazy_flag, cache_writer,
        )?;
    }
    Ok(())
}

fn run_rebase_opcodes(
    loader: &Arc<Loader>,
    stream: &[u8],
    seg_deltas: &[i64],
    base: usize,
    slide: u64,
    state: &RuntimeState,
    is_64: bool,
) -> Result<(), LoadError> {
    let ptr_size = if is_64 { 8u64 } else { 4 };
    let mut p = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let truncated = || malformed(loader, "truncated rebase opcodes");

    let rebase_at = |seg_index: usize, seg_offset: u64| -> Result<(), LoadError> {
        let delta = *seg_deltas
            .get(seg_index)
            .ok_or_else(|| malformed(loader, "rebase segment index out of range"))?;
        let loc = (base as i64 + delta + seg_offset as i64) as usize;
        // SAFETY: loc is within a mapped segment per the opcode stream
        let old: u64 = unsafe {
            if is_64 {
                (loc as *const u64).read_unaligned()
            } else {
                u64::from((loc as *const u32).read_unaligned())
            }
        };
        write_fixup(
            state,
            loader,
            loc,
            old.wrapping_add(slide),
            &PointerMetaData::default(),
            is_64,
            None,
        );
        Ok(())
    };

    while p < stream.len() {
        let byte = stream[p];
        p += 1;
        let imm = byte & REBASE_IMMEDIATE_MASK;
        match byte & REBASE_OPCODE_MASK {
            REBASE_OPCODE_DONE => break,
            REBASE_OPCODE_SET_TYPE_IMM => {}
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb(stream, &mut p).ok_or_else(truncated)?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                seg_offset =
                    seg_offset.wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?);
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                seg_offset += u64::from(imm) * ptr_size;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..imm {
                    rebase_at(seg_index, seg_offset)?;
                    seg_offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                for _ in 0..count {
                    rebase_at(seg_index, seg_offset)?;
                    seg_offset += ptr_size;
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                rebase_at(seg_index, seg_offset)?;
                seg_offset = seg_offset
                    .wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?)
                    + ptr_size;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                let skip = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                for _ in 0..count {
                    rebase_at(seg_index, seg_offset)?;
                    seg_offset += skip + ptr_size;
                }
            }
            _ => return Err(malformed(loader, "unknown rebase opcode")),
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn run_bind_opcodes(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    stream: &[u8],
    seg_deltas: &[i64],
    base: usize,
    is_64: bool,
    weak_stream: bool,
    lazy_stream: bool,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    let ptr_size = if is_64 { 8u64 } else { 4 };
    let mut p = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut ordinal: i64 = 0;
    let mut symbol_name = String::new();
    let mut weak_import = false;
    let mut addend: i64 = 0;
    let truncated = || malformed(loader, "truncated bind opcodes");

    macro_rules! do_bind {
        () => {{
            let delta = *seg_deltas
                .get(seg_index)
                .ok_or_else(|| malformed(loader, "bind segment index out of range"))?;
            let loc = (base as i64 + delta + seg_offset as i64) as usize;
            let request = SymbolRequest {
                lib_ordinal: if weak_stream {
                    resolve::ORDINAL_WEAK_COALESCE
                } else {
                    wire_ordinal_to_resolver(ordinal)
                },
                name: &symbol_name,
                weak_import,
                lazy_bind: lazy_stream,
            };
            resolve_and_write(
                diag,
                state,
                loader,
                loc,
                &request,
                addend,
                &PointerMetaData::default(),
                is_64,
                cache_writer,
            )?;
        }};
    }

    while p < stream.len() {
        let byte = stream[p];
        p += 1;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match byte & BIND_OPCODE_MASK {
            BIND_OPCODE_DONE => {
                if lazy_stream {
                    // the lazy stream separates entries with DONE
                    continue;
                }
                break;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = i64::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                ordinal = read_uleb(stream, &mut p).ok_or_else(truncated)? as i64;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // sign-extend the 4-bit immediate
                ordinal = if imm == 0 {
                    0
                } else {
                    i64::from(imm) | -16i64
                };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                weak_import = imm & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                let start = p;
                while p < stream.len() && stream[p] != 0 {
                    p += 1;
                }
                symbol_name = String::from_utf8_lossy(&stream[start..p]).into_owned();
                p += 1; // NUL
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                addend = read_sleb(stream, &mut p).ok_or_else(truncated)?;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb(stream, &mut p).ok_or_else(truncated)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                seg_offset =
                    seg_offset.wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?);
            }
            BIND_OPCODE_DO_BIND => {
                do_bind!();
                seg_offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                do_bind!();
                seg_offset = seg_offset
                    .wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?)
                    + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                do_bind!();
                seg_offset += u64::from(imm) * ptr_size + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                let skip = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                for _ in 0..count {
                    do_bind!();
                    seg_offset += skip + ptr_size;
                }
            }
            _ => return Err(malformed(loader, "unknown bind opcode")),
        }
    }
    Ok(())
}

// ---- chained fixups path ----

struct ChainedImport {
    lib_ordinal: i64,
    name: String,
    weak_import: bool,
    addend: i64,
}

fn parse_chained_imports(
    loader: &Arc<Loader>,
    data: &[u8],
) -> Result<(Vec<ChainedImport>, u32), LoadError> {
    let bad = |r: &str| malformed(loader, r);
    let starts_offset: u32 = data.pread_with(4, scroll::LE).map_err(|_| bad("short header"))?;
    let imports_offset: u32 = data.pread_with(8, scroll::LE).map_err(|_| bad("short header"))?;
    let symbols_offset: u32 = data.pread_with(12, scroll::LE).map_err(|_| bad("short header"))?;
    let imports_count: u32 = data.pread_with(16, scroll::LE).map_err(|_| bad("short header"))?;
    let imports_format: u32 = data.pread_with(20, scroll::LE).map_err(|_| bad("short header"))?;

    let read_name = |name_offset: usize| -> String {
        let start = symbols_offset as usize + name_offset;
        let tail = &data[start.min(data.len())..];
        let end = tail.iter().position(|&b| b == 0).unwrap_or(0);
        String::from_utf8_lossy(&tail[..end]).into_owned()
    };

    let mut imports = Vec::with_capacity(imports_count as usize);
    for i in 0..imports_count as usize {
        match imports_format {
            DYLD_CHAINED_IMPORT => {
                let raw: u32 = data
                    .pread_with(imports_offset as usize + i * 4, scroll::LE)
                    .map_err(|_| bad("truncated imports"))?;
                imports.push(ChainedImport {
                    lib_ordinal: i64::from((raw & 0xff) as u8 as i8),
                    weak_import: raw & 0x100 != 0,
                    name: read_name((raw >> 9) as usize),
                    addend: 0,
                });
            }
            DYLD_CHAINED_IMPORT_ADDEND => {
                let off = imports_offset as usize + i * 8;
                let raw: u32 = data.pread_with(off, scroll::LE).map_err(|_| bad("truncated imports"))?;
                let addend: i32 =
                    data.pread_with(off + 4, scroll::LE).map_err(|_| bad("truncated imports"))?;
                imports.push(ChainedImport {
                    lib_ordinal: i64::from((raw & 0xff) as u8 as i8),
                    weak_import: raw & 0x100 != 0,
                    name: read_name((raw >> 9) as usize),
                    addend: i64::from(addend),
                });
            }
            DYLD_CHAINED_IMPORT_ADDEND64 => {
                let off = imports_offset as usize + i * 16;
                let raw: u64 = data.pread_with(off, scroll::LE).map_err(|_| bad("truncated imports"))?;
                let addend: u64 =
                    data.pread_with(off + 8, scroll::LE).map_err(|_| bad("truncated imports"))?;
                imports.push(ChainedImport {
                    lib_ordinal: (raw & 0xffff) as u16 as i16 as i64,
                    weak_import: raw & 0x1_0000 != 0,
                    name: read_name((raw >> 32) as usize),
                    addend: addend as i64,
                });
            }
            _ => return Err(bad("unknown chained import format")),
        }
    }
    Ok((imports, starts_offset))
}

fn apply_chained(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    image: &crate::mach::MachImage<'_>,
    data: &[u8],
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    let (imports, starts_offset) = parse_chained_imports(loader, data)?;
    let base = loader.load_address(state);
    let slide = base as u64 - image.preferred_base();

    // pre-resolve every import once; chain entries index this array
    let mut targets: Vec<(u64, Option<String>)> = Vec::with_capacity(imports.len());
    for import in &imports {
        let request = SymbolRequest {
            lib_ordinal: wire_ordinal_to_resolver(import.lib_ordinal),
            name: &import.name,
            weak_import: import.weak_import,
            lazy_bind: false,
        };
        let mut patcher = |cache_idx: u16, export_off: u32, resolved: &ResolvedSymbol| {
            patch_cache_users(state, cache_writer, cache_idx, export_off, resolved);
        };
        let resolved = resolve::resolve_symbol(
            diag,
            state,
            loader,
            &request,
            Some(&mut patcher as &mut resolve::CacheWeakDefOverride<'_>),
        )?;
        if let Some(jit) = loader.jit() {
            jit.record_bind_target(match &resolved.target {
                ResolvedTarget::Image { loader: l, offset } => ResolvedBindTarget::Image {
                    loader: Arc::clone(l),
                    offset: *offset,
                },
                _ => ResolvedBindTarget::Absolute(resolved.resolved_address(state) as u64),
            });
        }
        let value = (resolved.resolved_address(state) as i64 + import.addend) as u64;
        targets.push((value, Some(import.name.clone())));
    }

    walk_chains(state, loader, data, starts_offset, base, slide, &targets)
}

/// Replays an image's fixups from a pre-resolved target array, the
/// PrebuiltLoader path: no symbol lookup happens here.
pub fn apply_prebound(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    bind_values: &[u64],
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    let _ = cache_writer;
    let image = loader
        .image(state)
        .ok_or_else(|| malformed(loader, "image not mapped"))?;
    let base = loader.load_address(state);
    let slide = base as u64 - image.preferred_base();

    if let Some(chained) = image.chained_fixups() {
        let data = image
            .file_bytes(u64::from(chained.file_offset), chained.size as usize)
            .ok_or_else(|| malformed(loader, "chained fixups out of range"))?;
        // imports carry the addends; the ordinal order matches the
        // serialized bind-target order exactly
        let (imports, starts_offset) = parse_chained_imports(loader, data)?;
        if imports.len() != bind_values.len() {
            return Err(LoadError::PrebuiltLoaderInvalid {
                reason: format!(
                    "'{}' bind target count {} does not match import count {}",
                    loader.path(),
                    bind_values.len(),
                    imports.len()
                ),
            });
        }
        let targets: Vec<(u64, Option<String>)> = imports
            .iter()
            .zip(bind_values)
            .map(|(imp, v)| ((*v as i64 + imp.addend) as u64, Some(imp.name.clone())))
            .collect();
        return walk_chains(state, loader, data, starts_offset, base, slide, &targets);
    }

    if let Some(info) = image.dyld_info() {
        if let Some(rebases) =
            image.file_bytes(u64::from(info.rebase_off), info.rebase_size as usize)
        {
            let seg_deltas = image.raw_segment_vm_deltas();
            run_rebase_opcodes(
                loader,
                rebases,
                &seg_deltas,
                base,
                slide,
                state,
                image.header().is_64(),
            )?;
        }
        let mut next = 0usize;
        let seg_deltas = image.raw_segment_vm_deltas();
        for (off, size) in [
            (info.bind_off, info.bind_size),
            (info.weak_bind_off, info.weak_bind_size),
            (info.lazy_bind_off, info.lazy_bind_size),
        ] {
            if size == 0 {
                continue;
            }
            let stream = image
                .file_bytes(u64::from(off), size as usize)
                .ok_or_else(|| malformed(loader, "bind stream out of range"))?;
            run_bind_opcodes_prebound(
                state,
                loader,
                stream,
                &seg_deltas,
                base,
                image.header().is_64(),
                bind_values,
                &mut next,
            )?;
        }
        return Ok(());
    }

    // prebuilt loaders are never built for relocation-era binaries
    let _ = diag;
    Ok(())
}

fn walk_chains(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    data: &[u8],
    starts_offset: u32,
    base: usize,
    slide: u64,
    targets: &[(u64, Option<String>)],
) -> Result<(), LoadError> {
    let bad = |r: &str| malformed(loader, r);
    let starts = starts_offset as usize;
    let seg_count: u32 = data.pread_with(starts, scroll::LE).map_err(|_| bad("truncated starts"))?;
    for seg in 0..seg_count as usize {
        let seg_info_off: u32 = data
            .pread_with(starts + 4 + seg * 4, scroll::LE)
            .map_err(|_| bad("truncated starts"))?;
        if seg_info_off == 0 {
            continue;
        }
        let si = starts + seg_info_off as usize;
        let page_size: u16 = data.pread_with(si + 4, scroll::LE).map_err(|_| bad("truncated seg info"))?;
        let pointer_format: u16 =
            data.pread_with(si + 6, scroll::LE).map_err(|_| bad("truncated seg info"))?;
        let segment_offset: u64 =
            data.pread_with(si + 8, scroll::LE).map_err(|_| bad("truncated seg info"))?;
        let page_count: u16 =
            data.pread_with(si + 20, scroll::LE).map_err(|_| bad("truncated seg info"))?;

        for page in 0..page_count as usize {
            let page_start: u16 = data
                .pread_with(si + 22 + page * 2, scroll::LE)
                .map_err(|_| bad("truncated page starts"))?;
            if page_start == DYLD_CHAINED_PTR_START_NONE {
                continue;
            }
            if page_start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                return Err(bad("multi-start chained pages not supported"));
            }
            let mut loc = base
                + segment_offset as usize
                + page * page_size as usize
                + page_start as usize;
            loop {
                let next = apply_one_chained_fixup(
                    state,
                    loader,
                    loc,
                    pointer_format,
                    base,
                    slide,
                    targets,
                )
                .map_err(|r| bad(&r))?;
                match next {
                    0 => break,
                    stride => loc += stride,
                }
            }
        }
    }
    Ok(())
}

/// Applies the fixup at `loc` and returns the byte distance to the next
/// link in the chain (0 = end).
fn apply_one_chained_fixup(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    loc: usize,
    pointer_format: u16,
    base: usize,
    slide: u64,
    targets: &[(u64, Option<String>)],
) -> Result<usize, String> {
    // SAFETY: loc follows a chain rooted in this image's page starts
    let raw = unsafe { (loc as *const u64).read_unaligned() };
    match pointer_format {
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
            let next = ((raw >> 51) & 0xfff) as usize;
            let is_bind = raw >> 63 != 0;
            if is_bind {
                let ordinal = (raw & 0xff_ffff) as usize;
                let addend = ((raw >> 24) & 0xff) as i64;
                let (value, name) = targets
                    .get(ordinal)
                    .ok_or_else(|| format!("chained bind ordinal {ordinal} out of range"))?;
                write_fixup(
                    state,
                    loader,
                    loc,
                    (*value as i64 + addend) as u64,
                    &PointerMetaData::default(),
                    true,
                    name.as_deref(),
                );
            } else {
                let target = raw & 0xf_ffff_ffff;
                let high8 = (raw >> 36) & 0xff;
                let new_value = if pointer_format == DYLD_CHAINED_PTR_64_OFFSET {
                    base as u64 + target | (high8 << 56)
                } else {
                    target.wrapping_add(slide) | (high8 << 56)
                };
                write_fixup(
                    state,
                    loader,
                    loc,
                    new_value,
                    &PointerMetaData::default(),
                    true,
                    None,
                );
            }
            Ok(next * 4)
        }
        DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
            let next = ((raw >> 51) & 0x7ff) as usize;
            let is_auth = raw >> 63 != 0;
            let is_bind = (raw >> 62) & 1 != 0;
            let stride = 8usize;
            if is_bind {
                let ordinal_bits = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                    raw & 0xff_ffff
                } else {
                    raw & 0xffff
                } as usize;
                let (value, name) = targets
                    .get(ordinal_bits)
                    .ok_or_else(|| format!("chained bind ordinal {ordinal_bits} out of range"))?;
                let pmd = if is_auth {
                    PointerMetaData {
                        high8: 0,
                        diversity: ((raw >> 32) & 0xffff) as u16,
                        has_auth: true,
                        key: ((raw >> 49) & 0x3) as u8,
                        uses_addr_diversity: (raw >> 48) & 1 != 0,
                    }
                } else {
                    PointerMetaData::default()
                };
                let addend = if is_auth {
                    0
                } else {
                    // 19-bit signed addend
                    let a = (raw >> 32) & 0x7_ffff;
                    ((a << 45) as i64) >> 45
                };
                write_fixup(
                    state,
                    loader,
                    loc,
                    (*value as i64 + addend) as u64,
                    &pmd,
                    true,
                    name.as_deref(),
                );
            } else if is_auth {
                let target = raw & 0xffff_ffff;
                let pmd = PointerMetaData {
                    high8: 0,
                    diversity: ((raw >> 32) & 0xffff) as u16,
                    has_auth: true,
                    key: ((raw >> 49) & 0x3) as u8,
                    uses_addr_diversity: (raw >> 48) & 1 != 0,
                };
                write_fixup(state, loader, loc, base as u64 + target, &pmd, true, None);
            } else {
                let target = raw & 0x7ff_ffff_ffff;
                let high8 = (raw >> 43) & 0xff;
                write_fixup(
                    state,
                    loader,
                    loc,
                    target.wrapping_add(slide) | (high8 << 56),
                    &PointerMetaData::default(),
                    true,
                    None,
                );
            }
            Ok(next * stride)
        }
        DYLD_CHAINED_PTR_32 => {
            // SAFETY: 32-bit chain entry at loc
            let raw32 = unsafe { (loc as *const u32).read_unaligned() };
            let next = ((raw32 >> 26) & 0x1f) as usize;
            let is_bind = raw32 >> 31 != 0;
            if is_bind {
                let ordinal = (raw32 & 0xfffff) as usize;
                let addend = ((raw32 >> 20) & 0x3f) as i64;
                let (value, name) = targets
                    .get(ordinal)
                    .ok_or_else(|| format!("chained bind ordinal {ordinal} out of range"))?;
                write_fixup(
                    state,
                    loader,
                    loc,
                    (*value as i64 + addend) as u64,
                    &PointerMetaData::default(),
                    false,
                    name.as_deref(),
                );
            } else {
                let target = u64::from(raw32 & 0x3ff_ffff);
                write_fixup(
                    state,
                    loader,
                    loc,
                    target.wrapping_add(slide),
                    &PointerMetaData::default(),
                    false,
                    None,
                );
            }
            Ok(next * 4)
        }
        other => Err(format!("unsupported chained pointer format {other}")),
    }
}

/// Replays a bind opcode stream writing values from `bind_values` in
/// encounter order, which is the order the serializer recorded them.
#[allow(clippy::too_many_arguments)]
fn run_bind_opcodes_prebound(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    stream: &[u8],
    seg_deltas: &[i64],
    base: usize,
    is_64: bool,
    bind_values: &[u64],
    next_value: &mut usize,
) -> Result<(), LoadError> {
    let ptr_size = if is_64 { 8u64 } else { 4 };
    let mut p = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut addend: i64 = 0;
    let mut symbol_name = String::new();
    let truncated = || malformed(loader, "truncated bind opcodes");

    macro_rules! do_bind {
        () => {{
            let delta = *seg_deltas
                .get(seg_index)
                .ok_or_else(|| malformed(loader, "bind segment index out of range"))?;
            let loc = (base as i64 + delta + seg_offset as i64) as usize;
            let value = *bind_values.get(*next_value).ok_or_else(|| {
                LoadError::PrebuiltLoaderInvalid {
                    reason: format!("'{}' has fewer bind targets than bind sites", loader.path()),
                }
            })?;
            *next_value += 1;
            write_fixup(
                state,
                loader,
                loc,
                (value as i64 + addend) as u64,
                &PointerMetaData::default(),
                is_64,
                Some(&symbol_name),
            );
        }};
    }

    while p < stream.len() {
        let byte = stream[p];
        p += 1;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match byte & BIND_OPCODE_MASK {
            BIND_OPCODE_DONE => continue,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {}
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                read_uleb(stream, &mut p).ok_or_else(truncated)?;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {}
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let start = p;
                while p < stream.len() && stream[p] != 0 {
                    p += 1;
                }
                symbol_name = String::from_utf8_lossy(&stream[start..p]).into_owned();
                p += 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                addend = read_sleb(stream, &mut p).ok_or_else(truncated)?;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                seg_offset = read_uleb(stream, &mut p).ok_or_else(truncated)?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                seg_offset =
                    seg_offset.wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?);
            }
            BIND_OPCODE_DO_BIND => {
                do_bind!();
                seg_offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                do_bind!();
                seg_offset = seg_offset
                    .wrapping_add(read_uleb(stream, &mut p).ok_or_else(truncated)?)
                    + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                do_bind!();
                seg_offset += u64::from(imm) * ptr_size + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                let skip = read_uleb(stream, &mut p).ok_or_else(truncated)?;
                for _ in 0..count {
                    do_bind!();
                    seg_offset += skip + ptr_size;
                }
            }
            _ => return Err(malformed(loader, "unknown bind opcode")),
        }
    }
    Ok(())
}

// ---- legacy relocation path ----

fn apply_relocations(
    diag: &mut Diagnostics,
    state: &RuntimeState,
    loader: &Arc<Loader>,
    image: &crate::mach::MachImage<'_>,
    cache_writer: &mut crate::cache::DataConstLazyWriter<'_>,
) -> Result<(), LoadError> {
    use goblin::mach::symbols::SIZEOF_NLIST_64;

    let Some(dysymtab) = image.dysymtab() else {
        return Ok(());
    };
    let base = loader.load_address(state);
    let slide = base as u64 - image.preferred_base();
    let is_64 = image.header().is_64();
    // relocation r_address values are relative to the first writable segment
    let reloc_base: i64 = image
        .segments()
        .iter()
        .find(|s| s.writable())
        .map_or(0, |s| s.vm_offset as i64);

    // local relocations are rebases
    if dysymtab.nlocrel != 0 {
        let relocs = image
            .file_bytes(u64::from(dysymtab.locreloff), dysymtab.nlocrel as usize * 8)
            .ok_or_else(|| malformed(loader, "local relocations out of range"))?;
        for i in 0..dysymtab.nlocrel as usize {
            let r_address: i32 = relocs.pread_with(i * 8, scroll::LE).map_err(|_| {
                malformed(loader, "truncated local relocation")
            })?;
            let loc = (base as i64 + reloc_base + i64::from(r_address)) as usize;
            // SAFETY: relocation address from the image's own tables
            let old: u64 = unsafe {
                if is_64 {
                    (loc as *const u64).read_unaligned()
                } else {
                    u64::from((loc as *const u32).read_unaligned())
                }
            };
            write_fixup(
                state,
                loader,
                loc,
                old.wrapping_add(slide),
                &PointerMetaData::default(),
                is_64,
                None,
            );
        }
    }

    // external relocations are binds through the symbol table
    if dysymtab.nextrel != 0 {
        let symtab = image
            .symtab()
            .ok_or_else(|| malformed(loader, "external relocations without symtab"))?;
        let strtab = image
            .file_bytes(u64::from(symtab.str_off), symtab.str_size as usize)
            .ok_or_else(|| malformed(loader, "string table out of range"))?;
        let syms = image
            .file_bytes(
                u64::from(symtab.sym_off),
                symtab.num_syms as usize * SIZEOF_NLIST_64,
            )
            .ok_or_else(|| malformed(loader, "symbol table out of range"))?;
        let relocs = image
            .file_bytes(u64::from(dysymtab.extreloff), dysymtab.nextrel as usize * 8)
            .ok_or_else(|| malformed(loader, "external relocations out of range"))?;

        for i in 0..dysymtab.nextrel as usize {
            let r_address: i32 = relocs.pread_with(i * 8, scroll::LE).map_err(|_| {
                malformed(loader, "truncated external relocation")
            })?;
            let packed: u32 = relocs.pread_with(i * 8 + 4, scroll::LE).map_err(|_| {
                malformed(loader, "truncated external relocation")
            })?;
            let sym_index = (packed & 0xff_ffff) as usize;

            let off = sym_index * SIZEOF_NLIST_64;
            let n_strx: u32 = syms
                .pread_with(off, scroll::LE)
                .map_err(|_| malformed(loader, "bad symbol index in relocation"))?;
            let n_desc: u16 = syms
                .pread_with(off + 6, scroll::LE)
                .map_err(|_| malformed(loader, "bad symbol index in relocation"))?;
            let tail = strtab
                .get(n_strx as usize..)
                .ok_or_else(|| malformed(loader, "bad strx in relocation"))?;
            let end = tail
                .iter()
                .position(|&b| b == 0)
                .ok_or_else(|| malformed(loader, "unterminated symbol name"))?;
            let name = String::from_utf8_lossy(&tail[..end]).into_owned();

            // GET_LIBRARY_ORDINAL from n_desc
            let wire_ordinal = i64::from(((n_desc >> 8) & 0xff) as u8 as i8);
            let weak_import = n_desc & 0x0040 != 0; // N_WEAK_REF

            let loc = (base as i64 + reloc_base + i64::from(r_address)) as usize;
            let request = SymbolRequest {
                lib_ordinal: wire_ordinal_to_resolver(wire_ordinal),
                name: &name,
                weak_import,
                lazy_bind: false,
            };
            resolve_and_write(
                diag,
                state,
                loader,
                loc,
                &request,
                0,
                &PointerMetaData::default(),
                is_64,
                cache_writer,
            )?;
        }
    }
    Ok(())
}

/// One bind location discovered by [`collect_bind_sites`], before any
/// write happened. `lib_ordinal` is already in the resolver's encoding.
pub struct BindSite {
    pub vm_offset: u64,
    pub lib_ordinal: i64,
    pub name: String,
    pub weak_import: bool,
}

/// Enumerates an image's bind locations without writing anything. Used
/// by the interpose scan, which must learn what the `__interpose`
/// section will point at before fixups run.
pub fn collect_bind_sites(state: &RuntimeState, loader: &Arc<Loader>) -> Vec<BindSite> {
    let mut sites = Vec::new();
    let Some(image) = loader.image(state) else {
        return sites;
    };

    if let Some(chained) = image.chained_fixups() {
        let Some(data) = image.file_bytes(u64::from(chained.file_offset), chained.size as usize)
        else {
            return sites;
        };
        let Ok((imports, starts_offset)) = parse_chained_imports(loader, data) else {
            return sites;
        };
        let base = loader.load_address(state);
        collect_chained_bind_sites(data, starts_offset, base, &imports, &mut sites);
        return sites;
    }

    if let Some(info) = image.dyld_info() {
        let seg_deltas = image.raw_segment_vm_deltas();
        for (off, size, weak_stream) in [
            (info.bind_off, info.bind_size, false),
            (info.weak_bind_off, info.weak_bind_size, true),
            (info.lazy_bind_off, info.lazy_bind_size, false),
        ] {
            if size == 0 {
                continue;
            }
            if let Some(stream) = image.file_bytes(u64::from(off), size as usize) {
                collect_opcode_bind_sites(stream, &seg_deltas, weak_stream, &mut sites);
            }
        }
    }
    sites
}

fn collect_opcode_bind_sites(
    stream: &[u8],
    seg_deltas: &[i64],
    weak_stream: bool,
    sites: &mut Vec<BindSite>,
) {
    let ptr_size = 8u64;
    let mut p = 0usize;
    let mut seg_index = 0usize;
    let mut seg_offset = 0u64;
    let mut ordinal: i64 = 0;
    let mut symbol_name = String::new();
    let mut weak_import = false;

    let mut record = |seg_index: usize, seg_offset: u64, ordinal: i64, name: &str, weak: bool| {
        let Some(delta) = seg_deltas.get(seg_index) else {
            return;
        };
        sites.push(BindSite {
            vm_offset: (delta + seg_offset as i64) as u64,
            lib_ordinal: if weak_stream {
                resolve::ORDINAL_WEAK_COALESCE
            } else {
                wire_ordinal_to_resolver(ordinal)
            },
            name: name.to_owned(),
            weak_import: weak,
        });
    };

    while p < stream.len() {
        let byte = stream[p];
        p += 1;
        let imm = byte & BIND_IMMEDIATE_MASK;
        match byte & BIND_OPCODE_MASK {
            BIND_OPCODE_DONE => continue,
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => ordinal = i64::from(imm),
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let Some(v) = read_uleb(stream, &mut p) else {
                    return;
                };
                ordinal = v as i64;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                ordinal = if imm == 0 { 0 } else { i64::from(imm) | -16i64 };
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                weak_import = imm & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                let start = p;
                while p < stream.len() && stream[p] != 0 {
                    p += 1;
                }
                symbol_name = String::from_utf8_lossy(&stream[start..p]).into_owned();
                p += 1;
            }
            BIND_OPCODE_SET_TYPE_IMM => {}
            BIND_OPCODE_SET_ADDEND_SLEB => {
                if read_sleb(stream, &mut p).is_none() {
                    return;
                }
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                seg_index = imm as usize;
                let Some(v) = read_uleb(stream, &mut p) else {
                    return;
                };
                seg_offset = v;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                let Some(v) = read_uleb(stream, &mut p) else {
                    return;
                };
                seg_offset = seg_offset.wrapping_add(v);
            }
            BIND_OPCODE_DO_BIND => {
                record(seg_index, seg_offset, ordinal, &symbol_name, weak_import);
                seg_offset += ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                record(seg_index, seg_offset, ordinal, &symbol_name, weak_import);
                let Some(v) = read_uleb(stream, &mut p) else {
                    return;
                };
                seg_offset = seg_offset.wrapping_add(v) + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                record(seg_index, seg_offset, ordinal, &symbol_name, weak_import);
                seg_offset += u64::from(imm) * ptr_size + ptr_size;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let (Some(count), Some(skip)) =
                    (read_uleb(stream, &mut p), read_uleb(stream, &mut p))
                else {
                    return;
                };
                for _ in 0..count {
                    record(seg_index, seg_offset, ordinal, &symbol_name, weak_import);
                    seg_offset += skip + ptr_size;
                }
            }
            _ => return,
        }
    }
}

fn collect_chained_bind_sites(
    data: &[u8],
    starts_offset: u32,
    base: usize,
    imports: &[ChainedImport],
    sites: &mut Vec<BindSite>,
) {
    let starts = starts_offset as usize;
    let Ok(seg_count) = data.pread_with::<u32>(starts, scroll::LE) else {
        return;
    };
    for seg in 0..seg_count as usize {
        let Ok(seg_info_off) = data.pread_with::<u32>(starts + 4 + seg * 4, scroll::LE) else {
            return;
        };
        if seg_info_off == 0 {
            continue;
        }
        let si = starts + seg_info_off as usize;
        let (Ok(page_size), Ok(pointer_format), Ok(segment_offset), Ok(page_count)) = (
            data.pread_with::<u16>(si + 4, scroll::LE),
            data.pread_with::<u16>(si + 6, scroll::LE),
            data.pread_with::<u64>(si + 8, scroll::LE),
            data.pread_with::<u16>(si + 20, scroll::LE),
        ) else {
            return;
        };
        for page in 0..page_count as usize {
            let Ok(page_start) = data.pread_with::<u16>(si + 22 + page * 2, scroll::LE) else {
                return;
            };
            if page_start == DYLD_CHAINED_PTR_START_NONE
                || page_start & DYLD_CHAINED_PTR_START_MULTI != 0
            {
                continue;
            }
            let mut vm_offset =
                segment_offset + (page * page_size as usize + page_start as usize) as u64;
            loop {
                // SAFETY: following the image's own chain starts
                let raw = unsafe { ((base + vm_offset as usize) as *const u64).read_unaligned() };
                let (next, stride, ordinal) = match pointer_format {
                    DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
                        let is_bind = raw >> 63 != 0;
                        (
                            ((raw >> 51) & 0xfff) as usize,
                            4usize,
                            is_bind.then_some((raw & 0xff_ffff) as usize),
                        )
                    }
                    DYLD_CHAINED_PTR_ARM64E | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
                        let is_bind = (raw >> 62) & 1 != 0;
                        let ord = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                            raw & 0xff_ffff
                        } else {
                            raw & 0xffff
                        } as usize;
                        (((raw >> 51) & 0x7ff) as usize, 8usize, is_bind.then_some(ord))
                    }
                    _ => return,
                };
                if let Some(ordinal) = ordinal {
                    if let Some(import) = imports.get(ordinal) {
                        sites.push(BindSite {
                            vm_offset,
                            lib_ordinal: wire_ordinal_to_resolver(import.lib_ordinal),
                            name: import.name.clone(),
                            weak_import: import.weak_import,
                        });
                    }
                }
                if next == 0 {
                    break;
                }
                vm_offset += (next * stride) as u64;
            }
        }
    }
}

/// Unslid rebase target stored at `vm_offset`, readable before fixups
/// run: raw memory for opcode images, decoded chain bits for chained.
pub fn read_prefixup_rebase_target(
    state: &RuntimeState,
    loader: &Arc<Loader>,
    vm_offset: u64,
) -> Option<u64> {
    let image = loader.image(state)?;
    let base = loader.load_address(state);
    // SAFETY: vm_offset lies inside the mapped image
    let raw = unsafe { ((base + vm_offset as usize) as *const u64).read_unaligned() };
    if image.chained_fixups().is_none() {
        return Some(raw);
    }
    // chained: the rebase target is packed into the low bits
    if raw >> 63 != 0 {
        return None; // bind, not rebase
    }
    Some(raw & 0xf_ffff_ffff)
}

/// After a dlopen brings in new images, lazy binds that missed at launch
/// get one more chance.
pub fn rebind_missing_flat_lazy_symbols(state: &RuntimeState) {
    let missing = state.missing_flat_lazy_symbols.lock().unwrap().clone();
    let mut still_missing = Vec::new();
    for entry in missing {
        let found = state.with_loaded(|loaded| {
            loaded
                .iter()
                .filter(|l| !l.hidden_from_flat())
                .find_map(|l| resolve::search_one_image(state, l, &entry.symbol_name))
        });
        match found {
            Some((definer, offset)) => {
                let value = definer.load_address(state).wrapping_add(offset as usize) as u64;
                write_fixup(
                    state,
                    &entry.loader,
                    entry.bind_loc,
                    value,
                    &PointerMetaData::default(),
                    true,
                    Some(&entry.symbol_name),
                );
            }
            None => still_missing.push(entry),
        }
    }
    *state.missing_flat_lazy_symbols.lock().unwrap() = still_missing;
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sleb_decodes_negatives() {
        // -2 encoded as SLEB128
        let bytes = [0x7e];
        let mut p = 0;
        assert_eq!(read_sleb(&bytes, &mut p), Some(-2));

        let bytes = [0x80, 0x7f]; // -128
        let mut p = 0;
        assert_eq!(read_sleb(&bytes, &mut p), Some(-128));
    }

    #[test]
    fn wire_ordinals_map_to_resolver_contract() {
        assert_eq!(wire_ordinal_to_resolver(0), resolve::ORDINAL_SELF);
        assert_eq!(wire_ordinal_to_resolver(-1), resolve::ORDINAL_MAIN_EXECUTABLE);
        assert_eq!(wire_ordinal_to_resolver(-2), resolve::ORDINAL_FLAT);
        assert_eq!(wire_ordinal_to_resolver(-3), resolve::ORDINAL_WEAK_COALESCE);
        assert_eq!(wire_ordinal_to_resolver(3), 3);
    }

    #[test]
    fn chained_import_parse_reads_names_and_ordinals() {
        // header: version 0, starts at 28, imports at 28, symbols at 36,
        // one import, format DYLD_CHAINED_IMPORT
        let mut data = Vec::new();
        data.extend_from_slice(&0u32.to_le_bytes()); // fixups_version
        data.extend_from_slice(&40u32.to_le_bytes()); // starts_offset
        data.extend_from_slice(&28u32.to_le_bytes()); // imports_offset
        data.extend_from_slice(&32u32.to_le_bytes()); // symbols_offset
        data.extend_from_slice(&1u32.to_le_bytes()); // imports_count
        data.extend_from_slice(&DYLD_CHAINED_IMPORT.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes()); // symbols_format
        // import: lib_ordinal 2, not weak, name_offset 1
        let raw: u32 = 2 | (1 << 9);
        data.extend_from_slice(&raw.to_le_bytes());
        // symbol pool at 32: "\0_malloc\0"
        data.push(0);
        data.extend_from_slice(b"_malloc\0");

        let loader = crate::loader::jit::make_test_loader("/t", vec![]);
        let (imports, starts) = parse_chained_imports(&loader, &data).unwrap();
        assert_eq!(starts, 40);
        assert_eq!(imports.len(), 1);
        assert_eq!(imports[0].lib_ordinal, 2);
        assert_eq!(imports[0].name, "_malloc");
        assert!(!imports[0].weak_import);
    }
}
