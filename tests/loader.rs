//! End-to-end loader scenarios over synthetic images.
//!
//! The builder below assembles minimal but well-formed Mach-O files byte by
//! byte: a dynamic library exporting one symbol, and an executable that
//! depends on it through a chained-fixup bind. Everything runs against
//! temporary files, with a fresh registry per test.

use std::collections::HashMap;
use std::path::Path;

use skein::loader::{Loader, LoaderConfig, LoaderError, Registry};
use skein::macho::{analyze, parse_image, LoadCommand};
use skein::mem::{MemWindow, Window};

const MH_MAGIC_64: u32 = 0xfeedfacf;
const CPU_ARM64: u32 = 0x0100000c;
const CPU_X86_64: u32 = 0x01000007;
const MH_EXECUTE: u32 = 0x2;
const MH_DYLIB: u32 = 0x6;
const LC_SEGMENT_64: u32 = 0x19;
const LC_SYMTAB: u32 = 0x2;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_MAIN: u32 = 0x80000028;
const LC_DYLD_CHAINED_FIXUPS: u32 = 0x80000034;

const BIAS: u64 = 0x1_0000_0000;

fn p16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn p32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn p64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn name16(buf: &mut Vec<u8>, name: &str) {
    let mut bytes = [0u8; 16];
    bytes[..name.len()].copy_from_slice(name.as_bytes());
    buf.extend_from_slice(&bytes);
}

fn write_at(file: &mut Vec<u8>, offset: usize, bytes: &[u8]) {
    file[offset..offset + bytes.len()].copy_from_slice(bytes);
}

fn mach_header(cputype: u32, filetype: u32, ncmds: u32, sizeofcmds: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    p32(&mut buf, MH_MAGIC_64);
    p32(&mut buf, cputype);
    p32(&mut buf, 0); // cpusubtype
    p32(&mut buf, filetype);
    p32(&mut buf, ncmds);
    p32(&mut buf, sizeofcmds);
    p32(&mut buf, 0); // flags
    p32(&mut buf, 0); // reserved
    buf
}

struct SectionSpec {
    name: &'static str,
    addr: u64,
    size: u64,
    offset: u32,
}

fn segment_cmd(name: &str, vmaddr: u64, vmsize: u64, fileoff: u64, filesize: u64, sections: &[SectionSpec]) -> Vec<u8> {
    let mut buf = Vec::new();
    p32(&mut buf, LC_SEGMENT_64);
    p32(&mut buf, 72 + 80 * sections.len() as u32);
    name16(&mut buf, name);
    p64(&mut buf, vmaddr);
    p64(&mut buf, vmsize);
    p64(&mut buf, fileoff);
    p64(&mut buf, filesize);
    p32(&mut buf, 0x7); // maxprot rwx
    p32(&mut buf, 0x5); // initprot r-x
    p32(&mut buf, sections.len() as u32);
    p32(&mut buf, 0); // flags
    for section in sections {
        name16(&mut buf, section.name);
        name16(&mut buf, name);
        p64(&mut buf, section.addr);
        p64(&mut buf, section.size);
        p32(&mut buf, section.offset);
        p32(&mut buf, 3); // align
        p32(&mut buf, 0); // reloff
        p32(&mut buf, 0); // nreloc
        p32(&mut buf, 0); // flags
        p32(&mut buf, 0);
        p32(&mut buf, 0);
        p32(&mut buf, 0);
    }
    buf
}

fn symtab_cmd(symoff: u32, nsyms: u32, stroff: u32, strsize: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    p32(&mut buf, LC_SYMTAB);
    p32(&mut buf, 24);
    p32(&mut buf, symoff);
    p32(&mut buf, nsyms);
    p32(&mut buf, stroff);
    p32(&mut buf, strsize);
    buf
}

fn dylib_cmd(path: &str) -> Vec<u8> {
    let padded = (path.len() + 1).next_multiple_of(8);
    let mut buf = Vec::new();
    p32(&mut buf, LC_LOAD_DYLIB);
    p32(&mut buf, 24 + padded as u32);
    p32(&mut buf, 24); // string offset
    p32(&mut buf, 0); // timestamp
    p32(&mut buf, 0x0001_0000); // current version
    p32(&mut buf, 0x0001_0000); // compatibility version
    buf.extend_from_slice(path.as_bytes());
    buf.resize(24 + padded, 0);
    buf
}

fn main_cmd(entryoff: u64) -> Vec<u8> {
    let mut buf = Vec::new();
    p32(&mut buf, LC_MAIN);
    p32(&mut buf, 24);
    p64(&mut buf, entryoff);
    p64(&mut buf, 0); // stacksize
    buf
}

fn chained_cmd(dataoff: u32, datasize: u32) -> Vec<u8> {
    let mut buf = Vec::new();
    p32(&mut buf, LC_DYLD_CHAINED_FIXUPS);
    p32(&mut buf, 16);
    p32(&mut buf, dataoff);
    p32(&mut buf, datasize);
    buf
}

struct SegStarts {
    page_size: u16,
    pointer_format: u16,
    segment_offset: u64,
    page_starts: Vec<u16>,
}

/// Assembles an LC_DYLD_CHAINED_FIXUPS payload: header, segment-start
/// table, imports table and symbol string pool. Chain records themselves
/// live in the segment data, not in this blob.
fn fixups_blob(seg_infos: &[Option<SegStarts>], imports: &[(u32, &str)]) -> Vec<u8> {
    let mut pool = vec![0u8];
    let mut name_offsets = Vec::new();
    for (_, name) in imports {
        name_offsets.push(pool.len() as u32);
        pool.extend_from_slice(name.as_bytes());
        pool.push(0);
    }

    let mut starts = Vec::new();
    p32(&mut starts, seg_infos.len() as u32);
    let table_pos = starts.len();
    for _ in seg_infos {
        p32(&mut starts, 0);
    }
    let mut seg_offsets = Vec::new();
    for info in seg_infos {
        let Some(info) = info else {
            seg_offsets.push(0u32);
            continue;
        };
        while starts.len() % 4 != 0 {
            starts.push(0);
        }
        seg_offsets.push(starts.len() as u32);
        p32(&mut starts, 24 + 2 * info.page_starts.len() as u32); // size
        p16(&mut starts, info.page_size);
        p16(&mut starts, info.pointer_format);
        p64(&mut starts, info.segment_offset);
        p32(&mut starts, 0); // max_valid_pointer
        p16(&mut starts, info.page_starts.len() as u16);
        for &page_start in &info.page_starts {
            p16(&mut starts, page_start);
        }
    }
    for (i, offset) in seg_offsets.iter().enumerate() {
        starts[table_pos + 4 * i..table_pos + 4 * i + 4].copy_from_slice(&offset.to_le_bytes());
    }
    while starts.len() % 4 != 0 {
        starts.push(0);
    }

    let starts_offset = 28u32;
    let imports_offset = starts_offset + starts.len() as u32;
    let symbols_offset = imports_offset + 4 * imports.len() as u32;

    let mut blob = Vec::new();
    p32(&mut blob, 0); // version
    p32(&mut blob, starts_offset);
    p32(&mut blob, imports_offset);
    p32(&mut blob, symbols_offset);
    p32(&mut blob, imports.len() as u32);
    p32(&mut blob, 1); // imports format
    p32(&mut blob, 0); // symbols format: uncompressed
    blob.extend_from_slice(&starts);
    for (i, &(ordinal, _)) in imports.iter().enumerate() {
        p32(&mut blob, ordinal | (name_offsets[i] << 9));
    }
    blob.extend_from_slice(&pool);
    blob
}

/// A dylib exporting `_foo` at section offset 0x10: one __TEXT segment with
/// a 0x20-byte __text section at file offset 0x400, a one-entry symbol
/// table at 0x500 and its string pool at 0x600.
fn build_library() -> Vec<u8> {
    let mut file = vec![0u8; 0x1000];

    let seg = segment_cmd(
        "__TEXT",
        0,
        0x1000,
        0,
        0x1000,
        &[SectionSpec { name: "__text", addr: 0, size: 0x20, offset: 0x400 }],
    );
    let sym = symtab_cmd(0x500, 1, 0x600, 0x10);
    let sizeofcmds = (seg.len() + sym.len()) as u32;
    let mut image = mach_header(CPU_ARM64, MH_DYLIB, 2, sizeofcmds);
    image.extend_from_slice(&seg);
    image.extend_from_slice(&sym);
    write_at(&mut file, 0, &image);

    write_at(&mut file, 0x400, &[0xd6u8; 0x20]);

    // nlist_64 for _foo: N_SECT | N_EXT, section 1, value 0x10
    let mut entry = Vec::new();
    p32(&mut entry, 1); // string-table index
    entry.push(0x0f);
    entry.push(1);
    p16(&mut entry, 0);
    p64(&mut entry, 0x10);
    write_at(&mut file, 0x500, &entry);
    write_at(&mut file, 0x600, b"\0_foo\0");

    file
}

struct ExecOpts {
    with_main: bool,
    with_data: bool,
    deps: Vec<&'static str>,
    /// Chain page starts plus the records to place at file offset 0x1000.
    fixups: Option<(Vec<u16>, Vec<u64>)>,
}

impl Default for ExecOpts {
    fn default() -> ExecOpts {
        ExecOpts {
            with_main: true,
            with_data: true,
            deps: Vec::new(),
            fixups: None,
        }
    }
}

/// An executable with the authored-base layout: __PAGEZERO guard, a __TEXT
/// segment with a 0x20-byte __text section at file offset 0x800 (the entry
/// point) and, unless disabled, a __DATA_CONST segment whose __got section
/// at file offset 0x1000 receives the fixup chain.
fn build_executable(opts: ExecOpts) -> Vec<u8> {
    let mut file = vec![0u8; 0x2000];
    let mut cmds: Vec<Vec<u8>> = Vec::new();

    cmds.push(segment_cmd("__PAGEZERO", 0, BIAS, 0, 0, &[]));
    cmds.push(segment_cmd(
        "__TEXT",
        BIAS,
        0x1000,
        0,
        0x1000,
        &[SectionSpec { name: "__text", addr: BIAS + 0x800, size: 0x20, offset: 0x800 }],
    ));
    if opts.with_data {
        cmds.push(segment_cmd(
            "__DATA_CONST",
            BIAS + 0x1000,
            0x1000,
            0x1000,
            0x1000,
            &[SectionSpec { name: "__got", addr: BIAS + 0x1000, size: 0x10, offset: 0x1000 }],
        ));
    }
    if opts.with_main {
        cmds.push(main_cmd(0x800));
    }
    for dep in &opts.deps {
        cmds.push(dylib_cmd(dep));
    }
    if let Some((page_starts, records)) = &opts.fixups {
        let blob = fixups_blob(
            &[
                None,
                None,
                Some(SegStarts {
                    page_size: 0x1000,
                    pointer_format: 6, // DYLD_CHAINED_PTR_64_OFFSET
                    segment_offset: 0x1000,
                    page_starts: page_starts.clone(),
                }),
            ],
            &[(1, "_foo")],
        );
        cmds.push(chained_cmd(0x1800, blob.len() as u32));
        write_at(&mut file, 0x1800, &blob);
        let mut cells = Vec::new();
        for &record in records {
            p64(&mut cells, record);
        }
        write_at(&mut file, 0x1000, &cells);
    }

    let ncmds = cmds.len() as u32;
    let sizeofcmds: usize = cmds.iter().map(|cmd| cmd.len()).sum();
    let mut image = mach_header(CPU_ARM64, MH_EXECUTE, ncmds, sizeofcmds as u32);
    for cmd in cmds {
        image.extend_from_slice(&cmd);
    }
    assert!(image.len() <= 0x800, "commands overflow the header area");
    write_at(&mut file, 0, &image);
    write_at(&mut file, 0x800, &[0xaau8; 0x20]);
    file
}

/// A rebase record for pointer format 6: target offset from the load base,
/// next counted in 4-byte strides.
fn rebase_record(target: u64, high8: u64, next: u64) -> u64 {
    (next << 51) | (high8 << 36) | target
}

/// A bind record: ordinal into the imports table, next in 4-byte strides.
fn bind_record(ordinal: u64, next: u64) -> u64 {
    (1 << 63) | (next << 51) | ordinal
}

fn default_fixups() -> (Vec<u16>, Vec<u64>) {
    // One chain of two records at page offset 0: a rebase pointing back at
    // the entry, then the bind for _foo eight bytes later.
    (vec![0], vec![rebase_record(0x800, 0, 2), bind_record(0, 0)])
}

fn load_executable(
    dir: &Path,
    opts: ExecOpts,
    builtins: &HashMap<String, u64>,
    registry: &mut Registry,
) -> skein::Result<skein::LoadedImage> {
    let path = dir.join("prog");
    std::fs::write(&path, build_executable(opts)).unwrap();
    let results = analyze(&path)?;
    let (mut reader, image) = results
        .into_iter()
        .find(|(_, image)| image.is_arm64())
        .expect("arm64 image");
    let config = LoaderConfig { deps_root: dir.to_path_buf() };
    let mut loader = Loader::new(config, builtins, registry);
    loader.load(image, &mut reader)
}

#[test]
fn bind_resolves_through_dependency() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("libfoo.dylib"), build_library()).unwrap();

    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let loaded = load_executable(
        dir.path(),
        ExecOpts {
            deps: vec!["/usr/lib/libfoo.dylib"],
            fixups: Some(default_fixups()),
            ..ExecOpts::default()
        },
        &builtins,
        &mut registry,
    )
    .unwrap();

    let library = registry.get("libfoo.dylib").expect("dependency loaded");
    let foo = library.symbols["_foo"];
    // _foo sits 0x10 into the library's first section, which starts at its
    // region base.
    assert_eq!(foo, library.base_address() + 0x10);

    // The got cell holds the resolved absolute address, not the raw
    // section-relative value.
    let mut ram = loaded.ram.base_reader().unwrap();
    ram.set_offset(0x1008).unwrap();
    assert_eq!(ram.read_u64().unwrap(), foo);

    // The rebase cell was slid by the executable's actual base.
    ram.set_offset(0x1000).unwrap();
    assert_eq!(ram.read_u64().unwrap(), loaded.base_address() + 0x800);

    // Entry is the allocated base plus the declared file offset.
    assert_eq!(loaded.entry.unwrap(), loaded.base_address() as usize + 0x800);
}

#[test]
fn builtins_win_over_the_registry() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("libfoo.dylib"), build_library()).unwrap();

    let mut builtins = HashMap::new();
    builtins.insert("_foo".to_string(), 0x5123_4568u64);
    let mut registry = Registry::new();
    let loaded = load_executable(
        dir.path(),
        ExecOpts {
            deps: vec!["/usr/lib/libfoo.dylib"],
            fixups: Some(default_fixups()),
            ..ExecOpts::default()
        },
        &builtins,
        &mut registry,
    )
    .unwrap();

    let library = registry.get("libfoo.dylib").unwrap();
    let mut ram = loaded.ram.base_reader().unwrap();
    ram.set_offset(0x1008).unwrap();
    let bound = ram.read_u64().unwrap();
    assert_eq!(bound, 0x5123_4568);
    assert_ne!(bound, library.symbols["_foo"]);
}

#[test]
fn guard_segment_contributes_no_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let loaded = load_executable(
        dir.path(),
        ExecOpts { with_data: false, ..ExecOpts::default() },
        &builtins,
        &mut registry,
    )
    .unwrap();

    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
    assert!(loaded.ram.virtual_size() >= 0x1000);
    assert_eq!(loaded.ram.virtual_size() % page_size, 0);

    // Only the __text bytes were copied; everything below them is still
    // zero.
    let mut ram = loaded.ram.base_reader().unwrap();
    assert!(ram.read_bytes(0x800).unwrap().iter().all(|&b| b == 0));
    assert_eq!(ram.read_bytes(0x20).unwrap(), vec![0xaa; 0x20]);
}

#[test]
fn dependencies_load_once() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("libfoo.dylib"), build_library()).unwrap();

    let builtins = HashMap::new();
    let mut registry = Registry::new();
    load_executable(
        dir.path(),
        ExecOpts {
            deps: vec!["/usr/lib/libfoo.dylib", "libfoo.dylib"],
            fixups: Some(default_fixups()),
            ..ExecOpts::default()
        },
        &builtins,
        &mut registry,
    )
    .unwrap();

    assert_eq!(registry.len(), 1);
    assert!(registry.get("libfoo.dylib").is_some());
}

#[test]
fn library_loads_directly() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("libfoo.dylib");
    std::fs::write(&path, build_library()).unwrap();

    let results = analyze(&path).unwrap();
    let (mut reader, image) = results
        .into_iter()
        .find(|(_, image)| image.is_arm64())
        .unwrap();
    assert!(image.is_library());

    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let config = LoaderConfig { deps_root: dir.path().to_path_buf() };
    let mut loader = Loader::new(config, &builtins, &mut registry);
    let loaded = loader.load(image, &mut reader).unwrap();

    assert!(loaded.entry.is_none());
    assert_eq!(loaded.symbols["_foo"], loaded.base_address() + 0x10);
    assert_eq!(registry.len(), 1);
}

#[test]
fn missing_entry_point_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let err = load_executable(
        dir.path(),
        ExecOpts { with_main: false, with_data: false, ..ExecOpts::default() },
        &builtins,
        &mut registry,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        skein::Error::Loader(LoaderError::MissingEntryPoint)
    ));
}

#[test]
fn missing_dependency_file_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let builtins = HashMap::new();
    let mut registry = Registry::new();
    let err = load_executable(
        dir.path(),
        ExecOpts { deps: vec!["libnope.dylib"], ..ExecOpts::default() },
        &builtins,
        &mut registry,
    )
    .unwrap_err();
    assert!(matches!(err, skein::Error::Io(_)));
}

#[test]
fn fat_container_yields_one_image_per_slice() {
    let dir = tempfile::tempdir().unwrap();
    let arm = build_library();
    let x86 = mach_header(CPU_X86_64, MH_DYLIB, 0, 0);

    let mut file = Vec::new();
    file.extend_from_slice(&0xcafebabeu32.to_be_bytes());
    file.extend_from_slice(&2u32.to_be_bytes());
    for (cputype, offset, size) in [
        (CPU_ARM64, 0x1000u32, arm.len() as u32),
        (CPU_X86_64, 0x3000u32, x86.len() as u32),
    ] {
        file.extend_from_slice(&cputype.to_be_bytes());
        file.extend_from_slice(&0u32.to_be_bytes());
        file.extend_from_slice(&offset.to_be_bytes());
        file.extend_from_slice(&size.to_be_bytes());
        file.extend_from_slice(&12u32.to_be_bytes());
    }
    file.resize(0x1000, 0);
    file.extend_from_slice(&arm);
    file.resize(0x3000, 0);
    file.extend_from_slice(&x86);

    let path = dir.path().join("fat.dylib");
    std::fs::write(&path, &file).unwrap();

    let results = analyze(&path).unwrap();
    assert_eq!(results.len(), 2);

    let arm_image = &results[0].1;
    assert!(arm_image.is_arm64());
    assert_eq!(arm_image.commands.len(), 2);
    assert_eq!(arm_image.symtabs()[0].symbols[0].name, "_foo");

    let x86_image = &results[1].1;
    assert!(!x86_image.is_arm64());
    assert!(x86_image.commands.is_empty());
}

#[test]
fn command_walk_always_advances_by_declared_size() {
    // An opaque command with a body the parser never decodes sits between
    // the segment and the entry point; the walk must still land on every
    // following command.
    let seg = segment_cmd(
        "__TEXT",
        0,
        0x1000,
        0,
        0x1000,
        &[SectionSpec { name: "__text", addr: 0, size: 0x20, offset: 0x400 }],
    );
    let mut unknown = Vec::new();
    p32(&mut unknown, 0x99);
    p32(&mut unknown, 16);
    p64(&mut unknown, 0xdead_dead_dead_dead);
    let main = main_cmd(0x400);

    let sizeofcmds = (seg.len() + unknown.len() + main.len()) as u32;
    let mut image = mach_header(CPU_ARM64, MH_EXECUTE, 3, sizeofcmds);
    image.extend_from_slice(&seg);
    image.extend_from_slice(&unknown);
    image.extend_from_slice(&main);
    image.resize(0x1000, 0);

    let mut window = MemWindow::from_bytes(&image).unwrap();
    let parsed = parse_image(&mut window, "synthetic").unwrap();
    assert_eq!(parsed.commands.len(), 3);
    assert_eq!(parsed.segments().len(), 1);
    assert_eq!(parsed.segments()[0].sections.len(), 1);
    assert!(matches!(
        parsed.commands[1],
        LoadCommand::Unknown { cmd: 0x99, cmdsize: 16 }
    ));
    assert_eq!(parsed.entry_point().unwrap().entryoff, 0x400);
}

#[test]
fn chained_fixups_decode() {
    let bytes = build_executable(ExecOpts {
        deps: vec!["libfoo.dylib"],
        fixups: Some((vec![0], vec![rebase_record(0x123456, 0xab, 2), bind_record(0, 0)])),
        ..ExecOpts::default()
    });
    let mut window = MemWindow::from_bytes(&bytes).unwrap();
    let parsed = parse_image(&mut window, "synthetic").unwrap();

    let fixups = parsed.chained_fixups()[0];
    assert_eq!(fixups.rebases.len(), 1);
    assert_eq!(fixups.binds.len(), 1);

    let rebase = &fixups.rebases[0];
    assert_eq!(rebase.segment_index, 2);
    assert_eq!(rebase.offset_in_segment, 0);
    // Format 6 folds high8 into the target before the slide is added.
    assert_eq!(rebase.target, (0xab << 36) | 0x123456);

    let bind = &fixups.binds[0];
    assert_eq!(bind.segment_index, 2);
    assert_eq!(bind.offset_in_segment, 8);
    assert_eq!(bind.symbol_name, "_foo");
    assert_eq!(bind.lib_ordinal, 1);
}

#[test]
fn sentinel_page_produces_no_fixups() {
    let bytes = build_executable(ExecOpts {
        fixups: Some((vec![0xffff], Vec::new())),
        ..ExecOpts::default()
    });
    let mut window = MemWindow::from_bytes(&bytes).unwrap();
    let parsed = parse_image(&mut window, "synthetic").unwrap();

    let fixups = parsed.chained_fixups()[0];
    assert!(fixups.rebases.is_empty());
    assert!(fixups.binds.is_empty());
}

#[test]
fn out_of_range_bind_ordinal_is_skipped() {
    // Ordinal 7 with a single-entry imports table: the bind is dropped, the
    // chain keeps walking and the image still parses.
    let bytes = build_executable(ExecOpts {
        fixups: Some((vec![0], vec![bind_record(7, 2), bind_record(0, 0)])),
        ..ExecOpts::default()
    });
    let mut window = MemWindow::from_bytes(&bytes).unwrap();
    let parsed = parse_image(&mut window, "synthetic").unwrap();

    let fixups = parsed.chained_fixups()[0];
    assert_eq!(fixups.binds.len(), 1);
    assert_eq!(fixups.binds[0].offset_in_segment, 8);
}
