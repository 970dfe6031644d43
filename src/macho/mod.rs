//! Mach-O object-file parsing.
//!
//! [`analyze`] decodes a file into one [`ObjectImage`] per architecture
//! slice: the fat header when present, then for each image the 8-word
//! header and the declared number of load commands. The cursor always
//! advances by exactly a command's declared size before the next command is
//! decoded, so partially understood command bodies never derail the walk.
//! Load commands are decoded only for the one architecture the loader
//! supports; foreign slices keep an empty command list.

use std::path::Path;

use thiserror::Error;
use tracing::{debug, debug_span, warn};

use crate::mem::{Endian, FileWindow, Window};

pub mod chained;
pub mod commands;
pub mod symtab;

pub use commands::{
    Bind, BuildTool, BuildToolVersion, BuildVersionCommand, ChainedFixupsCommand, DylibCommand,
    DylibKind, DysymtabCommand, EntryPointCommand, LinkeditDataCommand, LoadCommand, Platform,
    Rebase, Section64, Segment64, SymtabCommand, Version,
};
pub use symtab::{SymbolClass, SymbolEntry};

// Magic numbers
pub const MH_MAGIC: u32 = 0xfeedface; // 32-bit Mach-O
pub const MH_MAGIC_64: u32 = 0xfeedfacf; // 64-bit Mach-O
pub const FAT_MAGIC: u32 = 0xcafebabe; // Fat binary (big-endian)
pub const FAT_CIGAM: u32 = 0xbebafeca; // Fat binary (byte-reversed)

// CPU and file types
pub const CPU_TYPE_ARM64: u32 = 0x0100000c;
pub const CPU_TYPE_X86_64: u32 = 0x01000007;
pub const MH_EXECUTE: u32 = 0x2;
pub const MH_DYLIB: u32 = 0x6;

// Load command types
pub const LC_REQ_DYLD: u32 = 0x80000000;
pub const LC_SYMTAB: u32 = 0x2;
pub const LC_DYSYMTAB: u32 = 0xb;
pub const LC_LOAD_DYLIB: u32 = 0xc;
pub const LC_ID_DYLIB: u32 = 0xd;
pub const LC_LOAD_DYLINKER: u32 = 0xe;
pub const LC_SEGMENT_64: u32 = 0x19;
pub const LC_UUID: u32 = 0x1b;
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
pub const LC_FUNCTION_STARTS: u32 = 0x26;
pub const LC_DATA_IN_CODE: u32 = 0x29;
pub const LC_SOURCE_VERSION: u32 = 0x2a;
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
pub const LC_BUILD_VERSION: u32 = 0x32;
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;

// Chained fixup pointer formats
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;
pub const CHAINED_PAGE_START_NONE: u16 = 0xffff;

/// Errors for malformed or unsupported image contents. Always fatal to the
/// image being parsed.
#[derive(Debug, Error)]
pub enum ObjectFormatError {
    #[error("not a Mach-O file (magic {0:#010x})")]
    NotMachO(u32),

    #[error("unsupported build platform {0}")]
    UnsupportedPlatform(u32),

    #[error("unsupported build tool {0}")]
    UnsupportedTool(u32),

    #[error("chained-fixup symbol names are compressed (format {0})")]
    CompressedSymbols(u32),
}

/// Mach-O image header.
#[derive(Clone, Debug)]
pub struct ImageHeader {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: u32,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

/// Fat binary slice descriptor.
#[derive(Clone, Debug)]
pub struct FatArch {
    pub cputype: u32,
    pub cpusubtype: u32,
    pub offset: u32,
    pub size: u32,
    pub align: u32,
}

/// One parsed architecture-specific image.
#[derive(Clone, Debug)]
pub struct ObjectImage {
    pub header: ImageHeader,
    pub commands: Vec<LoadCommand>,
    pub name: String,
}

impl ObjectImage {
    pub fn is_executable(&self) -> bool {
        self.header.filetype == MH_EXECUTE
    }

    pub fn is_library(&self) -> bool {
        self.header.filetype == MH_DYLIB
    }

    pub fn is_arm64(&self) -> bool {
        self.header.cputype == CPU_TYPE_ARM64 && self.header.cpusubtype == 0
    }

    /// Segment commands in declaration order. Fixup segment indices refer to
    /// positions in this list.
    pub fn segments(&self) -> Vec<&Segment64> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::Segment64(segment) => Some(segment),
                _ => None,
            })
            .collect()
    }

    pub fn symtabs(&self) -> Vec<&SymtabCommand> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::Symtab(symtab) => Some(symtab),
                _ => None,
            })
            .collect()
    }

    pub fn chained_fixups(&self) -> Vec<&ChainedFixupsCommand> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::ChainedFixups(fixups) => Some(fixups),
                _ => None,
            })
            .collect()
    }

    /// Dependency declarations that form load edges: everything except the
    /// image's own install name.
    pub fn dependencies(&self) -> Vec<&DylibCommand> {
        self.commands
            .iter()
            .filter_map(|cmd| match cmd {
                LoadCommand::Dylib(dylib) if dylib.kind != DylibKind::SelfName => Some(dylib),
                _ => None,
            })
            .collect()
    }

    pub fn reexports(&self) -> Vec<&DylibCommand> {
        self.dependencies()
            .into_iter()
            .filter(|dylib| dylib.kind == DylibKind::Reexport)
            .collect()
    }

    pub fn entry_point(&self) -> Option<&EntryPointCommand> {
        self.commands.iter().find_map(|cmd| match cmd {
            LoadCommand::Main(main) => Some(main),
            _ => None,
        })
    }
}

/// Parses every architecture slice of the file at `path`. Each result pairs
/// the image with a raw window over its slice, positioned at the slice
/// start, for the loader to read section bytes through.
pub fn analyze(path: &Path) -> crate::Result<Vec<(FileWindow, ObjectImage)>> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let span = debug_span!("analyzer", file = %name);
    let _enter = span.enter();

    let mut reader = FileWindow::open(path)?;
    let magic = reader.read_u32()?;
    if magic == FAT_CIGAM {
        debug!("reopening as big-endian");
        reader = FileWindow::open_with(path, Endian::Big)?;
    }

    let magic = reader.read_u32()?;
    if magic != FAT_MAGIC {
        // A thin file: the whole backing is one image.
        let mut image_reader = reader.base_reader()?;
        let image = parse_image(&mut image_reader, &name)?;
        return Ok(vec![(image_reader.base_reader()?, image)]);
    }

    let arch_count = reader.read_u32()?;
    debug!(arch_count, "fat binary");
    let mut slices = Vec::with_capacity(arch_count as usize);
    for _ in 0..arch_count {
        slices.push(FatArch {
            cputype: reader.read_u32()?,
            cpusubtype: reader.read_u32()?,
            offset: reader.read_u32()?,
            size: reader.read_u32()?,
            align: reader.read_u32()?,
        });
    }

    let mut results = Vec::with_capacity(slices.len());
    for arch in &slices {
        debug!(
            cputype = format_args!("{:#x}", arch.cputype),
            offset = arch.offset,
            size = arch.size,
            "slice"
        );
        let mut slice_reader = reader.base_reader()?.child_from(arch.offset as u64)?;
        let image = parse_image(&mut slice_reader, &name)?;
        results.push((slice_reader.base_reader()?, image));
    }
    Ok(results)
}

/// Parses a single image from the start of `reader`.
pub fn parse_image<W: Window>(reader: &mut W, name: &str) -> crate::Result<ObjectImage> {
    let magic = reader.read_u32()?;
    if magic != MH_MAGIC_64 && magic != MH_MAGIC {
        return Err(ObjectFormatError::NotMachO(magic).into());
    }
    let header = ImageHeader {
        magic,
        cputype: reader.read_u32()?,
        cpusubtype: reader.read_u32()?,
        filetype: reader.read_u32()?,
        ncmds: reader.read_u32()?,
        sizeofcmds: reader.read_u32()?,
        flags: reader.read_u32()?,
        reserved: reader.read_u32()?,
    };

    let mut commands = Vec::new();
    if header.cputype == CPU_TYPE_ARM64 {
        for _ in 0..header.ncmds {
            commands.push(read_command(reader)?);
        }
    } else {
        debug!(
            cputype = format_args!("{:#x}", header.cputype),
            "foreign architecture, skipping load commands"
        );
    }

    debug!(
        name,
        filetype = header.filetype,
        commands = commands.len(),
        "parsed image"
    );
    Ok(ObjectImage {
        header,
        commands,
        name: name.to_string(),
    })
}

/// Decodes the command at the cursor and leaves the cursor exactly one
/// declared command size further, whatever the body decode consumed.
fn read_command<W: Window>(reader: &mut W) -> crate::Result<LoadCommand> {
    let mut cmd_reader = reader.child_from(0)?;
    let cmd = cmd_reader.read_u32()?;
    let cmdsize = cmd_reader.read_u32()?;
    reader.advance(cmdsize as u64)?;
    cmd_reader.set_offset(0)?;

    let command = match cmd {
        LC_SEGMENT_64 => read_segment(&mut cmd_reader)?,
        LC_LOAD_DYLIB | LC_ID_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB => {
            read_dylib(&mut cmd_reader)?
        }
        LC_BUILD_VERSION => read_build_version(&mut cmd_reader)?,
        LC_DYLD_CHAINED_FIXUPS => {
            LoadCommand::ChainedFixups(chained::read_chained_fixups(&mut cmd_reader, reader)?)
        }
        LC_SYMTAB => read_symtab(&mut cmd_reader, reader)?,
        LC_DYSYMTAB => read_dysymtab(&mut cmd_reader, reader)?,
        LC_LOAD_DYLINKER => read_dylinker(&mut cmd_reader)?,
        LC_UUID => {
            cmd_reader.advance(8)?;
            let bytes = cmd_reader.read_bytes(16)?;
            let mut uuid = [0u8; 16];
            uuid.copy_from_slice(&bytes);
            LoadCommand::Uuid(uuid)
        }
        LC_MAIN => {
            cmd_reader.advance(8)?;
            LoadCommand::Main(EntryPointCommand {
                entryoff: cmd_reader.read_u64()?,
                stacksize: cmd_reader.read_u64()?,
            })
        }
        LC_RPATH => {
            cmd_reader.advance(8)?;
            let offset = cmd_reader.read_u32()?;
            cmd_reader.set_offset(offset as u64)?;
            let path = cmd_reader.read_string(cmdsize as u64 - offset as u64)?;
            LoadCommand::Rpath { path }
        }
        LC_FUNCTION_STARTS | LC_DATA_IN_CODE | LC_CODE_SIGNATURE | LC_DYLD_EXPORTS_TRIE => {
            read_linkedit_data(cmd, &mut cmd_reader)?
        }
        LC_SOURCE_VERSION | LC_ENCRYPTION_INFO_64 | LC_SEGMENT_SPLIT_INFO => {
            debug!("load command {cmd:#x} kept opaque");
            LoadCommand::Unknown { cmd, cmdsize }
        }
        _ => {
            warn!("unknown load command {cmd:#x}, kept opaque");
            LoadCommand::Unknown { cmd, cmdsize }
        }
    };
    Ok(command)
}

fn read_segment<W: Window>(reader: &mut W) -> crate::Result<LoadCommand> {
    reader.advance(8)?;
    let segname = reader.read_string(16)?;
    let vmaddr = reader.read_u64()?;
    let vmsize = reader.read_u64()?;
    let fileoff = reader.read_u64()?;
    let filesize = reader.read_u64()?;
    let maxprot = reader.read_u32()?;
    let initprot = reader.read_u32()?;
    let nsects = reader.read_u32()?;
    let flags = reader.read_u32()?;

    let mut sections = Vec::with_capacity(nsects as usize);
    for _ in 0..nsects {
        sections.push(Section64 {
            sectname: reader.read_string(16)?,
            segname: reader.read_string(16)?,
            addr: reader.read_u64()?,
            size: reader.read_u64()?,
            offset: reader.read_u32()?,
            align: reader.read_u32()?,
            reloff: reader.read_u32()?,
            nreloc: reader.read_u32()?,
            flags: reader.read_u32()?,
            reserved1: reader.read_u32()?,
            reserved2: reader.read_u32()?,
            reserved3: reader.read_u32()?,
        });
    }

    Ok(LoadCommand::Segment64(Segment64 {
        segname,
        vmaddr,
        vmsize,
        fileoff,
        filesize,
        maxprot,
        initprot,
        flags,
        sections,
    }))
}

fn read_dylib<W: Window>(reader: &mut W) -> crate::Result<LoadCommand> {
    let cmd = reader.read_u32()?;
    let cmdsize = reader.read_u32()?;
    let string_offset = reader.read_u32()?;
    let timestamp = reader.read_u32()?;
    let current_version = reader.read_u32()?;
    let compatibility_version = reader.read_u32()?;

    // The bytes after the fixed fields hold the path.
    reader.set_offset(string_offset as u64)?;
    let path = reader.read_string(cmdsize as u64 - string_offset as u64)?;

    let kind = match cmd {
        LC_ID_DYLIB => DylibKind::SelfName,
        LC_LOAD_WEAK_DYLIB => DylibKind::Weak,
        LC_REEXPORT_DYLIB => DylibKind::Reexport,
        _ => DylibKind::Load,
    };
    debug!(path = %path, ?kind, "dependency");
    Ok(LoadCommand::Dylib(DylibCommand {
        kind,
        path,
        timestamp,
        current_version,
        compatibility_version,
    }))
}

fn read_build_version<W: Window>(reader: &mut W) -> crate::Result<LoadCommand> {
    reader.advance(8)?;
    let platform_raw = reader.read_u32()?;
    let platform = Platform::from_raw(platform_raw)
        .ok_or(ObjectFormatError::UnsupportedPlatform(platform_raw))?;
    let minos = Version(reader.read_u32()?);
    let sdk = Version(reader.read_u32()?);
    let ntools = reader.read_u32()?;

    let mut tools = Vec::with_capacity(ntools as usize);
    for _ in 0..ntools {
        let tool_raw = reader.read_u32()?;
        let tool =
            BuildTool::from_raw(tool_raw).ok_or(ObjectFormatError::UnsupportedTool(tool_raw))?;
        tools.push(BuildToolVersion {
            tool,
            version: Version(reader.read_u32()?),
        });
    }

    debug!(?platform, minos = %minos, sdk = %sdk, "build version");
    Ok(LoadCommand::BuildVersion(BuildVersionCommand {
        platform,
        minos,
        sdk,
        tools,
    }))
}

fn read_dylinker<W: Window>(reader: &mut W) -> crate::Result<LoadCommand> {
    let _cmd = reader.read_u32()?;
    let cmdsize = reader.read_u32()?;
    let offset = reader.read_u32()?;
    reader.set_offset(offset as u64)?;
    let path = reader.read_string(cmdsize as u64 - offset as u64)?;
    Ok(LoadCommand::Dylinker { path })
}

/// Symbol and string tables live at absolute offsets in the image, not in
/// the command body, so they are read through fresh image-base windows.
fn read_symtab<W: Window>(cmd_reader: &mut W, image: &W) -> crate::Result<LoadCommand> {
    cmd_reader.advance(8)?;
    let symoff = cmd_reader.read_u32()?;
    let nsyms = cmd_reader.read_u32()?;
    let stroff = cmd_reader.read_u32()?;
    let strsize = cmd_reader.read_u32()?;

    let mut entry_reader = image.base_reader()?.child_from(symoff as u64)?;
    let mut symbols = Vec::with_capacity(nsyms as usize);
    for _ in 0..nsyms {
        let strtab_index = entry_reader.read_u32()?;
        let type_byte = entry_reader.read_u8()?;
        let section_number = entry_reader.read_u8()?;
        let desc = entry_reader.read_u16()?;
        let value = entry_reader.read_u64()?;

        let mut name_reader = image
            .base_reader()?
            .child_from(stroff as u64 + strtab_index as u64)?;
        let name = name_reader.read_cstring()?;

        let entry = SymbolEntry {
            strtab_index,
            type_byte,
            section_number,
            desc,
            value,
            name,
        };
        tracing::trace!(name = %entry.name, class = ?entry.classify(), "symbol");
        symbols.push(entry);
    }

    Ok(LoadCommand::Symtab(SymtabCommand {
        symoff,
        nsyms,
        stroff,
        strsize,
        symbols,
    }))
}

fn read_dysymtab<W: Window>(cmd_reader: &mut W, image: &W) -> crate::Result<LoadCommand> {
    cmd_reader.advance(8)?;
    let ilocalsym = cmd_reader.read_u32()?;
    let nlocalsym = cmd_reader.read_u32()?;
    let iextdefsym = cmd_reader.read_u32()?;
    let nextdefsym = cmd_reader.read_u32()?;
    let iundefsym = cmd_reader.read_u32()?;
    let nundefsym = cmd_reader.read_u32()?;
    let tocoff = cmd_reader.read_u32()?;
    let ntoc = cmd_reader.read_u32()?;
    let modtaboff = cmd_reader.read_u32()?;
    let nmodtab = cmd_reader.read_u32()?;
    let extrefsymoff = cmd_reader.read_u32()?;
    let nextrefsyms = cmd_reader.read_u32()?;
    let indirectsymoff = cmd_reader.read_u32()?;
    let nindirectsyms = cmd_reader.read_u32()?;
    let extreloff = cmd_reader.read_u32()?;
    let nextrel = cmd_reader.read_u32()?;
    let locreloff = cmd_reader.read_u32()?;
    let nlocrel = cmd_reader.read_u32()?;

    let mut indirect_reader = image.base_reader()?.child_from(indirectsymoff as u64)?;
    let mut indirect_symbols = Vec::with_capacity(nindirectsyms as usize);
    for _ in 0..nindirectsyms {
        indirect_symbols.push(indirect_reader.read_u32()?);
    }

    Ok(LoadCommand::Dysymtab(DysymtabCommand {
        ilocalsym,
        nlocalsym,
        iextdefsym,
        nextdefsym,
        iundefsym,
        nundefsym,
        tocoff,
        ntoc,
        modtaboff,
        nmodtab,
        extrefsymoff,
        nextrefsyms,
        indirectsymoff,
        nindirectsyms,
        extreloff,
        nextrel,
        locreloff,
        nlocrel,
        indirect_symbols,
    }))
}

fn read_linkedit_data<W: Window>(cmd: u32, reader: &mut W) -> crate::Result<LoadCommand> {
    reader.advance(8)?;
    let data = LinkeditDataCommand {
        dataoff: reader.read_u32()?,
        datasize: reader.read_u32()?,
    };
    Ok(match cmd {
        LC_FUNCTION_STARTS => LoadCommand::FunctionStarts(data),
        LC_DATA_IN_CODE => LoadCommand::DataInCode(data),
        LC_CODE_SIGNATURE => LoadCommand::CodeSignature(data),
        _ => LoadCommand::ExportsTrie(data),
    })
}
