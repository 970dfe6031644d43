//! Load-command model.
//!
//! Every load command decodes into one variant of [`LoadCommand`]; anything
//! the parser does not understand is preserved as [`LoadCommand::Unknown`]
//! with its type and declared size, so the command stream stays walkable
//! when new command kinds appear.

use std::fmt;

/// 64-bit section within a segment.
#[derive(Clone, Debug)]
pub struct Section64 {
    pub sectname: String,
    pub segname: String,
    /// Memory address of this section.
    pub addr: u64,
    /// Size in bytes.
    pub size: u64,
    /// File offset of the section contents.
    pub offset: u32,
    /// Alignment as a power of two.
    pub align: u32,
    pub reloff: u32,
    pub nreloc: u32,
    pub flags: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
}

/// 64-bit segment load command, sections included.
#[derive(Clone, Debug)]
pub struct Segment64 {
    pub segname: String,
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    /// Amount to map from the file.
    pub filesize: u64,
    /// Maximum VM protection (VM_PROT_* bits).
    pub maxprot: u32,
    /// Initial VM protection.
    pub initprot: u32,
    pub flags: u32,
    pub sections: Vec<Section64>,
}

/// Symbol-table command with the entries already decoded through the string
/// pool.
#[derive(Clone, Debug)]
pub struct SymtabCommand {
    pub symoff: u32,
    pub nsyms: u32,
    pub stroff: u32,
    pub strsize: u32,
    pub symbols: Vec<super::symtab::SymbolEntry>,
}

/// Dynamic symbol-table command. The index/count pairs slice the plain
/// symbol table; the indirect list is decoded, the rest is carried as-is.
#[derive(Clone, Debug)]
pub struct DysymtabCommand {
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
    pub indirect_symbols: Vec<u32>,
}

/// How an image relates to a declared dependency.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DylibKind {
    /// Ordinary load-time dependency.
    Load,
    /// The image's own install name.
    SelfName,
    /// Dependency that may be absent at load time.
    Weak,
    /// Dependency whose symbol table is forwarded as this image's own.
    Reexport,
}

/// Dependency declaration.
#[derive(Clone, Debug)]
pub struct DylibCommand {
    pub kind: DylibKind,
    pub path: String,
    pub timestamp: u32,
    pub current_version: u32,
    pub compatibility_version: u32,
}

/// Platform a build-version command targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Platform {
    MacOs,
    Ios,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
}

impl Platform {
    pub fn from_raw(raw: u32) -> Option<Platform> {
        match raw {
            1 => Some(Platform::MacOs),
            2 => Some(Platform::Ios),
            3 => Some(Platform::TvOs),
            4 => Some(Platform::WatchOs),
            5 => Some(Platform::BridgeOs),
            6 => Some(Platform::MacCatalyst),
            7 => Some(Platform::IosSimulator),
            8 => Some(Platform::TvOsSimulator),
            9 => Some(Platform::WatchOsSimulator),
            10 => Some(Platform::DriverKit),
            _ => None,
        }
    }
}

/// Tool recorded in a build-version command.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildTool {
    Clang,
    Swift,
    Ld,
}

impl BuildTool {
    pub fn from_raw(raw: u32) -> Option<BuildTool> {
        match raw {
            1 => Some(BuildTool::Clang),
            2 => Some(BuildTool::Swift),
            3 => Some(BuildTool::Ld),
            _ => None,
        }
    }
}

/// X.Y.Z version encoded in nibbles as xxxx.yy.zz.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Version(pub u32);

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}",
            (self.0 >> 16) & 0xffff,
            (self.0 >> 8) & 0xff,
            self.0 & 0xff
        )
    }
}

#[derive(Clone, Debug)]
pub struct BuildToolVersion {
    pub tool: BuildTool,
    pub version: Version,
}

/// Minimum OS and SDK an image was built against.
#[derive(Clone, Debug)]
pub struct BuildVersionCommand {
    pub platform: Platform,
    pub minos: Version,
    pub sdk: Version,
    pub tools: Vec<BuildToolVersion>,
}

/// File offset of the entry instruction and the requested stack size.
#[derive(Clone, Debug)]
pub struct EntryPointCommand {
    pub entryoff: u64,
    pub stacksize: u64,
}

/// Offset and size of a blob in the link-edit segment. The payload is not
/// interpreted by the loader.
#[derive(Clone, Debug)]
pub struct LinkeditDataCommand {
    pub dataoff: u32,
    pub datasize: u32,
}

/// One address that needs adjusting for the image's actual load address.
#[derive(Clone, Debug)]
pub struct Rebase {
    /// Index into the ordered segment command list.
    pub segment_index: u32,
    /// Byte offset of the pointer cell within that segment.
    pub offset_in_segment: u64,
    /// Raw target still assuming the authored load address.
    pub target: u64,
}

/// One address that must resolve to an externally defined symbol.
#[derive(Clone, Debug)]
pub struct Bind {
    pub segment_index: u32,
    pub offset_in_segment: u64,
    /// Index into the dependency command list; 0 means the image itself.
    pub lib_ordinal: u32,
    pub weak: bool,
    pub symbol_name: String,
}

/// Chained-fixups command, decoded into the flat rebase and bind lists the
/// loader consumes. The raw chain encoding never leaves the parser.
#[derive(Clone, Debug)]
pub struct ChainedFixupsCommand {
    pub dataoff: u32,
    pub datasize: u32,
    pub rebases: Vec<Rebase>,
    pub binds: Vec<Bind>,
}

/// A decoded load command.
#[derive(Clone, Debug)]
pub enum LoadCommand {
    Segment64(Segment64),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    Dylib(DylibCommand),
    ChainedFixups(ChainedFixupsCommand),
    BuildVersion(BuildVersionCommand),
    Main(EntryPointCommand),
    Dylinker { path: String },
    Uuid([u8; 16]),
    Rpath { path: String },
    FunctionStarts(LinkeditDataCommand),
    DataInCode(LinkeditDataCommand),
    CodeSignature(LinkeditDataCommand),
    ExportsTrie(LinkeditDataCommand),
    /// Unrecognized or intentionally opaque command, preserved for forward
    /// compatibility.
    Unknown { cmd: u32, cmdsize: u32 },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_nibbles() {
        assert_eq!(Version(0x000d0200).to_string(), "13.2.0");
        assert_eq!(Version(0x000e0103).to_string(), "14.1.3");
        assert_eq!(Version(0).to_string(), "0.0.0");
    }

    #[test]
    fn platform_codes() {
        assert_eq!(Platform::from_raw(1), Some(Platform::MacOs));
        assert_eq!(Platform::from_raw(10), Some(Platform::DriverKit));
        assert_eq!(Platform::from_raw(11), None);
        assert_eq!(BuildTool::from_raw(3), Some(BuildTool::Ld));
        assert_eq!(BuildTool::from_raw(4), None);
    }
}
