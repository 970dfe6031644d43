//! The loader: turns a parsed image into executable memory.
//!
//! Loading runs a strict four-step sequence per image: allocate a zeroed
//! region and copy section bytes in, fill the symbol table (recursively
//! bringing dependencies to the same state), patch chained-fixup binds and
//! rebases directly into the region, and finally restrict the region to
//! read+execute. Dependencies are pre-loaded into memory bottom-up before
//! any symbol resolution starts, so by the time an image's fixups are
//! applied every transitive dependency already has its symbols filled.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, info_span, trace, warn};

use crate::macho::{analyze, ObjectImage, SymbolClass};
use crate::mem::{Arena, MemWindow, Window};

pub mod registry;

pub use registry::Registry;

/// Executables are linked assuming this fixed virtual load address; it is
/// subtracted from their segment, section and symbol addresses to get the
/// in-process offset. Libraries carry addresses relative to their own base.
pub const EXECUTABLE_LOAD_BIAS: u64 = 0x1_0000_0000;

/// The zero-filled guard segment is never mapped.
const GUARD_SEGMENT: &str = "__PAGEZERO";

/// Structural failures that abort a load session.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("executable has no entry-point command")]
    MissingEntryPoint,

    #[error("dependency {0} is not loaded")]
    MissingDependency(String),

    #[error("cannot derive a library name from {0:?}")]
    BadDependencyPath(String),

    #[error("no slice for the supported architecture in {0}")]
    NoMatchingArch(String),

    #[error("memory protection failed with errno {0}")]
    ProtectionFailed(i32),
}

/// Loader configuration. Dependency paths resolve against one root
/// directory.
#[derive(Clone, Debug)]
pub struct LoaderConfig {
    pub deps_root: PathBuf,
}

impl Default for LoaderConfig {
    fn default() -> LoaderConfig {
        LoaderConfig {
            deps_root: PathBuf::from("."),
        }
    }
}

/// An image mapped into process memory. Mutated while symbols and fixups
/// are being resolved, frozen once protection is finalized.
#[derive(Clone, Debug)]
pub struct LoadedImage {
    pub name: String,
    /// Window over the whole allocated region.
    pub ram: MemWindow,
    /// One window per section, in section-number order across all segments.
    pub sections: Vec<MemWindow>,
    /// Symbol name to absolute address.
    pub symbols: HashMap<String, u64>,
    pub image: ObjectImage,
    /// Absolute entry address; executables only.
    pub entry: Option<usize>,
}

impl LoadedImage {
    pub fn base_address(&self) -> u64 {
        self.ram.base_address() as u64
    }
}

/// One load session. Holds the builtins table supplied by the caller and
/// the session registry; dependency loads re-enter through the same
/// session.
pub struct Loader<'a> {
    config: LoaderConfig,
    /// Native implementations for binds with no in-image definition,
    /// keyed by symbol name.
    builtins: &'a HashMap<String, u64>,
    registry: &'a mut Registry,
}

impl<'a> Loader<'a> {
    pub fn new(
        config: LoaderConfig,
        builtins: &'a HashMap<String, u64>,
        registry: &'a mut Registry,
    ) -> Loader<'a> {
        Loader {
            config,
            builtins,
            registry,
        }
    }

    /// Loads `image` and everything it depends on, returning the root image
    /// ready to run.
    pub fn load<W: Window>(&mut self, image: ObjectImage, reader: &mut W) -> crate::Result<LoadedImage> {
        let span = info_span!("loader", image = %image.name);
        let _enter = span.enter();

        let root = self.load_into_memory(image, reader)?;

        if root.image.is_library() {
            // The canonical copy lives in the registry; operate by name.
            let name = root.name.clone();
            drop(root);
            let mut visited = HashSet::new();
            self.fill_symbols_by_name(&name, &mut visited)?;
            let mut visited = HashSet::new();
            self.apply_fixups_by_name(&name, &mut visited)?;
            self.protect_all()?;
            let loaded = self
                .registry
                .get(&name)
                .ok_or_else(|| LoaderError::MissingDependency(name.clone()))?;
            return Ok(loaded.clone());
        }

        let mut root = root;
        let mut visited = HashSet::new();
        self.fill_symbols(&mut root, &mut visited)?;
        let mut visited = HashSet::new();
        self.apply_fixups(&mut root, &mut visited)?;
        Self::protect(&root)?;
        self.protect_all()?;

        let entry = root
            .image
            .entry_point()
            .ok_or(LoaderError::MissingEntryPoint)?;
        root.entry = Some((root.ram.base_address() as usize).wrapping_add(entry.entryoff as usize));
        info!(entry = format_args!("{:#x}", root.entry.unwrap_or(0)), "image ready");
        Ok(root)
    }

    /// Step 1: allocate, copy sections, and bring every dependency file to
    /// the same state. No symbol resolution happens here.
    fn load_into_memory<W: Window>(
        &mut self,
        image: ObjectImage,
        reader: &mut W,
    ) -> crate::Result<LoadedImage> {
        let bias = if image.is_executable() {
            EXECUTABLE_LOAD_BIAS
        } else {
            0
        };

        let total_vm: u64 = image
            .segments()
            .iter()
            .filter(|segment| !segment.segname.contains(GUARD_SEGMENT))
            .map(|segment| segment.vmsize)
            .sum();
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let aligned = (total_vm + page_size - 1) & !(page_size - 1);
        debug!(total_vm, aligned, "allocating image region");

        let arena = Arena::alloc(aligned as usize)?;
        let ram = MemWindow::new(arena);

        let mut sections = Vec::new();
        for segment in image.segments() {
            debug!(segment = %segment.segname, "loading segment");
            if segment.segname.contains(GUARD_SEGMENT) {
                // Guard pages are never mapped; keep section numbering
                // intact with empty placeholders.
                for _ in &segment.sections {
                    sections.push(MemWindow::alloc(0)?);
                }
                continue;
            }

            let segment_base = segment.vmaddr.wrapping_sub(bias);
            let segment_window = ram.base_reader()?.child(segment_base, segment.vmsize)?;
            for section in &segment.sections {
                debug!(
                    section = %section.sectname,
                    offset = format_args!("{:#x}", section.offset),
                    size = section.size,
                    "copying section"
                );
                reader.set_offset(section.offset as u64)?;
                let contents = reader.read_bytes(section.size)?;

                let section_base = section.addr.wrapping_sub(bias);
                let mut section_window = segment_window
                    .base_reader()?
                    .child(section_base.wrapping_sub(segment_window.real_offset()), section.size)?;
                section_window.write_bytes(&contents)?;
                if tracing::enabled!(tracing::Level::TRACE) {
                    trace!(
                        "section {} contents:\n{}",
                        section.sectname,
                        section_window.hex_dump(0, 64, 16)?
                    );
                }
                sections.push(section_window.base_reader()?);
            }
        }

        let loaded = LoadedImage {
            name: image.name.clone(),
            ram: ram.base_reader()?,
            sections,
            symbols: HashMap::new(),
            image,
            entry: None,
        };
        if loaded.image.is_library() {
            self.registry.insert(loaded.name.clone(), loaded.clone());
        }

        // Pre-load dependency files before anything gets resolved.
        let dependency_paths: Vec<String> = loaded
            .image
            .dependencies()
            .iter()
            .map(|dylib| dylib.path.clone())
            .collect();
        for declared in dependency_paths {
            let dep_name = library_name(&declared)?;
            if self.registry.contains(&dep_name) {
                info!("library {dep_name} is already loaded");
                continue;
            }
            // Declared paths name install locations on the original system;
            // only the last component matters under the dependency root.
            let path = self.config.deps_root.join(&dep_name);
            debug!(path = %path.display(), "loading dependency");
            let results = analyze(&path)?;
            let Some((mut dep_reader, dep_image)) =
                results.into_iter().find(|(_, image)| image.is_arm64())
            else {
                return Err(LoaderError::NoMatchingArch(dep_name).into());
            };
            self.load_into_memory(dep_image, &mut dep_reader)?;
        }

        Ok(loaded)
    }

    /// Step 2: build the image's symbol table and bring every dependency to
    /// the same state. The visited set breaks dependency and re-export
    /// cycles.
    fn fill_symbols(
        &mut self,
        loaded: &mut LoadedImage,
        visited: &mut HashSet<String>,
    ) -> crate::Result<()> {
        if !visited.insert(loaded.name.clone()) {
            return Ok(());
        }

        let mut table = self.collect_own_symbols(loaded);

        // Re-exported dependencies fold their whole table into ours once
        // they are resolved themselves.
        let reexport_paths: Vec<String> = loaded
            .image
            .reexports()
            .iter()
            .map(|dylib| dylib.path.clone())
            .collect();
        for declared in reexport_paths {
            let dep_name = library_name(&declared)?;
            self.fill_symbols_by_name(&dep_name, visited)?;
            let dependency = self
                .registry
                .get(&dep_name)
                .ok_or_else(|| LoaderError::MissingDependency(dep_name.clone()))?;
            debug!(
                from = %dep_name,
                symbols = dependency.symbols.len(),
                "folding re-exported symbols"
            );
            table.extend(dependency.symbols.clone());
        }

        let dependency_paths: Vec<String> = loaded
            .image
            .dependencies()
            .iter()
            .map(|dylib| dylib.path.clone())
            .collect();
        for declared in dependency_paths {
            let dep_name = library_name(&declared)?;
            self.fill_symbols_by_name(&dep_name, visited)?;
        }

        loaded.symbols = table;
        Ok(())
    }

    fn fill_symbols_by_name(
        &mut self,
        name: &str,
        visited: &mut HashSet<String>,
    ) -> crate::Result<()> {
        if visited.contains(name) {
            return Ok(());
        }
        let mut image = self
            .registry
            .take(name)
            .ok_or_else(|| LoaderError::MissingDependency(name.to_string()))?;
        let result = self.fill_symbols(&mut image, visited);
        self.registry.insert(name.to_string(), image);
        result
    }

    /// The image's own exported symbols, as absolute addresses.
    fn collect_own_symbols(&self, loaded: &LoadedImage) -> HashMap<String, u64> {
        let bias = if loaded.image.is_executable() {
            EXECUTABLE_LOAD_BIAS
        } else {
            0
        };
        let mut table = HashMap::new();
        for symtab in loaded.image.symtabs() {
            for entry in &symtab.symbols {
                match entry.classify() {
                    SymbolClass::Undefined => {
                        warn!(
                            symbol = %entry.name,
                            "needs resolution from a dependency"
                        );
                    }
                    SymbolClass::PublicExternal | SymbolClass::PrivateExternal => {
                        if entry.section_number == 0 {
                            warn!(symbol = %entry.name, "defined symbol without a section");
                            continue;
                        }
                        let Some(section) = loaded.sections.get(entry.section_number as usize - 1)
                        else {
                            warn!(
                                symbol = %entry.name,
                                section = entry.section_number,
                                "section number out of range"
                            );
                            continue;
                        };
                        let address = (section.base_address() as u64)
                            .wrapping_add(entry.value)
                            .wrapping_sub(bias);
                        trace!(
                            symbol = %entry.name,
                            address = format_args!("{address:#x}"),
                            "export"
                        );
                        table.insert(entry.name.clone(), address);
                    }
                    SymbolClass::DebugStab => {
                        trace!(symbol = %entry.name, "debug stab");
                    }
                    SymbolClass::Absolute => {
                        debug!(
                            symbol = %entry.name,
                            value = format_args!("{:#x}", entry.value),
                            "absolute symbol"
                        );
                    }
                }
            }
        }
        table
    }

    /// Step 3: apply binds and rebases, dependencies first so every symbol
    /// they expose is already placed.
    fn apply_fixups(
        &mut self,
        loaded: &mut LoadedImage,
        visited: &mut HashSet<String>,
    ) -> crate::Result<()> {
        if !visited.insert(loaded.name.clone()) {
            return Ok(());
        }

        let dependency_paths: Vec<String> = loaded
            .image
            .dependencies()
            .iter()
            .map(|dylib| dylib.path.clone())
            .collect();
        for declared in dependency_paths {
            let dep_name = library_name(&declared)?;
            debug!("{} depends on {dep_name}", loaded.name);
            self.apply_fixups_by_name(&dep_name, visited)?;
        }

        self.resolve_fixups(loaded)
    }

    fn apply_fixups_by_name(
        &mut self,
        name: &str,
        visited: &mut HashSet<String>,
    ) -> crate::Result<()> {
        if visited.contains(name) {
            return Ok(());
        }
        let mut image = self
            .registry
            .take(name)
            .ok_or_else(|| LoaderError::MissingDependency(name.to_string()))?;
        let result = self.apply_fixups(&mut image, visited);
        self.registry.insert(name.to_string(), image);
        result
    }

    fn resolve_fixups(&self, loaded: &mut LoadedImage) -> crate::Result<()> {
        info!("resolving fixups for {}", loaded.name);
        let base = loaded.ram.base_address() as u64;
        let LoadedImage {
            ref mut ram,
            ref image,
            ref symbols,
            ref name,
            ..
        } = *loaded;

        for fixups in image.chained_fixups() {
            for bind in &fixups.binds {
                let Some(segment_base) = segment_base_offset(image, bind.segment_index) else {
                    warn!(segment = bind.segment_index, "bind names an unknown segment");
                    continue;
                };
                let cell = segment_base + bind.offset_in_segment;
                if let Some(&address) = self.builtins.get(&bind.symbol_name) {
                    debug!(
                        symbol = %bind.symbol_name,
                        address = format_args!("{address:#x}"),
                        "bound to builtin"
                    );
                    ram.write_u64_at(cell, address)?;
                } else if let Some((library, address)) =
                    self.registry.lookup_symbol(&bind.symbol_name)
                {
                    debug!(
                        symbol = %bind.symbol_name,
                        address = format_args!("{address:#x}"),
                        library,
                        "bound"
                    );
                    ram.write_u64_at(cell, address)?;
                } else if let Some(&address) = symbols.get(&bind.symbol_name) {
                    debug!(
                        symbol = %bind.symbol_name,
                        address = format_args!("{address:#x}"),
                        "bound to own export"
                    );
                    ram.write_u64_at(cell, address)?;
                } else {
                    warn!(
                        symbol = %bind.symbol_name,
                        image = %name,
                        "no address found, leaving bind unresolved"
                    );
                }
            }

            for rebase in &fixups.rebases {
                let Some(segment_base) = segment_base_offset(image, rebase.segment_index) else {
                    warn!(
                        segment = rebase.segment_index,
                        "rebase names an unknown segment"
                    );
                    continue;
                };
                let value = base.wrapping_add(rebase.target);
                trace!(
                    offset = rebase.offset_in_segment,
                    value = format_args!("{value:#x}"),
                    "rebase"
                );
                ram.write_u64_at(segment_base + rebase.offset_in_segment, value)?;
            }
        }
        Ok(())
    }

    /// Step 4: memory stays writable until every fixup has been patched,
    /// then the whole region drops to read+execute.
    fn protect(loaded: &LoadedImage) -> crate::Result<()> {
        let len = loaded.ram.virtual_size() as usize;
        if len == 0 {
            return Ok(());
        }
        debug!(image = %loaded.name, len, "finalizing protection");
        let result = unsafe {
            libc::mprotect(
                loaded.ram.base_address() as *mut libc::c_void,
                len,
                libc::PROT_READ | libc::PROT_EXEC,
            )
        };
        if result != 0 {
            let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            return Err(LoaderError::ProtectionFailed(errno).into());
        }
        Ok(())
    }

    fn protect_all(&self) -> crate::Result<()> {
        for image in self.registry.images() {
            Self::protect(image)?;
        }
        Ok(())
    }
}

/// In-process offset of a segment's base within its image's region.
fn segment_base_offset(image: &ObjectImage, index: u32) -> Option<u64> {
    let segments = image.segments();
    let segment = segments.get(index as usize)?;
    let bias = if image.is_executable() {
        EXECUTABLE_LOAD_BIAS
    } else {
        0
    };
    Some(segment.vmaddr.wrapping_sub(bias))
}

/// Registry key for a declared dependency path: its last path component.
fn library_name(declared: &str) -> Result<String, LoaderError> {
    Path::new(declared)
        .file_name()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .ok_or_else(|| LoaderError::BadDependencyPath(declared.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn library_names() {
        assert_eq!(
            library_name("/usr/lib/libfoo.dylib").unwrap(),
            "libfoo.dylib"
        );
        assert_eq!(library_name("libbar.dylib").unwrap(), "libbar.dylib");
        assert!(library_name("").is_err());
    }
}
