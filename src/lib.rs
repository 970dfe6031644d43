//! Skein - a Mach-O parser and minimal in-process dynamic loader.
//!
//! Skein decodes a Mach-O binary (thin or fat/universal), builds an
//! in-memory model of its load commands, and then plays dynamic loader:
//! it allocates process memory, copies segments into place, builds
//! per-image symbol tables, recursively resolves the image's declared
//! dependencies, patches chained-fixup rebase and bind records directly
//! into the allocated memory, and finally restricts the region to
//! read+execute so the image is ready to run.
//!
//! # Modules
//!
//! - [`mem`] - bounded windows over files and raw memory
//! - [`macho`] - object-file parsing, symbol tables, chained fixups
//! - [`loader`] - memory layout, symbol resolution, fixups, protection
//! - [`vm`] - the execution-component interface
//!
//! # Error Handling
//!
//! All operations use the consolidated [`Error`] type, which wraps the
//! layer-specific error enums (window bounds, object format, loader
//! structure, I/O).

pub mod loader;
pub mod macho;
pub mod mem;
pub mod vm;

/// Consolidated error type for all skein operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("window error: {0}")]
    Window(#[from] mem::WindowError),

    #[error("object format error: {0}")]
    ObjectFormat(#[from] macho::ObjectFormatError),

    #[error("loader error: {0}")]
    Loader(#[from] loader::LoaderError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = core::result::Result<T, Error>;

pub use loader::{LoadedImage, Loader, LoaderConfig, LoaderError, Registry, EXECUTABLE_LOAD_BIAS};
pub use macho::{analyze, ObjectFormatError, ObjectImage};
pub use mem::{Arena, Endian, FileWindow, MemWindow, Window, WindowError};
pub use vm::ExecutionEngine;
