//! File-backed windows.
//!
//! A [`FileWindow`] seeks the underlying file to the absolute backing offset
//! before every read or write, so sibling windows can interleave operations
//! freely. All windows spawned from one file share a single handle.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use super::{Window, WindowError};

/// Byte order for integer reads. The canonical form is little-endian; a
/// big-endian window reverses integer payload bytes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

/// A bounded view over an open file.
pub struct FileWindow {
    file: Rc<RefCell<File>>,
    path: PathBuf,
    endian: Endian,
    total_size: u64,
    virtual_start: u64,
    virtual_size: u64,
    virtual_offset: u64,
}

impl FileWindow {
    /// Opens a window over the whole file, reading integers little-endian.
    pub fn open(path: &Path) -> std::io::Result<FileWindow> {
        Self::open_with(path, Endian::Little)
    }

    /// Opens a window over the whole file with an explicit byte order.
    pub fn open_with(path: &Path, endian: Endian) -> std::io::Result<FileWindow> {
        // Prefer a writable handle; fall back to read-only for files we may
        // not write, where only reads will ever be issued.
        let file = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::PermissionDenied => File::open(path)?,
            Err(err) => return Err(err),
        };
        let total_size = file.metadata()?.len();
        debug!(path = %path.display(), size = total_size, ?endian, "opened file window");
        Ok(FileWindow {
            file: Rc::new(RefCell::new(file)),
            path: path.to_path_buf(),
            endian,
            total_size,
            virtual_start: 0,
            virtual_size: total_size,
            virtual_offset: 0,
        })
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Window for FileWindow {
    fn total_size(&self) -> u64 {
        self.total_size
    }

    fn virtual_start(&self) -> u64 {
        self.virtual_start
    }

    fn virtual_size(&self) -> u64 {
        self.virtual_size
    }

    fn virtual_offset(&self) -> u64 {
        self.virtual_offset
    }

    fn set_offset_raw(&mut self, offset: u64) {
        self.virtual_offset = offset;
    }

    fn view(&self, real_offset: u64, size: u64) -> Result<FileWindow, WindowError> {
        let end = real_offset
            .checked_add(size)
            .ok_or(WindowError::ReadOutOfRange)?;
        if end > self.total_size {
            return Err(WindowError::ReadOutOfRange);
        }
        Ok(FileWindow {
            file: Rc::clone(&self.file),
            path: self.path.clone(),
            // Derived windows always read the canonical little-endian form.
            endian: Endian::Little,
            total_size: self.total_size,
            virtual_start: real_offset,
            virtual_size: size,
            virtual_offset: 0,
        })
    }

    fn backing_read(&mut self, real_offset: u64, buf: &mut [u8]) -> Result<(), WindowError> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(real_offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn backing_write(&mut self, real_offset: u64, data: &[u8]) -> Result<(), WindowError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut file = self.file.borrow_mut();
        file.seek(SeekFrom::Start(real_offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn reverse_integer_bytes(&self) -> bool {
        self.endian == Endian::Big
    }
}
