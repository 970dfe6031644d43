//! Memory-backed windows.
//!
//! An [`Arena`] owns one page-aligned anonymous mapping obtained from the
//! operating system's `mmap` system call; it is the single owner of the
//! region and unmaps it on drop. A [`MemWindow`] is a non-owning view into an
//! arena, carrying only a reference-counted handle plus its range and cursor,
//! so views can be spawned and dropped freely without ever touching the
//! allocation itself.

use std::rc::Rc;

use tracing::debug;

use super::{Window, WindowError};

/// A page-aligned anonymous memory region. The loader maps images into
/// arenas and later restricts their protection in place, so the region is
/// created readable and writable.
#[derive(Debug)]
pub struct Arena {
    base: *mut u8,
    size: usize,
}

impl Arena {
    /// Allocates a zeroed region of `size` bytes. A zero-size arena maps
    /// nothing and yields a null base.
    pub fn alloc(size: usize) -> Result<Rc<Arena>, WindowError> {
        if size == 0 {
            return Ok(Rc::new(Arena {
                base: std::ptr::null_mut(),
                size: 0,
            }));
        }
        let base = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(std::io::Error::last_os_error().into());
        }
        debug!(size, base = ?base, "allocated arena");
        Ok(Rc::new(Arena {
            base: base as *mut u8,
            size,
        }))
    }

    /// Start address of the region.
    pub fn base_address(&self) -> *mut u8 {
        self.base
    }

    /// Region size in bytes.
    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl Drop for Arena {
    fn drop(&mut self) {
        if self.size > 0 {
            unsafe {
                libc::munmap(self.base as *mut libc::c_void, self.size);
            }
        }
    }
}

/// A bounded view into an [`Arena`], addressed by pointer arithmetic.
#[derive(Clone, Debug)]
pub struct MemWindow {
    arena: Rc<Arena>,
    total_size: u64,
    virtual_start: u64,
    virtual_size: u64,
    virtual_offset: u64,
}

impl MemWindow {
    /// A window over an arena's full extent.
    pub fn new(arena: Rc<Arena>) -> MemWindow {
        let total_size = arena.len() as u64;
        MemWindow {
            arena,
            total_size,
            virtual_start: 0,
            virtual_size: total_size,
            virtual_offset: 0,
        }
    }

    /// Allocates a fresh zeroed arena and returns a window over it.
    pub fn alloc(size: usize) -> Result<MemWindow, WindowError> {
        Ok(MemWindow::new(Arena::alloc(size)?))
    }

    /// Allocates an arena holding a copy of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<MemWindow, WindowError> {
        let mut window = MemWindow::alloc(data.len())?;
        window.write_bytes(data)?;
        window.set_offset(0)?;
        Ok(window)
    }

    /// Absolute address of the window start.
    pub fn base_address(&self) -> *mut u8 {
        // A zero-size arena has a null base; no window over it can read or
        // write, so the dangling address is never dereferenced.
        unsafe { self.arena.base_address().add(self.virtual_start as usize) }
    }

    /// The owning arena handle.
    pub fn arena(&self) -> &Rc<Arena> {
        &self.arena
    }
}

impl Window for MemWindow {
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

    fn view(&self, real_offset: u64, size: u64) -> Result<MemWindow, WindowError> {
        let end = real_offset
            .checked_add(size)
            .ok_or(WindowError::ReadOutOfRange)?;
        if end > self.total_size {
            return Err(WindowError::ReadOutOfRange);
        }
        Ok(MemWindow {
            arena: Rc::clone(&self.arena),
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
        debug_assert!(real_offset as usize + buf.len() <= self.arena.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.arena.base_address().add(real_offset as usize),
                buf.as_mut_ptr(),
                buf.len(),
            );
        }
        Ok(())
    }

    fn backing_write(&mut self, real_offset: u64, data: &[u8]) -> Result<(), WindowError> {
        if data.is_empty() {
            return Ok(());
        }
        debug_assert!(real_offset as usize + data.len() <= self.arena.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.arena.base_address().add(real_offset as usize),
                data.len(),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_size_arena() {
        let window = MemWindow::alloc(0).unwrap();
        assert_eq!(window.virtual_size(), 0);
        assert!(window.arena().is_empty());
    }

    #[test]
    fn arena_starts_zeroed() {
        let mut window = MemWindow::alloc(4096).unwrap();
        assert!(window.read_bytes(4096).unwrap().iter().all(|&b| b == 0));
    }

    #[test]
    fn views_share_one_arena() {
        let parent = MemWindow::alloc(64).unwrap();
        let child = parent.child(16, 8).unwrap();
        assert_eq!(Rc::strong_count(parent.arena()), 2);
        assert_eq!(child.base_address() as usize, parent.base_address() as usize + 16);
    }

    #[test]
    fn from_bytes_copies() {
        let mut window = MemWindow::from_bytes(&[0xAA, 0xBB, 0xCC]).unwrap();
        assert_eq!(window.read_bytes(3).unwrap(), vec![0xAA, 0xBB, 0xCC]);
    }
}
