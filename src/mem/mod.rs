//! Bounded, offsettable views over a byte-addressable backing store.
//!
//! Everything above this layer — the object parser and the loader — reads and
//! writes through the [`Window`] trait only. A window covers a sub-range of a
//! backing store (an open file or a raw in-process allocation), keeps its own
//! cursor, and can spawn child windows over sub-ranges of itself. Both
//! backings share the exact same offset and bounds semantics, so parsing code
//! never needs to know which one it is walking.
//!
//! A window never owns its backing store. File windows share one handle, and
//! memory windows hold a reference-counted [`Arena`] handle; the arena alone
//! is responsible for deallocation.

use thiserror::Error;

pub mod file;
pub mod ram;

pub use file::{Endian, FileWindow};
pub use ram::{Arena, MemWindow};

/// Errors raised by the window layer. Bounds violations are always fatal to
/// the operation that caused them and propagate unchanged.
#[derive(Debug, Error)]
pub enum WindowError {
    #[error("not enough bytes left in window")]
    NotEnoughBytes,

    #[error("read crosses the window bounds")]
    ReadOutOfRange,

    #[error("write crosses the window bounds")]
    WriteOutOfRange,

    #[error("string data is not valid UTF-8")]
    InvalidString,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A bounded view over a backing store.
///
/// Implementations provide the raw primitives (`view`, `backing_read`,
/// `backing_write`); every higher-level operation is a provided method so the
/// cursor and bounds rules are identical across backings.
///
/// Layout: `total_size` is the full backing extent, `virtual_start` the
/// window's base offset into it, `virtual_size` the window extent, and
/// `virtual_offset` the cursor in `0..=virtual_size`. The invariant
/// `virtual_start + virtual_size <= total_size` holds for every window, and a
/// child window's range is fully contained in its parent's.
pub trait Window: Sized {
    /// Full extent of the backing store.
    fn total_size(&self) -> u64;

    /// Base offset of this window into the backing store.
    fn virtual_start(&self) -> u64;

    /// Extent of this window.
    fn virtual_size(&self) -> u64;

    /// Current cursor, relative to the window start.
    fn virtual_offset(&self) -> u64;

    /// Moves the cursor without bounds checking. Callers go through
    /// [`Window::set_offset`].
    fn set_offset_raw(&mut self, offset: u64);

    /// Creates a new window over `[real_offset, real_offset + size)` of the
    /// same backing store, cursor at zero.
    fn view(&self, real_offset: u64, size: u64) -> Result<Self, WindowError>;

    /// Reads `buf.len()` bytes at an absolute backing offset.
    fn backing_read(&mut self, real_offset: u64, buf: &mut [u8]) -> Result<(), WindowError>;

    /// Writes `data` at an absolute backing offset.
    fn backing_write(&mut self, real_offset: u64, data: &[u8]) -> Result<(), WindowError>;

    /// Whether integers read through this window arrive byte-reversed
    /// relative to the little-endian canonical form.
    fn reverse_integer_bytes(&self) -> bool {
        false
    }

    /// Cursor position as an absolute backing offset.
    fn real_offset(&self) -> u64 {
        self.virtual_start() + self.virtual_offset()
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), WindowError> {
        if offset > self.virtual_size() {
            return Err(WindowError::NotEnoughBytes);
        }
        self.set_offset_raw(offset);
        Ok(())
    }

    fn advance(&mut self, count: u64) -> Result<(), WindowError> {
        let offset = self
            .virtual_offset()
            .checked_add(count)
            .ok_or(WindowError::NotEnoughBytes)?;
        self.set_offset(offset)
    }

    fn unwind(&mut self, count: u64) -> Result<(), WindowError> {
        if count > self.virtual_offset() {
            return Err(WindowError::ReadOutOfRange);
        }
        self.set_offset_raw(self.virtual_offset() - count);
        Ok(())
    }

    /// Reads `count` raw bytes at the cursor and advances past them.
    fn read_bytes(&mut self, count: u64) -> Result<Vec<u8>, WindowError> {
        let end = self
            .virtual_offset()
            .checked_add(count)
            .ok_or(WindowError::NotEnoughBytes)?;
        if end > self.virtual_size() {
            return Err(WindowError::NotEnoughBytes);
        }
        let mut buf = vec![0u8; count as usize];
        self.backing_read(self.real_offset(), &mut buf)?;
        self.set_offset_raw(end);
        Ok(buf)
    }

    fn read_u8(&mut self) -> Result<u8, WindowError> {
        let bytes = self.read_integer_bytes(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> Result<u16, WindowError> {
        let bytes = self.read_integer_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, WindowError> {
        let bytes = self.read_integer_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, WindowError> {
        let bytes = self.read_integer_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Integer payload bytes in little-endian order, reversing them when the
    /// backing declares an alternate byte order.
    fn read_integer_bytes(&mut self, count: u64) -> Result<Vec<u8>, WindowError> {
        let mut bytes = self.read_bytes(count)?;
        if self.reverse_integer_bytes() {
            bytes.reverse();
        }
        Ok(bytes)
    }

    /// Reads a fixed-size string, trimming NUL padding.
    fn read_string(&mut self, count: u64) -> Result<String, WindowError> {
        let bytes = self.read_bytes(count)?;
        let text = std::str::from_utf8(&bytes).map_err(|_| WindowError::InvalidString)?;
        Ok(text.trim_matches('\0').to_string())
    }

    /// Reads bytes up to (not including) the next NUL.
    fn read_cstring(&mut self) -> Result<String, WindowError> {
        let mut bytes = Vec::new();
        loop {
            let next = self.read_u8()?;
            if next == 0 {
                break;
            }
            bytes.push(next);
        }
        String::from_utf8(bytes).map_err(|_| WindowError::InvalidString)
    }

    /// Writes raw bytes at the cursor and advances past them.
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), WindowError> {
        let end = self
            .virtual_offset()
            .checked_add(data.len() as u64)
            .ok_or(WindowError::WriteOutOfRange)?;
        if end > self.virtual_size() {
            return Err(WindowError::WriteOutOfRange);
        }
        self.backing_write(self.real_offset(), data)?;
        self.set_offset_raw(end);
        Ok(())
    }

    /// Writes raw bytes at an explicit window-relative offset. The cursor
    /// does not move.
    fn write_bytes_at(&mut self, offset: u64, data: &[u8]) -> Result<(), WindowError> {
        let end = offset
            .checked_add(data.len() as u64)
            .ok_or(WindowError::WriteOutOfRange)?;
        if end > self.virtual_size() {
            return Err(WindowError::WriteOutOfRange);
        }
        self.backing_write(self.virtual_start() + offset, data)
    }

    fn write_u32(&mut self, value: u32) -> Result<(), WindowError> {
        let mut bytes = value.to_le_bytes();
        if self.reverse_integer_bytes() {
            bytes.reverse();
        }
        self.write_bytes(&bytes)
    }

    fn write_u64(&mut self, value: u64) -> Result<(), WindowError> {
        let mut bytes = value.to_le_bytes();
        if self.reverse_integer_bytes() {
            bytes.reverse();
        }
        self.write_bytes(&bytes)
    }

    fn write_u64_at(&mut self, offset: u64, value: u64) -> Result<(), WindowError> {
        let mut bytes = value.to_le_bytes();
        if self.reverse_integer_bytes() {
            bytes.reverse();
        }
        self.write_bytes_at(offset, &bytes)
    }

    /// Spawns a child window at `offset` bytes past the cursor with an
    /// explicit size. The child's range must stay inside this window.
    fn child(&self, offset: u64, size: u64) -> Result<Self, WindowError> {
        let start = self
            .virtual_offset()
            .checked_add(offset)
            .ok_or(WindowError::ReadOutOfRange)?;
        let end = start.checked_add(size).ok_or(WindowError::ReadOutOfRange)?;
        if end > self.virtual_size() {
            return Err(WindowError::ReadOutOfRange);
        }
        self.view(self.real_offset() + offset, size)
    }

    /// Spawns a child window at `offset` bytes past the cursor, sized to the
    /// remainder of this window.
    fn child_from(&self, offset: u64) -> Result<Self, WindowError> {
        let start = self
            .virtual_offset()
            .checked_add(offset)
            .ok_or(WindowError::ReadOutOfRange)?;
        if start > self.virtual_size() {
            return Err(WindowError::ReadOutOfRange);
        }
        self.child(offset, self.virtual_size() - start)
    }

    /// A fresh window over this window's full range, cursor at zero.
    fn base_reader(&self) -> Result<Self, WindowError> {
        self.view(self.virtual_start(), self.virtual_size())
    }

    /// Renders `[from, to)` of the window as offset-annotated hex lines for
    /// trace logging. `to` is clamped to the window size.
    fn hex_dump(&self, from: u64, to: u64, width: u64) -> Result<String, WindowError> {
        let to = to.min(self.virtual_size());
        if from > to {
            return Err(WindowError::ReadOutOfRange);
        }
        let width = width.max(1);
        let mut reader = self.base_reader()?;
        reader.set_offset(from)?;
        let bytes = reader.read_bytes(to - from)?;

        let mut out = String::new();
        for (line, chunk) in bytes.chunks(width as usize).enumerate() {
            let relative = from + line as u64 * width;
            let real = self.virtual_start() + relative;
            let hex: String = chunk.iter().map(|b| format!("{b:02x} ")).collect();
            let printable: String = chunk
                .iter()
                .map(|&b| if (0x20..=0x7e).contains(&b) { b as char } else { '.' })
                .collect();
            out.push_str(&format!("{relative:08x}  {real:08x}  {hex:<48} {printable}\n"));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn ram(size: usize) -> MemWindow {
        MemWindow::alloc(size).unwrap()
    }

    #[test]
    fn child_real_offset_adds_up() {
        let parent = ram(64);
        let child = parent.child(8, 16).unwrap();
        assert_eq!(child.real_offset(), parent.real_offset() + 8);
        assert_eq!(child.virtual_size(), 16);

        let grandchild = child.child(4, 4).unwrap();
        assert_eq!(grandchild.real_offset(), parent.real_offset() + 12);
    }

    #[test]
    fn child_relative_to_cursor() {
        let mut parent = ram(64);
        parent.set_offset(10).unwrap();
        let child = parent.child(2, 4).unwrap();
        assert_eq!(child.virtual_start(), 12);
        assert_eq!(child.virtual_offset(), 0);
    }

    #[test]
    fn child_beyond_parent_remainder_fails() {
        let parent = ram(32);
        assert!(matches!(
            parent.child(16, 17),
            Err(WindowError::ReadOutOfRange)
        ));
        assert!(parent.child(16, 16).is_ok());
        assert!(parent.child_from(33).is_err());
    }

    #[test]
    fn cursor_bounds() {
        let mut window = ram(16);
        assert!(window.set_offset(16).is_ok());
        assert!(window.set_offset(17).is_err());
        window.set_offset(0).unwrap();
        assert!(window.advance(16).is_ok());
        assert!(window.advance(1).is_err());
        assert!(window.unwind(16).is_ok());
        assert!(window.unwind(1).is_err());
    }

    #[test]
    fn read_past_end_fails() {
        let mut window = ram(8);
        window.set_offset(4).unwrap();
        assert!(matches!(
            window.read_bytes(5),
            Err(WindowError::NotEnoughBytes)
        ));
    }

    #[test]
    fn write_at_offset_preserves_cursor() {
        let mut window = ram(32);
        window.set_offset(4).unwrap();
        window.write_u64_at(16, 0xdead_beef).unwrap();
        assert_eq!(window.virtual_offset(), 4);

        window.write_u64(0x1122_3344).unwrap();
        assert_eq!(window.virtual_offset(), 12);

        window.set_offset(16).unwrap();
        assert_eq!(window.read_u64().unwrap(), 0xdead_beef);
    }

    #[test]
    fn ram_round_trip() {
        let mut window = ram(16);
        let data = [1u8, 2, 3, 4, 5];
        window.write_bytes(&data).unwrap();
        window.set_offset(0).unwrap();
        assert_eq!(window.read_bytes(5).unwrap(), data);
    }

    #[test]
    fn file_round_trip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[0u8; 16]).unwrap();
        file.flush().unwrap();

        let mut window = FileWindow::open(file.path()).unwrap();
        let data = [9u8, 8, 7, 6];
        window.set_offset(4).unwrap();
        window.write_bytes(&data).unwrap();
        window.set_offset(4).unwrap();
        assert_eq!(window.read_bytes(4).unwrap(), data);
    }

    #[test]
    fn file_big_endian_integers() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&0x1234_5678u32.to_be_bytes()).unwrap();
        file.flush().unwrap();

        let mut le = FileWindow::open(file.path()).unwrap();
        assert_eq!(le.read_u32().unwrap(), 0x7856_3412);

        let mut be = FileWindow::open_with(file.path(), Endian::Big).unwrap();
        assert_eq!(be.read_u32().unwrap(), 0x1234_5678);

        // Children read little-endian regardless of the parent's byte order.
        let mut child = be.base_reader().unwrap();
        assert_eq!(child.read_u32().unwrap(), 0x7856_3412);
    }

    #[test]
    fn base_reader_rewinds_to_window_start() {
        let parent = ram(64);
        let mut child = parent.child(16, 32).unwrap();
        child.advance(8).unwrap();
        let base = child.base_reader().unwrap();
        assert_eq!(base.virtual_start(), 16);
        assert_eq!(base.virtual_size(), 32);
        assert_eq!(base.virtual_offset(), 0);
    }

    #[test]
    fn strings() {
        let mut window = ram(32);
        window.write_bytes(b"__TEXT\0\0\0\0\0\0\0\0\0\0").unwrap();
        window.write_bytes(b"_main\0trailing").unwrap();

        window.set_offset(0).unwrap();
        assert_eq!(window.read_string(16).unwrap(), "__TEXT");
        assert_eq!(window.read_cstring().unwrap(), "_main");
        assert_eq!(window.virtual_offset(), 22);
    }

    #[test]
    fn invalid_string_data() {
        let mut window = ram(4);
        window.write_bytes(&[0xff, 0xfe, 0x01, 0x00]).unwrap();
        window.set_offset(0).unwrap();
        assert!(matches!(
            window.read_string(4),
            Err(WindowError::InvalidString)
        ));
    }

    #[test]
    fn hex_dump_renders_offsets_and_ascii() {
        let mut window = ram(16);
        window.write_bytes(b"ABCDEFGHIJKLMNOP").unwrap();
        let dump = window.hex_dump(0, 64, 8).unwrap();
        let lines: Vec<&str> = dump.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("00000000"));
        assert!(lines[0].ends_with("ABCDEFGH"));
        assert!(lines[1].starts_with("00000008"));
    }
}
