//! Positional I/O over the source archive.
//!
//! The block compression workers all read from the same source NCA, so the
//! reader must not carry a shared cursor. [`ReadAt`] mirrors the positional
//! read model: every read names its absolute offset, and `&R` is enough to
//! read from any thread.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};

/// Align down to a power-of-two boundary for AES operations.
pub const fn align_down(value: u64, align: u64) -> u64 {
    let inv_mask = align - 1;
    value & !inv_mask
}

/// Align up to a power-of-two boundary for AES operations.
pub const fn align_up(value: usize, align: usize) -> usize {
    let inv_mask = align - 1;
    (value + inv_mask) & !inv_mask
}

/// Cursor-free reads at absolute offsets.
pub trait ReadAt {
    /// Read up to `buf.len()` bytes at `offset`. Returns the number of bytes
    /// read; 0 means end of input.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Fill `buf` completely from `offset` or fail with `UnexpectedEof`.
    fn read_exact_at(&self, mut buf: &mut [u8], mut offset: u64) -> io::Result<()> {
        while !buf.is_empty() {
            match self.read_at(buf, offset) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "failed to fill whole buffer",
                    ));
                }
                Ok(n) => {
                    let rest = buf;
                    buf = &mut rest[n..];
                    offset += n as u64;
                }
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl ReadAt for File {
    #[cfg(unix)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::unix::fs::FileExt::read_at(self, buf, offset)
    }

    #[cfg(windows)]
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        std::os::windows::fs::FileExt::seek_read(self, buf, offset)
    }
}

impl ReadAt for [u8] {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        if offset >= self.len() as u64 {
            return Ok(0);
        }
        let avail = &self[offset as usize..];
        let n = std::cmp::min(buf.len(), avail.len());
        buf[..n].copy_from_slice(&avail[..n]);
        Ok(n)
    }
}

impl ReadAt for Vec<u8> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.as_slice().read_at(buf, offset)
    }
}

impl<T: ReadAt + ?Sized> ReadAt for &T {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        (**self).read_at(buf, offset)
    }
}

/// A `[start, end)` window over another reader.
///
/// Carries its own position so it can also be used as a plain `Read + Seek`
/// stream (e.g. for byte-for-byte copies of PFS0 entries).
pub struct SubFile<R> {
    inner: R,
    start: u64,
    end: u64,
    position: u64,
}

impl<R: ReadAt> SubFile<R> {
    pub fn new(inner: R, start: u64, end: u64) -> Self {
        Self {
            inner,
            start,
            end,
            position: 0,
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }
}

impl<R: ReadAt> ReadAt for SubFile<R> {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        let len = self.end - self.start;
        if offset >= len {
            return Ok(0);
        }
        let max_read = std::cmp::min(buf.len() as u64, len - offset) as usize;
        self.inner.read_at(&mut buf[..max_read], self.start + offset)
    }
}

impl<R: ReadAt> Read for SubFile<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.read_at(buf, self.position)?;
        self.position += n as u64;
        Ok(n)
    }
}

impl<R: ReadAt> Seek for SubFile<R> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::End(offset) => self.size() as i64 + offset,
            SeekFrom::Current(offset) => self.position as i64 + offset,
        };

        if new_pos < 0 || new_pos as u64 > self.size() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "cannot seek outside of subfile",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}
