#![forbid(unsafe_code)]
//! Positioned file I/O behind the block cache.

use std::fs::{File, OpenOptions};
use std::io::{self, ErrorKind};
use std::path::Path;
use std::sync::Arc;

use tracing::trace;

use crate::types::{BlockId, Result, SliceError};

/// Positioned reads and writes against a backing file.
pub trait FileIo: Send + Sync + 'static {
    /// Fills `dst` from offset `off`; reading past the end is an error.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at offset `off`.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current file length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

/// Byte offset of `block` in a file of `block_size`-byte blocks.
pub fn block_offset(block: BlockId, block_size: usize) -> Result<u64> {
    block
        .0
        .checked_mul(block_size as u64)
        .ok_or(SliceError::Invalid("block offset overflows u64"))
}

/// [`FileIo`] over a shared [`File`].
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an already open file.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens `path` read-write, creating it if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }

    #[cfg(unix)]
    fn read_chunk(&self, dst: &mut [u8], off: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.inner.read_at(dst, off)
    }

    #[cfg(unix)]
    fn write_chunk(&self, src: &[u8], off: u64) -> io::Result<usize> {
        use std::os::unix::fs::FileExt;
        self.inner.write_at(src, off)
    }

    #[cfg(windows)]
    fn read_chunk(&self, dst: &mut [u8], off: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.inner.seek_read(dst, off)
    }

    #[cfg(windows)]
    fn write_chunk(&self, src: &[u8], off: u64) -> io::Result<usize> {
        use std::os::windows::fs::FileExt;
        self.inner.seek_write(src, off)
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        while !dst.is_empty() {
            let read = self.read_chunk(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        while !src.is_empty() {
            let written = self.write_chunk(src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        trace!("io.sync_all");
        Ok(self.inner.sync_all()?)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_read_roundtrip() -> Result<()> {
        let dir = tempdir()?;
        let io = StdFileIo::open(dir.path().join("blocks.bin"))?;
        let offset = block_offset(BlockId(2), 64)?;
        io.write_at(offset, b"block two")?;
        io.sync_all()?;
        let mut buf = vec![0u8; 9];
        io.read_at(offset, &mut buf)?;
        assert_eq!(&buf, b"block two");
        assert_eq!(io.len()?, 128 + 9);
        Ok(())
    }

    #[test]
    fn read_past_eof_is_unexpected_eof() -> Result<()> {
        let dir = tempdir()?;
        let io = StdFileIo::open(dir.path().join("empty.bin"))?;
        assert!(io.is_empty()?);
        let mut buf = [0u8; 8];
        match io.read_at(0, &mut buf) {
            Err(SliceError::Io(inner)) => assert_eq!(inner.kind(), ErrorKind::UnexpectedEof),
            other => panic!("unexpected result: {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn offsets_that_overflow_are_rejected() {
        assert!(matches!(
            block_offset(BlockId(u64::MAX / 2), 4096),
            Err(SliceError::Invalid(_))
        ));
    }
}
