//! Block-aligned positioned file I/O, exclusive/shared locking, and the
//! pluggable encryption/compression seams.
//!
//! Positioned reads/writes are used rather than a memory-mapped file: the
//! commit pipeline needs a single, precisely-bounded positioned write per
//! chunk, and truncation semantics a shared mmap makes harder to reason
//! about for crash safety.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::sync::Arc;

use fs4::fs_std::FileExt;

use crate::StoreError;

/// A caller-supplied byte-in/byte-out filter, used for the optional
/// encryption and compression seams. Both are implemented externally; this
/// is just the seam they plug into.
pub trait ByteFilter: Send + Sync {
    fn encode(&self, plain: &[u8]) -> Vec<u8>;
    fn decode(&self, encoded: &[u8]) -> crate::Result<Vec<u8>>;
}

/// Identity filter used when no compression/encryption is configured.
pub struct Identity;

impl ByteFilter for Identity {
    fn encode(&self, plain: &[u8]) -> Vec<u8> {
        plain.to_vec()
    }

    fn decode(&self, encoded: &[u8]) -> crate::Result<Vec<u8>> {
        Ok(encoded.to_vec())
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpenMode {
    ReadWrite,
    ReadOnly,
}

pub struct FileBackend {
    file: File,
    mode: OpenMode,
    /// Applied to whole-chunk and whole-header byte ranges before they hit
    /// disk, and after they're read back. Not applied byte-range-at-a-time,
    /// since both encryption and compression here are simple filters over
    /// complete, self-describing regions (a chunk, a header block).
    filter: Arc<dyn ByteFilter>,
}

impl FileBackend {
    pub fn open(path: &Path, mode: OpenMode, filter: Arc<dyn ByteFilter>) -> crate::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode == OpenMode::ReadWrite)
            .create(mode == OpenMode::ReadWrite)
            .open(path)
            .map_err(|e| StoreError::io("opening the backing file", e))?;

        match mode {
            OpenMode::ReadWrite => file
                .try_lock_exclusive()
                .map_err(|e| StoreError::io("locking the backing file for exclusive use", e))?,
            OpenMode::ReadOnly => file
                .try_lock_shared()
                .map_err(|e| StoreError::io("locking the backing file for shared use", e))?,
        }

        Ok(Self { file, mode, filter })
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn len(&self) -> crate::Result<u64> {
        self.file.metadata().map(|m| m.len()).map_err(|e| StoreError::io("reading file length", e))
    }

    pub fn is_empty(&self) -> crate::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn read_at(&self, offset: u64, len: usize) -> crate::Result<Vec<u8>> {
        let mut raw = vec![0u8; len];
        read_exact_at(&self.file, &mut raw, offset).map_err(|e| StoreError::io("reading the backing file", e))?;
        self.filter.decode(&raw)
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> crate::Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::illegal_state("cannot write: store was opened read-only"));
        }
        let encoded = self.filter.encode(data);
        write_all_at(&self.file, &encoded, offset).map_err(|e| StoreError::io("writing the backing file", e))
    }

    pub fn set_len(&self, len: u64) -> crate::Result<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::illegal_state("cannot truncate: store was opened read-only"));
        }
        self.file.set_len(len).map_err(|e| StoreError::io("truncating the backing file", e))
    }

    /// The store does not call this automatically: durability against power
    /// loss relies on the header/retention design, and `fsync` is the
    /// embedding application's call to make.
    pub fn sync(&self) -> crate::Result<()> {
        self.file.sync_all().map_err(|e| StoreError::io("syncing the backing file", e))
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.read_exact_at(buf, offset)
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt as _;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    let mut read = 0;
    while read < buf.len() {
        let n = file.seek_read(&mut buf[read..], offset + read as u64)?;
        if n == 0 {
            return Err(std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "short read"));
        }
        read += n;
    }
    Ok(())
}

#[cfg(windows)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt as _;
    let mut written = 0;
    while written < buf.len() {
        let n = file.seek_write(&buf[written..], offset + written as u64)?;
        written += n;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn write_then_read_back() {
        let tmp = NamedTempFile::new().unwrap();
        let backend = FileBackend::open(tmp.path(), OpenMode::ReadWrite, Arc::new(Identity)).unwrap();
        backend.set_len(4096).unwrap();
        backend.write_at(100, b"hello world").unwrap();
        let back = backend.read_at(100, 11).unwrap();
        assert_eq!(&back, b"hello world");
    }

    #[test]
    fn read_only_rejects_writes() {
        let tmp = NamedTempFile::new().unwrap();
        {
            let backend = FileBackend::open(tmp.path(), OpenMode::ReadWrite, Arc::new(Identity)).unwrap();
            backend.set_len(4096).unwrap();
        }
        let backend = FileBackend::open(tmp.path(), OpenMode::ReadOnly, Arc::new(Identity)).unwrap();
        assert!(backend.write_at(0, b"x").is_err());
    }
}
