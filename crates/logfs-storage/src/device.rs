//! Block devices and the regions carved out of them.
//!
//! The data region and the log region may live on the same device or on
//! different ones; each is addressed through a [`Region`] with its own base
//! offset and length. All I/O is synchronous.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::error::{StorageError, StorageResult};

/// A flat, byte-addressed store.
pub trait BlockDevice: Send + Sync + fmt::Debug {
    /// Fill `buf` from the device starting at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<()>;

    /// Write all of `buf` to the device starting at `offset`.
    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<()>;

    /// Make previous writes durable.
    fn sync(&self) -> StorageResult<()>;

    /// Device length in bytes.
    fn len(&self) -> u64;

    /// Returns true if the device has no capacity.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A device backed by a regular file or a raw disk node.
#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
}

impl FileDevice {
    /// Open an existing file read-write.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(path = %path.display(), len, "opened file device");
        Ok(Self { file, len })
    }

    /// Create (or truncate) a file of exactly `len` zero bytes.
    pub fn create(path: &Path, len: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len)?;
        debug!(path = %path.display(), len, "created file device");
        Ok(Self { file, len })
    }
}

impl BlockDevice for FileDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<()> {
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<()> {
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// An in-memory device. Clones share the same bytes, so a test can drop a
/// filesystem without flushing and reopen it over the surviving contents.
#[derive(Clone)]
pub struct MemDevice {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemDevice {
    /// Create a zero-filled device of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: Arc::new(Mutex::new(vec![0u8; len])),
        }
    }

    /// Copy of the current contents.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Replace the device contents with `bytes`, keeping its length.
    pub fn restore(&self, bytes: &[u8]) {
        let mut data = self.data.lock();
        let n = bytes.len().min(data.len());
        data[..n].copy_from_slice(&bytes[..n]);
    }

    fn check(&self, offset: u64, len: usize, limit: usize) -> StorageResult<usize> {
        let start = offset as usize;
        if offset > limit as u64 || len > limit - start {
            return Err(StorageError::OutOfRange {
                offset,
                len: len as u64,
                limit: limit as u64,
            });
        }
        Ok(start)
    }
}

impl fmt::Debug for MemDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemDevice").field("len", &self.len()).finish()
    }
}

impl BlockDevice for MemDevice {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> StorageResult<()> {
        let data = self.data.lock();
        let start = self.check(offset, buf.len(), data.len())?;
        buf.copy_from_slice(&data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&self, buf: &[u8], offset: u64) -> StorageResult<()> {
        let mut data = self.data.lock();
        let start = self.check(offset, buf.len(), data.len())?;
        data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn sync(&self) -> StorageResult<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.lock().len() as u64
    }
}

/// A window of a device: offsets passed to a region are relative to `base`
/// and must stay within `length`.
#[derive(Clone, Debug)]
pub struct Region {
    device: Arc<dyn BlockDevice>,
    base: u64,
    length: u64,
}

impl Region {
    /// Create a region, checking that it fits on the device.
    pub fn new(device: Arc<dyn BlockDevice>, base: u64, length: u64) -> StorageResult<Self> {
        let device_len = device.len();
        match base.checked_add(length) {
            Some(end) if end <= device_len => Ok(Self {
                device,
                base,
                length,
            }),
            _ => Err(StorageError::InvalidRegion {
                base,
                length,
                device_len,
            }),
        }
    }

    /// A region covering the whole device.
    pub fn whole(device: Arc<dyn BlockDevice>) -> Self {
        let length = device.len();
        Self {
            device,
            base: 0,
            length,
        }
    }

    /// Region length in bytes.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Base offset on the device.
    pub fn base(&self) -> u64 {
        self.base
    }

    fn check(&self, offset: u64, len: usize) -> StorageResult<u64> {
        match offset.checked_add(len as u64) {
            Some(end) if end <= self.length => Ok(self.base + offset),
            _ => Err(StorageError::OutOfRange {
                offset,
                len: len as u64,
                limit: self.length,
            }),
        }
    }

    /// Read `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let at = self.check(offset, buf.len())?;
        self.device.read_at(buf, at)
    }

    /// Write all of `buf` at `offset`.
    pub fn write(&self, offset: u64, buf: &[u8]) -> StorageResult<()> {
        let at = self.check(offset, buf.len())?;
        self.device.write_at(buf, at)
    }

    /// Overwrite `len` bytes at `offset` with zeros.
    pub fn zero(&self, offset: u64, len: u64) -> StorageResult<()> {
        const CHUNK: u64 = 64 * 1024;
        let zeros = vec![0u8; CHUNK.min(len) as usize];
        let mut done = 0;
        while done < len {
            let n = CHUNK.min(len - done) as usize;
            self.write(offset + done, &zeros[..n])?;
            done += n as u64;
        }
        Ok(())
    }

    /// Flush the underlying device.
    pub fn sync(&self) -> StorageResult<()> {
        self.device.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_device_read_write() {
        let dev = MemDevice::new(4096);
        dev.write_at(b"hello", 100).unwrap();
        let mut buf = [0u8; 5];
        dev.read_at(&mut buf, 100).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_mem_device_out_of_range() {
        let dev = MemDevice::new(16);
        assert!(dev.write_at(b"0123456789", 10).is_err());
        let mut buf = [0u8; 4];
        assert!(dev.read_at(&mut buf, 17).is_err());
    }

    #[test]
    fn test_mem_device_clones_share_bytes() {
        let dev = MemDevice::new(64);
        let other = dev.clone();
        dev.write_at(&[7u8; 8], 0).unwrap();
        let mut buf = [0u8; 8];
        other.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [7u8; 8]);
    }

    #[test]
    fn test_region_offsets() {
        let dev = MemDevice::new(8192);
        let region = Region::new(Arc::new(dev.clone()), 4096, 1024).unwrap();
        region.write(10, b"abc").unwrap();
        let mut buf = [0u8; 3];
        dev.read_at(&mut buf, 4106).unwrap();
        assert_eq!(&buf, b"abc");
        assert!(region.write(1022, b"abc").is_err());
    }

    #[test]
    fn test_region_must_fit() {
        let dev: Arc<dyn BlockDevice> = Arc::new(MemDevice::new(4096));
        let err = Region::new(dev, 4000, 200).unwrap_err();
        assert!(matches!(err, StorageError::InvalidRegion { .. }));
    }

    #[test]
    fn test_region_zero() {
        let dev = MemDevice::new(200_000);
        let region = Region::whole(Arc::new(dev.clone()));
        region.write(0, &vec![0xFFu8; 200_000]).unwrap();
        region.zero(10, 150_000).unwrap();
        let bytes = dev.snapshot();
        assert_eq!(bytes[9], 0xFF);
        assert!(bytes[10..150_010].iter().all(|&b| b == 0));
        assert_eq!(bytes[150_010], 0xFF);
    }

    #[test]
    fn test_file_device() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("disk.img");
        {
            let dev = FileDevice::create(&path, 8192).unwrap();
            assert_eq!(dev.len(), 8192);
            dev.write_at(b"persist", 4096).unwrap();
            dev.sync().unwrap();
        }
        let dev = FileDevice::open(&path).unwrap();
        let mut buf = [0u8; 7];
        dev.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"persist");
    }
}
