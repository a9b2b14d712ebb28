//! # Device Abstraction
//!
//! A device is the byte store underneath the page manager: bytes at an
//! offset, growth and truncation, and a durability barrier. Three backends
//! exist:
//!
//! - [`MmapDevice`]: memory-mapped file, the default for file-backed
//!   environments. Reads are memcpys out of the mapping; growth remaps.
//! - [`FileDevice`]: positioned read/write syscalls, used when mmap is
//!   disabled.
//! - [`MemoryDevice`]: a growable arena for in-memory environments.
//!
//! The device knows nothing about pages; offsets and lengths are plain
//! bytes. The page manager guarantees that all accesses are page-aligned
//! and within `len()`.

mod file;
mod memory;
mod mmap;

pub use file::FileDevice;
pub use memory::MemoryDevice;
pub use mmap::MmapDevice;

use eyre::Result;

/// Bytes-at-offset storage under the page manager.
pub trait Device: Send {
    /// Reads `buf.len()` bytes starting at `offset`.
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()>;

    /// Writes `data` starting at `offset`. The range must lie within
    /// `len()`.
    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Durability barrier; returns once previously written bytes are on
    /// stable storage.
    fn flush(&mut self) -> Result<()>;

    /// Current device size in bytes.
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Grows the device to `new_len` bytes; the new range reads as zeroes.
    /// A `new_len` not larger than `len()` is a no-op.
    fn grow(&mut self, new_len: u64) -> Result<()>;

    /// Shrinks the device to `new_len` bytes.
    fn truncate(&mut self, new_len: u64) -> Result<()>;

    /// True for devices without a backing file; flushing is free and
    /// closing discards everything.
    fn is_in_memory(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise(dev: &mut dyn Device) {
        dev.grow(8192).unwrap();
        assert_eq!(dev.len(), 8192);

        dev.write(4096, b"coffer").unwrap();
        let mut buf = [0u8; 6];
        dev.read(4096, &mut buf).unwrap();
        assert_eq!(&buf, b"coffer");

        // new range after growth reads as zeroes
        dev.grow(16384).unwrap();
        let mut buf = [0xAAu8; 4];
        dev.read(12288, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);

        dev.truncate(4096).unwrap();
        assert_eq!(dev.len(), 4096);
        dev.flush().unwrap();
    }

    #[test]
    fn memory_device_contract() {
        let mut dev = MemoryDevice::new();
        exercise(&mut dev);
        assert!(dev.is_in_memory());
    }

    #[test]
    fn file_device_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = FileDevice::create(dir.path().join("dev.db"), 0o644).unwrap();
        exercise(&mut dev);
        assert!(!dev.is_in_memory());
    }

    #[test]
    fn mmap_device_contract() {
        let dir = tempfile::tempdir().unwrap();
        let mut dev = MmapDevice::create(dir.path().join("dev.db"), 0o644).unwrap();
        exercise(&mut dev);
    }

    #[test]
    fn file_device_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        {
            let mut dev = FileDevice::create(&path, 0o644).unwrap();
            dev.grow(4096).unwrap();
            dev.write(100, b"persist me").unwrap();
            dev.flush().unwrap();
        }

        let dev = FileDevice::open(&path, false).unwrap();
        let mut buf = [0u8; 10];
        dev.read(100, &mut buf).unwrap();
        assert_eq!(&buf, b"persist me");
    }

    #[test]
    fn mmap_device_persists_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dev.db");

        {
            let mut dev = MmapDevice::create(&path, 0o644).unwrap();
            dev.grow(4096).unwrap();
            dev.write(0, b"mapped").unwrap();
            dev.flush().unwrap();
        }

        let dev = MmapDevice::open(&path, false).unwrap();
        let mut buf = [0u8; 6];
        dev.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"mapped");
    }
}
