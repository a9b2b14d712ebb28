//! Memory-mapped file device.
//!
//! The default backend for file-backed environments. The whole file is
//! mapped; reads and writes are memcpys against the mapping and `flush`
//! is an `msync`. Read-only environments get a read-only mapping.
//!
//! Remapping invalidates the old mapping, so `grow`/`truncate` take
//! `&mut self`; the borrow checker guarantees no reads are in flight when
//! the file is resized. The page manager copies page bytes out of the
//! mapping into cache buffers, so no reference into the mapping outlives a
//! single `read` call.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};
use memmap2::{Mmap, MmapMut};

use super::Device;

enum Mapping {
    None,
    ReadWrite(MmapMut),
    ReadOnly(Mmap),
}

pub struct MmapDevice {
    file: File,
    mapping: Mapping,
    len: u64,
    read_only: bool,
}

impl MmapDevice {
    pub fn create<P: AsRef<Path>>(path: P, mode: u32) -> Result<Self> {
        let path = path.as_ref();

        let mut options = OpenOptions::new();
        options.read(true).write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(mode);
        }
        #[cfg(not(unix))]
        let _ = mode;

        let file = options
            .open(path)
            .wrap_err_with(|| format!("failed to create device file '{}'", path.display()))?;

        Ok(Self {
            file,
            mapping: Mapping::None,
            len: 0,
            read_only: false,
        })
    }

    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .open(path)
            .wrap_err_with(|| format!("failed to open device file '{}'", path.display()))?;

        let len = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len();

        let mut dev = Self {
            file,
            mapping: Mapping::None,
            len,
            read_only,
        };
        dev.remap()?;
        Ok(dev)
    }

    fn remap(&mut self) -> Result<()> {
        if self.len == 0 {
            self.mapping = Mapping::None;
            return Ok(());
        }

        // SAFETY: mapping is unsafe because the file could be modified
        // externally. The environment owns its file exclusively for the
        // lifetime of the device, and every access is bounds-checked
        // against `len`, which always matches the mapped size.
        self.mapping = if self.read_only {
            let mmap = unsafe {
                Mmap::map(&self.file).wrap_err("failed to memory-map device file")?
            };
            Mapping::ReadOnly(mmap)
        } else {
            let mmap = unsafe {
                MmapMut::map_mut(&self.file).wrap_err("failed to memory-map device file")?
            };
            Mapping::ReadWrite(mmap)
        };
        Ok(())
    }

    fn bytes(&self) -> &[u8] {
        match &self.mapping {
            Mapping::None => &[],
            Mapping::ReadWrite(m) => m,
            Mapping::ReadOnly(m) => m,
        }
    }
}

impl Device for MmapDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        ensure!(
            end as u64 <= self.len,
            "device read [{}, {}) beyond device size {}",
            start,
            end,
            self.len
        );
        buf.copy_from_slice(&self.bytes()[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "device is write protected");
        let start = offset as usize;
        let end = start + data.len();
        ensure!(
            end as u64 <= self.len,
            "device write [{}, {}) beyond device size {}",
            start,
            end,
            self.len
        );
        match &mut self.mapping {
            Mapping::ReadWrite(mmap) => {
                mmap[start..end].copy_from_slice(data);
                Ok(())
            }
            _ => eyre::bail!("device has no writable mapping"),
        }
    }

    fn flush(&mut self) -> Result<()> {
        match &self.mapping {
            Mapping::ReadWrite(mmap) => mmap.flush().wrap_err("failed to msync device mapping"),
            _ => Ok(()),
        }
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        ensure!(!self.read_only, "device is write protected");

        if let Mapping::ReadWrite(mmap) = &self.mapping {
            mmap.flush_async()
                .wrap_err("failed to flush mapping before grow")?;
        }
        self.mapping = Mapping::None;

        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to grow device to {} bytes", new_len))?;
        self.len = new_len;
        self.remap()
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        if new_len >= self.len {
            return Ok(());
        }
        ensure!(!self.read_only, "device is write protected");

        self.mapping = Mapping::None;
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to truncate device to {} bytes", new_len))?;
        self.len = new_len;
        self.remap()
    }
}
