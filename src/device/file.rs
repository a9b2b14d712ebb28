//! Positioned-I/O file device.
//!
//! Used when memory mapping is disabled. Each read and write is one
//! `pread`/`pwrite`; there is no user-space buffering, the page cache above
//! this layer is the only copy.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{ensure, Result, WrapErr};

use super::Device;

#[derive(Debug)]
pub struct FileDevice {
    file: File,
    len: u64,
    read_only: bool,
}

impl FileDevice {
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

        Ok(Self {
            file,
            len,
            read_only,
        })
    }
}

impl Device for FileDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        ensure!(
            offset + buf.len() as u64 <= self.len,
            "device read [{}, {}) beyond device size {}",
            offset,
            offset + buf.len() as u64,
            self.len
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .read_exact_at(buf, offset)
                .wrap_err_with(|| format!("failed to read {} bytes at {}", buf.len(), offset))?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            while done < buf.len() {
                let n = self
                    .file
                    .seek_read(&mut buf[done..], offset + done as u64)
                    .wrap_err_with(|| format!("failed to read at {}", offset))?;
                ensure!(n > 0, "unexpected end of device at {}", offset + done as u64);
                done += n;
            }
        }
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        ensure!(!self.read_only, "device is write protected");
        ensure!(
            offset + data.len() as u64 <= self.len,
            "device write [{}, {}) beyond device size {}",
            offset,
            offset + data.len() as u64,
            self.len
        );

        #[cfg(unix)]
        {
            use std::os::unix::fs::FileExt;
            self.file
                .write_all_at(data, offset)
                .wrap_err_with(|| format!("failed to write {} bytes at {}", data.len(), offset))?;
        }
        #[cfg(windows)]
        {
            use std::os::windows::fs::FileExt;
            let mut done = 0;
            while done < data.len() {
                let n = self
                    .file
                    .seek_write(&data[done..], offset + done as u64)
                    .wrap_err_with(|| format!("failed to write at {}", offset))?;
                done += n;
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data().wrap_err("failed to sync device file")
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len {
            return Ok(());
        }
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to grow device to {} bytes", new_len))?;
        self.len = new_len;
        Ok(())
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        if new_len >= self.len {
            return Ok(());
        }
        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to truncate device to {} bytes", new_len))?;
        self.len = new_len;
        Ok(())
    }
}
