//! In-memory arena device.
//!
//! Backs in-memory environments. The arena is the store of record; there is
//! nothing to flush and nothing survives the process.

use eyre::{ensure, Result};

use super::Device;

#[derive(Debug, Default)]
pub struct MemoryDevice {
    data: Vec<u8>,
}

impl MemoryDevice {
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }
}

impl Device for MemoryDevice {
    fn read(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + buf.len();
        ensure!(
            end <= self.data.len(),
            "device read [{}, {}) beyond device size {}",
            start,
            end,
            self.data.len()
        );
        buf.copy_from_slice(&self.data[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + data.len();
        ensure!(
            end <= self.data.len(),
            "device write [{}, {}) beyond device size {}",
            start,
            end,
            self.data.len()
        );
        self.data[start..end].copy_from_slice(data);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }

    fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len as usize > self.data.len() {
            self.data.resize(new_len as usize, 0);
        }
        Ok(())
    }

    fn truncate(&mut self, new_len: u64) -> Result<()> {
        if (new_len as usize) < self.data.len() {
            self.data.truncate(new_len as usize);
        }
        Ok(())
    }

    fn is_in_memory(&self) -> bool {
        true
    }
}
