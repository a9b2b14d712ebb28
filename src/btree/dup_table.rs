//! # External Duplicate Tables
//!
//! Once a key accumulates more inline duplicates than the page-size
//! threshold (or its slot cannot grow), all of its record entries move
//! into a blob and the slot shrinks to the table's blob id plus the
//! `KF_EXTENDED_DUPLICATES` flag.
//!
//! Table blob format:
//!
//! ```text
//! Offset  Size       Field
//! ------  ---------  -----------------------------
//! 0       4          count (u32)
//! 4       4          capacity (u32)
//! 8       cap×width  record entries
//! ```
//!
//! Entries keep the node-side shape (fixed-width records, or 9-byte
//! default entries). The table grows by doubling its capacity and writing
//! back through the blob manager, which relocates the blob when the
//! extent is outgrown; the caller must store the returned blob id back
//! into the slot after every mutation.

use eyre::{ensure, Result};

use crate::blob;
use crate::error::ErrorKind;
use crate::pager::PageManager;

const TABLE_HEADER_SIZE: usize = 8;

pub(crate) struct DupTable {
    blob_id: u64,
    entry_width: usize,
    count: u32,
    capacity: u32,
    entries: Vec<u8>,
}

impl DupTable {
    /// Builds a fresh table from inline entries and writes it out.
    pub fn create(
        pager: &mut PageManager,
        entry_width: usize,
        entries: &[u8],
        count: u32,
    ) -> Result<Self> {
        ensure!(
            entries.len() == count as usize * entry_width,
            "entry bytes do not match count"
        );
        let capacity = (count * 2).max(8);
        let mut table = Self {
            blob_id: 0,
            entry_width,
            count,
            capacity,
            entries: entries.to_vec(),
        };
        table.blob_id = blob::alloc(pager, &table.serialize())?;
        Ok(table)
    }

    /// Loads a table from its blob.
    pub fn load(pager: &mut PageManager, blob_id: u64, entry_width: usize) -> Result<Self> {
        let bytes = blob::read(pager, blob_id)?;
        ensure!(
            bytes.len() >= TABLE_HEADER_SIZE,
            "duplicate table blob truncated"
        );
        let count = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let capacity = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if count > capacity
            || bytes.len() < TABLE_HEADER_SIZE + count as usize * entry_width
        {
            return ErrorKind::IntegrityViolated
                .raise()
                .map_err(|e| e.wrap_err("duplicate table header inconsistent"));
        }
        Ok(Self {
            blob_id,
            entry_width,
            count,
            capacity,
            entries: bytes[TABLE_HEADER_SIZE..TABLE_HEADER_SIZE + count as usize * entry_width]
                .to_vec(),
        })
    }

    pub fn blob_id(&self) -> u64 {
        self.blob_id
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn entry(&self, idx: u32) -> Result<&[u8]> {
        ensure!(idx < self.count, "record index {} out of {}", idx, self.count);
        let start = idx as usize * self.entry_width;
        Ok(&self.entries[start..start + self.entry_width])
    }

    /// Inserts an entry at `pos` and writes the table back. Doubles the
    /// capacity when full; the blob may move.
    pub fn insert(&mut self, pager: &mut PageManager, pos: u32, entry: &[u8]) -> Result<()> {
        ensure!(entry.len() == self.entry_width, "entry width mismatch");
        let pos = pos.min(self.count) as usize;

        if self.count == self.capacity {
            self.capacity *= 2;
        }
        let at = pos * self.entry_width;
        self.entries.splice(at..at, entry.iter().copied());
        self.count += 1;
        self.write_back(pager)
    }

    /// Removes the entry at `pos` and writes the table back.
    pub fn remove(&mut self, pager: &mut PageManager, pos: u32) -> Result<()> {
        ensure!(pos < self.count, "record index {} out of {}", pos, self.count);
        let at = pos as usize * self.entry_width;
        self.entries.drain(at..at + self.entry_width);
        self.count -= 1;
        self.write_back(pager)
    }

    /// Overwrites the entry at `idx` and writes the table back.
    pub fn set(&mut self, pager: &mut PageManager, idx: u32, entry: &[u8]) -> Result<()> {
        ensure!(entry.len() == self.entry_width, "entry width mismatch");
        ensure!(idx < self.count, "record index {} out of {}", idx, self.count);
        let at = idx as usize * self.entry_width;
        self.entries[at..at + self.entry_width].copy_from_slice(entry);
        self.write_back(pager)
    }

    /// Frees the table blob. Record blobs referenced by entries are the
    /// caller's responsibility.
    pub fn free(self, pager: &mut PageManager) -> Result<()> {
        blob::free(pager, self.blob_id)
    }

    fn serialize(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(TABLE_HEADER_SIZE + self.capacity as usize * self.entry_width);
        out.extend_from_slice(&self.count.to_le_bytes());
        out.extend_from_slice(&self.capacity.to_le_bytes());
        out.extend_from_slice(&self.entries);
        // reserve the full capacity so in-place growth is the common case
        out.resize(
            TABLE_HEADER_SIZE + self.capacity as usize * self.entry_width,
            0,
        );
        out
    }

    fn write_back(&mut self, pager: &mut PageManager) -> Result<()> {
        self.blob_id = blob::overwrite(pager, self.blob_id, &self.serialize())?;
        Ok(())
    }
}
