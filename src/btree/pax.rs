//! # PAX Node Layout
//!
//! Fixed-length keys, no duplicates. Keys live in one contiguous array and
//! record entries in a parallel array, so slot access is pure pointer
//! arithmetic and key scans touch a single dense region:
//!
//! ```text
//! +----------+----------+---------------------+-------------------------+
//! | page hdr | node hdr | keys[cap × key_size]| records[cap × width]    |
//! +----------+----------+---------------------+-------------------------+
//! ```
//!
//! Capacity is fixed at node init from the usable payload. Insert shifts
//! both arrays right of the slot; erase shifts them back; split and merge
//! are block copies driven by the tree through the raw-slot interface.
//! There is no freelist and nothing to rearrange, which is the point.

use eyre::{ensure, Result};

use crate::config::{NODE_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::ErrorKind;

use super::node::{NodeCfg, PBtreeNode};
use super::SpaceOutcome;

const ARRAYS_START: usize = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;

fn key_size_of(cfg: &NodeCfg) -> usize {
    cfg.fixed_key.expect("pax layout requires a fixed key size") as usize
}

fn capacity_of(cfg: &NodeCfg) -> u32 {
    (cfg.usable_size() / (key_size_of(cfg) + cfg.entry_width)) as u32
}

fn count_of(data: &[u8]) -> u32 {
    PBtreeNode::from_page(data).map(|h| h.count()).unwrap_or(0)
}

fn key_at(cfg: &NodeCfg, slot: u32) -> usize {
    ARRAYS_START + slot as usize * key_size_of(cfg)
}

fn record_at(cfg: &NodeCfg, slot: u32) -> usize {
    ARRAYS_START
        + capacity_of(cfg) as usize * key_size_of(cfg)
        + slot as usize * cfg.entry_width
}

pub(crate) struct PaxNode<'a> {
    data: &'a [u8],
    cfg: NodeCfg,
}

pub(crate) struct PaxNodeMut<'a> {
    data: &'a mut [u8],
    cfg: NodeCfg,
}

impl<'a> PaxNode<'a> {
    pub fn new(data: &'a [u8], cfg: NodeCfg) -> Result<Self> {
        ensure!(
            data.len() == cfg.page_size,
            "page buffer has {} bytes, expected {}",
            data.len(),
            cfg.page_size
        );
        ensure!(cfg.fixed_key.is_some(), "pax layout requires fixed keys");
        Ok(Self { data, cfg })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn capacity(&self) -> u32 {
        capacity_of(&self.cfg)
    }

    pub fn key_inline(&self, slot: u32) -> Result<&'a [u8]> {
        ensure!(slot < count_of(self.data), "slot {} out of bounds", slot);
        let at = key_at(&self.cfg, slot);
        Ok(&self.data[at..at + key_size_of(&self.cfg)])
    }

    pub fn key_flags(&self, _slot: u32) -> Result<u8> {
        // pax keys are never extended and never carry duplicate tables
        Ok(0)
    }

    pub fn key_real_size(&self, _slot: u32) -> Result<u16> {
        Ok(self.cfg.fixed_key.expect("fixed key"))
    }

    pub fn record_area(&self, slot: u32) -> Result<&'a [u8]> {
        ensure!(slot < count_of(self.data), "slot {} out of bounds", slot);
        let at = record_at(&self.cfg, slot);
        Ok(&self.data[at..at + self.cfg.entry_width])
    }

    pub fn fits_slots(&self, shapes: &[(usize, usize)]) -> bool {
        count_of(self.data) + shapes.len() as u32 <= self.capacity()
    }

    pub fn check_integrity(&self) -> Result<()> {
        if count_of(self.data) > self.capacity() {
            return ErrorKind::IntegrityViolated
                .raise()
                .map_err(|e| e.wrap_err("count beyond pax capacity"));
        }
        Ok(())
    }
}

impl<'a> PaxNodeMut<'a> {
    pub fn new(data: &'a mut [u8], cfg: NodeCfg) -> Result<Self> {
        ensure!(
            data.len() == cfg.page_size,
            "page buffer has {} bytes, expected {}",
            data.len(),
            cfg.page_size
        );
        ensure!(cfg.fixed_key.is_some(), "pax layout requires fixed keys");
        Ok(Self { data, cfg })
    }

    /// Nothing to write beyond the node header; the arrays are implicit.
    pub fn init(data: &mut [u8], cfg: NodeCfg) -> Result<()> {
        ensure!(cfg.fixed_key.is_some(), "pax layout requires fixed keys");
        ensure!(
            capacity_of(&cfg) >= 4,
            "page too small for pax keys of {} bytes",
            key_size_of(&cfg)
        );
        let _ = data;
        Ok(())
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn capacity(&self) -> u32 {
        capacity_of(&self.cfg)
    }

    fn count(&self) -> u32 {
        count_of(self.data)
    }

    fn set_count(&mut self, count: u32) -> Result<()> {
        PBtreeNode::from_page_mut(self.data)?.set_count(count);
        Ok(())
    }

    pub fn set_key_flags(&mut self, _slot: u32, flags: u8) -> Result<()> {
        ensure!(flags == 0, "pax slots carry no key flags");
        Ok(())
    }

    pub fn requires_split(&self) -> bool {
        self.count() >= self.capacity()
    }

    pub fn insert_slot(
        &mut self,
        slot: u32,
        key_inline: &[u8],
        key_flags: u8,
        key_real_size: u16,
        record_area: &[u8],
    ) -> Result<SpaceOutcome> {
        let key_size = key_size_of(&self.cfg);
        ensure!(key_flags == 0, "pax slots carry no key flags");
        ensure!(
            key_inline.len() == key_size && key_real_size as usize == key_size,
            "pax key must be exactly {} bytes",
            key_size
        );
        ensure!(
            record_area.len() == self.cfg.entry_width,
            "pax record area must be exactly {} bytes",
            self.cfg.entry_width
        );

        let count = self.count();
        ensure!(slot <= count, "insert slot {} past count {}", slot, count);
        if count >= self.capacity() {
            return Ok(SpaceOutcome::NeedsSplit);
        }

        let ks = key_at(&self.cfg, slot);
        self.data
            .copy_within(ks..key_at(&self.cfg, count), ks + key_size);
        self.data[ks..ks + key_size].copy_from_slice(key_inline);

        let rs = record_at(&self.cfg, slot);
        self.data
            .copy_within(rs..record_at(&self.cfg, count), rs + self.cfg.entry_width);
        self.data[rs..rs + self.cfg.entry_width].copy_from_slice(record_area);

        self.set_count(count + 1)?;
        Ok(SpaceOutcome::Fit)
    }

    pub fn erase_slot(&mut self, slot: u32) -> Result<()> {
        let count = self.count();
        ensure!(slot < count, "erase slot {} out of {}", slot, count);
        let key_size = key_size_of(&self.cfg);

        let ks = key_at(&self.cfg, slot);
        self.data
            .copy_within(ks + key_size..key_at(&self.cfg, count), ks);

        let rs = record_at(&self.cfg, slot);
        self.data
            .copy_within(rs + self.cfg.entry_width..record_at(&self.cfg, count), rs);

        self.set_count(count - 1)
    }

    pub fn replace_record_area(&mut self, slot: u32, record_area: &[u8]) -> Result<SpaceOutcome> {
        ensure!(
            record_area.len() == self.cfg.entry_width,
            "pax record area must be exactly {} bytes",
            self.cfg.entry_width
        );
        ensure!(slot < self.count(), "slot {} out of bounds", slot);
        let at = record_at(&self.cfg, slot);
        self.data[at..at + self.cfg.entry_width].copy_from_slice(record_area);
        Ok(SpaceOutcome::Fit)
    }

    pub fn truncate(&mut self, from: u32) -> Result<()> {
        let count = self.count();
        ensure!(from <= count, "truncate from {} past count {}", from, count);
        self.set_count(from)
    }
}
