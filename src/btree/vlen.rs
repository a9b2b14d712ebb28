//! # Default Node Layout
//!
//! Variable-length keys and records, with or without duplicates. The node
//! payload is an [upfront index](super::upfront) followed by a chunk area:
//!
//! ```text
//! |Hdr|E1|E2|...|En|F1|..|Fm|.....(free).....|chunk|chunk|chunk|
//! ```
//!
//! `E1..En` are the live slot entries in key order, `F1..Fm` recycled
//! chunks. Each entry points at a chunk in the data area:
//!
//! ```text
//! Chunk:
//! +-------------+------------+------------------+--------------+
//! | key_size u16| key_flags  | key bytes        | record area  |
//! |             | u8         | (8 if extended)  |              |
//! +-------------+------------+------------------+--------------+
//! ```
//!
//! `key_size` is always the real key size; when `KF_EXTENDED_KEY` is set
//! the inline bytes are an 8-byte blob id instead of the key itself.
//!
//! ## Allocation policy
//!
//! New chunks bump-allocate at `next_offset`. When the tail is exhausted
//! the freelist is searched for a chunk of sufficient size (splitting off
//! the remainder so the `next_offset == max(offset+size)` invariant keeps
//! holding). When that fails too, the chunk area is rearranged: live
//! chunks are compacted to the front in slot order, the freelist resets,
//! and allocation retries once. Only then does the node report that it
//! needs a split.
//!
//! Erasing a slot never moves chunk bytes: the chunk is pushed onto the
//! freelist and only the 4-byte slot entries shift. Once the freelist
//! accumulates more than [`REARRANGE_FREELIST_MAX`] entries the node
//! rearranges eagerly.
//!
//! Record areas shrink in place (the cut-off tail is recycled, or kept as
//! slack when the entry table is full); growth reallocates the chunk
//! within the node.

use eyre::{ensure, Result};

use crate::config::REARRANGE_FREELIST_MAX;
use crate::error::ErrorKind;

use super::node::{NodeCfg, PBtreeNode};
use super::upfront::{self, SLOT_ENTRY_SIZE, UPFRONT_HEADER_SIZE};
use super::{SpaceOutcome, KF_EXTENDED_KEY};

/// key_size + key_flags prefix of every chunk.
pub(crate) const CHUNK_HEADER_SIZE: usize = 3;

/// Inline width of an extended key: the blob id.
pub(crate) const EXT_KEY_INLINE: usize = 8;

fn inline_key_len(key_flags: u8, key_size: u16) -> usize {
    if key_flags & KF_EXTENDED_KEY != 0 {
        EXT_KEY_INLINE
    } else {
        key_size as usize
    }
}

/// Average-guess chunk size used to pick a fresh node's capacity when no
/// statistics exist yet.
fn estimated_chunk(cfg: &NodeCfg) -> usize {
    let est_key = 24;
    let est_area = if cfg.has_counter {
        1 + cfg.entry_width
    } else {
        cfg.entry_width
    };
    CHUNK_HEADER_SIZE + est_key + est_area
}

pub(crate) struct VlenNode<'a> {
    data: &'a [u8],
    #[allow(dead_code)]
    cfg: NodeCfg,
}

pub(crate) struct VlenNodeMut<'a> {
    data: &'a mut [u8],
    cfg: NodeCfg,
}

// Shared read-side arithmetic over a borrowed page buffer.

fn count_of(data: &[u8]) -> u32 {
    PBtreeNode::from_page(data).map(|h| h.count()).unwrap_or(0)
}

fn chunk_range(data: &[u8], idx: u32) -> Result<std::ops::Range<usize>> {
    let (offset, size) = upfront::entry(data, idx);
    let start = upfront::data_area_start(data) + offset as usize;
    let end = start + size as usize;
    ensure!(
        end <= data.len(),
        "chunk [{}, {}) beyond page of {} bytes",
        start,
        end,
        data.len()
    );
    Ok(start..end)
}

fn key_real_size_at(data: &[u8], slot: u32) -> Result<u16> {
    let range = chunk_range(data, slot)?;
    let chunk = &data[range];
    ensure!(chunk.len() >= CHUNK_HEADER_SIZE, "chunk too small for header");
    Ok(u16::from_le_bytes(chunk[..2].try_into().unwrap()))
}

fn key_flags_at(data: &[u8], slot: u32) -> Result<u8> {
    let range = chunk_range(data, slot)?;
    ensure!(range.len() >= CHUNK_HEADER_SIZE, "chunk too small for header");
    Ok(data[range.start + 2])
}

fn key_inline_range(data: &[u8], slot: u32) -> Result<std::ops::Range<usize>> {
    let range = chunk_range(data, slot)?;
    let size = u16::from_le_bytes(data[range.start..range.start + 2].try_into().unwrap());
    let flags = data[range.start + 2];
    let len = inline_key_len(flags, size);
    let start = range.start + CHUNK_HEADER_SIZE;
    ensure!(
        start + len <= range.end,
        "inline key of {} bytes beyond chunk",
        len
    );
    Ok(start..start + len)
}

fn record_area_range(data: &[u8], slot: u32) -> Result<std::ops::Range<usize>> {
    let range = chunk_range(data, slot)?;
    let key = key_inline_range(data, slot)?;
    Ok(key.end..range.end)
}

fn live_bytes(data: &[u8]) -> usize {
    let count = count_of(data);
    (0..count).map(|i| upfront::entry(data, i).1 as usize).sum()
}

/// Whether slots of the given `(key_inline_len, record_area_len)` shapes
/// would fit on top of the current content, counting a rearrange as free.
fn fits_slots_in(data: &[u8], shapes: &[(usize, usize)]) -> bool {
    if count_of(data) + shapes.len() as u32 > upfront::capacity(data) {
        return false;
    }
    let needed: usize = shapes
        .iter()
        .map(|&(k, a)| CHUNK_HEADER_SIZE + k + a)
        .sum();
    live_bytes(data) + needed <= upfront::full_size(data) as usize
}

impl<'a> VlenNode<'a> {
    pub fn new(data: &'a [u8], cfg: NodeCfg) -> Result<Self> {
        ensure!(
            data.len() == cfg.page_size,
            "page buffer has {} bytes, expected {}",
            data.len(),
            cfg.page_size
        );
        Ok(Self { data, cfg })
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn capacity(&self) -> u32 {
        upfront::capacity(self.data)
    }

    pub fn key_inline(&self, slot: u32) -> Result<&'a [u8]> {
        let range = key_inline_range(self.data, slot)?;
        Ok(&self.data[range])
    }

    pub fn key_flags(&self, slot: u32) -> Result<u8> {
        key_flags_at(self.data, slot)
    }

    pub fn key_real_size(&self, slot: u32) -> Result<u16> {
        key_real_size_at(self.data, slot)
    }

    pub fn record_area(&self, slot: u32) -> Result<&'a [u8]> {
        let range = record_area_range(self.data, slot)?;
        Ok(&self.data[range])
    }

    pub fn fits_slots(&self, shapes: &[(usize, usize)]) -> bool {
        fits_slots_in(self.data, shapes)
    }

    pub fn check_integrity(&self) -> Result<()> {
        check_integrity(self.data)
    }
}

impl<'a> VlenNodeMut<'a> {
    pub fn new(data: &'a mut [u8], cfg: NodeCfg) -> Result<Self> {
        ensure!(
            data.len() == cfg.page_size,
            "page buffer has {} bytes, expected {}",
            data.len(),
            cfg.page_size
        );
        Ok(Self { data, cfg })
    }

    /// Initializes an empty node, sizing the slot table from the
    /// statistics hint or an estimate.
    pub fn init(data: &mut [u8], cfg: NodeCfg, capacity_hint: u32) -> Result<()> {
        let usable = cfg.usable_size() - UPFRONT_HEADER_SIZE;
        let capacity = if capacity_hint > 0 {
            capacity_hint
        } else {
            (usable / (SLOT_ENTRY_SIZE + estimated_chunk(&cfg))) as u32
        }
        .max(4);

        let table = capacity as usize * SLOT_ENTRY_SIZE;
        ensure!(
            table + estimated_chunk(&cfg) <= usable,
            "slot table of {} entries does not fit a {}-byte page",
            capacity,
            cfg.page_size
        );

        upfront::set_capacity(data, capacity);
        upfront::set_freelist_count(data, 0);
        upfront::set_next_offset(data, 0);
        upfront::set_full_size(data, (usable - table) as u32);
        Ok(())
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.data
    }

    pub fn capacity(&self) -> u32 {
        upfront::capacity(self.data)
    }

    fn count(&self) -> u32 {
        count_of(self.data)
    }

    fn set_count(&mut self, count: u32) -> Result<()> {
        PBtreeNode::from_page_mut(self.data)?.set_count(count);
        Ok(())
    }

    pub fn record_area_ref(&self, slot: u32) -> Result<&[u8]> {
        let range = record_area_range(self.data, slot)?;
        Ok(&self.data[range])
    }

    pub fn set_key_flags(&mut self, slot: u32, flags: u8) -> Result<()> {
        let old = key_flags_at(self.data, slot)?;
        // the extended-key bit decides the inline width; it is fixed at
        // insert time
        ensure!(
            (old ^ flags) & KF_EXTENDED_KEY == 0,
            "cannot flip the extended-key flag in place"
        );
        let range = chunk_range(self.data, slot)?;
        self.data[range.start + 2] = flags;
        Ok(())
    }

    /// Bump, freelist, rearrange-and-retry; `None` means split required.
    fn allocate_space(&mut self, needed: u32) -> Result<Option<u32>> {
        if let Some(offset) = self.try_allocate(needed) {
            return Ok(Some(offset));
        }
        self.rearrange()?;
        Ok(self.try_allocate(needed))
    }

    fn try_allocate(&mut self, needed: u32) -> Option<u32> {
        let next = upfront::next_offset(self.data);
        let full = upfront::full_size(self.data);
        if next + needed <= full {
            upfront::set_next_offset(self.data, next + needed);
            return Some(next);
        }

        // reuse a recycled chunk; keep the remainder on the freelist so
        // next_offset stays the maximum chunk end
        let count = self.count();
        let fc = upfront::freelist_count(self.data);
        for i in count..count + fc {
            let (offset, size) = upfront::entry(self.data, i);
            if size >= needed {
                if size > needed {
                    upfront::set_entry(self.data, i, offset + needed, size - needed);
                } else {
                    let last = count + fc - 1;
                    let (lo, ls) = upfront::entry(self.data, last);
                    upfront::set_entry(self.data, i, lo, ls);
                    upfront::set_freelist_count(self.data, fc - 1);
                }
                return Some(offset);
            }
        }
        None
    }

    /// Compacts live chunks to the front of the data area in slot order
    /// and resets the freelist.
    pub fn rearrange(&mut self) -> Result<()> {
        let count = self.count();
        let area_start = upfront::data_area_start(self.data);
        let area = self.data[area_start..].to_vec();

        let mut slots: Vec<(u32, u32, u32)> = (0..count)
            .map(|i| {
                let (offset, size) = upfront::entry(self.data, i);
                (i, offset, size)
            })
            .collect();
        slots.sort_by_key(|&(_, offset, _)| offset);

        let mut write = 0u32;
        for (slot, offset, size) in slots {
            self.data[area_start + write as usize..area_start + (write + size) as usize]
                .copy_from_slice(&area[offset as usize..(offset + size) as usize]);
            upfront::set_entry(self.data, slot, write, size);
            write += size;
        }

        upfront::set_freelist_count(self.data, 0);
        upfront::set_next_offset(self.data, write);
        Ok(())
    }

    /// Whether a new slot of the given shape cannot be placed even after
    /// a rearrange.
    pub fn requires_split(&self, key_inline_len: usize, record_area_len: usize) -> bool {
        let count = self.count();
        if count >= self.capacity() {
            return true;
        }
        let needed = (CHUNK_HEADER_SIZE + key_inline_len + record_area_len) as u32;
        let free_after_rearrange =
            upfront::full_size(self.data) - live_bytes(self.data) as u32;
        needed > free_after_rearrange
    }

    pub fn insert_slot(
        &mut self,
        slot: u32,
        key_inline: &[u8],
        key_flags: u8,
        key_real_size: u16,
        record_area: &[u8],
    ) -> Result<SpaceOutcome> {
        ensure!(
            key_inline.len() == inline_key_len(key_flags, key_real_size),
            "inline key length {} does not match flags/size",
            key_inline.len()
        );
        let count = self.count();
        ensure!(slot <= count, "insert slot {} past count {}", slot, count);

        // entry table full of live + recycled entries: compact first so
        // the shift below has room
        if count + upfront::freelist_count(self.data) >= self.capacity() {
            self.rearrange()?;
        }
        if count >= self.capacity() {
            return Ok(SpaceOutcome::NeedsSplit);
        }

        let needed = (CHUNK_HEADER_SIZE + key_inline.len() + record_area.len()) as u32;
        let Some(offset) = self.allocate_space(needed)? else {
            return Ok(SpaceOutcome::NeedsSplit);
        };

        let fc = upfront::freelist_count(self.data);
        upfront::shift_entries_right(self.data, slot, count + fc);
        upfront::set_entry(self.data, slot, offset, needed);
        self.set_count(count + 1)?;

        let start = upfront::data_area_start(self.data) + offset as usize;
        self.data[start..start + 2].copy_from_slice(&key_real_size.to_le_bytes());
        self.data[start + 2] = key_flags;
        self.data[start + 3..start + 3 + key_inline.len()].copy_from_slice(key_inline);
        self.data[start + 3 + key_inline.len()..start + needed as usize]
            .copy_from_slice(record_area);
        Ok(SpaceOutcome::Fit)
    }

    pub fn erase_slot(&mut self, slot: u32) -> Result<()> {
        let count = self.count();
        ensure!(slot < count, "erase slot {} out of {}", slot, count);

        let (offset, size) = upfront::entry(self.data, slot);
        let fc = upfront::freelist_count(self.data);

        upfront::shift_entries_left(self.data, slot + 1, count + fc);
        // the vacated tail entry becomes the freelist's newest member
        upfront::set_entry(self.data, count + fc - 1, offset, size);
        upfront::set_freelist_count(self.data, fc + 1);
        self.set_count(count - 1)?;

        if fc + 1 > REARRANGE_FREELIST_MAX {
            self.rearrange()?;
        }
        Ok(())
    }

    pub fn replace_record_area(&mut self, slot: u32, record_area: &[u8]) -> Result<SpaceOutcome> {
        let count = self.count();
        ensure!(slot < count, "slot {} out of {}", slot, count);

        let (offset, size) = upfront::entry(self.data, slot);
        let key_range = key_inline_range(self.data, slot)?;
        let area_start_in_page = key_range.end;
        let chunk_start = upfront::data_area_start(self.data) + offset as usize;
        let key_part = area_start_in_page - chunk_start;
        let new_size = (key_part + record_area.len()) as u32;

        if new_size <= size {
            // shrink or same-size: write in place; the cut-off tail goes
            // to the freelist when the entry table has room, otherwise it
            // stays as slack inside the chunk until the next rearrange
            self.data[area_start_in_page..area_start_in_page + record_area.len()]
                .copy_from_slice(record_area);
            let fc = upfront::freelist_count(self.data);
            if new_size < size && count + fc < self.capacity() {
                upfront::set_entry(self.data, slot, offset, new_size);
                self.push_freelist(offset + new_size, size - new_size)?;
            }
            return Ok(SpaceOutcome::Fit);
        }

        // growth: check that the slot can be re-placed, then move it
        let budget = upfront::full_size(self.data) as usize;
        if live_bytes(self.data) - size as usize + new_size as usize > budget {
            return Ok(SpaceOutcome::NeedsSplit);
        }

        let mut key_size_bytes = [0u8; 2];
        key_size_bytes.copy_from_slice(&self.data[chunk_start..chunk_start + 2]);
        let key_flags = self.data[chunk_start + 2];
        let key_inline = self.data[key_range.clone()].to_vec();

        self.erase_slot(slot)?;
        let outcome = self.insert_slot(
            slot,
            &key_inline,
            key_flags,
            u16::from_le_bytes(key_size_bytes),
            record_area,
        )?;
        ensure!(
            outcome == SpaceOutcome::Fit,
            "record area regrow failed after space check"
        );
        Ok(SpaceOutcome::Fit)
    }

    /// Appends a recycled chunk to the freelist. The caller must have
    /// checked that the entry table has room.
    fn push_freelist(&mut self, offset: u32, size: u32) -> Result<()> {
        let count = self.count();
        let fc = upfront::freelist_count(self.data);
        ensure!(count + fc < self.capacity(), "freelist push without room");
        upfront::set_entry(self.data, count + fc, offset, size);
        upfront::set_freelist_count(self.data, fc + 1);
        if fc + 1 > REARRANGE_FREELIST_MAX {
            self.rearrange()?;
        }
        Ok(())
    }

    /// Drops slots `[from, count)`, recycling their chunks.
    pub fn truncate(&mut self, from: u32) -> Result<()> {
        let count = self.count();
        ensure!(from <= count, "truncate from {} past count {}", from, count);

        let dropped: Vec<(u32, u32)> = (from..count)
            .map(|i| upfront::entry(self.data, i))
            .collect();
        let fc = upfront::freelist_count(self.data);

        // slide the freelist region down to sit right after the new live
        // region
        for i in 0..fc {
            let (offset, size) = upfront::entry(self.data, count + i);
            upfront::set_entry(self.data, from + i, offset, size);
        }
        for (i, &(offset, size)) in dropped.iter().enumerate() {
            upfront::set_entry(self.data, from + fc + i as u32, offset, size);
        }
        upfront::set_freelist_count(self.data, fc + dropped.len() as u32);
        self.set_count(from)?;

        if fc + dropped.len() as u32 > REARRANGE_FREELIST_MAX {
            self.rearrange()?;
        }
        Ok(())
    }
}

/// Structural invariants: chunks in bounds and non-overlapping across live
/// and freelist entries, and `next_offset` equal to the maximum chunk end.
fn check_integrity(data: &[u8]) -> Result<()> {
    let count = count_of(data);
    let fc = upfront::freelist_count(data);
    let capacity = upfront::capacity(data);
    let full = upfront::full_size(data);

    if count + fc > capacity {
        return ErrorKind::IntegrityViolated
            .raise()
            .map_err(|e| e.wrap_err("slot table overflow"));
    }

    let mut chunks: Vec<(u32, u32)> = (0..count + fc).map(|i| upfront::entry(data, i)).collect();
    chunks.sort_unstable();

    let mut max_end = 0u32;
    let mut prev_end = 0u32;
    for &(offset, size) in &chunks {
        if offset + size > full {
            return ErrorKind::IntegrityViolated
                .raise()
                .map_err(|e| e.wrap_err("chunk beyond data area"));
        }
        if offset < prev_end {
            return ErrorKind::IntegrityViolated
                .raise()
                .map_err(|e| e.wrap_err("overlapping chunks"));
        }
        prev_end = offset + size;
        max_end = max_end.max(prev_end);
    }

    if upfront::next_offset(data) != max_end {
        return ErrorKind::IntegrityViolated
            .raise()
            .map_err(|e| e.wrap_err("next_offset out of sync"));
    }
    Ok(())
}
