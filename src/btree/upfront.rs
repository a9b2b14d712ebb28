//! # Upfront Index
//!
//! The slot table at the front of a default-layout node. Sixteen header
//! bytes, then `capacity` four-byte slot entries:
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  -----------------------------------------------
//! 0       4     capacity        total slot entries (live + free + unused)
//! 4       4     freelist_count  recycled chunk entries after the live ones
//! 8       4     next_offset     bump pointer into the data area
//! 12      4     full_size       data area size in bytes
//! 16      4×N   entries         offset u16, size u16
//! ```
//!
//! The first `count` entries (count lives in the node header) are live
//! slots; the next `freelist_count` entries describe recycled chunks
//! available for reuse; the rest are unused. Chunk offsets are relative to
//! the data area, which starts right after the last slot entry.
//!
//! Everything here is plain offset arithmetic over the page buffer with
//! explicit little-endian conversion; the layout logic sits in
//! [`super::vlen`].

use crate::config::{NODE_HEADER_SIZE, PAGE_HEADER_SIZE};

pub(crate) const UPFRONT_HEADER_SIZE: usize = 16;
pub(crate) const SLOT_ENTRY_SIZE: usize = 4;

/// Byte offset of the upfront index inside a page buffer.
pub(crate) const UPFRONT_BASE: usize = PAGE_HEADER_SIZE + NODE_HEADER_SIZE;

fn read_u32(data: &[u8], at: usize) -> u32 {
    u32::from_le_bytes(data[at..at + 4].try_into().unwrap())
}

fn write_u32(data: &mut [u8], at: usize, value: u32) {
    data[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn read_u16(data: &[u8], at: usize) -> u16 {
    u16::from_le_bytes(data[at..at + 2].try_into().unwrap())
}

fn write_u16(data: &mut [u8], at: usize, value: u16) {
    data[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn capacity(data: &[u8]) -> u32 {
    read_u32(data, UPFRONT_BASE)
}

pub(crate) fn set_capacity(data: &mut [u8], capacity: u32) {
    write_u32(data, UPFRONT_BASE, capacity);
}

pub(crate) fn freelist_count(data: &[u8]) -> u32 {
    read_u32(data, UPFRONT_BASE + 4)
}

pub(crate) fn set_freelist_count(data: &mut [u8], count: u32) {
    write_u32(data, UPFRONT_BASE + 4, count);
}

pub(crate) fn next_offset(data: &[u8]) -> u32 {
    read_u32(data, UPFRONT_BASE + 8)
}

pub(crate) fn set_next_offset(data: &mut [u8], offset: u32) {
    write_u32(data, UPFRONT_BASE + 8, offset);
}

pub(crate) fn full_size(data: &[u8]) -> u32 {
    read_u32(data, UPFRONT_BASE + 12)
}

pub(crate) fn set_full_size(data: &mut [u8], size: u32) {
    write_u32(data, UPFRONT_BASE + 12, size);
}

/// Byte offset of slot entry `idx` inside the page buffer.
fn entry_at(idx: u32) -> usize {
    UPFRONT_BASE + UPFRONT_HEADER_SIZE + idx as usize * SLOT_ENTRY_SIZE
}

/// Byte offset of the data area inside the page buffer.
pub(crate) fn data_area_start(data: &[u8]) -> usize {
    UPFRONT_BASE + UPFRONT_HEADER_SIZE + capacity(data) as usize * SLOT_ENTRY_SIZE
}

/// Chunk `(offset, size)` of entry `idx`, offsets relative to the data
/// area.
pub(crate) fn entry(data: &[u8], idx: u32) -> (u32, u32) {
    let at = entry_at(idx);
    (read_u16(data, at) as u32, read_u16(data, at + 2) as u32)
}

pub(crate) fn set_entry(data: &mut [u8], idx: u32, offset: u32, size: u32) {
    debug_assert!(offset <= u16::MAX as u32 && size <= u16::MAX as u32);
    let at = entry_at(idx);
    write_u16(data, at, offset as u16);
    write_u16(data, at + 2, size as u16);
}

/// Shifts entries `[from, upto)` one position right; the caller owns
/// keeping `count`/`freelist_count` consistent.
pub(crate) fn shift_entries_right(data: &mut [u8], from: u32, upto: u32) {
    let src = entry_at(from);
    let dst = entry_at(from + 1);
    let len = (upto - from) as usize * SLOT_ENTRY_SIZE;
    data.copy_within(src..src + len, dst);
}

/// Shifts entries `[from, upto)` one position left.
pub(crate) fn shift_entries_left(data: &mut [u8], from: u32, upto: u32) {
    let src = entry_at(from);
    let dst = entry_at(from - 1);
    let len = (upto - from) as usize * SLOT_ENTRY_SIZE;
    data.copy_within(src..src + len, dst);
}
