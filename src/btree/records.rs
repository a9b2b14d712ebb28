//! # Record Entries and Record Areas
//!
//! A *record entry* is the fixed-width cell a node stores per record:
//!
//! - Internal mode: 8 bytes, the child page address.
//! - Fixed mode: the record bytes verbatim (`rec_size` wide).
//! - Default mode: 9 bytes, one flag byte plus an 8-byte cell that holds
//!   the record inline when it fits or a blob id otherwise:
//!
//! ```text
//! flags        cell
//! -----------  -------------------------------
//! REC_EMPTY    unused
//! REC_TINY     payload in cell[0..n], n = cell[7] (1..=7)
//! REC_SMALL    payload is the whole cell (exactly 8 bytes)
//! (none)       cell = blob id of the record payload
//! ```
//!
//! A *record area* is everything a slot stores about its records. With a
//! duplicate counter (default-layout leaves) it is `[count u8][count ×
//! entry]`, or an 8-byte duplicate-table blob id once the
//! `KF_EXTENDED_DUPLICATES` key flag is set. Without a counter (internal
//! nodes, PAX leaves) it is exactly one entry.
//!
//! The area editors below are pure byte transforms; the tree decides when
//! an area migrates to an external table.

use eyre::{ensure, Result};

use crate::blob;
use crate::error::ErrorKind;
use crate::pager::PageManager;

/// Record size class: empty record.
pub(crate) const REC_EMPTY: u8 = 0x01;
/// Record size class: 1..=7 bytes inline, length in the cell's last byte.
pub(crate) const REC_TINY: u8 = 0x02;
/// Record size class: exactly 8 bytes inline.
pub(crate) const REC_SMALL: u8 = 0x04;

/// Width of a default-mode entry: 1 flag byte + 8 cell bytes.
pub(crate) const ENTRY_DEFAULT_WIDTH: usize = 9;

/// Encodes a record into a default entry if it fits inline.
pub(crate) fn encode_inline(record: &[u8]) -> Option<[u8; ENTRY_DEFAULT_WIDTH]> {
    let mut entry = [0u8; ENTRY_DEFAULT_WIDTH];
    match record.len() {
        0 => entry[0] = REC_EMPTY,
        1..=7 => {
            entry[0] = REC_TINY;
            entry[1..1 + record.len()].copy_from_slice(record);
            entry[8] = record.len() as u8;
        }
        8 => {
            entry[0] = REC_SMALL;
            entry[1..9].copy_from_slice(record);
        }
        _ => return None,
    }
    Some(entry)
}

/// Encodes a blob-backed record entry.
pub(crate) fn encode_blob_entry(blob_id: u64) -> [u8; ENTRY_DEFAULT_WIDTH] {
    let mut entry = [0u8; ENTRY_DEFAULT_WIDTH];
    entry[1..9].copy_from_slice(&blob_id.to_le_bytes());
    entry
}

/// The blob id of a default entry, if it is blob-backed.
pub(crate) fn entry_blob_id(entry: &[u8]) -> Option<u64> {
    if entry.len() == ENTRY_DEFAULT_WIDTH && entry[0] & (REC_EMPTY | REC_TINY | REC_SMALL) == 0 {
        Some(u64::from_le_bytes(entry[1..9].try_into().unwrap()))
    } else {
        None
    }
}

/// Decodes a default entry back into record bytes.
pub(crate) fn decode_entry(pager: &mut PageManager, entry: &[u8]) -> Result<Vec<u8>> {
    ensure!(
        entry.len() == ENTRY_DEFAULT_WIDTH,
        "default record entry has {} bytes",
        entry.len()
    );
    let flags = entry[0];
    if flags & REC_EMPTY != 0 {
        return Ok(Vec::new());
    }
    if flags & REC_TINY != 0 {
        let len = entry[8] as usize;
        if !(1..=7).contains(&len) {
            return ErrorKind::IntegrityViolated.raise();
        }
        return Ok(entry[1..1 + len].to_vec());
    }
    if flags & REC_SMALL != 0 {
        return Ok(entry[1..9].to_vec());
    }
    let blob_id = u64::from_le_bytes(entry[1..9].try_into().unwrap());
    blob::read(pager, blob_id)
}

/// Builds a record area holding a single entry.
pub(crate) fn area_single(has_counter: bool, entry: &[u8]) -> Vec<u8> {
    if has_counter {
        let mut area = Vec::with_capacity(1 + entry.len());
        area.push(1);
        area.extend_from_slice(entry);
        area
    } else {
        entry.to_vec()
    }
}

/// Number of entries in an inline record area.
pub(crate) fn area_count(has_counter: bool, area: &[u8]) -> u32 {
    if has_counter {
        area.first().copied().unwrap_or(0) as u32
    } else {
        1
    }
}

/// Borrows entry `idx` from an inline record area.
pub(crate) fn area_entry<'a>(
    has_counter: bool,
    width: usize,
    area: &'a [u8],
    idx: u32,
) -> Result<&'a [u8]> {
    let count = area_count(has_counter, area);
    ensure!(idx < count, "record index {} out of {}", idx, count);
    let base = if has_counter { 1 } else { 0 };
    let start = base + idx as usize * width;
    ensure!(
        start + width <= area.len(),
        "record entry {} beyond area of {} bytes",
        idx,
        area.len()
    );
    Ok(&area[start..start + width])
}

/// Returns a copy of the area with `entry` inserted at `pos`.
pub(crate) fn area_insert(
    has_counter: bool,
    width: usize,
    area: &[u8],
    pos: u32,
    entry: &[u8],
) -> Result<Vec<u8>> {
    ensure!(entry.len() == width, "entry width mismatch");
    ensure!(has_counter, "cannot add records without a duplicate counter");

    let count = area_count(has_counter, area) as usize;
    let pos = (pos as usize).min(count);
    debug_assert!(count < 127, "inline duplicate counter overflow");

    let mut out = Vec::with_capacity(area.len() + width);
    out.push((count + 1) as u8);
    out.extend_from_slice(&area[1..1 + pos * width]);
    out.extend_from_slice(entry);
    out.extend_from_slice(&area[1 + pos * width..1 + count * width]);
    Ok(out)
}

/// Returns a copy of the area with entry `pos` removed.
pub(crate) fn area_remove(
    has_counter: bool,
    width: usize,
    area: &[u8],
    pos: u32,
) -> Result<Vec<u8>> {
    ensure!(has_counter, "cannot remove records without a duplicate counter");
    let count = area_count(has_counter, area) as usize;
    let pos = pos as usize;
    ensure!(pos < count, "record index {} out of {}", pos, count);

    let mut out = Vec::with_capacity(area.len().saturating_sub(width));
    out.push((count - 1) as u8);
    out.extend_from_slice(&area[1..1 + pos * width]);
    out.extend_from_slice(&area[1 + (pos + 1) * width..1 + count * width]);
    Ok(out)
}

/// Returns a copy of the area with entry `idx` overwritten.
pub(crate) fn area_set(
    has_counter: bool,
    width: usize,
    area: &[u8],
    idx: u32,
    entry: &[u8],
) -> Result<Vec<u8>> {
    ensure!(entry.len() == width, "entry width mismatch");
    let count = area_count(has_counter, area);
    ensure!(idx < count, "record index {} out of {}", idx, count);

    let mut out = area.to_vec();
    let base = if has_counter { 1 } else { 0 };
    let start = base + idx as usize * width;
    out[start..start + width].copy_from_slice(entry);
    Ok(out)
}

/// The record area of a slot whose duplicates moved to an external table.
pub(crate) fn area_ext_dup(table_blob_id: u64) -> Vec<u8> {
    table_blob_id.to_le_bytes().to_vec()
}

/// Reads the duplicate-table blob id back out of an extended area. The
/// area may carry trailing slack from an in-place shrink.
pub(crate) fn area_ext_dup_id(area: &[u8]) -> Result<u64> {
    ensure!(
        area.len() >= 8,
        "extended duplicate area has {} bytes",
        area.len()
    );
    Ok(u64::from_le_bytes(area[..8].try_into().unwrap()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::metrics::Metrics;
    use std::sync::Arc;

    fn pager() -> PageManager {
        let mut pager = PageManager::new(
            Box::new(MemoryDevice::new()),
            1024,
            64 * 1024,
            false,
            false,
            Arc::new(Metrics::default()),
        );
        // keep address 0 for the would-be header page
        let _ = pager.alloc(crate::page::PageType::Header).unwrap();
        pager.flush_changeset(false).unwrap();
        pager
    }

    #[test]
    fn empty_record_encodes_inline() {
        let entry = encode_inline(b"").unwrap();
        assert_eq!(entry[0], REC_EMPTY);
        assert_eq!(decode_entry(&mut pager(), &entry).unwrap(), b"");
    }

    #[test]
    fn tiny_record_encodes_inline() {
        let entry = encode_inline(b"abc").unwrap();
        assert_eq!(entry[0], REC_TINY);
        assert_eq!(entry[8], 3);
        assert_eq!(decode_entry(&mut pager(), &entry).unwrap(), b"abc");
    }

    #[test]
    fn eight_byte_record_encodes_small() {
        let entry = encode_inline(b"exactly8").unwrap();
        assert_eq!(entry[0], REC_SMALL);
        assert_eq!(decode_entry(&mut pager(), &entry).unwrap(), b"exactly8");
    }

    #[test]
    fn nine_byte_record_does_not_fit_inline() {
        assert!(encode_inline(b"ninebytes").is_none());
    }

    #[test]
    fn blob_entry_round_trips_through_the_blob_manager() {
        let mut pager = pager();
        let payload = vec![7u8; 500];
        let blob_id = crate::blob::alloc(&mut pager, &payload).unwrap();

        let entry = encode_blob_entry(blob_id);
        assert_eq!(entry_blob_id(&entry), Some(blob_id));
        assert_eq!(decode_entry(&mut pager, &entry).unwrap(), payload);
    }

    #[test]
    fn inline_entries_report_no_blob() {
        assert_eq!(entry_blob_id(&encode_inline(b"x").unwrap()), None);
        assert_eq!(entry_blob_id(&encode_inline(b"").unwrap()), None);
    }

    #[test]
    fn area_editing_keeps_order() {
        let width = ENTRY_DEFAULT_WIDTH;
        let a = encode_inline(b"a").unwrap();
        let b = encode_inline(b"b").unwrap();
        let c = encode_inline(b"c").unwrap();

        let area = area_single(true, &a);
        assert_eq!(area_count(true, &area), 1);

        // append, then insert in front
        let area = area_insert(true, width, &area, 1, &c).unwrap();
        let area = area_insert(true, width, &area, 1, &b).unwrap();
        assert_eq!(area_count(true, &area), 3);
        assert_eq!(area_entry(true, width, &area, 0).unwrap(), &a);
        assert_eq!(area_entry(true, width, &area, 1).unwrap(), &b);
        assert_eq!(area_entry(true, width, &area, 2).unwrap(), &c);

        let area = area_remove(true, width, &area, 1).unwrap();
        assert_eq!(area_count(true, &area), 2);
        assert_eq!(area_entry(true, width, &area, 1).unwrap(), &c);

        let area = area_set(true, width, &area, 0, &b).unwrap();
        assert_eq!(area_entry(true, width, &area, 0).unwrap(), &b);
    }

    #[test]
    fn counterless_area_is_one_entry() {
        let child = 4096u64.to_le_bytes();
        let area = area_single(false, &child);

        assert_eq!(area_count(false, &area), 1);
        assert_eq!(area_entry(false, 8, &area, 0).unwrap(), &child);
    }

    #[test]
    fn ext_dup_area_round_trip() {
        let area = area_ext_dup(123456);
        assert_eq!(area_ext_dup_id(&area).unwrap(), 123456);
    }
}
