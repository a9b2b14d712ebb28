//! # Write-Ahead Journal
//!
//! Crash atomicity for changeset flushes. Every committed changeset is
//! appended to the journal (before-images, after-images, then a
//! checkpoint marker) and fsync'd before any of its pages overwrite
//! their home locations in the data file. Recovery replays after-images
//! that are newer than the on-disk pages.
//!
//! ## Files
//!
//! Two log files rotate: `<path>.jrn0` and `<path>.jrn1`. Appends go to
//! the current file. When a checkpoint lands and the current file has
//! outgrown the rotation threshold, the sibling is truncated and becomes
//! current; everything in it is older than the checkpoint that was just
//! flushed to the data file, so nothing of value is lost.
//!
//! ## Record format
//!
//! ```text
//! +--------------------+---------------+----------+
//! | Record header (16) | Payload (N)   | CRC32 (4)|
//! +--------------------+---------------+----------+
//!
//! Offset  Size  Field
//! ------  ----  -------------------------------
//! 0       8     lsn
//! 8       1     record type (1 = before-image,
//!               2 = page-flush, 3 = checkpoint)
//! 9       1     reserved
//! 10      2     db_name
//! 12      4     payload length
//! ```
//!
//! Page-image payloads are `{address: u64, image: page_size bytes}`;
//! checkpoint payloads are empty. The CRC (CRC-32/iSCSI) covers header
//! and payload. A record that fails its CRC, or runs past the end of the
//! file, is a torn tail: that file contributes nothing further.
//!
//! ## Recovery
//!
//! Only changesets whose checkpoint marker made it to disk are replayed;
//! a torn batch without its marker was never acted upon (pages are only
//! written after the whole batch is fsync'd), so skipping it is the
//! correct rollback. Replay applies page-flush images in LSN order
//! wherever the image LSN is newer than the page's on-disk LSN, which
//! makes it idempotent.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::JOURNAL_SWITCH_THRESHOLD;
use crate::device::Device;
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::page::PPageHeader;
use crate::pager::ChangesetEntry;

pub const JOURNAL_MAGIC: [u8; 4] = *b"CJL\0";
pub const JOURNAL_FILE_HEADER_SIZE: u64 = 16;
pub const JOURNAL_RECORD_HEADER_SIZE: usize = 16;

/// Upper bound on a single payload; a page image plus its address.
const MAX_PAYLOAD: u32 = (64 * 1024 + 8) as u32;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    BeforePage = 1,
    PageFlush = 2,
    CheckpointEnd = 3,
}

impl RecordType {
    fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(RecordType::BeforePage),
            2 => Some(RecordType::PageFlush),
            3 => Some(RecordType::CheckpointEnd),
            _ => None,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
struct PJournalRecord {
    lsn: U64,
    rec_type: u8,
    reserved: u8,
    db_name: U16,
    payload_length: U32,
}

const _: () = assert!(std::mem::size_of::<PJournalRecord>() == JOURNAL_RECORD_HEADER_SIZE);

/// One decoded journal record.
struct Record {
    lsn: u64,
    rec_type: RecordType,
    payload: Vec<u8>,
}

pub struct Journal {
    paths: [PathBuf; 2],
    files: [File; 2],
    /// Append offsets; `JOURNAL_FILE_HEADER_SIZE` when a file is empty.
    offsets: [u64; 2],
    current: usize,
    lsn: u64,
    threshold: u64,
    metrics: Arc<Metrics>,
}

fn journal_paths(base: &Path) -> [PathBuf; 2] {
    let name = base
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "coffer".into());
    let dir = base.parent().unwrap_or_else(|| Path::new("."));
    [
        dir.join(format!("{}.jrn0", name)),
        dir.join(format!("{}.jrn1", name)),
    ]
}

fn write_file_header(file: &mut File) -> Result<()> {
    file.set_len(0).wrap_err("failed to truncate journal file")?;
    file.seek(SeekFrom::Start(0))?;
    let mut header = [0u8; JOURNAL_FILE_HEADER_SIZE as usize];
    header[..4].copy_from_slice(&JOURNAL_MAGIC);
    file.write_all(&header)
        .wrap_err("failed to write journal file header")?;
    Ok(())
}

impl Journal {
    /// Creates a fresh, empty journal; existing files are truncated.
    pub fn create(base: &Path, metrics: Arc<Metrics>) -> Result<Self> {
        let paths = journal_paths(base);
        let mut files = Vec::with_capacity(2);
        for path in &paths {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .wrap_err_with(|| format!("failed to create journal file '{}'", path.display()))?;
            write_file_header(&mut file)?;
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two files");

        Ok(Self {
            paths,
            files,
            offsets: [JOURNAL_FILE_HEADER_SIZE; 2],
            current: 0,
            lsn: 0,
            threshold: JOURNAL_SWITCH_THRESHOLD,
            metrics,
        })
    }

    /// Opens existing journal files, creating empty ones where missing.
    /// The LSN counter resumes past the highest record seen.
    pub fn open(base: &Path, metrics: Arc<Metrics>) -> Result<Self> {
        let paths = journal_paths(base);
        let mut files = Vec::with_capacity(2);
        let mut offsets = [JOURNAL_FILE_HEADER_SIZE; 2];
        let mut max_lsn = 0u64;
        let mut current = 0usize;

        for (i, path) in paths.iter().enumerate() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .wrap_err_with(|| format!("failed to open journal file '{}'", path.display()))?;

            let len = file.metadata()?.len();
            if len < JOURNAL_FILE_HEADER_SIZE {
                write_file_header(&mut file)?;
            } else {
                let mut magic = [0u8; 4];
                file.seek(SeekFrom::Start(0))?;
                file.read_exact(&mut magic)?;
                if magic != JOURNAL_MAGIC {
                    return ErrorKind::InvalidFileHeader
                        .raise()
                        .wrap_err_with(|| format!("journal file '{}'", path.display()));
                }
                let records = scan_records(&mut file)?;
                let mut end = JOURNAL_FILE_HEADER_SIZE;
                for record in &records {
                    max_lsn = max_lsn.max(record.lsn);
                    end += (JOURNAL_RECORD_HEADER_SIZE + record.payload.len() + 4) as u64;
                }
                offsets[i] = end;
            }
            files.push(file);
        }
        let files: [File; 2] = files.try_into().expect("two files");

        // keep appending to the fuller file so rotation stays meaningful
        if offsets[1] > offsets[0] {
            current = 1;
        }

        Ok(Self {
            paths,
            files,
            offsets,
            current,
            lsn: max_lsn,
            threshold: JOURNAL_SWITCH_THRESHOLD,
            metrics,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.iter().all(|&o| o == JOURNAL_FILE_HEADER_SIZE)
    }

    pub fn current_lsn(&self) -> u64 {
        self.lsn
    }

    /// Monotone, gap-free LSN source for modifying operations.
    pub fn next_lsn(&mut self) -> u64 {
        self.lsn += 1;
        self.lsn
    }

    /// Raises the LSN floor, e.g. to the header page's LSN at open.
    pub fn set_lsn_floor(&mut self, lsn: u64) {
        self.lsn = self.lsn.max(lsn);
    }

    #[cfg(test)]
    fn set_threshold(&mut self, threshold: u64) {
        self.threshold = threshold;
    }

    fn append_record(
        &mut self,
        lsn: u64,
        rec_type: RecordType,
        db_name: u16,
        payload: &[u8],
    ) -> Result<()> {
        let header = PJournalRecord {
            lsn: U64::new(lsn),
            rec_type: rec_type as u8,
            reserved: 0,
            db_name: U16::new(db_name),
            payload_length: U32::new(payload.len() as u32),
        };

        let mut digest = CRC32.digest();
        digest.update(header.as_bytes());
        digest.update(payload);
        let crc = digest.finalize();

        let file = &mut self.files[self.current];
        file.seek(SeekFrom::Start(self.offsets[self.current]))?;
        file.write_all(header.as_bytes())
            .wrap_err("failed to append journal record header")?;
        file.write_all(payload)
            .wrap_err("failed to append journal record payload")?;
        file.write_all(&crc.to_le_bytes())
            .wrap_err("failed to append journal record crc")?;

        let written = (JOURNAL_RECORD_HEADER_SIZE + payload.len() + 4) as u64;
        self.offsets[self.current] += written;
        Metrics::bump(&self.metrics.journal_records);
        Metrics::add(&self.metrics.journal_bytes, written);
        Ok(())
    }

    /// Appends a full changeset under one LSN and makes it durable:
    /// before-images, after-images, checkpoint marker, fsync. Must be
    /// called before any of the pages are written to the data file.
    pub fn append_changeset(
        &mut self,
        lsn: u64,
        db_name: u16,
        entries: &[ChangesetEntry],
    ) -> Result<()> {
        for entry in entries {
            if let Some(before) = &entry.before {
                let mut payload = Vec::with_capacity(8 + before.len());
                payload.extend_from_slice(&entry.page.address().to_le_bytes());
                payload.extend_from_slice(before);
                self.append_record(lsn, RecordType::BeforePage, db_name, &payload)?;
            }
        }
        for entry in entries {
            let image = entry.page.data();
            let mut payload = Vec::with_capacity(8 + image.len());
            payload.extend_from_slice(&entry.page.address().to_le_bytes());
            payload.extend_from_slice(&image);
            self.append_record(lsn, RecordType::PageFlush, db_name, &payload)?;
        }
        self.append_record(lsn, RecordType::CheckpointEnd, db_name, &[])?;

        self.files[self.current]
            .sync_data()
            .wrap_err("failed to fsync journal")?;

        self.maybe_rotate()?;
        Ok(())
    }

    /// After a checkpoint the sibling file's content is obsolete; once the
    /// current file outgrows the threshold, truncate the sibling and
    /// switch to it.
    fn maybe_rotate(&mut self) -> Result<()> {
        if self.offsets[self.current] < self.threshold {
            return Ok(());
        }
        let other = 1 - self.current;
        write_file_header(&mut self.files[other])?;
        self.offsets[other] = JOURNAL_FILE_HEADER_SIZE;
        self.current = other;
        Ok(())
    }

    /// Replays committed changesets into the device. Returns the number of
    /// page images applied. The journal is left intact; the caller clears
    /// it after the device is flushed.
    pub fn recover(&mut self, device: &mut dyn Device, page_size: usize) -> Result<u32> {
        let mut records = Vec::new();
        for file in &mut self.files {
            records.extend(scan_records(file)?);
        }

        // a changeset counts only if its checkpoint marker hit the disk
        let mut committed: Vec<u64> = records
            .iter()
            .filter(|r| r.rec_type == RecordType::CheckpointEnd)
            .map(|r| r.lsn)
            .collect();
        committed.sort_unstable();

        let mut flushes: Vec<&Record> = records
            .iter()
            .filter(|r| {
                r.rec_type == RecordType::PageFlush && committed.binary_search(&r.lsn).is_ok()
            })
            .collect();
        flushes.sort_by_key(|r| r.lsn);

        let mut applied = 0u32;
        for record in flushes {
            ensure!(
                record.payload.len() == 8 + page_size,
                "journal page image has {} bytes, expected {}",
                record.payload.len(),
                8 + page_size
            );
            let address = u64::from_le_bytes(record.payload[..8].try_into().unwrap());
            ensure!(
                address % page_size as u64 == 0,
                "journal page image for unaligned address {}",
                address
            );
            let image = &record.payload[8..];

            if address + page_size as u64 > device.len() {
                device.grow(address + page_size as u64)?;
            }

            let mut disk_header = [0u8; crate::config::PAGE_HEADER_SIZE];
            device.read(address, &mut disk_header)?;
            let disk_lsn = PPageHeader::from_bytes(&disk_header)?.lsn();

            if record.lsn > disk_lsn {
                device.write(address, image)?;
                applied += 1;
            }
        }

        device.flush()?;
        let max_lsn = records.iter().map(|r| r.lsn).max().unwrap_or(0);
        self.set_lsn_floor(max_lsn);
        Metrics::add(&self.metrics.recovery_replays, applied as u64);
        Ok(applied)
    }

    /// Truncates both files back to empty headers. The LSN counter keeps
    /// its value.
    pub fn clear(&mut self) -> Result<()> {
        for i in 0..2 {
            write_file_header(&mut self.files[i])?;
            self.offsets[i] = JOURNAL_FILE_HEADER_SIZE;
        }
        self.current = 0;
        Ok(())
    }

    /// Closes the journal. Unless `keep_files`, the files are truncated to
    /// empty so the next open starts clean.
    pub fn close(&mut self, keep_files: bool) -> Result<()> {
        if !keep_files {
            self.clear()?;
        }
        for file in &mut self.files {
            file.sync_data().wrap_err("failed to fsync journal at close")?;
        }
        Ok(())
    }

    pub fn paths(&self) -> &[PathBuf; 2] {
        &self.paths
    }
}

/// Reads every intact record of one file; stops at the first torn or
/// corrupt record.
fn scan_records(file: &mut File) -> Result<Vec<Record>> {
    let len = file.metadata()?.len();
    let mut records = Vec::new();
    let mut offset = JOURNAL_FILE_HEADER_SIZE;

    while offset + JOURNAL_RECORD_HEADER_SIZE as u64 + 4 <= len {
        file.seek(SeekFrom::Start(offset))?;
        let mut header_bytes = [0u8; JOURNAL_RECORD_HEADER_SIZE];
        if file.read_exact(&mut header_bytes).is_err() {
            break;
        }
        let Ok(header) = PJournalRecord::read_from_bytes(&header_bytes) else {
            break;
        };
        let payload_len = header.payload_length.get();
        if payload_len > MAX_PAYLOAD {
            break;
        }
        let Some(rec_type) = RecordType::from_code(header.rec_type) else {
            break;
        };
        let total = JOURNAL_RECORD_HEADER_SIZE as u64 + payload_len as u64 + 4;
        if offset + total > len {
            break;
        }

        let mut payload = vec![0u8; payload_len as usize];
        if file.read_exact(&mut payload).is_err() {
            break;
        }
        let mut crc_bytes = [0u8; 4];
        if file.read_exact(&mut crc_bytes).is_err() {
            break;
        }

        let mut digest = CRC32.digest();
        digest.update(&header_bytes);
        digest.update(&payload);
        if digest.finalize() != u32::from_le_bytes(crc_bytes) {
            break;
        }

        records.push(Record {
            lsn: header.lsn.get(),
            rec_type,
            payload,
        });
        offset += total;
    }

    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryDevice;
    use crate::page::Page;
    use crate::pager::Changeset;

    const PS: usize = 1024;

    fn metrics() -> Arc<Metrics> {
        Arc::new(Metrics::default())
    }

    fn entry_for(address: u64, lsn: u64, fill: u8) -> Changeset {
        let mut cs = Changeset::new();
        let page = Arc::new(Page::new(address, PS));
        cs.put(Arc::clone(&page), true);
        {
            let mut buf = page.data_mut();
            for b in buf[crate::config::PAGE_HEADER_SIZE..].iter_mut() {
                *b = fill;
            }
        }
        page.set_lsn(lsn).unwrap();
        cs
    }

    #[test]
    fn fresh_journal_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let journal = Journal::create(&dir.path().join("env.db"), metrics()).unwrap();

        assert!(journal.is_empty());
        assert_eq!(journal.current_lsn(), 0);
    }

    #[test]
    fn lsn_counter_is_monotone() {
        let dir = tempfile::tempdir().unwrap();
        let mut journal = Journal::create(&dir.path().join("env.db"), metrics()).unwrap();

        assert_eq!(journal.next_lsn(), 1);
        assert_eq!(journal.next_lsn(), 2);
        journal.set_lsn_floor(10);
        assert_eq!(journal.next_lsn(), 11);
        journal.set_lsn_floor(5);
        assert_eq!(journal.next_lsn(), 12);
    }

    #[test]
    fn open_resumes_lsn_past_existing_records() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");

        {
            let mut journal = Journal::create(&base, metrics()).unwrap();
            let lsn = journal.next_lsn();
            let cs = entry_for(PS as u64, lsn, 0xAB);
            journal.append_changeset(lsn, 1, cs.entries()).unwrap();
        }

        let journal = Journal::open(&base, metrics()).unwrap();
        assert!(!journal.is_empty());
        assert_eq!(journal.current_lsn(), 1);
    }

    #[test]
    fn recovery_applies_committed_images() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");
        let mut device = MemoryDevice::new();
        device.grow(2 * PS as u64).unwrap();

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn = journal.next_lsn();
        let cs = entry_for(PS as u64, lsn, 0xCD);
        journal.append_changeset(lsn, 1, cs.entries()).unwrap();

        // pages never reached the device; replay restores them
        let applied = journal.recover(&mut device, PS).unwrap();
        assert_eq!(applied, 1);

        let mut buf = [0u8; 4];
        device.read(PS as u64 + 100, &mut buf).unwrap();
        assert_eq!(buf, [0xCD; 4]);
    }

    #[test]
    fn recovery_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");
        let mut device = MemoryDevice::new();
        device.grow(2 * PS as u64).unwrap();

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn = journal.next_lsn();
        let cs = entry_for(PS as u64, lsn, 0xEE);
        journal.append_changeset(lsn, 1, cs.entries()).unwrap();

        assert_eq!(journal.recover(&mut device, PS).unwrap(), 1);
        // the image LSN now matches the on-disk page; nothing to redo
        assert_eq!(journal.recover(&mut device, PS).unwrap(), 0);
    }

    #[test]
    fn uncommitted_changesets_are_not_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");
        let mut device = MemoryDevice::new();
        device.grow(2 * PS as u64).unwrap();

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn = journal.next_lsn();
        let cs = entry_for(PS as u64, lsn, 0x11);
        // append the page image but no checkpoint marker
        let image_payload = {
            let entry = &cs.entries()[0];
            let image = entry.page.data();
            let mut p = Vec::new();
            p.extend_from_slice(&entry.page.address().to_le_bytes());
            p.extend_from_slice(&image);
            p
        };
        journal
            .append_record(lsn, RecordType::PageFlush, 1, &image_payload)
            .unwrap();

        assert_eq!(journal.recover(&mut device, PS).unwrap(), 0);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");
        let mut device = MemoryDevice::new();
        device.grow(2 * PS as u64).unwrap();

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn = journal.next_lsn();
        let cs = entry_for(PS as u64, lsn, 0x22);
        journal.append_changeset(lsn, 1, cs.entries()).unwrap();
        let good_end = journal.offsets[journal.current];

        // simulate a torn append: half a record header of garbage
        let file = &mut journal.files[journal.current];
        file.seek(SeekFrom::Start(good_end)).unwrap();
        file.write_all(&[0xFF; 9]).unwrap();

        let mut reopened = Journal::open(&base, metrics()).unwrap();
        assert_eq!(reopened.recover(&mut device, PS).unwrap(), 1);
    }

    #[test]
    fn corrupt_crc_truncates_the_scan() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");
        let mut device = MemoryDevice::new();
        device.grow(3 * PS as u64).unwrap();

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn1 = journal.next_lsn();
        let cs1 = entry_for(PS as u64, lsn1, 0x33);
        journal.append_changeset(lsn1, 1, cs1.entries()).unwrap();
        let first_end = journal.offsets[journal.current];

        let lsn2 = journal.next_lsn();
        let cs2 = entry_for(2 * PS as u64, lsn2, 0x44);
        journal.append_changeset(lsn2, 1, cs2.entries()).unwrap();

        // flip a byte inside the second batch's first record payload
        let file = &mut journal.files[journal.current];
        file.seek(SeekFrom::Start(first_end + 100)).unwrap();
        file.write_all(&[0xA5]).unwrap();

        let mut reopened = Journal::open(&base, metrics()).unwrap();
        let applied = reopened.recover(&mut device, PS).unwrap();

        // only the first changeset survives
        assert_eq!(applied, 1);
        let mut buf = [0u8; 1];
        device.read(2 * PS as u64 + 100, &mut buf).unwrap();
        assert_eq!(buf[0], 0);
    }

    #[test]
    fn clear_empties_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");

        let mut journal = Journal::create(&base, metrics()).unwrap();
        let lsn = journal.next_lsn();
        let cs = entry_for(PS as u64, lsn, 0x55);
        journal.append_changeset(lsn, 1, cs.entries()).unwrap();
        assert!(!journal.is_empty());

        journal.clear().unwrap();
        assert!(journal.is_empty());
        assert_eq!(journal.current_lsn(), 1);
    }

    #[test]
    fn rotation_truncates_the_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().join("env.db");

        let mut journal = Journal::create(&base, metrics()).unwrap();
        journal.set_threshold(1);

        for fill in 0..4u8 {
            let lsn = journal.next_lsn();
            let cs = entry_for(PS as u64, lsn, fill);
            journal.append_changeset(lsn, 1, cs.entries()).unwrap();
        }

        // each append overflowed the 1-byte threshold, so the sibling was
        // truncated every time; exactly one file holds one batch
        let sizes: Vec<u64> = journal.offsets.to_vec();
        assert_eq!(
            sizes
                .iter()
                .filter(|&&s| s > JOURNAL_FILE_HEADER_SIZE)
                .count(),
            1
        );
    }
}
