//! # Configuration Constants and Options
//!
//! This module centralizes the layout constants and the open/create options
//! for environments and databases. Constants that depend on each other are
//! co-located so a change to one is visible next to the values it affects.
//!
//! ## Size-derived thresholds
//!
//! Three thresholds scale with the page size and are used by the node
//! layouts:
//!
//! ```text
//! page size   extended-key threshold   inline-duplicate threshold
//! ---------   ----------------------   --------------------------
//! 1 KiB       64                       32
//! <= 8 KiB    128                      64
//! larger      256                      128
//! ```
//!
//! Keys longer than the extended threshold move to a blob; keys keep an
//! 8-byte blob-id inline. Once a key accumulates more inline duplicates than
//! the duplicate threshold, all of its records move to an external duplicate
//! table, marked by a key flag on the slot. The inline duplicate counter is
//! one byte; the thresholds are capped at 127 so the counter never
//! approaches its limit.
//!
//! ## Page geometry
//!
//! ```text
//! PAGE_HEADER_SIZE (16)      persistent header on every page
//! ENV_HEADER_SIZE (32)       environment header, page 0 payload start
//! DESCRIPTOR_SIZE (24)       per-database descriptor, after the env header
//! NODE_HEADER_SIZE (16)      b-tree node header, start of node payload
//! ```
//!
//! Page 0 must hold the page header, the environment header and
//! `max_databases` descriptors; [`max_databases_for_page_size`] gives the
//! ceiling.

use eyre::Result;

use crate::error::ErrorKind;
use crate::keys::KeyType;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 1024;

/// Largest supported page size. Chunk offsets inside a node are 16-bit,
/// which caps pages at 64 KiB.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Default page size for new environments.
pub const DEFAULT_PAGE_SIZE: usize = 16 * 1024;

/// Persistent header at the start of every page.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Environment header at the start of page 0's payload.
pub const ENV_HEADER_SIZE: usize = 32;

/// One per-database descriptor slot.
pub const DESCRIPTOR_SIZE: usize = 24;

/// B-tree node header at the start of a node page's payload.
pub const NODE_HEADER_SIZE: usize = 16;

/// Blob header at the start of a blob's first page payload.
pub const BLOB_HEADER_SIZE: usize = 24;

/// Default number of descriptor slots in new environments.
pub const DEFAULT_MAX_DATABASES: usize = 16;

/// Default page cache capacity in bytes.
pub const DEFAULT_CACHE_SIZE: usize = 2 * 1024 * 1024;

/// Records up to this many bytes are stored inline in the node.
pub const INLINE_RECORD_MAX: usize = 8;

/// The journal rotates to its sibling file once the current file exceeds
/// this many bytes at a checkpoint boundary.
pub const JOURNAL_SWITCH_THRESHOLD: u64 = 4 * 1024 * 1024;

/// A node with this many keys or fewer is a merge candidate.
pub const MERGE_THRESHOLD: u32 = 3;

/// A node rearranges its chunk area once this many freelist entries pile up.
pub const REARRANGE_FREELIST_MAX: u32 = 8;

/// Sentinel for "no fixed key size".
pub const KEY_SIZE_UNLIMITED: u16 = u16::MAX;

/// Sentinel for "no fixed record size".
pub const RECORD_SIZE_UNLIMITED: u32 = u32::MAX;

/// Keys longer than this threshold are moved to an extended-key blob.
pub fn extended_key_threshold(page_size: usize) -> usize {
    if page_size == 1024 {
        64
    } else if page_size <= 8 * 1024 {
        128
    } else {
        256
    }
}

/// Inline duplicates per key before the records move to an external table.
pub fn duplicate_threshold(page_size: usize) -> usize {
    let t = if page_size == 1024 {
        32
    } else if page_size <= 8 * 1024 {
        64
    } else {
        128
    };
    t.min(127)
}

/// Number of descriptor slots that fit on page 0.
pub fn max_databases_for_page_size(page_size: usize) -> usize {
    (page_size - PAGE_HEADER_SIZE - ENV_HEADER_SIZE) / DESCRIPTOR_SIZE
}

fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Options for [`Environment::create`] and [`Environment::open`].
///
/// [`Environment::create`]: crate::Environment::create
/// [`Environment::open`]: crate::Environment::open
#[derive(Debug, Clone)]
pub struct EnvOptions {
    pub(crate) page_size: usize,
    pub(crate) cache_size: usize,
    pub(crate) cache_unlimited: bool,
    pub(crate) max_databases: usize,
    pub(crate) in_memory: bool,
    pub(crate) read_only: bool,
    pub(crate) enable_journal: bool,
    pub(crate) auto_recovery: bool,
    pub(crate) dont_clear_log: bool,
    pub(crate) flush_when_committed: bool,
    pub(crate) disable_mmap: bool,
    pub(crate) file_mode: u32,
    pub(crate) log_directory: Option<std::path::PathBuf>,
}

impl EnvOptions {
    pub fn new() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            cache_size: DEFAULT_CACHE_SIZE,
            cache_unlimited: false,
            max_databases: DEFAULT_MAX_DATABASES,
            in_memory: false,
            read_only: false,
            enable_journal: true,
            auto_recovery: true,
            dont_clear_log: false,
            flush_when_committed: false,
            disable_mmap: false,
            file_mode: 0o644,
            log_directory: None,
        }
    }

    /// Page size in bytes; a power of two in `[1 KiB, 64 KiB]`.
    pub fn page_size(mut self, bytes: usize) -> Self {
        self.page_size = bytes;
        self
    }

    /// Page cache capacity in bytes.
    pub fn cache_size(mut self, bytes: usize) -> Self {
        self.cache_size = bytes;
        self
    }

    /// Never evict pages.
    pub fn cache_unlimited(mut self, yes: bool) -> Self {
        self.cache_unlimited = yes;
        self
    }

    /// Number of descriptor slots reserved on page 0. Only honored at
    /// create time.
    pub fn max_databases(mut self, n: usize) -> Self {
        self.max_databases = n;
        self
    }

    /// Keep everything in memory; no file, no journal.
    pub fn in_memory(mut self, yes: bool) -> Self {
        self.in_memory = yes;
        self
    }

    /// Reject all mutations with `WriteProtected`.
    pub fn read_only(mut self, yes: bool) -> Self {
        self.read_only = yes;
        self
    }

    /// Write-ahead journaling for crash recovery. On by default.
    pub fn enable_journal(mut self, yes: bool) -> Self {
        self.enable_journal = yes;
        self
    }

    /// Transactional semantics; implies journaling.
    pub fn enable_transactions(mut self, yes: bool) -> Self {
        if yes {
            self.enable_journal = true;
        }
        self
    }

    /// Directory for the journal files; next to the data file by default.
    pub fn log_directory<P: Into<std::path::PathBuf>>(mut self, dir: P) -> Self {
        self.log_directory = Some(dir.into());
        self
    }

    /// Replay a non-empty journal at open instead of failing with
    /// `NeedRecovery`. On by default.
    pub fn auto_recovery(mut self, yes: bool) -> Self {
        self.auto_recovery = yes;
        self
    }

    /// Leave the journal files behind at close instead of truncating them.
    pub fn dont_clear_log(mut self, yes: bool) -> Self {
        self.dont_clear_log = yes;
        self
    }

    /// fsync the device after every committed changeset.
    pub fn flush_when_committed(mut self, yes: bool) -> Self {
        self.flush_when_committed = yes;
        self
    }

    /// Use positioned file I/O instead of a memory-mapped device.
    pub fn disable_mmap(mut self, yes: bool) -> Self {
        self.disable_mmap = yes;
        self
    }

    /// Unix permission bits for newly created files.
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.file_mode = mode;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if !is_power_of_two(self.page_size)
            || self.page_size < MIN_PAGE_SIZE
            || self.page_size > MAX_PAGE_SIZE
        {
            return ErrorKind::InvalidParameter.raise();
        }
        if self.max_databases == 0
            || self.max_databases > max_databases_for_page_size(self.page_size)
        {
            return ErrorKind::InvalidParameter.raise();
        }
        if self.in_memory && self.read_only {
            return ErrorKind::InvalidParameter.raise();
        }
        Ok(())
    }
}

impl Default for EnvOptions {
    fn default() -> Self {
        Self::new()
    }
}

/// Options for [`Environment::create_db`].
///
/// [`Environment::create_db`]: crate::Environment::create_db
#[derive(Debug, Clone)]
pub struct DbOptions {
    pub(crate) key_type: KeyType,
    pub(crate) key_size: u16,
    pub(crate) record_size: u32,
    pub(crate) duplicates: bool,
    pub(crate) record_number: bool,
    pub(crate) force_records_inline: bool,
    pub(crate) compression: bool,
    key_type_explicit: bool,
}

impl DbOptions {
    pub fn new() -> Self {
        Self {
            key_type: KeyType::Binary,
            key_size: KEY_SIZE_UNLIMITED,
            record_size: RECORD_SIZE_UNLIMITED,
            duplicates: false,
            record_number: false,
            force_records_inline: false,
            compression: false,
            key_type_explicit: false,
        }
    }

    pub fn key_type(mut self, kt: KeyType) -> Self {
        self.key_type = kt;
        self.key_type_explicit = true;
        self
    }

    /// Fixed key size in bytes, or [`KEY_SIZE_UNLIMITED`].
    pub fn key_size(mut self, size: u16) -> Self {
        self.key_size = size;
        self
    }

    /// Fixed record size in bytes, or [`RECORD_SIZE_UNLIMITED`].
    pub fn record_size(mut self, size: u32) -> Self {
        self.record_size = size;
        self
    }

    /// Allow multiple records per key.
    pub fn duplicates(mut self, yes: bool) -> Self {
        self.duplicates = yes;
        self
    }

    /// Auto-assign monotonically increasing u64 keys. Forces
    /// `KeyType::U64` with an 8-byte key size.
    pub fn record_number(mut self, yes: bool) -> Self {
        self.record_number = yes;
        self
    }

    /// Store fixed-size records inline in the node even past the usual
    /// 8-byte cutoff. Requires a fixed record size.
    pub fn force_records_inline(mut self, yes: bool) -> Self {
        self.force_records_inline = yes;
        self
    }

    /// Reserved; requesting it fails with `NotImplemented`.
    pub fn compression(mut self, yes: bool) -> Self {
        self.compression = yes;
        self
    }

    pub(crate) fn validate(&self, page_size: usize) -> Result<()> {
        if self.compression {
            return ErrorKind::NotImplemented.raise();
        }
        if self.record_number {
            // Record-number databases own their key shape.
            if self.key_type_explicit && self.key_type != KeyType::U64 {
                return ErrorKind::InvalidParameter.raise();
            }
            if self.key_size != KEY_SIZE_UNLIMITED && self.key_size != 8 {
                return ErrorKind::InvalidParameter.raise();
            }
        }
        if let Some(fixed) = self.key_type.fixed_size() {
            if self.key_size != KEY_SIZE_UNLIMITED && self.key_size != fixed {
                return ErrorKind::InvalidParameter.raise();
            }
        }
        if self.key_type == KeyType::Binary && self.key_size == 0 {
            return ErrorKind::InvalidParameter.raise();
        }
        if self.force_records_inline {
            if self.record_size == RECORD_SIZE_UNLIMITED {
                return ErrorKind::InvalidParameter.raise();
            }
            // An inline record area must leave room for at least one key
            // next to it.
            if self.record_size as usize > page_size / 4 {
                return ErrorKind::InvalidParameter.raise();
            }
        }
        Ok(())
    }

    /// The key size after record-number and typed-key defaults are applied.
    pub(crate) fn effective_key_size(&self) -> u16 {
        if self.record_number {
            return 8;
        }
        if let Some(fixed) = self.key_type.fixed_size() {
            return fixed;
        }
        self.key_size
    }

    pub(crate) fn effective_key_type(&self) -> KeyType {
        if self.record_number {
            KeyType::U64
        } else {
            self.key_type
        }
    }
}

impl Default for DbOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_scale_with_page_size() {
        assert_eq!(extended_key_threshold(1024), 64);
        assert_eq!(extended_key_threshold(4096), 128);
        assert_eq!(extended_key_threshold(8192), 128);
        assert_eq!(extended_key_threshold(16384), 256);

        assert_eq!(duplicate_threshold(1024), 32);
        assert_eq!(duplicate_threshold(8192), 64);
        assert_eq!(duplicate_threshold(65536), 127);
    }

    #[test]
    fn descriptor_capacity_of_smallest_page() {
        // 1024 - 16 - 32 = 976; 976 / 24 = 40 slots
        assert_eq!(max_databases_for_page_size(1024), 40);
    }

    #[test]
    fn env_options_reject_bad_page_sizes() {
        assert!(EnvOptions::new().page_size(512).validate().is_err());
        assert!(EnvOptions::new().page_size(3000).validate().is_err());
        assert!(EnvOptions::new().page_size(128 * 1024).validate().is_err());
        assert!(EnvOptions::new().page_size(4096).validate().is_ok());
    }

    #[test]
    fn env_options_reject_oversized_descriptor_table() {
        let opts = EnvOptions::new().page_size(1024).max_databases(41);
        assert!(opts.validate().is_err());
    }

    #[test]
    fn record_number_rejects_conflicting_key_type() {
        let opts = DbOptions::new().record_number(true).key_type(KeyType::U32);
        let err = opts.validate(4096).unwrap_err();
        assert_eq!(
            crate::error::ErrorKind::of(&err),
            Some(crate::error::ErrorKind::InvalidParameter)
        );
    }

    #[test]
    fn record_number_forces_u64_key() {
        let opts = DbOptions::new().record_number(true);
        assert!(opts.validate(4096).is_ok());
        assert_eq!(opts.effective_key_type(), KeyType::U64);
        assert_eq!(opts.effective_key_size(), 8);
    }

    #[test]
    fn compression_is_not_implemented() {
        let err = DbOptions::new().compression(true).validate(4096).unwrap_err();
        assert_eq!(
            crate::error::ErrorKind::of(&err),
            Some(crate::error::ErrorKind::NotImplemented)
        );
    }
}
