//! # B+Tree
//!
//! Each database is one B+tree over pages obtained from the page manager.
//! Two interchangeable node encodings implement a common node-proxy
//! contract:
//!
//! - **PAX** ([`pax`]): fixed-size keys in one contiguous array, records in
//!   a parallel array. Chosen for fixed-length keys without duplicates.
//!   O(1) slot access, trivial integrity, block-scan friendly.
//! - **Default** ([`vlen`]): variable-length chunks behind an upfront slot
//!   index with a chunk freelist. Chosen for variable keys and whenever
//!   duplicates are enabled.
//!
//! The factory is [`TreeConfig::layout_kind`]; the proxy enums live in
//! [`node`]. Internal nodes of either layout store 8-byte child addresses
//! as their records; the leftmost child hangs off the node header's
//! `ptr_down`.
//!
//! Key and record bytes stored inside a node are always in their *inline*
//! form: a key longer than the extended threshold is an 8-byte blob id
//! with the `KF_EXTENDED_KEY` flag, and a record entry is either inline
//! payload or a blob id (see [`records`]). The tree layer
//! ([`tree::BtreeIndex`]) translates between user bytes and inline forms,
//! so the layouts never touch the pager.

pub(crate) mod dup_table;
pub(crate) mod ext_keys;
pub(crate) mod node;
pub(crate) mod pax;
pub(crate) mod records;
pub(crate) mod tree;
pub(crate) mod upfront;
pub(crate) mod vlen;

pub use tree::{BtreeIndex, InsertFlags, MatchMode};

use std::cmp::Ordering;
use std::sync::Arc;

use crate::config::{
    duplicate_threshold, extended_key_threshold, KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED,
};
use crate::keys::{compare_keys, CompareFn, KeyType};

/// Key flag: the inline key bytes are an 8-byte extended-key blob id.
pub(crate) const KF_EXTENDED_KEY: u8 = 0x01;
/// Key flag: the record area is an 8-byte duplicate-table blob id.
pub(crate) const KF_EXTENDED_DUPLICATES: u8 = 0x02;

/// Which node encoding a database uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LayoutKind {
    Pax,
    Vlen,
}

/// Shape of one record entry inside a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordMode {
    /// 8-byte child address; internal nodes only.
    Internal,
    /// Fixed-size records stored verbatim, `width` bytes each.
    Fixed { width: u32 },
    /// 1 flag byte + 8 bytes of inline payload or blob id.
    Default,
}

impl RecordMode {
    pub(crate) fn entry_width(self) -> usize {
        match self {
            RecordMode::Internal => 8,
            RecordMode::Fixed { width } => width as usize,
            RecordMode::Default => records::ENTRY_DEFAULT_WIDTH,
        }
    }
}

/// Per-database configuration shared by every node of one tree.
#[derive(Clone)]
pub(crate) struct TreeConfig {
    pub key_type: KeyType,
    /// Fixed key size, or [`KEY_SIZE_UNLIMITED`].
    pub key_size: u16,
    /// Fixed record size, or [`RECORD_SIZE_UNLIMITED`].
    pub rec_size: u32,
    pub duplicates: bool,
    pub record_number: bool,
    pub force_records_inline: bool,
    pub page_size: usize,
    pub custom_compare: Option<Arc<CompareFn>>,
}

impl TreeConfig {
    pub fn compare(&self, lhs: &[u8], rhs: &[u8]) -> Ordering {
        compare_keys(self.key_type, self.custom_compare.as_ref(), lhs, rhs)
    }

    pub fn ext_threshold(&self) -> usize {
        extended_key_threshold(self.page_size)
    }

    pub fn dup_threshold(&self) -> usize {
        duplicate_threshold(self.page_size)
    }

    pub fn has_fixed_key(&self) -> bool {
        self.key_size != KEY_SIZE_UNLIMITED
    }

    /// Layout selection: PAX needs fixed keys short enough to never go
    /// extended, and no duplicates; everything else takes the default
    /// layout.
    pub fn layout_kind(&self) -> LayoutKind {
        if self.has_fixed_key()
            && (self.key_size as usize) <= self.ext_threshold()
            && !self.duplicates
        {
            LayoutKind::Pax
        } else {
            LayoutKind::Vlen
        }
    }

    /// Record shape in leaf nodes. Fixed records stay inline when they are
    /// small or explicitly forced; otherwise they take the default 9-byte
    /// entry and spill to blobs.
    pub fn leaf_record_mode(&self) -> RecordMode {
        if self.rec_size != RECORD_SIZE_UNLIMITED
            && (self.rec_size as usize <= crate::config::INLINE_RECORD_MAX
                || self.force_records_inline)
        {
            RecordMode::Fixed {
                width: self.rec_size,
            }
        } else {
            RecordMode::Default
        }
    }

    pub fn record_mode(&self, is_leaf: bool) -> RecordMode {
        if is_leaf {
            self.leaf_record_mode()
        } else {
            RecordMode::Internal
        }
    }

    /// Below this count searches go linear instead of binary; tuned for
    /// fixed-key arrays that fit a few cache lines. Large fixed keys
    /// disable the linear pass entirely.
    pub fn linear_threshold(&self) -> usize {
        if self.has_fixed_key() {
            if self.key_size > 32 {
                return 0;
            }
            128 / self.key_size.max(1) as usize
        } else {
            8
        }
    }
}

/// Outcome of an in-node mutation: either it fit, or the node must split
/// before the operation can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SpaceOutcome {
    Fit,
    NeedsSplit,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(key_size: u16, rec_size: u32, duplicates: bool, page_size: usize) -> TreeConfig {
        TreeConfig {
            key_type: KeyType::Binary,
            key_size,
            rec_size,
            duplicates,
            record_number: false,
            force_records_inline: false,
            page_size,
            custom_compare: None,
        }
    }

    #[test]
    fn fixed_short_keys_without_duplicates_take_pax() {
        let c = cfg(16, RECORD_SIZE_UNLIMITED, false, 1024);
        assert_eq!(c.layout_kind(), LayoutKind::Pax);
    }

    #[test]
    fn duplicates_force_the_default_layout() {
        let c = cfg(16, RECORD_SIZE_UNLIMITED, true, 1024);
        assert_eq!(c.layout_kind(), LayoutKind::Vlen);
    }

    #[test]
    fn unlimited_keys_take_the_default_layout() {
        let c = cfg(KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED, false, 1024);
        assert_eq!(c.layout_kind(), LayoutKind::Vlen);
    }

    #[test]
    fn oversized_fixed_keys_take_the_default_layout() {
        // 100-byte keys on a 1 KiB page are past the 64-byte threshold
        let c = cfg(100, RECORD_SIZE_UNLIMITED, false, 1024);
        assert_eq!(c.layout_kind(), LayoutKind::Vlen);
    }

    #[test]
    fn small_fixed_records_stay_inline() {
        let c = cfg(16, 8, false, 1024);
        assert_eq!(c.leaf_record_mode(), RecordMode::Fixed { width: 8 });
        assert_eq!(c.leaf_record_mode().entry_width(), 8);
    }

    #[test]
    fn large_fixed_records_use_default_entries() {
        let c = cfg(16, 100, false, 1024);
        assert_eq!(c.leaf_record_mode(), RecordMode::Default);
        assert_eq!(c.leaf_record_mode().entry_width(), 9);
    }

    #[test]
    fn forced_inline_keeps_large_fixed_records() {
        let mut c = cfg(16, 100, false, 4096);
        c.force_records_inline = true;
        assert_eq!(c.leaf_record_mode(), RecordMode::Fixed { width: 100 });
    }

    #[test]
    fn internal_nodes_store_child_addresses() {
        let c = cfg(16, 8, false, 1024);
        assert_eq!(c.record_mode(false), RecordMode::Internal);
        assert_eq!(c.record_mode(false).entry_width(), 8);
    }

    #[test]
    fn linear_search_scales_with_key_size_and_cuts_off() {
        assert_eq!(cfg(4, 8, false, 1024).linear_threshold(), 32);
        assert_eq!(cfg(16, 8, false, 1024).linear_threshold(), 8);
        assert_eq!(cfg(32, 8, false, 1024).linear_threshold(), 4);
        // large keys disable the linear pass
        assert_eq!(cfg(64, 8, false, 1024).linear_threshold(), 0);
        // variable-length keys use a small fixed threshold
        assert_eq!(
            cfg(KEY_SIZE_UNLIMITED, 8, false, 1024).linear_threshold(),
            8
        );
    }
}
