//! # BtreeIndex
//!
//! One B+tree per database. The index owns the descriptor slot, the root
//! address and the per-tree extended-key cache; every operation borrows
//! the page manager.
//!
//! ## Descent
//!
//! Lookups and mutations descend from the root, keeping the path (page
//! address plus child index) on the operation's stack. Children are
//! addressed by page address, never by pointer, so the in-memory graph
//! stays acyclic and proxies are recreated per node visit.
//!
//! ## Split
//!
//! An insert that does not fit splits the leaf: a sibling page takes the
//! upper half of the slots and the pivot key is promoted into the parent,
//! propagating along the descent path. Only a root-level split changes
//! the root: a fresh root page is allocated, the old root becomes its
//! leftmost child and the descriptor is updated (which dirties the header
//! page). Internal splits promote the pivot without copying it into the
//! sibling; the pivot's child becomes the sibling's `ptr_down`.
//!
//! ## Merge and shift
//!
//! Erase rebalances when a node drops to the merge threshold: the node is
//! merged into an adjacent sibling when the combined content fits
//! (pulling the separator down for internal nodes), or slots are shifted
//! from the richer sibling and the parent separator is rewritten.
//! Underflow propagates upward; an internal root left with zero keys
//! collapses into its only child.
//!
//! ## Duplicates
//!
//! Records of one key live inline in the slot until the page-size
//! threshold, then migrate wholesale into an external duplicate table
//! blob. Inserts honor position flags; erasing the last record erases
//! the key.

use std::sync::Arc;

use eyre::{bail, ensure, Result, WrapErr};
use smallvec::SmallVec;

use crate::blob;
use crate::config::RECORD_SIZE_UNLIMITED;
use crate::error::ErrorKind;
use crate::keys;
use crate::metrics::Metrics;
use crate::page::{Page, PageType};
use crate::pager::{FetchHint, PageManager};

use super::dup_table::DupTable;
use super::ext_keys::{self, ExtKeyCache};
use super::node::{init_node, NodeMut, NodeRef};
use super::records;
use super::{RecordMode, SpaceOutcome, TreeConfig, KF_EXTENDED_DUPLICATES, KF_EXTENDED_KEY};

/// Insert behavior for existing keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertFlags {
    /// Fail with `KeyExists` unless duplicates are enabled, in which case
    /// the record is appended after the existing ones.
    Default,
    /// Replace the first record of the key.
    Overwrite,
    /// Insert the record before all existing duplicates.
    DuplicateFirst,
    /// Insert the record after all existing duplicates.
    DuplicateLast,
    /// Insert the record before duplicate `n`.
    DuplicateBefore(u32),
    /// Insert the record after duplicate `n`.
    DuplicateAfter(u32),
}

/// Approximate-match modes for lookups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchMode {
    Exact,
    /// Nearest key strictly smaller.
    Lt,
    /// Nearest key strictly greater.
    Gt,
    /// Exact, else nearest smaller.
    Leq,
    /// Exact, else nearest greater.
    Geq,
}

#[derive(Debug, Clone, Copy)]
struct DescentStep {
    addr: u64,
    /// Child taken at this node: -1 for `ptr_down`, else the slot index.
    child_idx: i64,
}

type Path = SmallVec<[DescentStep; 8]>;

/// A slot in its raw on-node form; blob ownership travels with it.
struct RawSlot {
    key_inline: Vec<u8>,
    key_flags: u8,
    key_real_size: u16,
    area: Vec<u8>,
}

impl RawSlot {
    fn shape(&self) -> (usize, usize) {
        (self.key_inline.len(), self.area.len())
    }
}

pub struct BtreeIndex {
    desc_slot: usize,
    root: u64,
    cfg: TreeConfig,
    ext_cache: ExtKeyCache,
    /// Observed slot count at the last split; sizes fresh default-layout
    /// nodes.
    capacity_hint: u32,
    /// Next auto-assigned key for record-number databases.
    next_recno: u64,
}

impl BtreeIndex {
    pub(crate) fn new(desc_slot: usize, root: u64, cfg: TreeConfig) -> Self {
        Self {
            desc_slot,
            root,
            cfg,
            ext_cache: ExtKeyCache::new(),
            capacity_hint: 0,
            next_recno: 1,
        }
    }

    pub(crate) fn cfg(&self) -> &TreeConfig {
        &self.cfg
    }

    /// Creates the root leaf for a fresh database.
    pub(crate) fn create_root(&mut self, pager: &mut PageManager) -> Result<u64> {
        let page = pager.alloc(PageType::BtreeRoot)?;
        {
            let mut guard = page.data_mut();
            init_node(&mut guard[..], &self.cfg, true, 0)?;
        }
        self.root = page.address();
        Ok(self.root)
    }

    /// Seeds the record-number high-water mark from the largest stored
    /// key; called at open.
    pub(crate) fn load_recno_state(&mut self, pager: &mut PageManager) -> Result<()> {
        if !self.cfg.record_number {
            return Ok(());
        }
        if let Some(key) = self.max_key(pager)? {
            self.next_recno = keys::recno_value(&key)?.saturating_add(1);
        }
        Ok(())
    }

    pub(crate) fn next_record_number(&mut self) -> u64 {
        let n = self.next_recno;
        self.next_recno += 1;
        n
    }

    /// Raises the record-number high-water mark past an explicitly
    /// inserted key.
    pub(crate) fn observe_record_number(&mut self, n: u64) {
        self.next_recno = self.next_recno.max(n.saturating_add(1));
    }

    /// Installs the comparator for `KeyType::Custom` databases.
    pub(crate) fn set_compare(&mut self, compare: std::sync::Arc<crate::keys::CompareFn>) {
        self.cfg.custom_compare = Some(compare);
    }

    fn fetch_node(&self, pager: &mut PageManager, addr: u64) -> Result<Arc<Page>> {
        let page = pager.fetch(addr)?;
        match page.page_type() {
            PageType::BtreeRoot | PageType::BtreeNode => Ok(page),
            other => ErrorKind::IntegrityViolated
                .raise()
                .wrap_err_with(|| format!("page {} has type {:?}, expected a node", addr, other)),
        }
    }

    /// Updates the root address in memory and in the descriptor slot on
    /// the header page.
    fn set_root(&mut self, pager: &mut PageManager, new_root: u64) -> Result<()> {
        let header = pager.fetch(0)?;
        pager.mark_dirty(&header);
        {
            let mut guard = header.data_mut();
            crate::env::header::descriptor_mut(&mut guard[..], self.desc_slot)?
                .set_root_address(new_root);
        }
        self.root = new_root;
        Ok(())
    }

    // ------------------------------------------------------------------
    // key comparison and node search
    // ------------------------------------------------------------------

    fn cmp_slot(
        &mut self,
        pager: &mut PageManager,
        node: &NodeRef<'_>,
        slot: u32,
        probe: &[u8],
    ) -> Result<std::cmp::Ordering> {
        let flags = node.key_flags(slot)?;
        if flags & KF_EXTENDED_KEY != 0 {
            let stored =
                ext_keys::resolve_key(pager, &mut self.ext_cache, node.key_inline(slot)?, flags)?;
            Ok(self.cfg.compare(&stored, probe))
        } else {
            Ok(self.cfg.compare(node.key_inline(slot)?, probe))
        }
    }

    /// Lower-bound search: the first slot whose key is `>= probe`, plus
    /// whether it is an exact hit. Linear below the layout threshold,
    /// binary above.
    fn search(
        &mut self,
        pager: &mut PageManager,
        node: &NodeRef<'_>,
        probe: &[u8],
    ) -> Result<(u32, bool)> {
        use std::cmp::Ordering;

        let count = node.count();
        if (count as usize) < self.cfg.linear_threshold() {
            for i in 0..count {
                match self.cmp_slot(pager, node, i, probe)? {
                    Ordering::Less => continue,
                    Ordering::Equal => return Ok((i, true)),
                    Ordering::Greater => return Ok((i, false)),
                }
            }
            return Ok((count, false));
        }

        let (mut lo, mut hi) = (0u32, count);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            match self.cmp_slot(pager, node, mid, probe)? {
                Ordering::Less => lo = mid + 1,
                Ordering::Equal => return Ok((mid, true)),
                Ordering::Greater => hi = mid,
            }
        }
        Ok((lo, false))
    }

    fn child_at(&self, node: &NodeRef<'_>, child_idx: i64) -> Result<u64> {
        if child_idx < 0 {
            return Ok(node.ptr_down());
        }
        let area = node.record_area(child_idx as u32)?;
        let entry = records::area_entry(false, 8, area, 0)?;
        Ok(u64::from_le_bytes(entry.try_into().unwrap()))
    }

    /// The child to descend into for `probe`: the child of the rightmost
    /// separator `<= probe`, or `ptr_down` when the probe sorts before
    /// every separator.
    fn find_child(
        &mut self,
        pager: &mut PageManager,
        node: &NodeRef<'_>,
        probe: &[u8],
    ) -> Result<(i64, u64)> {
        let (lb, exact) = self.search(pager, node, probe)?;
        let n_le = if exact { lb + 1 } else { lb };
        let child_idx = n_le as i64 - 1;
        let addr = self.child_at(node, child_idx)?;
        Ok((child_idx, addr))
    }

    fn descend_to_leaf(&mut self, pager: &mut PageManager, key: &[u8]) -> Result<(u64, Path)> {
        let mut addr = self.root;
        let mut path = Path::new();
        loop {
            ensure!(path.len() <= 64, "descent deeper than any sane tree");
            let page = self.fetch_node(pager, addr)?;
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            if node.is_leaf() {
                return Ok((addr, path));
            }
            let (child_idx, child_addr) = self.find_child(pager, &node, key)?;
            path.push(DescentStep { addr, child_idx });
            drop(guard);
            addr = child_addr;
        }
    }

    // ------------------------------------------------------------------
    // records
    // ------------------------------------------------------------------

    fn leaf_mode(&self) -> RecordMode {
        self.cfg.leaf_record_mode()
    }

    fn leaf_width(&self) -> usize {
        self.leaf_mode().entry_width()
    }

    fn leaf_has_counter(&self) -> bool {
        super::node::NodeCfg::new(&self.cfg, true).has_counter
    }

    /// Encodes user record bytes into a node entry, spilling to a blob in
    /// default mode.
    fn make_record_entry(&self, pager: &mut PageManager, record: &[u8]) -> Result<Vec<u8>> {
        match self.leaf_mode() {
            RecordMode::Fixed { width } => {
                if record.len() != width as usize {
                    return ErrorKind::InvalidParameter
                        .raise()
                        .wrap_err("record size does not match the database's fixed record size");
                }
                Ok(record.to_vec())
            }
            RecordMode::Default => {
                if self.cfg.rec_size != RECORD_SIZE_UNLIMITED
                    && record.len() != self.cfg.rec_size as usize
                {
                    return ErrorKind::InvalidParameter
                        .raise()
                        .wrap_err("record size does not match the database's fixed record size");
                }
                if let Some(entry) = records::encode_inline(record) {
                    Ok(entry.to_vec())
                } else {
                    let blob_id = blob::alloc(pager, record)?;
                    Ok(records::encode_blob_entry(blob_id).to_vec())
                }
            }
            RecordMode::Internal => bail!("user records never target internal nodes"),
        }
    }

    fn decode_record_entry(&self, pager: &mut PageManager, entry: &[u8]) -> Result<Vec<u8>> {
        match self.leaf_mode() {
            RecordMode::Fixed { .. } => Ok(entry.to_vec()),
            RecordMode::Default => records::decode_entry(pager, entry),
            RecordMode::Internal => bail!("user records never live in internal nodes"),
        }
    }

    fn free_record_entry(&self, pager: &mut PageManager, entry: &[u8]) -> Result<()> {
        if self.leaf_mode() == RecordMode::Default {
            if let Some(blob_id) = records::entry_blob_id(entry) {
                blob::free(pager, blob_id)?;
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // lookup
    // ------------------------------------------------------------------

    pub fn find(&mut self, pager: &mut PageManager, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.find_dup(pager, key, 0)
    }

    pub fn find_dup(
        &mut self,
        pager: &mut PageManager,
        key: &[u8],
        dup_idx: u32,
    ) -> Result<Option<Vec<u8>>> {
        let (leaf_addr, _) = self.descend_to_leaf(pager, key)?;
        let page = self.fetch_node(pager, leaf_addr)?;

        let entry = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let (slot, exact) = self.search(pager, &node, key)?;
            if !exact {
                return Ok(None);
            }
            let flags = node.key_flags(slot)?;
            if flags & KF_EXTENDED_DUPLICATES != 0 {
                let table_id = records::area_ext_dup_id(node.record_area(slot)?)?;
                let table = DupTable::load(pager, table_id, self.leaf_width())?;
                if dup_idx >= table.count() {
                    return Ok(None);
                }
                table.entry(dup_idx)?.to_vec()
            } else {
                let area = node.record_area(slot)?;
                if dup_idx >= records::area_count(self.leaf_has_counter(), area) {
                    return Ok(None);
                }
                records::area_entry(self.leaf_has_counter(), self.leaf_width(), area, dup_idx)?
                    .to_vec()
            }
        };

        Ok(Some(self.decode_record_entry(pager, &entry)?))
    }

    pub fn record_count(&mut self, pager: &mut PageManager, key: &[u8]) -> Result<u64> {
        let (leaf_addr, _) = self.descend_to_leaf(pager, key)?;
        let page = self.fetch_node(pager, leaf_addr)?;
        let guard = page.data();
        let node = NodeRef::open(&guard[..], &self.cfg)?;
        let (slot, exact) = self.search(pager, &node, key)?;
        if !exact {
            return ErrorKind::KeyNotFound.raise();
        }
        self.slot_record_count(pager, &node, slot)
    }

    fn slot_record_count(
        &mut self,
        pager: &mut PageManager,
        node: &NodeRef<'_>,
        slot: u32,
    ) -> Result<u64> {
        let flags = node.key_flags(slot)?;
        if flags & KF_EXTENDED_DUPLICATES != 0 {
            let table_id = records::area_ext_dup_id(node.record_area(slot)?)?;
            Ok(DupTable::load(pager, table_id, self.leaf_width())?.count() as u64)
        } else {
            Ok(records::area_count(self.leaf_has_counter(), node.record_area(slot)?) as u64)
        }
    }

    /// Approximate lookup; returns the matched key and its first record.
    pub fn find_approx(
        &mut self,
        pager: &mut PageManager,
        key: &[u8],
        mode: MatchMode,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (leaf_addr, path) = self.descend_to_leaf(pager, key)?;
        let page = self.fetch_node(pager, leaf_addr)?;

        let (count, slot, exact) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let (slot, exact) = self.search(pager, &node, key)?;
            (node.count(), slot, exact)
        };

        // resolve the target (leaf address, slot), crossing node edges
        // through the descent path
        let target: Option<(u64, u32)> = match mode {
            MatchMode::Exact => exact.then_some((leaf_addr, slot)),
            MatchMode::Leq if exact => Some((leaf_addr, slot)),
            MatchMode::Geq if exact => Some((leaf_addr, slot)),
            MatchMode::Lt | MatchMode::Leq => {
                if slot > 0 {
                    Some((leaf_addr, slot - 1))
                } else {
                    self.leaf_predecessor(pager, &path)?
                        .map(|(addr, last)| (addr, last))
                }
            }
            MatchMode::Gt if exact => {
                if slot + 1 < count {
                    Some((leaf_addr, slot + 1))
                } else {
                    self.leaf_successor(pager, &path)?.map(|addr| (addr, 0))
                }
            }
            MatchMode::Gt | MatchMode::Geq => {
                if slot < count {
                    Some((leaf_addr, slot))
                } else {
                    self.leaf_successor(pager, &path)?.map(|addr| (addr, 0))
                }
            }
        };

        let Some((addr, slot)) = target else {
            return Ok(None);
        };

        let page = self.fetch_node(pager, addr)?;
        let (key_inline, key_flags, entry) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            if slot >= node.count() {
                return Ok(None);
            }
            let flags = node.key_flags(slot)?;
            let entry = if flags & KF_EXTENDED_DUPLICATES != 0 {
                let table_id = records::area_ext_dup_id(node.record_area(slot)?)?;
                DupTable::load(pager, table_id, self.leaf_width())?
                    .entry(0)?
                    .to_vec()
            } else {
                records::area_entry(
                    self.leaf_has_counter(),
                    self.leaf_width(),
                    node.record_area(slot)?,
                    0,
                )?
                .to_vec()
            };
            (node.key_inline(slot)?.to_vec(), flags, entry)
        };

        let full_key = ext_keys::resolve_key(pager, &mut self.ext_cache, &key_inline, key_flags)?;
        let record = self.decode_record_entry(pager, &entry)?;
        Ok(Some((full_key, record)))
    }

    /// Address of the next leaf after the one the path descends to, if
    /// any; found by backtracking to the first ancestor with a right
    /// sibling child.
    fn leaf_successor(&mut self, pager: &mut PageManager, path: &Path) -> Result<Option<u64>> {
        for step in path.iter().rev() {
            let page = self.fetch_node(pager, step.addr)?;
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            if step.child_idx + 1 < node.count() as i64 {
                let next = self.child_at(&node, step.child_idx + 1)?;
                drop(guard);
                return Ok(Some(self.descend_edge(pager, next, false)?));
            }
        }
        Ok(None)
    }

    /// Address and last-slot index of the previous leaf, if any.
    fn leaf_predecessor(
        &mut self,
        pager: &mut PageManager,
        path: &Path,
    ) -> Result<Option<(u64, u32)>> {
        for step in path.iter().rev() {
            if step.child_idx >= 0 {
                let page = self.fetch_node(pager, step.addr)?;
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                let prev = self.child_at(&node, step.child_idx - 1)?;
                drop(guard);
                let leaf = self.descend_edge(pager, prev, true)?;
                let leaf_page = self.fetch_node(pager, leaf)?;
                let guard = leaf_page.data();
                let count = NodeRef::open(&guard[..], &self.cfg)?.count();
                if count == 0 {
                    return Ok(None);
                }
                return Ok(Some((leaf, count - 1)));
            }
        }
        Ok(None)
    }

    /// Follows the leftmost (or rightmost) edge down to a leaf.
    fn descend_edge(&self, pager: &mut PageManager, mut addr: u64, rightmost: bool) -> Result<u64> {
        loop {
            let page = self.fetch_node(pager, addr)?;
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            if node.is_leaf() {
                return Ok(addr);
            }
            addr = if rightmost {
                self.child_at(&node, node.count() as i64 - 1)?
            } else {
                node.ptr_down()
            };
        }
    }

    /// The largest key in the tree, if any.
    pub(crate) fn max_key(&mut self, pager: &mut PageManager) -> Result<Option<Vec<u8>>> {
        let leaf = self.descend_edge(pager, self.root, true)?;
        let page = self.fetch_node(pager, leaf)?;
        let (inline, flags) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let count = node.count();
            if count == 0 {
                return Ok(None);
            }
            (
                node.key_inline(count - 1)?.to_vec(),
                node.key_flags(count - 1)?,
            )
        };
        Ok(Some(ext_keys::resolve_key(
            pager,
            &mut self.ext_cache,
            &inline,
            flags,
        )?))
    }

    // ------------------------------------------------------------------
    // insert
    // ------------------------------------------------------------------

    pub fn insert(
        &mut self,
        pager: &mut PageManager,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        if !self.cfg.duplicates {
            match flags {
                InsertFlags::Default | InsertFlags::Overwrite => {}
                _ => {
                    return ErrorKind::InvalidParameter
                        .raise()
                        .wrap_err("duplicate flags on a database without duplicates");
                }
            }
        }

        let entry = self.make_record_entry(pager, record)?;
        let result = self.insert_entry(pager, key, &entry, flags);
        if let Err(err) = &result {
            // the prepared entry never made it into a slot; reclaim its
            // blob for the error paths a caller is expected to survive
            if matches!(
                ErrorKind::of(err),
                Some(ErrorKind::KeyExists) | Some(ErrorKind::InvalidParameter)
            ) {
                self.free_record_entry(pager, &entry)?;
            }
        }
        result
    }

    fn insert_entry(
        &mut self,
        pager: &mut PageManager,
        key: &[u8],
        entry: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        for _ in 0..16 {
            let (leaf_addr, path) = self.descend_to_leaf(pager, key)?;
            let page = self.fetch_node(pager, leaf_addr)?;

            let (slot, exact) = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                self.search(pager, &node, key)?
            };

            if exact {
                return self.insert_into_existing(pager, &page, slot, entry, flags);
            }

            let inline =
                ext_keys::make_inline_key(pager, &mut self.ext_cache, key, self.cfg.ext_threshold())?;
            let area = records::area_single(self.leaf_has_counter(), entry);

            pager.mark_dirty(&page);
            let outcome = {
                let mut guard = page.data_mut();
                let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
                node.insert_slot(slot, &inline.bytes, inline.flags, inline.real_size, &area)?
            };

            match outcome {
                SpaceOutcome::Fit => return Ok(()),
                SpaceOutcome::NeedsSplit => {
                    // the inline key was not stored; do not leak its blob
                    ext_keys::free_key(pager, &mut self.ext_cache, &inline.bytes, inline.flags)?;
                    let (sep, right) = self.split_in_place(pager, leaf_addr)?;
                    self.propagate_split(pager, &path, sep, right)?;
                }
            }
        }
        bail!("insert did not settle after repeated splits");
    }

    /// Adds a record to an existing key: overwrite, inline duplicate, or
    /// external duplicate table.
    fn insert_into_existing(
        &mut self,
        pager: &mut PageManager,
        page: &Arc<Page>,
        slot: u32,
        entry: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let (key_flags, area) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.key_flags(slot)?, node.record_area(slot)?.to_vec())
        };

        if key_flags & KF_EXTENDED_DUPLICATES != 0 {
            let table_id = records::area_ext_dup_id(&area)?;
            let mut table = DupTable::load(pager, table_id, self.leaf_width())?;
            match flags {
                InsertFlags::Overwrite => {
                    let old = table.entry(0)?.to_vec();
                    self.free_record_entry(pager, &old)?;
                    table.set(pager, 0, entry)?;
                }
                InsertFlags::Default | InsertFlags::DuplicateLast => {
                    let count = table.count();
                    table.insert(pager, count, entry)?;
                }
                InsertFlags::DuplicateFirst => table.insert(pager, 0, entry)?,
                InsertFlags::DuplicateBefore(n) => table.insert(pager, n, entry)?,
                InsertFlags::DuplicateAfter(n) => {
                    let pos = n.saturating_add(1).min(table.count());
                    table.insert(pager, pos, entry)?;
                }
            }
            if table.blob_id() != table_id {
                self.write_record_area(pager, page, slot, &records::area_ext_dup(table.blob_id()))?;
            }
            return Ok(());
        }

        let has_counter = self.leaf_has_counter();
        let width = self.leaf_width();
        let count = records::area_count(has_counter, &area);

        if flags == InsertFlags::Overwrite {
            let old = records::area_entry(has_counter, width, &area, 0)?.to_vec();
            self.free_record_entry(pager, &old)?;
            let new_area = records::area_set(has_counter, width, &area, 0, entry)?;
            return self.write_record_area(pager, page, slot, &new_area);
        }

        if !self.cfg.duplicates {
            return ErrorKind::KeyExists.raise();
        }

        let pos = match flags {
            InsertFlags::Default | InsertFlags::DuplicateLast => count,
            InsertFlags::DuplicateFirst => 0,
            InsertFlags::DuplicateBefore(n) => n.min(count),
            InsertFlags::DuplicateAfter(n) => n.saturating_add(1).min(count),
            InsertFlags::Overwrite => unreachable!("handled above"),
        };

        // threshold reached: migrate every record to an external table
        if count as usize + 1 > self.cfg.dup_threshold() {
            return self.migrate_to_dup_table(pager, page, slot, &area, pos, entry, key_flags);
        }

        let new_area = records::area_insert(has_counter, width, &area, pos, entry)?;
        pager.mark_dirty(page);
        let outcome = {
            let mut guard = page.data_mut();
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            node.replace_record_area(slot, &new_area)?
        };
        match outcome {
            SpaceOutcome::Fit => Ok(()),
            // the slot cannot grow in this node: migrate instead of
            // splitting
            SpaceOutcome::NeedsSplit => {
                self.migrate_to_dup_table(pager, page, slot, &area, pos, entry, key_flags)
            }
        }
    }

    fn migrate_to_dup_table(
        &mut self,
        pager: &mut PageManager,
        page: &Arc<Page>,
        slot: u32,
        area: &[u8],
        pos: u32,
        entry: &[u8],
        key_flags: u8,
    ) -> Result<()> {
        let has_counter = self.leaf_has_counter();
        let width = self.leaf_width();
        let count = records::area_count(has_counter, area);

        let mut entries = Vec::with_capacity((count as usize + 1) * width);
        for i in 0..count {
            entries.extend_from_slice(records::area_entry(has_counter, width, area, i)?);
        }
        let at = pos.min(count) as usize * width;
        entries.splice(at..at, entry.iter().copied());

        let table = DupTable::create(pager, width, &entries, count + 1)?;
        Metrics::bump(&pager.metrics().extended_duptables);

        pager.mark_dirty(page);
        let mut guard = page.data_mut();
        let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
        let outcome = node.replace_record_area(slot, &records::area_ext_dup(table.blob_id()))?;
        ensure!(
            outcome == SpaceOutcome::Fit,
            "duplicate table id must fit where inline records lived"
        );
        node.set_key_flags(slot, key_flags | KF_EXTENDED_DUPLICATES)?;
        Ok(())
    }

    fn write_record_area(
        &mut self,
        pager: &mut PageManager,
        page: &Arc<Page>,
        slot: u32,
        area: &[u8],
    ) -> Result<()> {
        pager.mark_dirty(page);
        let mut guard = page.data_mut();
        let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
        let outcome = node.replace_record_area(slot, area)?;
        ensure!(
            outcome == SpaceOutcome::Fit,
            "record area rewrite of equal or smaller size must fit"
        );
        Ok(())
    }

    // ------------------------------------------------------------------
    // split
    // ------------------------------------------------------------------

    fn read_raw_slot(node: &NodeRef<'_>, slot: u32) -> Result<RawSlot> {
        Ok(RawSlot {
            key_inline: node.key_inline(slot)?.to_vec(),
            key_flags: node.key_flags(slot)?,
            key_real_size: node.key_real_size(slot)?,
            area: node.record_area(slot)?.to_vec(),
        })
    }

    fn append_raw_slots(
        &self,
        page: &Arc<Page>,
        pager: &mut PageManager,
        start: u32,
        slots: &[RawSlot],
    ) -> Result<()> {
        pager.mark_dirty(page);
        let mut guard = page.data_mut();
        let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
        for (i, raw) in slots.iter().enumerate() {
            let outcome = node.insert_slot(
                start + i as u32,
                &raw.key_inline,
                raw.key_flags,
                raw.key_real_size,
                &raw.area,
            )?;
            ensure!(
                outcome == SpaceOutcome::Fit,
                "raw slot copy overflowed the target node"
            );
        }
        Ok(())
    }

    /// Splits one node: allocates a sibling, moves the upper half over,
    /// and returns the promoted separator key and the sibling's address.
    /// The parent is untouched.
    fn split_in_place(&mut self, pager: &mut PageManager, addr: u64) -> Result<(Vec<u8>, u64)> {
        let page = self.fetch_node(pager, addr)?;

        let (is_leaf, count) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.is_leaf(), node.count())
        };
        ensure!(count >= 2, "cannot split a node with {} slots", count);

        let pivot = count / 2;
        let copy_from = if is_leaf { pivot } else { pivot + 1 };

        let (pivot_raw, moved) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let pivot_raw = Self::read_raw_slot(&node, pivot)?;
            let mut moved = Vec::with_capacity((count - copy_from) as usize);
            for i in copy_from..count {
                moved.push(Self::read_raw_slot(&node, i)?);
            }
            (pivot_raw, moved)
        };
        let sep_key = ext_keys::resolve_key(
            pager,
            &mut self.ext_cache,
            &pivot_raw.key_inline,
            pivot_raw.key_flags,
        )?;

        let sibling = pager.alloc(PageType::BtreeNode)?;
        {
            let mut guard = sibling.data_mut();
            init_node(&mut guard[..], &self.cfg, is_leaf, self.capacity_hint)?;
        }
        self.append_raw_slots(&sibling, pager, 0, &moved)?;

        if !is_leaf {
            // the pivot is promoted: its child seeds the sibling's
            // leftmost edge and its key leaves this level entirely
            let pivot_child =
                u64::from_le_bytes(records::area_entry(false, 8, &pivot_raw.area, 0)?.try_into().unwrap());
            {
                pager.mark_dirty(&sibling);
                let mut guard = sibling.data_mut();
                let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
                node.set_ptr_down(pivot_child)?;
            }
            ext_keys::free_key(
                pager,
                &mut self.ext_cache,
                &pivot_raw.key_inline,
                pivot_raw.key_flags,
            )?;
        }

        pager.mark_dirty(&page);
        {
            let mut guard = page.data_mut();
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            node.truncate(pivot)?;
        }

        self.capacity_hint = count;
        Metrics::bump(&pager.metrics().btree_splits);
        Ok((sep_key, sibling.address()))
    }

    /// Inserts `(sep, right)` into the ancestors along `path`, splitting
    /// upward as needed; an empty path grows a new root.
    fn propagate_split(
        &mut self,
        pager: &mut PageManager,
        path: &[DescentStep],
        sep: Vec<u8>,
        right: u64,
    ) -> Result<()> {
        let mut sep = sep;
        let mut right = right;
        let mut level = path.len();

        loop {
            if level == 0 {
                return self.grow_new_root(pager, sep, right);
            }
            level -= 1;
            let parent_addr = path[level].addr;

            if self.insert_separator(pager, parent_addr, &sep, right)? == SpaceOutcome::Fit {
                return Ok(());
            }

            let (parent_sep, parent_right) = self.split_in_place(pager, parent_addr)?;
            let target = if self.cfg.compare(&sep, &parent_sep) == std::cmp::Ordering::Less {
                parent_addr
            } else {
                parent_right
            };
            let outcome = self.insert_separator(pager, target, &sep, right)?;
            ensure!(
                outcome == SpaceOutcome::Fit,
                "separator does not fit a freshly split node"
            );

            sep = parent_sep;
            right = parent_right;
        }
    }

    fn insert_separator(
        &mut self,
        pager: &mut PageManager,
        node_addr: u64,
        sep: &[u8],
        right: u64,
    ) -> Result<SpaceOutcome> {
        let page = self.fetch_node(pager, node_addr)?;
        let (pos, exact) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            self.search(pager, &node, sep)?
        };
        ensure!(!exact, "separator key already present in internal node");

        let inline =
            ext_keys::make_inline_key(pager, &mut self.ext_cache, sep, self.cfg.ext_threshold())?;
        let area = records::area_single(false, &right.to_le_bytes());

        pager.mark_dirty(&page);
        let outcome = {
            let mut guard = page.data_mut();
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            node.insert_slot(pos, &inline.bytes, inline.flags, inline.real_size, &area)?
        };
        if outcome == SpaceOutcome::NeedsSplit {
            ext_keys::free_key(pager, &mut self.ext_cache, &inline.bytes, inline.flags)?;
        }
        Ok(outcome)
    }

    fn grow_new_root(&mut self, pager: &mut PageManager, sep: Vec<u8>, right: u64) -> Result<()> {
        let old_root = self.root;
        let new_root = pager.alloc(PageType::BtreeRoot)?;
        {
            let mut guard = new_root.data_mut();
            init_node(&mut guard[..], &self.cfg, false, self.capacity_hint)?;
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            node.set_ptr_down(old_root)?;
        }

        let outcome = self.insert_separator(pager, new_root.address(), &sep, right)?;
        ensure!(
            outcome == SpaceOutcome::Fit,
            "separator does not fit an empty root"
        );

        let old = self.fetch_node(pager, old_root)?;
        pager.mark_dirty(&old);
        old.set_page_type(PageType::BtreeNode)?;

        self.set_root(pager, new_root.address())
    }

    // ------------------------------------------------------------------
    // erase
    // ------------------------------------------------------------------

    pub fn erase(
        &mut self,
        pager: &mut PageManager,
        key: &[u8],
        dup_idx: Option<u32>,
    ) -> Result<()> {
        let (leaf_addr, path) = self.descend_to_leaf(pager, key)?;
        let page = self.fetch_node(pager, leaf_addr)?;

        let (slot, exact, key_flags, area) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let (slot, exact) = self.search(pager, &node, key)?;
            if !exact {
                return ErrorKind::KeyNotFound.raise();
            }
            (
                slot,
                exact,
                node.key_flags(slot)?,
                node.record_area(slot)?.to_vec(),
            )
        };
        debug_assert!(exact);

        let mut erase_whole_slot = false;

        if key_flags & KF_EXTENDED_DUPLICATES != 0 {
            let table_id = records::area_ext_dup_id(&area)?;
            let mut table = DupTable::load(pager, table_id, self.leaf_width())?;
            match dup_idx {
                Some(i) => {
                    if i >= table.count() {
                        return ErrorKind::KeyNotFound.raise();
                    }
                    let old = table.entry(i)?.to_vec();
                    self.free_record_entry(pager, &old)?;
                    table.remove(pager, i)?;
                    if table.count() == 0 {
                        table.free(pager)?;
                        erase_whole_slot = true;
                    } else if table.blob_id() != table_id {
                        self.write_record_area(
                            pager,
                            &page,
                            slot,
                            &records::area_ext_dup(table.blob_id()),
                        )?;
                    }
                }
                None => {
                    for i in 0..table.count() {
                        let entry = table.entry(i)?.to_vec();
                        self.free_record_entry(pager, &entry)?;
                    }
                    table.free(pager)?;
                    erase_whole_slot = true;
                }
            }
        } else {
            let has_counter = self.leaf_has_counter();
            let width = self.leaf_width();
            let count = records::area_count(has_counter, &area);
            match dup_idx {
                Some(i) => {
                    if i >= count {
                        return ErrorKind::KeyNotFound.raise();
                    }
                    let old = records::area_entry(has_counter, width, &area, i)?.to_vec();
                    self.free_record_entry(pager, &old)?;
                    if count == 1 {
                        erase_whole_slot = true;
                    } else {
                        let new_area = records::area_remove(has_counter, width, &area, i)?;
                        self.write_record_area(pager, &page, slot, &new_area)?;
                    }
                }
                None => {
                    for i in 0..count {
                        let entry = records::area_entry(has_counter, width, &area, i)?.to_vec();
                        self.free_record_entry(pager, &entry)?;
                    }
                    erase_whole_slot = true;
                }
            }
        }

        if erase_whole_slot {
            let key_inline = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                node.key_inline(slot)?.to_vec()
            };
            ext_keys::free_key(pager, &mut self.ext_cache, &key_inline, key_flags)?;

            pager.mark_dirty(&page);
            {
                let mut guard = page.data_mut();
                let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
                node.erase_slot(slot)?;
            }
            self.rebalance(pager, leaf_addr, &path)?;
        }
        Ok(())
    }

    /// Underflow repair after an erase: merge into a sibling when the
    /// content fits, shift slots otherwise, collapse an empty internal
    /// root.
    fn rebalance(&mut self, pager: &mut PageManager, addr: u64, path: &[DescentStep]) -> Result<()> {
        let page = self.fetch_node(pager, addr)?;
        let (count, is_leaf, underfull) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.count(), node.is_leaf(), node.requires_merge())
        };

        if path.is_empty() {
            // the root: collapse an internal root that lost its last
            // separator into its only child
            if !is_leaf && count == 0 {
                let child = {
                    let guard = page.data();
                    NodeRef::open(&guard[..], &self.cfg)?.ptr_down()
                };
                let child_page = self.fetch_node(pager, child)?;
                pager.mark_dirty(&child_page);
                child_page.set_page_type(PageType::BtreeRoot)?;
                pager.free(addr, 1)?;
                self.set_root(pager, child)?;
            }
            return Ok(());
        }

        if !underfull {
            return Ok(());
        }

        let step = path[path.len() - 1];
        let parent_addr = step.addr;
        let parent_page = self.fetch_node(pager, parent_addr)?;
        let parent_count = {
            let guard = parent_page.data();
            NodeRef::open(&guard[..], &self.cfg)?.count()
        };
        if parent_count == 0 {
            return Ok(());
        }

        // adjacent sibling: prefer the right one
        let (left_idx, right_idx) = if step.child_idx + 1 < parent_count as i64 {
            (step.child_idx, step.child_idx + 1)
        } else {
            (step.child_idx - 1, step.child_idx)
        };
        let sep_slot = right_idx as u32;

        let (left_addr, right_addr) = {
            let guard = parent_page.data();
            let parent = NodeRef::open(&guard[..], &self.cfg)?;
            (
                self.child_at(&parent, left_idx)?,
                self.child_at(&parent, right_idx)?,
            )
        };

        let left_page = self.fetch_node(pager, left_addr)?;
        let right_page = self.fetch_node(pager, right_addr)?;

        // gather everything that would move into the left node
        let right_raw: Vec<RawSlot> = {
            let guard = right_page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (0..node.count())
                .map(|i| Self::read_raw_slot(&node, i))
                .collect::<Result<_>>()?
        };

        let sep_raw = {
            let guard = parent_page.data();
            let parent = NodeRef::open(&guard[..], &self.cfg)?;
            Self::read_raw_slot(&parent, sep_slot)?
        };

        let mut shapes: Vec<(usize, usize)> = right_raw.iter().map(RawSlot::shape).collect();
        let pulled_down_sep = if is_leaf {
            None
        } else {
            // internal merge pulls the separator down with the right
            // node's ptr_down as its child
            let sep_full = ext_keys::resolve_key(
                pager,
                &mut self.ext_cache,
                &sep_raw.key_inline,
                sep_raw.key_flags,
            )?;
            let inline_len = if sep_full.len() > self.cfg.ext_threshold() {
                8
            } else {
                sep_full.len()
            };
            shapes.push((inline_len, 8));
            Some(sep_full)
        };

        let fits = {
            let guard = left_page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            node.fits_slots(&shapes)
        };

        if fits {
            self.merge_into_left(
                pager,
                &left_page,
                &right_page,
                &parent_page,
                sep_slot,
                right_raw,
                pulled_down_sep,
            )?;
            let parent_path = &path[..path.len() - 1];
            return self.rebalance(pager, parent_addr, parent_path);
        }

        if is_leaf {
            self.shift_between(
                pager,
                &left_page,
                &right_page,
                &parent_page,
                sep_slot,
                addr == left_addr,
            )?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn merge_into_left(
        &mut self,
        pager: &mut PageManager,
        left_page: &Arc<Page>,
        right_page: &Arc<Page>,
        parent_page: &Arc<Page>,
        sep_slot: u32,
        right_raw: Vec<RawSlot>,
        pulled_down_sep: Option<Vec<u8>>,
    ) -> Result<()> {
        let left_count = {
            let guard = left_page.data();
            NodeRef::open(&guard[..], &self.cfg)?.count()
        };

        if let Some(sep_full) = pulled_down_sep {
            // separator comes down with the right node's leftmost child
            let right_ptr_down = {
                let guard = right_page.data();
                NodeRef::open(&guard[..], &self.cfg)?.ptr_down()
            };
            let inline = ext_keys::make_inline_key(
                pager,
                &mut self.ext_cache,
                &sep_full,
                self.cfg.ext_threshold(),
            )?;
            let area = records::area_single(false, &right_ptr_down.to_le_bytes());
            pager.mark_dirty(left_page);
            let outcome = {
                let mut guard = left_page.data_mut();
                let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
                node.insert_slot(left_count, &inline.bytes, inline.flags, inline.real_size, &area)?
            };
            ensure!(outcome == SpaceOutcome::Fit, "merge separator did not fit");
        }

        let left_count = {
            let guard = left_page.data();
            NodeRef::open(&guard[..], &self.cfg)?.count()
        };
        self.append_raw_slots(left_page, pager, left_count, &right_raw)?;

        // drop the separator from the parent; its extended key, if any,
        // belongs to the parent copy alone
        let sep_inline = {
            let guard = parent_page.data();
            let parent = NodeRef::open(&guard[..], &self.cfg)?;
            (
                parent.key_inline(sep_slot)?.to_vec(),
                parent.key_flags(sep_slot)?,
            )
        };
        ext_keys::free_key(pager, &mut self.ext_cache, &sep_inline.0, sep_inline.1)?;
        pager.mark_dirty(parent_page);
        {
            let mut guard = parent_page.data_mut();
            let mut parent = NodeMut::open(&mut guard[..], &self.cfg)?;
            parent.erase_slot(sep_slot)?;
        }

        pager.free(right_page.address(), 1)?;
        Metrics::bump(&pager.metrics().btree_merges);
        Ok(())
    }

    /// Moves slots between adjacent leaves to fix an underflow that merge
    /// cannot, then rewrites the parent separator to the right node's new
    /// first key.
    fn shift_between(
        &mut self,
        pager: &mut PageManager,
        left_page: &Arc<Page>,
        right_page: &Arc<Page>,
        parent_page: &Arc<Page>,
        sep_slot: u32,
        left_is_poor: bool,
    ) -> Result<()> {
        let left_count = {
            let guard = left_page.data();
            NodeRef::open(&guard[..], &self.cfg)?.count()
        };
        let right_count = {
            let guard = right_page.data();
            NodeRef::open(&guard[..], &self.cfg)?.count()
        };

        let (donor_page, donor_count, receiver_page, receiver_count) = if left_is_poor {
            (right_page, right_count, left_page, left_count)
        } else {
            (left_page, left_count, right_page, right_count)
        };
        if donor_count <= receiver_count {
            return Ok(());
        }
        let move_n = (donor_count - receiver_count) / 2;
        if move_n == 0 {
            return Ok(());
        }

        let moved: Vec<RawSlot> = {
            let guard = donor_page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let range = if left_is_poor {
                0..move_n
            } else {
                donor_count - move_n..donor_count
            };
            range
                .map(|i| Self::read_raw_slot(&node, i))
                .collect::<Result<_>>()?
        };

        let shapes: Vec<(usize, usize)> = moved.iter().map(RawSlot::shape).collect();
        let receiver_fits = {
            let guard = receiver_page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            node.fits_slots(&shapes)
        };
        if !receiver_fits {
            return Ok(());
        }

        // the right node's first key after the move becomes the new
        // separator
        let new_sep = if left_is_poor {
            let guard = donor_page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let raw = Self::read_raw_slot(&node, move_n)?;
            drop(guard);
            ext_keys::resolve_key(pager, &mut self.ext_cache, &raw.key_inline, raw.key_flags)?
        } else {
            ext_keys::resolve_key(
                pager,
                &mut self.ext_cache,
                &moved[0].key_inline,
                moved[0].key_flags,
            )?
        };

        // rewrite the parent separator first; if the new one cannot be
        // placed the shift is abandoned and the tree stays merely
        // underfull
        if !self.replace_separator(pager, parent_page, sep_slot, &new_sep)? {
            return Ok(());
        }

        if left_is_poor {
            self.append_raw_slots(receiver_page, pager, receiver_count, &moved)?;
            pager.mark_dirty(donor_page);
            let mut guard = donor_page.data_mut();
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            for _ in 0..move_n {
                node.erase_slot(0)?;
            }
        } else {
            // insert at the front of the right node, preserving order
            pager.mark_dirty(receiver_page);
            {
                let mut guard = receiver_page.data_mut();
                let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
                for raw in moved.iter().rev() {
                    let outcome = node.insert_slot(
                        0,
                        &raw.key_inline,
                        raw.key_flags,
                        raw.key_real_size,
                        &raw.area,
                    )?;
                    ensure!(outcome == SpaceOutcome::Fit, "shift overflowed the receiver");
                }
            }
            pager.mark_dirty(donor_page);
            let mut guard = donor_page.data_mut();
            let mut node = NodeMut::open(&mut guard[..], &self.cfg)?;
            node.truncate(donor_count - move_n)?;
        }

        Metrics::bump(&pager.metrics().btree_shifts);
        Ok(())
    }

    /// Replaces the separator at `sep_slot` with `new_sep`, keeping its
    /// child record. Returns false when the new separator cannot be
    /// placed.
    fn replace_separator(
        &mut self,
        pager: &mut PageManager,
        parent_page: &Arc<Page>,
        sep_slot: u32,
        new_sep: &[u8],
    ) -> Result<bool> {
        let old = {
            let guard = parent_page.data();
            let parent = NodeRef::open(&guard[..], &self.cfg)?;
            Self::read_raw_slot(&parent, sep_slot)?
        };

        let inline = ext_keys::make_inline_key(
            pager,
            &mut self.ext_cache,
            new_sep,
            self.cfg.ext_threshold(),
        )?;

        pager.mark_dirty(parent_page);
        let outcome = {
            let mut guard = parent_page.data_mut();
            let mut parent = NodeMut::open(&mut guard[..], &self.cfg)?;
            parent.erase_slot(sep_slot)?;
            parent.insert_slot(
                sep_slot,
                &inline.bytes,
                inline.flags,
                inline.real_size,
                &old.area,
            )?
        };

        if outcome == SpaceOutcome::NeedsSplit {
            // put the old separator back and report failure
            ext_keys::free_key(pager, &mut self.ext_cache, &inline.bytes, inline.flags)?;
            let mut guard = parent_page.data_mut();
            let mut parent = NodeMut::open(&mut guard[..], &self.cfg)?;
            let outcome = parent.insert_slot(
                sep_slot,
                &old.key_inline,
                old.key_flags,
                old.key_real_size,
                &old.area,
            )?;
            ensure!(
                outcome == SpaceOutcome::Fit,
                "reinstating an erased separator must fit"
            );
            return Ok(false);
        }

        ext_keys::free_key(pager, &mut self.ext_cache, &old.key_inline, old.key_flags)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // traversal
    // ------------------------------------------------------------------

    /// In-order traversal of every record; the visitor sees the resolved
    /// key and record bytes, duplicates in order.
    pub fn for_each(
        &mut self,
        pager: &mut PageManager,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        self.walk_records(pager, self.root, visitor)
    }

    fn walk_records(
        &mut self,
        pager: &mut PageManager,
        addr: u64,
        visitor: &mut dyn FnMut(&[u8], &[u8]) -> Result<()>,
    ) -> Result<()> {
        let page = self.fetch_node(pager, addr)?;
        let (is_leaf, count, ptr_down) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.is_leaf(), node.count(), node.ptr_down())
        };

        if !is_leaf {
            self.walk_records(pager, ptr_down, visitor)?;
            for i in 0..count {
                let child = {
                    let guard = page.data();
                    let node = NodeRef::open(&guard[..], &self.cfg)?;
                    self.child_at(&node, i as i64)?
                };
                self.walk_records(pager, child, visitor)?;
            }
            return Ok(());
        }

        for slot in 0..count {
            let (key_inline, key_flags) = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                (node.key_inline(slot)?.to_vec(), node.key_flags(slot)?)
            };
            let key =
                ext_keys::resolve_key(pager, &mut self.ext_cache, &key_inline, key_flags)?;

            let n = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                self.slot_record_count(pager, &node, slot)?
            };
            for dup in 0..n {
                let entry = {
                    let guard = page.data();
                    let node = NodeRef::open(&guard[..], &self.cfg)?;
                    if key_flags & KF_EXTENDED_DUPLICATES != 0 {
                        let table_id = records::area_ext_dup_id(node.record_area(slot)?)?;
                        DupTable::load(pager, table_id, self.leaf_width())?
                            .entry(dup as u32)?
                            .to_vec()
                    } else {
                        records::area_entry(
                            self.leaf_has_counter(),
                            self.leaf_width(),
                            node.record_area(slot)?,
                            dup as u32,
                        )?
                        .to_vec()
                    }
                };
                let record = self.decode_record_entry(pager, &entry)?;
                visitor(&key, &record)?;
            }
        }
        Ok(())
    }

    /// Key count (`distinct`) or total record count.
    pub fn count(&mut self, pager: &mut PageManager, distinct: bool) -> Result<u64> {
        self.count_node(pager, self.root, distinct)
    }

    fn count_node(&mut self, pager: &mut PageManager, addr: u64, distinct: bool) -> Result<u64> {
        let page = self.fetch_node(pager, addr)?;
        let (is_leaf, count, ptr_down) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.is_leaf(), node.count(), node.ptr_down())
        };

        if !is_leaf {
            let mut total = self.count_node(pager, ptr_down, distinct)?;
            for i in 0..count {
                let child = {
                    let guard = page.data();
                    let node = NodeRef::open(&guard[..], &self.cfg)?;
                    self.child_at(&node, i as i64)?
                };
                total += self.count_node(pager, child, distinct)?;
            }
            return Ok(total);
        }

        if distinct {
            return Ok(count as u64);
        }
        let mut total = 0u64;
        for slot in 0..count {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            let n = self.slot_record_count(pager, &node, slot)?;
            drop(guard);
            total += n;
        }
        Ok(total)
    }

    /// Frees every page and blob of this tree; used by `erase_db`.
    pub fn release(&mut self, pager: &mut PageManager) -> Result<()> {
        self.release_node(pager, self.root)
    }

    fn release_node(&mut self, pager: &mut PageManager, addr: u64) -> Result<()> {
        let page = pager.fetch_hint(addr, FetchHint::NoCache)?;
        let (is_leaf, count, ptr_down) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            (node.is_leaf(), node.count(), node.ptr_down())
        };

        if !is_leaf {
            self.release_node(pager, ptr_down)?;
        }

        for slot in 0..count {
            let raw = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                Self::read_raw_slot(&node, slot)?
            };

            if !is_leaf {
                let child =
                    u64::from_le_bytes(records::area_entry(false, 8, &raw.area, 0)?.try_into().unwrap());
                self.release_node(pager, child)?;
            } else if raw.key_flags & KF_EXTENDED_DUPLICATES != 0 {
                let table_id = records::area_ext_dup_id(&raw.area)?;
                let table = DupTable::load(pager, table_id, self.leaf_width())?;
                for i in 0..table.count() {
                    let entry = table.entry(i)?.to_vec();
                    self.free_record_entry(pager, &entry)?;
                }
                table.free(pager)?;
            } else {
                let n = records::area_count(self.leaf_has_counter(), &raw.area);
                for i in 0..n {
                    let entry = records::area_entry(
                        self.leaf_has_counter(),
                        self.leaf_width(),
                        &raw.area,
                        i,
                    )?
                    .to_vec();
                    self.free_record_entry(pager, &entry)?;
                }
            }

            ext_keys::free_key(pager, &mut self.ext_cache, &raw.key_inline, raw.key_flags)?;
        }

        pager.free(addr, 1)
    }

    // ------------------------------------------------------------------
    // integrity
    // ------------------------------------------------------------------

    /// Walks the whole tree checking structural and ordering invariants.
    pub fn check_integrity(&mut self, pager: &mut PageManager) -> Result<()> {
        let mut leaf_depth = None;
        self.check_node(pager, self.root, None, None, 0, &mut leaf_depth)
    }

    fn check_node(
        &mut self,
        pager: &mut PageManager,
        addr: u64,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
        leaf_depth: &mut Option<usize>,
    ) -> Result<()> {
        let page = self.fetch_node(pager, addr)?;
        let (is_leaf, count) = {
            let guard = page.data();
            let node = NodeRef::open(&guard[..], &self.cfg)?;
            node.check_integrity()
                .wrap_err_with(|| format!("node {} failed its layout check", addr))?;
            (node.is_leaf(), node.count())
        };

        if is_leaf {
            match leaf_depth {
                None => *leaf_depth = Some(depth),
                Some(expected) if *expected == depth => {}
                Some(_) => {
                    return ErrorKind::IntegrityViolated
                        .raise()
                        .wrap_err_with(|| format!("leaf {} at unbalanced depth {}", addr, depth));
                }
            }
        } else if count == 0 && depth > 0 {
            return ErrorKind::IntegrityViolated
                .raise()
                .wrap_err_with(|| format!("internal node {} has no separators", addr));
        }

        let mut resolved: Vec<Vec<u8>> = Vec::with_capacity(count as usize);
        for slot in 0..count {
            let (inline, flags) = {
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                (node.key_inline(slot)?.to_vec(), node.key_flags(slot)?)
            };
            let key = ext_keys::resolve_key(pager, &mut self.ext_cache, &inline, flags)?;

            if let Some(prev) = resolved.last() {
                if self.cfg.compare(prev, &key) != std::cmp::Ordering::Less {
                    return ErrorKind::IntegrityViolated
                        .raise()
                        .wrap_err_with(|| format!("keys out of order in node {}", addr));
                }
            }
            if let Some(lo) = lower {
                if self.cfg.compare(&key, lo) == std::cmp::Ordering::Less {
                    return ErrorKind::IntegrityViolated
                        .raise()
                        .wrap_err_with(|| format!("key below subtree bound in node {}", addr));
                }
            }
            if let Some(hi) = upper {
                if self.cfg.compare(&key, hi) != std::cmp::Ordering::Less {
                    return ErrorKind::IntegrityViolated
                        .raise()
                        .wrap_err_with(|| format!("key above subtree bound in node {}", addr));
                }
            }

            if is_leaf {
                // duplicate bookkeeping must be self-consistent
                let guard = page.data();
                let node = NodeRef::open(&guard[..], &self.cfg)?;
                let n = self.slot_record_count(pager, &node, slot)?;
                if n == 0 {
                    return ErrorKind::IntegrityViolated
                        .raise()
                        .wrap_err_with(|| format!("slot without records in node {}", addr));
                }
            }
            resolved.push(key);
        }

        if !is_leaf {
            let ptr_down = {
                let guard = page.data();
                NodeRef::open(&guard[..], &self.cfg)?.ptr_down()
            };
            let first_upper = resolved.first().map(|k| k.as_slice());
            self.check_node(pager, ptr_down, lower, first_upper, depth + 1, leaf_depth)?;

            for i in 0..count {
                let child = {
                    let guard = page.data();
                    let node = NodeRef::open(&guard[..], &self.cfg)?;
                    self.child_at(&node, i as i64)?
                };
                let child_lower = Some(resolved[i as usize].as_slice());
                let child_upper = resolved
                    .get(i as usize + 1)
                    .map(|k| k.as_slice())
                    .or(upper);
                self.check_node(pager, child, child_lower, child_upper, depth + 1, leaf_depth)?;
            }
        }
        Ok(())
    }
}
