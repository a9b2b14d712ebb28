//! # Node Header and Node Proxy
//!
//! Every b-tree page's payload starts with a 16-byte node header:
//!
//! ```text
//! Offset  Size  Field     Description
//! ------  ----  --------  --------------------------------------
//! 0       8     ptr_down  Leftmost child address (internal only)
//! 8       4     count     Number of live slots
//! 12      2     flags     Bit 0: leaf
//! 14      2     reserved
//! ```
//!
//! [`NodeRef`]/[`NodeMut`] are the type-erased proxies the tree works
//! with: they pick the PAX or default implementation from the node's leaf
//! flag and the database configuration, and forward the node-proxy
//! contract. Proxies borrow the page buffer and are recreated per access;
//! they hold no state of their own.
//!
//! Slot data passes through the proxy in *raw* form: the inline key bytes
//! (which may be an extended-key blob id), the key flags, the real key
//! size, and the record area bytes. Ownership of referenced blobs moves
//! with the raw slot, which is what makes split and merge plain byte
//! copies.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{MERGE_THRESHOLD, NODE_HEADER_SIZE, PAGE_HEADER_SIZE};

use super::pax::{PaxNode, PaxNodeMut};
use super::vlen::{VlenNode, VlenNodeMut};
use super::{LayoutKind, SpaceOutcome, TreeConfig};

pub(crate) const NODE_FLAG_LEAF: u16 = 1 << 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub(crate) struct PBtreeNode {
    ptr_down: U64,
    count: U32,
    flags: U16,
    reserved: U16,
}

const _: () = assert!(std::mem::size_of::<PBtreeNode>() == NODE_HEADER_SIZE);

impl PBtreeNode {
    pub fn from_page(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE + NODE_HEADER_SIZE,
            "buffer too small for PBtreeNode: {}",
            data.len()
        );
        Self::ref_from_bytes(&data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PBtreeNode: {:?}", e))
    }

    pub fn from_page_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE + NODE_HEADER_SIZE,
            "buffer too small for PBtreeNode: {}",
            data.len()
        );
        Self::mut_from_bytes(&mut data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + NODE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PBtreeNode: {:?}", e))
    }

    pub fn ptr_down(&self) -> u64 {
        self.ptr_down.get()
    }

    pub fn set_ptr_down(&mut self, address: u64) {
        self.ptr_down = U64::new(address);
    }

    pub fn count(&self) -> u32 {
        self.count.get()
    }

    pub fn set_count(&mut self, count: u32) {
        self.count = U32::new(count);
    }

    pub fn is_leaf(&self) -> bool {
        self.flags.get() & NODE_FLAG_LEAF != 0
    }

    pub fn set_leaf(&mut self, leaf: bool) {
        let mut flags = self.flags.get();
        if leaf {
            flags |= NODE_FLAG_LEAF;
        } else {
            flags &= !NODE_FLAG_LEAF;
        }
        self.flags = U16::new(flags);
    }
}

/// Node-level configuration derived from the tree configuration and the
/// node's position (leaf or internal).
#[derive(Debug, Clone, Copy)]
pub(crate) struct NodeCfg {
    pub page_size: usize,
    /// Fixed inline key width; `Some` in the PAX layout only.
    pub fixed_key: Option<u16>,
    /// Width of one record entry.
    pub entry_width: usize,
    /// Whether record areas start with a one-byte duplicate counter.
    pub has_counter: bool,
}

impl NodeCfg {
    pub fn new(tree: &TreeConfig, is_leaf: bool) -> Self {
        let kind = tree.layout_kind();
        let mode = tree.record_mode(is_leaf);
        Self {
            page_size: tree.page_size,
            fixed_key: match kind {
                LayoutKind::Pax => Some(tree.key_size),
                LayoutKind::Vlen => None,
            },
            entry_width: mode.entry_width(),
            has_counter: is_leaf && kind == LayoutKind::Vlen,
        }
    }

    /// Payload bytes available past page and node headers.
    pub fn usable_size(&self) -> usize {
        self.page_size - PAGE_HEADER_SIZE - NODE_HEADER_SIZE
    }
}

/// Initializes a page buffer as an empty node of the right layout.
pub(crate) fn init_node(
    data: &mut [u8],
    tree: &TreeConfig,
    is_leaf: bool,
    capacity_hint: u32,
) -> Result<()> {
    {
        let header = PBtreeNode::from_page_mut(data)?;
        header.set_ptr_down(0);
        header.set_count(0);
        header.set_leaf(is_leaf);
    }
    let cfg = NodeCfg::new(tree, is_leaf);
    match tree.layout_kind() {
        LayoutKind::Pax => PaxNodeMut::init(data, cfg),
        LayoutKind::Vlen => VlenNodeMut::init(data, cfg, capacity_hint),
    }
}

/// Read-only node proxy.
pub(crate) enum NodeRef<'a> {
    Pax(PaxNode<'a>),
    Vlen(VlenNode<'a>),
}

impl<'a> NodeRef<'a> {
    pub fn open(data: &'a [u8], tree: &TreeConfig) -> Result<Self> {
        let is_leaf = PBtreeNode::from_page(data)?.is_leaf();
        let cfg = NodeCfg::new(tree, is_leaf);
        Ok(match tree.layout_kind() {
            LayoutKind::Pax => NodeRef::Pax(PaxNode::new(data, cfg)?),
            LayoutKind::Vlen => NodeRef::Vlen(VlenNode::new(data, cfg)?),
        })
    }

    fn data(&self) -> &'a [u8] {
        match self {
            NodeRef::Pax(n) => n.data(),
            NodeRef::Vlen(n) => n.data(),
        }
    }

    pub fn count(&self) -> u32 {
        PBtreeNode::from_page(self.data()).map(|h| h.count()).unwrap_or(0)
    }

    pub fn is_leaf(&self) -> bool {
        PBtreeNode::from_page(self.data()).map(|h| h.is_leaf()).unwrap_or(false)
    }

    pub fn ptr_down(&self) -> u64 {
        PBtreeNode::from_page(self.data()).map(|h| h.ptr_down()).unwrap_or(0)
    }

    pub fn capacity(&self) -> u32 {
        match self {
            NodeRef::Pax(n) => n.capacity(),
            NodeRef::Vlen(n) => n.capacity(),
        }
    }

    pub fn key_inline(&self, slot: u32) -> Result<&'a [u8]> {
        match self {
            NodeRef::Pax(n) => n.key_inline(slot),
            NodeRef::Vlen(n) => n.key_inline(slot),
        }
    }

    pub fn key_flags(&self, slot: u32) -> Result<u8> {
        match self {
            NodeRef::Pax(n) => n.key_flags(slot),
            NodeRef::Vlen(n) => n.key_flags(slot),
        }
    }

    pub fn key_real_size(&self, slot: u32) -> Result<u16> {
        match self {
            NodeRef::Pax(n) => n.key_real_size(slot),
            NodeRef::Vlen(n) => n.key_real_size(slot),
        }
    }

    pub fn record_area(&self, slot: u32) -> Result<&'a [u8]> {
        match self {
            NodeRef::Pax(n) => n.record_area(slot),
            NodeRef::Vlen(n) => n.record_area(slot),
        }
    }

    /// Whether slots of the given `(key_inline_len, record_area_len)`
    /// shapes would all fit on top of the current content.
    pub fn fits_slots(&self, shapes: &[(usize, usize)]) -> bool {
        match self {
            NodeRef::Pax(n) => n.fits_slots(shapes),
            NodeRef::Vlen(n) => n.fits_slots(shapes),
        }
    }

    /// Merge candidate check.
    pub fn requires_merge(&self) -> bool {
        self.count() <= MERGE_THRESHOLD
    }

    /// Structural self-check of the in-node layout.
    pub fn check_integrity(&self) -> Result<()> {
        match self {
            NodeRef::Pax(n) => n.check_integrity(),
            NodeRef::Vlen(n) => n.check_integrity(),
        }
    }
}

/// Mutable node proxy.
pub(crate) enum NodeMut<'a> {
    Pax(PaxNodeMut<'a>),
    Vlen(VlenNodeMut<'a>),
}

impl<'a> NodeMut<'a> {
    pub fn open(data: &'a mut [u8], tree: &TreeConfig) -> Result<Self> {
        let is_leaf = PBtreeNode::from_page(data)?.is_leaf();
        let cfg = NodeCfg::new(tree, is_leaf);
        Ok(match tree.layout_kind() {
            LayoutKind::Pax => NodeMut::Pax(PaxNodeMut::new(data, cfg)?),
            LayoutKind::Vlen => NodeMut::Vlen(VlenNodeMut::new(data, cfg)?),
        })
    }

    fn data_mut(&mut self) -> &mut [u8] {
        match self {
            NodeMut::Pax(n) => n.data_mut(),
            NodeMut::Vlen(n) => n.data_mut(),
        }
    }

    pub fn set_ptr_down(&mut self, address: u64) -> Result<()> {
        PBtreeNode::from_page_mut(self.data_mut())?.set_ptr_down(address);
        Ok(())
    }

    /// Inserts a raw slot at `slot`, shifting later slots right.
    pub fn insert_slot(
        &mut self,
        slot: u32,
        key_inline: &[u8],
        key_flags: u8,
        key_real_size: u16,
        record_area: &[u8],
    ) -> Result<SpaceOutcome> {
        match self {
            NodeMut::Pax(n) => n.insert_slot(slot, key_inline, key_flags, key_real_size, record_area),
            NodeMut::Vlen(n) => n.insert_slot(slot, key_inline, key_flags, key_real_size, record_area),
        }
    }

    /// Removes a slot, shifting later slots left. Blob ownership is the
    /// caller's problem; this only touches the node.
    pub fn erase_slot(&mut self, slot: u32) -> Result<()> {
        match self {
            NodeMut::Pax(n) => n.erase_slot(slot),
            NodeMut::Vlen(n) => n.erase_slot(slot),
        }
    }

    /// Replaces a slot's record area, reallocating the chunk if it grew.
    pub fn replace_record_area(&mut self, slot: u32, record_area: &[u8]) -> Result<SpaceOutcome> {
        match self {
            NodeMut::Pax(n) => n.replace_record_area(slot, record_area),
            NodeMut::Vlen(n) => n.replace_record_area(slot, record_area),
        }
    }

    /// Updates a slot's key flags in place.
    pub fn set_key_flags(&mut self, slot: u32, flags: u8) -> Result<()> {
        match self {
            NodeMut::Pax(n) => n.set_key_flags(slot, flags),
            NodeMut::Vlen(n) => n.set_key_flags(slot, flags),
        }
    }

    /// Drops slots `[from, count)`.
    pub fn truncate(&mut self, from: u32) -> Result<()> {
        match self {
            NodeMut::Pax(n) => n.truncate(from),
            NodeMut::Vlen(n) => n.truncate(from),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KEY_SIZE_UNLIMITED, RECORD_SIZE_UNLIMITED};
    use crate::keys::KeyType;

    fn tree_cfg(key_size: u16) -> TreeConfig {
        TreeConfig {
            key_type: KeyType::Binary,
            key_size,
            rec_size: RECORD_SIZE_UNLIMITED,
            duplicates: false,
            record_number: false,
            force_records_inline: false,
            page_size: 1024,
            custom_compare: None,
        }
    }

    #[test]
    fn node_header_size_is_16_bytes() {
        assert_eq!(std::mem::size_of::<PBtreeNode>(), 16);
    }

    #[test]
    fn node_header_round_trip() {
        let mut data = vec![0u8; 1024];
        {
            let header = PBtreeNode::from_page_mut(&mut data).unwrap();
            header.set_ptr_down(4096);
            header.set_count(12);
            header.set_leaf(true);
        }

        let header = PBtreeNode::from_page(&data).unwrap();
        assert_eq!(header.ptr_down(), 4096);
        assert_eq!(header.count(), 12);
        assert!(header.is_leaf());
    }

    #[test]
    fn leaf_flag_toggles_cleanly() {
        let mut data = vec![0u8; 1024];
        let header = PBtreeNode::from_page_mut(&mut data).unwrap();

        header.set_leaf(true);
        assert!(header.is_leaf());
        header.set_leaf(false);
        assert!(!header.is_leaf());
    }

    #[test]
    fn proxy_picks_layout_from_config() {
        let mut data = vec![0u8; 1024];
        init_node(&mut data, &tree_cfg(16), true, 0).unwrap();
        assert!(matches!(
            NodeRef::open(&data, &tree_cfg(16)).unwrap(),
            NodeRef::Pax(_)
        ));

        let mut data = vec![0u8; 1024];
        init_node(&mut data, &tree_cfg(KEY_SIZE_UNLIMITED), true, 0).unwrap();
        assert!(matches!(
            NodeRef::open(&data, &tree_cfg(KEY_SIZE_UNLIMITED)).unwrap(),
            NodeRef::Vlen(_)
        ));
    }

    #[test]
    fn fresh_nodes_are_empty() {
        let mut data = vec![0u8; 1024];
        init_node(&mut data, &tree_cfg(16), true, 0).unwrap();

        let node = NodeRef::open(&data, &tree_cfg(16)).unwrap();
        assert_eq!(node.count(), 0);
        assert!(node.is_leaf());
        assert!(node.capacity() > 0);
    }
}
