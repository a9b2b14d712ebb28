//! # Pages
//!
//! Every page starts with a 16-byte persistent header:
//!
//! ```text
//! Offset  Size  Field      Description
//! ------  ----  ---------  -----------------------------------------
//! 0       8     lsn        LSN of the last changeset that wrote this page
//! 8       2     flags      Page flags (reserved)
//! 10      2     page_type  Header, BtreeRoot, BtreeNode, Freelist, Blob
//! 12      4     reserved
//! ```
//!
//! The header page always sits at address 0; every other page's address is
//! its byte offset in the file, a multiple of the page size.
//!
//! [`Page`] is the cached, in-memory form: the raw buffer behind a
//! `parking_lot::RwLock`, a dirty bit, and a pin count. Pins are owned by
//! the changeset; a pinned page cannot be evicted. Node proxies borrow the
//! locked buffer for the duration of one operation and are recreated
//! cheaply, so nothing outlives the page's residency in the cache.
//!
//! The LSN in the header is non-decreasing across flushes of the same page;
//! recovery relies on it to decide whether a journal image is newer than
//! the on-disk state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use eyre::{ensure, Result};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::PAGE_HEADER_SIZE;

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0,
    Header = 1,
    BtreeRoot = 2,
    BtreeNode = 3,
    Freelist = 4,
    Blob = 5,
}

impl PageType {
    pub fn from_code(code: u16) -> Self {
        match code {
            1 => PageType::Header,
            2 => PageType::BtreeRoot,
            3 => PageType::BtreeNode,
            4 => PageType::Freelist,
            5 => PageType::Blob,
            _ => PageType::Unknown,
        }
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PPageHeader {
    lsn: U64,
    flags: U16,
    page_type: U16,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<PPageHeader>() == PAGE_HEADER_SIZE);

impl PPageHeader {
    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PPageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PPageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE,
            "buffer too small for PPageHeader: {} < {}",
            data.len(),
            PAGE_HEADER_SIZE
        );
        Self::mut_from_bytes(&mut data[..PAGE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PPageHeader: {:?}", e))
    }

    pub fn lsn(&self) -> u64 {
        self.lsn.get()
    }

    pub fn set_lsn(&mut self, lsn: u64) {
        self.lsn = U64::new(lsn);
    }

    pub fn flags(&self) -> u16 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u16) {
        self.flags = U16::new(flags);
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_code(self.page_type.get())
    }

    pub fn set_page_type(&mut self, t: PageType) {
        self.page_type = U16::new(t as u16);
    }
}

/// A cached page: address, raw buffer, dirty bit, pin count.
pub struct Page {
    address: u64,
    buf: RwLock<Box<[u8]>>,
    dirty: AtomicBool,
    pins: AtomicU32,
}

impl Page {
    pub fn new(address: u64, page_size: usize) -> Self {
        Self {
            address,
            buf: RwLock::new(vec![0u8; page_size].into_boxed_slice()),
            dirty: AtomicBool::new(false),
            pins: AtomicU32::new(0),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    /// Locks the buffer for reading. The full page, header included.
    pub fn data(&self) -> RwLockReadGuard<'_, Box<[u8]>> {
        self.buf.read()
    }

    /// Locks the buffer for writing and marks the page dirty.
    pub fn data_mut(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.dirty.store(true, Ordering::Release);
        self.buf.write()
    }

    /// Write lock without dirtying; for loads from the device.
    pub(crate) fn data_mut_clean(&self) -> RwLockWriteGuard<'_, Box<[u8]>> {
        self.buf.write()
    }

    pub fn lsn(&self) -> u64 {
        let guard = self.buf.read();
        PPageHeader::from_bytes(&guard).map(|h| h.lsn()).unwrap_or(0)
    }

    pub fn set_lsn(&self, lsn: u64) -> Result<()> {
        let mut guard = self.data_mut();
        PPageHeader::from_bytes_mut(&mut guard)?.set_lsn(lsn);
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        let guard = self.buf.read();
        PPageHeader::from_bytes(&guard)
            .map(|h| h.page_type())
            .unwrap_or(PageType::Unknown)
    }

    pub fn set_page_type(&self, t: PageType) -> Result<()> {
        let mut guard = self.data_mut();
        PPageHeader::from_bytes_mut(&mut guard)?.set_page_type(t);
        Ok(())
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }

    pub fn clear_dirty(&self) {
        self.dirty.store(false, Ordering::Release);
    }

    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    pub fn unpin(&self) {
        let prev = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "unpin of unpinned page {}", self.address);
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("address", &self.address)
            .field("dirty", &self.is_dirty())
            .field("pinned", &self.is_pinned())
            .finish()
    }
}
