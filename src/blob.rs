//! # Blob Manager
//!
//! Variable-sized byte payloads addressed by blob-id. A blob occupies a
//! contiguous extent of pages; the blob-id is the address of the first
//! page. Extended keys, external duplicate tables, out-of-node records and
//! the persisted freelist state all live here.
//!
//! ## Layout
//!
//! Every page of the extent carries the usual 16-byte page header (type =
//! Blob), so LSN stamping and recovery treat blob pages like any other
//! page. The first page's payload starts with the blob header:
//!
//! ```text
//! Offset  Size  Field           Description
//! ------  ----  --------------  ---------------------------------
//! 0       8     allocated_size  Payload capacity of the extent
//! 8       8     size            Live payload length
//! 16      4     flags           Reserved
//! 20      4     reserved
//! ```
//!
//! The payload streams through the page payloads in address order.
//! `overwrite` reuses the extent while the new payload fits inside
//! `allocated_size`; otherwise the old extent is freed and the blob moves.

use eyre::{ensure, Result, WrapErr};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{BLOB_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::ErrorKind;
use crate::metrics::Metrics;
use crate::page::PageType;
use crate::pager::PageManager;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PBlobHeader {
    allocated_size: U64,
    size: U64,
    flags: U32,
    reserved: U32,
}

const _: () = assert!(std::mem::size_of::<PBlobHeader>() == BLOB_HEADER_SIZE);

impl PBlobHeader {
    fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= BLOB_HEADER_SIZE,
            "buffer too small for PBlobHeader: {} < {}",
            data.len(),
            BLOB_HEADER_SIZE
        );
        Self::ref_from_bytes(&data[..BLOB_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PBlobHeader: {:?}", e))
    }
}

/// Payload bytes that fit in one page.
fn page_capacity(pager: &PageManager) -> usize {
    pager.page_size() - PAGE_HEADER_SIZE
}

/// Pages needed for a payload of `len` bytes, header included.
fn span_pages(pager: &PageManager, len: usize) -> u64 {
    let cap = page_capacity(pager);
    ((BLOB_HEADER_SIZE + len + cap - 1) / cap) as u64
}

/// Allocates a new blob holding `data` and returns its id.
pub fn alloc(pager: &mut PageManager, data: &[u8]) -> Result<u64> {
    let npages = span_pages(pager, data.len());
    let cap = page_capacity(pager);
    let allocated = npages as usize * cap - BLOB_HEADER_SIZE;

    let pages = pager.alloc_span(PageType::Blob, npages)?;
    let blob_id = pages[0].address();

    {
        let mut buf = pages[0].data_mut();
        let header = PBlobHeader {
            allocated_size: U64::new(allocated as u64),
            size: U64::new(data.len() as u64),
            flags: U32::new(0),
            reserved: U32::new(0),
        };
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_HEADER_SIZE]
            .copy_from_slice(header.as_bytes());
    }

    write_payload(pager, &pages.iter().map(|p| p.address()).collect::<Vec<_>>(), data)?;
    Metrics::bump(&pager.metrics().blob_allocs);
    Ok(blob_id)
}

/// Reads a blob's full payload.
pub fn read(pager: &mut PageManager, blob_id: u64) -> Result<Vec<u8>> {
    let (allocated, size) = header_of(pager, blob_id)?;
    let cap = page_capacity(pager);
    let npages = ((BLOB_HEADER_SIZE + allocated as usize + cap - 1) / cap) as u64;

    let mut out = vec![0u8; size as usize];
    let mut done = 0usize;
    for i in 0..npages {
        if done >= out.len() {
            break;
        }
        let page = pager.fetch(blob_id + i * pager.page_size() as u64)?;
        let buf = page.data();
        let payload_start = if i == 0 {
            PAGE_HEADER_SIZE + BLOB_HEADER_SIZE
        } else {
            PAGE_HEADER_SIZE
        };
        let take = (out.len() - done).min(buf.len() - payload_start);
        out[done..done + take].copy_from_slice(&buf[payload_start..payload_start + take]);
        done += take;
    }
    ensure!(
        done == out.len(),
        "blob {} short by {} bytes",
        blob_id,
        out.len() - done
    );
    Ok(out)
}

/// Replaces a blob's payload, reusing the extent when the new payload
/// fits. Returns the (possibly new) blob id.
pub fn overwrite(pager: &mut PageManager, blob_id: u64, data: &[u8]) -> Result<u64> {
    let (allocated, _size) = header_of(pager, blob_id)?;

    if data.len() as u64 <= allocated {
        let cap = page_capacity(pager);
        let npages = ((BLOB_HEADER_SIZE + allocated as usize + cap - 1) / cap) as u64;
        let addrs: Vec<u64> = (0..npages)
            .map(|i| blob_id + i * pager.page_size() as u64)
            .collect();

        let first = pager.fetch(blob_id)?;
        pager.mark_dirty(&first);
        {
            let mut buf = first.data_mut();
            let header = PBlobHeader {
                allocated_size: U64::new(allocated),
                size: U64::new(data.len() as u64),
                flags: U32::new(0),
                reserved: U32::new(0),
            };
            buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + BLOB_HEADER_SIZE]
                .copy_from_slice(header.as_bytes());
        }
        write_payload(pager, &addrs, data)?;
        return Ok(blob_id);
    }

    free(pager, blob_id)?;
    alloc(pager, data)
}

/// Frees a blob's extent.
pub fn free(pager: &mut PageManager, blob_id: u64) -> Result<()> {
    let (allocated, _) = header_of(pager, blob_id)?;
    let cap = page_capacity(pager);
    let npages = ((BLOB_HEADER_SIZE + allocated as usize + cap - 1) / cap) as u64;
    pager
        .free(blob_id, npages)
        .wrap_err_with(|| format!("failed to free blob {}", blob_id))?;
    Metrics::bump(&pager.metrics().blob_frees);
    Ok(())
}

/// Live payload length of a blob.
pub fn size(pager: &mut PageManager, blob_id: u64) -> Result<u64> {
    Ok(header_of(pager, blob_id)?.1)
}

fn header_of(pager: &mut PageManager, blob_id: u64) -> Result<(u64, u64)> {
    ensure!(blob_id != 0, "blob id 0 is reserved");
    let page = pager.fetch(blob_id)?;
    if page.page_type() != PageType::Blob {
        return ErrorKind::IntegrityViolated
            .raise()
            .wrap_err_with(|| format!("page {} is not a blob page", blob_id));
    }
    let buf = page.data();
    let header = PBlobHeader::from_bytes(&buf[PAGE_HEADER_SIZE..])?;
    Ok((header.allocated_size.get(), header.size.get()))
}

fn write_payload(pager: &mut PageManager, addrs: &[u64], data: &[u8]) -> Result<()> {
    let mut done = 0usize;
    for (i, &addr) in addrs.iter().enumerate() {
        if done >= data.len() {
            break;
        }
        let page = pager.fetch(addr)?;
        pager.mark_dirty(&page);
        let mut buf = page.data_mut();
        let payload_start = if i == 0 {
            PAGE_HEADER_SIZE + BLOB_HEADER_SIZE
        } else {
            PAGE_HEADER_SIZE
        };
        let take = (data.len() - done).min(buf.len() - payload_start);
        buf[payload_start..payload_start + take].copy_from_slice(&data[done..done + take]);
        done += take;
    }
    ensure!(done == data.len(), "blob payload did not fit its extent");
    Ok(())
}
