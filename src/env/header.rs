//! # Environment Header Page
//!
//! Page 0 carries the environment's identity and the per-database
//! descriptor table:
//!
//! ```text
//! +---------------------+
//! | Page header (16B)   |  type = Header
//! +---------------------+
//! | Env header (32B)    |  magic, version, page size, blob id
//! +---------------------+
//! | Descriptor 0 (24B)  |  db_name == 0 marks a free slot
//! | Descriptor 1 (24B)  |
//! | ...                 |
//! +---------------------+
//! ```
//!
//! ## Environment header
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------
//! 0       4     magic "HAM\0"
//! 4       4     version (maj, min, rev, file)
//! 8       4     serial number
//! 12      4     page size
//! 16      2     max databases
//! 18      6     reserved
//! 24      8     page-manager state blob id
//! ```
//!
//! ## Descriptor
//!
//! ```text
//! Offset  Size  Field
//! ------  ----  --------------------------------
//! 0       8     root page address
//! 8       4     flags (duplicates, record number, ...)
//! 12      2     db name
//! 14      2     key size (0xFFFF = unlimited)
//! 16      2     key type code
//! 18      1     compression (reserved)
//! 19      1     reserved
//! 20      4     record size (0xFFFFFFFF = unlimited)
//! ```
//!
//! The first 512 bytes of the file always contain the page header and the
//! environment header regardless of page size, so open can read them
//! before it knows the real page size.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{DESCRIPTOR_SIZE, ENV_HEADER_SIZE, PAGE_HEADER_SIZE};
use crate::error::ErrorKind;

pub const ENV_MAGIC: [u8; 4] = *b"HAM\0";

/// Current file format version: (major, minor, revision, file).
pub const ENV_VERSION: [u8; 4] = [1, 0, 0, 1];

/// Files with an older file-format byte than this are rejected.
pub const MIN_FILE_VERSION: u8 = 1;

/// Descriptor flag: duplicate keys enabled.
pub const DBF_DUPLICATES: u32 = 1 << 0;
/// Descriptor flag: record-number database.
pub const DBF_RECORD_NUMBER: u32 = 1 << 1;
/// Descriptor flag: fixed-size records forced inline.
pub const DBF_FORCE_RECORDS_INLINE: u32 = 1 << 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PEnvHeader {
    magic: [u8; 4],
    version: [u8; 4],
    serialno: U32,
    page_size: U32,
    max_databases: U16,
    reserved: [u8; 6],
    page_manager_blobid: U64,
}

const _: () = assert!(std::mem::size_of::<PEnvHeader>() == ENV_HEADER_SIZE);

impl PEnvHeader {
    pub fn new(page_size: u32, max_databases: u16) -> Self {
        Self {
            magic: ENV_MAGIC,
            version: ENV_VERSION,
            serialno: U32::new(0),
            page_size: U32::new(page_size),
            max_databases: U16::new(max_databases),
            reserved: [0; 6],
            page_manager_blobid: U64::new(0),
        }
    }

    /// Parses and validates the header found in a page-0 buffer (page
    /// header included).
    pub fn from_page(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE + ENV_HEADER_SIZE,
            "buffer too small for PEnvHeader: {}",
            data.len()
        );
        let header = Self::ref_from_bytes(
            &data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_HEADER_SIZE],
        )
        .map_err(|e| eyre::eyre!("failed to read PEnvHeader: {:?}", e))?;

        if header.magic != ENV_MAGIC {
            return ErrorKind::InvalidFileHeader.raise();
        }
        if header.version[3] < MIN_FILE_VERSION || header.version[3] > ENV_VERSION[3] {
            return ErrorKind::InvalidFileVersion.raise();
        }
        Ok(header)
    }

    pub fn from_page_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE + ENV_HEADER_SIZE,
            "buffer too small for PEnvHeader: {}",
            data.len()
        );
        Self::mut_from_bytes(&mut data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to read PEnvHeader: {:?}", e))
    }

    /// Writes a fresh header into a page-0 buffer.
    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= PAGE_HEADER_SIZE + ENV_HEADER_SIZE,
            "buffer too small for PEnvHeader: {}",
            data.len()
        );
        data[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + ENV_HEADER_SIZE]
            .copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_size(&self) -> u32 {
        self.page_size.get()
    }

    pub fn max_databases(&self) -> u16 {
        self.max_databases.get()
    }

    pub fn serialno(&self) -> u32 {
        self.serialno.get()
    }

    pub fn set_serialno(&mut self, serial: u32) {
        self.serialno = U32::new(serial);
    }

    pub fn page_manager_blobid(&self) -> u64 {
        self.page_manager_blobid.get()
    }

    pub fn set_page_manager_blobid(&mut self, blob_id: u64) {
        self.page_manager_blobid = U64::new(blob_id);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct PBtreeDescriptor {
    root_address: U64,
    flags: U32,
    db_name: U16,
    key_size: U16,
    key_type: U16,
    compression: u8,
    reserved: u8,
    rec_size: U32,
}

const _: () = assert!(std::mem::size_of::<PBtreeDescriptor>() == DESCRIPTOR_SIZE);

impl PBtreeDescriptor {
    pub fn root_address(&self) -> u64 {
        self.root_address.get()
    }

    pub fn set_root_address(&mut self, address: u64) {
        self.root_address = U64::new(address);
    }

    pub fn flags(&self) -> u32 {
        self.flags.get()
    }

    pub fn set_flags(&mut self, flags: u32) {
        self.flags = U32::new(flags);
    }

    pub fn db_name(&self) -> u16 {
        self.db_name.get()
    }

    pub fn set_db_name(&mut self, name: u16) {
        self.db_name = U16::new(name);
    }

    pub fn key_size(&self) -> u16 {
        self.key_size.get()
    }

    pub fn set_key_size(&mut self, size: u16) {
        self.key_size = U16::new(size);
    }

    pub fn key_type(&self) -> u16 {
        self.key_type.get()
    }

    pub fn set_key_type(&mut self, code: u16) {
        self.key_type = U16::new(code);
    }

    pub fn rec_size(&self) -> u32 {
        self.rec_size.get()
    }

    pub fn set_rec_size(&mut self, size: u32) {
        self.rec_size = U32::new(size);
    }

    pub fn is_free(&self) -> bool {
        self.db_name.get() == 0
    }

    pub fn clear(&mut self) {
        self.root_address = U64::new(0);
        self.flags = U32::new(0);
        self.db_name = U16::new(0);
        self.key_size = U16::new(0);
        self.key_type = U16::new(0);
        self.compression = 0;
        self.reserved = 0;
        self.rec_size = U32::new(0);
    }
}

fn descriptor_offset(slot: usize) -> usize {
    PAGE_HEADER_SIZE + ENV_HEADER_SIZE + slot * DESCRIPTOR_SIZE
}

/// Borrows descriptor `slot` from a page-0 buffer.
pub fn descriptor(data: &[u8], slot: usize) -> Result<&PBtreeDescriptor> {
    let off = descriptor_offset(slot);
    ensure!(
        off + DESCRIPTOR_SIZE <= data.len(),
        "descriptor slot {} beyond page 0",
        slot
    );
    PBtreeDescriptor::ref_from_bytes(&data[off..off + DESCRIPTOR_SIZE])
        .map_err(|e| eyre::eyre!("failed to read descriptor {}: {:?}", slot, e))
}

pub fn descriptor_mut(data: &mut [u8], slot: usize) -> Result<&mut PBtreeDescriptor> {
    let off = descriptor_offset(slot);
    ensure!(
        off + DESCRIPTOR_SIZE <= data.len(),
        "descriptor slot {} beyond page 0",
        slot
    );
    PBtreeDescriptor::mut_from_bytes(&mut data[off..off + DESCRIPTOR_SIZE])
        .map_err(|e| eyre::eyre!("failed to read descriptor {}: {:?}", slot, e))
}

/// The slot holding `name`, if any.
pub fn find_db_slot(data: &[u8], max_databases: u16, name: u16) -> Result<Option<usize>> {
    for slot in 0..max_databases as usize {
        if descriptor(data, slot)?.db_name() == name {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// The first free slot, if any.
pub fn find_free_slot(data: &[u8], max_databases: u16) -> Result<Option<usize>> {
    for slot in 0..max_databases as usize {
        if descriptor(data, slot)?.is_free() {
            return Ok(Some(slot));
        }
    }
    Ok(None)
}

/// All non-free database names, in slot order.
pub fn database_names(data: &[u8], max_databases: u16) -> Result<Vec<u16>> {
    let mut names = Vec::new();
    for slot in 0..max_databases as usize {
        let desc = descriptor(data, slot)?;
        if !desc.is_free() {
            names.push(desc.db_name());
        }
    }
    Ok(names)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page0(page_size: usize, max_databases: u16) -> Vec<u8> {
        let mut data = vec![0u8; page_size];
        PEnvHeader::new(page_size as u32, max_databases)
            .write_to(&mut data)
            .unwrap();
        data
    }

    #[test]
    fn struct_sizes_match_the_file_format() {
        assert_eq!(std::mem::size_of::<PEnvHeader>(), 32);
        assert_eq!(std::mem::size_of::<PBtreeDescriptor>(), 24);
    }

    #[test]
    fn header_round_trip() {
        let data = page0(4096, 8);

        let header = PEnvHeader::from_page(&data).unwrap();
        assert_eq!(header.page_size(), 4096);
        assert_eq!(header.max_databases(), 8);
        assert_eq!(header.page_manager_blobid(), 0);
    }

    #[test]
    fn bad_magic_is_invalid_file_header() {
        let mut data = page0(4096, 8);
        data[PAGE_HEADER_SIZE] = b'X';

        let err = PEnvHeader::from_page(&data).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidFileHeader));
    }

    #[test]
    fn old_file_version_is_rejected() {
        let mut data = page0(4096, 8);
        data[PAGE_HEADER_SIZE + 7] = 0;

        let err = PEnvHeader::from_page(&data).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidFileVersion));
    }

    #[test]
    fn future_file_version_is_rejected() {
        let mut data = page0(4096, 8);
        data[PAGE_HEADER_SIZE + 7] = ENV_VERSION[3] + 1;

        let err = PEnvHeader::from_page(&data).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidFileVersion));
    }

    #[test]
    fn descriptor_slots_start_free() {
        let data = page0(4096, 8);

        for slot in 0..8 {
            assert!(descriptor(&data, slot).unwrap().is_free());
        }
        assert_eq!(find_free_slot(&data, 8).unwrap(), Some(0));
        assert_eq!(find_db_slot(&data, 8, 42).unwrap(), None);
    }

    #[test]
    fn descriptor_round_trip() {
        let mut data = page0(4096, 8);

        {
            let desc = descriptor_mut(&mut data, 3).unwrap();
            desc.set_db_name(17);
            desc.set_root_address(8192);
            desc.set_flags(DBF_DUPLICATES);
            desc.set_key_size(16);
            desc.set_key_type(4);
            desc.set_rec_size(100);
        }

        let desc = descriptor(&data, 3).unwrap();
        assert_eq!(desc.db_name(), 17);
        assert_eq!(desc.root_address(), 8192);
        assert_eq!(desc.flags(), DBF_DUPLICATES);
        assert_eq!(desc.key_size(), 16);
        assert_eq!(desc.key_type(), 4);
        assert_eq!(desc.rec_size(), 100);

        assert_eq!(find_db_slot(&data, 8, 17).unwrap(), Some(3));
        assert_eq!(database_names(&data, 8).unwrap(), vec![17]);

        descriptor_mut(&mut data, 3).unwrap().clear();
        assert!(descriptor(&data, 3).unwrap().is_free());
    }
}
