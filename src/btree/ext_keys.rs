//! # Extended Keys
//!
//! Keys longer than the page-size-dependent threshold move to a blob; the
//! node keeps an 8-byte blob id and the `KF_EXTENDED_KEY` flag. Key
//! comparisons against such slots have to materialize the key, so a small
//! per-tree cache memoizes blob id -> key bytes. The cache is purged when
//! the blob is freed and dropped wholesale with the database handle.

use eyre::Result;
use hashbrown::HashMap;

use crate::blob;
use crate::metrics::Metrics;
use crate::pager::PageManager;

use super::KF_EXTENDED_KEY;

/// Inline form of a key: the bytes a node slot stores, plus flags and the
/// real size.
pub(crate) struct InlineKey {
    pub bytes: Vec<u8>,
    pub flags: u8,
    pub real_size: u16,
}

#[derive(Default)]
pub(crate) struct ExtKeyCache {
    map: HashMap<u64, Vec<u8>>,
}

impl ExtKeyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves an extended key's bytes, reading through the cache.
    pub fn resolve(&mut self, pager: &mut PageManager, blob_id: u64) -> Result<Vec<u8>> {
        if let Some(bytes) = self.map.get(&blob_id) {
            return Ok(bytes.clone());
        }
        let bytes = blob::read(pager, blob_id)?;
        self.map.insert(blob_id, bytes.clone());
        Ok(bytes)
    }

    pub fn purge(&mut self, blob_id: u64) {
        self.map.remove(&blob_id);
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }
}

/// Converts user key bytes into their inline form, spilling to a blob
/// past the extended threshold.
pub(crate) fn make_inline_key(
    pager: &mut PageManager,
    cache: &mut ExtKeyCache,
    key: &[u8],
    ext_threshold: usize,
) -> Result<InlineKey> {
    if key.len() <= ext_threshold {
        return Ok(InlineKey {
            bytes: key.to_vec(),
            flags: 0,
            real_size: key.len() as u16,
        });
    }

    let blob_id = blob::alloc(pager, key)?;
    cache.map.insert(blob_id, key.to_vec());
    Metrics::bump(&pager.metrics().extended_keys);
    Ok(InlineKey {
        bytes: blob_id.to_le_bytes().to_vec(),
        flags: KF_EXTENDED_KEY,
        real_size: key.len() as u16,
    })
}

/// Materializes a slot's key from its inline form.
pub(crate) fn resolve_key(
    pager: &mut PageManager,
    cache: &mut ExtKeyCache,
    inline: &[u8],
    flags: u8,
) -> Result<Vec<u8>> {
    if flags & KF_EXTENDED_KEY == 0 {
        return Ok(inline.to_vec());
    }
    let blob_id = u64::from_le_bytes(inline.try_into().map_err(|_| {
        eyre::eyre!("extended key slot holds {} bytes, expected 8", inline.len())
    })?);
    cache.resolve(pager, blob_id)
}

/// Frees the blob behind an extended key, if any.
pub(crate) fn free_key(
    pager: &mut PageManager,
    cache: &mut ExtKeyCache,
    inline: &[u8],
    flags: u8,
) -> Result<()> {
    if flags & KF_EXTENDED_KEY == 0 {
        return Ok(());
    }
    let blob_id = u64::from_le_bytes(inline.try_into().map_err(|_| {
        eyre::eyre!("extended key slot holds {} bytes, expected 8", inline.len())
    })?);
    cache.purge(blob_id);
    blob::free(pager, blob_id)
}
