//! # Environment and Databases
//!
//! The environment mounts one paged file (or an in-memory device) and
//! hands out [`Database`] handles over the logical databases sharing it.
//! A coarse mutex serializes every operation, readers included; the
//! contract is serializable access, not reader/writer parallelism.
//!
//! ## Mount
//!
//! Open reads the first 512 bytes, validates magic and version, adopts
//! the declared page size, and reloads the real page 0. With journaling
//! enabled a non-empty journal is replayed (or `NeedRecovery` is
//! returned when auto-recovery is off). The persisted freelist state is
//! loaded from the blob recorded on page 0.
//!
//! ## Commit
//!
//! Every modifying operation runs against the page manager's changeset
//! and commits before returning: stamp the new LSN into each touched
//! page, append the changeset to the journal (before-images,
//! after-images, checkpoint marker) and fsync it, then write the pages to
//! the device, header page last. The device itself is fsync'd when
//! `flush_when_committed` is set; otherwise durability rests on the
//! journal until close.
//!
//! ## Close
//!
//! Close commits pending state, persists the freelist into its state
//! blob, flushes everything, gives a trailing free extent back to the
//! filesystem, and truncates the journal (unless `dont_clear_log` keeps
//! it for inspection).

pub(crate) mod header;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use eyre::{Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::btree::{BtreeIndex, InsertFlags, MatchMode, TreeConfig};
use crate::config::{DbOptions, EnvOptions, KEY_SIZE_UNLIMITED};
use crate::device::{Device, FileDevice, MemoryDevice, MmapDevice};
use crate::error::ErrorKind;
use crate::journal::Journal;
use crate::keys::{self, CompareFn, KeyType};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::page::{PPageHeader, PageType};
use crate::pager::PageManager;

use header::{
    database_names, descriptor, descriptor_mut, find_db_slot, find_free_slot, PEnvHeader,
    DBF_DUPLICATES, DBF_FORCE_RECORDS_INLINE, DBF_RECORD_NUMBER,
};

struct OpenDb {
    index: BtreeIndex,
    refs: u32,
}

struct Core {
    pager: PageManager,
    journal: Option<Journal>,
    databases: HashMap<u16, OpenDb>,
    page_size: usize,
    max_databases: u16,
    state_blob: u64,
    /// LSN source for journal-less environments.
    lsn: u64,
    read_only: bool,
    flush_when_committed: bool,
    dont_clear_log: bool,
    closed: bool,
}

impl Core {
    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return ErrorKind::InvalidParameter
                .raise()
                .wrap_err("environment is closed");
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.read_only {
            return ErrorKind::WriteProtected.raise();
        }
        Ok(())
    }

    /// Commits the current changeset: LSN stamp, journal append + fsync,
    /// page writeback with the header page last.
    fn commit(&mut self, db_name: u16) -> Result<()> {
        if self.pager.changeset().is_empty() {
            return Ok(());
        }

        let lsn = match &mut self.journal {
            Some(journal) => journal.next_lsn(),
            None => {
                self.lsn += 1;
                self.lsn
            }
        };
        for entry in self.pager.changeset().entries() {
            entry.page.set_lsn(lsn)?;
        }

        if let Some(journal) = &mut self.journal {
            journal.append_changeset(lsn, db_name, self.pager.changeset().entries())?;
        }

        self.pager.flush_changeset(self.flush_when_committed)?;
        Ok(())
    }

    /// Persists the freelist state and records its blob id on page 0.
    fn store_pager_state(&mut self) -> Result<()> {
        let blob_id = self.pager.store_state(self.state_blob)?;
        if blob_id != self.state_blob {
            let page = self.pager.fetch(0)?;
            self.pager.mark_dirty(&page);
            let mut guard = page.data_mut();
            PEnvHeader::from_page_mut(&mut guard[..])?.set_page_manager_blobid(blob_id);
            self.state_blob = blob_id;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        if !self.read_only {
            self.commit(0)?;
            // shrink first so the stored freelist matches the file
            self.pager.truncate_tail()?;
            self.store_pager_state()?;
            self.commit(0)?;
            self.pager.close()?;
        }
        if let Some(journal) = &mut self.journal {
            journal.close(self.dont_clear_log)?;
        }
        Ok(())
    }
}

/// The journal lives next to the data file unless a log directory was
/// configured.
fn journal_base(path: &Path, opts: &EnvOptions) -> PathBuf {
    match (&opts.log_directory, path.file_name()) {
        (Some(dir), Some(name)) => dir.join(name),
        _ => path.to_path_buf(),
    }
}

struct EnvInner {
    core: Mutex<Core>,
    metrics: Arc<Metrics>,
    path: Option<PathBuf>,
}

impl Drop for EnvInner {
    fn drop(&mut self) {
        // best effort; errors here have nowhere to go
        let _ = self.core.lock().close();
    }
}

/// An embedded, transactional, ordered key/value store over one paged
/// file.
pub struct Environment {
    inner: Arc<EnvInner>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment").finish_non_exhaustive()
    }
}

impl Environment {
    /// Creates a fresh environment file (or in-memory arena).
    pub fn create<P: AsRef<Path>>(path: P, opts: EnvOptions) -> Result<Self> {
        opts.validate()?;
        let path = path.as_ref();
        let metrics = Arc::new(Metrics::default());

        let device: Box<dyn Device> = if opts.in_memory {
            Box::new(MemoryDevice::new())
        } else if opts.disable_mmap {
            Box::new(FileDevice::create(path, opts.file_mode)?)
        } else {
            Box::new(MmapDevice::create(path, opts.file_mode)?)
        };

        let journal = if !opts.in_memory && opts.enable_journal {
            let base = journal_base(path, &opts);
            Some(Journal::create(&base, Arc::clone(&metrics))?)
        } else {
            None
        };

        let mut pager = PageManager::new(
            device,
            opts.page_size,
            opts.cache_size,
            opts.cache_unlimited || opts.in_memory,
            journal.is_some(),
            Arc::clone(&metrics),
        );

        // page 0: page header + environment header + empty descriptors
        let header_page = pager.alloc_span(PageType::Header, 1)?.remove(0);
        {
            let mut guard = header_page.data_mut();
            PEnvHeader::new(opts.page_size as u32, opts.max_databases as u16)
                .write_to(&mut guard[..])?;
        }

        let mut core = Core {
            pager,
            journal,
            databases: HashMap::new(),
            page_size: opts.page_size,
            max_databases: opts.max_databases as u16,
            state_blob: 0,
            lsn: 0,
            read_only: false,
            flush_when_committed: opts.flush_when_committed,
            dont_clear_log: opts.dont_clear_log,
            closed: false,
        };
        core.commit(0)?;

        Ok(Self {
            inner: Arc::new(EnvInner {
                core: Mutex::new(core),
                metrics,
                path: (!opts.in_memory).then(|| path.to_path_buf()),
            }),
        })
    }

    /// Opens an existing environment file, running recovery if the
    /// journal demands it.
    pub fn open<P: AsRef<Path>>(path: P, opts: EnvOptions) -> Result<Self> {
        let path = path.as_ref();
        if opts.in_memory {
            return ErrorKind::InvalidParameter
                .raise()
                .wrap_err("in-memory environments cannot be reopened");
        }
        let metrics = Arc::new(Metrics::default());

        let mut device: Box<dyn Device> = if opts.disable_mmap {
            Box::new(FileDevice::open(path, opts.read_only)?)
        } else {
            Box::new(MmapDevice::open(path, opts.read_only)?)
        };

        // the first 512 bytes hold the page and environment headers for
        // any page size
        if device.len() < 512 {
            return ErrorKind::InvalidFileHeader
                .raise()
                .wrap_err_with(|| format!("'{}' is too short", path.display()));
        }
        let mut probe = [0u8; 512];
        device.read(0, &mut probe)?;
        if PPageHeader::from_bytes(&probe)?.page_type() != PageType::Header {
            return ErrorKind::InvalidFileHeader.raise();
        }
        let (page_size, max_databases, state_blob) = {
            let env_header = PEnvHeader::from_page(&probe)?;
            (
                env_header.page_size() as usize,
                env_header.max_databases(),
                env_header.page_manager_blobid(),
            )
        };
        if device.len() % page_size as u64 != 0 {
            return ErrorKind::IntegrityViolated
                .raise()
                .wrap_err("file size is not a multiple of the page size");
        }

        let journal = if opts.enable_journal && !opts.read_only {
            let base = journal_base(path, &opts);
            let mut journal = Journal::open(&base, Arc::clone(&metrics))?;
            journal.set_lsn_floor(PPageHeader::from_bytes(&probe)?.lsn());
            if !journal.is_empty() {
                if !opts.auto_recovery {
                    return ErrorKind::NeedRecovery.raise();
                }
                journal
                    .recover(device.as_mut(), page_size)
                    .wrap_err("journal recovery failed")?;
                journal.clear()?;
            }
            Some(journal)
        } else {
            None
        };

        let mut pager = PageManager::new(
            device,
            page_size,
            opts.cache_size,
            opts.cache_unlimited,
            journal.is_some(),
            Arc::clone(&metrics),
        );
        if state_blob != 0 {
            pager.load_state(state_blob)?;
        }

        let core = Core {
            pager,
            journal,
            databases: HashMap::new(),
            page_size,
            max_databases,
            state_blob,
            lsn: PPageHeader::from_bytes(&probe)?.lsn(),
            read_only: opts.read_only,
            flush_when_committed: opts.flush_when_committed,
            dont_clear_log: opts.dont_clear_log,
            closed: false,
        };

        Ok(Self {
            inner: Arc::new(EnvInner {
                core: Mutex::new(core),
                metrics,
                path: Some(path.to_path_buf()),
            }),
        })
    }

    /// Creates a database under `name` (non-zero) and returns a handle.
    pub fn create_db(&self, name: u16, opts: DbOptions) -> Result<Database> {
        let mut core = self.inner.core.lock();
        core.ensure_writable()?;
        if name == 0 {
            return ErrorKind::InvalidParameter
                .raise()
                .wrap_err("database name 0 is reserved");
        }
        opts.validate(core.page_size)?;

        let header_page = core.pager.fetch(0)?;
        let slot = {
            let guard = header_page.data();
            if find_db_slot(&guard[..], core.max_databases, name)?.is_some() {
                return ErrorKind::DatabaseExists.raise();
            }
            match find_free_slot(&guard[..], core.max_databases)? {
                Some(slot) => slot,
                None => return ErrorKind::LimitsReached.raise(),
            }
        };

        let cfg = TreeConfig {
            key_type: opts.effective_key_type(),
            key_size: opts.effective_key_size(),
            rec_size: opts.record_size,
            duplicates: opts.duplicates,
            record_number: opts.record_number,
            force_records_inline: opts.force_records_inline,
            page_size: core.page_size,
            custom_compare: None,
        };

        let mut index = BtreeIndex::new(slot, 0, cfg);
        let root = index.create_root(&mut core.pager)?;

        core.pager.mark_dirty(&header_page);
        {
            let mut guard = header_page.data_mut();
            let desc = descriptor_mut(&mut guard[..], slot)?;
            desc.set_db_name(name);
            desc.set_root_address(root);
            desc.set_key_size(opts.effective_key_size());
            desc.set_key_type(opts.effective_key_type().code());
            desc.set_rec_size(opts.record_size);
            let mut flags = 0u32;
            if opts.duplicates {
                flags |= DBF_DUPLICATES;
            }
            if opts.record_number {
                flags |= DBF_RECORD_NUMBER;
            }
            if opts.force_records_inline {
                flags |= DBF_FORCE_RECORDS_INLINE;
            }
            desc.set_flags(flags);
        }
        core.commit(name)?;

        core.databases.insert(name, OpenDb { index, refs: 1 });
        Ok(Database {
            inner: Arc::clone(&self.inner),
            name,
        })
    }

    /// Opens an existing database by name.
    pub fn open_db(&self, name: u16) -> Result<Database> {
        let mut core = self.inner.core.lock();
        core.ensure_open()?;

        if let Some(db) = core.databases.get_mut(&name) {
            db.refs += 1;
            return Ok(Database {
                inner: Arc::clone(&self.inner),
                name,
            });
        }

        let header_page = core.pager.fetch(0)?;
        let (slot, root, cfg) = {
            let guard = header_page.data();
            let Some(slot) = find_db_slot(&guard[..], core.max_databases, name)? else {
                return ErrorKind::DatabaseNotFound.raise();
            };
            let desc = descriptor(&guard[..], slot)?;
            let cfg = TreeConfig {
                key_type: KeyType::from_code(desc.key_type())?,
                key_size: desc.key_size(),
                rec_size: desc.rec_size(),
                duplicates: desc.flags() & DBF_DUPLICATES != 0,
                record_number: desc.flags() & DBF_RECORD_NUMBER != 0,
                force_records_inline: desc.flags() & DBF_FORCE_RECORDS_INLINE != 0,
                page_size: core.page_size,
                custom_compare: None,
            };
            (slot, desc.root_address(), cfg)
        };

        let mut index = BtreeIndex::new(slot, root, cfg);
        index.load_recno_state(&mut core.pager)?;
        core.databases.insert(name, OpenDb { index, refs: 1 });

        Ok(Database {
            inner: Arc::clone(&self.inner),
            name,
        })
    }

    /// Deletes a database: every record blob, extended key, duplicate
    /// table and tree page is freed and the descriptor slot is zeroed.
    pub fn erase_db(&self, name: u16) -> Result<()> {
        let mut core = self.inner.core.lock();
        core.ensure_writable()?;

        if core.databases.contains_key(&name) {
            return ErrorKind::InvalidParameter
                .raise()
                .wrap_err("database is still open");
        }

        let header_page = core.pager.fetch(0)?;
        let (slot, root, cfg) = {
            let guard = header_page.data();
            let Some(slot) = find_db_slot(&guard[..], core.max_databases, name)? else {
                return ErrorKind::DatabaseNotFound.raise();
            };
            let desc = descriptor(&guard[..], slot)?;
            let cfg = TreeConfig {
                key_type: KeyType::from_code(desc.key_type())?,
                key_size: desc.key_size(),
                rec_size: desc.rec_size(),
                duplicates: desc.flags() & DBF_DUPLICATES != 0,
                record_number: desc.flags() & DBF_RECORD_NUMBER != 0,
                force_records_inline: desc.flags() & DBF_FORCE_RECORDS_INLINE != 0,
                page_size: core.page_size,
                custom_compare: None,
            };
            (slot, desc.root_address(), cfg)
        };

        let mut index = BtreeIndex::new(slot, root, cfg);
        index.release(&mut core.pager)?;

        core.pager.mark_dirty(&header_page);
        {
            let mut guard = header_page.data_mut();
            descriptor_mut(&mut guard[..], slot)?.clear();
        }
        core.commit(name)
    }

    /// Names of all databases in this environment, in slot order.
    pub fn database_names(&self) -> Result<Vec<u16>> {
        let mut core = self.inner.core.lock();
        core.ensure_open()?;
        let header_page = core.pager.fetch(0)?;
        let guard = header_page.data();
        database_names(&guard[..], core.max_databases)
    }

    /// Commits pending state and flushes the device without closing.
    pub fn flush(&self) -> Result<()> {
        let mut core = self.inner.core.lock();
        core.ensure_writable()?;
        core.commit(0)?;
        core.pager.flush_all(false)
    }

    /// Closes the environment: state blob, final flush, tail truncation,
    /// journal teardown. Dropping the last handle does the same on a
    /// best-effort basis.
    pub fn close(self) -> Result<()> {
        self.inner.core.lock().close()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.inner.metrics.snapshot()
    }

    pub fn path(&self) -> Option<&Path> {
        self.inner.path.as_deref()
    }
}

/// Handle to one logical database. Cheap to clone via `open_db`; dropped
/// handles release their reference.
pub struct Database {
    inner: Arc<EnvInner>,
    name: u16,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").field("name", &self.name).finish()
    }
}

impl Database {
    pub fn name(&self) -> u16 {
        self.name
    }

    fn with_index<R>(
        &self,
        writable: bool,
        f: impl FnOnce(&mut BtreeIndex, &mut PageManager) -> Result<R>,
    ) -> Result<R> {
        let mut core = self.inner.core.lock();
        if writable {
            core.ensure_writable()?;
        } else {
            core.ensure_open()?;
        }
        let core = &mut *core;
        let db = core
            .databases
            .get_mut(&self.name)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        f(&mut db.index, &mut core.pager)
    }

    fn commit_after<R>(
        &self,
        f: impl FnOnce(&mut BtreeIndex, &mut PageManager) -> Result<R>,
    ) -> Result<R> {
        let mut core = self.inner.core.lock();
        core.ensure_writable()?;
        let name = self.name;
        let core = &mut *core;
        let db = core
            .databases
            .get_mut(&name)
            .ok_or_else(|| eyre::Report::new(ErrorKind::DatabaseNotFound))?;
        let result = f(&mut db.index, &mut core.pager)?;
        core.commit(name)?;
        Ok(result)
    }

    fn validate_key(&self, index: &BtreeIndex, key: &[u8]) -> Result<()> {
        let cfg = index.cfg();
        let fixed = (cfg.key_size != KEY_SIZE_UNLIMITED).then_some(cfg.key_size);
        keys::validate_key(cfg.key_type, fixed, key)
    }

    /// Inserts a key/record pair. Existing keys fail with `KeyExists`
    /// unless duplicates are enabled.
    pub fn insert(&self, key: &[u8], record: &[u8]) -> Result<()> {
        self.insert_with(key, record, InsertFlags::Default)
    }

    pub fn insert_with(&self, key: &[u8], record: &[u8], flags: InsertFlags) -> Result<()> {
        self.commit_after(|index, pager| {
            if index.cfg().record_number {
                let n = keys::recno_value(key)?;
                index.observe_record_number(n);
            }
            let fixed = (index.cfg().key_size != KEY_SIZE_UNLIMITED)
                .then_some(index.cfg().key_size);
            keys::validate_key(index.cfg().key_type, fixed, key)?;
            index.insert(pager, key, record, flags)
        })
    }

    /// Record-number insert: assigns and returns the next key.
    pub fn insert_auto(&self, record: &[u8]) -> Result<u64> {
        self.commit_after(|index, pager| {
            if !index.cfg().record_number {
                return ErrorKind::InvalidParameter
                    .raise()
                    .wrap_err("auto-assigned keys need a record-number database");
            }
            let n = index.next_record_number();
            let key = keys::recno_key(n);
            index.insert(pager, &key, record, InsertFlags::Default)?;
            Ok(n)
        })
    }

    /// Looks up a key; `Ok(None)` when it does not exist.
    pub fn find(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.with_index(false, |index, pager| {
            self.validate_key(index, key)?;
            index.find(pager, key)
        })
    }

    /// Looks up duplicate `dup_idx` of a key.
    pub fn find_dup(&self, key: &[u8], dup_idx: u32) -> Result<Option<Vec<u8>>> {
        self.with_index(false, |index, pager| {
            self.validate_key(index, key)?;
            index.find_dup(pager, key, dup_idx)
        })
    }

    /// Approximate lookup; returns the matched key and its first record.
    pub fn find_approx(&self, key: &[u8], mode: MatchMode) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        self.with_index(false, |index, pager| {
            self.validate_key(index, key)?;
            index.find_approx(pager, key, mode)
        })
    }

    /// Number of records stored under a key.
    pub fn record_count(&self, key: &[u8]) -> Result<u64> {
        self.with_index(false, |index, pager| {
            self.validate_key(index, key)?;
            index.record_count(pager, key)
        })
    }

    /// Erases a key and all of its records.
    pub fn erase(&self, key: &[u8]) -> Result<()> {
        self.commit_after(|index, pager| {
            let fixed = (index.cfg().key_size != KEY_SIZE_UNLIMITED)
                .then_some(index.cfg().key_size);
            keys::validate_key(index.cfg().key_type, fixed, key)?;
            index.erase(pager, key, None)
        })
    }

    /// Erases one duplicate of a key; the last record erases the key.
    pub fn erase_dup(&self, key: &[u8], dup_idx: u32) -> Result<()> {
        self.commit_after(|index, pager| {
            let fixed = (index.cfg().key_size != KEY_SIZE_UNLIMITED)
                .then_some(index.cfg().key_size);
            keys::validate_key(index.cfg().key_type, fixed, key)?;
            index.erase(pager, key, Some(dup_idx))
        })
    }

    /// Number of keys (`distinct`) or records.
    pub fn count(&self, distinct: bool) -> Result<u64> {
        self.with_index(false, |index, pager| index.count(pager, distinct))
    }

    /// In-order scan over every record; duplicates visit in order.
    pub fn scan(&self, mut visitor: impl FnMut(&[u8], &[u8]) -> Result<()>) -> Result<()> {
        self.with_index(false, |index, pager| index.for_each(pager, &mut visitor))
    }

    /// Verifies the tree's structural invariants.
    pub fn check_integrity(&self) -> Result<()> {
        self.with_index(false, |index, pager| index.check_integrity(pager))
    }

    /// Installs the comparator for a `KeyType::Custom` database.
    pub fn set_compare(&self, compare: Arc<CompareFn>) -> Result<()> {
        self.with_index(false, |index, _| {
            index.set_compare(compare);
            Ok(())
        })
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let mut core = self.inner.core.lock();
        if let Some(db) = core.databases.get_mut(&self.name) {
            db.refs -= 1;
            if db.refs == 0 {
                core.databases.remove(&self.name);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mem_env() -> Environment {
        Environment::create("unused", EnvOptions::new().in_memory(true).page_size(4096))
            .unwrap()
    }

    #[test]
    fn create_insert_find_in_memory() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();

        db.insert(b"alpha", b"1").unwrap();
        db.insert(b"beta", b"2").unwrap();

        assert_eq!(db.find(b"alpha").unwrap().unwrap(), b"1");
        assert_eq!(db.find(b"beta").unwrap().unwrap(), b"2");
        assert_eq!(db.find(b"gamma").unwrap(), None);
    }

    #[test]
    fn duplicate_key_without_duplicates_is_key_exists() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"v1").unwrap();

        let err = db.insert(b"k", b"v2").unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyExists));

        // the original record is untouched
        assert_eq!(db.find(b"k").unwrap().unwrap(), b"v1");
    }

    #[test]
    fn overwrite_replaces_the_record() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"old").unwrap();

        db.insert_with(b"k", b"new", InsertFlags::Overwrite).unwrap();
        assert_eq!(db.find(b"k").unwrap().unwrap(), b"new");
    }

    #[test]
    fn erase_removes_and_reports_missing() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"v").unwrap();

        db.erase(b"k").unwrap();
        assert_eq!(db.find(b"k").unwrap(), None);

        let err = db.erase(b"k").unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::KeyNotFound));
    }

    #[test]
    fn create_db_rejects_reserved_name_and_dupes() {
        let env = mem_env();
        let _db = env.create_db(7, DbOptions::new()).unwrap();

        let err = env.create_db(0, DbOptions::new()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidParameter));

        let err = env.create_db(7, DbOptions::new()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::DatabaseExists));
    }

    #[test]
    fn descriptor_table_exhaustion_is_limits_reached() {
        let env = Environment::create(
            "unused",
            EnvOptions::new()
                .in_memory(true)
                .page_size(4096)
                .max_databases(2),
        )
        .unwrap();
        let _a = env.create_db(1, DbOptions::new()).unwrap();
        let _b = env.create_db(2, DbOptions::new()).unwrap();

        let err = env.create_db(3, DbOptions::new()).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::LimitsReached));
    }

    #[test]
    fn open_db_sees_existing_data() {
        let env = mem_env();
        {
            let db = env.create_db(1, DbOptions::new()).unwrap();
            db.insert(b"x", b"y").unwrap();
        }
        // handle dropped; reopen by name
        let db = env.open_db(1).unwrap();
        assert_eq!(db.find(b"x").unwrap().unwrap(), b"y");
    }

    #[test]
    fn open_missing_db_is_database_not_found() {
        let env = mem_env();
        let err = env.open_db(42).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::DatabaseNotFound));
    }

    #[test]
    fn erase_db_requires_closed_handles() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();

        let err = env.erase_db(1).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidParameter));

        drop(db);
        env.erase_db(1).unwrap();
        let err = env.open_db(1).unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::DatabaseNotFound));
    }

    #[test]
    fn database_names_lists_slot_order() {
        let env = mem_env();
        let _a = env.create_db(30, DbOptions::new()).unwrap();
        let _b = env.create_db(10, DbOptions::new()).unwrap();

        assert_eq!(env.database_names().unwrap(), vec![30, 10]);
    }

    #[test]
    fn record_number_databases_assign_keys() {
        let env = mem_env();
        let db = env
            .create_db(1, DbOptions::new().record_number(true))
            .unwrap();

        assert_eq!(db.insert_auto(b"first").unwrap(), 1);
        assert_eq!(db.insert_auto(b"second").unwrap(), 2);

        let key = keys::recno_key(1);
        assert_eq!(db.find(&key).unwrap().unwrap(), b"first");
    }

    #[test]
    fn record_number_tracks_explicit_keys() {
        let env = mem_env();
        let db = env
            .create_db(1, DbOptions::new().record_number(true))
            .unwrap();

        db.insert(&keys::recno_key(10), b"ten").unwrap();
        assert_eq!(db.insert_auto(b"next").unwrap(), 11);
    }

    #[test]
    fn insert_auto_needs_record_number() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();

        let err = db.insert_auto(b"x").unwrap_err();
        assert_eq!(ErrorKind::of(&err), Some(ErrorKind::InvalidParameter));
    }

    #[test]
    fn custom_compare_orders_the_tree() {
        let env = mem_env();
        let db = env
            .create_db(1, DbOptions::new().key_type(KeyType::Custom))
            .unwrap();
        db.set_compare(Arc::new(|a: &[u8], b: &[u8]| b.cmp(a))).unwrap();

        db.insert(b"a", b"1").unwrap();
        db.insert(b"c", b"3").unwrap();
        db.insert(b"b", b"2").unwrap();

        let mut seen = Vec::new();
        db.scan(|key, _| {
            seen.push(key.to_vec());
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![b"c".to_vec(), b"b".to_vec(), b"a".to_vec()]);
    }

    #[test]
    fn count_distinct_and_total() {
        let env = mem_env();
        let db = env
            .create_db(1, DbOptions::new().duplicates(true))
            .unwrap();
        db.insert(b"a", b"1").unwrap();
        db.insert(b"a", b"2").unwrap();
        db.insert(b"b", b"3").unwrap();

        assert_eq!(db.count(true).unwrap(), 2);
        assert_eq!(db.count(false).unwrap(), 3);
    }

    #[test]
    fn operations_after_close_fail() {
        let env = mem_env();
        let db = env.create_db(1, DbOptions::new()).unwrap();
        db.insert(b"k", b"v").unwrap();

        env.close().unwrap();
        assert!(db.find(b"k").is_err());
    }
}
