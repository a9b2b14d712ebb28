//! # Coffer - Embedded Transactional Key/Value Store
//!
//! Coffer is an embedded, ordered key/value store backed by a single
//! paged file (or an in-memory arena). Multiple logical databases share
//! one file; each database is an ordered mapping from a typed key to a
//! record, optionally with duplicate records per key. Durability comes
//! from a write-ahead journal replayed at open.
//!
//! ## Quick Start
//!
//! ```ignore
//! use coffer::{DbOptions, EnvOptions, Environment};
//!
//! let env = Environment::create("data.cfr", EnvOptions::new().page_size(4096))?;
//! let db = env.create_db(1, DbOptions::new())?;
//!
//! db.insert(b"hello", b"world")?;
//! assert_eq!(db.find(b"hello")?, Some(b"world".to_vec()));
//!
//! env.close()?;
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │   Environment / Database handles    │
//! ├─────────────────────────────────────┤
//! │  B+tree (PAX / default layouts)     │
//! ├──────────────────┬──────────────────┤
//! │   Blob manager   │     Journal      │
//! ├──────────────────┴──────────────────┤
//! │  Page manager (cache / freelist /   │
//! │  changeset)                         │
//! ├─────────────────────────────────────┤
//! │  Device (mmap / file / in-memory)   │
//! └─────────────────────────────────────┘
//! ```
//!
//! ## File Layout
//!
//! ```text
//! data.cfr          # paged data file; page 0 holds the environment
//!                   # header and the per-database descriptor table
//! data.cfr.jrn0     # write-ahead journal, rotated pair
//! data.cfr.jrn1
//! ```
//!
//! ## Module Overview
//!
//! - [`env`]: environment mount, database lifecycle, commit ordering
//! - [`btree`]: node layouts, split/merge, duplicates, extended keys
//! - [`pager`]: page cache, freelist, per-operation changeset
//! - [`journal`]: write-ahead log and crash recovery
//! - [`blob`]: variable-sized payloads addressed by blob id
//! - [`device`]: mmap, positioned-I/O and in-memory byte stores

pub mod blob;
pub mod btree;
pub mod config;
pub mod device;
pub mod env;
pub mod error;
pub mod journal;
pub mod keys;
pub mod metrics;
pub mod page;
pub mod pager;

pub use btree::{InsertFlags, MatchMode};
pub use config::{DbOptions, EnvOptions};
pub use env::{Database, Environment};
pub use error::ErrorKind;
pub use keys::KeyType;
pub use metrics::MetricsSnapshot;

/// Crate-wide result alias; failures carry an [`ErrorKind`] when callers
/// need to tell them apart.
pub type Result<T> = eyre::Result<T>;
