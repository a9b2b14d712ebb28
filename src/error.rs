//! # Error Kinds
//!
//! Fallible operations return `eyre::Result`. Failures that callers need to
//! distinguish programmatically carry an [`ErrorKind`] as the root cause of
//! the report; everything else (I/O failures, corrupt structures) is wrapped
//! with context strings via `WrapErr`.
//!
//! ```ignore
//! match db.erase(b"missing") {
//!     Err(e) if ErrorKind::of(&e) == Some(ErrorKind::KeyNotFound) => { /* fine */ }
//!     other => other?,
//! }
//! ```
//!
//! Lookup misses are not errors: `find` returns `Ok(None)`. `ErrorKind` is
//! reserved for cases where the operation itself cannot proceed.

use eyre::{Report, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ErrorKind {
    /// Bad flags or parameters; no state was changed.
    #[error("invalid parameter")]
    InvalidParameter,

    /// The key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// The key already exists and neither overwrite nor duplicates apply.
    #[error("key already exists")]
    KeyExists,

    /// A duplicate record operation was rejected.
    #[error("duplicate key")]
    DuplicateKey,

    /// The descriptor table (or another fixed table) is full.
    #[error("limits reached")]
    LimitsReached,

    /// Mutation attempted on a read-only environment.
    #[error("write protected")]
    WriteProtected,

    /// The file does not start with a valid environment header.
    #[error("invalid file header")]
    InvalidFileHeader,

    /// The file version is older than the minimum supported version.
    #[error("invalid file version")]
    InvalidFileVersion,

    /// An on-disk structure is self-inconsistent.
    #[error("integrity violated")]
    IntegrityViolated,

    /// The journal is non-empty and auto-recovery was not requested.
    #[error("recovery required")]
    NeedRecovery,

    /// Device failure; fatal to the environment.
    #[error("i/o error")]
    IoError,

    /// A reserved feature (compression) was requested.
    #[error("not implemented")]
    NotImplemented,

    /// No database with the given name exists in this environment.
    #[error("database not found")]
    DatabaseNotFound,

    /// A database with the given name already exists.
    #[error("database already exists")]
    DatabaseExists,
}

impl ErrorKind {
    /// Extracts the kind from a report, looking through wrapped context.
    pub fn of(report: &Report) -> Option<ErrorKind> {
        report.downcast_ref::<ErrorKind>().copied()
    }

    /// Builds a failed `Result` rooted in this kind.
    pub fn raise<T>(self) -> Result<T> {
        Err(Report::new(self))
    }
}
