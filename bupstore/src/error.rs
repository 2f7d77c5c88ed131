//! Error kinds shared across the store (spec.md §7).
//!
//! Each layer below generally has its own narrower error type (`PackError`,
//! `FileIndexError`, `ProtocolError`, ...), which `From`-converts into this one at the
//! boundary a caller actually cares about distinguishing kinds at (the `Repository`
//! trait, the server dispatch loop). We never swallow an I/O or parsing error; the
//! richest context we have at the point of failure is attached via the variant's
//! fields, not discarded.

use std::path::PathBuf;

use shared::Hash;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// idx/pack trailer mismatch, file-index order violation, stale midx, etc.
    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    /// Compare-and-set failure on a ref update.
    #[error("ref {name} compare-and-set failed: expected {expected:?}, found {found:?}")]
    RefConflict {
        name: String,
        expected: Hash,
        found: Option<Hash>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("usage error: {0}")]
    Usage(String),
}

impl StoreError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io { path: path.into(), source }
    }

    /// Exit-code mapping for the embedded CLI surface (spec.md §6): 0 success, 1 any
    /// surfaced error, 2 usage error. Only `Usage` maps to 2; everything else is 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            StoreError::Usage(_) => 2,
            _ => 1,
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
