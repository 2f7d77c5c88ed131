//! C8: the hard-link DB (spec.md §4.7).
//!
//! Maps `(dev, ino) ↔ paths`. In-memory during a run; serialized to `<index>.hlink` on
//! `commit_save()`. The indexer is responsible for the ordering invariant (spec.md
//! §4.7): whenever a non-directory entry with `nlink > 1` transitions between existing
//! and deleted, or moves between grafts, the DB is updated *before* the corresponding
//! file-index entry is emitted — see [`crate::fileindex::FileIndex::regraft`], which
//! resolves Open Question 1 this way.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DevIno {
    pub dev: u64,
    pub ino: u64,
}

#[derive(Default, Serialize, Deserialize)]
pub struct HardLinkDb {
    by_node: HashMap<DevIno, HashSet<String>>,
}

impl HardLinkDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_path(&mut self, path: &str, dev: u64, ino: u64) {
        self.by_node.entry(DevIno { dev, ino }).or_default().insert(path.to_string());
    }

    pub fn del_path(&mut self, path: &str) {
        self.by_node.retain(|_, paths| {
            paths.remove(path);
            !paths.is_empty()
        });
    }

    pub fn node_paths(&self, dev: u64, ino: u64) -> Vec<String> {
        self.by_node
            .get(&DevIno { dev, ino })
            .map(|paths| {
                let mut v: Vec<String> = paths.iter().cloned().collect();
                v.sort();
                v
            })
            .unwrap_or_default()
    }

    /// Persists the in-memory table to `<index>.hlink` (spec.md §4.7, `commit_save`).
    pub fn commit_save(&self, hlink_path: &Path) -> Result<()> {
        let bytes = bincode::serialize(self)
            .map_err(|e| StoreError::Corruption(format!("hard-link DB serialization failed: {e}")))?;
        let dir = hlink_path.parent().unwrap_or_else(|| Path::new("."));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        std::fs::write(tmp.path(), &bytes).map_err(|e| StoreError::io(dir, e))?;
        tmp.persist(hlink_path).map_err(|e| StoreError::io(hlink_path, e.error))?;
        Ok(())
    }

    pub fn load(hlink_path: &Path) -> Result<Self> {
        if !hlink_path.exists() {
            return Ok(Self::new());
        }
        let bytes = std::fs::read(hlink_path).map_err(|e| StoreError::io(hlink_path, e))?;
        bincode::deserialize(&bytes)
            .map_err(|e| StoreError::Corruption(format!("{}: {e}", hlink_path.display())))
    }
}
