//! C7: the metadata store (spec.md §4.6).
//!
//! An append-only side file opened alongside the file index. `store` appends a
//! serialized [`MetaRecord`] and returns its byte offset; `read` seeks and decodes.
//! Offsets are stable across index merges because the store is never rewritten, only
//! extended.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

/// Variable-length record of everything the file-index entry's fixed fields don't
/// carry (spec.md §3, "Metadata record").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRecord {
    pub owner: String,
    pub group: String,
    pub full_mode: u32,
    pub rdev: u64,
    pub symlink_target: Option<String>,
    pub xattrs: Vec<(String, Vec<u8>)>,
    pub acls: Vec<u8>,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

impl MetaRecord {
    /// Records written along the indexing path have `atime`/`mtime`/`ctime` zeroed
    /// (spec.md §4.6): they're already captured in the file-index entry's stat and
    /// vary too much to be worth duplicating. Records attached to backed-up tree
    /// entries (a full snapshot of a path, not just an index scan) keep them.
    pub fn zero_times_for_index(mut self) -> Self {
        self.atime_ns = 0;
        self.mtime_ns = 0;
        self.ctime_ns = 0;
        self
    }
}

pub struct MetaStore {
    path: PathBuf,
    file: File,
}

impl MetaStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        Ok(Self { path: path.to_path_buf(), file })
    }

    /// `store(meta_record) -> u64 offset` (spec.md §4.6).
    pub fn store(&mut self, record: &MetaRecord) -> Result<u64> {
        let bytes = bincode::serialize(record)
            .map_err(|e| StoreError::Corruption(format!("metadata record serialization failed: {e}")))?;
        let offset = self.file.seek(SeekFrom::End(0)).map_err(|e| StoreError::io(&self.path, e))?;
        self.file
            .write_all(&(bytes.len() as u32).to_le_bytes())
            .map_err(|e| StoreError::io(&self.path, e))?;
        self.file.write_all(&bytes).map_err(|e| StoreError::io(&self.path, e))?;
        Ok(offset)
    }

    /// `read(offset) -> meta_record` (spec.md §4.6).
    pub fn read(&mut self, offset: u64) -> Result<MetaRecord> {
        self.file.seek(SeekFrom::Start(offset)).map_err(|e| StoreError::io(&self.path, e))?;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf).map_err(|e| StoreError::io(&self.path, e))?;
        let len = u32::from_le_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        self.file.read_exact(&mut buf).map_err(|e| StoreError::io(&self.path, e))?;
        bincode::deserialize(&buf)
            .map_err(|e| StoreError::Corruption(format!("{}: {e}", self.path.display())))
    }

    /// Removes the metadata side file, as part of `clear_index` (supplemented
    /// feature, grounded in `index-cmd.py`'s `clear_index`).
    pub fn clear(path: &Path) -> Result<()> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> MetaRecord {
        MetaRecord {
            owner: "alice".into(),
            group: "staff".into(),
            full_mode: 0o100644,
            rdev: 0,
            symlink_target: None,
            xattrs: vec![],
            acls: vec![],
            atime_ns: 1,
            mtime_ns: 2,
            ctime_ns: 3,
        }
    }

    #[test]
    fn store_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex.meta");
        let mut store = MetaStore::open(&path).unwrap();

        let off1 = store.store(&record()).unwrap();
        let mut other = record();
        other.owner = "bob".into();
        let off2 = store.store(&other).unwrap();

        assert_ne!(off1, off2);
        assert_eq!(store.read(off1).unwrap(), record());
        assert_eq!(store.read(off2).unwrap(), other);
    }

    #[test]
    fn zero_times_for_index_clears_variable_fields() {
        let r = record().zero_times_for_index();
        assert_eq!((r.atime_ns, r.mtime_ns, r.ctime_ns), (0, 0, 0));
    }

    #[test]
    fn offsets_remain_valid_after_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bupindex.meta");
        let off = {
            let mut store = MetaStore::open(&path).unwrap();
            store.store(&record()).unwrap()
        };

        let mut reopened = MetaStore::open(&path).unwrap();
        assert_eq!(reopened.read(off).unwrap(), record());
    }
}
