//! File-index read side (spec.md §4.5).
//!
//! Backed by a memory-mapped file so reopening a large index (millions of paths) is
//! cheap; the mapped bytes are decoded once into an owned `Vec<FileIndexEntry>` at
//! open time, since the index format here is a flat bincode-serialized vector rather
//! than a fixed-width record layout a reader could binary-search in place.

use std::path::{Path, PathBuf};

use memmap2::Mmap;

use crate::error::{Result, StoreError};
use crate::fileindex::entry::FileIndexEntry;

pub struct FileIndexReader {
    path: PathBuf,
    entries: Vec<FileIndexEntry>,
}

impl FileIndexReader {
    pub fn open(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| StoreError::io(path, e))?;
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| StoreError::io(path, e))?;
        let entries: Vec<FileIndexEntry> = bincode::deserialize(&mmap)
            .map_err(|e| StoreError::Corruption(format!("{}: {e}", path.display())))?;
        Ok(Self { path: path.to_path_buf(), entries })
    }

    pub fn from_entries(path: &Path, entries: Vec<FileIndexEntry>) -> Self {
        Self { path: path.to_path_buf(), entries }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Forward iteration: on-disk order, reverse-lexicographic, children before
    /// parent.
    pub fn iter(&self) -> impl Iterator<Item = &FileIndexEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[FileIndexEntry] {
        &self.entries
    }

    /// Path-ascending iteration (spec.md §4.5, "secondary iteration order"). Since
    /// forward order is strictly descending, this is just that sequence reversed;
    /// directory child-range pointers exist so a true mmap'd reader could recover this
    /// order without materializing the reverse, which matters for an index too large
    /// to hold as an owned `Vec` but not for the in-memory representation used here.
    pub fn iter_ascending(&self) -> impl Iterator<Item = &FileIndexEntry> {
        self.entries.iter().rev()
    }

    /// `filter(prefixes)` (spec.md §4.5): yields only entries whose path starts with
    /// one of the given prefixes.
    pub fn filter_prefixes<'a>(&'a self, prefixes: &'a [String]) -> impl Iterator<Item = &'a FileIndexEntry> {
        self.entries.iter().filter(move |e| prefixes.iter().any(|p| e.path.starts_with(p.as_str())))
    }

    /// Consistency check (spec.md §4.5): forward iteration terminates at `/`; path
    /// order is strictly descending; every `children_ofs` points to a valid,
    /// internally-sorted range; HASHVALID entries carry a non-zero hash and mode.
    pub fn check(&self) -> Result<()> {
        if self.entries.last().map(|e| e.path.as_str()) != Some("/") {
            return Err(StoreError::Corruption("file index does not terminate at /".into()));
        }

        for w in self.entries.windows(2) {
            if w[0].path <= w[1].path {
                return Err(StoreError::Corruption(format!(
                    "file index order violation: {} before {}",
                    w[0].path, w[1].path
                )));
            }
        }

        for (i, e) in self.entries.iter().enumerate() {
            if e.is_dir() {
                let start = e.children_offset as usize;
                let count = e.children_count as usize;
                if count > 0 && (start >= i || start + count > i) {
                    return Err(StoreError::Corruption(format!(
                        "file index: {} has an invalid child range", e.path
                    )));
                }
            }
            if e.hash_valid() && (e.hash == shared::ZERO_HASH || e.stat.mode == 0) {
                return Err(StoreError::Corruption(format!(
                    "file index: {} is HASHVALID with a zero hash or mode", e.path
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileindex::entry::{EntryFlags, Stat};

    fn stat() -> Stat {
        Stat { dev: 1, ino: 1, mode: 0o100644, uid: 0, gid: 0, size: 1, atime_ns: 0, mtime_ns: 0, ctime_ns: 0 }
    }

    fn entry(path: &str, flags: EntryFlags, hash: shared::Hash) -> FileIndexEntry {
        FileIndexEntry {
            path: path.to_string(),
            stat: stat(),
            children_offset: 0,
            children_count: 0,
            hash,
            flags,
            meta_offset: 0,
            nlink: 1,
        }
    }

    #[test]
    fn check_rejects_missing_root_sentinel() {
        let reader = FileIndexReader::from_entries(
            Path::new("x"),
            vec![entry("/a", EntryFlags::empty(), shared::ZERO_HASH)],
        );
        assert!(reader.check().is_err());
    }

    #[test]
    fn check_accepts_well_formed_index() {
        let entries = vec![
            entry("/a/c", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
            entry("/a/b", EntryFlags::HASHVALID, [2u8; shared::HASH_SIZE]),
            entry("/", EntryFlags::empty(), shared::ZERO_HASH),
        ];
        let reader = FileIndexReader::from_entries(Path::new("x"), entries);
        assert!(reader.check().is_ok());
    }

    #[test]
    fn check_rejects_order_violation() {
        let entries = vec![
            entry("/a/b", EntryFlags::empty(), shared::ZERO_HASH),
            entry("/a/c", EntryFlags::empty(), shared::ZERO_HASH),
            entry("/", EntryFlags::empty(), shared::ZERO_HASH),
        ];
        let reader = FileIndexReader::from_entries(Path::new("x"), entries);
        assert!(reader.check().is_err());
    }
}
