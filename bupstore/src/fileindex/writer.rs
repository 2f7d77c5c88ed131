//! File-index write side (spec.md §4.5).

use std::path::Path;

use shared::Hash;

use crate::error::{Result, StoreError};
use crate::fileindex::entry::{cmp_reverse_lexicographic, EntryFlags, FileIndexEntry, Stat};

/// Options governing how a writer decides whether a recorded hash is still valid
/// (supplemented feature: `--check-device`, grounded in `index-cmd.py`'s
/// `check_device` option).
#[derive(Debug, Clone, Copy)]
pub struct FileIndexOptions {
    pub check_device: bool,
}

impl Default for FileIndexOptions {
    fn default() -> Self {
        Self { check_device: true }
    }
}

/// A hash-generation override: given a path, returns a `(size-ish tag, hash)` pair
/// without reading file content (spec.md §4.5's `hashgen?` parameter; supplemented
/// "fake-valid hashing" feature).
pub type HashGen<'a> = dyn Fn(&Path) -> (u32, Hash) + 'a;

pub struct FileIndexWriter<'a> {
    options: FileIndexOptions,
    entries: Vec<FileIndexEntry>,
    hashgen: Option<&'a HashGen<'a>>,
    last_path: Option<String>,
}

impl<'a> FileIndexWriter<'a> {
    pub fn new(options: FileIndexOptions) -> Self {
        Self { options, entries: Vec::new(), hashgen: None, last_path: None }
    }

    pub fn with_hashgen(mut self, hashgen: &'a HashGen<'a>) -> Self {
        self.hashgen = Some(hashgen);
        self
    }

    /// `add(path, stat, meta_offset, hashgen?)` (spec.md §4.5). Paths must arrive in
    /// ascending order; `hash` is `None` when the caller wants the fake-valid path
    /// (the writer's own `hashgen`, if set, supplies the sentinel instead).
    pub fn add(
        &mut self,
        path: &Path,
        stat: Stat,
        meta_offset: u64,
        hash: Option<Hash>,
        nlink: u32,
    ) -> Result<()> {
        let path_str = normalize_path(path, stat.mode);

        if let Some(last) = &self.last_path {
            if path_str.as_str() <= last.as_str() {
                return Err(StoreError::Usage(format!(
                    "file index entries must be added in ascending order: {path_str} after {last}"
                )));
            }
        }
        self.last_path = Some(path_str.clone());

        let (hash, flags) = match (hash, self.hashgen) {
            (Some(h), _) => (h, EntryFlags::HASHVALID),
            (None, Some(gen)) => {
                let (_, h) = gen(path);
                (h, EntryFlags::FAKE_INVALID)
            }
            (None, None) => (shared::ZERO_HASH, EntryFlags::empty()),
        };

        self.entries.push(FileIndexEntry {
            path: path_str,
            stat,
            children_offset: 0,
            children_count: 0,
            hash,
            flags,
            meta_offset,
            nlink,
        });
        Ok(())
    }

    /// `close()` (spec.md §4.5): reverses into the final reverse-lexicographic order,
    /// fills in directory child ranges, appends the `/` sentinel, and persists the
    /// result atomically under `path`.
    pub fn close(mut self, path: &Path) -> Result<Vec<FileIndexEntry>> {
        self.entries.sort_by(|a, b| cmp_reverse_lexicographic(&a.path, &b.path));

        if self.entries.last().map(|e| e.path.as_str()) != Some("/") {
            self.entries.push(FileIndexEntry {
                path: "/".to_string(),
                stat: Stat {
                    dev: 0,
                    ino: 0,
                    mode: 0o40755,
                    uid: 0,
                    gid: 0,
                    size: 0,
                    atime_ns: 0,
                    mtime_ns: 0,
                    ctime_ns: 0,
                },
                children_offset: 0,
                children_count: 0,
                hash: shared::ZERO_HASH,
                flags: EntryFlags::empty(),
                meta_offset: 0,
                nlink: 1,
            });
        }

        fill_child_ranges(&mut self.entries);
        persist_entries(path, &self.entries)?;
        Ok(self.entries)
    }
}

/// Directories are stored with a trailing `/` so descending order visits descendants
/// before their parent (spec.md §3).
fn normalize_path(path: &Path, mode: u32) -> String {
    let mut s = path.to_string_lossy().into_owned();
    let is_dir = mode & 0o170000 == 0o040000;
    if is_dir && !s.ends_with('/') {
        s.push('/');
    }
    s
}

/// For every directory entry, finds the contiguous block of entries immediately
/// preceding it (in the final descending order) whose path is nested under it, and
/// records that block as its child range.
pub(crate) fn fill_child_ranges(entries: &mut [FileIndexEntry]) {
    for i in 0..entries.len() {
        if !entries[i].is_dir() {
            continue;
        }
        let prefix = entries[i].path.clone();
        let mut j = i;
        while j > 0 && entries[j - 1].path.starts_with(prefix.as_str()) {
            j -= 1;
        }
        entries[i].children_offset = j as u64;
        entries[i].children_count = (i - j) as u32;
    }
}

pub(crate) fn persist_entries(path: &Path, entries: &[FileIndexEntry]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
    let bytes = bincode::serialize(entries)
        .map_err(|e| StoreError::Corruption(format!("file index serialization failed: {e}")))?;

    let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
    std::fs::write(tmp.path(), &bytes).map_err(|e| StoreError::io(dir, e))?;
    tmp.persist(path).map_err(|e| StoreError::io(path, e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(size: u64) -> Stat {
        Stat { dev: 1, ino: 1, mode: 0o100644, uid: 0, gid: 0, size, atime_ns: 0, mtime_ns: 0, ctime_ns: 0 }
    }

    fn dir_stat() -> Stat {
        Stat { dev: 1, ino: 2, mode: 0o040755, uid: 0, gid: 0, size: 0, atime_ns: 0, mtime_ns: 0, ctime_ns: 0 }
    }

    #[test]
    fn close_sorts_descending_and_adds_root() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FileIndexWriter::new(FileIndexOptions::default());
        w.add(Path::new("/a"), dir_stat(), 0, None, 1).unwrap();
        w.add(Path::new("/a/b"), stat(1), 1, Some([1u8; shared::HASH_SIZE]), 1).unwrap();
        w.add(Path::new("/a/c"), stat(2), 2, Some([2u8; shared::HASH_SIZE]), 1).unwrap();

        let entries = w.close(&dir.path().join("index")).unwrap();
        let paths: Vec<&str> = entries.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a/c", "/a/b", "/a/", "/"]);
    }

    #[test]
    fn directory_child_range_covers_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let mut w = FileIndexWriter::new(FileIndexOptions::default());
        w.add(Path::new("/a"), dir_stat(), 0, None, 1).unwrap();
        w.add(Path::new("/a/b"), stat(1), 1, Some([1u8; shared::HASH_SIZE]), 1).unwrap();
        w.add(Path::new("/a/c"), stat(2), 2, Some([2u8; shared::HASH_SIZE]), 1).unwrap();

        let entries = w.close(&dir.path().join("index")).unwrap();
        let a_dir = entries.iter().find(|e| e.path == "/a/").unwrap();
        assert_eq!(a_dir.children_count, 2);
    }

    #[test]
    fn rejects_out_of_order_adds() {
        let mut w = FileIndexWriter::new(FileIndexOptions::default());
        w.add(Path::new("/b"), stat(1), 0, Some([0u8; shared::HASH_SIZE]), 1).unwrap();
        let err = w.add(Path::new("/a"), stat(1), 0, Some([0u8; shared::HASH_SIZE]), 1);
        assert!(err.is_err());
    }
}
