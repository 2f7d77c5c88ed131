//! C6: the file index (spec.md §4.5).

pub mod entry;
pub mod graft;
pub mod merge;
pub mod reader;
pub mod writer;

pub use entry::{EntryFlags, FileIndexEntry, Stat};
pub use graft::GraftRule;
pub use reader::FileIndexReader;
pub use writer::{FileIndexOptions, FileIndexWriter, HashGen};

use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::hlinkdb::HardLinkDb;

/// Ties together the on-disk index, its metadata side file, and its hard-link DB under
/// one set of sibling paths (`bupindex`, `bupindex.meta`, `bupindex.hlink` by default,
/// spec.md §6).
pub struct FileIndex {
    index_path: PathBuf,
}

impl FileIndex {
    pub fn new(index_path: PathBuf) -> Self {
        Self { index_path }
    }

    pub fn meta_path(&self) -> PathBuf {
        self.index_path.with_extension("meta")
    }

    pub fn hlink_path(&self) -> PathBuf {
        self.index_path.with_extension("hlink")
    }

    pub fn open_reader(&self) -> Result<FileIndexReader> {
        FileIndexReader::open(&self.index_path)
    }

    /// Supplemented `clear` maintenance operation (grounded in `index-cmd.py`'s
    /// `clear_index`): unlinks the index plus its `.meta` and `.hlink` companions.
    pub fn clear(&self) -> Result<()> {
        for path in [&self.index_path, &self.meta_path(), &self.hlink_path()] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io(path, e)),
            }
        }
        Ok(())
    }

    /// Supplemented `regraft` maintenance operation (grounded in `index-cmd.py`'s
    /// `regraft_index`): rewrites every entry's grafted path under a new rule set
    /// without rehashing.
    ///
    /// Resolves Open Question 1 (spec.md §9): for every non-directory entry whose
    /// `nlink > 1`, this stats the real (ungrafted) path *before* touching the
    /// hard-link DB, then updates the DB, then rewrites the entry's path — in that
    /// order. The source this is grounded on reads `pst.st_mode`/`pst.st_nlink` before
    /// the `lstat` call that assigns `pst` actually runs; fetching the real stat first
    /// is the only order that makes the later hard-link bookkeeping meaningful.
    pub fn regraft<F>(
        &self,
        old_rules: &[GraftRule],
        new_rules: &[GraftRule],
        mut stat_real_path: F,
    ) -> Result<()>
    where
        F: FnMut(&str) -> Result<Option<(u64, u64, u32)>>, // (dev, ino, nlink), None if gone
    {
        let reader = self.open_reader()?;
        let mut hlinks = HardLinkDb::load(&self.hlink_path())?;

        let mut rewritten: Vec<FileIndexEntry> = Vec::with_capacity(reader.len());
        for entry in reader.iter() {
            if entry.path == "/" {
                rewritten.push(entry.clone());
                continue;
            }

            let real_path = graft::ungraftpath(old_rules, &entry.path);
            let mut new_entry = entry.clone();

            if !entry.is_dir() {
                // 1. Stat the real path first.
                let real_stat = stat_real_path(&real_path)?;
                // 2. Update the hard-link DB before the entry itself changes.
                if let Some((dev, ino, nlink)) = real_stat {
                    if nlink > 1 {
                        hlinks.del_path(&entry.path);
                        let new_path = graft::graftpath(new_rules, &real_path);
                        hlinks.add_path(&new_path, dev, ino);
                    }
                } else {
                    hlinks.del_path(&entry.path);
                }
            }

            // 3. Only now rewrite the entry's own path.
            new_entry.path = graft::graftpath(new_rules, &real_path);
            rewritten.push(new_entry);
        }

        rewritten.sort_by(|a, b| b.path.cmp(&a.path));
        writer::persist_entries(&self.index_path, &rewritten)?;
        hlinks.commit_save(&self.hlink_path())?;
        Ok(())
    }
}
