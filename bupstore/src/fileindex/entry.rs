//! The file-index entry record (spec.md §3, "File-index entry").

use serde::{Deserialize, Serialize};

use shared::Hash;

bitflags::bitflags! {
    /// Per-entry flags (spec.md §3). `Serialize`/`Deserialize` come from bitflags'
    /// `serde` feature rather than a derive here.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryFlags: u8 {
        /// The stored hash still matches the entry's current stat.
        const HASHVALID   = 0b001;
        /// The path no longer exists on disk as of the last indexing run.
        const DELETED     = 0b010;
        /// The hash was never computed; a sentinel stands in for it (supplemented
        /// "fake-valid hashing" feature, grounded in `index-cmd.py`'s `hashgen`
        /// override).
        const FAKE_INVALID = 0b100;
    }
}

/// The subset of `stat(2)` fields that participate in the HASHVALID comparison
/// (spec.md §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stat {
    pub dev: u64,
    pub ino: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub atime_ns: i64,
    pub mtime_ns: i64,
    pub ctime_ns: i64,
}

impl Stat {
    /// Whether `self` still matches a hash recorded against `other`, per the HASHVALID
    /// discipline (spec.md §4.5): size, mtime, ctime, mode, and (unless
    /// `check_device` was disabled when hashing) dev must all be unchanged.
    pub fn matches_for_hash_validity(&self, other: &Stat, check_device: bool) -> bool {
        self.size == other.size
            && self.mtime_ns == other.mtime_ns
            && self.ctime_ns == other.ctime_ns
            && self.mode == other.mode
            && (!check_device || self.dev == other.dev)
    }
}

/// One path's record in the file index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileIndexEntry {
    /// Full path. Directories are stored with a trailing `/` so reverse-lexicographic
    /// order naturally visits every descendant before its parent.
    pub path: String,
    pub stat: Stat,
    /// For directories: the index (in the on-disk/iteration order) of the first child
    /// entry, and how many contiguous entries belong to this directory.
    pub children_offset: u64,
    pub children_count: u32,
    pub hash: Hash,
    pub flags: EntryFlags,
    /// Opaque handle into the metadata store (C7): the byte offset of this path's
    /// metadata record.
    pub meta_offset: u64,
    pub nlink: u32,
}

impl FileIndexEntry {
    pub fn is_dir(&self) -> bool {
        self.path.ends_with('/')
    }

    pub fn hash_valid(&self) -> bool {
        self.flags.contains(EntryFlags::HASHVALID)
    }

    pub fn deleted(&self) -> bool {
        self.flags.contains(EntryFlags::DELETED)
    }
}

/// Reverse-lexicographic comparison used throughout the file index: children (which
/// sort after their parent's name plus a separator under normal string order) must
/// come *before* their parent once reversed, so a directory's children-before-parent
/// invariant holds under plain descending order.
pub fn cmp_reverse_lexicographic(a: &str, b: &str) -> std::cmp::Ordering {
    b.cmp(a)
}
