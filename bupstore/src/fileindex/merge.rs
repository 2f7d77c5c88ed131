//! File-index merge (spec.md §4.5, "Merge").
//!
//! Given an existing reader `R` (the previous run's index) and a fresh delta `W` (this
//! run's walk, in ascending-add order before `W` itself is closed), performs a sorted
//! union keyed by path: only-in-R paths are carried over as DELETED *only if the walker
//! actually re-examined that part of the tree this run*, only-in-W paths are new, and
//! paths in both keep W's fresh stat/metadata but preserve R's HASHVALID bit and hash
//! when the stat is unchanged.
//!
//! spec.md §4.5 is explicit that "only in R" means the walker marked it so, not bare
//! absence from `W`: a delta that never walked a subtree at all (because the caller
//! only asked to re-index one prefix, or `W` is empty) must leave every path outside
//! that scope untouched, or `merge(R, ∅) ≡ R` (spec.md §8) would be false for any
//! non-empty `R`.

use crate::fileindex::entry::{EntryFlags, FileIndexEntry};
use crate::fileindex::reader::FileIndexReader;

/// Whether `path` falls under a prefix the walker actually traversed this run. An
/// empty `walked_prefixes` means nothing was walked (e.g. an empty delta), so nothing
/// can be inferred deleted. A non-empty prefix list is matched by `starts_with`, the
/// same convention `FileIndexReader`'s `filter(prefixes)` iterator uses (spec.md §4.5,
/// "Read side").
fn in_walked_scope(path: &str, walked_prefixes: &[String]) -> bool {
    walked_prefixes.iter().any(|prefix| path.starts_with(prefix.as_str()))
}

/// `merge(R, W) -> entries` (spec.md §4.5). `walked_prefixes` is the set of root paths
/// the walk that produced `W` actually covered this run — only paths under one of
/// these prefixes may be inferred DELETED when absent from `W`; everything else in `R`
/// is carried forward unchanged. `check_device` governs whether `dev` is part of the
/// stat-equality check used to preserve HASHVALID.
pub fn merge(
    old: &FileIndexReader,
    fresh_ascending: &[FileIndexEntry],
    walked_prefixes: &[String],
    check_device: bool,
) -> Vec<FileIndexEntry> {
    let mut old_by_path: std::collections::HashMap<&str, &FileIndexEntry> =
        std::collections::HashMap::new();
    for e in old.iter() {
        if e.path != "/" {
            old_by_path.insert(e.path.as_str(), e);
        }
    }

    let mut fresh_by_path: std::collections::HashSet<&str> =
        std::collections::HashSet::new();
    for e in fresh_ascending {
        if e.path != "/" {
            fresh_by_path.insert(e.path.as_str());
        }
    }

    let mut result: Vec<FileIndexEntry> = Vec::new();

    // Entries present in the fresh walk: either genuinely new, or carried forward from
    // the old index with HASHVALID preserved if the stat hasn't changed.
    for fresh in fresh_ascending {
        if fresh.path == "/" {
            continue;
        }
        match old_by_path.get(fresh.path.as_str()) {
            Some(prev) => {
                let mut merged = fresh.clone();
                if prev.hash_valid()
                    && fresh.stat.matches_for_hash_validity(&prev.stat, check_device)
                {
                    merged.hash = prev.hash;
                    merged.flags.insert(EntryFlags::HASHVALID);
                    merged.meta_offset = prev.meta_offset;
                }
                result.push(merged);
            }
            None => result.push(fresh.clone()),
        }
    }

    // Entries only in the old index: if the walker actually covered this path this
    // run and still didn't observe it, it's genuinely gone and gets marked DELETED.
    // If the walk never touched this part of the tree at all, the old entry carries
    // forward exactly as it was — absence from `W` alone never implies deletion.
    for (path, prev) in &old_by_path {
        if !fresh_by_path.contains(path) {
            if in_walked_scope(path, walked_prefixes) {
                let mut deleted = (*prev).clone();
                deleted.flags.insert(EntryFlags::DELETED);
                result.push(deleted);
            } else {
                result.push((*prev).clone());
            }
        }
    }

    result.sort_by(|a, b| b.path.cmp(&a.path));
    result.push(FileIndexEntry {
        path: "/".to_string(),
        stat: old
            .iter()
            .find(|e| e.path == "/")
            .map(|e| e.stat)
            .unwrap_or(crate::fileindex::entry::Stat {
                dev: 0,
                ino: 0,
                mode: 0o40755,
                uid: 0,
                gid: 0,
                size: 0,
                atime_ns: 0,
                mtime_ns: 0,
                ctime_ns: 0,
            }),
        children_offset: 0,
        children_count: 0,
        hash: shared::ZERO_HASH,
        flags: EntryFlags::empty(),
        meta_offset: 0,
        nlink: 1,
    });

    // Directory child-range pointers are positional in the final array; carrying
    // forward old entries or leaving fresh ones at their pre-close zero placeholders
    // would leave every directory's range pointing at the wrong slice once the two
    // sides are interleaved, so these are recomputed from scratch over the merged
    // order (root included) rather than reused from either side.
    crate::fileindex::writer::fill_child_ranges(&mut result);

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fileindex::entry::Stat;

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
    fn deletion_scenario() {
        // Old index: /a/ (dir), /a/b, /a/c all HASHVALID.
        let old = FileIndexReader::from_entries(
            std::path::Path::new("old"),
            vec![
                entry("/a/c", EntryFlags::HASHVALID, [2u8; shared::HASH_SIZE]),
                entry("/a/b", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
                entry("/a/", EntryFlags::HASHVALID, [3u8; shared::HASH_SIZE]),
                entry("/", EntryFlags::empty(), shared::ZERO_HASH),
            ],
        );

        // Fresh walk no longer observed /a/b: it was deleted on disk.
        let fresh = vec![
            entry("/a/c", EntryFlags::HASHVALID, [2u8; shared::HASH_SIZE]),
            entry("/a/", EntryFlags::HASHVALID, [3u8; shared::HASH_SIZE]),
        ];

        // The walk covered "/a/", so an entry missing from the delta under that
        // prefix is genuinely gone rather than merely unwalked.
        let merged = merge(&old, &fresh, &["/a/".to_string()], true);
        let paths: Vec<&str> = merged.iter().map(|e| e.path.as_str()).collect();
        assert_eq!(paths, vec!["/a/c", "/a/b", "/a/", "/"]);

        let b = merged.iter().find(|e| e.path == "/a/b").unwrap();
        assert!(b.deleted());
        let c = merged.iter().find(|e| e.path == "/a/c").unwrap();
        assert!(!c.deleted());
        assert!(c.hash_valid());
    }

    #[test]
    fn merge_with_empty_delta_and_no_walked_scope_is_true_identity() {
        // spec.md §8: merge(R, ∅) ≡ R. An empty delta with no walked prefixes means
        // nothing was re-examined this run, so every old entry must survive untouched,
        // not get flagged DELETED just because it's absent from an empty `W`.
        let old = FileIndexReader::from_entries(
            std::path::Path::new("old"),
            vec![
                entry("/a", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
                entry("/", EntryFlags::empty(), shared::ZERO_HASH),
            ],
        );
        let merged = merge(&old, &[], &[], true);
        let a = merged.iter().find(|e| e.path == "/a").unwrap();
        assert!(!a.deleted());
        assert!(a.hash_valid());
        assert_eq!(a.hash, [1u8; shared::HASH_SIZE]);
    }

    #[test]
    fn absence_outside_walked_scope_is_not_deletion() {
        // Old index spans two unrelated trees, "/a/..." and "/b/...". A run that only
        // re-walks "/a/" must leave "/b/..." alone even though it's absent from `W`.
        let old = FileIndexReader::from_entries(
            std::path::Path::new("old"),
            vec![
                entry("/b/x", EntryFlags::HASHVALID, [9u8; shared::HASH_SIZE]),
                entry("/b/", EntryFlags::HASHVALID, [8u8; shared::HASH_SIZE]),
                entry("/a/y", EntryFlags::HASHVALID, [2u8; shared::HASH_SIZE]),
                entry("/a/", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
                entry("/", EntryFlags::empty(), shared::ZERO_HASH),
            ],
        );
        // This run's walk observed "/a/y" again but never touched "/b/" at all.
        let fresh = vec![
            entry("/a/y", EntryFlags::HASHVALID, [2u8; shared::HASH_SIZE]),
            entry("/a/", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
        ];
        let merged = merge(&old, &fresh, &["/a/".to_string()], true);

        let b_x = merged.iter().find(|e| e.path == "/b/x").unwrap();
        assert!(!b_x.deleted(), "/b/x was never walked this run and must not be flagged deleted");
        let b_dir = merged.iter().find(|e| e.path == "/b/").unwrap();
        assert!(!b_dir.deleted());
    }

    #[test]
    fn hashvalid_dropped_when_stat_changes() {
        let old = FileIndexReader::from_entries(
            std::path::Path::new("old"),
            vec![
                entry("/a", EntryFlags::HASHVALID, [1u8; shared::HASH_SIZE]),
                entry("/", EntryFlags::empty(), shared::ZERO_HASH),
            ],
        );
        let mut changed = entry("/a", EntryFlags::empty(), shared::ZERO_HASH);
        changed.stat.size = 999;
        let merged = merge(&old, &[changed], &["/a".to_string()], true);
        let a = merged.iter().find(|e| e.path == "/a").unwrap();
        assert!(!a.hash_valid());
    }
}
