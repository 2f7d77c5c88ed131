//! C2: the tree builder (spec.md §4.2).
//!
//! Folds the splitter's flat `(offset, hash, level)` stream into a balanced hash tree,
//! one queue per splitter level. A chunked blob's top hash is just the lone blob's hash
//! when a file never grows past one chunk; otherwise it's the hash of the outermost
//! fold, a `tree` object whose entries are hex-encoded byte offsets (spec.md §3,
//! "chunked blob").

use crate::error::{Result, StoreError};
use crate::object::{Object, Tree, TreeEntry, ENTRY_MODE_CHUNK_LEAF, ENTRY_MODE_CHUNK_TREE};
use shared::Hash;

/// Anything that can durably accept an object and hand back its content address.
/// Implemented by the pack writer (C3); kept as a trait here so the tree builder
/// doesn't need to know about packs, staging, or deduplication.
pub trait ObjectSink {
    fn add(&mut self, object: Object) -> Result<Hash>;
}

pub struct TreeBuilder {
    /// `queues[k]` holds `(offset_of_first_leaf, hash)` pairs waiting to be folded into
    /// a level-`k+1` tree. `queues[0]` holds raw blob references.
    queues: Vec<Vec<(u64, Hash)>>,
}

impl TreeBuilder {
    pub fn new() -> Self {
        Self { queues: vec![Vec::new()] }
    }

    fn ensure_level(&mut self, level: usize) {
        while self.queues.len() <= level {
            self.queues.push(Vec::new());
        }
    }

    /// Feed one splitter-emitted chunk. `offset` is this chunk's starting byte offset
    /// in the original stream.
    pub fn push_blob(
        &mut self,
        offset: u64,
        hash: Hash,
        level: u32,
        sink: &mut dyn ObjectSink,
    ) -> Result<()> {
        self.queues[0].push((offset, hash));

        for k in 0..level as usize {
            if self.queues[k].len() >= 2 {
                let first_offset = self.queues[k][0].0;
                let tree_hash = self.fold_queue(k, sink)?;
                self.ensure_level(k + 1);
                self.queues[k + 1].push((first_offset, tree_hash));
            }
        }
        Ok(())
    }

    fn fold_queue(&mut self, level: usize, sink: &mut dyn ObjectSink) -> Result<Hash> {
        let entries = std::mem::take(&mut self.queues[level]);
        let mode = if level == 0 { ENTRY_MODE_CHUNK_LEAF } else { ENTRY_MODE_CHUNK_TREE };
        let tree = Tree {
            entries: entries
                .into_iter()
                .map(|(offset, hash)| TreeEntry { mode, name: format!("{offset:016x}"), hash })
                .collect(),
        };
        sink.add(Object::Tree(tree))
    }

    /// Collapse every remaining queue, lowest level first, until a single root entry
    /// remains, and return its `(offset, hash)`. Returns the zero hash if no blob was
    /// ever pushed.
    pub fn finish(mut self, sink: &mut dyn ObjectSink) -> Result<(u64, Hash)> {
        loop {
            let lvl = match self.queues.iter().position(|q| !q.is_empty()) {
                Some(l) => l,
                None => return Ok((0, shared::ZERO_HASH)),
            };

            let above_empty = self.queues[lvl + 1..].iter().all(|q| q.is_empty());
            if above_empty && self.queues[lvl].len() == 1 {
                return Ok(self.queues[lvl][0]);
            }

            if self.queues[lvl].is_empty() {
                return Err(StoreError::Corruption("tree builder: empty queue selected".into()));
            }

            let first_offset = self.queues[lvl][0].0;
            let tree_hash = self.fold_queue(lvl, sink)?;
            self.ensure_level(lvl + 1);
            self.queues[lvl + 1].push((first_offset, tree_hash));
        }
    }
}

impl Default for TreeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct MemSink {
        objects: HashMap<Hash, Object>,
    }

    impl MemSink {
        fn new() -> Self {
            Self { objects: HashMap::new() }
        }
    }

    impl ObjectSink for MemSink {
        fn add(&mut self, object: Object) -> Result<Hash> {
            let hash = object.hash();
            self.objects.insert(hash, object);
            Ok(hash)
        }
    }

    fn blob_hash(n: u8) -> Hash {
        Object::Blob(vec![n]).hash()
    }

    #[test]
    fn single_chunk_is_its_own_root() {
        let mut sink = MemSink::new();
        let mut builder = TreeBuilder::new();
        let h = blob_hash(1);
        builder.push_blob(0, h, 0, &mut sink).unwrap();
        let (offset, root) = builder.finish(&mut sink).unwrap();
        assert_eq!(offset, 0);
        assert_eq!(root, h);
        // No tree object should have been created for a lone chunk.
        assert!(sink.objects.is_empty());
    }

    #[test]
    fn two_level0_chunks_fold_into_one_tree() {
        let mut sink = MemSink::new();
        let mut builder = TreeBuilder::new();
        let h1 = blob_hash(1);
        let h2 = blob_hash(2);
        // A level-1 cut after the second chunk folds queue 0 into a tree.
        builder.push_blob(0, h1, 0, &mut sink).unwrap();
        builder.push_blob(10, h2, 1, &mut sink).unwrap();
        let (offset, root) = builder.finish(&mut sink).unwrap();
        assert_eq!(offset, 0);

        let obj = sink.objects.get(&root).expect("root tree must be in sink");
        match obj {
            Object::Tree(t) => {
                assert_eq!(t.entries.len(), 2);
                assert_eq!(t.entries[0].hash, h1);
                assert_eq!(t.entries[1].hash, h2);
                assert_eq!(t.entries[0].mode, ENTRY_MODE_CHUNK_LEAF);
            }
            _ => panic!("expected a tree object"),
        }
    }

    #[test]
    fn leaf_order_matches_stream_order() {
        let mut sink = MemSink::new();
        let mut builder = TreeBuilder::new();
        let hashes: Vec<Hash> = (0..20).map(blob_hash).collect();
        for (i, h) in hashes.iter().enumerate() {
            // Sprinkle in level-1 and level-2 cuts so folding actually happens.
            let level = if i % 7 == 6 { 2 } else if i % 3 == 2 { 1 } else { 0 };
            builder.push_blob(i as u64 * 10, *h, level, &mut sink).unwrap();
        }
        let (_, root) = builder.finish(&mut sink).unwrap();

        // Walk the tree depth-first and confirm the leaves appear in original order.
        fn collect_leaves(hash: Hash, objects: &HashMap<Hash, Object>, out: &mut Vec<Hash>) {
            match objects.get(&hash) {
                None => out.push(hash), // leaf hash never staged as a tree: it's a raw blob
                Some(Object::Tree(t)) => {
                    for e in &t.entries {
                        collect_leaves(e.hash, objects, out);
                    }
                }
                _ => panic!("unexpected object kind in chunked-blob tree"),
            }
        }

        let mut leaves = Vec::new();
        collect_leaves(root, &sink.objects, &mut leaves);
        assert_eq!(leaves, hashes);
    }

    #[test]
    fn identical_subtrees_across_builds_get_the_same_hash() {
        let mut sink = MemSink::new();
        let hashes: Vec<Hash> = (0..5).map(blob_hash).collect();

        let mut build = || {
            let mut builder = TreeBuilder::new();
            for (i, h) in hashes.iter().enumerate() {
                let level = if i == 2 { 1 } else { 0 };
                builder.push_blob(i as u64, *h, level, &mut sink).unwrap();
            }
            builder.finish(&mut sink).unwrap().1
        };

        let root_a = build();
        let root_b = build();
        assert_eq!(root_a, root_b);
    }
}
