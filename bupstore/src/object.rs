//! The object model (spec.md §3): immutable, content-addressed blobs, trees and
//! commits, each identified by the SHA-1 of a canonical serialization.
//!
//! Mirrors the teacher's `BlobKind`/`Tree` split (`filesystem/mod.rs`), generalized to
//! the three kinds spec.md names instead of the teacher's file-vs-directory split, and
//! hashed rather than assigned a random id.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use shared::Hash;

/// Mode bit on a chunked-blob tree entry distinguishing a leaf chunk from a subtree
/// chunk (spec.md §3, "chunked blob").
pub const ENTRY_MODE_CHUNK_LEAF: u32 = 0o100_644;
pub const ENTRY_MODE_CHUNK_TREE: u32 = 0o100_755;

/// A tree entry: `(mode, name, hash)` as spec.md §3 names it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub mode: u32,
    pub name: String,
    pub hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tree {
    pub entries: Vec<TreeEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub tree: Hash,
    pub parents: Vec<Hash>,
    pub author: String,
    pub committer: String,
    pub message: String,
}

/// The three object kinds, tagged with their payload. `Blob` carries raw bytes
/// uninterpreted; `Tree`/`Commit` are canonically serialized before hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Object {
    Blob(Vec<u8>),
    Tree(Tree),
    Commit(Commit),
}

impl Object {
    pub fn kind(&self) -> shared::ObjectKind {
        match self {
            Object::Blob(_) => shared::ObjectKind::Blob,
            Object::Tree(_) => shared::ObjectKind::Tree,
            Object::Commit(_) => shared::ObjectKind::Commit,
        }
    }

    /// The canonical on-disk payload bytes for this object, i.e. what gets
    /// deflate-compressed into a pack record (spec.md §3, "Pack").
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Object::Blob(bytes) => bytes.clone(),
            Object::Tree(tree) => bincode::serialize(tree).expect("tree serialization is infallible"),
            Object::Commit(commit) => {
                bincode::serialize(commit).expect("commit serialization is infallible")
            }
        }
    }

    pub fn decode(kind: shared::ObjectKind, bytes: &[u8]) -> bincode::Result<Object> {
        Ok(match kind {
            shared::ObjectKind::Blob => Object::Blob(bytes.to_vec()),
            shared::ObjectKind::Tree => Object::Tree(bincode::deserialize(bytes)?),
            shared::ObjectKind::Commit => Object::Commit(bincode::deserialize(bytes)?),
        })
    }

    /// The content address: SHA-1 over the kind tag followed by the encoded payload, so
    /// a blob and a tree that happen to share encoded bytes never collide.
    pub fn hash(&self) -> Hash {
        hash_payload(self.kind(), &self.encode())
    }
}

pub fn hash_payload(kind: shared::ObjectKind, payload: &[u8]) -> Hash {
    let mut hasher = Sha1::new();
    hasher.update([kind as u8]);
    hasher.update(payload);
    let digest = hasher.finalize();
    let mut hash = [0u8; shared::HASH_SIZE];
    hash.copy_from_slice(&digest);
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_bytes_same_hash() {
        let a = Object::Blob(b"hello".to_vec());
        let b = Object::Blob(b"hello".to_vec());
        assert_eq!(a.hash(), b.hash());
    }

    #[test]
    fn blob_and_tree_dont_collide_on_shared_bytes() {
        let blob = Object::Blob(vec![1, 2, 3]);
        let tree = Tree {
            entries: vec![TreeEntry {
                mode: ENTRY_MODE_CHUNK_LEAF,
                name: "0".into(),
                hash: [0u8; shared::HASH_SIZE],
            }],
        };
        assert_ne!(blob.hash(), Object::Tree(tree).hash());
    }

    #[test]
    fn round_trips_through_encode_decode() {
        let commit = Commit {
            tree: [7u8; shared::HASH_SIZE],
            parents: vec![[1u8; shared::HASH_SIZE]],
            author: "a".into(),
            committer: "a".into(),
            message: "msg".into(),
        };
        let obj = Object::Commit(commit.clone());
        let bytes = obj.encode();
        let decoded = Object::decode(shared::ObjectKind::Commit, &bytes).unwrap();
        assert_eq!(decoded, Object::Commit(commit));
    }
}
