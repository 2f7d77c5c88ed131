//! Defines types used across the server binary and the store library.

use serde::{Deserialize, Serialize};

/// Size of a SHA-1 object hash, in bytes (spec.md §3: "20-byte SHA-1").
pub const HASH_SIZE: usize = 20;

/// Content-addressed identifier for a blob, tree, or commit object.
pub type Hash = [u8; HASH_SIZE];

/// The all-zero hash, used as a sentinel (an absent ref, `FAKE_SHA`, the `EMPTY_SHA`
/// a zero-length blob hashes to never collides with a real SHA-1 in practice).
pub const ZERO_HASH: Hash = [0u8; HASH_SIZE];

/// An object's kind, as stored in a packfile record header. The discriminants are
/// part of the on-disk format (spec.md §3, §6) and must never be reordered.
#[repr(u8)]
#[derive(Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Debug)]
pub enum ObjectKind {
    Blob = 0,
    Tree = 1,
    Commit = 2,
}

impl ObjectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectKind::Blob => "blob",
            ObjectKind::Tree => "tree",
            ObjectKind::Commit => "commit",
        }
    }

    pub fn from_u8(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(ObjectKind::Blob),
            1 => Some(ObjectKind::Tree),
            2 => Some(ObjectKind::Commit),
            _ => None,
        }
    }
}
