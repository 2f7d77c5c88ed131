//! C3: the pack writer (spec.md §4.3).

use std::collections::HashSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use flate2::write::ZlibEncoder;
use flate2::Compression;
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;

use shared::Hash;

use crate::error::{Result, StoreError};
use crate::object::{self, Object};
use crate::pack::cache::ObjectCache;
use crate::pack::format::{self, IdxEntry, PACK_MAGIC, PACK_VERSION};
use crate::tree::ObjectSink;

/// Soft cap on a single pack's size (spec.md §4.3). A caller driving a long backup run
/// checks `should_roll()` between objects and calls `close()`/`create()` again to start
/// a fresh pack once it trips.
pub const MAX_PACK_SIZE: u64 = shared::MAX_PACK_SIZE;

pub struct PackWriter {
    dir: PathBuf,
    tmp_pack: NamedTempFile,
    hasher: Sha1,
    offset: u64,
    entries: Vec<IdxEntry>,
    seen: HashSet<Hash>,
}

impl PackWriter {
    /// Opens a new temporary pack file under `dir` (normally `$REPO/objects/pack`) and
    /// writes its fixed header.
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;
        let mut tmp_pack =
            NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;

        let mut hasher = Sha1::new();
        let mut header = Vec::new();
        header.extend_from_slice(PACK_MAGIC);
        header.extend_from_slice(&PACK_VERSION.to_le_bytes());
        tmp_pack.write_all(&header).map_err(|e| StoreError::io(dir, e))?;
        hasher.update(&header);

        Ok(Self {
            dir: dir.to_path_buf(),
            tmp_pack,
            hasher,
            offset: header.len() as u64,
            entries: Vec::new(),
            seen: HashSet::new(),
        })
    }

    pub fn should_roll(&self) -> bool {
        self.offset >= MAX_PACK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `add(kind, bytes) -> hash` (spec.md §4.3). Skips the write entirely if the
    /// object is already staged in this pack or already reachable via `cache`.
    pub fn add(
        &mut self,
        cache: &mut ObjectCache,
        kind: shared::ObjectKind,
        payload: &[u8],
    ) -> Result<Hash> {
        let hash = object::hash_payload(kind, payload);

        if self.seen.contains(&hash) || cache.exists(&hash, false).is_some() {
            return Ok(hash);
        }

        self.write_record(kind, &hash, payload)?;
        Ok(hash)
    }

    fn write_record(&mut self, kind: shared::ObjectKind, hash: &Hash, payload: &[u8]) -> Result<()> {
        let mut compressed = Vec::new();
        {
            let mut encoder = ZlibEncoder::new(&mut compressed, Compression::default());
            encoder.write_all(payload).map_err(|e| StoreError::io(&self.dir, e))?;
            encoder.finish().map_err(|e| StoreError::io(&self.dir, e))?;
        }
        let crc32 = crc32fast::hash(&compressed);

        let mut record = Vec::with_capacity(compressed.len() + 17);
        record.push(kind as u8);
        record.extend_from_slice(&(payload.len() as u64).to_le_bytes());
        record.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
        record.extend_from_slice(&crc32.to_le_bytes());
        record.extend_from_slice(&compressed);

        let record_offset = self.offset;
        self.tmp_pack.write_all(&record).map_err(|e| StoreError::io(&self.dir, e))?;
        self.hasher.update(&record);
        self.offset += record.len() as u64;

        self.entries.push(IdxEntry { hash: *hash, offset: record_offset, crc32 });
        self.seen.insert(*hash);
        Ok(())
    }

    /// `exists(hash, want_source?)` restricted to this writer's own staged objects;
    /// cross-pack lookups go through the `ObjectCache` (C4/C5).
    pub fn exists_staged(&self, hash: &Hash) -> bool {
        self.seen.contains(hash)
    }

    /// `close() -> pack_path | None` (spec.md §4.3). Finalizes the pack's SHA-1
    /// trailer, writes the companion idx, and atomically renames both into `dir`.
    /// Returns `None` (and removes the temporary file) if nothing was ever staged.
    pub fn close(mut self) -> Result<Option<PathBuf>> {
        if self.entries.is_empty() {
            return Ok(None);
        }

        let trailer: Hash = {
            let digest = self.hasher.clone().finalize();
            let mut out = [0u8; shared::HASH_SIZE];
            out.copy_from_slice(&digest);
            out
        };
        self.tmp_pack.write_all(&trailer).map_err(|e| StoreError::io(&self.dir, e))?;
        self.tmp_pack.flush().map_err(|e| StoreError::io(&self.dir, e))?;

        let mut entries = self.entries.clone();
        entries.sort_by_key(|e| e.hash);
        let idx_bytes = format::write_idx(&entries, trailer);

        let mut tmp_idx = NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        tmp_idx.write_all(&idx_bytes).map_err(|e| StoreError::io(&self.dir, e))?;

        let name = hex::encode(trailer);
        let pack_path = self.dir.join(format!("pack-{name}.pack"));
        let idx_path = self.dir.join(format!("pack-{name}.idx"));

        self.tmp_pack
            .persist(&pack_path)
            .map_err(|e| StoreError::io(&pack_path, e.error))?;
        tmp_idx
            .persist(&idx_path)
            .map_err(|e| StoreError::io(&idx_path, e.error))?;

        Ok(Some(pack_path))
    }

    /// `abort()` (spec.md §4.3). Discards the partial pack; the temporary file is
    /// unlinked when `self.tmp_pack` drops.
    pub fn abort(self) {}
}

// A `PackWriter` dropped without `close()`/`abort()` (early return on error, a panic
// unwind) never leaves a half-written pack visible under its final name: the backing
// `NamedTempFile` unlinks itself on drop, since `persist()` only runs at the end of a
// successful `close()` (spec.md §7, "partial packs must never be visible"). `close`
// and `abort` both take `self` by value, so the type system itself rules out calling
// either a second time or calling one after the other — there's no runtime flag to
// guard, the borrow checker already does it.

impl ObjectSink for PackWriter {
    fn add(&mut self, object: Object) -> Result<Hash> {
        let payload = object.encode();
        let kind = object.kind();
        // A bare ObjectSink call (used by the tree builder) has no cache reference in
        // scope; callers that care about cross-pack dedup go through `add` directly
        // with their `ObjectCache` in hand. Here we only dedupe within this pack.
        let hash = object::hash_payload(kind, &payload);
        if self.seen.contains(&hash) {
            return Ok(hash);
        }
        self.write_record(kind, &hash, &payload)?;
        Ok(hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Tree, TreeEntry, ENTRY_MODE_CHUNK_LEAF};
    use crate::pack::reader::PackReader;
    use tempfile::tempdir;

    #[test]
    fn pack_round_trip() {
        let dir = tempdir().unwrap();
        let mut cache = ObjectCache::new(dir.path().to_path_buf());
        let mut writer = PackWriter::create(dir.path()).unwrap();

        let h_a = writer.add(&mut cache, shared::ObjectKind::Blob, b"a").unwrap();
        let h_b = writer.add(&mut cache, shared::ObjectKind::Blob, b"bb").unwrap();
        let h_c = writer.add(&mut cache, shared::ObjectKind::Blob, b"ccc").unwrap();

        let tree = Tree {
            entries: vec![
                TreeEntry { mode: ENTRY_MODE_CHUNK_LEAF, name: "0".into(), hash: h_a },
                TreeEntry { mode: ENTRY_MODE_CHUNK_LEAF, name: "1".into(), hash: h_b },
                TreeEntry { mode: ENTRY_MODE_CHUNK_LEAF, name: "2".into(), hash: h_c },
            ],
        };
        let tree_bytes = bincode::serialize(&tree).unwrap();
        let h_tree = writer.add(&mut cache, shared::ObjectKind::Tree, &tree_bytes).unwrap();

        let pack_path = writer.close().unwrap().expect("pack should have been written");
        let idx_path = pack_path.with_extension("idx");
        assert!(idx_path.exists());

        let reader = PackReader::open(&pack_path, &idx_path).unwrap();
        assert_eq!(reader.read(&h_a).unwrap(), b"a");
        assert_eq!(reader.read(&h_b).unwrap(), b"bb");
        assert_eq!(reader.read(&h_c).unwrap(), b"ccc");
        assert_eq!(reader.read(&h_tree).unwrap(), tree_bytes);

        assert!(reader.exists(&h_a));
        assert!(!reader.exists(&[0u8; shared::HASH_SIZE]));
    }

    #[test]
    fn empty_pack_closes_to_none() {
        let dir = tempdir().unwrap();
        let writer = PackWriter::create(dir.path()).unwrap();
        assert_eq!(writer.close().unwrap(), None);

        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none(), "no files should remain after an empty close");
    }

    #[test]
    fn duplicate_add_within_pack_is_free() {
        let dir = tempdir().unwrap();
        let mut cache = ObjectCache::new(dir.path().to_path_buf());
        let mut writer = PackWriter::create(dir.path()).unwrap();

        let h1 = writer.add(&mut cache, shared::ObjectKind::Blob, b"same").unwrap();
        let h2 = writer.add(&mut cache, shared::ObjectKind::Blob, b"same").unwrap();
        assert_eq!(h1, h2);
        assert_eq!(writer.entries.len(), 1);
    }
}
