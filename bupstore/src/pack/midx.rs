//! Multi-index (spec.md §3 "Multi-index (midx)", §4.4): a union index across several
//! packs, built lazily once enough small idx files accumulate so that membership
//! queries stay O(log total_objects) instead of O(packs · log objects).

use std::fs;
use std::path::{Path, PathBuf};

use sha1::{Digest, Sha1};

use shared::Hash;

use crate::error::{Result, StoreError};
use crate::pack::format::IdxEntry;

const MIDX_MAGIC: &[u8; 4] = b"MIDX";
const MIDX_VERSION: u32 = 1;

pub struct MultiIndexEntry {
    pub hash: Hash,
    pub pack_name: String,
    pub offset: u64,
    pub crc32: u32,
}

pub struct MultiIndex {
    path: PathBuf,
    pack_names: Vec<String>,
    fanout: [u32; 256],
    hashes: Vec<Hash>,
    pack_idx: Vec<u32>,
    offsets: Vec<u64>,
    crc32s: Vec<u32>,
}

impl MultiIndex {
    /// Builds a midx in memory from the constituent `(pack_name, entries)` pairs
    /// (already-sorted per-pack entries, as read from each pack's own idx).
    pub fn build(sources: &[(String, Vec<IdxEntry>)]) -> Self {
        let pack_names: Vec<String> = sources.iter().map(|(n, _)| n.clone()).collect();

        let mut merged: Vec<(Hash, u32, u64, u32)> = Vec::new();
        for (pack_no, (_, entries)) in sources.iter().enumerate() {
            for e in entries {
                merged.push((e.hash, pack_no as u32, e.offset, e.crc32));
            }
        }
        merged.sort_by_key(|(h, ..)| *h);
        merged.dedup_by_key(|(h, ..)| *h);

        let mut fanout = [0u32; 256];
        for (h, ..) in &merged {
            fanout[h[0] as usize] += 1;
        }
        for i in 1..256 {
            fanout[i] += fanout[i - 1];
        }

        Self {
            path: PathBuf::new(),
            pack_names,
            fanout,
            hashes: merged.iter().map(|(h, ..)| *h).collect(),
            pack_idx: merged.iter().map(|(_, p, ..)| *p).collect(),
            offsets: merged.iter().map(|(_, _, o, _)| *o).collect(),
            crc32s: merged.iter().map(|(.., c)| *c).collect(),
        }
    }

    pub fn find(&self, hash: &Hash) -> Option<MultiIndexEntry> {
        let byte = hash[0] as usize;
        let lo = if byte == 0 { 0 } else { self.fanout[byte - 1] as usize };
        let hi = self.fanout[byte] as usize;

        let slice = &self.hashes[lo..hi];
        let pos = slice.binary_search(hash).ok()?;
        let i = lo + pos;
        Some(MultiIndexEntry {
            hash: self.hashes[i],
            pack_name: self.pack_names[self.pack_idx[i] as usize].clone(),
            offset: self.offsets[i],
            crc32: self.crc32s[i],
        })
    }

    /// Names of every pack this midx fully covers, i.e. whose idx files can be marked
    /// "subsumed" (spec.md §4.4) once this midx is in place.
    pub fn covered_packs(&self) -> &[String] {
        &self.pack_names
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, dir: &Path) -> Result<PathBuf> {
        let mut body = Vec::new();
        body.extend_from_slice(&(self.pack_names.len() as u32).to_le_bytes());
        for name in &self.pack_names {
            let bytes = name.as_bytes();
            body.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            body.extend_from_slice(bytes);
        }
        for f in &self.fanout {
            body.extend_from_slice(&f.to_le_bytes());
        }
        for h in &self.hashes {
            body.extend_from_slice(h);
        }
        for p in &self.pack_idx {
            body.extend_from_slice(&p.to_le_bytes());
        }
        for o in &self.offsets {
            body.extend_from_slice(&o.to_le_bytes());
        }
        for c in &self.crc32s {
            body.extend_from_slice(&c.to_le_bytes());
        }

        let mut buf = Vec::with_capacity(8 + body.len() + shared::HASH_SIZE);
        buf.extend_from_slice(MIDX_MAGIC);
        buf.extend_from_slice(&MIDX_VERSION.to_le_bytes());
        buf.extend_from_slice(&body);

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let digest = hasher.finalize();
        buf.extend_from_slice(&digest);

        let name = hex::encode(&digest);
        let path = dir.join(format!("midx-{name}.midx"));
        let tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| StoreError::io(dir, e))?;
        std::fs::write(tmp.path(), &buf).map_err(|e| StoreError::io(dir, e))?;
        tmp.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;

        self.path = path.clone();
        Ok(path)
    }

    pub fn open(path: &Path) -> Result<Self> {
        let bytes = fs::read(path).map_err(|e| StoreError::io(path, e))?;
        Self::parse(path, &bytes)
    }

    fn parse(path: &Path, bytes: &[u8]) -> Result<Self> {
        let corrupt = |msg: &str| StoreError::Corruption(format!("{}: {msg}", path.display()));

        if bytes.len() < 8 + shared::HASH_SIZE || &bytes[0..4] != MIDX_MAGIC.as_slice() {
            return Err(corrupt("bad magic or truncated midx"));
        }
        let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
        if version != MIDX_VERSION {
            return Err(corrupt("unsupported midx version"));
        }

        let mut pos = 8;
        let pack_count = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()) as usize;
        pos += 4;
        let mut pack_names = Vec::with_capacity(pack_count);
        for _ in 0..pack_count {
            let len = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap()) as usize;
            pos += 2;
            let name = String::from_utf8_lossy(&bytes[pos..pos + len]).into_owned();
            pos += len;
            pack_names.push(name);
        }

        let mut fanout = [0u32; 256];
        for f in fanout.iter_mut() {
            *f = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
            pos += 4;
        }
        let count = fanout[255] as usize;

        let mut hashes = Vec::with_capacity(count);
        for _ in 0..count {
            let mut h = [0u8; shared::HASH_SIZE];
            h.copy_from_slice(&bytes[pos..pos + shared::HASH_SIZE]);
            pos += shared::HASH_SIZE;
            hashes.push(h);
        }

        let mut pack_idx = Vec::with_capacity(count);
        for _ in 0..count {
            pack_idx.push(u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }

        let mut offsets = Vec::with_capacity(count);
        for _ in 0..count {
            offsets.push(u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap()));
            pos += 8;
        }

        let mut crc32s = Vec::with_capacity(count);
        for _ in 0..count {
            crc32s.push(u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap()));
            pos += 4;
        }

        Ok(Self {
            path: path.to_path_buf(),
            pack_names,
            fanout,
            hashes,
            pack_idx,
            offsets,
            crc32s,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(b: u8) -> Hash {
        let mut out = [0u8; shared::HASH_SIZE];
        out[0] = b;
        out
    }

    #[test]
    fn merges_and_finds_across_packs() {
        let sources = vec![
            ("pack-a.idx".to_string(), vec![IdxEntry { hash: h(1), offset: 10, crc32: 1 }]),
            ("pack-b.idx".to_string(), vec![IdxEntry { hash: h(2), offset: 20, crc32: 2 }]),
        ];
        let midx = MultiIndex::build(&sources);

        let found = midx.find(&h(2)).unwrap();
        assert_eq!(found.pack_name, "pack-b.idx");
        assert_eq!(found.offset, 20);
        assert!(midx.find(&h(9)).is_none());
    }

    #[test]
    fn write_then_open_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let sources = vec![(
            "pack-a.idx".to_string(),
            vec![IdxEntry { hash: h(3), offset: 30, crc32: 3 }],
        )];
        let mut midx = MultiIndex::build(&sources);
        let path = midx.write(dir.path()).unwrap();

        let reopened = MultiIndex::open(&path).unwrap();
        let found = reopened.find(&h(3)).unwrap();
        assert_eq!(found.pack_name, "pack-a.idx");
        assert_eq!(found.offset, 30);
    }
}
