//! On-disk binary layouts for packs and their companion index files (spec.md §3, §6).

use shared::Hash;

/// `pack-<sha1>.pack` header: magic and format version. The object count lives in the
/// companion idx rather than here, so the writer never has to seek back and patch the
/// header once the final count is known.
pub const PACK_MAGIC: &[u8; 4] = b"BPCK";
pub const PACK_VERSION: u32 = 2;
pub const PACK_HEADER_LEN: u64 = 4 + 4;

/// Fixed-size prefix of each object record: kind tag, uncompressed length, compressed
/// length, crc32 of the compressed bytes. The compressed payload follows immediately.
pub const RECORD_HEADER_LEN: u64 = 1 + 8 + 4 + 4;

/// `pack-<sha1>.idx` magic and version (spec.md §6, "Pack idx format (version 2)").
pub const IDX_MAGIC: &[u8; 4] = b"\xfftOc";
pub const IDX_VERSION: u32 = 2;

/// Offsets at or above 2 GiB can't fit in the 32-bit offset table slot; the high bit is
/// set and the remaining 31 bits index into an auxiliary 64-bit offset table instead
/// (spec.md §6, "Large offsets").
pub const LARGE_OFFSET_FLAG: u32 = 0x8000_0000;
pub const LARGE_OFFSET_THRESHOLD: u64 = 0x8000_0000;

/// One pack entry as recorded by the writer and as read back from an idx: the object's
/// hash, where its record starts in the pack, and the crc32 of its compressed bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdxEntry {
    pub hash: Hash,
    pub offset: u64,
    pub crc32: u32,
}

/// Serializes a sorted-by-hash slice of entries into the version-2 idx binary layout,
/// returning the full file contents (including the trailing `idx_sha1`).
pub fn write_idx(entries: &[IdxEntry], pack_sha1: Hash) -> Vec<u8> {
    debug_assert!(entries.windows(2).all(|w| w[0].hash <= w[1].hash), "entries must be sorted");

    let mut fanout = [0u32; 256];
    for e in entries {
        let b = e.hash[0] as usize;
        fanout[b] += 1;
    }
    // fanout[i] becomes a cumulative count: "number of hashes with first byte <= i".
    for i in 1..256 {
        fanout[i] += fanout[i - 1];
    }

    let mut large_offsets = Vec::new();
    let mut buf = Vec::new();
    buf.extend_from_slice(IDX_MAGIC);
    buf.extend_from_slice(&IDX_VERSION.to_le_bytes());
    for f in &fanout {
        buf.extend_from_slice(&f.to_le_bytes());
    }
    for e in entries {
        buf.extend_from_slice(&e.hash);
    }
    for e in entries {
        buf.extend_from_slice(&e.crc32.to_le_bytes());
    }
    for e in entries {
        let packed_offset = if e.offset >= LARGE_OFFSET_THRESHOLD {
            let idx = large_offsets.len() as u32;
            large_offsets.push(e.offset);
            LARGE_OFFSET_FLAG | idx
        } else {
            e.offset as u32
        };
        buf.extend_from_slice(&packed_offset.to_le_bytes());
    }
    for off in &large_offsets {
        buf.extend_from_slice(&off.to_le_bytes());
    }
    buf.extend_from_slice(&pack_sha1);

    let idx_sha1 = {
        use sha1::{Digest, Sha1};
        let mut h = Sha1::new();
        h.update(&buf);
        let digest = h.finalize();
        let mut out = [0u8; shared::HASH_SIZE];
        out.copy_from_slice(&digest);
        out
    };
    buf.extend_from_slice(&idx_sha1);
    buf
}

/// A read-only view over a parsed idx file's fixed-size tables, borrowed from whatever
/// buffer (mmap or `Vec<u8>`) holds the raw bytes.
pub struct IdxView<'a> {
    pub fanout: [u32; 256],
    pub hashes: &'a [u8],
    pub crc32s: &'a [u8],
    pub offsets: &'a [u8],
    pub large_offsets: &'a [u8],
    pub pack_sha1: Hash,
    pub idx_sha1: Hash,
    pub count: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum IdxParseError {
    #[error("idx file too short")]
    Truncated,
    #[error("bad idx magic")]
    BadMagic,
    #[error("unsupported idx version {0}")]
    UnsupportedVersion(u32),
}

pub fn parse_idx(bytes: &[u8]) -> Result<IdxView<'_>, IdxParseError> {
    if bytes.len() < 4 + 4 + 256 * 4 + shared::HASH_SIZE * 2 {
        return Err(IdxParseError::Truncated);
    }
    if &bytes[0..4] != IDX_MAGIC.as_slice() {
        return Err(IdxParseError::BadMagic);
    }
    let version = u32::from_le_bytes(bytes[4..8].try_into().unwrap());
    if version != IDX_VERSION {
        return Err(IdxParseError::UnsupportedVersion(version));
    }

    let mut fanout = [0u32; 256];
    let mut pos = 8;
    for f in fanout.iter_mut() {
        *f = u32::from_le_bytes(bytes[pos..pos + 4].try_into().unwrap());
        pos += 4;
    }
    let count = fanout[255] as usize;

    let hashes_start = pos;
    let hashes_len = count * shared::HASH_SIZE;
    let crc32s_start = hashes_start + hashes_len;
    let crc32s_len = count * 4;
    let offsets_start = crc32s_start + crc32s_len;
    let offsets_len = count * 4;
    let tail_start = offsets_start + offsets_len;

    if bytes.len() < tail_start + shared::HASH_SIZE * 2 {
        return Err(IdxParseError::Truncated);
    }

    let large_offsets_len = bytes.len() - tail_start - shared::HASH_SIZE * 2;
    let pack_sha1_start = tail_start + large_offsets_len;
    let idx_sha1_start = pack_sha1_start + shared::HASH_SIZE;

    let mut pack_sha1 = [0u8; shared::HASH_SIZE];
    pack_sha1.copy_from_slice(&bytes[pack_sha1_start..pack_sha1_start + shared::HASH_SIZE]);
    let mut idx_sha1 = [0u8; shared::HASH_SIZE];
    idx_sha1.copy_from_slice(&bytes[idx_sha1_start..idx_sha1_start + shared::HASH_SIZE]);

    Ok(IdxView {
        fanout,
        hashes: &bytes[hashes_start..hashes_start + hashes_len],
        crc32s: &bytes[crc32s_start..crc32s_start + crc32s_len],
        offsets: &bytes[offsets_start..offsets_start + offsets_len],
        large_offsets: &bytes[tail_start..tail_start + large_offsets_len],
        pack_sha1,
        idx_sha1,
        count,
    })
}

impl<'a> IdxView<'a> {
    fn hash_at(&self, i: usize) -> Hash {
        let mut h = [0u8; shared::HASH_SIZE];
        h.copy_from_slice(&self.hashes[i * shared::HASH_SIZE..(i + 1) * shared::HASH_SIZE]);
        h
    }

    fn crc32_at(&self, i: usize) -> u32 {
        u32::from_le_bytes(self.crc32s[i * 4..i * 4 + 4].try_into().unwrap())
    }

    fn offset_at(&self, i: usize) -> u64 {
        let raw = u32::from_le_bytes(self.offsets[i * 4..i * 4 + 4].try_into().unwrap());
        if raw & LARGE_OFFSET_FLAG != 0 {
            let aux = (raw & !LARGE_OFFSET_FLAG) as usize;
            u64::from_le_bytes(self.large_offsets[aux * 8..aux * 8 + 8].try_into().unwrap())
        } else {
            raw as u64
        }
    }

    /// Binary search bounded by the fanout table (spec.md §4.4).
    pub fn find(&self, hash: &Hash) -> Option<IdxEntry> {
        let byte = hash[0] as usize;
        let lo = if byte == 0 { 0 } else { self.fanout[byte - 1] as usize };
        let hi = self.fanout[byte] as usize;

        let mut lo = lo;
        let mut hi = hi;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let mid_hash = self.hash_at(mid);
            match mid_hash.cmp(hash) {
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
                std::cmp::Ordering::Equal => {
                    return Some(IdxEntry {
                        hash: mid_hash,
                        offset: self.offset_at(mid),
                        crc32: self.crc32_at(mid),
                    })
                }
            }
        }
        None
    }

    pub fn iter(&self) -> impl Iterator<Item = IdxEntry> + '_ {
        (0..self.count).map(move |i| IdxEntry {
            hash: self.hash_at(i),
            offset: self.offset_at(i),
            crc32: self.crc32_at(i),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(seed: u8) -> Hash {
        let mut out = [0u8; shared::HASH_SIZE];
        out[0] = seed;
        out[shared::HASH_SIZE - 1] = seed;
        out
    }

    #[test]
    fn write_then_parse_round_trips() {
        let mut entries = vec![
            IdxEntry { hash: h(1), offset: 12, crc32: 111 },
            IdxEntry { hash: h(5), offset: 5_000_000_000, crc32: 222 },
            IdxEntry { hash: h(200), offset: 99, crc32: 333 },
        ];
        entries.sort_by_key(|e| e.hash);

        let bytes = write_idx(&entries, [9u8; shared::HASH_SIZE]);
        let view = parse_idx(&bytes).unwrap();

        assert_eq!(view.count, 3);
        assert_eq!(view.pack_sha1, [9u8; shared::HASH_SIZE]);
        for e in &entries {
            let found = view.find(&e.hash).expect("entry must be found");
            assert_eq!(found.offset, e.offset);
            assert_eq!(found.crc32, e.crc32);
        }

        let miss = [0xffu8; shared::HASH_SIZE];
        assert!(view.find(&miss).is_none());
    }
}
