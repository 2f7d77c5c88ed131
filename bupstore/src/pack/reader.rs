//! C4: read access to a sealed pack via its idx (spec.md §4.4).

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::ZlibDecoder;
use memmap2::Mmap;

use shared::Hash;

use crate::error::{Result, StoreError};
use crate::pack::format::{self, IdxEntry};

pub struct PackReader {
    pack_path: PathBuf,
    pack_file: File,
    idx_mmap: Mmap,
}

impl PackReader {
    pub fn open(pack_path: &Path, idx_path: &Path) -> Result<Self> {
        let pack_file = File::open(pack_path).map_err(|e| StoreError::io(pack_path, e))?;
        let idx_file = File::open(idx_path).map_err(|e| StoreError::io(idx_path, e))?;
        let idx_mmap =
            unsafe { Mmap::map(&idx_file) }.map_err(|e| StoreError::io(idx_path, e))?;

        // Validate eagerly: a corrupt idx should fail at open, not at the first lookup.
        format::parse_idx(&idx_mmap)
            .map_err(|e| StoreError::Corruption(format!("{}: {e}", idx_path.display())))?;

        Ok(Self { pack_path: pack_path.to_path_buf(), pack_file, idx_mmap })
    }

    fn view(&self) -> format::IdxView<'_> {
        format::parse_idx(&self.idx_mmap).expect("validated at open()")
    }

    pub fn exists(&self, hash: &Hash) -> bool {
        self.view().find(hash).is_some()
    }

    pub fn find(&self, hash: &Hash) -> Option<IdxEntry> {
        self.view().find(hash)
    }

    /// Reads and inflates the object stored at `hash`, validating the record's crc32
    /// against what the idx recorded (spec.md §8, "Pack integrity").
    pub fn read(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.read_with_kind(hash).map(|(_, bytes)| bytes)
    }

    /// Like [`Self::read`] but also returns the record's kind tag, for callers (the
    /// `cat` control command) that need to tell a blob's raw bytes from a chunked-blob
    /// tree's serialized entries.
    pub fn read_with_kind(&self, hash: &Hash) -> Result<(shared::ObjectKind, Vec<u8>)> {
        let entry = self
            .find(hash)
            .ok_or_else(|| StoreError::NotFound(format!("object {} not in pack", hex::encode(hash))))?;
        self.read_at(entry.offset, entry.crc32)
    }

    fn read_at(&self, offset: u64, expected_crc32: u32) -> Result<(shared::ObjectKind, Vec<u8>)> {
        use std::io::{Seek, SeekFrom};

        let mut file = self.pack_file.try_clone().map_err(|e| StoreError::io(&self.pack_path, e))?;
        file.seek(SeekFrom::Start(offset)).map_err(|e| StoreError::io(&self.pack_path, e))?;

        let mut header = [0u8; 17];
        file.read_exact(&mut header).map_err(|e| StoreError::io(&self.pack_path, e))?;
        let kind = shared::ObjectKind::from_u8(header[0]).ok_or_else(|| {
            StoreError::Corruption(format!("{}: bad kind tag at offset {offset}", self.pack_path.display()))
        })?;
        let uncompressed_len = u64::from_le_bytes(header[1..9].try_into().unwrap());
        let compressed_len = u32::from_le_bytes(header[9..13].try_into().unwrap()) as usize;

        let mut compressed = vec![0u8; compressed_len];
        file.read_exact(&mut compressed).map_err(|e| StoreError::io(&self.pack_path, e))?;

        let crc32 = crc32fast::hash(&compressed);
        if crc32 != expected_crc32 {
            return Err(StoreError::Corruption(format!(
                "{}: crc32 mismatch at offset {offset}",
                self.pack_path.display()
            )));
        }

        let mut out = Vec::with_capacity(uncompressed_len as usize);
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut out)
            .map_err(|e| StoreError::io(&self.pack_path, e))?;
        Ok((kind, out))
    }

    pub fn path(&self) -> &Path {
        &self.pack_path
    }

    pub fn entries(&self) -> Vec<IdxEntry> {
        self.view().iter().collect()
    }
}
