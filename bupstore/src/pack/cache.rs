//! C5: the object cache (spec.md §4.4). Holds every open pack idx plus, once enough
//! have accumulated, a merged multi-index, and answers "does hash H exist?" cheaply.

use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};

use shared::Hash;

use crate::error::{Result, StoreError};
use crate::pack::format::IdxEntry;
use crate::pack::midx::MultiIndex;
use crate::pack::reader::PackReader;

/// Once this many un-subsumed idx files accumulate, the cache schedules a midx rebuild
/// on the next `refresh()` (Open Question 2: a tunable constant, not a protocol
/// guarantee — see DESIGN.md).
pub const MIDX_REBUILD_THRESHOLD: usize = 4;

struct LoadedIdx {
    name: String,
    reader: PackReader,
    subsumed: bool,
}

pub struct ExistsResult {
    pub idx_name: Option<String>,
}

pub struct ObjectCache {
    pack_dir: PathBuf,
    idxs: Vec<LoadedIdx>,
    midx: Option<MultiIndex>,
    /// Set when `bup-dumb-server` (spec.md §6) is present alongside the repo: another
    /// process manages packs, so this cache never rewrites the multi-index on its own.
    dumb: bool,
}

impl ObjectCache {
    pub fn new(pack_dir: PathBuf) -> Self {
        Self { pack_dir, idxs: Vec::new(), midx: None, dumb: false }
    }

    pub fn set_dumb(&mut self, dumb: bool) {
        self.dumb = dumb;
    }

    pub fn pack_dir(&self) -> &Path {
        &self.pack_dir
    }

    /// Re-stats `objects/pack/` and loads any idx/midx files written since the last
    /// refresh (spec.md §4.4, "Cache refresh... observable to the next membership
    /// query within a bounded latency").
    pub fn refresh(&mut self) -> Result<()> {
        if !self.pack_dir.exists() {
            return Ok(());
        }

        let known: std::collections::HashSet<String> =
            self.idxs.iter().map(|l| l.name.clone()).collect();

        let mut names: Vec<String> = fs::read_dir(&self.pack_dir)
            .map_err(|e| StoreError::io(&self.pack_dir, e))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        for name in &names {
            if name.ends_with(".idx") && !known.contains(name) {
                let idx_path = self.pack_dir.join(name);
                let pack_path = idx_path.with_extension("pack");
                if pack_path.exists() {
                    let reader = PackReader::open(&pack_path, &idx_path)?;
                    self.idxs.push(LoadedIdx { name: name.clone(), reader, subsumed: false });
                }
            }
        }

        if let Some(midx_name) = names.iter().rev().find(|n| n.ends_with(".midx")) {
            let midx = MultiIndex::open(&self.pack_dir.join(midx_name))?;
            for loaded in self.idxs.iter_mut() {
                if midx.covered_packs().iter().any(|p| p == &loaded.name) {
                    loaded.subsumed = true;
                }
            }
            self.midx = Some(midx);
        }

        self.maybe_rebuild_midx()?;
        Ok(())
    }

    fn maybe_rebuild_midx(&mut self) -> Result<()> {
        if self.dumb {
            return Ok(());
        }

        let unsubsumed: Vec<&LoadedIdx> = self.idxs.iter().filter(|l| !l.subsumed).collect();
        if unsubsumed.len() < MIDX_REBUILD_THRESHOLD {
            return Ok(());
        }

        debug!("rebuilding multi-index over {} packs", unsubsumed.len());
        let sources: Vec<(String, Vec<IdxEntry>)> =
            unsubsumed.iter().map(|l| (l.name.clone(), l.reader.entries())).collect();
        let covered: Vec<String> = sources.iter().map(|(n, _)| n.clone()).collect();

        let mut midx = MultiIndex::build(&sources);
        let path = midx.write(&self.pack_dir)?;
        info!("wrote multi-index {}", path.display());

        for loaded in self.idxs.iter_mut() {
            if covered.contains(&loaded.name) {
                loaded.subsumed = true;
            }
        }
        self.midx = Some(midx);
        Ok(())
    }

    /// `exists(H)` (spec.md §4.4): the fanout-bounded midx lookup first, then
    /// un-subsumed idx files in MRU order. Promotes a hit to the front of the MRU
    /// list.
    pub fn exists(&mut self, hash: &Hash, want_source: bool) -> Option<ExistsResult> {
        if let Some(midx) = &self.midx {
            if let Some(entry) = midx.find(hash) {
                return Some(ExistsResult {
                    idx_name: if want_source { Some(entry.pack_name) } else { None },
                });
            }
        }

        let hit = self.idxs.iter().position(|l| !l.subsumed && l.reader.exists(hash))?;
        if hit != 0 {
            let loaded = self.idxs.remove(hit);
            self.idxs.insert(0, loaded);
        }
        let name = self.idxs[0].name.clone();
        Some(ExistsResult { idx_name: if want_source { Some(name) } else { None } })
    }

    pub fn read(&self, hash: &Hash) -> Result<Vec<u8>> {
        self.read_with_kind(hash).map(|(_, bytes)| bytes)
    }

    /// Like [`Self::read`] but also returns the stored kind tag (the `cat` control
    /// command needs it to tell a chunked-blob tree apart from a plain blob).
    ///
    /// Unlike [`Self::exists`], this never skips a pack just because its idx is
    /// `subsumed`: `subsumed` only means "the midx also covers this pack's entries",
    /// not "this pack's reader is gone" — the pack's bytes, and the `PackReader` that
    /// can fetch them, are still on disk and still held here either way.
    pub fn read_with_kind(&self, hash: &Hash) -> Result<(shared::ObjectKind, Vec<u8>)> {
        if let Some(midx) = &self.midx {
            if let Some(entry) = midx.find(hash) {
                if let Some(loaded) = self.idxs.iter().find(|l| l.name == entry.pack_name) {
                    return loaded.reader.read_with_kind(hash);
                }
            }
        }

        for loaded in &self.idxs {
            if let Ok(result) = loaded.reader.read_with_kind(hash) {
                return Ok(result);
            }
        }
        Err(StoreError::NotFound(format!("object {} not found in any known pack", hex::encode(hash))))
    }

    pub fn idx_path_for(&self, name: &str) -> PathBuf {
        self.pack_dir.join(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pack::writer::PackWriter;
    use tempfile::tempdir;

    #[test]
    fn exists_observes_packs_written_after_refresh() {
        let dir = tempdir().unwrap();
        let mut cache = ObjectCache::new(dir.path().to_path_buf());

        let h = {
            let mut writer = PackWriter::create(dir.path()).unwrap();
            let h = writer.add(&mut cache, shared::ObjectKind::Blob, b"payload").unwrap();
            writer.close().unwrap();
            h
        };

        assert!(cache.exists(&h, false).is_none(), "stale cache shouldn't see the new pack yet");
        cache.refresh().unwrap();
        assert!(cache.exists(&h, false).is_some());
    }

    #[test]
    fn midx_rebuild_triggers_at_threshold() {
        let dir = tempdir().unwrap();
        let mut cache = ObjectCache::new(dir.path().to_path_buf());

        for i in 0..MIDX_REBUILD_THRESHOLD {
            let mut writer = PackWriter::create(dir.path()).unwrap();
            writer.add(&mut cache, shared::ObjectKind::Blob, format!("blob-{i}").as_bytes()).unwrap();
            writer.close().unwrap();
            cache.refresh().unwrap();
        }

        assert!(cache.midx.is_some(), "midx should have been built once the threshold was hit");
    }
}
