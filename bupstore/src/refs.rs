//! Reference store (spec.md §3, "Reference"): named pointers to a commit hash under
//! `refs/heads/<name>`, updated via compare-and-set.

use std::path::{Path, PathBuf};

use shared::Hash;

use crate::error::{Result, StoreError};

pub struct RefStore {
    dir: PathBuf,
}

impl RefStore {
    pub fn new(repo_dir: &Path) -> Self {
        Self { dir: repo_dir.join(shared::REFS_DIR) }
    }

    fn path_for(&self, name: &str) -> Result<PathBuf> {
        if name.is_empty() || name.contains('/') || name.contains("..") {
            return Err(StoreError::Usage(format!("invalid ref name: {name}")));
        }
        Ok(self.dir.join(name))
    }

    /// `read-ref <name>` (spec.md §4.8): a snapshot read. `None` if the ref doesn't
    /// exist.
    pub fn read(&self, name: &str) -> Result<Option<Hash>> {
        let path = self.path_for(name)?;
        match std::fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(parse_ref_contents(&contents, &path)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&path, e)),
        }
    }

    /// `update-ref <name> <new-hex> <old-hex>` (spec.md §4.8): compare-and-set. Fails
    /// with [`StoreError::RefConflict`] if the current value doesn't match `expected`.
    pub fn update(&self, name: &str, expected: Option<Hash>, new: Hash) -> Result<()> {
        let path = self.path_for(name)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;

        let current = self.read(name)?;
        if current != expected {
            return Err(StoreError::RefConflict {
                name: name.to_string(),
                expected: expected.unwrap_or(shared::ZERO_HASH),
                found: current,
            });
        }

        let tmp = tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| StoreError::io(&self.dir, e))?;
        std::fs::write(tmp.path(), format!("{}\n", hex::encode(new)))
            .map_err(|e| StoreError::io(&self.dir, e))?;
        tmp.persist(&path).map_err(|e| StoreError::io(&path, e.error))?;
        Ok(())
    }

    /// Supplemented `list-refs [prefix]` control command.
    pub fn list(&self, prefix: Option<&str>) -> Result<Vec<(String, Hash)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&self.dir).map_err(|e| StoreError::io(&self.dir, e))? {
            let entry = entry.map_err(|e| StoreError::io(&self.dir, e))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if prefix.map(|p| name.starts_with(p)).unwrap_or(true) {
                if let Some(hash) = self.read(&name)? {
                    out.push((name, hash));
                }
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }
}

fn parse_ref_contents(contents: &str, path: &Path) -> Result<Hash> {
    let trimmed = contents.trim();
    let bytes = hex::decode(trimmed)
        .map_err(|_| StoreError::Corruption(format!("{}: not valid hex", path.display())))?;
    if bytes.len() != shared::HASH_SIZE {
        return Err(StoreError::Corruption(format!("{}: expected {} hex bytes", path.display(), shared::HASH_SIZE)));
    }
    let mut hash = [0u8; shared::HASH_SIZE];
    hash.copy_from_slice(&bytes);
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cas_conflict_matches_scenario() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());

        let h0 = [0u8; shared::HASH_SIZE];
        let h1 = [1u8; shared::HASH_SIZE];
        let h2 = [2u8; shared::HASH_SIZE];

        refs.update("x", None, h0).unwrap();
        assert_eq!(refs.read("x").unwrap(), Some(h0));

        // Driver A: update x h0 -> h1, succeeds.
        refs.update("x", Some(h0), h1).unwrap();

        // Driver B: update x h0 -> h2, must fail since the current value is now h1.
        let err = refs.update("x", Some(h0), h2);
        assert!(err.is_err());
        assert_eq!(refs.read("x").unwrap(), Some(h1));
    }

    #[test]
    fn list_refs_returns_sorted_names() {
        let dir = tempfile::tempdir().unwrap();
        let refs = RefStore::new(dir.path());
        refs.update("b", None, [2u8; shared::HASH_SIZE]).unwrap();
        refs.update("a", None, [1u8; shared::HASH_SIZE]).unwrap();

        let listed = refs.list(None).unwrap();
        assert_eq!(listed.iter().map(|(n, _)| n.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
