//! Durable server metadata: current term and vote.
//!
//! Raft requires `(current_term, voted_for)` to survive crashes; losing a
//! vote can elect two leaders in one term. Writes go to a temp file which is
//! fsynced and renamed over the live file, so a crash leaves either the old
//! or the new metadata, never a torn mix.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::Result;

const META_FILE: &str = "meta";
const META_TMP: &str = "meta.tmp";

/// Persisted server metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub term: u64,
    pub voted_for: Option<String>,
}

/// Store for the metadata file.
pub struct MetaStore {
    dir: PathBuf,
}

impl MetaStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Loads the metadata, defaulting to term 0 / no vote when absent.
    pub fn load(&self) -> Result<Metadata> {
        let path = self.dir.join(META_FILE);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bincode::deserialize(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Metadata::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically replaces the metadata file.
    pub fn store(&self, meta: &Metadata) -> Result<()> {
        let tmp = self.dir.join(META_TMP);
        let bytes = bincode::serialize(meta)?;

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        file.write_all(&bytes)?;
        file.sync_all()?;
        drop(file);

        std::fs::rename(&tmp, self.dir.join(META_FILE))?;
        // Make the rename itself durable.
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_load_missing_returns_default() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let meta = store.load().unwrap();
        assert_eq!(meta, Metadata::default());
    }

    #[test]
    fn test_store_then_load() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        let meta = Metadata {
            term: 7,
            voted_for: Some("n2".to_string()),
        };
        store.store(&meta).unwrap();

        assert_eq!(store.load().unwrap(), meta);
    }

    #[test]
    fn test_overwrite_keeps_latest() {
        let dir = TempDir::new().unwrap();
        let store = MetaStore::open(dir.path()).unwrap();

        store
            .store(&Metadata {
                term: 1,
                voted_for: None,
            })
            .unwrap();
        store
            .store(&Metadata {
                term: 2,
                voted_for: Some("n3".to_string()),
            })
            .unwrap();

        let meta = store.load().unwrap();
        assert_eq!(meta.term, 2);
        assert_eq!(meta.voted_for.as_deref(), Some("n3"));
    }
}
