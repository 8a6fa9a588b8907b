//! Snapshot store.
//!
//! Snapshots are keyed by `(snapshot_id, snapshot_index)` and move through a
//! staged lifecycle: `Pending` (bytes accumulate in a temp file) →
//! `Persisted` (temp file fsynced) → `Complete` (renamed into place and
//! visible to readers). Any state can drop to `Deleted` on abort. Only one
//! snapshot per id is complete at a time; completing a newer index removes
//! the superseded file.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use keel_observe::{Meter, NoopMeter, SnapshotEvt, SnapshotKind, VizEvent};
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, StorageError};

/// Lifecycle state of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotStatus {
    Pending,
    Persisted,
    Complete,
    Deleted,
}

struct StoreInner {
    dir: PathBuf,
    node_id: u32,
    meter: Arc<dyn Meter>,
    completed: RwLock<HashMap<u64, Snapshot>>,
}

impl StoreInner {
    fn tmp_path(&self, id: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{id}-{index}.snapshot.tmp"))
    }

    fn final_path(&self, id: u64, index: u64) -> PathBuf {
        self.dir.join(format!("{id}-{index}.snapshot"))
    }
}

/// Content-addressed snapshot store.
#[derive(Clone)]
pub struct SnapshotStore {
    inner: Arc<StoreInner>,
}

impl SnapshotStore {
    /// Opens the store, indexing completed snapshots already on disk.
    /// Stale temp files and superseded snapshots are removed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_meter(dir, Arc::new(NoopMeter), 0)
    }

    pub fn open_with_meter(
        dir: impl Into<PathBuf>,
        meter: Arc<dyn Meter>,
        node_id: u32,
    ) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;

        let inner = Arc::new(StoreInner {
            dir: dir.clone(),
            node_id,
            meter,
            completed: RwLock::new(HashMap::new()),
        });

        let mut latest: HashMap<u64, u64> = HashMap::new();
        let mut stale: Vec<PathBuf> = Vec::new();

        for dirent in std::fs::read_dir(&dir)? {
            let path = dirent?.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if name.ends_with(".snapshot.tmp") {
                // An install that never completed.
                stale.push(path);
                continue;
            }
            let Some(stem) = name.strip_suffix(".snapshot") else {
                continue;
            };
            let Some((id, index)) = parse_snapshot_name(stem) else {
                tracing::warn!(path = %path.display(), "unrecognized snapshot file name");
                continue;
            };
            match latest.get(&id) {
                Some(&existing) if existing >= index => stale.push(path),
                _ => {
                    if let Some(old) = latest.insert(id, index) {
                        stale.push(inner.final_path(id, old));
                    }
                }
            }
        }

        for path in stale {
            tracing::debug!(path = %path.display(), "removing stale snapshot file");
            let _ = std::fs::remove_file(&path);
        }

        {
            let mut completed = inner.completed.write();
            for (id, index) in latest {
                completed.insert(
                    id,
                    Snapshot {
                        inner: Arc::new(SnapshotInner {
                            id,
                            index,
                            store: Arc::downgrade(&inner),
                            status: Mutex::new(SnapshotStatus::Complete),
                        }),
                    },
                );
            }
        }

        Ok(Self { inner })
    }

    /// Creates a new pending snapshot for `(id, index)`.
    pub fn create_snapshot(&self, id: u64, index: u64) -> Result<Snapshot> {
        let tmp = self.inner.tmp_path(id, index);
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;

        self.inner.meter.emit(VizEvent::Snapshot(SnapshotEvt {
            node: self.inner.node_id,
            id,
            index,
            kind: SnapshotKind::Created,
        }));

        Ok(Snapshot {
            inner: Arc::new(SnapshotInner {
                id,
                index,
                store: Arc::downgrade(&self.inner),
                status: Mutex::new(SnapshotStatus::Pending),
            }),
        })
    }

    /// The current complete snapshot for `id`, if any.
    pub fn get_snapshot(&self, id: u64) -> Option<Snapshot> {
        self.inner.completed.read().get(&id).cloned()
    }
}

fn parse_snapshot_name(stem: &str) -> Option<(u64, u64)> {
    let (id, index) = stem.split_once('-')?;
    Some((id.parse().ok()?, index.parse().ok()?))
}

struct SnapshotInner {
    id: u64,
    index: u64,
    store: Weak<StoreInner>,
    status: Mutex<SnapshotStatus>,
}

/// A snapshot at a particular `(id, index)`. Cheap to clone.
#[derive(Clone)]
pub struct Snapshot {
    inner: Arc<SnapshotInner>,
}

impl Snapshot {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn index(&self) -> u64 {
        self.inner.index
    }

    pub fn status(&self) -> SnapshotStatus {
        *self.inner.status.lock()
    }

    fn store(&self) -> Result<Arc<StoreInner>> {
        self.inner.store.upgrade().ok_or_else(|| {
            StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "snapshot store closed",
            ))
        })
    }

    fn expect_status(&self, expected: SnapshotStatus) -> Result<()> {
        let actual = *self.inner.status.lock();
        if actual != expected {
            return Err(StorageError::SnapshotState {
                id: self.inner.id,
                index: self.inner.index,
                actual,
                expected,
            });
        }
        Ok(())
    }

    /// Opens a scoped writer appending to the pending snapshot. The file
    /// handle is released when the writer is dropped.
    pub fn writer(&self) -> Result<SnapshotWriter> {
        self.expect_status(SnapshotStatus::Pending)?;
        let store = self.store()?;
        let file = OpenOptions::new()
            .append(true)
            .open(store.tmp_path(self.inner.id, self.inner.index))?;
        Ok(SnapshotWriter { file })
    }

    /// Makes the staged bytes durable.
    pub fn persist(&self) -> Result<()> {
        self.expect_status(SnapshotStatus::Pending)?;
        let store = self.store()?;
        let file = File::open(store.tmp_path(self.inner.id, self.inner.index))?;
        file.sync_all()?;
        *self.inner.status.lock() = SnapshotStatus::Persisted;
        Ok(())
    }

    /// Atomically promotes the snapshot to the canonical one for its id.
    /// Superseded complete snapshots are removed.
    pub fn complete(&self) -> Result<()> {
        self.expect_status(SnapshotStatus::Persisted)?;
        let store = self.store()?;

        let tmp = store.tmp_path(self.inner.id, self.inner.index);
        let fin = store.final_path(self.inner.id, self.inner.index);
        std::fs::rename(&tmp, &fin)?;
        File::open(&store.dir)?.sync_all()?;

        *self.inner.status.lock() = SnapshotStatus::Complete;

        let superseded = store
            .completed
            .write()
            .insert(self.inner.id, self.clone());
        if let Some(old) = superseded {
            if old.index() != self.index() {
                let _ = std::fs::remove_file(store.final_path(old.id(), old.index()));
                *old.inner.status.lock() = SnapshotStatus::Deleted;
            }
        }

        store.meter.emit(VizEvent::Snapshot(SnapshotEvt {
            node: store.node_id,
            id: self.inner.id,
            index: self.inner.index,
            kind: SnapshotKind::Completed,
        }));
        Ok(())
    }

    /// Releases any resources held for this snapshot handle. Writers are
    /// scoped, so this exists for lifecycle symmetry with `delete`.
    pub fn close(&self) {}

    /// Removes the snapshot's files and marks it deleted.
    pub fn delete(&self) -> Result<()> {
        let store = self.store()?;
        let _ = std::fs::remove_file(store.tmp_path(self.inner.id, self.inner.index));
        let _ = std::fs::remove_file(store.final_path(self.inner.id, self.inner.index));

        let mut completed = store.completed.write();
        if let Some(current) = completed.get(&self.inner.id) {
            if current.index() == self.inner.index {
                completed.remove(&self.inner.id);
            }
        }
        drop(completed);

        *self.inner.status.lock() = SnapshotStatus::Deleted;
        store.meter.emit(VizEvent::Snapshot(SnapshotEvt {
            node: store.node_id,
            id: self.inner.id,
            index: self.inner.index,
            kind: SnapshotKind::Deleted,
        }));
        Ok(())
    }

    /// Reads the complete snapshot's bytes.
    pub fn read(&self) -> Result<Bytes> {
        self.expect_status(SnapshotStatus::Complete)?;
        let store = self.store()?;
        let mut buf = Vec::new();
        File::open(store.final_path(self.inner.id, self.inner.index))?
            .read_to_end(&mut buf)?;
        Ok(Bytes::from(buf))
    }
}

/// Scoped append handle for a pending snapshot.
pub struct SnapshotWriter {
    file: File,
}

impl SnapshotWriter {
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        self.file.write_all(data)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lifecycle_pending_to_complete() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let snapshot = store.create_snapshot(42, 100).unwrap();
        assert_eq!(snapshot.status(), SnapshotStatus::Pending);
        assert!(store.get_snapshot(42).is_none());

        {
            let mut writer = snapshot.writer().unwrap();
            writer.write(&[1, 2]).unwrap();
            writer.write(&[3]).unwrap();
        }

        snapshot.persist().unwrap();
        assert_eq!(snapshot.status(), SnapshotStatus::Persisted);

        snapshot.complete().unwrap();
        assert_eq!(snapshot.status(), SnapshotStatus::Complete);

        let current = store.get_snapshot(42).unwrap();
        assert_eq!(current.index(), 100);
        assert_eq!(current.read().unwrap(), Bytes::from_static(&[1, 2, 3]));
    }

    #[test]
    fn test_complete_requires_persist() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let snapshot = store.create_snapshot(1, 10).unwrap();
        assert!(matches!(
            snapshot.complete(),
            Err(StorageError::SnapshotState { .. })
        ));
    }

    #[test]
    fn test_complete_supersedes_lower_index() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let old = store.create_snapshot(7, 50).unwrap();
        old.writer().unwrap().write(b"old").unwrap();
        old.persist().unwrap();
        old.complete().unwrap();

        let new = store.create_snapshot(7, 80).unwrap();
        new.writer().unwrap().write(b"new").unwrap();
        new.persist().unwrap();
        new.complete().unwrap();

        assert_eq!(old.status(), SnapshotStatus::Deleted);
        let current = store.get_snapshot(7).unwrap();
        assert_eq!(current.index(), 80);
        assert_eq!(current.read().unwrap(), Bytes::from_static(b"new"));
        assert!(!dir.path().join("7-50.snapshot").exists());
    }

    #[test]
    fn test_delete_pending_removes_staging() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::open(dir.path()).unwrap();

        let snapshot = store.create_snapshot(3, 30).unwrap();
        snapshot.writer().unwrap().write(b"partial").unwrap();
        assert!(dir.path().join("3-30.snapshot.tmp").exists());

        snapshot.close();
        snapshot.delete().unwrap();
        assert_eq!(snapshot.status(), SnapshotStatus::Deleted);
        assert!(!dir.path().join("3-30.snapshot.tmp").exists());
    }

    #[test]
    fn test_reopen_indexes_completed_and_drops_stale() {
        let dir = TempDir::new().unwrap();
        {
            let store = SnapshotStore::open(dir.path()).unwrap();

            let done = store.create_snapshot(9, 200).unwrap();
            done.writer().unwrap().write(b"state").unwrap();
            done.persist().unwrap();
            done.complete().unwrap();

            // Abandoned install.
            let pending = store.create_snapshot(9, 300).unwrap();
            pending.writer().unwrap().write(b"half").unwrap();
        }

        let store = SnapshotStore::open(dir.path()).unwrap();
        let current = store.get_snapshot(9).unwrap();
        assert_eq!(current.index(), 200);
        assert!(!dir.path().join("9-300.snapshot.tmp").exists());
    }
}
