//! Segmented, append-only, indexed entry log.
//!
//! The log exposes a single exclusive [`LogWriter`] and any number of
//! [`LogReader`]s. Writers append and truncate under a lock; readers resolve
//! `(segment, offset)` pairs from a shared in-memory index and read with
//! their own file handles, so reads never hold the writer lock across I/O.
//!
//! Segments are rotated when the active segment would exceed its entry or
//! byte budget. On open every segment is scanned and CRC-validated; torn or
//! corrupt tails are truncated away.

use std::collections::HashMap;
use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use keel_observe::{Counter, Gauge, LogEvt, LogKind, Meter, NoopMeter, VizEvent};
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::entry::{encode_record, Entry, IndexedEntry, LogIndex, Term};
use crate::error::{Result, StorageError};
use crate::segment::{read_record_at, Segment, SegmentHeader};

/// Log store configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Directory holding the segment files.
    pub dir: PathBuf,
    /// Maximum entries per segment before rotation.
    pub max_segment_entries: u32,
    /// Maximum segment size in bytes before rotation.
    pub max_segment_bytes: u64,
    /// Node ID for observability events.
    pub node_id: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("log"),
            max_segment_entries: 128 * 1024,
            max_segment_bytes: 64 * 1024 * 1024,
            node_id: 0,
        }
    }
}

impl LogConfig {
    fn validate(&self) -> Result<()> {
        if self.max_segment_entries == 0 {
            return Err(StorageError::InvalidConfig(
                "max_segment_entries must be greater than 0".to_string(),
            ));
        }
        if self.max_segment_bytes < 64 * 1024 {
            return Err(StorageError::InvalidConfig(
                "max_segment_bytes should be at least 64KiB".to_string(),
            ));
        }
        Ok(())
    }
}

/// What recovery found while scanning the log directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryInfo {
    pub segments_scanned: u64,
    pub entries_recovered: u64,
    pub corruption_detected: bool,
}

/// Read-side view of one segment.
struct SegmentIndex {
    first_index: u64,
    path: PathBuf,
    offsets: Vec<u64>,
}

struct Shared {
    index: RwLock<Vec<SegmentIndex>>,
    last_index: AtomicU64,
    commit_index: AtomicU64,
}

struct WriterState {
    active: Segment,
}

struct Inner {
    config: LogConfig,
    shared: Shared,
    writer: Mutex<WriterState>,
    meter: Arc<dyn Meter>,
    appended: Arc<dyn Counter>,
    truncated: Arc<dyn Counter>,
    last_index_gauge: Arc<dyn Gauge>,
}

/// Segmented entry log. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct SegmentedLog {
    inner: Arc<Inner>,
}

fn segment_path(dir: &std::path::Path, first_index: u64) -> PathBuf {
    dir.join(format!("{first_index:020}.seg"))
}

impl SegmentedLog {
    /// Opens (or creates) a log in `config.dir`, recovering existing segments.
    pub fn open(config: LogConfig) -> Result<(Self, RecoveryInfo)> {
        Self::open_with_meter(config, Arc::new(NoopMeter))
    }

    /// Opens a log with a custom observability meter.
    pub fn open_with_meter(
        config: LogConfig,
        meter: Arc<dyn Meter>,
    ) -> Result<(Self, RecoveryInfo)> {
        config.validate()?;
        std::fs::create_dir_all(&config.dir)?;

        let mut paths: Vec<PathBuf> = std::fs::read_dir(&config.dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "seg"))
            .collect();
        paths.sort();

        let mut info = RecoveryInfo::default();
        let mut index = Vec::new();
        let mut active: Option<Segment> = None;
        let mut expected_first = 1u64;
        let mut paths = paths.into_iter();

        for path in paths.by_ref() {
            let (segment, scan) = Segment::open(path.clone())?;
            if segment.first_index().as_u64() != expected_first {
                tracing::warn!(
                    path = %path.display(),
                    first = %segment.first_index(),
                    expected = expected_first,
                    "segment out of sequence, discarding it and everything after"
                );
                info.corruption_detected = true;
                segment.delete()?;
                break;
            }

            info.segments_scanned += 1;
            info.entries_recovered += scan.entries;
            info.corruption_detected |= scan.corruption;
            expected_first = segment.first_index().as_u64() + segment.entry_count() as u64;

            index.push(SegmentIndex {
                first_index: segment.first_index().as_u64(),
                path: path.clone(),
                offsets: segment.offsets().to_vec(),
            });
            active = Some(segment);

            // A corrupt segment invalidates everything after it.
            if scan.corruption {
                break;
            }
        }

        // Anything left after a corrupt or out-of-sequence segment would
        // collide with future rotations.
        for orphan in paths {
            tracing::warn!(path = %orphan.display(), "removing orphaned segment");
            std::fs::remove_file(&orphan)?;
        }

        let active = match active {
            Some(segment) => segment,
            None => {
                let header = SegmentHeader {
                    first_index: LogIndex(1),
                    max_entries: config.max_segment_entries,
                    max_bytes: config.max_segment_bytes,
                };
                let path = segment_path(&config.dir, 1);
                let segment = Segment::create(path.clone(), header)?;
                index.push(SegmentIndex {
                    first_index: 1,
                    path,
                    offsets: Vec::new(),
                });
                segment
            }
        };

        let last_index = active
            .last_index()
            .map(|i| i.as_u64())
            .unwrap_or_else(|| active.first_index().as_u64().saturating_sub(1));

        meter.emit(VizEvent::Log(LogEvt {
            node: config.node_id,
            kind: LogKind::Recovered {
                entries: info.entries_recovered,
                corruption: info.corruption_detected,
            },
        }));

        let appended = meter.counter("log_entries_appended");
        let truncated = meter.counter("log_truncations");
        let last_index_gauge = meter.gauge("log_last_index");
        last_index_gauge.set(last_index);

        Ok((
            Self {
                inner: Arc::new(Inner {
                    config,
                    shared: Shared {
                        index: RwLock::new(index),
                        last_index: AtomicU64::new(last_index),
                        commit_index: AtomicU64::new(0),
                    },
                    writer: Mutex::new(WriterState { active }),
                    meter,
                    appended,
                    truncated,
                    last_index_gauge,
                }),
            },
            info,
        ))
    }

    /// The exclusive writer handle.
    pub fn writer(&self) -> LogWriter {
        LogWriter {
            log: self.clone(),
        }
    }

    /// A new shared reader with its own file handles.
    pub fn reader(&self) -> LogReader {
        LogReader {
            inner: self.inner.clone(),
            files: HashMap::new(),
        }
    }

    /// Index of the last entry, 0 when the log is empty.
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.inner.shared.last_index.load(Ordering::Acquire))
    }

    /// Highest index known to be committed. Tracked alongside the log so
    /// committed-only cursors can bound themselves without the writer lock.
    pub fn commit_index(&self) -> LogIndex {
        LogIndex(self.inner.shared.commit_index.load(Ordering::Acquire))
    }

    /// Advances the commit index. Never moves backwards.
    pub fn set_commit_index(&self, index: LogIndex) {
        self.inner
            .shared
            .commit_index
            .fetch_max(index.as_u64(), Ordering::AcqRel);
    }
}

/// Handle to the log's single writer. `lock()` yields the guard that
/// actually performs mutations; dropping the guard releases the lock.
pub struct LogWriter {
    log: SegmentedLog,
}

impl LogWriter {
    pub fn lock(&self) -> LogWriterGuard<'_> {
        LogWriterGuard {
            inner: &self.log.inner,
            state: self.log.inner.writer.lock(),
        }
    }

    pub fn last_index(&self) -> LogIndex {
        self.log.last_index()
    }
}

/// Exclusive access to the append/truncate side of the log.
pub struct LogWriterGuard<'a> {
    inner: &'a Inner,
    state: MutexGuard<'a, WriterState>,
}

impl LogWriterGuard<'_> {
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.inner.shared.last_index.load(Ordering::Acquire))
    }

    /// Appends an entry at the next index.
    pub fn append(&mut self, entry: Entry, term: Term) -> Result<IndexedEntry> {
        let index = self.last_index().next();
        self.append_at(IndexedEntry::new(index, term, entry))
    }

    /// Appends an entry honoring its provided index.
    ///
    /// Fails with [`StorageError::IndexGap`] unless the index is exactly
    /// `last_index() + 1`.
    pub fn append_indexed(&mut self, entry: IndexedEntry) -> Result<IndexedEntry> {
        let expected = self.last_index().next();
        if entry.index != expected {
            return Err(StorageError::IndexGap {
                index: entry.index.as_u64(),
                last: self.last_index().as_u64(),
            });
        }
        self.append_at(entry)
    }

    fn append_at(&mut self, mut entry: IndexedEntry) -> Result<IndexedEntry> {
        let frame = encode_record(&entry)?;
        entry.size = frame.len() as u32;

        if self.state.active.would_overflow(frame.len()) {
            self.rotate(entry.index)?;
        }

        let offset = self.state.active.append(&frame)?;

        {
            let mut index = self.inner.shared.index.write();
            index
                .last_mut()
                .expect("log always has an active segment")
                .offsets
                .push(offset);
        }
        self.inner
            .shared
            .last_index
            .store(entry.index.as_u64(), Ordering::Release);
        self.inner.appended.inc(1);
        self.inner.last_index_gauge.set(entry.index.as_u64());

        Ok(entry)
    }

    fn rotate(&mut self, next_index: LogIndex) -> Result<()> {
        self.state.active.sync()?;
        self.inner.meter.emit(VizEvent::Log(LogEvt {
            node: self.inner.config.node_id,
            kind: LogKind::SegmentSealed {
                first_index: self.state.active.first_index().as_u64(),
                entries: self.state.active.entry_count() as u64,
            },
        }));

        let header = SegmentHeader {
            first_index: next_index,
            max_entries: self.inner.config.max_segment_entries,
            max_bytes: self.inner.config.max_segment_bytes,
        };
        let path = segment_path(&self.inner.config.dir, next_index.as_u64());
        let segment = Segment::create(path.clone(), header)?;

        self.inner.shared.index.write().push(SegmentIndex {
            first_index: next_index.as_u64(),
            path,
            offsets: Vec::new(),
        });
        self.state.active = segment;

        self.inner.meter.emit(VizEvent::Log(LogEvt {
            node: self.inner.config.node_id,
            kind: LogKind::SegmentCreated {
                first_index: next_index.as_u64(),
            },
        }));
        Ok(())
    }

    /// Discards all entries with index greater than `index`.
    ///
    /// After `truncate(k)`, `last_index()` is `k` and the next append is
    /// assigned `k + 1`. `truncate(LogIndex::ZERO)` empties the log.
    pub fn truncate(&mut self, index: LogIndex) -> Result<()> {
        if index >= self.last_index() {
            return Ok(());
        }

        let mut shared = self.inner.shared.index.write();

        // Drop whole segments that lie entirely above the truncation point.
        while let Some(last) = shared.last() {
            if last.first_index > index.as_u64() && shared.len() > 1 {
                let removed = shared.pop().expect("checked non-empty");
                std::fs::remove_file(&removed.path)?;
            } else {
                break;
            }
        }

        let tail = shared.last_mut().expect("log always has a segment");
        let tail_path = tail.path.clone();
        let tail_first = tail.first_index;

        if tail_first > index.as_u64() {
            // Even the oldest surviving segment starts above the target:
            // wipe it and restart the log at index + 1.
            std::fs::remove_file(&tail_path)?;
            shared.pop();

            let first = index.next();
            let header = SegmentHeader {
                first_index: first,
                max_entries: self.inner.config.max_segment_entries,
                max_bytes: self.inner.config.max_segment_bytes,
            };
            let path = segment_path(&self.inner.config.dir, first.as_u64());
            self.state.active = Segment::create(path.clone(), header)?;
            shared.push(SegmentIndex {
                first_index: first.as_u64(),
                path,
                offsets: Vec::new(),
            });
        } else {
            let keep = (index.as_u64() - tail_first + 1) as usize;

            if self.state.active.path() != tail_path.as_path() {
                // The active segment was removed above; reopen the survivor
                // for appending.
                let (segment, _) = Segment::open(tail_path)?;
                self.state.active = segment;
            }
            self.state.active.truncate_entries(keep)?;
            tail.offsets.truncate(keep);
        }

        self.inner
            .shared
            .last_index
            .store(index.as_u64(), Ordering::Release);
        drop(shared);
        self.inner.truncated.inc(1);
        self.inner.last_index_gauge.set(index.as_u64());

        self.inner.meter.emit(VizEvent::Log(LogEvt {
            node: self.inner.config.node_id,
            kind: LogKind::Truncated {
                to: index.as_u64(),
            },
        }));
        Ok(())
    }
}

/// Shared read access to the log.
///
/// Each reader owns its file handles; lookups take the shared index lock
/// only long enough to resolve `(segment, offset)`.
pub struct LogReader {
    inner: Arc<Inner>,
    files: HashMap<u64, File>,
}

impl LogReader {
    pub fn last_index(&self) -> LogIndex {
        LogIndex(self.inner.shared.last_index.load(Ordering::Acquire))
    }

    pub fn commit_index(&self) -> LogIndex {
        LogIndex(self.inner.shared.commit_index.load(Ordering::Acquire))
    }

    /// Returns the entry at `index`, or `None` if it is not in the log.
    pub fn get(&mut self, index: LogIndex) -> Result<Option<IndexedEntry>> {
        if index == LogIndex::ZERO || index > self.last_index() {
            return Ok(None);
        }

        let (segment_first, path, offset) = {
            let shared = self.inner.shared.index.read();
            let pos = shared.partition_point(|s| s.first_index <= index.as_u64());
            if pos == 0 {
                return Ok(None);
            }
            let segment = &shared[pos - 1];
            let entry_pos = (index.as_u64() - segment.first_index) as usize;
            match segment.offsets.get(entry_pos) {
                Some(&offset) => (segment.first_index, segment.path.clone(), offset),
                None => return Ok(None),
            }
        };

        let entry = self.read_at(segment_first, &path, offset)?;
        if entry.index != index {
            // The cached handle can go stale when a segment is truncated and
            // recreated underneath us; reopen and retry once.
            self.files.remove(&segment_first);
            let entry = self.read_at(segment_first, &path, offset)?;
            if entry.index != index {
                return Err(StorageError::Io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("log returned {} for requested {}", entry.index, index),
                )));
            }
            return Ok(Some(entry));
        }
        Ok(Some(entry))
    }

    fn read_at(
        &mut self,
        segment_first: u64,
        path: &std::path::Path,
        offset: u64,
    ) -> Result<IndexedEntry> {
        if !self.files.contains_key(&segment_first) {
            self.files.insert(segment_first, File::open(path)?);
        }
        let file = self
            .files
            .get_mut(&segment_first)
            .expect("inserted above");
        read_record_at(file, offset)
    }

    /// The term of the last entry, `Term::ZERO` for an empty log.
    pub fn last_term(&mut self) -> Result<Term> {
        let last = self.last_index();
        if last == LogIndex::ZERO {
            return Ok(Term::ZERO);
        }
        Ok(self.get(last)?.map(|e| e.term).unwrap_or(Term::ZERO))
    }

    /// A forward cursor starting at `from` (inclusive).
    pub fn cursor(self, from: LogIndex) -> LogCursor {
        LogCursor {
            reader: self,
            next: if from == LogIndex::ZERO {
                LogIndex(1)
            } else {
                from
            },
        }
    }
}

/// Forward iteration over log entries.
pub struct LogCursor {
    reader: LogReader,
    next: LogIndex,
}

impl LogCursor {
    /// Returns the next entry, or `None` past the end of the log.
    pub fn next_entry(&mut self) -> Result<Option<IndexedEntry>> {
        match self.reader.get(self.next)? {
            Some(entry) => {
                self.next = self.next.next();
                Ok(Some(entry))
            }
            None => Ok(None),
        }
    }

    /// Repositions the cursor.
    pub fn seek(&mut self, index: LogIndex) {
        self.next = index;
    }
}
