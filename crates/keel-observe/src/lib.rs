//! keel-observe: vendor-neutral observability ABI.
//!
//! The storage and consensus crates depend only on these traits and event
//! types; metric backends and visualization sinks live elsewhere. Payload
//! bytes are never included in events.

use std::sync::Arc;

/// A monotonically increasing count.
pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}

/// A point-in-time value.
pub trait Gauge: Send + Sync {
    fn set(&self, v: u64);
}

/// Instrument factory plus a typed event sink.
pub trait Meter: Send + Sync + 'static {
    fn counter(&self, name: &'static str) -> Arc<dyn Counter>;
    fn gauge(&self, name: &'static str) -> Arc<dyn Gauge>;
    fn emit(&self, event: VizEvent);
}

struct Noop;

impl Counter for Noop {
    fn inc(&self, _v: u64) {}
}

impl Gauge for Noop {
    fn set(&self, _v: u64) {}
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;

impl Meter for NoopMeter {
    fn counter(&self, _name: &'static str) -> Arc<dyn Counter> {
        Arc::new(Noop)
    }

    fn gauge(&self, _name: &'static str) -> Arc<dyn Gauge> {
        Arc::new(Noop)
    }

    fn emit(&self, _event: VizEvent) {}
}

/// Typed events for live visualization.
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum VizEvent {
    Log(LogEvt),
    Snapshot(SnapshotEvt),
    Server(ServerEvt),
}

/// Log store activity.
#[derive(Clone, Debug)]
pub struct LogEvt {
    pub node: u32,
    pub kind: LogKind,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum LogKind {
    /// A fresh segment was created starting at the given index.
    SegmentCreated { first_index: u64 },
    /// The active segment filled up and was sealed.
    SegmentSealed { first_index: u64, entries: u64 },
    /// Entries above the given index were discarded.
    Truncated { to: u64 },
    /// Recovery finished scanning the log directory.
    Recovered { entries: u64, corruption: bool },
}

/// Snapshot store activity.
#[derive(Clone, Debug)]
pub struct SnapshotEvt {
    pub node: u32,
    pub id: u64,
    pub index: u64,
    pub kind: SnapshotKind,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum SnapshotKind {
    Created,
    Completed,
    Deleted,
}

/// Server role and commit activity.
#[derive(Clone, Debug)]
pub struct ServerEvt {
    pub node: u32,
    pub term: u64,
    pub kind: ServerKind,
}

#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum ServerKind {
    /// The server changed role.
    RoleChanged { role: &'static str },
    /// The commit index advanced.
    CommitAdvanced { index: u64 },
    /// This server won an election.
    LeaderElected,
}
