//! Boundary to the external cloud API.
//!
//! The snapshot store, instance control, remote shell and file transfer are
//! consumed through these traits. `memory` provides an in-process
//! implementation used by the tests and for dry runs.

pub mod memory;

use std::collections::BTreeMap;
use std::path::Path;

use crate::error::SnapError;

/// Flat string-keyed snapshot metadata.
pub type Metadata = BTreeMap<String, String>;

/// Reserved metadata key for the single-string label set by `tag`.
pub const TAG_KEY: &str = "tag";
/// Reserved metadata key for the JSON-encoded crash log.
pub const CRASH_HISTORY_KEY: &str = "crash_history";

// ── Data model ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotSpec {
    pub vcpus: u32,
    /// MB
    pub memory: u64,
    /// MB
    pub disk_size: u64,
}

/// An immutable point-in-time VM state held by the external store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    /// Client-chosen cache key, if any.
    pub digest: Option<String>,
    pub metadata: Metadata,
    pub spec: SnapshotSpec,
    /// Creation stamp assigned by the store, monotonically increasing.
    pub created: u64,
}

impl Snapshot {
    pub fn tag(&self) -> Option<&str> {
        self.metadata.get(TAG_KEY).map(String::as_str)
    }
}

/// Optional size overrides for booting an instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Resources {
    pub vcpus: Option<u32>,
    pub memory: Option<u64>,
    pub disk_size: Option<u64>,
}

impl Resources {
    /// Apply the overrides on top of `spec`.
    pub fn over(&self, spec: SnapshotSpec) -> SnapshotSpec {
        SnapshotSpec {
            vcpus: self.vcpus.unwrap_or(spec.vcpus),
            memory: self.memory.unwrap_or(spec.memory),
            disk_size: self.disk_size.unwrap_or(spec.disk_size),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshot {
    pub image_id: String,
    pub spec: SnapshotSpec,
    pub digest: Option<String>,
    pub metadata: Metadata,
}

/// Filter for `CloudApi::list_snapshots`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotQuery {
    All,
    Digest(String),
    /// Every listed key must be present with the same value.
    Metadata(Metadata),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TtlAction {
    Stop,
    Pause,
}

impl TtlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            TtlAction::Stop => "stop",
            TtlAction::Pause => "pause",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartInstance {
    pub snapshot_id: String,
    pub metadata: Metadata,
    pub ttl_seconds: Option<u64>,
    pub ttl_action: Option<TtlAction>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    File,
    Dir,
}

/// Non-blocking view of the exit state of a remote command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Running,
    Exited(i32),
    /// Transport went away without an exit status.
    Closed,
}

// ── Traits ──────────────────────────────────────────────────────────

/// A remote command session. All methods are non-blocking: they return
/// whatever is available right now.
pub trait ShellChannel: Send {
    /// Up to `max` bytes of pending stdout, `None` if nothing is ready.
    fn recv_stdout(&mut self, max: usize) -> Option<Vec<u8>>;
    /// Up to `max` bytes of pending stderr, `None` if nothing is ready.
    fn recv_stderr(&mut self, max: usize) -> Option<Vec<u8>>;
    fn status(&mut self) -> ChannelStatus;
}

/// A running instance handle. Handles are cheap to clone; cloning does not
/// start anything.
#[allow(async_fn_in_trait)] // trait is consumed generically, never boxed
pub trait RemoteInstance: Clone + Send + Sync + 'static {
    type Channel: ShellChannel;

    fn id(&self) -> &str;
    fn snapshot_id(&self) -> &str;

    async fn exec(&self, command: &str) -> Result<Self::Channel, SnapError>;

    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>, SnapError>;
    async fn mkdir(&self, path: &str) -> Result<(), SnapError>;
    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), SnapError>;
    async fn chmod(&self, remote: &str, mode: u32) -> Result<(), SnapError>;

    /// Finalize the current state into a new snapshot.
    async fn snapshot(&self, digest: Option<&str>) -> Result<Snapshot, SnapError>;
    async fn stop(&self) -> Result<(), SnapError>;

    async fn expose_http_service(&self, name: &str, port: u16) -> Result<String, SnapError>;
    async fn hide_http_service(&self, name: &str) -> Result<(), SnapError>;
}

/// Snapshot store and instance control.
#[allow(async_fn_in_trait)] // trait is consumed generically, never boxed
pub trait CloudApi: Send + Sync + 'static {
    type Instance: RemoteInstance;

    async fn create_snapshot(&self, request: CreateSnapshot) -> Result<Snapshot, SnapError>;
    /// Matching snapshots in store order (oldest first).
    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Snapshot>, SnapError>;
    async fn get_snapshot(&self, id: &str) -> Result<Snapshot, SnapError>;
    async fn delete_snapshot(&self, id: &str) -> Result<(), SnapError>;
    async fn set_snapshot_metadata(&self, id: &str, metadata: Metadata) -> Result<(), SnapError>;

    async fn start_instance(&self, request: StartInstance) -> Result<Self::Instance, SnapError>;
    async fn boot_instance(
        &self,
        snapshot_id: &str,
        resources: Resources,
    ) -> Result<Self::Instance, SnapError>;
}
