//! In-process implementation of the cloud API.
//!
//! Snapshots carry a small remote filesystem image; instances copy it on
//! start and hand a copy back on `snapshot()`. Command output is produced by
//! a caller-installed handler so layer behaviour can be exercised without a
//! real VM. Counters expose how much remote work actually happened.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{
    ChannelStatus, CloudApi, CreateSnapshot, Metadata, RemoteInstance, RemoteKind, Resources,
    ShellChannel, Snapshot, SnapshotQuery, SnapshotSpec, StartInstance,
};
use crate::error::SnapError;

/// A file or directory in the simulated remote filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    Dir,
    File { contents: Vec<u8>, mode: u32 },
}

pub type RemoteFs = BTreeMap<String, RemoteEntry>;

#[derive(Debug, Clone)]
pub enum ScriptedOutput {
    Stdout(String),
    Stderr(String),
}

/// What a command does when executed on a memory instance.
#[derive(Debug, Clone)]
pub struct ScriptedRun {
    pub output: Vec<ScriptedOutput>,
    /// `None` simulates a dropped connection.
    pub exit: Option<i32>,
}

impl ScriptedRun {
    pub fn exit(code: i32) -> Self {
        Self {
            output: Vec::new(),
            exit: Some(code),
        }
    }

    pub fn dropped() -> Self {
        Self {
            output: Vec::new(),
            exit: None,
        }
    }

    pub fn stdout(mut self, text: impl Into<String>) -> Self {
        self.output.push(ScriptedOutput::Stdout(text.into()));
        self
    }

    pub fn stderr(mut self, text: impl Into<String>) -> Self {
        self.output.push(ScriptedOutput::Stderr(text.into()));
        self
    }
}

type CommandHandler = Arc<dyn Fn(&str) -> ScriptedRun + Send + Sync>;

/// Counters of remote work performed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CloudStats {
    /// Instances obtained through `start_instance` or `boot_instance`.
    pub instances_started: usize,
    pub instances_booted: usize,
    pub instances_stopped: usize,
    pub commands_run: usize,
    pub snapshots_created: usize,
    pub snapshots_deleted: usize,
}

struct StoredSnapshot {
    snapshot: Snapshot,
    files: RemoteFs,
}

struct InstanceState {
    snapshot_id: String,
    spec: SnapshotSpec,
    files: RemoteFs,
    running: bool,
    services: BTreeMap<String, u16>,
    metadata: Metadata,
}

#[derive(Default)]
struct CloudState {
    snapshots: Vec<StoredSnapshot>,
    instances: BTreeMap<String, InstanceState>,
    next_id: u64,
    clock: u64,
    handler: Option<CommandHandler>,
    failing: BTreeSet<String>,
    commands: Vec<String>,
    stats: CloudStats,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{prefix}_{:04}", self.next_id)
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn check(&self, operation: &str) -> Result<(), SnapError> {
        if self.failing.contains(operation) {
            return Err(SnapError::api(operation, "injected failure"));
        }
        Ok(())
    }

    fn stored(&self, id: &str) -> Result<&StoredSnapshot, SnapError> {
        self.snapshots
            .iter()
            .find(|s| s.snapshot.id == id)
            .ok_or_else(|| SnapError::api("get_snapshot", format!("snapshot {id} not found")))
    }

    fn instance(&mut self, id: &str) -> Result<&mut InstanceState, SnapError> {
        self.instances
            .get_mut(id)
            .ok_or_else(|| SnapError::api("instance", format!("instance {id} not found")))
    }

    fn running_instance(&mut self, id: &str) -> Result<&mut InstanceState, SnapError> {
        let inst = self.instance(id)?;
        if !inst.running {
            return Err(SnapError::api("instance", format!("instance {id} is stopped")));
        }
        Ok(inst)
    }

    fn launch(&mut self, snapshot_id: &str, resources: Resources, metadata: Metadata) -> Result<String, SnapError> {
        let (spec, files) = {
            let stored = self.stored(snapshot_id)?;
            (resources.over(stored.snapshot.spec), stored.files.clone())
        };
        let id = self.next_id("morphvm");
        self.instances.insert(
            id.clone(),
            InstanceState {
                snapshot_id: snapshot_id.to_string(),
                spec,
                files,
                running: true,
                services: BTreeMap::new(),
                metadata,
            },
        );
        self.stats.instances_started += 1;
        Ok(id)
    }
}

/// Cheaply cloneable handle to an in-process cloud.
#[derive(Clone, Default)]
pub struct MemoryCloud {
    state: Arc<Mutex<CloudState>>,
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        // A panic while holding the lock only happens in a failing test;
        // the state is still usable for reporting.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Install the function deciding each command's output and exit code.
    /// Without a handler every command exits 0 silently.
    pub fn on_command<F>(&self, handler: F)
    where
        F: Fn(&str) -> ScriptedRun + Send + Sync + 'static,
    {
        self.lock().handler = Some(Arc::new(handler));
    }

    /// Make every later call of `operation` fail with an API error.
    pub fn fail(&self, operation: &str) {
        self.lock().failing.insert(operation.to_string());
    }

    pub fn stats(&self) -> CloudStats {
        self.lock().stats
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.lock().commands.clone()
    }

    /// Filesystem image stored with a snapshot.
    pub fn snapshot_files(&self, snapshot_id: &str) -> Option<RemoteFs> {
        let state = self.lock();
        state
            .snapshots
            .iter()
            .find(|s| s.snapshot.id == snapshot_id)
            .map(|s| s.files.clone())
    }

    /// Seed a file into a snapshot's filesystem image.
    pub fn put_snapshot_entry(&self, snapshot_id: &str, path: &str, entry: RemoteEntry) {
        let mut state = self.lock();
        if let Some(stored) = state
            .snapshots
            .iter_mut()
            .find(|s| s.snapshot.id == snapshot_id)
        {
            stored.files.insert(normalize(path), entry);
        }
    }

    pub fn running_instances(&self) -> Vec<String> {
        let state = self.lock();
        state
            .instances
            .iter()
            .filter(|(_, inst)| inst.running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Metadata an instance was started with.
    pub fn instance_metadata(&self, instance_id: &str) -> Option<Metadata> {
        self.lock()
            .instances
            .get(instance_id)
            .map(|inst| inst.metadata.clone())
    }

    fn handle(&self, id: &str, snapshot_id: &str) -> MemoryInstance {
        MemoryInstance {
            cloud: self.clone(),
            id: id.to_string(),
            snapshot_id: snapshot_id.to_string(),
        }
    }
}

fn normalize(path: &str) -> String {
    if path == "/" {
        return path.to_string();
    }
    path.trim_end_matches('/').to_string()
}

/// Parent directory that must exist before `path` can be created.
/// `None` for top-level relative names and for children of `/`.
fn required_parent(path: &str) -> Option<&str> {
    match path.rfind('/') {
        None | Some(0) => None,
        Some(i) => Some(&path[..i]),
    }
}

fn parent_exists(files: &RemoteFs, path: &str) -> bool {
    match required_parent(path) {
        None => true,
        Some(parent) => matches!(files.get(parent), Some(RemoteEntry::Dir)),
    }
}

impl CloudApi for MemoryCloud {
    type Instance = MemoryInstance;

    async fn create_snapshot(&self, request: CreateSnapshot) -> Result<Snapshot, SnapError> {
        let mut state = self.lock();
        state.check("create_snapshot")?;
        let id = state.next_id("snapshot");
        let created = state.tick();
        let snapshot = Snapshot {
            id,
            digest: request.digest,
            metadata: request.metadata,
            spec: request.spec,
            created,
        };
        state.snapshots.push(StoredSnapshot {
            snapshot: snapshot.clone(),
            files: RemoteFs::new(),
        });
        state.stats.snapshots_created += 1;
        Ok(snapshot)
    }

    async fn list_snapshots(&self, query: &SnapshotQuery) -> Result<Vec<Snapshot>, SnapError> {
        let state = self.lock();
        state.check("list_snapshots")?;
        Ok(state
            .snapshots
            .iter()
            .map(|s| &s.snapshot)
            .filter(|s| match query {
                SnapshotQuery::All => true,
                SnapshotQuery::Digest(digest) => s.digest.as_deref() == Some(digest.as_str()),
                SnapshotQuery::Metadata(wanted) => wanted
                    .iter()
                    .all(|(k, v)| s.metadata.get(k) == Some(v)),
            })
            .cloned()
            .collect())
    }

    async fn get_snapshot(&self, id: &str) -> Result<Snapshot, SnapError> {
        let state = self.lock();
        state.check("get_snapshot")?;
        Ok(state.stored(id)?.snapshot.clone())
    }

    async fn delete_snapshot(&self, id: &str) -> Result<(), SnapError> {
        let mut state = self.lock();
        state.check("delete_snapshot")?;
        let before = state.snapshots.len();
        state.snapshots.retain(|s| s.snapshot.id != id);
        if state.snapshots.len() == before {
            return Err(SnapError::api("delete_snapshot", format!("snapshot {id} not found")));
        }
        state.stats.snapshots_deleted += 1;
        Ok(())
    }

    async fn set_snapshot_metadata(&self, id: &str, metadata: Metadata) -> Result<(), SnapError> {
        let mut state = self.lock();
        state.check("set_snapshot_metadata")?;
        let stored = state
            .snapshots
            .iter_mut()
            .find(|s| s.snapshot.id == id)
            .ok_or_else(|| SnapError::api("set_snapshot_metadata", format!("snapshot {id} not found")))?;
        stored.snapshot.metadata = metadata;
        Ok(())
    }

    async fn start_instance(&self, request: StartInstance) -> Result<MemoryInstance, SnapError> {
        let mut state = self.lock();
        state.check("start_instance")?;
        let id = state.launch(&request.snapshot_id, Resources::default(), request.metadata)?;
        Ok(self.handle(&id, &request.snapshot_id))
    }

    async fn boot_instance(
        &self,
        snapshot_id: &str,
        resources: Resources,
    ) -> Result<MemoryInstance, SnapError> {
        let mut state = self.lock();
        state.check("boot_instance")?;
        let id = state.launch(snapshot_id, resources, Metadata::new())?;
        state.stats.instances_booted += 1;
        Ok(self.handle(&id, snapshot_id))
    }
}

/// Handle to an instance of a [`MemoryCloud`].
#[derive(Clone)]
pub struct MemoryInstance {
    cloud: MemoryCloud,
    id: String,
    snapshot_id: String,
}

impl MemoryInstance {
    /// Current filesystem of the running instance.
    pub fn files(&self) -> RemoteFs {
        self.cloud
            .lock()
            .instances
            .get(&self.id)
            .map(|inst| inst.files.clone())
            .unwrap_or_default()
    }
}

impl RemoteInstance for MemoryInstance {
    type Channel = MemoryChannel;

    fn id(&self) -> &str {
        &self.id
    }

    fn snapshot_id(&self) -> &str {
        &self.snapshot_id
    }

    async fn exec(&self, command: &str) -> Result<MemoryChannel, SnapError> {
        let handler = {
            let mut state = self.cloud.lock();
            state.check("exec")?;
            state.running_instance(&self.id)?;
            state.commands.push(command.to_string());
            state.stats.commands_run += 1;
            state.handler.clone()
        };
        let run = match handler {
            Some(handler) => handler(command),
            None => ScriptedRun::exit(0),
        };
        Ok(MemoryChannel {
            pending: run.output.into_iter().collect(),
            exit: run.exit,
        })
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteKind>, SnapError> {
        if path == "/" {
            return Ok(Some(RemoteKind::Dir));
        }
        let mut state = self.cloud.lock();
        let inst = state.running_instance(&self.id)?;
        Ok(inst.files.get(&normalize(path)).map(|entry| match entry {
            RemoteEntry::Dir => RemoteKind::Dir,
            RemoteEntry::File { .. } => RemoteKind::File,
        }))
    }

    async fn mkdir(&self, path: &str) -> Result<(), SnapError> {
        let path = normalize(path);
        let mut state = self.cloud.lock();
        let inst = state.running_instance(&self.id)?;
        if inst.files.contains_key(&path) {
            return Err(SnapError::api("mkdir", format!("{path} already exists")));
        }
        if !parent_exists(&inst.files, &path) {
            return Err(SnapError::api("mkdir", format!("parent of {path} does not exist")));
        }
        inst.files.insert(path, RemoteEntry::Dir);
        Ok(())
    }

    async fn put_file(&self, local: &Path, remote: &str) -> Result<(), SnapError> {
        let contents = tokio::fs::read(local).await.map_err(|source| SnapError::Io {
            context: format!("reading {}", local.display()),
            source,
        })?;
        let remote = normalize(remote);
        let mut state = self.cloud.lock();
        let inst = state.running_instance(&self.id)?;
        if !parent_exists(&inst.files, &remote) {
            return Err(SnapError::api("put_file", format!("parent of {remote} does not exist")));
        }
        if matches!(inst.files.get(&remote), Some(RemoteEntry::Dir)) {
            return Err(SnapError::api("put_file", format!("{remote} is a directory")));
        }
        inst.files.insert(remote, RemoteEntry::File { contents, mode: 0o644 });
        Ok(())
    }

    async fn chmod(&self, remote: &str, mode: u32) -> Result<(), SnapError> {
        let remote = normalize(remote);
        let mut state = self.cloud.lock();
        state.check("chmod")?;
        let inst = state.running_instance(&self.id)?;
        match inst.files.get_mut(&remote) {
            Some(RemoteEntry::File { mode: current, .. }) => {
                *current = mode & 0o7777;
                Ok(())
            }
            Some(RemoteEntry::Dir) => Ok(()),
            None => Err(SnapError::api("chmod", format!("{remote} does not exist"))),
        }
    }

    async fn snapshot(&self, digest: Option<&str>) -> Result<Snapshot, SnapError> {
        let mut state = self.cloud.lock();
        state.check("snapshot")?;
        let (spec, files) = {
            let inst = state.running_instance(&self.id)?;
            (inst.spec, inst.files.clone())
        };
        let id = state.next_id("snapshot");
        let created = state.tick();
        let snapshot = Snapshot {
            id,
            digest: digest.map(str::to_string),
            metadata: Metadata::new(),
            spec,
            created,
        };
        state.snapshots.push(StoredSnapshot {
            snapshot: snapshot.clone(),
            files,
        });
        state.stats.snapshots_created += 1;
        Ok(snapshot)
    }

    async fn stop(&self) -> Result<(), SnapError> {
        let mut state = self.cloud.lock();
        state.check("stop")?;
        let inst = state.instance(&self.id)?;
        if inst.running {
            inst.running = false;
            state.stats.instances_stopped += 1;
        }
        Ok(())
    }

    async fn expose_http_service(&self, name: &str, port: u16) -> Result<String, SnapError> {
        let mut state = self.cloud.lock();
        let inst = state.running_instance(&self.id)?;
        inst.services.insert(name.to_string(), port);
        Ok(format!("https://{name}-{}.memory.invalid", self.id))
    }

    async fn hide_http_service(&self, name: &str) -> Result<(), SnapError> {
        let mut state = self.cloud.lock();
        let inst = state.running_instance(&self.id)?;
        inst.services
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| SnapError::api("hide_http_service", format!("no service named {name}")))
    }
}

/// Output of a scripted command, released chunk by chunk.
pub struct MemoryChannel {
    pending: VecDeque<ScriptedOutput>,
    exit: Option<i32>,
}

fn take_prefix(text: &mut String, max: usize) -> Vec<u8> {
    if text.len() <= max {
        return std::mem::take(text).into_bytes();
    }
    let mut cut = max;
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    if cut == 0 {
        // Always make progress, even when `max` is narrower than a character.
        cut = text.chars().next().map_or(text.len(), char::len_utf8);
    }
    let rest = text.split_off(cut);
    std::mem::replace(text, rest).into_bytes()
}

impl ShellChannel for MemoryChannel {
    fn recv_stdout(&mut self, max: usize) -> Option<Vec<u8>> {
        match self.pending.front_mut() {
            Some(ScriptedOutput::Stdout(text)) => {
                let chunk = take_prefix(text, max);
                if text.is_empty() {
                    self.pending.pop_front();
                }
                Some(chunk)
            }
            _ => None,
        }
    }

    fn recv_stderr(&mut self, max: usize) -> Option<Vec<u8>> {
        match self.pending.front_mut() {
            Some(ScriptedOutput::Stderr(text)) => {
                let chunk = take_prefix(text, max);
                if text.is_empty() {
                    self.pending.pop_front();
                }
                Some(chunk)
            }
            _ => None,
        }
    }

    fn status(&mut self) -> ChannelStatus {
        if !self.pending.is_empty() {
            return ChannelStatus::Running;
        }
        match self.exit {
            Some(code) => ChannelStatus::Exited(code),
            None => ChannelStatus::Closed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> SnapshotSpec {
        SnapshotSpec {
            vcpus: 1,
            memory: 512,
            disk_size: 1024,
        }
    }

    async fn base(cloud: &MemoryCloud) -> Snapshot {
        cloud
            .create_snapshot(CreateSnapshot {
                image_id: "img".into(),
                spec: spec(),
                digest: Some("base".into()),
                metadata: Metadata::new(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn instance_state_flows_into_new_snapshot() {
        let cloud = MemoryCloud::new();
        let snap = base(&cloud).await;
        let inst = cloud
            .start_instance(StartInstance {
                snapshot_id: snap.id.clone(),
                metadata: Metadata::new(),
                ttl_seconds: None,
                ttl_action: None,
            })
            .await
            .unwrap();

        inst.mkdir("/opt").await.unwrap();
        let next = inst.snapshot(Some("k")).await.unwrap();

        assert_eq!(next.digest.as_deref(), Some("k"));
        assert!(next.created > snap.created);
        let files = cloud.snapshot_files(&next.id).unwrap();
        assert_eq!(files.get("/opt"), Some(&RemoteEntry::Dir));
        assert!(cloud.snapshot_files(&snap.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn mkdir_requires_parent() {
        let cloud = MemoryCloud::new();
        let snap = base(&cloud).await;
        let inst = cloud.boot_instance(&snap.id, Resources::default()).await.unwrap();
        assert!(inst.mkdir("/a/b").await.is_err());
        inst.mkdir("/a").await.unwrap();
        inst.mkdir("/a/b").await.unwrap();
        assert_eq!(inst.stat("/a/b/").await.unwrap(), Some(RemoteKind::Dir));
    }

    #[tokio::test]
    async fn channel_releases_output_then_exit() {
        let cloud = MemoryCloud::new();
        cloud.on_command(|_| ScriptedRun::exit(3).stdout("hello").stderr("oops"));
        let snap = base(&cloud).await;
        let inst = cloud.boot_instance(&snap.id, Resources::default()).await.unwrap();

        let mut chan = inst.exec("anything").await.unwrap();
        assert_eq!(chan.status(), ChannelStatus::Running);
        assert_eq!(chan.recv_stdout(3).unwrap(), b"hel");
        assert_eq!(chan.recv_stdout(64).unwrap(), b"lo");
        assert!(chan.recv_stdout(64).is_none());
        assert_eq!(chan.recv_stderr(64).unwrap(), b"oops");
        assert_eq!(chan.status(), ChannelStatus::Exited(3));
        assert_eq!(cloud.commands(), vec!["anything".to_string()]);
    }

    #[test]
    fn narrow_reads_take_one_whole_character() {
        let mut text = "\u{2603}a".to_string();
        assert_eq!(take_prefix(&mut text, 1), "\u{2603}".as_bytes());
        assert_eq!(take_prefix(&mut text, 1), b"a");
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn one_byte_reads_drain_multibyte_output() {
        let cloud = MemoryCloud::new();
        cloud.on_command(|_| ScriptedRun::exit(0).stdout("\u{2603}\u{2603}"));
        let snap = base(&cloud).await;
        let inst = cloud.boot_instance(&snap.id, Resources::default()).await.unwrap();

        let mut chan = inst.exec("snow").await.unwrap();
        let mut reads = Vec::new();
        while let Some(chunk) = chan.recv_stdout(1) {
            reads.push(chunk);
        }
        assert_eq!(reads.len(), 2);
        assert_eq!(reads.concat(), "\u{2603}\u{2603}".as_bytes());
    }

    #[tokio::test]
    async fn injected_failures_surface_as_api_errors() {
        let cloud = MemoryCloud::new();
        cloud.fail("list_snapshots");
        let err = cloud.list_snapshots(&SnapshotQuery::All).await.unwrap_err();
        assert!(matches!(err, SnapError::Api { .. }));
    }
}
