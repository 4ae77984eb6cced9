//! Layer cache backed by the snapshot store's digest field.
//!
//! There is no local state: every lookup asks the store. Store failures are
//! returned as-is and never retried.

use std::fmt;
use std::sync::Arc;

use crate::backend::{CloudApi, RemoteInstance, Snapshot, SnapshotQuery};
use crate::error::SnapError;

type Predicate = Box<dyn Fn(&Snapshot) -> bool + Send + Sync>;

/// Whether existing cache entries are dropped before a lookup.
#[derive(Default)]
pub enum Invalidate {
    #[default]
    Never,
    Always,
    /// Drop only the entries the predicate selects.
    When(Predicate),
}

impl Invalidate {
    pub fn when<F>(predicate: F) -> Self
    where
        F: Fn(&Snapshot) -> bool + Send + Sync + 'static,
    {
        Invalidate::When(Box::new(predicate))
    }

    pub fn is_requested(&self) -> bool {
        !matches!(self, Invalidate::Never)
    }

    fn selects(&self, snapshot: &Snapshot) -> bool {
        match self {
            Invalidate::Never => false,
            Invalidate::Always => true,
            Invalidate::When(predicate) => predicate(snapshot),
        }
    }
}

impl From<bool> for Invalidate {
    fn from(always: bool) -> Self {
        if always {
            Invalidate::Always
        } else {
            Invalidate::Never
        }
    }
}

impl fmt::Debug for Invalidate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Invalidate::Never => f.write_str("Never"),
            Invalidate::Always => f.write_str("Always"),
            Invalidate::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Order cache hits newest first. Equal stamps keep the later store entry
/// in front.
pub fn newest_first(mut snapshots: Vec<Snapshot>) -> Vec<Snapshot> {
    snapshots.reverse();
    snapshots.sort_by(|a, b| b.created.cmp(&a.created));
    snapshots
}

pub struct SnapshotCache<C> {
    api: Arc<C>,
}

impl<C> Clone for SnapshotCache<C> {
    fn clone(&self) -> Self {
        Self {
            api: self.api.clone(),
        }
    }
}

impl<C: CloudApi> SnapshotCache<C> {
    pub fn new(api: Arc<C>) -> Self {
        Self { api }
    }

    /// Every snapshot recorded under `digest`, newest first.
    pub async fn lookup(&self, digest: &str) -> Result<Vec<Snapshot>, SnapError> {
        let snapshots = self
            .api
            .list_snapshots(&SnapshotQuery::Digest(digest.to_string()))
            .await?;
        Ok(newest_first(snapshots))
    }

    /// The canonical entry for `digest`, if any.
    pub async fn hit(&self, digest: &str) -> Result<Option<Snapshot>, SnapError> {
        Ok(self.lookup(digest).await?.into_iter().next())
    }

    /// Finalize `instance` into a snapshot recorded under `digest`.
    pub async fn store<I: RemoteInstance>(
        &self,
        instance: &I,
        digest: Option<&str>,
    ) -> Result<Snapshot, SnapError> {
        let snapshot = instance.snapshot(digest).await?;
        tracing::debug!(snapshot = %snapshot.id, digest = ?digest, "layer stored");
        Ok(snapshot)
    }

    /// Delete the entries under `digest` selected by `policy`. Returns how
    /// many were deleted.
    pub async fn invalidate(&self, digest: &str, policy: &Invalidate) -> Result<usize, SnapError> {
        if !policy.is_requested() {
            return Ok(0);
        }
        let mut deleted = 0;
        for snapshot in self.lookup(digest).await? {
            if policy.selects(&snapshot) {
                self.api.delete_snapshot(&snapshot.id).await?;
                tracing::info!(snapshot = %snapshot.id, "cache entry invalidated");
                deleted += 1;
            }
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCloud;
    use crate::backend::{CreateSnapshot, Metadata, SnapshotSpec};

    async fn seed(cloud: &MemoryCloud, digest: &str, name: &str) -> Snapshot {
        let mut metadata = Metadata::new();
        metadata.insert("name".into(), name.into());
        cloud
            .create_snapshot(CreateSnapshot {
                image_id: "img".into(),
                spec: SnapshotSpec {
                    vcpus: 1,
                    memory: 512,
                    disk_size: 1024,
                },
                digest: Some(digest.into()),
                metadata,
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn lookup_prefers_newest() {
        let cloud = MemoryCloud::new();
        let old = seed(&cloud, "k", "old").await;
        let new = seed(&cloud, "k", "new").await;
        seed(&cloud, "other", "x").await;

        let cache = SnapshotCache::new(Arc::new(cloud));
        let hits = cache.lookup("k").await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, new.id);
        assert_eq!(hits[1].id, old.id);
        assert_eq!(cache.hit("k").await.unwrap().unwrap().id, new.id);
        assert!(cache.hit("missing").await.unwrap().is_none());
    }

    #[test]
    fn equal_stamps_prefer_later_entries() {
        let spec = SnapshotSpec {
            vcpus: 1,
            memory: 1,
            disk_size: 1,
        };
        let snap = |id: &str| Snapshot {
            id: id.into(),
            digest: None,
            metadata: Metadata::new(),
            spec,
            created: 7,
        };
        let ordered = newest_first(vec![snap("a"), snap("b")]);
        assert_eq!(ordered[0].id, "b");
    }

    #[tokio::test]
    async fn selective_invalidation() {
        let cloud = MemoryCloud::new();
        seed(&cloud, "k", "keep").await;
        seed(&cloud, "k", "drop").await;
        let cache = SnapshotCache::new(Arc::new(cloud.clone()));

        let policy = Invalidate::when(|s| s.metadata.get("name").map(String::as_str) == Some("drop"));
        assert_eq!(cache.invalidate("k", &policy).await.unwrap(), 1);

        let left = cache.lookup("k").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].metadata["name"], "keep");
        assert_eq!(cloud.stats().snapshots_deleted, 1);
    }

    #[tokio::test]
    async fn never_touches_nothing() {
        let cloud = MemoryCloud::new();
        seed(&cloud, "k", "a").await;
        // Never must not even consult the store.
        cloud.fail("list_snapshots");
        let cache = SnapshotCache::new(Arc::new(cloud));
        assert_eq!(cache.invalidate("k", &Invalidate::Never).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let cloud = MemoryCloud::new();
        seed(&cloud, "k", "a").await;
        cloud.fail("delete_snapshot");
        let cache = SnapshotCache::new(Arc::new(cloud));
        let err = cache.invalidate("k", &Invalidate::Always).await.unwrap_err();
        assert!(matches!(err, SnapError::Api { .. }));
    }
}
