//! Kernel crash classification and the per-snapshot crash log.
//!
//! The log lives in the backing snapshot's `crash_history` metadata key as
//! a JSON array. New records are appended; earlier ones are never touched.

use facet::Facet;

use crate::backend::{CRASH_HISTORY_KEY, CloudApi, RemoteInstance};
use crate::error::SnapError;
use crate::util::{iso8601, unix_now};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashType {
    OomKill,
    Timeout,
    KernelDied,
}

impl CrashType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrashType::OomKill => "OOM_KILL",
            CrashType::Timeout => "TIMEOUT",
            CrashType::KernelDied => "KERNEL_DIED",
        }
    }
}

impl std::fmt::Display for CrashType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a failure message by the substrings it contains.
pub fn classify(message: &str) -> CrashType {
    let lower = message.to_lowercase();
    if lower.contains("memory") || lower.contains("oom") {
        CrashType::OomKill
    } else if lower.contains("timeout") {
        CrashType::Timeout
    } else {
        CrashType::KernelDied
    }
}

/// One persisted crash. `timestamp` is ISO-8601 UTC.
#[derive(Debug, Clone, PartialEq, Eq, Facet)]
pub struct CrashRecord {
    pub timestamp: String,
    pub kernel_id: String,
    pub language: String,
    pub crash_type: String,
    pub message: String,
    pub instance_id: String,
}

/// A crash observed in a sandboxed kernel on a running instance.
#[derive(Debug, Clone)]
pub struct KernelCrash {
    pub kernel_id: String,
    pub language: String,
    pub message: String,
}

/// Parse the crash log stored on a snapshot. A missing key is an empty log.
pub fn parse_history(snapshot_id: &str, raw: Option<&str>) -> Result<Vec<CrashRecord>, SnapError> {
    let Some(raw) = raw.filter(|r| !r.trim().is_empty()) else {
        return Ok(Vec::new());
    };
    facet_json::from_str(raw).map_err(|e| SnapError::CrashHistory {
        snapshot_id: snapshot_id.to_string(),
        message: e.to_string(),
    })
}

/// Append a record for `crash` to the crash log of the snapshot backing
/// `instance`, and return it.
pub async fn record_crash<C: CloudApi>(
    api: &C,
    instance: &C::Instance,
    crash: &KernelCrash,
) -> Result<CrashRecord, SnapError> {
    let snapshot = api.get_snapshot(instance.snapshot_id()).await?;
    let mut history = parse_history(
        &snapshot.id,
        snapshot.metadata.get(CRASH_HISTORY_KEY).map(String::as_str),
    )?;

    let record = CrashRecord {
        timestamp: iso8601(unix_now()),
        kernel_id: crash.kernel_id.clone(),
        language: crash.language.clone(),
        crash_type: classify(&crash.message).as_str().to_string(),
        message: crash.message.clone(),
        instance_id: instance.id().to_string(),
    };
    history.push(record.clone());

    let encoded = facet_json::to_string(&history).map_err(|e| SnapError::CrashHistory {
        snapshot_id: snapshot.id.clone(),
        message: e.to_string(),
    })?;
    let mut metadata = snapshot.metadata;
    metadata.insert(CRASH_HISTORY_KEY.to_string(), encoded);
    api.set_snapshot_metadata(&snapshot.id, metadata).await?;

    tracing::info!(
        snapshot = %snapshot.id,
        kernel = %record.kernel_id,
        crash_type = %record.crash_type,
        entries = history.len(),
        "crash recorded"
    );
    Ok(record)
}

/// Persist `crash`, then turn it into the fault raised to the caller.
/// A failure to persist is logged and does not mask the crash.
pub async fn crash_fault<C: CloudApi>(api: &C, instance: &C::Instance, crash: KernelCrash) -> SnapError {
    if let Err(e) = record_crash(api, instance, &crash).await {
        tracing::warn!(instance = %instance.id(), error = %e, "could not persist crash record");
    }
    SnapError::KernelCrashed {
        crash_type: classify(&crash.message).as_str().to_string(),
        kernel_id: crash.kernel_id,
        language: crash.language,
        message: crash.message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::MemoryCloud;
    use crate::backend::{CreateSnapshot, Metadata, Resources, SnapshotSpec};

    #[test]
    fn classification_by_substring() {
        assert_eq!(classify("Out Of Memory"), CrashType::OomKill);
        assert_eq!(classify("killed by OOM reaper"), CrashType::OomKill);
        assert_eq!(classify("timeout exceeded"), CrashType::Timeout);
        assert_eq!(classify("died unexpectedly"), CrashType::KernelDied);
        assert_eq!(classify(""), CrashType::KernelDied);
    }

    async fn setup() -> (MemoryCloud, crate::backend::memory::MemoryInstance) {
        let cloud = MemoryCloud::new();
        let snap = cloud
            .create_snapshot(CreateSnapshot {
                image_id: "img".into(),
                spec: SnapshotSpec {
                    vcpus: 1,
                    memory: 512,
                    disk_size: 1024,
                },
                digest: None,
                metadata: Metadata::new(),
            })
            .await
            .unwrap();
        let inst = cloud.boot_instance(&snap.id, Resources::default()).await.unwrap();
        (cloud, inst)
    }

    fn crash(message: &str) -> KernelCrash {
        KernelCrash {
            kernel_id: "k1".into(),
            language: "python".into(),
            message: message.into(),
        }
    }

    async fn history(cloud: &MemoryCloud, snapshot_id: &str) -> Vec<CrashRecord> {
        let snap = cloud.get_snapshot(snapshot_id).await.unwrap();
        parse_history(&snap.id, snap.metadata.get(CRASH_HISTORY_KEY).map(String::as_str)).unwrap()
    }

    #[tokio::test]
    async fn records_are_append_only() {
        let (cloud, inst) = setup().await;

        record_crash(&cloud, &inst, &crash("out of memory")).await.unwrap();
        let first = history(&cloud, inst.snapshot_id()).await;
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].crash_type, "OOM_KILL");
        assert_eq!(first[0].instance_id, inst.id());

        record_crash(&cloud, &inst, &crash("timeout exceeded")).await.unwrap();
        let second = history(&cloud, inst.snapshot_id()).await;
        assert_eq!(second.len(), 2);
        assert_eq!(second[0], first[0]);
        assert_eq!(second[1].crash_type, "TIMEOUT");
    }

    #[tokio::test]
    async fn fault_survives_persistence_failure() {
        let (cloud, inst) = setup().await;
        cloud.fail("set_snapshot_metadata");
        let err = crash_fault(&cloud, &inst, crash("died unexpectedly")).await;
        match err {
            SnapError::KernelCrashed { crash_type, .. } => assert_eq!(crash_type, "KERNEL_DIED"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn corrupt_history_is_an_error() {
        let (cloud, inst) = setup().await;
        let mut metadata = Metadata::new();
        metadata.insert(CRASH_HISTORY_KEY.into(), "not json".into());
        cloud
            .set_snapshot_metadata(inst.snapshot_id(), metadata)
            .await
            .unwrap();
        let err = record_crash(&cloud, &inst, &crash("oom")).await.unwrap_err();
        assert!(matches!(err, SnapError::CrashHistory { .. }));
    }
}
