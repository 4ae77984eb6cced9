//! Upload of local files and directory trees to a remote instance.
//!
//! `dest` is treated as a directory to copy *into* when it ends with `/` or
//! already exists remotely as a directory; otherwise it is the literal
//! target path. Remote directories are created parent-first, only as
//! needed. Permission bits are propagated on a best-effort basis.

use std::path::{Path, PathBuf};

use crate::backend::{RemoteInstance, RemoteKind};
use crate::error::SnapError;
use crate::progress::{LineStyle, Panel};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopySummary {
    pub files: usize,
    pub dirs_created: usize,
}

fn io_err(context: String) -> impl FnOnce(std::io::Error) -> SnapError {
    move |source| SnapError::Io { context, source }
}

/// `parent/name` without doubling slashes.
pub fn remote_join(parent: &str, name: &str) -> String {
    format!("{}/{name}", parent.trim_end_matches('/'))
}

/// Final name component of a local source, resolving `.` and friends.
async fn source_name(src: &Path) -> Result<String, SnapError> {
    if let Some(name) = src.file_name() {
        return Ok(name.to_string_lossy().into_owned());
    }
    let full = tokio::fs::canonicalize(src)
        .await
        .map_err(io_err(format!("resolving {}", src.display())))?;
    full.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SnapError::CopyTarget {
            dest: src.display().to_string(),
            message: "source has no file name".into(),
        })
}

/// Decide where `src` lands for a given `dest`.
pub async fn resolve_target<I: RemoteInstance>(
    instance: &I,
    src: &Path,
    dest: &str,
) -> Result<String, SnapError> {
    let into_dir = dest.ends_with('/') || instance.stat(dest).await? == Some(RemoteKind::Dir);
    if into_dir {
        Ok(remote_join(dest, &source_name(src).await?))
    } else {
        Ok(dest.to_string())
    }
}

/// Create `path` and any missing ancestors, outermost first.
pub async fn ensure_remote_dir<I: RemoteInstance>(instance: &I, path: &str) -> Result<usize, SnapError> {
    let mut created = 0;
    let mut prefix = String::new();
    if path.starts_with('/') {
        prefix.push('/');
    }
    for part in path.split('/').filter(|p| !p.is_empty()) {
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        prefix.push_str(part);
        match instance.stat(&prefix).await? {
            Some(RemoteKind::Dir) => {}
            Some(RemoteKind::File) => {
                return Err(SnapError::CopyTarget {
                    dest: path.to_string(),
                    message: format!("{prefix} exists and is not a directory"),
                });
            }
            None => {
                instance.mkdir(&prefix).await?;
                created += 1;
            }
        }
    }
    Ok(created)
}

fn parent_of(remote: &str) -> Option<&str> {
    match remote.trim_end_matches('/').rfind('/') {
        None => None,
        Some(0) => Some("/"),
        Some(i) => Some(&remote[..i]),
    }
}

#[cfg(unix)]
async fn local_mode(path: &Path) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::metadata(path)
        .await
        .ok()
        .map(|m| m.permissions().mode() & 0o7777)
}

#[cfg(not(unix))]
async fn local_mode(_path: &Path) -> Option<u32> {
    None
}

async fn upload_file<I: RemoteInstance>(
    instance: &I,
    local: &Path,
    remote: &str,
    panel: &Panel,
) -> Result<(), SnapError> {
    panel.log(&format!("{} -> {remote}", local.display()), LineStyle::Normal);
    instance.put_file(local, remote).await?;
    if let Some(mode) = local_mode(local).await {
        if let Err(e) = instance.chmod(remote, mode).await {
            tracing::debug!(%remote, mode = %format!("{mode:o}"), error = %e, "chmod skipped");
        }
    }
    Ok(())
}

/// Copy `src` to `dest` on `instance`, logging each file to `panel`.
pub async fn copy_to<I: RemoteInstance>(
    instance: &I,
    src: &Path,
    dest: &str,
    panel: &Panel,
) -> Result<CopySummary, SnapError> {
    let meta = tokio::fs::metadata(src).await.map_err(|_| SnapError::SourceNotFound {
        path: src.display().to_string(),
    })?;
    let target = resolve_target(instance, src, dest).await?;
    tracing::debug!(src = %src.display(), %dest, %target, "copy target resolved");

    let mut summary = CopySummary::default();
    if !meta.is_dir() {
        if let Some(parent) = parent_of(&target) {
            summary.dirs_created += ensure_remote_dir(instance, parent).await?;
        }
        upload_file(instance, src, &target, panel).await?;
        summary.files = 1;
        return Ok(summary);
    }

    if instance.stat(&target).await? == Some(RemoteKind::File) {
        return Err(SnapError::CopyTarget {
            dest: target,
            message: "cannot copy a directory onto a file".into(),
        });
    }
    summary.dirs_created += ensure_remote_dir(instance, &target).await?;

    // Depth-first, entries in name order.
    let mut pending: Vec<(PathBuf, String)> = vec![(src.to_path_buf(), target)];
    while let Some((local_dir, remote_dir)) = pending.pop() {
        let mut entries = Vec::new();
        let mut reader = tokio::fs::read_dir(&local_dir)
            .await
            .map_err(io_err(format!("reading {}", local_dir.display())))?;
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(io_err(format!("reading {}", local_dir.display())))?
        {
            entries.push(entry.path());
        }
        entries.sort();

        let mut subdirs = Vec::new();
        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let remote = remote_join(&remote_dir, &name);
            let is_dir = tokio::fs::metadata(&path)
                .await
                .map_err(io_err(format!("reading {}", path.display())))?
                .is_dir();
            if is_dir {
                summary.dirs_created += ensure_remote_dir(instance, &remote).await?;
                subdirs.push((path, remote));
            } else {
                upload_file(instance, &path, &remote, panel).await?;
                summary.files += 1;
            }
        }
        pending.extend(subdirs.into_iter().rev());
    }
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::memory::{MemoryCloud, MemoryInstance, RemoteEntry};
    use crate::backend::{CloudApi, CreateSnapshot, Metadata, Resources, SnapshotSpec};
    use crate::progress::ProgressReporter;

    async fn instance() -> (MemoryCloud, MemoryInstance) {
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

    fn panel() -> Panel {
        ProgressReporter::hidden(24).add_panel("copy")
    }

    #[test]
    fn join_and_parent() {
        assert_eq!(remote_join("/srv/", "a.txt"), "/srv/a.txt");
        assert_eq!(remote_join("/", "a.txt"), "/a.txt");
        assert_eq!(parent_of("/srv/a.txt"), Some("/srv"));
        assert_eq!(parent_of("/a.txt"), Some("/"));
        assert_eq!(parent_of("a.txt"), None);
    }

    #[tokio::test]
    async fn tree_is_mirrored_parent_first() {
        let (_cloud, inst) = instance().await;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("app");
        std::fs::create_dir_all(root.join("static/css")).unwrap();
        std::fs::write(root.join("main.py"), "print(1)").unwrap();
        std::fs::write(root.join("static/css/site.css"), "body{}").unwrap();

        let summary = copy_to(&inst, &root, "/srv/", &panel()).await.unwrap();
        assert_eq!(summary.files, 2);

        let files = inst.files();
        assert_eq!(files.get("/srv"), Some(&RemoteEntry::Dir));
        assert_eq!(files.get("/srv/app/static/css"), Some(&RemoteEntry::Dir));
        assert!(matches!(
            files.get("/srv/app/static/css/site.css"),
            Some(RemoteEntry::File { contents, .. }) if contents == b"body{}"
        ));
        assert!(files.contains_key("/srv/app/main.py"));
    }

    #[tokio::test]
    async fn directory_onto_file_is_rejected() {
        let (_cloud, inst) = instance().await;
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, "x").unwrap();
        copy_to(&inst, &file, "/taken", &panel()).await.unwrap();

        let err = copy_to(&inst, dir.path(), "/taken", &panel()).await.unwrap_err();
        assert!(matches!(err, SnapError::CopyTarget { .. }));
    }

    #[tokio::test]
    async fn missing_source_fails_before_remote_work() {
        let (cloud, inst) = instance().await;
        let err = copy_to(&inst, Path::new("/definitely/not/here"), "/x", &panel())
            .await
            .unwrap_err();
        assert!(matches!(err, SnapError::SourceNotFound { .. }));
        assert!(inst.files().is_empty());
        assert_eq!(cloud.stats().commands_run, 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn permissions_follow_and_chmod_failure_is_ignored() {
        use std::os::unix::fs::PermissionsExt;
        let (cloud, inst) = instance().await;
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("run.sh");
        std::fs::write(&script, "#!/bin/sh").unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();

        copy_to(&inst, &script, "/run.sh", &panel()).await.unwrap();
        assert!(matches!(
            inst.files().get("/run.sh"),
            Some(RemoteEntry::File { mode: 0o755, .. })
        ));

        cloud.fail("chmod");
        copy_to(&inst, &script, "/again.sh", &panel()).await.unwrap();
        assert!(inst.files().contains_key("/again.sh"));
    }
}
