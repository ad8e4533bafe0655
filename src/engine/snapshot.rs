//! On-disk snapshots of solved states
//!
//! Cacheable snapshots live under `snapshots/` keyed by digest and survive
//! between invocations. Snapshots of volatile states live under
//! `sessions/<id>/` and are removed when the session ends. Every snapshot
//! is built in a temporary directory and renamed into place, so a
//! directory at the final path is always complete.

use crate::error::{DalecError, DalecResult};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

/// A solved filesystem on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub digest: String,
    pub path: PathBuf,
}

/// Directory layout for snapshots
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

/// Strip the `sha256:` prefix for use in paths
pub fn digest_hex(digest: &str) -> &str {
    digest.strip_prefix("sha256:").unwrap_or(digest)
}

/// Join a path from inside a snapshot onto its host directory
pub fn host_path(base: &Path, inner: &str) -> PathBuf {
    let rel = inner.trim_start_matches('/');
    if rel.is_empty() {
        base.to_path_buf()
    } else {
        base.join(rel)
    }
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding snapshots for `session`, or the shared cache
    pub fn base(&self, volatile: bool, session: Uuid) -> PathBuf {
        if volatile {
            self.root.join("sessions").join(session.to_string())
        } else {
            self.root.join("snapshots")
        }
    }

    /// Final location of a snapshot
    pub fn path_for(&self, digest: &str, volatile: bool, session: Uuid) -> PathBuf {
        self.base(volatile, session).join(digest_hex(digest))
    }

    /// The always-empty snapshot
    pub async fn scratch(&self) -> DalecResult<Snapshot> {
        let path = self.root.join("scratch");
        fs::create_dir_all(&path)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", path.display()), e))?;
        Ok(Snapshot {
            digest: "scratch".to_string(),
            path,
        })
    }

    /// Fresh temporary directory next to `target`
    pub async fn temp_dir(&self, target: &Path) -> DalecResult<PathBuf> {
        let parent = target
            .parent()
            .ok_or_else(|| DalecError::Internal(format!("snapshot path has no parent: {}", target.display())))?;
        let tmp = parent.join(format!(".tmp-{}", Uuid::new_v4()));
        fs::create_dir_all(&tmp)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", tmp.display()), e))?;
        Ok(tmp)
    }

    /// Move a finished temporary directory into place
    ///
    /// Returns `false` when another solve committed the same snapshot
    /// first; the existing one wins and the caller discards `tmp`.
    pub async fn commit(&self, tmp: &Path, target: &Path) -> DalecResult<bool> {
        if fs::try_exists(target).await.unwrap_or(false) {
            return Ok(false);
        }
        fs::rename(tmp, target)
            .await
            .map_err(|e| DalecError::io(format!("committing snapshot {}", target.display()), e))?;
        Ok(true)
    }

    pub async fn exists(&self, target: &Path) -> bool {
        fs::try_exists(target).await.unwrap_or(false)
    }

    /// Write a file inside a snapshot directory, creating parents
    pub async fn write_file(&self, base: &Path, inner: &str, mode: u32, data: &str) -> DalecResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = host_path(base, inner);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DalecError::io(format!("creating {}", parent.display()), e))?;
        }
        fs::write(&path, data)
            .await
            .map_err(|e| DalecError::io(format!("writing {}", path.display()), e))?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| DalecError::io(format!("chmod {}", path.display()), e))
    }

    /// Create a directory inside a snapshot, including parents
    pub async fn make_dir(&self, base: &Path, inner: &str, mode: u32) -> DalecResult<()> {
        use std::os::unix::fs::PermissionsExt;

        let path = host_path(base, inner);
        fs::create_dir_all(&path)
            .await
            .map_err(|e| DalecError::io(format!("creating {}", path.display()), e))?;
        fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| DalecError::io(format!("chmod {}", path.display()), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn volatile_snapshots_are_session_scoped() {
        let store = SnapshotStore::new("/state");
        let session = Uuid::new_v4();
        assert_eq!(
            store.path_for("sha256:abc", false, session),
            PathBuf::from("/state/snapshots/abc")
        );
        assert_eq!(
            store.path_for("sha256:abc", true, session),
            PathBuf::from(format!("/state/sessions/{}/abc", session))
        );
    }

    #[test]
    fn host_path_strips_root() {
        let base = Path::new("/snap");
        assert_eq!(host_path(base, "/"), PathBuf::from("/snap"));
        assert_eq!(host_path(base, "/etc/x.repo"), PathBuf::from("/snap/etc/x.repo"));
        assert_eq!(host_path(base, "rel"), PathBuf::from("/snap/rel"));
    }

    #[tokio::test]
    async fn commit_keeps_first_writer() {
        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        let target = store.path_for("sha256:one", false, Uuid::new_v4());
        fs::create_dir_all(target.parent().unwrap()).await.unwrap();

        let first = store.temp_dir(&target).await.unwrap();
        store.write_file(&first, "/a", 0o644, "first").await.unwrap();
        assert!(store.commit(&first, &target).await.unwrap());

        let second = store.temp_dir(&target).await.unwrap();
        store.write_file(&second, "/a", 0o644, "second").await.unwrap();
        assert!(!store.commit(&second, &target).await.unwrap());

        assert_eq!(fs::read_to_string(target.join("a")).await.unwrap(), "first");
    }

    #[tokio::test]
    async fn write_file_sets_mode_and_parents() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = SnapshotStore::new(dir.path());
        store
            .write_file(dir.path(), "/etc/dalec/script.sh", 0o755, "echo hi\n")
            .await
            .unwrap();
        let meta = std::fs::metadata(dir.path().join("etc/dalec/script.sh")).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o755);
    }
}
