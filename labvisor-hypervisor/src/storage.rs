//! Disk store used by the deployment orchestrator.
//!
//! Disks live in the shared disk store named by the service configuration,
//! independent of which backend ends up running the VM. Verification is
//! idempotent: an existing image with matching size and format is reused.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::process::Command;
use tracing::{debug, info, instrument};

use crate::error::{HypervisorError, Result};
use crate::types::DiskTemplate;

/// What `ensure_disk` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskOutcome {
    /// A matching image already existed.
    Reused,
    /// A new image was created.
    Created,
}

/// Disk store trait - verifies, creates and removes template disks.
#[async_trait]
pub trait DiskStore: Send + Sync {
    /// Make sure the disk exists with the template's size and format.
    async fn ensure_disk(&self, disk: &DiskTemplate) -> Result<DiskOutcome>;

    /// Delete the disk image. Deleting a missing image succeeds.
    async fn delete_disk(&self, disk: &DiskTemplate) -> Result<()>;

    /// True if the image exists.
    async fn disk_exists(&self, disk: &DiskTemplate) -> Result<bool>;
}

/// Local directory disk store.
///
/// Without a `qemu-img` binary configured, images are sparse files whose
/// length is the virtual size. With one, images are created and inspected
/// through `qemu-img`.
///
/// Work on one image path is serialized, and new images are built under a
/// temporary name and renamed into place, so a concurrent caller never sees
/// a half-created image.
pub struct LocalDiskStore {
    /// Base path for disk images
    base_path: PathBuf,
    /// qemu-img binary path
    qemu_img_path: Option<String>,
    /// Per-image locks
    path_locks: Mutex<HashMap<PathBuf, Arc<tokio::sync::Mutex<()>>>>,
}

impl LocalDiskStore {
    /// Create a store rooted at `base_path`.
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self {
            base_path: base_path.into(),
            qemu_img_path: None,
            path_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Use `qemu-img` for image creation and inspection.
    pub fn with_qemu_img(mut self, path: impl Into<String>) -> Self {
        self.qemu_img_path = Some(path.into());
        self
    }

    /// Base path of the store.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a template path inside the store.
    fn disk_path(&self, relative: &str) -> Result<PathBuf> {
        let rel = Path::new(relative);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if relative.is_empty() || escapes {
            return Err(HypervisorError::Storage(format!(
                "disk path {} must be relative to the disk store",
                relative
            )));
        }
        Ok(self.base_path.join(rel))
    }

    /// Lock guarding all work on the image at `path`.
    fn path_lock(&self, path: &Path) -> Result<Arc<tokio::sync::Mutex<()>>> {
        let mut locks = self
            .path_locks
            .lock()
            .map_err(|_| HypervisorError::Internal("Lock poisoned".to_string()))?;
        Ok(locks.entry(path.to_path_buf()).or_default().clone())
    }

    /// Temporary sibling used while an image is being built.
    fn staging_path(path: &Path) -> PathBuf {
        let mut name = path.file_name().unwrap_or_default().to_os_string();
        name.push(".partial");
        path.with_file_name(name)
    }

    fn check_format(disk: &DiskTemplate, path: &Path) -> Result<()> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
        if !ext.eq_ignore_ascii_case(disk.format.as_str()) {
            return Err(HypervisorError::Storage(format!(
                "disk {} does not match format {}",
                disk.path,
                disk.format.as_str()
            )));
        }
        Ok(())
    }

    /// Virtual size of an existing image in bytes.
    async fn virtual_size(&self, path: &Path) -> Result<u64> {
        let Some(qemu_img) = &self.qemu_img_path else {
            let meta = tokio::fs::metadata(path).await.map_err(|e| {
                HypervisorError::Storage(format!("failed to stat {}: {}", path.display(), e))
            })?;
            return Ok(meta.len());
        };

        let output = Command::new(qemu_img)
            .arg("info")
            .arg("--output=json")
            .arg(path)
            .output()
            .await
            .map_err(|e| HypervisorError::Storage(format!("qemu-img failed: {}", e)))?;
        if !output.status.success() {
            return Err(HypervisorError::Storage(format!(
                "qemu-img info failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        let info: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| HypervisorError::Storage(format!("bad qemu-img output: {}", e)))?;
        info.get("virtual-size")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| HypervisorError::Storage("qemu-img output has no virtual-size".into()))
    }

    async fn create_image(&self, disk: &DiskTemplate, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                HypervisorError::Storage(format!(
                    "failed to create directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let backing = match &disk.backing {
            Some(backing) => {
                let backing_path = self.disk_path(backing)?;
                if !tokio::fs::try_exists(&backing_path).await.unwrap_or(false) {
                    return Err(HypervisorError::Storage(format!(
                        "backing image {} not found",
                        backing
                    )));
                }
                Some(backing_path)
            }
            None => None,
        };

        let staging = Self::staging_path(path);
        if let Err(e) = self.build_image(disk, backing.as_deref(), &staging).await {
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(e);
        }

        tokio::fs::rename(&staging, path).await.map_err(|e| {
            HypervisorError::Storage(format!("failed to move {} into place: {}", path.display(), e))
        })
    }

    async fn build_image(&self, disk: &DiskTemplate, backing: Option<&Path>, path: &Path) -> Result<()> {
        let Some(qemu_img) = &self.qemu_img_path else {
            let file = tokio::fs::File::create(path).await.map_err(|e| {
                HypervisorError::Storage(format!("failed to create {}: {}", path.display(), e))
            })?;
            file.set_len(disk.size_bytes()).await.map_err(|e| {
                HypervisorError::Storage(format!("failed to size {}: {}", path.display(), e))
            })?;
            return Ok(());
        };

        let mut cmd = Command::new(qemu_img);
        cmd.arg("create").arg("-f").arg(disk.format.as_str());
        if let Some(backing_path) = backing {
            cmd.arg("-F").arg(disk.format.as_str()).arg("-b").arg(backing_path);
        }
        cmd.arg(path).arg(disk.size_bytes().to_string());

        let status = cmd
            .status()
            .await
            .map_err(|e| HypervisorError::Storage(format!("qemu-img failed: {}", e)))?;
        if !status.success() {
            return Err(HypervisorError::Storage("qemu-img create failed".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl DiskStore for LocalDiskStore {
    #[instrument(skip(self, disk), fields(disk = %disk.path, size_gib = disk.size_gib))]
    async fn ensure_disk(&self, disk: &DiskTemplate) -> Result<DiskOutcome> {
        let path = self.disk_path(&disk.path)?;
        Self::check_format(disk, &path)?;

        let lock = self.path_lock(&path)?;
        let _guard = lock.lock().await;

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            let size = self.virtual_size(&path).await?;
            if size != disk.size_bytes() {
                return Err(HypervisorError::Storage(format!(
                    "disk {} exists with size {} bytes, template wants {}",
                    disk.path,
                    size,
                    disk.size_bytes()
                )));
            }
            debug!("Reusing existing disk");
            return Ok(DiskOutcome::Reused);
        }

        info!("Creating disk image");
        self.create_image(disk, &path).await?;
        Ok(DiskOutcome::Created)
    }

    #[instrument(skip(self, disk), fields(disk = %disk.path))]
    async fn delete_disk(&self, disk: &DiskTemplate) -> Result<()> {
        let path = self.disk_path(&disk.path)?;
        let lock = self.path_lock(&path)?;
        let _guard = lock.lock().await;

        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!("Disk deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("Disk already absent");
                Ok(())
            }
            Err(e) => Err(HypervisorError::Storage(format!(
                "failed to delete {}: {}",
                path.display(),
                e
            ))),
        }
    }

    async fn disk_exists(&self, disk: &DiskTemplate) -> Result<bool> {
        let path = self.disk_path(&disk.path)?;
        Ok(tokio::fs::try_exists(&path).await.unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DiskFormat;

    #[tokio::test]
    async fn creates_then_reuses() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());
        let disk = DiskTemplate::new("topo/router.qcow2", 1);

        assert_eq!(store.ensure_disk(&disk).await.unwrap(), DiskOutcome::Created);
        assert_eq!(store.ensure_disk(&disk).await.unwrap(), DiskOutcome::Reused);
        assert!(store.disk_exists(&disk).await.unwrap());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_callers_share_one_image() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(LocalDiskStore::new(dir.path()));
        let disk = DiskTemplate::new("shared/base.qcow2", 1);

        for _ in 0..20 {
            let tasks: Vec<_> = (0..8)
                .map(|_| {
                    let store = store.clone();
                    let disk = disk.clone();
                    tokio::spawn(async move { store.ensure_disk(&disk).await })
                })
                .collect();

            let mut created = 0;
            for task in tasks {
                if task.await.unwrap().unwrap() == DiskOutcome::Created {
                    created += 1;
                }
            }
            assert_eq!(created, 1);
            assert!(!dir.path().join("shared/base.qcow2.partial").exists());
            store.delete_disk(&disk).await.unwrap();
        }
    }

    #[tokio::test]
    async fn size_mismatch_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());

        store.ensure_disk(&DiskTemplate::new("a.qcow2", 1)).await.unwrap();
        let err = store
            .ensure_disk(&DiskTemplate::new("a.qcow2", 2))
            .await
            .unwrap_err();
        assert!(matches!(err, HypervisorError::Storage(_)));
    }

    #[tokio::test]
    async fn format_must_match_extension() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());
        let mut disk = DiskTemplate::new("a.qcow2", 1);
        disk.format = DiskFormat::Raw;

        assert!(store.ensure_disk(&disk).await.is_err());
    }

    #[tokio::test]
    async fn rejects_paths_outside_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());

        assert!(store.ensure_disk(&DiskTemplate::new("../x.qcow2", 1)).await.is_err());
        assert!(store.ensure_disk(&DiskTemplate::new("/etc/x.qcow2", 1)).await.is_err());
    }

    #[tokio::test]
    async fn backing_image_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());
        let mut disk = DiskTemplate::new("linked.qcow2", 1);
        disk.backing = Some("base.qcow2".into());

        assert!(store.ensure_disk(&disk).await.is_err());
        store.ensure_disk(&DiskTemplate::new("base.qcow2", 1)).await.unwrap();
        assert_eq!(store.ensure_disk(&disk).await.unwrap(), DiskOutcome::Created);
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalDiskStore::new(dir.path());
        let disk = DiskTemplate::new("gone.qcow2", 1);

        store.ensure_disk(&disk).await.unwrap();
        store.delete_disk(&disk).await.unwrap();
        store.delete_disk(&disk).await.unwrap();
        assert!(!store.disk_exists(&disk).await.unwrap());
    }
}
