use std::collections::{HashMap, HashSet};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use sandbox::{SandboxId, StorageBackend};
use tracing::{info, warn};

use super::error::{Result, StorageError};
use crate::paths::{StorageRoots, parse_storage_dir_name};
use crate::process::is_root;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Aggregate reservation caps. `None` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct StorageCaps {
    /// Cap for tmpfs and shared-memory areas.
    pub max_memory_mb: Option<u64>,
    /// Cap for disk areas.
    pub max_disk_mb: Option<u64>,
}

#[derive(Debug)]
struct Allocation {
    backend: StorageBackend,
    reserved_mb: u64,
    mounted: bool,
}

// ---------------------------------------------------------------------------
// StorageAllocator
// ---------------------------------------------------------------------------

/// Reserves and releases per-sandbox storage areas.
///
/// Reservations are accounted in a short critical section so concurrent
/// allocations can never jointly exceed a cap; filesystem work happens
/// outside the lock.
pub struct StorageAllocator {
    roots: StorageRoots,
    caps: StorageCaps,
    allocations: Mutex<HashMap<PathBuf, Allocation>>,
}

impl StorageAllocator {
    pub fn new(roots: StorageRoots, caps: StorageCaps) -> Self {
        Self {
            roots,
            caps,
            allocations: Mutex::new(HashMap::new()),
        }
    }

    fn allocations(&self) -> MutexGuard<'_, HashMap<PathBuf, Allocation>> {
        self.allocations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Allocate a storage area for `id`, reserving `size_mb` against the caps.
    ///
    /// Returns the area's root directory. Nothing is left behind on failure.
    pub async fn allocate(
        &self,
        id: &SandboxId,
        backend: StorageBackend,
        size_mb: u64,
    ) -> Result<PathBuf> {
        let (path, mount) = self.placement(id, backend)?;
        self.reserve(&path, backend, size_mb, mount)?;

        if let Err(e) = materialize(&path, mount, size_mb).await {
            self.allocations().remove(&path);
            if let Err(rm_err) = tokio::fs::remove_dir(&path).await
                && rm_err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), error = %rm_err, "failed to remove partial storage");
            }
            return Err(e);
        }

        info!(
            id = %id,
            backend = %backend,
            size_mb,
            path = %path.display(),
            "storage allocated"
        );
        Ok(path)
    }

    /// Unmount (if needed) and delete a storage area, dropping its reservation.
    ///
    /// Idempotent: releasing an unknown or already-removed path is a no-op.
    /// The reservation is dropped even when the filesystem work fails.
    pub async fn release(&self, path: &Path) -> Result<()> {
        let allocation = self.allocations().remove(path);
        let mounted = allocation.as_ref().is_some_and(|a| a.mounted) || is_mount_point(path);

        if mounted {
            unmount(path)?;
        }

        match tokio::fs::remove_dir_all(path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::io("remove", path, e)),
        }

        if allocation.is_some() {
            info!(path = %path.display(), "storage released");
        }
        Ok(())
    }

    /// Release every `eph-` area under the storage roots that belongs to
    /// neither a live sandbox nor a current allocation.
    ///
    /// Returns the number of areas reclaimed.
    pub async fn reclaim_orphans(&self, live: &HashSet<SandboxId>) -> usize {
        let mut reclaimed = 0;
        let mut roots = vec![self.roots.storage_root.clone()];
        if self.roots.shm_root != self.roots.storage_root {
            roots.push(self.roots.shm_root.clone());
        }

        for root in roots {
            let mut entries = match tokio::fs::read_dir(&root).await {
                Ok(entries) => entries,
                Err(_) => continue,
            };

            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(id) = parse_storage_dir_name(&name.to_string_lossy()) else {
                    continue;
                };
                let path = entry.path();
                if live.contains(&id) || self.is_allocated(&path) {
                    continue;
                }
                match self.release(&path).await {
                    Ok(()) => {
                        info!(id = %id, path = %path.display(), "reclaimed orphaned storage");
                        reclaimed += 1;
                    }
                    Err(e) => {
                        warn!(id = %id, error = %e, "failed to reclaim orphaned storage");
                    }
                }
            }
        }

        reclaimed
    }

    /// Currently reserved `(memory_mb, disk_mb)`.
    pub fn reserved(&self) -> (u64, u64) {
        self.allocations()
            .values()
            .fold((0, 0), |(memory, disk), a| {
                if a.backend.is_memory_backed() {
                    (memory + a.reserved_mb, disk)
                } else {
                    (memory, disk + a.reserved_mb)
                }
            })
    }

    pub fn is_allocated(&self, path: &Path) -> bool {
        self.allocations().contains_key(path)
    }

    pub fn caps(&self) -> StorageCaps {
        self.caps
    }

    /// Where an area for `backend` goes, and whether it needs a tmpfs mount.
    fn placement(&self, id: &SandboxId, backend: StorageBackend) -> Result<(PathBuf, bool)> {
        match backend {
            StorageBackend::Disk => Ok((self.roots.disk(id), false)),
            StorageBackend::Memory => {
                self.require_shm()?;
                Ok((self.roots.shm(id), false))
            }
            StorageBackend::Tmpfs if cfg!(target_os = "linux") && is_root() => {
                Ok((self.roots.disk(id), true))
            }
            StorageBackend::Tmpfs => {
                self.require_shm()?;
                warn!(
                    id = %id,
                    "tmpfs mount needs root, using shared-memory directory instead"
                );
                Ok((self.roots.shm(id), false))
            }
        }
    }

    fn require_shm(&self) -> Result<()> {
        if self.roots.shm_root.is_dir() {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "shared-memory root not found: {}",
                self.roots.shm_root.display()
            )))
        }
    }

    fn reserve(&self, path: &Path, backend: StorageBackend, size_mb: u64, mounted: bool) -> Result<()> {
        let mut allocations = self.allocations();
        if allocations.contains_key(path) {
            return Err(StorageError::AlreadyAllocated(path.to_path_buf()));
        }

        let memory_backed = backend.is_memory_backed();
        let (kind, cap) = if memory_backed {
            ("memory", self.caps.max_memory_mb)
        } else {
            ("disk", self.caps.max_disk_mb)
        };
        let reserved: u64 = allocations
            .values()
            .filter(|a| a.backend.is_memory_backed() == memory_backed)
            .map(|a| a.reserved_mb)
            .sum();

        if let Some(cap) = cap
            && reserved.saturating_add(size_mb) > cap
        {
            return Err(StorageError::CapExceeded {
                kind,
                requested: size_mb,
                reserved,
                cap,
            });
        }

        allocations.insert(
            path.to_path_buf(),
            Allocation {
                backend,
                reserved_mb: size_mb,
                mounted,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

async fn materialize(path: &Path, mount: bool, size_mb: u64) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| StorageError::io("mkdir", parent, e))?;
    }
    tokio::fs::create_dir(path)
        .await
        .map_err(|e| StorageError::io("mkdir", path, e))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o700))
        .await
        .map_err(|e| StorageError::io("chmod", path, e))?;

    if mount {
        mount_tmpfs(path, size_mb)?;
    }
    Ok(())
}

/// A path is a mount point when it sits on a different device than its parent.
fn is_mount_point(path: &Path) -> bool {
    let (Ok(meta), Some(parent)) = (std::fs::symlink_metadata(path), path.parent()) else {
        return false;
    };
    std::fs::metadata(parent).is_ok_and(|parent_meta| parent_meta.dev() != meta.dev())
}

#[cfg(target_os = "linux")]
fn mount_tmpfs(path: &Path, size_mb: u64) -> Result<()> {
    use nix::mount::{MsFlags, mount};

    let options = format!("size={size_mb}m,mode=0700");
    mount(
        Some("tmpfs"),
        path,
        Some("tmpfs"),
        MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
        Some(options.as_str()),
    )
    .map_err(|e| StorageError::io("mount tmpfs", path, e.into()))
}

#[cfg(not(target_os = "linux"))]
fn mount_tmpfs(_path: &Path, _size_mb: u64) -> Result<()> {
    Err(StorageError::Unavailable(
        "tmpfs mounts are only supported on Linux".into(),
    ))
}

#[cfg(target_os = "linux")]
fn unmount(path: &Path) -> Result<()> {
    use nix::mount::{MntFlags, umount2};

    umount2(path, MntFlags::MNT_DETACH).map_err(|e| StorageError::io("umount", path, e.into()))
}

#[cfg(not(target_os = "linux"))]
fn unmount(path: &Path) -> Result<()> {
    Err(StorageError::Unavailable(format!(
        "cannot unmount {} on this platform",
        path.display()
    )))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(dir: &Path, caps: StorageCaps) -> StorageAllocator {
        let storage_root = dir.join("disk");
        let shm_root = dir.join("shm");
        std::fs::create_dir_all(&shm_root).unwrap();
        StorageAllocator::new(
            StorageRoots {
                storage_root,
                shm_root,
            },
            caps,
        )
    }

    #[tokio::test]
    async fn allocate_disk_creates_private_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());
        let id = SandboxId::generate();

        let path = storage.allocate(&id, StorageBackend::Disk, 64).await.unwrap();

        assert!(path.is_dir());
        assert!(path.starts_with(tmp.path().join("disk")));
        assert!(storage.is_allocated(&path));
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);
        assert_eq!(storage.reserved(), (0, 64));

        storage.release(&path).await.unwrap();
    }

    #[tokio::test]
    async fn allocate_memory_uses_shm_root() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());

        let path = storage
            .allocate(&SandboxId::generate(), StorageBackend::Memory, 32)
            .await
            .unwrap();

        assert!(path.starts_with(tmp.path().join("shm")));
        assert_eq!(storage.reserved(), (32, 0));
        storage.release(&path).await.unwrap();
    }

    #[tokio::test]
    async fn memory_without_shm_root_is_unavailable() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageAllocator::new(
            StorageRoots {
                storage_root: tmp.path().join("disk"),
                shm_root: tmp.path().join("missing"),
            },
            StorageCaps::default(),
        );

        let err = storage
            .allocate(&SandboxId::generate(), StorageBackend::Memory, 32)
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)), "got {err:?}");
        assert_eq!(storage.reserved(), (0, 0));
    }

    #[tokio::test]
    async fn tmpfs_allocation_is_released_cleanly() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());

        // As root this mounts a real tmpfs (which may be refused inside an
        // unprivileged container); otherwise it falls back to the shm root.
        match storage
            .allocate(&SandboxId::generate(), StorageBackend::Tmpfs, 8)
            .await
        {
            Ok(path) => {
                assert!(path.is_dir());
                storage.release(&path).await.unwrap();
                assert!(!path.exists());
            }
            Err(e) => assert!(matches!(e, StorageError::Io { op: "mount tmpfs", .. }), "got {e:?}"),
        }
        assert_eq!(storage.reserved(), (0, 0));
    }

    #[tokio::test]
    async fn disk_cap_rejects_over_reservation() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(
            tmp.path(),
            StorageCaps {
                max_memory_mb: None,
                max_disk_mb: Some(100),
            },
        );

        let first = storage
            .allocate(&SandboxId::generate(), StorageBackend::Disk, 60)
            .await
            .unwrap();
        let err = storage
            .allocate(&SandboxId::generate(), StorageBackend::Disk, 60)
            .await
            .unwrap_err();
        assert!(
            matches!(err, StorageError::CapExceeded { kind: "disk", reserved: 60, cap: 100, .. }),
            "got {err:?}"
        );

        // Memory-backed areas are accounted separately.
        let shm = storage
            .allocate(&SandboxId::generate(), StorageBackend::Memory, 60)
            .await
            .unwrap();

        storage.release(&first).await.unwrap();
        storage.release(&shm).await.unwrap();
        assert_eq!(storage.reserved(), (0, 0));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());
        let path = storage
            .allocate(&SandboxId::generate(), StorageBackend::Disk, 1)
            .await
            .unwrap();
        std::fs::write(path.join("data"), b"x").unwrap();

        storage.release(&path).await.unwrap();
        storage.release(&path).await.unwrap();

        assert!(!path.exists());
        assert!(!storage.is_allocated(&path));
    }

    #[tokio::test]
    async fn release_unknown_path_is_noop() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());
        storage
            .release(&tmp.path().join("never-allocated"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn reclaim_orphans_skips_live_and_foreign_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = allocator(tmp.path(), StorageCaps::default());
        let disk_root = tmp.path().join("disk");
        let shm_root = tmp.path().join("shm");
        std::fs::create_dir_all(&disk_root).unwrap();

        let orphan_disk = disk_root.join("eph-sbx-dead1");
        let orphan_shm = shm_root.join("eph-sbx-dead2");
        let live = disk_root.join("eph-sbx-alive");
        let foreign = disk_root.join("unrelated");
        for dir in [&orphan_disk, &orphan_shm, &live, &foreign] {
            std::fs::create_dir_all(dir.join("work")).unwrap();
        }
        let allocated = storage
            .allocate(&SandboxId::generate(), StorageBackend::Disk, 1)
            .await
            .unwrap();

        let live_ids: HashSet<SandboxId> = [SandboxId::from("sbx-alive")].into();
        let reclaimed = storage.reclaim_orphans(&live_ids).await;

        assert_eq!(reclaimed, 2);
        assert!(!orphan_disk.exists());
        assert!(!orphan_shm.exists());
        assert!(live.exists());
        assert!(foreign.exists());
        assert!(allocated.exists());

        storage.release(&allocated).await.unwrap();
    }

    #[tokio::test]
    async fn reclaim_orphans_with_missing_roots() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = StorageAllocator::new(
            StorageRoots {
                storage_root: tmp.path().join("nope"),
                shm_root: tmp.path().join("nope-either"),
            },
            StorageCaps::default(),
        );
        assert_eq!(storage.reclaim_orphans(&HashSet::new()).await, 0);
    }

    #[test]
    fn fresh_directory_is_not_a_mount_point() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("plain");
        std::fs::create_dir(&dir).unwrap();
        assert!(!is_mount_point(&dir));
        assert!(!is_mount_point(&tmp.path().join("absent")));
    }
}
