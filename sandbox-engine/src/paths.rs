use std::path::{Path, PathBuf};

use sandbox::SandboxId;

/// Directory-name prefix for every storage area the allocator creates.
/// Orphan reclamation only ever touches entries carrying it.
pub const STORAGE_PREFIX: &str = "eph-";

/// Storage directory name for a sandbox: `eph-<id>`.
pub fn storage_dir_name(id: &SandboxId) -> String {
    format!("{STORAGE_PREFIX}{id}")
}

/// Recover the sandbox id from a storage directory name.
pub fn parse_storage_dir_name(name: &str) -> Option<SandboxId> {
    name.strip_prefix(STORAGE_PREFIX)
        .filter(|id| !id.is_empty())
        .map(SandboxId::from)
}

/// Roots under which storage areas are created.
#[derive(Debug, Clone)]
pub struct StorageRoots {
    /// Disk-backed areas and tmpfs mount points.
    pub storage_root: PathBuf,
    /// Shared-memory areas (normally `/dev/shm`).
    pub shm_root: PathBuf,
}

impl StorageRoots {
    pub fn disk(&self, id: &SandboxId) -> PathBuf {
        self.storage_root.join(storage_dir_name(id))
    }

    pub fn shm(&self, id: &SandboxId) -> PathBuf {
        self.shm_root.join(storage_dir_name(id))
    }
}

/// Layout inside one sandbox's storage area.
///
/// ```text
/// eph-<id>/
///   work/            working directory for commands
///   home/            private HOME
///   tmp/             private TMPDIR
///   runtime/         interpreter / packages materialized by the backend
///   spawn/           stdout/stderr of background processes
///   container.json   ephemeral container spec (container isolation only)
/// ```
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    root: PathBuf,
}

impl SandboxPaths {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn work(&self) -> PathBuf {
        self.root.join("work")
    }

    pub fn home(&self) -> PathBuf {
        self.root.join("home")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn runtime(&self) -> PathBuf {
        self.root.join("runtime")
    }

    pub fn spawn_dir(&self) -> PathBuf {
        self.root.join("spawn")
    }

    pub fn spawn_stdout(&self, seq: u64) -> PathBuf {
        self.spawn_dir().join(format!("{seq}.out"))
    }

    pub fn spawn_stderr(&self, seq: u64) -> PathBuf {
        self.spawn_dir().join(format!("{seq}.err"))
    }

    pub fn container_spec(&self) -> PathBuf {
        self.root.join("container.json")
    }

    /// Directories every sandbox gets regardless of isolation level.
    pub fn skeleton(&self) -> [PathBuf; 5] {
        [
            self.work(),
            self.home(),
            self.tmp(),
            self.runtime(),
            self.spawn_dir(),
        ]
    }
}
