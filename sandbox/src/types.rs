use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Process-unique sandbox identifier (`sbx-<uuid>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxId(String);

impl SandboxId {
    pub fn generate() -> Self {
        Self(format!("sbx-{}", uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SandboxId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for SandboxId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Creating,
    Ready,
    Running,
    CleaningUp,
    Destroyed,
    Failed,
}

impl SandboxStatus {
    /// Statuses in which the sandbox owns a storage path.
    pub fn holds_storage(self) -> bool {
        matches!(
            self,
            Self::Creating | Self::Ready | Self::Running | Self::CleaningUp
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Destroyed)
    }
}

impl fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::CleaningUp => "cleaningup",
            Self::Destroyed => "destroyed",
            Self::Failed => "failed",
        })
    }
}

/// Where a sandbox's files live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    /// Size-bounded tmpfs mount.
    Tmpfs,
    /// Directory in the shared-memory filesystem.
    Memory,
    /// Plain directory under the storage root.
    Disk,
}

impl StorageBackend {
    /// Whether reservations count against the memory cap instead of the disk cap.
    pub fn is_memory_backed(self) -> bool {
        matches!(self, Self::Tmpfs | Self::Memory)
    }
}

impl fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tmpfs => "tmpfs",
            Self::Memory => "memory",
            Self::Disk => "disk",
        })
    }
}

impl FromStr for StorageBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tmpfs" => Ok(Self::Tmpfs),
            "memory" => Ok(Self::Memory),
            "disk" => Ok(Self::Disk),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// OS boundary applied to a sandbox, ordered weakest to strongest.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum IsolationLevel {
    Process,
    Chroot,
    Namespace,
    Container,
}

impl IsolationLevel {
    /// Next level to try when this one is unavailable.
    ///
    /// Every chain ends at [`IsolationLevel::Process`].
    pub fn fallback(self) -> Option<Self> {
        match self {
            Self::Container => Some(Self::Namespace),
            Self::Namespace | Self::Chroot => Some(Self::Process),
            Self::Process => None,
        }
    }

    /// The full downgrade chain starting at (and including) `self`.
    pub fn chain(self) -> Vec<Self> {
        std::iter::successors(Some(self), |level| level.fallback()).collect()
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Process => "process",
            Self::Chroot => "chroot",
            Self::Namespace => "namespace",
            Self::Container => "container",
        })
    }
}

impl FromStr for IsolationLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Self::Process),
            "chroot" => Ok(Self::Chroot),
            "namespace" => Ok(Self::Namespace),
            "container" => Ok(Self::Container),
            other => Err(format!("unknown isolation level: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityMode {
    /// Commands inherit the host environment.
    Permissive,
    /// Scrubbed environment; network follows the limits.
    #[default]
    Standard,
    /// Scrubbed environment; network always disabled.
    Strict,
}

impl fmt::Display for SecurityMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Permissive => "permissive",
            Self::Standard => "standard",
            Self::Strict => "strict",
        })
    }
}

impl FromStr for SecurityMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "permissive" => Ok(Self::Permissive),
            "standard" => Ok(Self::Standard),
            "strict" => Ok(Self::Strict),
            other => Err(format!("unknown security mode: {other}")),
        }
    }
}

/// One resource sample for a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResourceUsage {
    pub timestamp: DateTime<Utc>,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub disk_mb: f64,
    pub processes: u32,
}

impl ResourceUsage {
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            memory_mb: 0.0,
            cpu_percent: 0.0,
            disk_mb: 0.0,
            processes: 0,
        }
    }
}

/// Exit code reported for commands killed by their timeout (matches coreutils `timeout`).
pub const TIMEOUT_EXIT_CODE: i32 = 124;

#[derive(Debug, Clone, Serialize)]
pub struct OperationResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
    pub timed_out: bool,
}

impl OperationResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpawnHandle {
    pub pid: u32,
}

#[derive(Debug, Clone)]
pub struct ProcessExit {
    pub pid: u32,
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

/// Usage summed across all live sandboxes, next to the configured caps.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AggregateStats {
    pub sandboxes: usize,
    pub max_concurrent: usize,
    pub memory_mb: f64,
    pub cpu_percent: f32,
    pub disk_mb: f64,
    pub processes: u32,
    pub reserved_memory_mb: u64,
    pub reserved_disk_mb: u64,
    pub max_total_memory_mb: Option<u64>,
    pub max_total_disk_mb: Option<u64>,
}
