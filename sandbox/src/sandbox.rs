use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::{ResourceLimits, SandboxSpec};
use crate::types::{IsolationLevel, SandboxId, SandboxStatus, SecurityMode, StorageBackend};

/// Snapshot of a sandbox's state.
///
/// The lifecycle controller owns the authoritative copy; everything handed to
/// callers is a clone.
#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: SandboxId,
    pub name: Option<String>,
    pub backend: String,
    pub runtime_version: Option<String>,
    pub status: SandboxStatus,
    pub storage: StorageBackend,
    pub storage_path: Option<PathBuf>,
    pub limits: ResourceLimits,
    pub isolation: IsolationLevel,
    /// Level actually applied after fallback; `None` until Ready.
    pub effective_isolation: Option<IsolationLevel>,
    pub security: SecurityMode,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub ttl: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub installed: Vec<String>,
    pub tags: BTreeMap<String, String>,
}

impl Sandbox {
    /// Build a Pending record from a spec whose defaults are already resolved.
    pub fn pending(
        spec: &SandboxSpec,
        storage: StorageBackend,
        isolation: IsolationLevel,
        security: SecurityMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: SandboxId::generate(),
            name: spec.name.clone(),
            backend: spec.backend.clone(),
            runtime_version: spec.runtime_version.clone(),
            status: SandboxStatus::Pending,
            storage,
            storage_path: None,
            limits: spec.limits.clone(),
            isolation,
            effective_isolation: None,
            security,
            created_at: now,
            last_activity: now,
            ttl: spec.ttl,
            idle_timeout: spec.idle_timeout,
            installed: Vec::new(),
            tags: spec.tags.clone(),
        }
    }

    /// Bump `last_activity`, never moving it backwards.
    pub fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    pub fn touch_at(&mut self, at: DateTime<Utc>) {
        if at > self.last_activity {
            self.last_activity = at;
        }
    }

    /// Record installed artifacts, skipping ones already present.
    pub fn record_installed(&mut self, artifacts: &[String]) {
        for artifact in artifacts {
            if !self.installed.contains(artifact) {
                self.installed.push(artifact.clone());
            }
        }
    }

    /// Whether the sandbox may network: strict mode always disables it.
    pub fn network_allowed(&self) -> bool {
        self.limits.network_access && self.security != SecurityMode::Strict
    }

    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or_default()
    }

    pub fn idle_for(&self, now: DateTime<Utc>) -> Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    /// Bytes of storage to reserve, in MB.
    pub fn reservation_mb(&self, default_size_mb: u64) -> u64 {
        match self.storage {
            StorageBackend::Disk => self.limits.max_disk_mb.unwrap_or(default_size_mb),
            StorageBackend::Tmpfs | StorageBackend::Memory => self
                .limits
                .max_disk_mb
                .or(self.limits.max_memory_mb)
                .unwrap_or(default_size_mb),
        }
    }
}
