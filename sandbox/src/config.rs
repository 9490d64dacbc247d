use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SandboxError};
use crate::types::{IsolationLevel, SecurityMode, StorageBackend};

pub const DEFAULT_MAX_PROCESSES: u32 = 64;

/// Per-sandbox limits. Attached at creation and never mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceLimits {
    pub max_memory_mb: Option<u64>,
    pub max_disk_mb: Option<u64>,
    pub max_processes: u32,
    pub max_cpu_percent: Option<f32>,
    pub network_access: bool,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: None,
            max_disk_mb: None,
            max_processes: DEFAULT_MAX_PROCESSES,
            max_cpu_percent: None,
            network_access: false,
        }
    }
}

impl ResourceLimits {
    pub fn validate(&self) -> Result<()> {
        if self.max_processes == 0 {
            return Err(SandboxError::InvalidConfig(
                "max_processes must be at least 1".into(),
            ));
        }
        if self.max_memory_mb == Some(0) {
            return Err(SandboxError::InvalidConfig(
                "max_memory_mb must be positive".into(),
            ));
        }
        if self.max_disk_mb == Some(0) {
            return Err(SandboxError::InvalidConfig(
                "max_disk_mb must be positive".into(),
            ));
        }
        if let Some(cpu) = self.max_cpu_percent
            && !(cpu.is_finite() && cpu > 0.0)
        {
            return Err(SandboxError::InvalidConfig(format!(
                "max_cpu_percent must be positive, got {cpu}"
            )));
        }
        Ok(())
    }
}

/// A request to create a sandbox.
///
/// Unset storage / isolation / security fall back to the manager's defaults.
#[derive(Debug, Clone, Default)]
pub struct SandboxSpec {
    pub backend: String,
    pub name: Option<String>,
    pub runtime_version: Option<String>,
    pub storage: Option<StorageBackend>,
    pub isolation: Option<IsolationLevel>,
    pub security: Option<SecurityMode>,
    pub limits: ResourceLimits,
    pub ttl: Option<Duration>,
    pub idle_timeout: Option<Duration>,
    pub tags: BTreeMap<String, String>,
    pub artifacts: Vec<String>,
}

impl SandboxSpec {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_runtime_version(mut self, version: impl Into<String>) -> Self {
        self.runtime_version = Some(version.into());
        self
    }

    pub fn with_storage(mut self, storage: StorageBackend) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_security(mut self, security: SecurityMode) -> Self {
        self.security = Some(security);
        self
    }

    pub fn with_limits(mut self, limits: ResourceLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = Some(idle);
        self
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    pub fn with_artifacts<I, S>(mut self, artifacts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.artifacts = artifacts.into_iter().map(Into::into).collect();
        self
    }

    /// Checks everything that does not depend on manager state.
    pub fn validate(&self) -> Result<()> {
        if self.backend.trim().is_empty() {
            return Err(SandboxError::InvalidConfig("backend must be set".into()));
        }
        if let Some(name) = &self.name
            && name.trim().is_empty()
        {
            return Err(SandboxError::InvalidConfig("name must not be blank".into()));
        }
        if self.ttl.is_some_and(|ttl| ttl.is_zero()) {
            return Err(SandboxError::InvalidConfig("ttl must be positive".into()));
        }
        if self.idle_timeout.is_some_and(|idle| idle.is_zero()) {
            return Err(SandboxError::InvalidConfig(
                "idle timeout must be positive".into(),
            ));
        }
        if let Some(bad) = self.artifacts.iter().find(|a| a.trim().is_empty()) {
            return Err(SandboxError::InvalidConfig(format!(
                "invalid artifact name: {bad:?}"
            )));
        }
        self.limits.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_limits_are_valid() {
        ResourceLimits::default().validate().unwrap();
    }

    #[test]
    fn zero_processes_rejected() {
        let limits = ResourceLimits {
            max_processes: 0,
            ..ResourceLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn nan_cpu_rejected() {
        let limits = ResourceLimits {
            max_cpu_percent: Some(f32::NAN),
            ..ResourceLimits::default()
        };
        assert!(limits.validate().is_err());
    }

    #[test]
    fn builder_sets_fields() {
        let spec = SandboxSpec::new("shell")
            .with_name("ci-job")
            .with_isolation(IsolationLevel::Namespace)
            .with_ttl(Duration::from_secs(30))
            .with_tag("team", "infra")
            .with_artifacts(["pkgA", "pkgB"]);

        assert_eq!(spec.backend, "shell");
        assert_eq!(spec.name.as_deref(), Some("ci-job"));
        assert_eq!(spec.isolation, Some(IsolationLevel::Namespace));
        assert_eq!(spec.tags.get("team").map(String::as_str), Some("infra"));
        assert_eq!(spec.artifacts, vec!["pkgA", "pkgB"]);
        spec.validate().unwrap();
    }

    #[test]
    fn zero_ttl_rejected() {
        let spec = SandboxSpec::new("shell").with_ttl(Duration::ZERO);
        assert!(matches!(spec.validate(), Err(SandboxError::InvalidConfig(_))));
    }

    #[test]
    fn blank_backend_rejected() {
        assert!(SandboxSpec::new("  ").validate().is_err());
    }

    #[test]
    fn limits_deserialize_with_defaults() {
        let limits: ResourceLimits =
            serde_json::from_str(r#"{"max_memory_mb": 256}"#).unwrap();
        assert_eq!(limits.max_memory_mb, Some(256));
        assert_eq!(limits.max_processes, DEFAULT_MAX_PROCESSES);
        assert!(!limits.network_access);
    }
}
