use std::path::PathBuf;
use std::time::Duration;

use sandbox::{IsolationLevel, SandboxError, SecurityMode, StorageBackend};
use serde::Deserialize;

pub(crate) const DEFAULT_TTL: Duration = Duration::from_secs(3600);
pub(crate) const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(1800);
pub(crate) const DEFAULT_MAX_CONCURRENT: usize = 10;
pub(crate) const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
pub(crate) const DEFAULT_FORCE_CLEANUP_AFTER: Duration = Duration::from_secs(7200);
pub(crate) const DEFAULT_SHUTDOWN_DEADLINE: Duration = Duration::from_secs(30);
pub(crate) const DEFAULT_INSTALL_TIMEOUT: Duration = Duration::from_secs(600);
pub(crate) const DEFAULT_SIZE_MB: u64 = 512;
pub(crate) const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
pub(crate) const DEFAULT_HISTORY: usize = 120;
pub(crate) const DEFAULT_CONTAINER_IMAGE: &str = "python:3.12-slim";

/// Process-wide engine settings. Loaded once, read-only afterwards.
///
/// Durations are written in seconds (fractions allowed) under `*_secs` keys.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// TTL for sandboxes that do not set their own; `null` disables.
    #[serde(rename = "default_ttl_secs", with = "secs::option")]
    pub default_ttl: Option<Duration>,
    /// Idle timeout for sandboxes that do not set their own; `null` disables.
    #[serde(rename = "max_idle_secs", with = "secs::option")]
    pub max_idle_time: Option<Duration>,
    pub max_concurrent: usize,
    pub max_total_memory_mb: Option<u64>,
    pub max_total_disk_mb: Option<u64>,
    #[serde(rename = "cleanup_interval_secs", with = "secs")]
    pub cleanup_interval: Duration,
    /// Age after which reclamation escalates to forced cleanup.
    #[serde(rename = "force_cleanup_after_secs", with = "secs")]
    pub force_cleanup_after: Duration,
    /// Hard bound on [`SandboxManager::shutdown`](crate::SandboxManager::shutdown).
    #[serde(rename = "shutdown_deadline_secs", with = "secs")]
    pub shutdown_deadline: Duration,
    #[serde(rename = "install_timeout_secs", with = "secs")]
    pub install_timeout: Duration,
    pub default_storage: StorageBackend,
    pub default_isolation: IsolationLevel,
    pub default_security: SecurityMode,
    /// Storage reservation when a sandbox sets no disk/memory limit.
    pub default_size_mb: u64,
    pub storage_root: PathBuf,
    pub shm_root: PathBuf,
    pub monitoring: MonitoringConfig,
    pub container: ContainerConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            default_ttl: Some(DEFAULT_TTL),
            max_idle_time: Some(DEFAULT_MAX_IDLE),
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            max_total_memory_mb: None,
            max_total_disk_mb: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            force_cleanup_after: DEFAULT_FORCE_CLEANUP_AFTER,
            shutdown_deadline: DEFAULT_SHUTDOWN_DEADLINE,
            install_timeout: DEFAULT_INSTALL_TIMEOUT,
            default_storage: StorageBackend::Disk,
            default_isolation: IsolationLevel::Process,
            default_security: SecurityMode::Standard,
            default_size_mb: DEFAULT_SIZE_MB,
            storage_root: std::env::temp_dir().join("ephemeral"),
            shm_root: PathBuf::from("/dev/shm"),
            monitoring: MonitoringConfig::default(),
            container: ContainerConfig::default(),
        }
    }
}

impl GlobalConfig {
    pub fn validate(&self) -> Result<(), SandboxError> {
        let mut errors = Vec::new();

        if self.max_concurrent == 0 {
            errors.push("max_concurrent must be at least 1".to_string());
        }
        if self.cleanup_interval.is_zero() {
            errors.push("cleanup_interval_secs must be positive".to_string());
        }
        if self.force_cleanup_after < self.cleanup_interval {
            errors.push(
                "force_cleanup_after_secs must not be shorter than cleanup_interval_secs"
                    .to_string(),
            );
        }
        if self.shutdown_deadline.is_zero() {
            errors.push("shutdown_deadline_secs must be positive".to_string());
        }
        if self.default_size_mb == 0 {
            errors.push("default_size_mb must be positive".to_string());
        }
        if self.default_ttl.is_some_and(|d| d.is_zero()) {
            errors.push("default_ttl_secs must be positive or null".to_string());
        }
        if self.max_idle_time.is_some_and(|d| d.is_zero()) {
            errors.push("max_idle_secs must be positive or null".to_string());
        }
        if self.monitoring.enabled && self.monitoring.interval.is_zero() {
            errors.push("monitoring.interval_secs must be positive".to_string());
        }
        if self.monitoring.history == 0 {
            errors.push("monitoring.history must be at least 1".to_string());
        }
        if self.container.image.trim().is_empty() {
            errors.push("container.image must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(SandboxError::InvalidConfig(errors.join("; ")))
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub enabled: bool,
    #[serde(rename = "interval_secs", with = "secs")]
    pub interval: Duration,
    /// Samples kept per sandbox; oldest are evicted.
    pub history: usize,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: DEFAULT_MONITOR_INTERVAL,
            history: DEFAULT_HISTORY,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ContainerConfig {
    /// Engine binary. When unset, `docker` then `podman` are looked up on `PATH`.
    pub engine: Option<PathBuf>,
    pub image: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            engine: None,
            image: DEFAULT_CONTAINER_IMAGE.to_string(),
        }
    }
}

/// Durations as (possibly fractional) seconds.
mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        pub fn deserialize<'de, D: Deserializer<'de>>(
            d: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<f64>::deserialize(d)?
                .map(|secs| Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}
