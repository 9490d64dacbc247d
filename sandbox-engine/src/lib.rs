pub mod backend;
mod command;
mod config;
mod guard;
mod isolation;
mod lifecycle;
mod manager;
mod paths;
mod process;
mod scheduler;
mod storage;
mod tracker;

pub use command::CommandError;
pub use config::{ContainerConfig, GlobalConfig, MonitoringConfig};
pub use guard::SandboxGuard;
pub use isolation::{Isolation, IsolationStrategy};
pub use lifecycle::SandboxController;
pub use manager::SandboxManager;
pub use paths::{
    STORAGE_PREFIX, SandboxPaths, StorageRoots, parse_storage_dir_name, storage_dir_name,
};
pub use scheduler::{Reclaim, ReclaimPolicy, ReclaimReason, reclaim_decision, shutdown_on_signal};
pub use storage::{StorageAllocator, StorageCaps, StorageError};
pub use tracker::{LimitBreach, ResourceTracker, UsageMonitor};
