mod backend;
mod config;
mod error;
mod sandbox;
mod types;

pub use backend::Backend;
pub use config::{DEFAULT_MAX_PROCESSES, ResourceLimits, SandboxSpec};
pub use error::{Result, SandboxError};
pub use sandbox::Sandbox;
pub use types::{
    AggregateStats, IsolationLevel, OperationResult, ProcessExit, ResourceUsage, SandboxId,
    SandboxStatus, SecurityMode, SpawnHandle, StorageBackend, TIMEOUT_EXIT_CODE,
};
