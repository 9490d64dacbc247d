use std::path::PathBuf;

use sandbox::SandboxError;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{kind} reservation of {requested}MB exceeds cap ({reserved}MB of {cap}MB in use)")]
    CapExceeded {
        kind: &'static str,
        requested: u64,
        reserved: u64,
        cap: u64,
    },

    #[error("storage backend unavailable: {0}")]
    Unavailable(String),

    #[error("storage already allocated: {}", .0.display())]
    AlreadyAllocated(PathBuf),

    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            op,
            path: path.into(),
            source,
        }
    }

    /// Allocation failures surface as environment-creation errors.
    pub fn into_creation_error(self) -> SandboxError {
        SandboxError::EnvironmentCreation(self.to_string())
    }

    /// Release failures surface as cleanup errors.
    pub fn into_cleanup_error(self) -> SandboxError {
        SandboxError::Cleanup(self.to_string())
    }
}
