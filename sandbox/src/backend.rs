use std::path::Path;

use async_trait::async_trait;

use crate::error::Result;

/// Package-manager collaborator driven by the lifecycle controller.
///
/// Backends only describe *what* to run; the engine decides *how* (isolation,
/// limits, process groups, timeouts). The one exception is
/// [`create_runtime`](Backend::create_runtime), which materializes the
/// runtime inside freshly allocated storage before isolation is applied.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Selector name used in [`SandboxSpec::backend`](crate::SandboxSpec).
    fn name(&self) -> &str;

    /// Materialize the interpreter/runtime under `root`.
    async fn create_runtime(&self, root: &Path, version: Option<&str>) -> Result<()>;

    /// Shell command that installs `artifacts` into the runtime under `root`.
    fn install_command(&self, root: &Path, artifacts: &[String]) -> String;

    /// Shell command that runs `command` inside the runtime under `root`.
    fn run_command(&self, root: &Path, command: &str) -> String;

    /// Extra environment for every command (e.g. `VIRTUAL_ENV`, `PATH`).
    fn environment(&self, root: &Path) -> Vec<(String, String)>;

    /// Whether the runtime still works when commands see `root` under a
    /// different path, as they do under chroot or container isolation.
    /// Runtimes that bake absolute host paths in return `false`.
    fn relocatable(&self) -> bool {
        true
    }
}
