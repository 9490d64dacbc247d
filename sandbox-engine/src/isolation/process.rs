use tokio::process::Command;

use super::{IsolationContext, ensure_dirs};
use crate::paths::SandboxPaths;

/// Environment and working-directory isolation only. Needs no privilege.
#[derive(Debug)]
pub struct ProcessIsolation;

impl ProcessIsolation {
    pub(crate) fn probe(_ctx: &IsolationContext<'_>) -> Self {
        Self
    }

    pub(crate) async fn apply(&self, paths: &SandboxPaths) -> Result<(), String> {
        ensure_dirs(paths).await
    }

    pub(crate) fn command(&self, paths: &SandboxPaths, script: &str) -> Command {
        let mut command = Command::new("/bin/sh");
        command.arg("-c").arg(script).current_dir(paths.work());
        command
    }
}
