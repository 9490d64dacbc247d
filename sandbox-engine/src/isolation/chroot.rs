use tokio::process::Command;

use super::{IsolationContext, ensure_dirs};
use crate::paths::SandboxPaths;
use crate::process::is_root;

/// `chroot` into the storage area. Needs effective root and a populated root
/// filesystem (at least `bin/sh`) inside storage.
#[derive(Debug)]
pub struct ChrootIsolation;

impl ChrootIsolation {
    pub(crate) fn probe(ctx: &IsolationContext<'_>) -> Result<Self, String> {
        if !is_root() {
            return Err("chroot requires effective root".to_string());
        }
        which::which("chroot").map_err(|e| format!("chroot not found: {e}"))?;
        let shell = ctx.paths.root().join("bin/sh");
        if !shell.exists() {
            return Err(format!("no shell in chroot: {}", shell.display()));
        }
        Ok(Self)
    }

    pub(crate) async fn apply(&self, paths: &SandboxPaths) -> Result<(), String> {
        ensure_dirs(paths).await
    }

    pub(crate) fn command(&self, paths: &SandboxPaths, script: &str) -> Command {
        let script = format!("cd /work && {script}");
        let mut command = Command::new("chroot");
        command
            .arg(paths.root())
            .args(["/bin/sh", "-c", script.as_str()]);
        command
    }
}
