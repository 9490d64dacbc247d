use tokio::process::Command;

use super::{IsolationContext, PROBE_TIMEOUT, ensure_dirs};
use crate::command::exec_timeout;
use crate::paths::SandboxPaths;

const BASE_FLAGS: [&str; 7] = [
    "--user",
    "--map-root-user",
    "--pid",
    "--fork",
    "--mount",
    "--ipc",
    "--uts",
];

/// PID/mount/IPC/UTS (and, without network access, NET) namespaces via
/// `unshare`. Linux only; relies on unprivileged user namespaces.
#[derive(Debug)]
pub struct NamespaceIsolation {
    flags: Vec<&'static str>,
}

impl NamespaceIsolation {
    pub(crate) async fn probe(ctx: &IsolationContext<'_>) -> Result<Self, String> {
        if !cfg!(target_os = "linux") {
            return Err("namespaces require Linux".to_string());
        }
        which::which("unshare").map_err(|e| format!("unshare not found: {e}"))?;

        let isolation = Self::new(ctx.network);
        let mut args = isolation.flags.clone();
        args.push("true");
        exec_timeout("unshare", &args, PROBE_TIMEOUT)
            .await
            .map_err(|e| e.to_string())?;
        Ok(isolation)
    }

    fn new(network: bool) -> Self {
        let mut flags = BASE_FLAGS.to_vec();
        if !network {
            flags.push("--net");
        }
        Self { flags }
    }

    pub(crate) async fn apply(&self, paths: &SandboxPaths) -> Result<(), String> {
        ensure_dirs(paths).await
    }

    pub(crate) fn command(&self, paths: &SandboxPaths, script: &str) -> Command {
        let mut command = Command::new("unshare");
        command
            .args(&self.flags)
            .args(["/bin/sh", "-c", script])
            .current_dir(paths.work());
        command
    }
}
