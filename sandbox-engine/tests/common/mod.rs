#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{Backend, Result};
use sandbox_engine::{GlobalConfig, SandboxManager, backend::shell_quote};

/// Backend whose "packages" are marker files under `runtime/site`.
///
/// `run <name>` succeeds only when `<name>` was installed.
pub struct PackageBackend;

#[async_trait]
impl Backend for PackageBackend {
    fn name(&self) -> &str {
        "pkg"
    }

    async fn create_runtime(&self, root: &Path, _version: Option<&str>) -> Result<()> {
        tokio::fs::create_dir_all(root.join("runtime").join("site")).await?;
        Ok(())
    }

    fn install_command(&self, root: &Path, artifacts: &[String]) -> String {
        let site = root.join("runtime").join("site");
        artifacts
            .iter()
            .map(|a| format!("touch {}", shell_quote(&site.join(a).display().to_string())))
            .collect::<Vec<_>>()
            .join(" && ")
    }

    fn run_command(&self, root: &Path, command: &str) -> String {
        let site = root.join("runtime").join("site");
        format!(
            "run() {{ test -f {}/\"$1\"; }}; {command}",
            shell_quote(&site.display().to_string())
        )
    }

    fn environment(&self, _root: &Path) -> Vec<(String, String)> {
        Vec::new()
    }
}

pub fn config(dir: &Path) -> GlobalConfig {
    GlobalConfig {
        storage_root: dir.join("storage"),
        shm_root: dir.to_path_buf(),
        default_size_mb: 16,
        ..GlobalConfig::default()
    }
}

pub fn manager(config: GlobalConfig) -> SandboxManager {
    SandboxManager::new(
        config,
        vec![
            Arc::new(PackageBackend),
            Arc::new(sandbox_engine::backend::ShellBackend::default()),
        ],
    )
    .unwrap()
}

/// Poll `check` until it holds or `within` elapses.
pub async fn eventually(within: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}
