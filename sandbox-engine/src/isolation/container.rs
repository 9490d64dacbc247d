use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use sandbox::{ResourceLimits, SandboxError, SandboxId};
use serde::Serialize;
use tokio::process::Command;
use tracing::{info, warn};

use super::{IsolationContext, PROBE_TIMEOUT, ensure_dirs};
use crate::command::{exec, exec_ignore_errors, exec_timeout};
use crate::config::ContainerConfig;
use crate::paths::SandboxPaths;

/// Mount point of the storage area inside containers.
pub(crate) const GUEST_ROOT: &str = "/sandbox";

/// Label carried by every container started for a sandbox.
const SANDBOX_LABEL: &str = "ephemeral.sandbox";

/// Ephemeral container spec written to `container.json` on apply.
#[derive(Debug, Serialize)]
struct ContainerSpec<'a> {
    sandbox: &'a SandboxId,
    engine: &'a str,
    image: &'a str,
    mount_source: PathBuf,
    mount_target: &'static str,
    network: bool,
    memory_mb: Option<u64>,
    pids_limit: u32,
    cpus: Option<f32>,
    labels: BTreeMap<&'static str, String>,
}

/// Commands run through `<engine> run --rm` with the storage area mounted
/// at `/sandbox`.
#[derive(Debug)]
pub struct ContainerIsolation {
    engine: String,
    image: String,
    id: SandboxId,
    host_root: PathBuf,
    network: bool,
    limits: ResourceLimits,
    seq: AtomicU64,
}

impl ContainerIsolation {
    pub(crate) async fn probe(ctx: &IsolationContext<'_>) -> Result<Self, String> {
        let engine = resolve_engine(ctx.container)?;
        exec_timeout(&engine, &["info"], PROBE_TIMEOUT)
            .await
            .map_err(|e| format!("container engine unreachable: {e}"))?;

        Ok(Self {
            engine,
            image: ctx.container.image.clone(),
            id: ctx.id.clone(),
            host_root: ctx.paths.root().to_path_buf(),
            network: ctx.network,
            limits: ctx.limits.clone(),
            seq: AtomicU64::new(0),
        })
    }

    pub(crate) async fn apply(&self, paths: &SandboxPaths) -> Result<(), String> {
        ensure_dirs(paths).await?;

        let spec = ContainerSpec {
            sandbox: &self.id,
            engine: &self.engine,
            image: &self.image,
            mount_source: self.host_root.clone(),
            mount_target: GUEST_ROOT,
            network: self.network,
            memory_mb: self.limits.max_memory_mb,
            pids_limit: self.limits.max_processes,
            cpus: self.cpus(),
            labels: BTreeMap::from([(SANDBOX_LABEL, self.id.to_string())]),
        };
        let json = serde_json::to_vec_pretty(&spec).map_err(|e| e.to_string())?;
        let path = paths.container_spec();
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| format!("failed to write {}: {e}", path.display()))
    }

    /// Build the `run` invocation; returns it with the container name.
    pub(crate) fn command(&self, script: &str, env: &[(String, String)]) -> (Command, String) {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}-{seq}", self.id);
        let mut command = Command::new(&self.engine);
        command.args(self.run_args(&name, script, env));
        (command, name)
    }

    fn run_args(&self, name: &str, script: &str, env: &[(String, String)]) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "run".into(),
            "--rm".into(),
            "--name".into(),
            name.into(),
            "--label".into(),
            format!("{SANDBOX_LABEL}={}", self.id),
            "-v".into(),
            format!("{}:{GUEST_ROOT}", self.host_root.display()),
            "-w".into(),
            format!("{GUEST_ROOT}/work"),
        ];
        if !self.network {
            args.extend(["--network".to_string(), "none".to_string()]);
        }
        if let Some(memory) = self.limits.max_memory_mb {
            args.extend(["--memory".to_string(), format!("{memory}m")]);
        }
        args.extend([
            "--pids-limit".to_string(),
            self.limits.max_processes.to_string(),
        ]);
        if let Some(cpus) = self.cpus() {
            args.extend(["--cpus".to_string(), format!("{cpus:.2}")]);
        }
        for (key, value) in env {
            args.extend(["-e".to_string(), format!("{key}={value}")]);
        }
        args.extend([
            self.image.clone(),
            "/bin/sh".to_string(),
            "-c".to_string(),
            script.to_string(),
        ]);
        args
    }

    fn cpus(&self) -> Option<f32> {
        self.limits.max_cpu_percent.map(|pct| pct / 100.0)
    }

    /// Force-remove one container. Failures are ignored; teardown catches leftovers.
    pub(crate) async fn remove(&self, name: &str) {
        exec_ignore_errors(&self.engine, &["rm", "-f", name]).await;
    }

    /// Force-remove every container labelled with this sandbox.
    pub(crate) async fn teardown(&self) -> Result<(), SandboxError> {
        let filter = format!("label={SANDBOX_LABEL}={}", self.id);
        let ids = exec(&self.engine, &["ps", "-aq", "--filter", &filter])
            .await
            .map_err(|e| SandboxError::Cleanup(e.to_string()))?;

        for container in ids.split_whitespace() {
            if let Err(e) = exec(&self.engine, &["rm", "-f", container]).await {
                warn!(id = %self.id, container, error = %e, "failed to remove container");
                return Err(SandboxError::Cleanup(e.to_string()));
            }
            info!(id = %self.id, container, "removed container");
        }
        Ok(())
    }
}

/// Explicit engine from config, else `docker` then `podman` on `PATH`.
fn resolve_engine(config: &ContainerConfig) -> Result<String, String> {
    let path = match &config.engine {
        Some(engine) => which::which(engine)
            .map_err(|e| format!("container engine {} not found: {e}", engine.display()))?,
        None => which::which("docker")
            .or_else(|_| which::which("podman"))
            .map_err(|_| "no container engine (docker, podman) on PATH".to_string())?,
    };
    Ok(path.display().to_string())
}
