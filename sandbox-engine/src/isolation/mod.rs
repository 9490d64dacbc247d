//! OS-level boundaries applied to a sandbox.
//!
//! Selection walks [`IsolationLevel::chain`] from the requested level down to
//! [`IsolationLevel::Process`]; every unavailable level is logged and skipped.
//! Only a failure at the Process level is an error.

mod chroot;
mod container;
mod namespace;
mod process;

use std::path::{Path, PathBuf};
use std::time::Duration;

use sandbox::{IsolationLevel, ResourceLimits, SandboxError, SandboxId, SecurityMode};
use tokio::process::Command;
use tracing::warn;

pub use chroot::ChrootIsolation;
pub use container::ContainerIsolation;
pub use namespace::NamespaceIsolation;
pub use process::ProcessIsolation;

use crate::config::ContainerConfig;
use crate::paths::SandboxPaths;

/// Upper bound for availability probes (`unshare ... true`, `docker info`).
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// `PATH` for scrubbed environments.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Everything a strategy needs to probe and prepare itself.
pub(crate) struct IsolationContext<'a> {
    pub id: &'a SandboxId,
    pub paths: &'a SandboxPaths,
    pub limits: &'a ResourceLimits,
    pub network: bool,
    pub security: SecurityMode,
    pub container: &'a ContainerConfig,
}

/// Closed set of isolation strategies.
#[derive(Debug)]
pub enum IsolationStrategy {
    Process(ProcessIsolation),
    Chroot(ChrootIsolation),
    Namespace(NamespaceIsolation),
    Container(ContainerIsolation),
}

/// A command wrapped for execution under an isolation boundary.
pub(crate) struct IsolatedCommand {
    pub command: Command,
    /// Container name when the command runs inside a container engine.
    pub container: Option<String>,
}

/// The isolation applied to one sandbox.
#[derive(Debug)]
pub struct Isolation {
    id: SandboxId,
    security: SecurityMode,
    paths: SandboxPaths,
    strategy: IsolationStrategy,
}

impl Isolation {
    /// Apply the strongest available level at or below `requested`.
    pub(crate) async fn select(
        requested: IsolationLevel,
        ctx: &IsolationContext<'_>,
    ) -> Result<Self, SandboxError> {
        for level in requested.chain() {
            match try_level(level, ctx).await {
                Ok(strategy) => {
                    if level != requested {
                        warn!(id = %ctx.id, requested = %requested, effective = %level, "isolation downgraded");
                    }
                    return Ok(Self {
                        id: ctx.id.clone(),
                        security: ctx.security,
                        paths: ctx.paths.clone(),
                        strategy,
                    });
                }
                Err(reason) => match level.fallback() {
                    Some(next) => {
                        warn!(id = %ctx.id, level = %level, fallback = %next, reason = %reason, "isolation unavailable");
                    }
                    None => {
                        return Err(SandboxError::Isolation(format!("{level}: {reason}")));
                    }
                },
            }
        }
        Err(SandboxError::Isolation(format!(
            "no isolation level available for {requested}"
        )))
    }

    pub fn level(&self) -> IsolationLevel {
        match self.strategy {
            IsolationStrategy::Process(_) => IsolationLevel::Process,
            IsolationStrategy::Chroot(_) => IsolationLevel::Chroot,
            IsolationStrategy::Namespace(_) => IsolationLevel::Namespace,
            IsolationStrategy::Container(_) => IsolationLevel::Container,
        }
    }

    pub fn strategy(&self) -> &IsolationStrategy {
        &self.strategy
    }

    /// The sandbox root as seen by commands running under this boundary.
    pub fn guest_root(&self) -> PathBuf {
        match &self.strategy {
            IsolationStrategy::Process(_) | IsolationStrategy::Namespace(_) => {
                self.paths.root().to_path_buf()
            }
            IsolationStrategy::Chroot(_) => PathBuf::from("/"),
            IsolationStrategy::Container(_) => PathBuf::from(container::GUEST_ROOT),
        }
    }

    /// Environment for a command: the base set for the security mode, then
    /// the backend's entries. A backend `PATH` is prepended to the base one.
    pub fn environment(&self, backend_env: &[(String, String)]) -> Vec<(String, String)> {
        let root = self.guest_root();
        let mut path = match self.security {
            SecurityMode::Permissive => {
                std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string())
            }
            SecurityMode::Standard | SecurityMode::Strict => DEFAULT_PATH.to_string(),
        };

        let mut env = vec![
            ("HOME".to_string(), path_str(&root.join("home"))),
            ("TMPDIR".to_string(), path_str(&root.join("tmp"))),
            ("EPHEMERAL_SANDBOX_ID".to_string(), self.id.to_string()),
            ("EPHEMERAL_ROOT".to_string(), path_str(&root)),
        ];
        if self.scrubbed() {
            env.push(("LANG".to_string(), "C.UTF-8".to_string()));
        }
        for (key, value) in backend_env {
            if key == "PATH" {
                path = format!("{value}:{path}");
            } else {
                env.push((key.clone(), value.clone()));
            }
        }
        env.push(("PATH".to_string(), path));
        env
    }

    /// Wrap a shell script for execution under this boundary.
    pub(crate) fn command(&self, script: &str, backend_env: &[(String, String)]) -> IsolatedCommand {
        let env = self.environment(backend_env);
        match &self.strategy {
            IsolationStrategy::Process(p) => plain(p.command(&self.paths, script), self.scrubbed(), &env),
            IsolationStrategy::Chroot(c) => plain(c.command(&self.paths, script), self.scrubbed(), &env),
            IsolationStrategy::Namespace(n) => {
                plain(n.command(&self.paths, script), self.scrubbed(), &env)
            }
            IsolationStrategy::Container(c) => {
                let (command, name) = c.command(script, &env);
                IsolatedCommand {
                    command,
                    container: Some(name),
                }
            }
        }
    }

    /// Stop whatever a killed command left behind outside its process group.
    pub(crate) async fn abort(&self, container: Option<&str>) {
        if let (IsolationStrategy::Container(c), Some(name)) = (&self.strategy, container) {
            c.remove(name).await;
        }
    }

    /// Release OS-level resources held by the boundary itself.
    pub(crate) async fn teardown(&self) -> Result<(), SandboxError> {
        match &self.strategy {
            IsolationStrategy::Container(c) => c.teardown().await,
            IsolationStrategy::Process(_)
            | IsolationStrategy::Chroot(_)
            | IsolationStrategy::Namespace(_) => Ok(()),
        }
    }

    fn scrubbed(&self) -> bool {
        self.security != SecurityMode::Permissive
    }
}

/// The strongest level at or below `level` under which commands see the
/// sandbox root at its host path.
pub(crate) fn host_path_level(level: IsolationLevel) -> IsolationLevel {
    match level {
        IsolationLevel::Container => IsolationLevel::Namespace,
        IsolationLevel::Chroot => IsolationLevel::Process,
        IsolationLevel::Namespace | IsolationLevel::Process => level,
    }
}

async fn try_level(level: IsolationLevel, ctx: &IsolationContext<'_>) -> Result<IsolationStrategy, String> {
    let strategy = match level {
        IsolationLevel::Process => IsolationStrategy::Process(ProcessIsolation::probe(ctx)),
        IsolationLevel::Chroot => IsolationStrategy::Chroot(ChrootIsolation::probe(ctx)?),
        IsolationLevel::Namespace => {
            IsolationStrategy::Namespace(NamespaceIsolation::probe(ctx).await?)
        }
        IsolationLevel::Container => {
            IsolationStrategy::Container(ContainerIsolation::probe(ctx).await?)
        }
    };

    match &strategy {
        IsolationStrategy::Process(p) => p.apply(ctx.paths).await?,
        IsolationStrategy::Chroot(c) => c.apply(ctx.paths).await?,
        IsolationStrategy::Namespace(n) => n.apply(ctx.paths).await?,
        IsolationStrategy::Container(c) => c.apply(ctx.paths).await?,
    }
    Ok(strategy)
}

fn plain(mut command: Command, scrub: bool, env: &[(String, String)]) -> IsolatedCommand {
    if scrub {
        command.env_clear();
    }
    command.envs(env.iter().map(|(k, v)| (k, v)));
    IsolatedCommand {
        command,
        container: None,
    }
}

/// Create the private directories every boundary runs commands in.
async fn ensure_dirs(paths: &SandboxPaths) -> Result<(), String> {
    for dir in [paths.work(), paths.home(), paths.tmp()] {
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| format!("failed to create {}: {e}", dir.display()))?;
    }
    Ok(())
}

fn path_str(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context<'a>(
        id: &'a SandboxId,
        paths: &'a SandboxPaths,
        limits: &'a ResourceLimits,
        security: SecurityMode,
        container: &'a ContainerConfig,
    ) -> IsolationContext<'a> {
        IsolationContext {
            id,
            paths,
            limits,
            network: false,
            security,
            container,
        }
    }

    #[test]
    fn host_path_level_skips_relocating_levels() {
        assert_eq!(host_path_level(IsolationLevel::Container), IsolationLevel::Namespace);
        assert_eq!(host_path_level(IsolationLevel::Chroot), IsolationLevel::Process);
        assert_eq!(host_path_level(IsolationLevel::Namespace), IsolationLevel::Namespace);
        assert_eq!(host_path_level(IsolationLevel::Process), IsolationLevel::Process);
    }

    #[tokio::test]
    async fn process_level_always_applies() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig::default();
        let ctx = context(&id, &paths, &limits, SecurityMode::Standard, &container);

        let isolation = Isolation::select(IsolationLevel::Process, &ctx).await.unwrap();

        assert_eq!(isolation.level(), IsolationLevel::Process);
        assert!(paths.work().is_dir());
        assert!(paths.home().is_dir());
        assert_eq!(isolation.guest_root(), tmp.path());
    }

    #[tokio::test]
    async fn container_without_engine_falls_back() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig {
            engine: Some(PathBuf::from("/nonexistent/container-engine")),
            ..ContainerConfig::default()
        };
        let ctx = context(&id, &paths, &limits, SecurityMode::Standard, &container);

        let isolation = Isolation::select(IsolationLevel::Container, &ctx).await.unwrap();

        assert!(
            matches!(
                isolation.level(),
                IsolationLevel::Namespace | IsolationLevel::Process
            ),
            "got {}",
            isolation.level()
        );
        isolation.teardown().await.unwrap();
    }

    #[tokio::test]
    async fn chroot_without_shell_falls_back_to_process() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig::default();
        let ctx = context(&id, &paths, &limits, SecurityMode::Standard, &container);

        let isolation = Isolation::select(IsolationLevel::Chroot, &ctx).await.unwrap();

        assert_eq!(isolation.level(), IsolationLevel::Process);
    }

    #[tokio::test]
    async fn scrubbed_environment_prepends_backend_path() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig::default();
        let ctx = context(&id, &paths, &limits, SecurityMode::Strict, &container);
        let isolation = Isolation::select(IsolationLevel::Process, &ctx).await.unwrap();

        let env = isolation.environment(&[
            ("PATH".to_string(), "/opt/venv/bin".to_string()),
            ("VIRTUAL_ENV".to_string(), "/opt/venv".to_string()),
        ]);
        let get = |key: &str| {
            env.iter()
                .find(|(k, _)| k == key)
                .map(|(_, v)| v.clone())
                .unwrap()
        };

        assert_eq!(get("PATH"), format!("/opt/venv/bin:{DEFAULT_PATH}"));
        assert_eq!(get("VIRTUAL_ENV"), "/opt/venv");
        assert_eq!(get("EPHEMERAL_SANDBOX_ID"), id.to_string());
        assert_eq!(get("HOME"), tmp.path().join("home").display().to_string());
        assert_eq!(get("LANG"), "C.UTF-8");
    }

    #[tokio::test]
    async fn scrubbed_command_hides_host_environment() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig::default();
        let ctx = context(&id, &paths, &limits, SecurityMode::Standard, &container);
        let isolation = Isolation::select(IsolationLevel::Process, &ctx).await.unwrap();

        let mut wrapped = isolation.command("echo \"${CARGO:-unset}\"; pwd", &[]);
        let output = wrapped.command.output().await.unwrap();
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();

        assert_eq!(lines.next(), Some("unset"));
        let cwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            paths.work().canonicalize().unwrap()
        );
        assert!(wrapped.container.is_none());
    }

    #[tokio::test]
    async fn permissive_mode_skips_lang_override() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(tmp.path().to_path_buf());
        let id = SandboxId::generate();
        let limits = ResourceLimits::default();
        let container = ContainerConfig::default();
        let ctx = context(&id, &paths, &limits, SecurityMode::Permissive, &container);
        let isolation = Isolation::select(IsolationLevel::Process, &ctx).await.unwrap();

        let env = isolation.environment(&[]);
        assert!(env.iter().all(|(k, _)| k != "LANG"));
    }
}
