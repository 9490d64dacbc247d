use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use sandbox::{
    Backend, IsolationLevel, OperationResult, ProcessExit, Result, ResourceUsage, Sandbox,
    SandboxError, SandboxId, SandboxStatus, SpawnHandle, TIMEOUT_EXIT_CODE,
};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ContainerConfig;
use crate::isolation::{Isolation, IsolationContext, host_path_level};
use crate::paths::SandboxPaths;
use crate::process::{exit_code, kill_process_group};
use crate::storage::StorageAllocator;
use crate::tracker::{LimitBreach, ResourceTracker, UsageMonitor};

/// How long to keep reading output after a command's process group is gone.
/// Bounds the wait on descendants that escaped the group but hold the pipes.
const PIPE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared collaborators handed to every controller.
#[derive(Clone)]
pub(crate) struct ControllerDeps {
    pub backend: Arc<dyn Backend>,
    pub storage: Arc<StorageAllocator>,
    pub tracker: Arc<ResourceTracker>,
    pub container: ContainerConfig,
    pub install_timeout: Duration,
    pub default_size_mb: u64,
}

/// State guarded by the operation slot.
#[derive(Default)]
struct Runtime {
    isolation: Option<Isolation>,
}

/// A background process started with [`SandboxController::spawn`].
struct Spawned {
    child: Child,
    seq: u64,
    container: Option<String>,
}

enum Outcome {
    Exited(ExitStatus),
    TimedOut,
    Breached(LimitBreach),
    Aborted,
    WaitFailed(std::io::Error),
}

/// Drives one sandbox through `Pending → Creating → Ready ⇄ Running →
/// CleaningUp → Destroyed` (or `Failed`).
///
/// `execute`, `install`, `spawn` and `destroy` hold the operation slot, a
/// FIFO async mutex, for their whole duration. The record sits behind its own
/// short-lived lock so [`snapshot`](Self::snapshot) never waits on the slot.
pub struct SandboxController {
    id: SandboxId,
    record: Mutex<Sandbox>,
    slot: tokio::sync::Mutex<Runtime>,
    kill_switch: CancellationToken,
    monitor: Arc<UsageMonitor>,
    /// Storage owned by this sandbox until released. Outlives a failed
    /// non-forced destroy so a retry can still release it.
    allocated: Mutex<Option<PathBuf>>,
    background: Mutex<HashMap<u32, Spawned>>,
    waiting: AtomicUsize,
    spawn_seq: AtomicU64,
    deps: ControllerDeps,
}

impl std::fmt::Debug for SandboxController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxController")
            .field("id", &self.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl SandboxController {
    pub(crate) fn new(record: Sandbox, deps: ControllerDeps) -> Self {
        let monitor = deps.tracker.monitor(&record.id, &record.limits);
        Self {
            id: record.id.clone(),
            record: Mutex::new(record),
            slot: tokio::sync::Mutex::new(Runtime::default()),
            kill_switch: CancellationToken::new(),
            monitor,
            allocated: Mutex::new(None),
            background: Mutex::new(HashMap::new()),
            waiting: AtomicUsize::new(0),
            spawn_seq: AtomicU64::new(0),
            deps,
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    /// Copy of the current record.
    pub fn snapshot(&self) -> Sandbox {
        lock(&self.record).clone()
    }

    pub fn status(&self) -> SandboxStatus {
        lock(&self.record).status
    }

    pub fn effective_isolation(&self) -> Option<IsolationLevel> {
        lock(&self.record).effective_isolation
    }

    pub fn storage_path(&self) -> Option<PathBuf> {
        lock(&self.record).storage_path.clone()
    }

    /// Most recent resource sample, if any.
    pub fn usage(&self) -> Option<ResourceUsage> {
        self.monitor.latest()
    }

    pub fn usage_history(&self) -> Vec<ResourceUsage> {
        self.monitor.history()
    }

    /// Whether storage is still allocated, including after a failed release.
    pub(crate) fn owns_storage(&self) -> bool {
        lock(&self.allocated).is_some()
    }

    pub(crate) fn monitor(&self) -> &Arc<UsageMonitor> {
        &self.monitor
    }

    fn set_status(&self, status: SandboxStatus) {
        let mut record = lock(&self.record);
        debug!(id = %self.id, from = %record.status, to = %status, "status change");
        record.status = status;
    }

    fn invalid_state(&self) -> SandboxError {
        SandboxError::InvalidState {
            id: self.id.to_string(),
            status: self.status(),
        }
    }

    fn paths(&self) -> Result<SandboxPaths> {
        self.storage_path()
            .map(SandboxPaths::new)
            .ok_or_else(|| self.invalid_state())
    }

    /// The active isolation, provided the sandbox accepts operations.
    fn ready<'a>(&self, runtime: &'a Runtime) -> Result<&'a Isolation> {
        if self.kill_switch.is_cancelled() || self.status() != SandboxStatus::Ready {
            return Err(self.invalid_state());
        }
        runtime.isolation.as_ref().ok_or_else(|| self.invalid_state())
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Allocate storage, materialize the runtime and apply isolation.
    ///
    /// On failure everything acquired so far is released and the sandbox is
    /// left `Failed`.
    pub(crate) async fn create(&self) -> Result<()> {
        let mut runtime = self.slot.lock().await;

        let (storage, size_mb) = {
            let record = lock(&self.record);
            if record.status != SandboxStatus::Pending {
                return Err(SandboxError::InvalidState {
                    id: self.id.to_string(),
                    status: record.status,
                });
            }
            (record.storage, record.reservation_mb(self.deps.default_size_mb))
        };

        self.set_status(SandboxStatus::Creating);
        info!(id = %self.id, backend = self.deps.backend.name(), storage = %storage, "creating sandbox");

        let path = match self.deps.storage.allocate(&self.id, storage, size_mb).await {
            Ok(path) => path,
            Err(e) => {
                self.set_status(SandboxStatus::Failed);
                warn!(id = %self.id, error = %e, "storage allocation failed");
                return Err(e.into_creation_error());
            }
        };
        *lock(&self.allocated) = Some(path.clone());
        lock(&self.record).storage_path = Some(path.clone());
        self.monitor.set_storage(Some(path.clone()));

        match self.materialize(&path).await {
            Ok(isolation) => {
                let level = isolation.level();
                runtime.isolation = Some(isolation);
                {
                    let mut record = lock(&self.record);
                    record.effective_isolation = Some(level);
                    record.status = SandboxStatus::Ready;
                    record.touch();
                }
                self.deps.tracker.register(&self.monitor);
                info!(id = %self.id, isolation = %level, path = %path.display(), "sandbox ready");
                Ok(())
            }
            Err(e) => {
                warn!(id = %self.id, error = %e, "sandbox creation failed, rolling back");
                if let Err(release_err) = self.release_storage().await {
                    warn!(id = %self.id, error = %release_err, "rollback failed to release storage");
                }
                {
                    let mut record = lock(&self.record);
                    record.status = SandboxStatus::Failed;
                    record.storage_path = None;
                }
                Err(e)
            }
        }
    }

    async fn materialize(&self, root: &Path) -> Result<Isolation> {
        let paths = SandboxPaths::new(root.to_path_buf());
        for dir in paths.skeleton() {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                SandboxError::EnvironmentCreation(format!(
                    "failed to create {}: {e}",
                    dir.display()
                ))
            })?;
        }

        let (requested, limits, network, security, version) = {
            let record = lock(&self.record);
            (
                record.isolation,
                record.limits.clone(),
                record.network_allowed(),
                record.security,
                record.runtime_version.clone(),
            )
        };

        self.deps
            .backend
            .create_runtime(root, version.as_deref())
            .await?;

        let requested = if self.deps.backend.relocatable() {
            requested
        } else {
            let capped = host_path_level(requested);
            if capped != requested {
                warn!(
                    id = %self.id,
                    backend = self.deps.backend.name(),
                    requested = %requested,
                    effective = %capped,
                    "isolation downgraded, runtime is bound to host paths"
                );
            }
            capped
        };

        let ctx = IsolationContext {
            id: &self.id,
            paths: &paths,
            limits: &limits,
            network,
            security,
            container: &self.deps.container,
        };
        Isolation::select(requested, &ctx).await
    }

    // -----------------------------------------------------------------------
    // Operations
    // -----------------------------------------------------------------------

    /// Run `command` through the backend under the active isolation.
    ///
    /// A command that outlives `timeout` is killed and reported as a failed
    /// result with [`TIMEOUT_EXIT_CODE`]; a published limit breach kills it
    /// and returns `ResourceExhausted`.
    pub async fn execute(&self, command: &str, timeout: Duration) -> Result<OperationResult> {
        let runtime = self.slot.lock().await;
        let isolation = self.ready(&runtime)?;
        self.check_process_budget()?;

        let script = self
            .deps
            .backend
            .run_command(&isolation.guest_root(), command);
        self.run(isolation, command, &script, timeout).await
    }

    /// Install artifacts with the backend's install command.
    pub async fn install(&self, artifacts: &[String]) -> Result<()> {
        if artifacts.is_empty() {
            return Ok(());
        }

        let runtime = self.slot.lock().await;
        let isolation = self.ready(&runtime)?;
        self.check_process_budget()?;

        let script = self
            .deps
            .backend
            .install_command(&isolation.guest_root(), artifacts);
        let result = self
            .run(isolation, &script, &script, self.deps.install_timeout)
            .await?;

        if !result.success() {
            return Err(SandboxError::EnvironmentCreation(format!(
                "install of {} failed (exit {}): {}",
                artifacts.join(", "),
                result.exit_code,
                result.stderr.trim()
            )));
        }

        lock(&self.record).record_installed(artifacts);
        info!(id = %self.id, artifacts = %artifacts.join(","), "artifacts installed");
        Ok(())
    }

    /// Start a background process. Output goes to files under `spawn/`.
    pub async fn spawn(&self, command: &str) -> Result<SpawnHandle> {
        let runtime = self.slot.lock().await;
        let isolation = self.ready(&runtime)?;
        self.check_process_budget()?;

        let paths = self.paths()?;
        let seq = self.spawn_seq.fetch_add(1, Ordering::Relaxed);
        let stdout = std::fs::File::create(paths.spawn_stdout(seq))?;
        let stderr = std::fs::File::create(paths.spawn_stderr(seq))?;

        let script = self
            .deps
            .backend
            .run_command(&isolation.guest_root(), command);
        let env = self.deps.backend.environment(&isolation.guest_root());
        let mut wrapped = isolation.command(&script, &env);
        let child = wrapped
            .command
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()?;
        let pid = child
            .id()
            .ok_or_else(|| SandboxError::Io(std::io::Error::other("spawned process has no pid")))?;

        self.monitor.add_root(pid);
        lock(&self.background).insert(
            pid,
            Spawned {
                child,
                seq,
                container: wrapped.container,
            },
        );
        lock(&self.record).touch();
        info!(id = %self.id, pid, command, "background process started");
        Ok(SpawnHandle { pid })
    }

    /// Wait for a background process. On timeout its group is killed and
    /// `Timeout` is returned.
    pub async fn wait(&self, handle: SpawnHandle, timeout: Duration) -> Result<ProcessExit> {
        let paths = self.paths()?;
        let Spawned {
            mut child,
            seq,
            container,
        } = lock(&self.background)
            .remove(&handle.pid)
            .ok_or_else(|| {
                SandboxError::NotFound(format!("process {} in sandbox {}", handle.pid, self.id))
            })?;
        let _waiting = WaitingGuard::new(self, handle.pid);

        let status = tokio::select! {
            status = child.wait() => Some(status),
            _ = tokio::time::sleep(timeout) => None,
        };
        kill_process_group(handle.pid);

        let Some(status) = status else {
            warn!(id = %self.id, pid = handle.pid, "background process timed out");
            if let Ok(runtime) = self.slot.try_lock()
                && let Some(isolation) = runtime.isolation.as_ref()
            {
                isolation.abort(container.as_deref()).await;
            }
            let _ = child.wait().await;
            return Err(SandboxError::Timeout(timeout));
        };

        let status = status?;
        let stdout = tokio::fs::read(paths.spawn_stdout(seq))
            .await
            .unwrap_or_default();
        let stderr = tokio::fs::read(paths.spawn_stderr(seq))
            .await
            .unwrap_or_default();
        lock(&self.record).touch();

        Ok(ProcessExit {
            pid: handle.pid,
            exit_code: exit_code(status),
            stdout,
            stderr,
        })
    }

    /// Live processes started by this sandbox: running background processes
    /// plus those currently being waited on.
    pub fn live_processes(&self) -> usize {
        let mut running = 0;
        for spawned in lock(&self.background).values_mut() {
            if matches!(spawned.child.try_wait(), Ok(None)) {
                running += 1;
            }
        }
        running + self.waiting.load(Ordering::Acquire)
    }

    fn check_process_budget(&self) -> Result<()> {
        let max = lock(&self.record).limits.max_processes;
        let live = self.live_processes();
        if live + 1 > max as usize {
            return Err(SandboxError::ResourceExhausted(format!(
                "sandbox {} already runs {live} of {max} allowed processes",
                self.id
            )));
        }
        Ok(())
    }

    /// Shared path of `execute` and `install`: Ready → Running → Ready.
    async fn run(
        &self,
        isolation: &Isolation,
        shown: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<OperationResult> {
        self.set_status(SandboxStatus::Running);
        let result = self.run_in_group(isolation, shown, script, timeout).await;
        {
            let mut record = lock(&self.record);
            if record.status == SandboxStatus::Running {
                record.status = SandboxStatus::Ready;
            }
            record.touch();
        }
        result
    }

    async fn run_in_group(
        &self,
        isolation: &Isolation,
        shown: &str,
        script: &str,
        timeout: Duration,
    ) -> Result<OperationResult> {
        let env = self.deps.backend.environment(&isolation.guest_root());
        let mut wrapped = isolation.command(script, &env);
        wrapped
            .command
            .process_group(0)
            .kill_on_drop(true)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut breaches = self.monitor.subscribe();
        self.monitor.clear_breach();

        debug!(id = %self.id, command = %shown, "execute");
        let started = Instant::now();
        let mut child = wrapped.command.spawn()?;
        let Some(pid) = child.id() else {
            return Err(SandboxError::Io(std::io::Error::other(
                "command exited before it could be tracked",
            )));
        };
        self.monitor.add_root(pid);
        let mut stdout = drain(child.stdout.take());
        let mut stderr = drain(child.stderr.take());

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status),
                Err(e) => Outcome::WaitFailed(e),
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            breach = next_breach(&mut breaches) => Outcome::Breached(breach),
            _ = self.kill_switch.cancelled() => Outcome::Aborted,
        };

        // Also reaps anything the command left running in its group.
        kill_process_group(pid);
        if !matches!(outcome, Outcome::Exited(_)) {
            isolation.abort(wrapped.container.as_deref()).await;
            let _ = child.wait().await;
        }
        self.monitor.remove_root(pid);

        let stdout = collect(&mut stdout).await;
        let stderr = collect(&mut stderr).await;
        let duration = started.elapsed();

        let exit_code = match outcome {
            Outcome::Exited(status) => exit_code(status),
            Outcome::TimedOut => {
                warn!(id = %self.id, command = %shown, timeout_ms = timeout.as_millis() as u64, "command timed out");
                return Ok(OperationResult {
                    command: shown.to_string(),
                    exit_code: TIMEOUT_EXIT_CODE,
                    stdout,
                    stderr,
                    duration,
                    timed_out: true,
                });
            }
            Outcome::Breached(breach) => {
                warn!(id = %self.id, command = %shown, breach = %breach, "command killed on limit breach");
                return Err(SandboxError::ResourceExhausted(format!(
                    "sandbox {}: {breach}",
                    self.id
                )));
            }
            Outcome::Aborted => {
                return Err(SandboxError::InvalidState {
                    id: self.id.to_string(),
                    status: SandboxStatus::CleaningUp,
                });
            }
            Outcome::WaitFailed(e) => return Err(SandboxError::Io(e)),
        };

        Ok(OperationResult {
            command: shown.to_string(),
            exit_code,
            stdout,
            stderr,
            duration,
            timed_out: false,
        })
    }

    // -----------------------------------------------------------------------
    // Teardown
    // -----------------------------------------------------------------------

    /// Tear the sandbox down.
    ///
    /// With `force`, in-flight commands are aborted first and every step is
    /// attempted; failures are logged and `Destroyed` is always reached.
    /// Without it, the first failing step leaves the sandbox `Failed` and
    /// returns `Cleanup`. Destroying a destroyed sandbox is a no-op.
    pub async fn destroy(&self, force: bool) -> Result<()> {
        if force {
            self.kill_switch.cancel();
        }
        let mut runtime = self.slot.lock().await;
        if self.status() == SandboxStatus::Destroyed {
            return Ok(());
        }

        self.set_status(SandboxStatus::CleaningUp);
        info!(id = %self.id, force, "destroying sandbox");

        let mut errors = Vec::new();
        self.kill_all();

        if let Some(isolation) = runtime.isolation.as_ref() {
            match isolation.teardown().await {
                Ok(()) => runtime.isolation = None,
                Err(e) => errors.push(e.to_string()),
            }
        }

        self.deps.tracker.unregister(&self.id);

        if let Err(e) = self.release_storage().await {
            errors.push(e.to_string());
        }

        if errors.is_empty() || force {
            for error in &errors {
                warn!(id = %self.id, error = %error, "suppressed cleanup error");
            }
            runtime.isolation = None;
            self.mark_destroyed();
            Ok(())
        } else {
            {
                let mut record = lock(&self.record);
                record.status = SandboxStatus::Failed;
                record.storage_path = None;
            }
            warn!(id = %self.id, errors = %errors.join("; "), "cleanup failed");
            Err(SandboxError::Cleanup(errors.join("; ")))
        }
    }

    /// Last-resort teardown that does not wait for the operation slot.
    ///
    /// Kills every process group and releases storage. Isolation is torn down
    /// only when the slot happens to be free.
    pub(crate) async fn hard_release(&self) {
        self.kill_switch.cancel();
        self.kill_all();

        if let Ok(mut runtime) = self.slot.try_lock()
            && let Some(isolation) = runtime.isolation.take()
            && let Err(e) = isolation.teardown().await
        {
            warn!(id = %self.id, error = %e, "isolation teardown failed during hard release");
        }

        self.deps.tracker.unregister(&self.id);
        if let Err(e) = self.release_storage().await {
            warn!(id = %self.id, error = %e, "storage release failed during hard release");
        }
        self.mark_destroyed();
    }

    fn kill_all(&self) {
        for pid in self.monitor.roots() {
            kill_process_group(pid);
            self.monitor.remove_root(pid);
        }
        let drained: Vec<Spawned> = lock(&self.background)
            .drain()
            .map(|(_, spawned)| spawned)
            .collect();
        for mut spawned in drained {
            let _ = spawned.child.start_kill();
        }
    }

    async fn release_storage(&self) -> Result<()> {
        let Some(path) = lock(&self.allocated).clone() else {
            return Ok(());
        };
        self.deps
            .storage
            .release(&path)
            .await
            .map_err(|e| e.into_cleanup_error())?;
        lock(&self.allocated).take();
        lock(&self.record).storage_path = None;
        self.monitor.set_storage(None);
        Ok(())
    }

    fn mark_destroyed(&self) {
        {
            let mut record = lock(&self.record);
            record.status = SandboxStatus::Destroyed;
            record.storage_path = None;
        }
        info!(id = %self.id, "sandbox destroyed");
    }
}

/// Decrements the wait counter and stops following the process however the
/// wait ends, including cancellation.
struct WaitingGuard<'a> {
    controller: &'a SandboxController,
    pid: u32,
}

impl<'a> WaitingGuard<'a> {
    fn new(controller: &'a SandboxController, pid: u32) -> Self {
        controller.waiting.fetch_add(1, Ordering::AcqRel);
        Self { controller, pid }
    }
}

impl Drop for WaitingGuard<'_> {
    fn drop(&mut self) {
        self.controller.waiting.fetch_sub(1, Ordering::AcqRel);
        self.controller.monitor.remove_root(self.pid);
    }
}

fn drain<R>(pipe: Option<R>) -> JoinHandle<Vec<u8>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf).await;
        }
        buf
    })
}

async fn collect(reader: &mut JoinHandle<Vec<u8>>) -> String {
    match tokio::time::timeout(PIPE_DRAIN_TIMEOUT, &mut *reader).await {
        Ok(Ok(buf)) => String::from_utf8_lossy(&buf).into_owned(),
        Ok(Err(_)) => String::new(),
        Err(_) => {
            reader.abort();
            String::new()
        }
    }
}

/// Resolves with the next published breach; pends forever otherwise.
async fn next_breach(rx: &mut watch::Receiver<Option<LimitBreach>>) -> LimitBreach {
    if let Ok(current) = rx.wait_for(Option::is_some).await
        && let Some(breach) = current.as_ref()
    {
        return breach.clone();
    }
    std::future::pending().await
}
