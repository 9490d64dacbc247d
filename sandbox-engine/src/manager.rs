use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::FutureExt;
use sandbox::{
    AggregateStats, Backend, Result, Sandbox, SandboxError, SandboxId, SandboxSpec,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GlobalConfig;
use crate::guard::SandboxGuard;
use crate::lifecycle::{ControllerDeps, SandboxController};
use crate::paths::StorageRoots;
use crate::scheduler::{self, ReclaimPolicy};
use crate::storage::{StorageAllocator, StorageCaps};
use crate::tracker::ResourceTracker;

/// Ids of destroyed sandboxes remembered so a repeated cleanup succeeds.
const TOMBSTONE_CAPACITY: usize = 4096;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Entry {
    controller: Arc<SandboxController>,
    reserved_memory_mb: u64,
    reserved_disk_mb: u64,
}

#[derive(Default)]
struct Registry {
    entries: HashMap<SandboxId, Entry>,
    tombstones: HashSet<SandboxId>,
    tombstone_order: VecDeque<SandboxId>,
}

impl Registry {
    fn reserved(&self) -> (u64, u64) {
        self.entries.values().fold((0, 0), |(memory, disk), e| {
            (memory + e.reserved_memory_mb, disk + e.reserved_disk_mb)
        })
    }

    /// Drop a destroyed sandbox and remember its id.
    fn bury(&mut self, id: &SandboxId) {
        self.entries.remove(id);
        if self.tombstones.insert(id.clone()) {
            self.tombstone_order.push_back(id.clone());
        }
        while self.tombstone_order.len() > TOMBSTONE_CAPACITY {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                self.tombstones.remove(&oldest);
            }
        }
    }
}

pub(crate) struct Shared {
    config: GlobalConfig,
    backends: HashMap<String, Arc<dyn Backend>>,
    storage: Arc<StorageAllocator>,
    tracker: Arc<ResourceTracker>,
    registry: Mutex<Registry>,
    cancel: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
    shut_down: AtomicBool,
}

/// Owns the registry of live sandboxes and enforces global caps.
///
/// Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct SandboxManager {
    shared: Arc<Shared>,
}

impl SandboxManager {
    /// Build a manager. Nothing runs until [`start`](Self::start).
    pub fn new(config: GlobalConfig, backends: Vec<Arc<dyn Backend>>) -> Result<Self> {
        config.validate()?;

        let mut by_name = HashMap::new();
        for backend in backends {
            let name = backend.name().to_string();
            if by_name.insert(name.clone(), backend).is_some() {
                return Err(SandboxError::InvalidConfig(format!(
                    "backend registered twice: {name}"
                )));
            }
        }

        let storage = Arc::new(StorageAllocator::new(
            StorageRoots {
                storage_root: config.storage_root.clone(),
                shm_root: config.shm_root.clone(),
            },
            StorageCaps {
                max_memory_mb: config.max_total_memory_mb,
                max_disk_mb: config.max_total_disk_mb,
            },
        ));
        let tracker = Arc::new(ResourceTracker::new(&config.monitoring));

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                backends: by_name,
                storage,
                tracker,
                registry: Mutex::new(Registry::default()),
                cancel: CancellationToken::new(),
                tasks: Mutex::new(Vec::new()),
                started: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
            }),
        })
    }

    pub(crate) fn from_shared(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.shared.config
    }

    pub fn storage(&self) -> &Arc<StorageAllocator> {
        &self.shared.storage
    }

    pub fn tracker(&self) -> &Arc<ResourceTracker> {
        &self.shared.tracker
    }

    /// Reclaim orphaned storage, then start the sampling loop and the
    /// cleanup scheduler. Calling it again is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(SandboxError::InvalidConfig(
                "sandbox manager has been shut down".into(),
            ));
        }
        if self.shared.started.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.shared.config.storage_root).await?;

        let live: HashSet<SandboxId> = lock(&self.shared.registry)
            .entries
            .keys()
            .cloned()
            .collect();
        let reclaimed = self.shared.storage.reclaim_orphans(&live).await;
        if reclaimed > 0 {
            info!(reclaimed, "reclaimed orphaned sandbox storage");
        }

        let tracker = tokio::spawn(
            Arc::clone(&self.shared.tracker).run(self.shared.cancel.child_token()),
        );
        let scheduler = tokio::spawn(scheduler::run(
            Arc::downgrade(&self.shared),
            self.shared.config.cleanup_interval,
            ReclaimPolicy {
                force_after: self.shared.config.force_cleanup_after,
            },
            self.shared.cancel.child_token(),
        ));
        lock(&self.shared.tasks).extend([tracker, scheduler]);

        info!(
            max_concurrent = self.shared.config.max_concurrent,
            storage_root = %self.shared.config.storage_root.display(),
            "sandbox manager started"
        );
        Ok(())
    }

    /// Create a sandbox and bring it to Ready, then install `spec.artifacts`.
    pub async fn create(&self, spec: SandboxSpec) -> Result<Sandbox> {
        let controller = self.register(&spec)?;
        let id = controller.id().clone();

        if let Err(e) = controller.create().await {
            if controller.owns_storage() {
                // Left registered as Failed; the scheduler retries the release.
                warn!(id = %id, "storage still held after failed create");
            } else {
                lock(&self.shared.registry).entries.remove(&id);
            }
            return Err(e);
        }

        if let Err(e) = controller.install(&spec.artifacts).await {
            warn!(id = %id, error = %e, "initial install failed, destroying sandbox");
            if let Err(cleanup_err) = self.cleanup(&id, true).await {
                warn!(id = %id, error = %cleanup_err, "cleanup after failed install failed");
            }
            return Err(e);
        }

        Ok(controller.snapshot())
    }

    /// Validate `spec` and register a Pending controller, checking caps and
    /// inserting under one registry lock.
    fn register(&self, spec: &SandboxSpec) -> Result<Arc<SandboxController>> {
        spec.validate()?;
        validate_cpu_limit(spec)?;
        let backend = self
            .shared
            .backends
            .get(&spec.backend)
            .cloned()
            .ok_or_else(|| SandboxError::BackendNotAvailable(spec.backend.clone()))?;

        let config = &self.shared.config;
        let mut record = Sandbox::pending(
            spec,
            spec.storage.unwrap_or(config.default_storage),
            spec.isolation.unwrap_or(config.default_isolation),
            spec.security.unwrap_or(config.default_security),
        );
        record.ttl = spec.ttl.or(config.default_ttl);
        record.idle_timeout = spec.idle_timeout.or(config.max_idle_time);

        let reservation = record.reservation_mb(config.default_size_mb);
        let (reserved_memory_mb, reserved_disk_mb) = if record.storage.is_memory_backed() {
            (reservation, 0)
        } else {
            (0, reservation)
        };

        let mut registry = lock(&self.shared.registry);
        // Shutdown flips the flag under this lock before it snapshots the
        // registry, so every insert below is seen by it.
        if self.shared.shut_down.load(Ordering::Acquire) {
            return Err(SandboxError::ResourceExhausted(
                "sandbox manager is shutting down".into(),
            ));
        }
        let live = registry.entries.len();
        if live >= config.max_concurrent {
            return Err(SandboxError::ResourceExhausted(format!(
                "{live} of {} sandboxes in use",
                config.max_concurrent
            )));
        }
        let (memory, disk) = registry.reserved();
        check_cap("memory", memory, reserved_memory_mb, config.max_total_memory_mb)?;
        check_cap("disk", disk, reserved_disk_mb, config.max_total_disk_mb)?;

        let controller = Arc::new(SandboxController::new(
            record,
            ControllerDeps {
                backend,
                storage: Arc::clone(&self.shared.storage),
                tracker: Arc::clone(&self.shared.tracker),
                container: config.container.clone(),
                install_timeout: config.install_timeout,
                default_size_mb: config.default_size_mb,
            },
        ));
        registry.entries.insert(
            controller.id().clone(),
            Entry {
                controller: Arc::clone(&controller),
                reserved_memory_mb,
                reserved_disk_mb,
            },
        );
        Ok(controller)
    }

    /// Snapshots of every registered sandbox, most recently active first.
    pub fn list(&self) -> Vec<Sandbox> {
        let controllers: Vec<_> = lock(&self.shared.registry)
            .entries
            .values()
            .map(|e| Arc::clone(&e.controller))
            .collect();
        let mut sandboxes: Vec<Sandbox> = controllers.iter().map(|c| c.snapshot()).collect();
        sandboxes.sort_by(|a, b| b.last_activity.cmp(&a.last_activity));
        sandboxes
    }

    pub fn get(&self, id: &SandboxId) -> Result<Arc<SandboxController>> {
        lock(&self.shared.registry)
            .entries
            .get(id)
            .map(|e| Arc::clone(&e.controller))
            .ok_or_else(|| SandboxError::NotFound(id.to_string()))
    }

    /// Destroy a sandbox and drop it from the registry.
    ///
    /// Cleaning up an id destroyed earlier returns `Ok(true)`. A failed
    /// non-forced cleanup leaves the sandbox registered as `Failed`.
    pub async fn cleanup(&self, id: &SandboxId, force: bool) -> Result<bool> {
        let controller = {
            let registry = lock(&self.shared.registry);
            match registry.entries.get(id) {
                Some(entry) => Arc::clone(&entry.controller),
                None if registry.tombstones.contains(id) => return Ok(true),
                None => return Err(SandboxError::NotFound(id.to_string())),
            }
        };

        controller.destroy(force).await?;
        lock(&self.shared.registry).bury(id);
        Ok(true)
    }

    /// Usage summed over all registered sandboxes.
    pub async fn stats(&self) -> AggregateStats {
        let (controllers, (reserved_memory_mb, reserved_disk_mb)) = {
            let registry = lock(&self.shared.registry);
            let controllers: Vec<_> = registry
                .entries
                .values()
                .map(|e| Arc::clone(&e.controller))
                .collect();
            (controllers, registry.reserved())
        };

        let config = &self.shared.config;
        let mut stats = AggregateStats {
            sandboxes: controllers.len(),
            max_concurrent: config.max_concurrent,
            reserved_memory_mb,
            reserved_disk_mb,
            max_total_memory_mb: config.max_total_memory_mb,
            max_total_disk_mb: config.max_total_disk_mb,
            ..AggregateStats::default()
        };

        for controller in controllers {
            let usage = match controller.usage() {
                Some(usage) => usage,
                None => self.shared.tracker.sample(controller.monitor()).await,
            };
            stats.memory_mb += usage.memory_mb;
            stats.cpu_percent += usage.cpu_percent;
            stats.disk_mb += usage.disk_mb;
            stats.processes += usage.processes;
        }
        stats
    }

    /// Stop background loops and force-destroy every sandbox within the
    /// configured deadline; stragglers are hard-released. Idempotent.
    pub async fn shutdown(&self) {
        let already = {
            let _registry = lock(&self.shared.registry);
            self.shared.shut_down.swap(true, Ordering::AcqRel)
        };
        if already {
            return;
        }
        info!("shutting down sandbox manager");
        self.shared.cancel.cancel();

        let tasks = std::mem::take(&mut *lock(&self.shared.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "background task failed");
            }
        }

        let controllers: Vec<_> = lock(&self.shared.registry)
            .entries
            .values()
            .map(|e| Arc::clone(&e.controller))
            .collect();

        let mut pending = JoinSet::new();
        for controller in &controllers {
            let controller = Arc::clone(controller);
            pending.spawn(async move { controller.destroy(true).await });
        }

        let deadline = tokio::time::sleep(self.shared.config.shutdown_deadline);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                joined = pending.join_next() => match joined {
                    None => break,
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => warn!(error = %e, "forced destroy failed"),
                    Some(Err(e)) => warn!(error = %e, "forced destroy task failed"),
                },
                _ = &mut deadline => {
                    warn!(
                        remaining = pending.len(),
                        "shutdown deadline reached, hard-releasing remaining sandboxes"
                    );
                    pending.abort_all();
                    break;
                }
            }
        }

        for controller in &controllers {
            if !controller.status().is_terminal() {
                controller.hard_release().await;
            }
            lock(&self.shared.registry).bury(controller.id());
        }
        info!(destroyed = controllers.len(), "sandbox manager shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.shut_down.load(Ordering::Acquire)
    }

    /// Create a sandbox wrapped in a guard that releases it on drop.
    pub async fn acquire(&self, spec: SandboxSpec) -> Result<SandboxGuard> {
        let sandbox = self.create(spec).await?;
        let controller = self.get(&sandbox.id)?;
        Ok(SandboxGuard::new(self.clone(), controller))
    }

    /// Run `f` against a fresh sandbox and release it afterwards, whether
    /// `f` succeeds, fails or panics.
    ///
    /// An error from `f` takes precedence over a release error.
    pub async fn scoped<F, Fut, T>(&self, spec: SandboxSpec, f: F) -> Result<T>
    where
        F: FnOnce(Arc<SandboxController>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(spec).await?;
        let outcome = AssertUnwindSafe(f(guard.controller()))
            .catch_unwind()
            .await;
        let released = guard.release().await;

        match outcome {
            Ok(result) => {
                let value = result?;
                released?;
                Ok(value)
            }
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }
}

fn check_cap(kind: &str, reserved: u64, requested: u64, cap: Option<u64>) -> Result<()> {
    match cap {
        Some(cap) if requested > 0 && reserved.saturating_add(requested) > cap => {
            Err(SandboxError::ResourceExhausted(format!(
                "{kind} reservation of {requested}MB exceeds cap ({reserved}MB of {cap}MB reserved)"
            )))
        }
        _ => Ok(()),
    }
}

/// CPU limits are bounded by `100 × cores`.
fn validate_cpu_limit(spec: &SandboxSpec) -> Result<()> {
    let Some(cpu) = spec.limits.max_cpu_percent else {
        return Ok(());
    };
    let cores = std::thread::available_parallelism().map_or(1, |n| n.get());
    let max = 100.0 * cores as f32;
    if cpu > max {
        return Err(SandboxError::InvalidConfig(format!(
            "max_cpu_percent {cpu} exceeds {max} ({cores} cores)"
        )));
    }
    Ok(())
}
