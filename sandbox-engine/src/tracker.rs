use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use sandbox::{ResourceLimits, ResourceUsage, SandboxId};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::MonitoringConfig;

/// Consecutive over-limit samples before a breach is published.
const BREACH_STREAK: u32 = 2;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Breaches
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub struct LimitBreach {
    pub resource: &'static str,
    pub observed: f64,
    pub limit: f64,
}

impl fmt::Display for LimitBreach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} usage {:.1} exceeds limit {:.1}",
            self.resource, self.observed, self.limit
        )
    }
}

/// First limit `usage` exceeds, if any.
fn check_limits(usage: &ResourceUsage, limits: &ResourceLimits) -> Option<LimitBreach> {
    if let Some(max) = limits.max_memory_mb
        && usage.memory_mb > max as f64
    {
        return Some(LimitBreach {
            resource: "memory_mb",
            observed: usage.memory_mb,
            limit: max as f64,
        });
    }
    if let Some(max) = limits.max_cpu_percent
        && usage.cpu_percent > max
    {
        return Some(LimitBreach {
            resource: "cpu_percent",
            observed: f64::from(usage.cpu_percent),
            limit: f64::from(max),
        });
    }
    if usage.processes > limits.max_processes {
        return Some(LimitBreach {
            resource: "processes",
            observed: f64::from(usage.processes),
            limit: f64::from(limits.max_processes),
        });
    }
    None
}

// ---------------------------------------------------------------------------
// UsageMonitor
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
struct History {
    samples: VecDeque<ResourceUsage>,
    streak: u32,
}

/// Per-sandbox sampling state: the process-group leaders to follow, the
/// storage path to measure, bounded history and the breach channel.
#[derive(Debug)]
pub struct UsageMonitor {
    id: SandboxId,
    limits: ResourceLimits,
    capacity: usize,
    storage: Mutex<Option<PathBuf>>,
    roots: Mutex<HashSet<u32>>,
    history: Mutex<History>,
    breach: watch::Sender<Option<LimitBreach>>,
}

impl UsageMonitor {
    pub fn new(id: SandboxId, limits: ResourceLimits, capacity: usize) -> Self {
        let (breach, _) = watch::channel(None);
        Self {
            id,
            limits,
            capacity: capacity.max(1),
            storage: Mutex::new(None),
            roots: Mutex::new(HashSet::new()),
            history: Mutex::new(History::default()),
            breach,
        }
    }

    pub fn id(&self) -> &SandboxId {
        &self.id
    }

    pub fn set_storage(&self, path: Option<PathBuf>) {
        *lock(&self.storage) = path;
    }

    pub fn add_root(&self, pid: u32) {
        lock(&self.roots).insert(pid);
    }

    pub fn remove_root(&self, pid: u32) {
        lock(&self.roots).remove(&pid);
    }

    pub fn roots(&self) -> Vec<u32> {
        lock(&self.roots).iter().copied().collect()
    }

    pub fn latest(&self) -> Option<ResourceUsage> {
        lock(&self.history).samples.back().cloned()
    }

    /// Samples, oldest first.
    pub fn history(&self) -> Vec<ResourceUsage> {
        lock(&self.history).samples.iter().cloned().collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<LimitBreach>> {
        self.breach.subscribe()
    }

    /// Forget any published breach and the current streak.
    pub fn clear_breach(&self) {
        lock(&self.history).streak = 0;
        self.breach.send_replace(None);
    }

    /// Append a sample and evaluate limits. Returns the breach when one is
    /// published by this sample.
    pub fn record(&self, usage: ResourceUsage) -> Option<LimitBreach> {
        let over = check_limits(&usage, &self.limits);

        let streak = {
            let mut history = lock(&self.history);
            while history.samples.len() >= self.capacity {
                history.samples.pop_front();
            }
            history.samples.push_back(usage);
            history.streak = if over.is_some() { history.streak + 1 } else { 0 };
            history.streak
        };

        let breach = over.filter(|_| streak >= BREACH_STREAK)?;
        warn!(id = %self.id, breach = %breach, "resource limit exceeded");
        self.breach.send_replace(Some(breach.clone()));
        Some(breach)
    }
}

// ---------------------------------------------------------------------------
// ResourceTracker
// ---------------------------------------------------------------------------

/// Samples CPU, memory, disk and process count for every registered sandbox.
pub struct ResourceTracker {
    system: Mutex<System>,
    monitors: Mutex<HashMap<SandboxId, Arc<UsageMonitor>>>,
    enabled: bool,
    interval: Duration,
    history: usize,
}

impl ResourceTracker {
    pub fn new(config: &MonitoringConfig) -> Self {
        Self {
            system: Mutex::new(System::new()),
            monitors: Mutex::new(HashMap::new()),
            enabled: config.enabled,
            interval: config.interval,
            history: config.history,
        }
    }

    /// A monitor sized for this tracker's history. Not sampled until registered.
    pub fn monitor(&self, id: &SandboxId, limits: &ResourceLimits) -> Arc<UsageMonitor> {
        Arc::new(UsageMonitor::new(id.clone(), limits.clone(), self.history))
    }

    pub fn register(&self, monitor: &Arc<UsageMonitor>) {
        lock(&self.monitors).insert(monitor.id().clone(), Arc::clone(monitor));
    }

    pub fn unregister(&self, id: &SandboxId) {
        lock(&self.monitors).remove(id);
    }

    pub fn is_registered(&self, id: &SandboxId) -> bool {
        lock(&self.monitors).contains_key(id)
    }

    /// Take one sample for `monitor` now, record it and return it.
    pub async fn sample(self: &Arc<Self>, monitor: &Arc<UsageMonitor>) -> ResourceUsage {
        self.sample_many(vec![Arc::clone(monitor)])
            .await
            .pop()
            .unwrap_or_else(ResourceUsage::empty)
    }

    /// Sample every registered sandbox once.
    pub async fn sample_all(self: &Arc<Self>) {
        let monitors: Vec<_> = lock(&self.monitors).values().cloned().collect();
        if !monitors.is_empty() {
            self.sample_many(monitors).await;
        }
    }

    async fn sample_many(self: &Arc<Self>, monitors: Vec<Arc<UsageMonitor>>) -> Vec<ResourceUsage> {
        let tracker = Arc::clone(self);
        let measured = tokio::task::spawn_blocking(move || {
            let usages = tracker.measure(&monitors);
            (monitors, usages)
        })
        .await;

        match measured {
            Ok((monitors, usages)) => {
                for (monitor, usage) in monitors.iter().zip(&usages) {
                    monitor.record(usage.clone());
                }
                usages
            }
            Err(e) => {
                warn!(error = %e, "resource sampling task failed");
                Vec::new()
            }
        }
    }

    /// Blocking: refresh the process table once and measure each monitor.
    fn measure(&self, monitors: &[Arc<UsageMonitor>]) -> Vec<ResourceUsage> {
        let needs_processes = monitors.iter().any(|m| !m.roots().is_empty());
        let table = if needs_processes {
            let mut system = lock(&self.system);
            system.refresh_processes(ProcessesToUpdate::All, true);
            process_table(&system)
        } else {
            Vec::new()
        };

        monitors
            .iter()
            .map(|monitor| {
                let totals = tree_totals(&table, &monitor.roots());
                let disk_bytes = lock(&monitor.storage)
                    .clone()
                    .map(|path| dir_size(&path))
                    .unwrap_or(0);
                ResourceUsage {
                    timestamp: Utc::now(),
                    memory_mb: totals.memory_bytes as f64 / BYTES_PER_MB,
                    cpu_percent: totals.cpu_percent,
                    disk_mb: disk_bytes as f64 / BYTES_PER_MB,
                    processes: totals.processes,
                }
            })
            .collect()
    }

    /// Sampling loop; returns when `cancel` fires. A no-op when monitoring
    /// is disabled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if !self.enabled {
            debug!("resource monitoring disabled");
            return;
        }

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => self.sample_all().await,
            }
        }
        debug!("resource tracker stopped");
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ProcInfo {
    pid: u32,
    parent: Option<u32>,
    memory_bytes: u64,
    cpu_percent: f32,
}

#[derive(Debug, Default, PartialEq)]
struct Totals {
    memory_bytes: u64,
    cpu_percent: f32,
    processes: u32,
}

fn process_table(system: &System) -> Vec<ProcInfo> {
    system
        .processes()
        .values()
        .filter(|p| p.thread_kind().is_none())
        .map(|p| ProcInfo {
            pid: p.pid().as_u32(),
            parent: p.parent().map(Pid::as_u32),
            memory_bytes: p.memory(),
            cpu_percent: p.cpu_usage(),
        })
        .collect()
}

/// Sum usage over the process trees rooted at `roots`.
fn tree_totals(table: &[ProcInfo], roots: &[u32]) -> Totals {
    let mut totals = Totals::default();
    if roots.is_empty() {
        return totals;
    }

    let by_pid: HashMap<u32, &ProcInfo> = table.iter().map(|p| (p.pid, p)).collect();
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for p in table {
        if let Some(parent) = p.parent {
            children.entry(parent).or_default().push(p.pid);
        }
    }

    let mut seen = HashSet::new();
    let mut stack: Vec<u32> = roots.to_vec();
    while let Some(pid) = stack.pop() {
        if !seen.insert(pid) {
            continue;
        }
        let Some(info) = by_pid.get(&pid) else {
            continue;
        };
        totals.memory_bytes += info.memory_bytes;
        totals.cpu_percent += info.cpu_percent;
        totals.processes += 1;
        if let Some(kids) = children.get(&pid) {
            stack.extend(kids);
        }
    }
    totals
}

/// Total size of regular files under `root`, without following symlinks.
fn dir_size(root: &Path) -> u64 {
    let mut total = 0;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(entries) = std::fs::read_dir(&dir) else {
            continue;
        };
        for entry in entries.flatten() {
            let Ok(meta) = std::fs::symlink_metadata(entry.path()) else {
                continue;
            };
            if meta.is_dir() {
                stack.push(entry.path());
            } else if meta.is_file() {
                total += meta.len();
            }
        }
    }
    total
}
