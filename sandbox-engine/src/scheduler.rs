use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sandbox::{Sandbox, SandboxId, SandboxStatus};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::manager::{SandboxManager, Shared};

#[derive(Debug, Clone, Copy)]
pub struct ReclaimPolicy {
    /// Age from which reclamation uses forced cleanup.
    pub force_after: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReclaimReason {
    Ttl,
    Idle,
    Failed,
    /// Stuck in Pending/Creating past the force deadline.
    Stale,
}

impl fmt::Display for ReclaimReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Ttl => "ttl",
            Self::Idle => "idle",
            Self::Failed => "failed",
            Self::Stale => "stale",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reclaim {
    pub force: bool,
    pub reason: ReclaimReason,
}

/// Decide whether `sandbox` should be reclaimed at `now`.
///
/// When both TTL and idle timeout have elapsed, the one that elapsed first
/// is reported. Idle time does not accrue while a command is running.
pub fn reclaim_decision(
    sandbox: &Sandbox,
    now: DateTime<Utc>,
    policy: &ReclaimPolicy,
) -> Option<Reclaim> {
    let age = sandbox.age(now);
    let force = age >= policy.force_after;

    let reason = match sandbox.status {
        SandboxStatus::Destroyed | SandboxStatus::CleaningUp => return None,
        SandboxStatus::Failed => {
            return Some(Reclaim {
                force: true,
                reason: ReclaimReason::Failed,
            });
        }
        SandboxStatus::Pending | SandboxStatus::Creating => {
            if !force {
                return None;
            }
            ReclaimReason::Stale
        }
        SandboxStatus::Ready | SandboxStatus::Running => {
            // Time past each expired threshold.
            let ttl_overdue = sandbox.ttl.and_then(|ttl| age.checked_sub(ttl));
            let idle_overdue = match sandbox.status {
                SandboxStatus::Running => None,
                _ => {
                    let idle = sandbox.idle_for(now);
                    sandbox
                        .idle_timeout
                        .filter(|timeout| idle >= *timeout)
                        .map(|timeout| idle - timeout)
                }
            };
            match (ttl_overdue, idle_overdue) {
                (None, None) => return None,
                (Some(_), None) => ReclaimReason::Ttl,
                (None, Some(_)) => ReclaimReason::Idle,
                (Some(ttl), Some(idle)) if ttl >= idle => ReclaimReason::Ttl,
                (Some(_), Some(_)) => ReclaimReason::Idle,
            }
        }
    };

    Some(Reclaim { force, reason })
}

/// Cleanups started by the scheduler, keyed by id, with their force level.
type InFlight = Arc<Mutex<HashMap<SandboxId, bool>>>;

/// Periodic reclamation loop. Exits when `cancel` fires or the manager is
/// dropped.
pub(crate) async fn run(
    shared: Weak<Shared>,
    interval: Duration,
    policy: ReclaimPolicy,
    cancel: CancellationToken,
) {
    let in_flight: InFlight = Arc::default();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(interval_ms = interval.as_millis() as u64, "cleanup scheduler started");

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let Some(shared) = shared.upgrade() else { break };
                scan(SandboxManager::from_shared(shared), &policy, &in_flight, &cancel);
            }
        }
    }
    debug!("cleanup scheduler stopped");
}

fn scan(
    manager: SandboxManager,
    policy: &ReclaimPolicy,
    in_flight: &InFlight,
    cancel: &CancellationToken,
) {
    let now = Utc::now();
    for sandbox in manager.list() {
        let Some(reclaim) = reclaim_decision(&sandbox, now, policy) else {
            continue;
        };
        {
            let mut in_flight = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            match in_flight.get(&sandbox.id) {
                // A graceful cleanup stuck behind a running command is
                // overtaken: the forced one trips the kill switch first.
                Some(false) if reclaim.force => {}
                Some(_) => continue,
                None => {}
            }
            in_flight.insert(sandbox.id.clone(), reclaim.force);
        }

        info!(
            id = %sandbox.id,
            reason = %reclaim.reason,
            force = reclaim.force,
            "reclaiming sandbox"
        );
        let manager = manager.clone();
        let in_flight = Arc::clone(in_flight);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let id = sandbox.id;
            tokio::select! {
                result = manager.cleanup(&id, reclaim.force) => {
                    if let Err(e) = result {
                        error!(id = %id, reason = %reclaim.reason, error = %e, "scheduled cleanup failed");
                    }
                }
                // Shutdown takes over every remaining sandbox.
                _ = cancel.cancelled() => {}
            }
            let mut in_flight = in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            if in_flight.get(&id) == Some(&reclaim.force) {
                in_flight.remove(&id);
            }
        });
    }
}

/// Wait for SIGTERM or SIGINT, then shut `manager` down.
pub async fn shutdown_on_signal(manager: SandboxManager) {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sigterm = signal(SignalKind::terminate()).ok();
    let mut sigint = signal(SignalKind::interrupt()).ok();

    tokio::select! {
        _ = recv_signal(&mut sigterm) => info!("received SIGTERM, shutting down"),
        _ = recv_signal(&mut sigint) => info!("received SIGINT, shutting down"),
    }
    manager.shutdown().await;
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
