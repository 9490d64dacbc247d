mod common;

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sandbox::{
    Backend, IsolationLevel, ResourceLimits, Result, SandboxError, SandboxSpec, SandboxStatus,
};
use sandbox_engine::{
    ContainerConfig, GlobalConfig, MonitoringConfig, STORAGE_PREFIX, SandboxManager,
};
use tokio::task::JoinSet;

use common::{config, eventually, manager};

/// Storage areas left on disk under either root.
fn storage_dirs(config: &GlobalConfig) -> usize {
    [&config.storage_root, &config.shm_root]
        .into_iter()
        .filter_map(|root| std::fs::read_dir(root).ok())
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(STORAGE_PREFIX))
        .count()
}

/// Replaces its storage directory with a file, so the rollback cannot
/// release it.
struct ClobberBackend;

#[async_trait]
impl Backend for ClobberBackend {
    fn name(&self) -> &str {
        "clobber"
    }

    async fn create_runtime(&self, root: &Path, _version: Option<&str>) -> Result<()> {
        tokio::fs::remove_dir_all(root).await?;
        tokio::fs::write(root, b"not a directory").await?;
        Err(SandboxError::EnvironmentCreation("runtime clobbered".into()))
    }

    fn install_command(&self, _root: &Path, _artifacts: &[String]) -> String {
        String::new()
    }

    fn run_command(&self, _root: &Path, command: &str) -> String {
        command.to_string()
    }

    fn environment(&self, _root: &Path) -> Vec<(String, String)> {
        Vec::new()
    }
}

#[tokio::test]
async fn install_run_destroy() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));

    let sandbox = manager.create(SandboxSpec::new("pkg")).await.unwrap();
    let controller = manager.get(&sandbox.id).unwrap();

    controller.install(&["pkgA".to_string()]).await.unwrap();
    let result = controller
        .execute("run pkgA", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 0, "stderr: {}", result.stderr);
    assert_eq!(controller.snapshot().installed, vec!["pkgA".to_string()]);

    let missing = controller
        .execute("run pkgB", Duration::from_secs(10))
        .await
        .unwrap();
    assert_ne!(missing.exit_code, 0);

    assert!(manager.cleanup(&sandbox.id, false).await.unwrap());
    assert!(manager.list().iter().all(|s| s.id != sandbox.id));
}

#[tokio::test]
async fn artifacts_in_spec_are_installed_on_create() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));

    let sandbox = manager
        .create(SandboxSpec::new("pkg").with_artifacts(["left", "right"]))
        .await
        .unwrap();
    assert_eq!(sandbox.installed, vec!["left".to_string(), "right".to_string()]);

    let result = manager
        .get(&sandbox.id)
        .unwrap()
        .execute("run left && run right", Duration::from_secs(10))
        .await
        .unwrap();
    assert!(result.success());
    manager.shutdown().await;
}

#[tokio::test]
async fn failed_initial_install_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));

    let err = manager
        .create(SandboxSpec::new("pkg").with_artifacts(["nested/missing-dir/pkg"]))
        .await
        .unwrap_err();

    assert!(matches!(err, SandboxError::EnvironmentCreation(_)), "got {err:?}");
    assert!(manager.list().is_empty());
    assert_eq!(manager.storage().reserved(), (0, 0));
}

#[tokio::test]
async fn destroy_releases_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));

    let sandbox = manager.create(SandboxSpec::new("pkg")).await.unwrap();
    let path = sandbox.storage_path.clone().unwrap();
    assert!(manager.storage().is_allocated(&path));

    manager.cleanup(&sandbox.id, false).await.unwrap();

    assert!(!manager.storage().is_allocated(&path));
    assert!(!path.exists());
    assert_eq!(manager.storage().reserved(), (0, 0));
}

#[tokio::test]
async fn create_beyond_max_concurrent_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        max_concurrent: 2,
        ..config(tmp.path())
    });

    manager.create(SandboxSpec::new("pkg")).await.unwrap();
    manager.create(SandboxSpec::new("pkg")).await.unwrap();
    let err = manager.create(SandboxSpec::new("pkg")).await.unwrap_err();

    assert!(err.is_resource_exhausted(), "got {err:?}");
    assert_eq!(manager.list().len(), 2);
    manager.shutdown().await;
}

#[tokio::test]
async fn concurrent_creates_respect_max_concurrent() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        max_concurrent: 3,
        ..config(tmp.path())
    });

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let manager = manager.clone();
        tasks.spawn(async move { manager.create(SandboxSpec::new("pkg")).await });
    }
    let mut created = 0;
    while let Some(joined) = tasks.join_next().await {
        match joined.unwrap() {
            Ok(_) => created += 1,
            Err(e) => assert!(e.is_resource_exhausted(), "got {e:?}"),
        }
    }

    assert_eq!(created, 3);
    assert_eq!(manager.list().len(), 3);
    manager.shutdown().await;
}

#[tokio::test]
async fn forced_cleanup_twice_is_safe() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));
    let sandbox = manager.create(SandboxSpec::new("pkg")).await.unwrap();

    assert!(manager.cleanup(&sandbox.id, true).await.unwrap());
    assert!(manager.cleanup(&sandbox.id, true).await.unwrap());
    assert!(manager.get(&sandbox.id).unwrap_err().is_not_found());
}

#[tokio::test]
async fn scope_cleans_up_after_execute_error() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));
    let spec = SandboxSpec::new("pkg").with_limits(ResourceLimits {
        max_processes: 1,
        ..ResourceLimits::default()
    });
    let mut seen = None;

    let err = manager
        .scoped(spec, |sandbox| {
            seen = Some(Arc::clone(&sandbox));
            async move {
                sandbox.spawn("sleep 30").await?;
                sandbox.execute("true", Duration::from_secs(5)).await
            }
        })
        .await
        .unwrap_err();

    assert!(err.is_resource_exhausted(), "got {err:?}");
    let controller = seen.unwrap();
    assert_eq!(controller.status(), SandboxStatus::Destroyed);
    assert!(controller.storage_path().is_none());
    assert_eq!(controller.live_processes(), 0);
    assert!(manager.list().is_empty());
    assert_eq!(manager.storage().reserved(), (0, 0));
}

#[tokio::test]
async fn unavailable_container_engine_falls_back() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        container: ContainerConfig {
            engine: Some("/nonexistent/container-engine".into()),
            ..ContainerConfig::default()
        },
        ..config(tmp.path())
    });

    let sandbox = manager
        .create(SandboxSpec::new("pkg").with_isolation(IsolationLevel::Container))
        .await
        .unwrap();

    assert_eq!(sandbox.status, SandboxStatus::Ready);
    assert_eq!(sandbox.isolation, IsolationLevel::Container);
    assert!(
        matches!(
            sandbox.effective_isolation,
            Some(IsolationLevel::Process | IsolationLevel::Namespace)
        ),
        "got {:?}",
        sandbox.effective_isolation
    );
    let result = manager
        .get(&sandbox.id)
        .unwrap()
        .execute("echo fallback", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result.stdout.trim(), "fallback");
    manager.shutdown().await;
}

#[tokio::test]
async fn expired_ttl_is_reclaimed_by_scheduler() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        cleanup_interval: Duration::from_millis(200),
        force_cleanup_after: Duration::from_secs(60),
        ..config(tmp.path())
    });
    manager.start().await.unwrap();

    let sandbox = manager
        .create(SandboxSpec::new("pkg").with_ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    let controller = manager.get(&sandbox.id).unwrap();
    let path = sandbox.storage_path.clone().unwrap();

    let reclaimed = eventually(Duration::from_secs(3), || {
        controller.status() == SandboxStatus::Destroyed
    })
    .await;

    assert!(reclaimed, "status: {}", controller.status());
    assert!(!path.exists());
    assert!(manager.list().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn idle_sandbox_is_reclaimed_by_scheduler() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        cleanup_interval: Duration::from_millis(200),
        force_cleanup_after: Duration::from_secs(60),
        ..config(tmp.path())
    });
    manager.start().await.unwrap();

    let idle = manager
        .create(SandboxSpec::new("pkg").with_idle_timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    let kept = manager
        .create(SandboxSpec::new("pkg").with_ttl(Duration::from_secs(3600)))
        .await
        .unwrap();
    let controller = manager.get(&idle.id).unwrap();

    let reclaimed = eventually(Duration::from_secs(3), || {
        controller.status() == SandboxStatus::Destroyed
    })
    .await;

    assert!(reclaimed);
    let ids: Vec<_> = manager.list().into_iter().map(|s| s.id).collect();
    assert_eq!(ids, vec![kept.id]);
    manager.shutdown().await;
}

#[tokio::test]
async fn second_spawn_beyond_process_limit_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));
    let limits = ResourceLimits {
        max_processes: 1,
        ..ResourceLimits::default()
    };
    let sandbox = manager
        .create(SandboxSpec::new("pkg").with_limits(limits))
        .await
        .unwrap();
    let controller = manager.get(&sandbox.id).unwrap();

    let first = controller.spawn("sleep 5").await.unwrap();
    let err = controller.spawn("sleep 5").await.unwrap_err();

    assert!(err.is_resource_exhausted(), "got {err:?}");
    assert_eq!(controller.status(), SandboxStatus::Ready);

    let err = controller
        .wait(first, Duration::from_millis(100))
        .await
        .unwrap_err();
    assert!(matches!(err, SandboxError::Timeout(_)));
    assert_eq!(controller.live_processes(), 0);
    controller.spawn("true").await.unwrap();
    manager.shutdown().await;
}

#[tokio::test]
async fn spawned_output_is_collected_on_wait() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(config(tmp.path()));
    let sandbox = manager.create(SandboxSpec::new("pkg")).await.unwrap();
    let controller = manager.get(&sandbox.id).unwrap();

    let handle = controller.spawn("echo out; echo err >&2; exit 3").await.unwrap();
    let exit = controller.wait(handle, Duration::from_secs(10)).await.unwrap();

    assert_eq!(exit.exit_code, 3);
    assert_eq!(String::from_utf8_lossy(&exit.stdout).trim(), "out");
    assert_eq!(String::from_utf8_lossy(&exit.stderr).trim(), "err");
    manager.shutdown().await;
}

#[tokio::test]
async fn start_reclaims_orphaned_storage() {
    let tmp = tempfile::tempdir().unwrap();
    let config = config(tmp.path());
    let orphan = config.storage_root.join("eph-sbx-crashed");
    std::fs::create_dir_all(orphan.join("work")).unwrap();
    std::fs::write(orphan.join("work/leftover"), b"x").unwrap();
    let unrelated = config.storage_root.join("keep-me");
    std::fs::create_dir_all(&unrelated).unwrap();

    let manager = manager(config);
    manager.start().await.unwrap();

    assert!(!orphan.exists());
    assert!(unrelated.exists());
    manager.shutdown().await;
}

#[tokio::test]
async fn overdue_busy_sandbox_is_force_reclaimed() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        cleanup_interval: Duration::from_millis(200),
        force_cleanup_after: Duration::from_secs(2),
        ..config(tmp.path())
    });
    manager.start().await.unwrap();

    let sandbox = manager
        .create(SandboxSpec::new("pkg").with_ttl(Duration::from_secs(1)))
        .await
        .unwrap();
    let controller = manager.get(&sandbox.id).unwrap();
    let path = sandbox.storage_path.clone().unwrap();

    let running = {
        let controller = Arc::clone(&controller);
        tokio::spawn(async move { controller.execute("sleep 20", Duration::from_secs(60)).await })
    };

    let reclaimed = eventually(Duration::from_secs(6), || {
        controller.status() == SandboxStatus::Destroyed
    })
    .await;

    assert!(reclaimed, "status: {}", controller.status());
    let err = running.await.unwrap().unwrap_err();
    assert!(matches!(err, SandboxError::InvalidState { .. }), "got {err:?}");
    assert!(!path.exists());
    assert!(manager.list().is_empty());
    manager.shutdown().await;
}

#[tokio::test]
async fn process_breach_aborts_execute() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = manager(GlobalConfig {
        monitoring: MonitoringConfig {
            interval: Duration::from_millis(100),
            ..MonitoringConfig::default()
        },
        ..config(tmp.path())
    });
    manager.start().await.unwrap();

    let spec = SandboxSpec::new("pkg").with_limits(ResourceLimits {
        max_processes: 2,
        ..ResourceLimits::default()
    });
    let sandbox = manager.create(spec).await.unwrap();
    let controller = manager.get(&sandbox.id).unwrap();

    let started = Instant::now();
    let err = controller
        .execute("sleep 5 & sleep 5 & sleep 5 & wait", Duration::from_secs(30))
        .await
        .unwrap_err();

    assert!(err.is_resource_exhausted(), "got {err:?}");
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(controller.status(), SandboxStatus::Ready);
    assert_eq!(controller.live_processes(), 0);

    let after = controller.execute("true", Duration::from_secs(10)).await.unwrap();
    assert!(after.success());
    manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_during_creates_leaves_nothing_behind() {
    let tmp = tempfile::tempdir().unwrap();
    let config = GlobalConfig {
        max_concurrent: 64,
        ..config(tmp.path())
    };
    let manager = manager(config.clone());

    let mut creates = JoinSet::new();
    for _ in 0..16 {
        let manager = manager.clone();
        creates.spawn(async move { manager.create(SandboxSpec::new("pkg")).await });
    }
    tokio::task::yield_now().await;
    manager.shutdown().await;

    while let Some(joined) = creates.join_next().await {
        if let Err(e) = joined.unwrap() {
            assert!(
                matches!(e, SandboxError::ResourceExhausted(_) | SandboxError::InvalidState { .. }),
                "got {e:?}"
            );
        }
    }

    assert!(manager.list().is_empty());
    assert_eq!(manager.storage().reserved(), (0, 0));
    assert_eq!(storage_dirs(&config), 0);
    let late = manager.create(SandboxSpec::new("pkg")).await.unwrap_err();
    assert!(late.is_resource_exhausted(), "got {late:?}");
}

#[tokio::test]
async fn unreleased_storage_keeps_failed_sandbox_registered() {
    let tmp = tempfile::tempdir().unwrap();
    let manager = SandboxManager::new(config(tmp.path()), vec![Arc::new(ClobberBackend)]).unwrap();

    let err = manager.create(SandboxSpec::new("clobber")).await.unwrap_err();
    assert!(matches!(err, SandboxError::EnvironmentCreation(_)), "got {err:?}");

    let failed = manager.list();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].status, SandboxStatus::Failed);
    assert!(failed[0].storage_path.is_none());

    // Once the obstruction is gone the forced pass removes the area.
    let root = tmp
        .path()
        .join("storage")
        .join(format!("{STORAGE_PREFIX}{}", failed[0].id));
    std::fs::remove_file(&root).unwrap();
    std::fs::create_dir(&root).unwrap();

    assert!(manager.cleanup(&failed[0].id, true).await.unwrap());
    assert!(manager.list().is_empty());
    assert!(!root.exists());
}
