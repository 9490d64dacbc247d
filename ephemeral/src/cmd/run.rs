use std::process::ExitCode;
use std::time::{Duration, Instant};

use clap::Args;
use sandbox::{OperationResult, ResourceLimits, SandboxSpec, StorageBackend};
use sandbox_engine::{SandboxManager, shutdown_on_signal};
use tracing::{info, warn};

use crate::config::ConfigArgs;
use crate::error::{CliError, CliResult};

#[derive(Args)]
pub struct RunArgs {
    #[command(flatten)]
    config: ConfigArgs,
    /// Backend to create the sandbox with
    #[arg(long, short, default_value = "shell")]
    backend: String,
    /// Runtime version passed to the backend (e.g. 3.12)
    #[arg(long)]
    runtime_version: Option<String>,
    /// Artifact to install before running (repeatable)
    #[arg(long = "install", short = 'i')]
    artifacts: Vec<String>,
    /// Storage backend (tmpfs, memory, disk)
    #[arg(long)]
    storage: Option<StorageBackend>,
    /// Memory limit in MB
    #[arg(long)]
    memory_mb: Option<u64>,
    /// Maximum number of processes
    #[arg(long)]
    max_processes: Option<u32>,
    /// Allow network access
    #[arg(long)]
    network: bool,
    /// Command timeout in seconds
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
    /// The shell command to run inside the sandbox
    #[arg(required = true, trailing_var_arg = true)]
    command: Vec<String>,
}

impl RunArgs {
    fn spec(&self) -> SandboxSpec {
        let defaults = ResourceLimits::default();
        let limits = ResourceLimits {
            max_memory_mb: self.memory_mb.or(defaults.max_memory_mb),
            max_processes: self.max_processes.unwrap_or(defaults.max_processes),
            network_access: self.network,
            ..defaults
        };
        let mut spec = SandboxSpec::new(&self.backend)
            .with_limits(limits)
            .with_artifacts(self.artifacts.iter().cloned())
            .with_tag("origin", "ephemeral-run");
        if let Some(version) = &self.runtime_version {
            spec = spec.with_runtime_version(version.clone());
        }
        if let Some(storage) = self.storage {
            spec = spec.with_storage(storage);
        }
        spec
    }
}

/// Create a sandbox, run one command in it and tear it down.
pub async fn run_run(args: RunArgs) -> CliResult<ExitCode> {
    let total = Instant::now();
    let config = args.config.load().await?;
    let manager = SandboxManager::new(config.engine, config.backends.build())?;
    manager.start().await?;

    let command = args.command.join(" ");
    let timeout = Duration::from_secs(args.timeout_secs);
    let spec = args.spec();

    let result = tokio::select! {
        result = manager.scoped(spec, |sandbox| {
            let command = command.clone();
            async move {
                info!(
                    id = %sandbox.id(),
                    isolation = ?sandbox.effective_isolation(),
                    "sandbox ready"
                );
                sandbox.execute(&command, timeout).await
            }
        }) => result.map_err(CliError::from),
        _ = shutdown_on_signal(manager.clone()) => Err(CliError::Interrupted),
    };
    manager.shutdown().await;

    let result = result?;
    info!(
        exit_code = result.exit_code,
        timed_out = result.timed_out,
        exec_ms = result.duration.as_millis() as u64,
        total_ms = total.elapsed().as_millis() as u64,
        "run complete"
    );
    print_output(&result);
    Ok(ExitCode::from(exit_status(result.exit_code)))
}

fn print_output(result: &OperationResult) {
    if !result.stdout.is_empty() {
        print!("{}", result.stdout);
    }
    if !result.stderr.is_empty() {
        eprint!("{}", result.stderr);
    }
}

fn exit_status(code: i32) -> u8 {
    match u8::try_from(code) {
        Ok(c) => c,
        Err(_) => {
            warn!(exit_code = code, "exit code out of u8 range, using 1");
            1
        }
    }
}
