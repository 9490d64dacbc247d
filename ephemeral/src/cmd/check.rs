use std::path::Path;
use std::process::ExitCode;

use clap::Args;
use sandbox::IsolationLevel;
use sandbox_engine::GlobalConfig;

use crate::config::ConfigArgs;
use crate::error::CliResult;

#[derive(Args)]
pub struct CheckArgs {
    #[command(flatten)]
    config: ConfigArgs,
}

/// One line of the report.
struct Probe {
    label: String,
    ok: bool,
    detail: String,
    /// Failures here make `check` exit non-zero.
    required: bool,
}

impl Probe {
    fn tool(label: &str, program: &str, required: bool) -> Self {
        match which::which(program) {
            Ok(path) => Self {
                label: label.to_string(),
                ok: true,
                detail: path.display().to_string(),
                required,
            },
            Err(_) => Self {
                label: label.to_string(),
                ok: false,
                detail: format!("{program} not on PATH"),
                required,
            },
        }
    }
}

/// Validate the config and report which host facilities are present.
pub async fn run_check(args: CheckArgs) -> CliResult<ExitCode> {
    let config = args.config.load().await?;
    let probes = probes(&config.engine).await;

    println!("config: ok");
    for probe in &probes {
        let mark = match (probe.ok, probe.required) {
            (true, _) => "ok",
            (false, true) => "FAIL",
            (false, false) => "missing",
        };
        println!("{:<24} {:<8} {}", probe.label, mark, probe.detail);
    }

    if probes.iter().any(|p| p.required && !p.ok) {
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn probes(config: &GlobalConfig) -> Vec<Probe> {
    let root = nix::unistd::geteuid().is_root();
    let wants = |level: IsolationLevel| config.default_isolation == level;

    vec![
        writable("storage_root", &config.storage_root).await,
        Probe {
            label: "shm_root".to_string(),
            ok: config.shm_root.is_dir(),
            detail: config.shm_root.display().to_string(),
            required: false,
        },
        Probe {
            label: "root (tmpfs, chroot)".to_string(),
            ok: root,
            detail: (if root { "euid 0" } else { "unprivileged" }).to_string(),
            required: false,
        },
        Probe::tool("sh", "sh", true),
        Probe::tool("unshare (namespace)", "unshare", wants(IsolationLevel::Namespace)),
        Probe::tool("chroot", "chroot", wants(IsolationLevel::Chroot)),
        container_engine(config),
        Probe::tool("python3", "python3", false),
        Probe::tool("uv", "uv", false),
    ]
}

async fn writable(label: &str, dir: &Path) -> Probe {
    let result = async {
        tokio::fs::create_dir_all(dir).await?;
        let marker = dir.join(".ephemeral-check");
        tokio::fs::write(&marker, b"").await?;
        tokio::fs::remove_file(&marker).await
    }
    .await;

    Probe {
        label: label.to_string(),
        ok: result.is_ok(),
        detail: match result {
            Ok(()) => dir.display().to_string(),
            Err(e) => format!("{}: {e}", dir.display()),
        },
        required: true,
    }
}

fn container_engine(config: &GlobalConfig) -> Probe {
    let required = config.default_isolation == IsolationLevel::Container;
    match &config.container.engine {
        Some(engine) => Probe::tool("container engine", &engine.display().to_string(), required),
        None => {
            let docker = Probe::tool("container engine", "docker", required);
            if docker.ok {
                docker
            } else {
                Probe::tool("container engine", "podman", required)
            }
        }
    }
}
