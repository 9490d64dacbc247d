use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use sandbox::{Backend, Result, SandboxError};
use serde::Deserialize;
use tracing::info;

use super::{quote_all, shell_quote};
use crate::command::exec_timeout;

const NAME: &str = "python";

/// Upper bound on creating a virtualenv.
const VENV_TIMEOUT: Duration = Duration::from_secs(300);

/// Installer used inside the virtualenv.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PythonTool {
    #[default]
    Pip,
    Uv,
}

/// A virtualenv under `runtime/venv`, managed with pip or uv.
#[derive(Debug, Clone, Default)]
pub struct PythonBackend {
    tool: PythonTool,
}

impl PythonBackend {
    pub fn new(tool: PythonTool) -> Self {
        Self { tool }
    }

    fn venv(root: &Path) -> PathBuf {
        root.join("runtime").join("venv")
    }

    /// `python3.X` for a requested version, else `python3`.
    fn interpreter(version: Option<&str>) -> Result<PathBuf> {
        let program = match version {
            Some(v) => format!("python{v}"),
            None => "python3".to_string(),
        };
        which::which(&program).map_err(|e| {
            SandboxError::BackendNotAvailable(format!("{program} not found on PATH: {e}"))
        })
    }
}

#[async_trait]
impl Backend for PythonBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn create_runtime(&self, root: &Path, version: Option<&str>) -> Result<()> {
        let venv = Self::venv(root);
        let venv_arg = venv.display().to_string();

        let created = match self.tool {
            PythonTool::Pip => {
                let python = Self::interpreter(version)?.display().to_string();
                exec_timeout(&python, &["-m", "venv", &venv_arg], VENV_TIMEOUT).await
            }
            PythonTool::Uv => {
                let uv = which::which("uv")
                    .map_err(|e| SandboxError::BackendNotAvailable(format!("uv not found: {e}")))?
                    .display()
                    .to_string();
                let mut args = vec!["venv", "--quiet"];
                if let Some(v) = version {
                    args.extend(["--python", v]);
                }
                args.push(&venv_arg);
                exec_timeout(&uv, &args, VENV_TIMEOUT).await
            }
        };
        created.map_err(|e| SandboxError::EnvironmentCreation(e.to_string()))?;

        info!(venv = %venv.display(), tool = ?self.tool, "virtualenv created");
        Ok(())
    }

    fn install_command(&self, root: &Path, artifacts: &[String]) -> String {
        let venv = Self::venv(root);
        let packages = quote_all(artifacts);
        match self.tool {
            PythonTool::Pip => format!(
                "{} -m pip install --quiet --disable-pip-version-check {packages}",
                shell_quote(&venv.join("bin").join("python").display().to_string())
            ),
            PythonTool::Uv => format!(
                "uv pip install --quiet --python {} {packages}",
                shell_quote(&venv.join("bin").join("python").display().to_string())
            ),
        }
    }

    fn run_command(&self, _root: &Path, command: &str) -> String {
        command.to_string()
    }

    fn environment(&self, root: &Path) -> Vec<(String, String)> {
        let venv = Self::venv(root);
        vec![
            ("VIRTUAL_ENV".to_string(), venv.display().to_string()),
            ("PATH".to_string(), venv.join("bin").display().to_string()),
            ("PIP_NO_INPUT".to_string(), "1".to_string()),
        ]
    }

    /// A venv records its absolute location in its scripts and interpreter
    /// links, so it only runs where it was created.
    fn relocatable(&self) -> bool {
        false
    }
}
