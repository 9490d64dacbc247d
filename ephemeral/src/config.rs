use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::Args;
use sandbox::{Backend, IsolationLevel};
use sandbox_engine::GlobalConfig;
use sandbox_engine::backend::{PythonBackend, PythonTool, ShellBackend};
use serde::Deserialize;

use crate::error::{CliError, CliResult};

/// Contents of `ephemeral.yaml`: engine settings at the top level plus a
/// `backends` section.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    #[serde(flatten)]
    pub engine: GlobalConfig,
    pub backends: BackendsConfig,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub python_tool: PythonTool,
    /// Install template for the shell backend; see [`ShellBackend`].
    pub shell_install: Option<String>,
}

impl BackendsConfig {
    pub fn build(&self) -> Vec<Arc<dyn Backend>> {
        let shell = match &self.shell_install {
            Some(template) => ShellBackend::with_install_template(template.clone()),
            None => ShellBackend::default(),
        };
        vec![
            Arc::new(shell),
            Arc::new(PythonBackend::new(self.python_tool)),
        ]
    }
}

/// Flags shared by every subcommand.
#[derive(Args, Debug, Clone, Default)]
pub struct ConfigArgs {
    /// Path to ephemeral.yaml (defaults are used when omitted)
    #[arg(long, short, env = "EPHEMERAL_CONFIG")]
    pub config: Option<PathBuf>,
    /// Override max_concurrent
    #[arg(long)]
    pub max_concurrent: Option<usize>,
    /// Override default_isolation (process, chroot, namespace, container)
    #[arg(long)]
    pub isolation: Option<IsolationLevel>,
}

impl ConfigArgs {
    /// Load the config file (if any), apply overrides and validate.
    pub async fn load(&self) -> CliResult<FileConfig> {
        let mut config = match &self.config {
            Some(path) => load(path).await?,
            None => FileConfig::default(),
        };
        if let Some(max) = self.max_concurrent {
            config.engine.max_concurrent = max;
        }
        if let Some(isolation) = self.isolation {
            config.engine.default_isolation = isolation;
        }
        config.engine.validate()?;
        Ok(config)
    }
}

/// Parse a YAML config file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> CliResult<FileConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| CliError::Config(format!("read {}: {e}", path.display())))?;
    let mut config = parse(&content)
        .map_err(|e| CliError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    Ok(config)
}

fn parse(content: &str) -> Result<FileConfig, serde_yaml_ng::Error> {
    // An empty file is a valid, all-defaults config.
    if content.trim().is_empty() {
        return Ok(FileConfig::default());
    }
    serde_yaml_ng::from_str(content)
}

impl FileConfig {
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.engine.storage_root);
        resolve(&mut self.engine.shm_root);
        // A bare engine name is looked up on PATH, not relative to the file.
        if let Some(engine) = &mut self.engine.container.engine
            && engine.components().count() > 1
        {
            resolve(engine);
        }
    }
}
