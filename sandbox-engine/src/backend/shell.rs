use std::path::Path;

use async_trait::async_trait;
use sandbox::{Backend, Result};

use super::quote_all;

const NAME: &str = "shell";

/// Runs commands with `/bin/sh` and no managed runtime.
///
/// Installs expand `install_template`, replacing `{artifacts}` with the quoted
/// artifact list and `{root}` with the sandbox root. Without a template the
/// artifact names are appended to `runtime/installed`.
#[derive(Debug, Clone, Default)]
pub struct ShellBackend {
    install_template: Option<String>,
}

impl ShellBackend {
    pub fn with_install_template(template: impl Into<String>) -> Self {
        Self {
            install_template: Some(template.into()),
        }
    }
}

#[async_trait]
impl Backend for ShellBackend {
    fn name(&self) -> &str {
        NAME
    }

    async fn create_runtime(&self, root: &Path, _version: Option<&str>) -> Result<()> {
        tokio::fs::create_dir_all(root.join("runtime").join("bin")).await?;
        Ok(())
    }

    fn install_command(&self, root: &Path, artifacts: &[String]) -> String {
        let root = root.display().to_string();
        match &self.install_template {
            Some(template) => template
                .replace("{artifacts}", &quote_all(artifacts))
                .replace("{root}", &root),
            None => format!(
                "printf '%s\\n' {} >> {}/runtime/installed",
                quote_all(artifacts),
                super::shell_quote(&root)
            ),
        }
    }

    fn run_command(&self, _root: &Path, command: &str) -> String {
        command.to_string()
    }

    fn environment(&self, root: &Path) -> Vec<(String, String)> {
        vec![(
            "PATH".to_string(),
            root.join("runtime").join("bin").display().to_string(),
        )]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expands_artifacts_and_root() {
        let backend = ShellBackend::with_install_template("cp {artifacts} {root}/runtime/bin");
        let cmd = backend.install_command(
            Path::new("/srv/eph-1"),
            &["tool one".to_string(), "tool2".to_string()],
        );
        assert_eq!(cmd, "cp 'tool one' tool2 /srv/eph-1/runtime/bin");
    }

    #[test]
    fn default_install_records_names() {
        let cmd = ShellBackend::default().install_command(Path::new("/srv/eph-1"), &["a".into()]);
        assert_eq!(cmd, "printf '%s\\n' a >> /srv/eph-1/runtime/installed");
    }

    #[tokio::test]
    async fn runtime_has_bin_dir_on_path() {
        let tmp = tempfile::tempdir().unwrap();
        let backend = ShellBackend::default();
        backend.create_runtime(tmp.path(), None).await.unwrap();

        assert!(tmp.path().join("runtime/bin").is_dir());
        let env = backend.environment(tmp.path());
        assert_eq!(env[0].1, tmp.path().join("runtime/bin").display().to_string());
    }
}
