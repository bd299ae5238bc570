//! Shell script runner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

use super::{CommandExecutor, CommandOutput, Invocation, Runner};

/// Runs shell scripts.
pub struct ShellRunner {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    workdir: PathBuf,
}

impl ShellRunner {
    /// Creates a runner using the shell `binary` in `workdir`.
    #[must_use]
    pub fn new(
        executor: Arc<dyn CommandExecutor>,
        binary: impl Into<PathBuf>,
        workdir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            binary: binary.into(),
            workdir: workdir.into(),
        }
    }

    /// Runs `script` with extra environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if the script exits unsuccessfully.
    pub async fn run(&self, script: &Path, env: &[(String, String)]) -> Result<CommandOutput> {
        info!("Running script {}", script.display());
        let stem = script
            .file_name()
            .map_or_else(|| String::from("script"), |n| n.to_string_lossy().replace('.', "-"));

        let mut invocation = Invocation::new(&self.binary, &self.workdir)
            .arg(script.display().to_string())
            .log_as(format!("shell-{stem}"));
        for (key, value) in env {
            invocation = invocation.env(key, value);
        }

        self.executor.exec(invocation).await
    }
}

#[async_trait]
impl Runner for ShellRunner {
    fn tool(&self) -> &'static str {
        "shell"
    }

    fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ProcessExecutor;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_run_script_with_env() {
        let dir = TempDir::new().expect("temp dir");
        let script = dir.path().join("hook.sh");
        std::fs::write(&script, "echo \"$REDUCER_FROM->$REDUCER_TO\"\n").expect("write script");

        let runner = ShellRunner::new(Arc::new(ProcessExecutor::new("shell")), "sh", dir.path());
        let env = vec![
            (String::from("REDUCER_FROM"), String::from("loki")),
            (String::from("REDUCER_TO"), String::from("opensearch")),
        ];

        let output = runner.run(&script, &env).await.expect("script runs");
        assert_eq!(output.stdout.trim(), "loki->opensearch");
    }
}
