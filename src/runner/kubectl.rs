//! Kubectl runner.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ForgeError, Result, ToolError};

use super::{CommandExecutor, CommandOutput, Invocation, Runner};

/// Field manager used for server-side applies.
const FIELD_MANAGER: &str = "clusterforge";

/// Drives `kubectl` against the cluster of a kubeconfig.
pub struct KubectlRunner {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    workdir: PathBuf,
    kubeconfig: Option<PathBuf>,
}

impl KubectlRunner {
    /// Creates a runner executing `binary` in `workdir`.
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
            kubeconfig: None,
        }
    }

    /// Targets the cluster described by `kubeconfig`.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = Some(kubeconfig.into());
        self
    }

    fn invocation(&self, subcommand: &str) -> Invocation {
        let invocation = Invocation::new(&self.binary, &self.workdir)
            .arg(subcommand)
            .log_as(format!("kubectl-{subcommand}"));
        match &self.kubeconfig {
            Some(path) => invocation.env("KUBECONFIG", path.display().to_string()),
            None => invocation,
        }
    }

    /// Server-side applies every manifest under `path`, recursively.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn apply(&self, path: &Path) -> Result<()> {
        info!("Applying manifests from {}", path.display());
        self.executor
            .exec(
                self.invocation("apply")
                    .args(["--server-side", "--force-conflicts"])
                    .arg(format!("--field-manager={FIELD_MANAGER}"))
                    .arg("-f")
                    .arg(path.display().to_string())
                    .arg("-R"),
            )
            .await?;
        Ok(())
    }

    /// Deletes every manifest under `path`, ignoring missing objects.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn delete(&self, path: &Path) -> Result<()> {
        info!("Deleting manifests from {}", path.display());
        self.executor
            .exec(
                self.invocation("delete")
                    .args(["--ignore-not-found", "-f"])
                    .arg(path.display().to_string())
                    .arg("-R"),
            )
            .await?;
        Ok(())
    }

    /// Gets a resource as JSON.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or prints invalid JSON.
    pub async fn get(&self, resource: &str, namespace: Option<&str>) -> Result<Value> {
        let mut invocation = self.invocation("get").arg(resource).args(["-o", "json"]);
        if let Some(ns) = namespace {
            invocation = invocation.args(["-n", ns]);
        }
        let output = self.executor.exec(invocation).await?;
        serde_json::from_str(&output.stdout).map_err(|e| invalid(e.to_string()))
    }

    /// Returns the client version.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or its output is unexpected.
    pub async fn version(&self) -> Result<String> {
        let output = self
            .executor
            .exec(self.invocation("version").args(["--client", "-o", "json"]))
            .await?;
        let parsed: Value = serde_json::from_str(&output.stdout).map_err(|e| invalid(e.to_string()))?;
        parsed
            .pointer("/clientVersion/gitVersion")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| invalid(String::from("missing clientVersion.gitVersion")))
    }

    /// Checks that the API server answers its readiness endpoint.
    ///
    /// # Errors
    ///
    /// Returns `ClusterUnreachable` if it does not.
    pub async fn check_reachable(&self) -> Result<()> {
        debug!("Checking cluster reachability");
        self.executor
            .exec(self.invocation("get").args(["--raw", "/readyz"]))
            .await
            .map(|_| ())
            .map_err(|e| {
                ForgeError::Tool(ToolError::ClusterUnreachable {
                    message: e.to_string(),
                })
            })
    }

    /// Runs an arbitrary kubectl command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn passthrough(&self, args: &[String]) -> Result<CommandOutput> {
        let subcommand = args.first().map_or("exec", String::as_str);
        let mut invocation = self.invocation(subcommand);
        invocation.args = args.to_vec();
        self.executor.exec(invocation).await
    }
}

fn invalid(message: String) -> ForgeError {
    ToolError::InvalidOutput {
        binary: String::from("kubectl"),
        message,
    }
    .into()
}

#[async_trait]
impl Runner for KubectlRunner {
    fn tool(&self) -> &'static str {
        "kubectl"
    }

    fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::SpyExecutor;

    #[tokio::test]
    async fn test_apply_is_server_side_and_recursive() {
        let spy = Arc::new(SpyExecutor::new());
        let runner = KubectlRunner::new(spy.clone(), "kubectl", "/op").with_kubeconfig("/op/secrets/kubeconfig");

        runner.apply(Path::new("/op/manifests")).await.expect("apply");

        let call = &spy.calls()[0];
        assert!(call.args.contains(&String::from("--server-side")));
        assert!(call.args.ends_with(&[String::from("-f"), String::from("/op/manifests"), String::from("-R")]));
        assert!(
            call.env
                .contains(&(String::from("KUBECONFIG"), String::from("/op/secrets/kubeconfig")))
        );
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let spy = Arc::new(SpyExecutor::new());
        spy.fail_on("get");
        let runner = KubectlRunner::new(spy, "kubectl", "/op");

        let err = runner.check_reachable().await.expect_err("unreachable");
        assert!(err.is_cluster_unreachable());
    }

    #[tokio::test]
    async fn test_passthrough_keeps_arguments() {
        let spy = Arc::new(SpyExecutor::new());
        let runner = KubectlRunner::new(spy.clone(), "kubectl", "/op");
        let args = vec![String::from("get"), String::from("nodes")];

        runner.passthrough(&args).await.expect("passthrough");
        assert_eq!(spy.calls()[0].args, args);
        assert_eq!(spy.calls()[0].log_name.as_deref(), Some("kubectl-get"));
    }
}
