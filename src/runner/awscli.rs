//! AWS CLI runner.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

use crate::error::Result;

use super::{CommandExecutor, CommandOutput, Invocation, Runner};

/// Drives the `aws` command line.
pub struct AwsCliRunner {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    workdir: PathBuf,
}

impl AwsCliRunner {
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
        }
    }

    /// Writes a kubeconfig for an EKS cluster to `kubeconfig`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn update_kubeconfig(
        &self,
        cluster_name: &str,
        region: Option<&str>,
        kubeconfig: &Path,
    ) -> Result<()> {
        info!("Fetching kubeconfig for EKS cluster {}", cluster_name);
        let mut invocation = Invocation::new(&self.binary, &self.workdir)
            .args(["eks", "update-kubeconfig", "--name", cluster_name])
            .arg("--kubeconfig")
            .arg(kubeconfig.display().to_string())
            .log_as("aws-eks");
        if let Some(region) = region {
            invocation = invocation.args(["--region", region]);
        }
        self.executor.exec(invocation).await?;
        Ok(())
    }

    /// Runs an arbitrary aws command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn passthrough(&self, args: &[String]) -> Result<CommandOutput> {
        let subcommand = args.first().map_or("exec", String::as_str);
        let invocation = Invocation::new(&self.binary, &self.workdir)
            .args(args.iter().cloned())
            .log_as(format!("aws-{subcommand}"));
        self.executor.exec(invocation).await
    }
}

#[async_trait]
impl Runner for AwsCliRunner {
    fn tool(&self) -> &'static str {
        "aws"
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
    async fn test_update_kubeconfig_arguments() {
        let spy = Arc::new(SpyExecutor::new());
        let runner = AwsCliRunner::new(spy.clone(), "aws", "/op");

        runner
            .update_kubeconfig("demo", Some("eu-west-1"), Path::new("/op/secrets/kubeconfig"))
            .await
            .expect("update kubeconfig");

        let args = spy.calls()[0].args.join(" ");
        assert_eq!(
            args,
            "eks update-kubeconfig --name demo --kubeconfig /op/secrets/kubeconfig --region eu-west-1"
        );
    }
}
