//! Terraform runner.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

use crate::error::{ForgeError, Result, ToolError};

use super::{CommandExecutor, CommandOutput, Invocation, Runner};

/// A single Terraform output as persisted in `outputs/output.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerraformOutput {
    /// Output value.
    pub value: Value,
    /// Whether Terraform marked the output as sensitive.
    #[serde(default)]
    pub sensitive: bool,
}

/// Drives `terraform` inside a phase's terraform directory.
pub struct TerraformRunner {
    executor: Arc<dyn CommandExecutor>,
    binary: PathBuf,
    workdir: PathBuf,
}

impl TerraformRunner {
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

    fn invocation(&self, subcommand: &str) -> Invocation {
        Invocation::new(&self.binary, &self.workdir)
            .arg(subcommand)
            .env("TF_IN_AUTOMATION", "1")
            .log_as(format!("terraform-{subcommand}"))
    }

    /// Runs `terraform init`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn init(&self) -> Result<()> {
        info!("Running terraform init in {}", self.workdir.display());
        self.executor
            .exec(self.invocation("init").args(["-input=false", "-no-color"]))
            .await?;
        Ok(())
    }

    /// Runs `terraform plan`, saving the plan to `plan_file`, and returns
    /// the human readable plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn plan(&self, plan_file: &Path) -> Result<String> {
        info!("Running terraform plan");
        let output = self
            .executor
            .exec(
                self.invocation("plan")
                    .args(["-input=false", "-no-color"])
                    .arg(format!("-out={}", plan_file.display())),
            )
            .await?;
        Ok(output.stdout)
    }

    /// Applies a saved plan.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn apply(&self, plan_file: &Path) -> Result<()> {
        info!("Running terraform apply");
        self.executor
            .exec(
                self.invocation("apply")
                    .args(["-input=false", "-no-color", "-auto-approve"])
                    .arg(plan_file.display().to_string()),
            )
            .await?;
        Ok(())
    }

    /// Destroys every resource of the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn destroy(&self) -> Result<()> {
        info!("Running terraform destroy");
        self.executor
            .exec(
                self.invocation("destroy")
                    .args(["-input=false", "-no-color", "-auto-approve"]),
            )
            .await?;
        Ok(())
    }

    /// Reads the outputs and writes them to `output_file` as
    /// `name -> {value, sensitive}`.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails, prints invalid JSON, or the
    /// file cannot be written.
    pub async fn output(&self, output_file: &Path) -> Result<BTreeMap<String, TerraformOutput>> {
        let output = self
            .executor
            .exec(self.invocation("output").args(["-json", "-no-color"]))
            .await?;

        let outputs = parse_outputs(&output.stdout)?;
        debug!("Terraform reported {} output(s)", outputs.len());

        let json = serde_json::to_string_pretty(&outputs).map_err(|e| invalid(e.to_string()))?;
        if let Some(parent) = output_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output_file, json).await?;

        Ok(outputs)
    }

    /// Returns the Terraform version.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails or its output is unexpected.
    pub async fn version(&self) -> Result<String> {
        let output = self
            .executor
            .exec(self.invocation("version").arg("-json"))
            .await?;
        let parsed: Value = serde_json::from_str(&output.stdout).map_err(|e| invalid(e.to_string()))?;
        parsed
            .get("terraform_version")
            .and_then(Value::as_str)
            .map(String::from)
            .ok_or_else(|| invalid(String::from("missing terraform_version")))
    }

    /// Runs an arbitrary terraform command.
    ///
    /// # Errors
    ///
    /// Returns an error if the command fails.
    pub async fn passthrough(&self, args: &[String]) -> Result<CommandOutput> {
        let subcommand = args.first().map_or("exec", String::as_str);
        let invocation = Invocation::new(&self.binary, &self.workdir)
            .args(args.iter().cloned())
            .env("TF_IN_AUTOMATION", "1")
            .log_as(format!("terraform-{subcommand}"));
        self.executor.exec(invocation).await
    }
}

fn invalid(message: String) -> ForgeError {
    ToolError::InvalidOutput {
        binary: String::from("terraform"),
        message,
    }
    .into()
}

/// Parses `terraform output -json`.
///
/// # Errors
///
/// Returns `InvalidOutput` if the text is not a map of outputs.
pub fn parse_outputs(text: &str) -> Result<BTreeMap<String, TerraformOutput>> {
    if text.trim().is_empty() {
        return Ok(BTreeMap::new());
    }
    serde_json::from_str(text).map_err(|e| invalid(e.to_string()))
}

#[async_trait]
impl Runner for TerraformRunner {
    fn tool(&self) -> &'static str {
        "terraform"
    }

    fn executor(&self) -> &Arc<dyn CommandExecutor> {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::testing::SpyExecutor;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_parse_outputs_drops_type() {
        let outputs = parse_outputs(
            r#"{"vpc_id":{"sensitive":false,"type":"string","value":"vpc-123"},
               "kubeconfig":{"sensitive":true,"type":"string","value":"apiVersion: v1"}}"#,
        )
        .expect("valid outputs");

        assert_eq!(outputs["vpc_id"].value, json!("vpc-123"));
        assert!(outputs["kubeconfig"].sensitive);
        assert!(parse_outputs("").expect("empty").is_empty());
        assert!(parse_outputs("[1]").is_err());
    }

    #[tokio::test]
    async fn test_plan_and_apply_use_saved_plan() {
        let spy = Arc::new(SpyExecutor::new());
        spy.respond("plan", "No changes.");
        let runner = TerraformRunner::new(spy.clone(), "terraform", "/op/terraform");

        let text = runner.plan(Path::new("/op/plan/terraform.plan")).await.expect("plan");
        assert_eq!(text, "No changes.");
        runner.apply(Path::new("/op/plan/terraform.plan")).await.expect("apply");

        let calls = spy.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[0].args.contains(&String::from("-out=/op/plan/terraform.plan")));
        assert_eq!(calls[1].args.last().map(String::as_str), Some("/op/plan/terraform.plan"));
        assert_eq!(calls[1].log_name.as_deref(), Some("terraform-apply"));
        assert!(calls.iter().all(|c| c.workdir == Path::new("/op/terraform")));
    }

    #[tokio::test]
    async fn test_output_written_to_file() {
        let dir = TempDir::new().expect("temp dir");
        let spy = Arc::new(SpyExecutor::new());
        spy.respond("output", r#"{"vpc_id":{"sensitive":false,"type":"string","value":"vpc-1"}}"#);
        let runner = TerraformRunner::new(spy, "terraform", dir.path());

        let file = dir.path().join("outputs/output.json");
        let outputs = runner.output(&file).await.expect("outputs");
        assert_eq!(outputs.len(), 1);

        let written: Value =
            serde_json::from_str(&std::fs::read_to_string(&file).expect("file written")).expect("json");
        assert_eq!(written, json!({ "vpc_id": { "value": "vpc-1", "sensitive": false } }));
    }

    #[tokio::test]
    async fn test_version() {
        let spy = Arc::new(SpyExecutor::new());
        spy.respond("version", r#"{"terraform_version":"1.9.5","platform":"linux_amd64"}"#);
        let runner = TerraformRunner::new(spy, "terraform", "/tmp");
        assert_eq!(runner.version().await.expect("version"), "1.9.5");
    }
}
