//! The kubernetes phase: control plane and nodes via Terraform, then the
//! kubeconfig.

use async_trait::async_trait;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{MergeModel, Merger, lookup};
use crate::error::{ConfigError, Result};
use crate::runner::{AwsCliRunner, ExecutorFactory, Runner, TerraformRunner};

use super::gate::{Prompter, plan_gate_apply};
use super::render::{phase_merger, read_outputs};
use super::template::TemplateRenderer;
use super::{OperationPhase, Phase, PhaseContext, PhaseExec, Stage};

/// Infrastructure outputs injected into the kubernetes data, with the key
/// they are injected under.
const INJECTED_OUTPUTS: [(&str, &str); 2] = [("vpc_id", "vpcId"), ("private_subnets", "subnetIds")];

/// Terraform output holding the cluster kubeconfig.
const KUBECONFIG_OUTPUT: &str = "kubeconfig";

/// The kubernetes phase.
pub struct KubernetesPhase {
    op: OperationPhase,
    infra_outputs: std::path::PathBuf,
    terraform: Arc<TerraformRunner>,
    aws: Arc<AwsCliRunner>,
    renderer: Arc<dyn TemplateRenderer>,
    prompter: Arc<dyn Prompter>,
}

impl KubernetesPhase {
    /// Creates the phase for `ctx`.
    #[must_use]
    pub fn new(
        ctx: &PhaseContext,
        factory: &dyn ExecutorFactory,
        renderer: Arc<dyn TemplateRenderer>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        let op = ctx.paths.operation(Phase::Kubernetes);
        let terraform = TerraformRunner::new(
            factory.executor("terraform", &op.logs),
            &ctx.tools.terraform,
            &op.terraform,
        );
        let aws = AwsCliRunner::new(factory.executor("aws", &op.logs), &ctx.tools.aws, &op.path);

        Self {
            infra_outputs: ctx.paths.operation(Phase::Infrastructure).output_file(),
            op,
            terraform: Arc::new(terraform),
            aws: Arc::new(aws),
            renderer,
            prompter,
        }
    }

    /// Values discovered by the infrastructure phase.
    async fn discovered(&self, ctx: &PhaseContext) -> Result<Map<String, Value>> {
        let mut injected = Map::new();

        let Some(outputs) = read_outputs(&self.infra_outputs).await? else {
            if !ctx.dry_run {
                return Err(ConfigError::validation(
                    "infrastructure outputs are missing, apply the infrastructure phase first",
                    ".spec.infrastructure",
                )
                .into());
            }
            info!("Dry run: injecting placeholder infrastructure outputs");
            injected.insert(String::from("vpcId"), json!("vpc-dry-run"));
            injected.insert(
                String::from("subnetIds"),
                json!(["subnet-dry-run-a", "subnet-dry-run-b"]),
            );
            return Ok(injected);
        };

        for (output, key) in INJECTED_OUTPUTS {
            match outputs.get(output) {
                Some(o) => {
                    injected.insert(key.to_string(), o.value.clone());
                }
                None => debug!("Infrastructure output {} not found", output),
            }
        }
        Ok(injected)
    }

    /// Effective kubernetes data: defaults, then the user spec, then the
    /// values discovered at runtime.
    async fn data(&self, ctx: &PhaseContext) -> Result<Map<String, Value>> {
        let configured = phase_merger(&ctx.defaults, &ctx.config.tree, Phase::Kubernetes)?
            .merge_into_base()?;

        let mut data = if ctx.declares(Phase::Infrastructure) {
            let discovered = MergeModel::new(
                json!({ "data": { "kubernetes": self.discovered(ctx).await? } }),
                ".data.kubernetes",
            );
            Merger::new(configured, discovered).merge()?
        } else {
            configured.get()?.clone()
        };

        data.insert(
            String::from("clusterName"),
            Value::String(ctx.config.name().to_string()),
        );
        Ok(data)
    }

    async fn write_kubeconfig(&self, ctx: &PhaseContext) -> Result<()> {
        if ctx.dry_run {
            info!("Dry run: not fetching the kubeconfig");
            return Ok(());
        }

        let kubeconfig = &ctx.paths.kubeconfig;
        if let Some(parent) = kubeconfig.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let outputs = read_outputs(&self.op.output_file()).await?.unwrap_or_default();
        if let Some(content) = outputs.get(KUBECONFIG_OUTPUT).and_then(|o| o.value.as_str()) {
            tokio::fs::write(kubeconfig, content).await?;
            info!("Kubeconfig written to {}", kubeconfig.display());
            return Ok(());
        }

        if ctx.config.is_eks() {
            let region = lookup(&ctx.config.tree, ".spec.region").and_then(Value::as_str);
            return self
                .aws
                .update_kubeconfig(ctx.config.name(), region, kubeconfig)
                .await;
        }

        warn!("No kubeconfig output, provide one at {}", kubeconfig.display());
        Ok(())
    }
}

#[async_trait]
impl PhaseExec for KubernetesPhase {
    fn phase(&self) -> Phase {
        Phase::Kubernetes
    }

    async fn prepare(&self, ctx: &PhaseContext) -> Result<()> {
        self.op.create_dirs().await?;
        let data = self.data(ctx).await?;
        self.renderer
            .render(&ctx.distro_dir, &self.op, &Value::Object(data))
            .await
    }

    async fn run_stage(&self, stage: Stage, ctx: &PhaseContext) -> Result<()> {
        match stage {
            Stage::Pre => self.terraform.init().await,
            Stage::Core => {
                plan_gate_apply(&self.terraform, &self.op, ctx, self.prompter.as_ref()).await
            }
            Stage::Post => self.write_kubeconfig(ctx).await,
        }
    }

    fn runners(&self) -> Vec<Arc<dyn Runner>> {
        vec![
            self.terraform.clone() as Arc<dyn Runner>,
            self.aws.clone() as Arc<dyn Runner>,
        ]
    }
}
