//! The infrastructure phase: network and VPN via Terraform.

use async_trait::async_trait;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::lookup;
use crate::error::Result;
use crate::runner::{ExecutorFactory, Runner, TerraformRunner, VpnRunner};

use super::gate::{Prompter, plan_gate_apply};
use super::render::{phase_data, read_outputs};
use super::template::TemplateRenderer;
use super::{OperationPhase, Phase, PhaseContext, PhaseExec, Stage};

/// Terraform output holding the VPN client configuration.
const VPN_CONFIG_OUTPUT: &str = "vpn_client_config";

/// The infrastructure phase.
pub struct InfrastructurePhase {
    op: OperationPhase,
    terraform: Arc<TerraformRunner>,
    vpn: Arc<VpnRunner>,
    renderer: Arc<dyn TemplateRenderer>,
    prompter: Arc<dyn Prompter>,
}

impl InfrastructurePhase {
    /// Creates the phase for `ctx`.
    #[must_use]
    pub fn new(
        ctx: &PhaseContext,
        factory: &dyn ExecutorFactory,
        renderer: Arc<dyn TemplateRenderer>,
        prompter: Arc<dyn Prompter>,
    ) -> Self {
        let op = ctx.paths.operation(Phase::Infrastructure);
        let terraform = TerraformRunner::new(
            factory.executor("terraform", &op.logs),
            &ctx.tools.terraform,
            &op.terraform,
        );
        let vpn = VpnRunner::new(
            factory.executor("openvpn", &op.logs),
            &ctx.tools.openvpn,
            &op.secrets,
        );

        Self {
            op,
            terraform: Arc::new(terraform),
            vpn: Arc::new(vpn),
            renderer,
            prompter,
        }
    }

    fn vpn_pid_file(&self) -> PathBuf {
        self.op.secrets.join("vpn.pid")
    }

    async fn sync_vpn(&self, ctx: &PhaseContext) -> Result<()> {
        let wanted = lookup(&ctx.rendered, ".spec.infrastructure.vpn").is_some_and(|vpn| {
            vpn.is_object() && vpn.get("enabled").and_then(Value::as_bool) != Some(false)
        });

        if ctx.dry_run {
            info!("Dry run: leaving the VPN untouched");
            return Ok(());
        }
        if !wanted {
            return self.vpn.disconnect(&self.vpn_pid_file()).await;
        }

        let outputs = read_outputs(&self.op.output_file()).await?.unwrap_or_default();
        let Some(client_config) = outputs.get(VPN_CONFIG_OUTPUT).and_then(|o| o.value.as_str())
        else {
            warn!("VPN requested but the {} output is missing", VPN_CONFIG_OUTPUT);
            return Ok(());
        };

        let config_file = self.op.secrets.join("client.ovpn");
        tokio::fs::write(&config_file, client_config).await?;
        self.vpn.connect(&config_file, &self.vpn_pid_file()).await
    }
}

#[async_trait]
impl PhaseExec for InfrastructurePhase {
    fn phase(&self) -> Phase {
        Phase::Infrastructure
    }

    async fn prepare(&self, ctx: &PhaseContext) -> Result<()> {
        self.op.create_dirs().await?;
        let data = phase_data(&ctx.rendered, ctx.config.name(), Phase::Infrastructure);
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
            Stage::Post => self.sync_vpn(ctx).await,
        }
    }

    fn runners(&self) -> Vec<Arc<dyn Runner>> {
        vec![
            self.terraform.clone() as Arc<dyn Runner>,
            self.vpn.clone() as Arc<dyn Runner>,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::testing::context;
    use crate::phase::{FileTreeRenderer, MockPrompter};
    use crate::runner::testing::SpyFactory;

    const CONFIG: &str = "apiVersion: v1\nkind: EKSCluster\nmetadata:\n  name: demo\nspec:\n  distributionVersion: v1.2.0\n  infrastructure:\n    vpn:\n      enabled: true\n";

    const PLAN_DESTROYING_VPC: &str = r#"
  # aws_vpc.main will be destroyed
  - resource "aws_vpc" "main" {
    }
"#;

    fn phase(ctx: &PhaseContext, factory: &SpyFactory, prompter: MockPrompter) -> InfrastructurePhase {
        InfrastructurePhase::new(ctx, factory, Arc::new(FileTreeRenderer), Arc::new(prompter))
    }

    #[tokio::test]
    async fn test_core_applies_and_records_outputs() {
        let (ctx, _dir) = context(CONFIG, false);
        let factory = SpyFactory::new();
        let terraform = factory.spy("terraform");
        terraform.respond(
            "output",
            r#"{"vpn_client_config":{"sensitive":true,"type":"string","value":"client"}}"#,
        );

        let infra = phase(&ctx, &factory, MockPrompter::new());
        infra.prepare(&ctx).await.expect("prepare");
        infra.run_stage(Stage::Core, &ctx).await.expect("core");
        infra.run_stage(Stage::Post, &ctx).await.expect("post");

        assert_eq!(terraform.count("apply"), 1);
        assert!(infra.op.output_file().is_file());
        assert!(infra.op.terraform.join("terraform.tfvars.json").is_file());
        assert!(infra.op.secrets.join("client.ovpn").is_file());
        assert_eq!(factory.spy("openvpn").calls().len(), 1);
    }

    #[tokio::test]
    async fn test_refused_critical_deletion_skips_apply() {
        let (ctx, _dir) = context(CONFIG, false);
        let factory = SpyFactory::new();
        let terraform = factory.spy("terraform");
        terraform.respond("plan", PLAN_DESTROYING_VPC);

        let mut prompter = MockPrompter::new();
        prompter
            .expect_ask()
            .times(1)
            .returning(|_| Ok(String::from("no")));

        let infra = phase(&ctx, &factory, prompter);
        infra.prepare(&ctx).await.expect("prepare");
        let err = infra
            .run_stage(Stage::Core, &ctx)
            .await
            .expect_err("aborted");

        assert!(err.is_aborted_by_user());
        assert_eq!(terraform.count("plan"), 1);
        assert_eq!(terraform.count("apply"), 0);
    }

    #[tokio::test]
    async fn test_dry_run_only_plans() {
        let (ctx, _dir) = context(CONFIG, true);
        let factory = SpyFactory::new();
        let terraform = factory.spy("terraform");
        terraform.respond("plan", PLAN_DESTROYING_VPC);

        let mut prompter = MockPrompter::new();
        prompter.expect_ask().never();

        let infra = phase(&ctx, &factory, prompter);
        infra.prepare(&ctx).await.expect("prepare");
        infra.run_stage(Stage::Core, &ctx).await.expect("core");
        infra.run_stage(Stage::Post, &ctx).await.expect("post");

        assert_eq!(terraform.count("plan"), 1);
        assert_eq!(terraform.count("apply"), 0);
        assert_eq!(terraform.count("output"), 0);
        assert!(factory.spy("openvpn").calls().is_empty());
    }
}
