//! The distribution phase: in-cluster modules and reducer migrations.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::{ForgeError, Result};
use crate::planner::{ActiveReducer, Lifecycle};
use crate::runner::{ExecutorFactory, KubectlRunner, Runner, ShellRunner};

use super::render::phase_data;
use super::template::TemplateRenderer;
use super::{OperationPhase, Phase, PhaseContext, PhaseExec, Stage};

/// The distribution phase.
pub struct DistributionPhase {
    op: OperationPhase,
    kubectl: Arc<KubectlRunner>,
    shell: Arc<ShellRunner>,
    renderer: Arc<dyn TemplateRenderer>,
    reducers: Vec<ActiveReducer>,
}

fn env_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl DistributionPhase {
    /// Creates the phase for `ctx`, running the migrations of `reducers`.
    #[must_use]
    pub fn new(
        ctx: &PhaseContext,
        factory: &dyn ExecutorFactory,
        renderer: Arc<dyn TemplateRenderer>,
        reducers: Vec<ActiveReducer>,
    ) -> Self {
        let op = ctx.paths.operation(Phase::Distribution);
        let kubectl = KubectlRunner::new(
            factory.executor("kubectl", &op.logs),
            &ctx.tools.kubectl,
            &op.path,
        )
        .with_kubeconfig(&ctx.paths.kubeconfig);
        let shell = ShellRunner::new(factory.executor("shell", &op.logs), &ctx.tools.shell, &op.path);

        Self {
            op,
            kubectl: Arc::new(kubectl),
            shell: Arc::new(shell),
            renderer,
            reducers,
        }
    }

    async fn check_cluster(&self, ctx: &PhaseContext) -> Result<()> {
        match self.kubectl.check_reachable().await {
            Ok(()) => Ok(()),
            Err(e) if ctx.dry_run => {
                warn!("Cluster is not reachable, continuing the dry run: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn run_reducers(&self, lifecycle: Lifecycle, ctx: &PhaseContext) -> Result<()> {
        for reducer in self.reducers.iter().filter(|r| r.lifecycle == lifecycle) {
            let script = self.op.reducer_script(&reducer.key, &lifecycle.to_string());
            if !script.is_file() {
                warn!(
                    "No migration script for reducer {} at {}",
                    reducer.key,
                    script.display()
                );
                continue;
            }
            if ctx.dry_run {
                info!("Dry run: would run reducer {} ({})", reducer.key, lifecycle);
                continue;
            }

            let env = [
                (String::from("REDUCER_PATH"), reducer.path.clone()),
                (String::from("REDUCER_FROM"), env_value(&reducer.from)),
                (String::from("REDUCER_TO"), env_value(&reducer.to)),
                (
                    String::from("KUBECONFIG"),
                    ctx.paths.kubeconfig.display().to_string(),
                ),
            ];
            self.shell.run(&script, &env).await?;
        }
        Ok(())
    }

    async fn apply_manifests(&self, ctx: &PhaseContext) -> Result<()> {
        if ctx.dry_run {
            info!("Dry run: manifests rendered in {}", self.op.manifests.display());
            return Ok(());
        }

        let empty = std::fs::read_dir(&self.op.manifests)?.next().is_none();
        if empty {
            info!("No distribution manifests to apply");
            return Ok(());
        }
        self.kubectl.apply(&self.op.manifests).await
    }

    async fn finish(&self, ctx: &PhaseContext) -> Result<()> {
        self.run_reducers(Lifecycle::PostApply, ctx).await?;
        if ctx.dry_run {
            return Ok(());
        }

        let rendered = serde_json::to_vec_pretty(&ctx.rendered)
            .map_err(|e| ForgeError::internal(format!("cannot serialize rendered config: {e}")))?;
        ctx.store
            .store_config(ctx.config.raw.as_bytes(), &rendered)
            .await
    }
}

#[async_trait]
impl PhaseExec for DistributionPhase {
    fn phase(&self) -> Phase {
        Phase::Distribution
    }

    async fn prepare(&self, ctx: &PhaseContext) -> Result<()> {
        self.op.create_dirs().await?;
        let mut data = phase_data(&ctx.rendered, ctx.config.name(), Phase::Distribution);
        let reducers = serde_json::to_value(&self.reducers)
            .map_err(|e| ForgeError::internal(format!("cannot serialize reducers: {e}")))?;
        data.insert(String::from("reducers"), reducers);
        self.renderer
            .render(&ctx.distro_dir, &self.op, &Value::Object(data))
            .await
    }

    async fn run_stage(&self, stage: Stage, ctx: &PhaseContext) -> Result<()> {
        match stage {
            Stage::Pre => {
                self.check_cluster(ctx).await?;
                self.run_reducers(Lifecycle::PreApply, ctx).await
            }
            Stage::Core => self.apply_manifests(ctx).await,
            Stage::Post => self.finish(ctx).await,
        }
    }

    fn runners(&self) -> Vec<Arc<dyn Runner>> {
        vec![
            self.kubectl.clone() as Arc<dyn Runner>,
            self.shell.clone() as Arc<dyn Runner>,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::FileTreeRenderer;
    use crate::phase::testing::context;
    use crate::runner::testing::SpyFactory;
    use serde_json::json;

    const CONFIG: &str = "apiVersion: v1\nkind: KFDDistribution\nmetadata:\n  name: demo\nspec:\n  distributionVersion: v1.2.0\n  distribution:\n    modules:\n      ingress:\n        type: nginx\n";

    fn reducer(lifecycle: Lifecycle) -> ActiveReducer {
        ActiveReducer {
            key: String::from("ingress"),
            lifecycle,
            path: String::from(".spec.distribution.modules.ingress.type"),
            from: json!("nginx"),
            to: json!("dual"),
        }
    }

    fn phase(ctx: &PhaseContext, factory: &SpyFactory, reducers: Vec<ActiveReducer>) -> DistributionPhase {
        DistributionPhase::new(ctx, factory, Arc::new(FileTreeRenderer), reducers)
    }

    fn write_script(op: &OperationPhase, lifecycle: &str) {
        let script = op.reducer_script("ingress", lifecycle);
        std::fs::create_dir_all(script.parent().expect("parent")).expect("mkdir");
        std::fs::write(script, "#!/bin/sh\n").expect("script");
    }

    #[tokio::test]
    async fn test_prepare_writes_reducers_into_values() {
        let (ctx, _dir) = context(CONFIG, false);
        let distro = phase(&ctx, &SpyFactory::new(), vec![reducer(Lifecycle::PreApply)]);
        distro.prepare(&ctx).await.expect("prepare");

        let values: Value = serde_json::from_str(
            &std::fs::read_to_string(distro.op.path.join("values.json")).expect("values"),
        )
        .expect("json");
        assert_eq!(values["modules"]["ingress"]["type"], json!("nginx"));
        assert_eq!(values["reducers"][0]["lifecycle"], json!("pre-apply"));
    }

    #[tokio::test]
    async fn test_pre_runs_pre_apply_reducers_with_env() {
        let (ctx, _dir) = context(CONFIG, false);
        let factory = SpyFactory::new();
        let distro = phase(
            &ctx,
            &factory,
            vec![reducer(Lifecycle::PreApply), reducer(Lifecycle::PostApply)],
        );
        distro.prepare(&ctx).await.expect("prepare");
        write_script(&distro.op, "pre-apply");
        write_script(&distro.op, "post-apply");

        distro.run_stage(Stage::Pre, &ctx).await.expect("pre");

        let calls = factory.spy("shell").calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].args[0].ends_with("ingress.pre-apply.sh"));
        assert!(calls[0].env.contains(&(String::from("REDUCER_FROM"), String::from("nginx"))));
        assert!(calls[0].env.contains(&(String::from("REDUCER_TO"), String::from("dual"))));
        assert_eq!(factory.spy("kubectl").count("get"), 1);
    }

    #[tokio::test]
    async fn test_core_applies_manifests() {
        let (ctx, _dir) = context(CONFIG, false);
        let factory = SpyFactory::new();
        let distro = phase(&ctx, &factory, Vec::new());
        distro.prepare(&ctx).await.expect("prepare");

        distro.run_stage(Stage::Core, &ctx).await.expect("empty core");
        assert_eq!(factory.spy("kubectl").count("apply"), 0);

        std::fs::write(distro.op.manifests.join("ingress.yaml"), "kind: List").expect("manifest");
        distro.run_stage(Stage::Core, &ctx).await.expect("core");
        assert_eq!(factory.spy("kubectl").count("apply"), 1);
    }

    #[tokio::test]
    async fn test_post_stores_config_unless_dry_run() {
        let (ctx, _dir) = context(CONFIG, true);
        let distro = phase(&ctx, &SpyFactory::new(), Vec::new());
        distro.prepare(&ctx).await.expect("prepare");
        distro.run_stage(Stage::Post, &ctx).await.expect("post");
        assert!(ctx.store.get_config().await.expect("get").is_none());

        let (ctx, _dir) = context(CONFIG, false);
        let distro = phase(&ctx, &SpyFactory::new(), Vec::new());
        distro.prepare(&ctx).await.expect("prepare");
        distro.run_stage(Stage::Post, &ctx).await.expect("post");
        assert_eq!(
            ctx.store.get_config().await.expect("get"),
            Some(CONFIG.as_bytes().to_vec())
        );
    }
}
