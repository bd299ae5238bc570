//! Checks run before anything is mutated.
//!
//! The rendered configuration of the last successful run is compared with
//! the freshly rendered one, so changes coming from the distribution
//! defaults are checked like user changes. Distribution version changes need an explicit upgrade, every
//! change is checked against the distribution's rules, and the cluster must
//! answer if it already exists.

use std::sync::Arc;
use tracing::{info, warn};

use crate::config::lookup;
use crate::error::{ConfigError, ForgeError, Result};
use crate::planner::{ActiveReducer, Changelog, Checker, RulesManifest, rules_path};
use crate::runner::{ExecutorFactory, KubectlRunner, Runner};

use super::{ForceFeature, Phase, PhaseContext};

/// Outcome of the preflight checks.
#[derive(Debug, Clone, Default)]
pub struct PreFlightReport {
    /// No configuration was stored yet.
    pub first_run: bool,
    /// Changes since the last successful run.
    pub changelog: Changelog,
    /// Reducer migrations the run must execute.
    pub active_reducers: Vec<ActiveReducer>,
    /// Distribution version change, as `(from, to)`.
    pub upgrade: Option<(String, String)>,
}

/// The preflight phase.
pub struct PreFlight {
    kubectl: Arc<KubectlRunner>,
}

impl PreFlight {
    /// Creates the phase for `ctx`.
    #[must_use]
    pub fn new(ctx: &PhaseContext, factory: &dyn ExecutorFactory) -> Self {
        let op = ctx.paths.operation(Phase::PreFlight);
        let kubectl = KubectlRunner::new(
            factory.executor("kubectl", &op.logs),
            &ctx.tools.kubectl,
            &op.path,
        )
        .with_kubeconfig(&ctx.paths.kubeconfig);

        Self {
            kubectl: Arc::new(kubectl),
        }
    }

    /// Runners used by the phase.
    #[must_use]
    pub fn runners(&self) -> Vec<Arc<dyn Runner>> {
        vec![self.kubectl.clone() as Arc<dyn Runner>]
    }

    /// Runs the checks.
    ///
    /// # Errors
    ///
    /// Returns `UpgradeNotAllowed`, `Violations`, an unreadable stored
    /// configuration (unless migrations are forced) or an unreachable
    /// cluster.
    pub async fn run(&self, ctx: &PhaseContext) -> Result<PreFlightReport> {
        let Some(stored) = ctx.store.get_config().await? else {
            info!("No stored configuration, this is the first run for {}", ctx.config.name());
            return Ok(PreFlightReport {
                first_run: true,
                ..PreFlightReport::default()
            });
        };

        let raw = match Checker::from_stored_bytes(&stored, ctx.config.tree.clone()) {
            Ok(checker) => checker,
            Err(e) if ctx.forces(ForceFeature::Migrations) => {
                warn!("Skipping configuration checks: {}", e);
                return Ok(PreFlightReport::default());
            }
            Err(e) => return Err(e.into()),
        };
        let upgrade = Self::check_upgrade(&raw, ctx)?;

        let checker = match ctx.store.get_rendered_config().await? {
            Some(rendered) => match Checker::from_stored_bytes(&rendered, ctx.rendered.clone()) {
                Ok(checker) => checker,
                Err(e) if ctx.forces(ForceFeature::Migrations) => {
                    warn!("Skipping configuration checks: {}", e);
                    return Ok(PreFlightReport {
                        upgrade,
                        ..PreFlightReport::default()
                    });
                }
                Err(e) => return Err(e.into()),
            },
            None => {
                warn!("No stored rendered configuration, comparing the raw configuration");
                raw
            }
        };

        let changelog = checker.generate_diff();
        info!("{} change(s) since the last successful run", changelog.len());

        let active_reducers = Self::check_rules(&changelog, ctx)?;
        self.check_reachability(ctx).await?;

        Ok(PreFlightReport {
            first_run: false,
            changelog,
            active_reducers,
            upgrade,
        })
    }

    fn check_upgrade(checker: &Checker, ctx: &PhaseContext) -> Result<Option<(String, String)>> {
        let from = lookup(checker.stored(), ".spec.distributionVersion")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let to = ctx.config.distribution_version();
        if from == to {
            return Ok(None);
        }

        if !ctx.upgrade && !ctx.forces(ForceFeature::Upgrades) {
            return Err(ConfigError::UpgradeNotAllowed {
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }

        info!("Upgrading distribution from {} to {}", from, to);
        Ok(Some((from.to_string(), to.to_string())))
    }

    fn check_rules(changelog: &Changelog, ctx: &PhaseContext) -> Result<Vec<ActiveReducer>> {
        if changelog.is_empty() {
            return Ok(Vec::new());
        }
        let Some(manifest) = RulesManifest::load(&rules_path(&ctx.distro_dir, ctx.config.kind()))?
        else {
            return Ok(Vec::new());
        };

        let report = Checker::evaluate(changelog, &manifest);
        if !report.violations.is_empty() {
            return Err(ForgeError::Violations(report.violations));
        }

        for reducer in &report.active_reducers {
            info!(
                "Reducer {} ({}) will migrate {}: {} -> {}",
                reducer.key, reducer.lifecycle, reducer.path, reducer.from, reducer.to
            );
        }
        Ok(report.active_reducers)
    }

    async fn check_reachability(&self, ctx: &PhaseContext) -> Result<()> {
        if !ctx.paths.kubeconfig.exists() {
            info!("No kubeconfig yet, skipping the cluster reachability check");
            return Ok(());
        }

        match self.kubectl.check_reachable().await {
            Ok(()) => Ok(()),
            Err(e) if ctx.dry_run => {
                warn!("Cluster is not reachable, continuing the dry run: {}", e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::render_config;
    use crate::phase::testing::{context, store_applied, write_rules};
    use serde_json::json;
    use crate::planner::ViolationKind;
    use crate::runner::testing::SpyFactory;

    const STORED: &str = "apiVersion: v1\nkind: EKSCluster\nmetadata:\n  name: demo\nspec:\n  distributionVersion: v1.2.0\n  infrastructure:\n    region: eu-west-1\n";

    #[tokio::test]
    async fn test_first_run() {
        let (ctx, _dir) = context(STORED, false);
        let report = PreFlight::new(&ctx, &SpyFactory::new())
            .run(&ctx)
            .await
            .expect("preflight");
        assert!(report.first_run);
        assert!(report.changelog.is_empty());
    }

    #[tokio::test]
    async fn test_upgrade_requires_flag() {
        let (mut ctx, _dir) = context(&STORED.replace("v1.2.0", "v1.3.0"), false);
        store_applied(&ctx, STORED).await;

        let factory = SpyFactory::new();
        let err = PreFlight::new(&ctx, &factory)
            .run(&ctx)
            .await
            .expect_err("upgrade refused");
        assert!(matches!(
            err,
            ForgeError::Config(ConfigError::UpgradeNotAllowed { .. })
        ));

        ctx.upgrade = true;
        let report = PreFlight::new(&ctx, &factory).run(&ctx).await.expect("upgrade allowed");
        assert_eq!(
            report.upgrade,
            Some((String::from("v1.2.0"), String::from("v1.3.0")))
        );
    }

    #[tokio::test]
    async fn test_immutable_violation_blocks() {
        let (ctx, dir) = context(&STORED.replace("eu-west-1", "us-east-1"), false);
        store_applied(&ctx, STORED).await;
        write_rules(
            dir.path(),
            "infrastructure:\n  immutable:\n    - path: .spec.infrastructure.region\n",
        );

        let err = PreFlight::new(&ctx, &SpyFactory::new())
            .run(&ctx)
            .await
            .expect_err("violation");
        let violations = err.violations().expect("violations");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].kind, ViolationKind::Immutable);
        assert_eq!(violations[0].path, ".spec.infrastructure.region");
    }

    #[tokio::test]
    async fn test_unreadable_stored_config_bypassed_with_force() {
        let (mut ctx, _dir) = context(STORED, false);
        ctx.store.store_config(b"- not\n- a map\n", b"{}").await.expect("store");

        let factory = SpyFactory::new();
        let err = PreFlight::new(&ctx, &factory).run(&ctx).await.expect_err("unreadable");
        assert!(matches!(
            err,
            ForgeError::Config(ConfigError::StoredConfigUnreadable { .. })
        ));

        ctx.force = vec![ForceFeature::Migrations];
        assert!(PreFlight::new(&ctx, &factory).run(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let (mut ctx, _dir) = context(STORED, false);
        store_applied(&ctx, STORED).await;
        std::fs::create_dir_all(ctx.paths.kubeconfig.parent().expect("parent")).expect("mkdir");
        std::fs::write(&ctx.paths.kubeconfig, "apiVersion: v1").expect("kubeconfig");

        let factory = SpyFactory::new();
        factory.spy("kubectl").fail_on("get");
        let err = PreFlight::new(&ctx, &factory).run(&ctx).await.expect_err("unreachable");
        assert!(err.is_cluster_unreachable());

        ctx.dry_run = true;
        assert!(PreFlight::new(&ctx, &factory).run(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_defaults_change_is_checked_against_rendered_config() {
        let (mut ctx, dir) = context(STORED, false);
        write_rules(
            dir.path(),
            "distribution:
  immutable:
    - path: .spec.distribution.modules.ingress.type
",
        );

        ctx.defaults = json!({ "data": { "distribution": { "modules": { "ingress": { "type": "dual" } } } } });
        store_applied(&ctx, STORED).await;

        ctx.defaults = json!({ "data": { "distribution": { "modules": { "ingress": { "type": "none" } } } } });
        ctx.rendered = render_config(&ctx.config, &ctx.defaults).expect("render");

        let err = PreFlight::new(&ctx, &SpyFactory::new())
            .run(&ctx)
            .await
            .expect_err("violation");
        let violations = err.violations().expect("violations");
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].phase, Phase::Distribution);
        assert_eq!(violations[0].path, ".spec.distribution.modules.ingress.type");
        assert_eq!(violations[0].from, json!("dual"));
        assert_eq!(violations[0].to, json!("none"));
    }
}
