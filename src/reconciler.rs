//! Reconciler driving a cluster towards its configuration.
//!
//! A run takes the cluster lock, runs the preflight checks, then walks the
//! sub-phases of every selected phase in order. Each sub-phase outcome is
//! persisted so that a failed run resumes where it stopped, as long as the
//! rendered configuration did not change in between.

use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info, warn};

use crate::config::ConfigHasher;
use crate::error::{ForgeError, Result};
use crate::phase::{
    DistributionPhase, FileTreeRenderer, InfrastructurePhase, KubernetesPhase, Phase,
    PhaseContext, PhaseExec, PreFlight, PreFlightReport, Prompter, StdinPrompter, SubPhase,
    TemplateRenderer,
};
use crate::runner::{ExecutorFactory, ProcessExecutorFactory, Runner, stop_runners};
use crate::state::{PhaseStatus, UpgradeState, generate_holder_id};

/// Which parts of the lifecycle a run covers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyOptions {
    /// Run only this phase (after the preflight checks).
    pub phase: Option<Phase>,
    /// Skip every sub-phase before this one.
    pub start_from: Option<SubPhase>,
    /// Phases not to run.
    pub skip_phases: Vec<Phase>,
}

/// Result of a reconciliation run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconciliationResult {
    /// No configuration had been applied before.
    pub first_run: bool,
    /// Number of configuration changes since the last successful run.
    pub changes: usize,
    /// Distribution version change, as `(from, to)`.
    pub upgrade: Option<(String, String)>,
    /// The run resumed an interrupted one.
    pub resumed: bool,
    /// Nothing was mutated.
    pub dry_run: bool,
    /// Sub-phases that ran.
    pub executed: Vec<SubPhase>,
    /// Sub-phases that were skipped.
    pub skipped: Vec<SubPhase>,
}

/// Runs the cluster lifecycle.
pub struct ClusterReconciler {
    ctx: PhaseContext,
    options: ApplyOptions,
    factory: Arc<dyn ExecutorFactory>,
    renderer: Arc<dyn TemplateRenderer>,
    prompter: Arc<dyn Prompter>,
    hasher: ConfigHasher,
    /// Every runner created so far, stopped together on interruption.
    runners: Mutex<Vec<Arc<dyn Runner>>>,
}

impl ClusterReconciler {
    /// Creates a reconciler spawning real processes and asking on stdin.
    #[must_use]
    pub fn new(ctx: PhaseContext, options: ApplyOptions) -> Self {
        Self {
            ctx,
            options,
            factory: Arc::new(ProcessExecutorFactory),
            renderer: Arc::new(FileTreeRenderer),
            prompter: Arc::new(StdinPrompter),
            hasher: ConfigHasher::new(),
            runners: Mutex::new(Vec::new()),
        }
    }

    /// Uses `factory` to create the runners' executors.
    #[must_use]
    pub fn with_factory(mut self, factory: Arc<dyn ExecutorFactory>) -> Self {
        self.factory = factory;
        self
    }

    /// Uses `renderer` to materialize phase templates.
    #[must_use]
    pub fn with_renderer(mut self, renderer: Arc<dyn TemplateRenderer>) -> Self {
        self.renderer = renderer;
        self
    }

    /// Uses `prompter` for confirmations.
    #[must_use]
    pub fn with_prompter(mut self, prompter: Arc<dyn Prompter>) -> Self {
        self.prompter = prompter;
        self
    }

    /// Returns the context of the runs.
    #[must_use]
    pub const fn context(&self) -> &PhaseContext {
        &self.ctx
    }

    /// Performs a full run.
    ///
    /// The cluster lock is held for the whole run, except in dry-run mode,
    /// and released whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns the first failure, wrapped with the phase or sub-phase it
    /// happened in.
    pub async fn run(&self) -> Result<ReconciliationResult> {
        self.clear_runners();
        let lock = if self.ctx.dry_run {
            None
        } else {
            Some(
                self.ctx
                    .store
                    .acquire_lock(&generate_holder_id(), "apply")
                    .await?,
            )
        };

        let result = self.reconcile().await;

        if let Some(lock) = lock {
            if let Err(e) = self.ctx.store.release_lock(&lock.lock_id).await {
                warn!("Failed to release state lock {}: {}", lock.lock_id, e);
            }
        }
        result
    }

    /// Stops every process started by the runners of this reconciler.
    ///
    /// # Errors
    ///
    /// Returns the first error reported by a runner.
    pub async fn stop(&self) -> Result<()> {
        let runners = self
            .runners
            .lock()
            .map_err(|_| ForgeError::internal("runner registry poisoned"))?
            .clone();
        info!("Stopping {} runner(s)", runners.len());
        stop_runners(&runners).await
    }

    fn clear_runners(&self) {
        match self.runners.lock() {
            Ok(mut registry) => registry.clear(),
            Err(poisoned) => poisoned.into_inner().clear(),
        }
    }

    fn register(&self, runners: Vec<Arc<dyn Runner>>) {
        match self.runners.lock() {
            Ok(mut registry) => registry.extend(runners),
            Err(_) => warn!("Runner registry poisoned, runners will not be stopped"),
        }
    }

    async fn reconcile(&self) -> Result<ReconciliationResult> {
        info!(
            "Starting reconciliation of {} cluster {}",
            self.ctx.config.kind(),
            self.ctx.config.name()
        );

        let preflight = PreFlight::new(&self.ctx, self.factory.as_ref());
        self.register(preflight.runners());
        let report = preflight
            .run(&self.ctx)
            .await
            .map_err(|e| e.in_phase(Phase::PreFlight.key()))?;

        let (mut state, resumed) = self.initial_state().await?;
        let mut result = ReconciliationResult {
            first_run: report.first_run,
            changes: report.changelog.len(),
            upgrade: report.upgrade.clone(),
            resumed,
            dry_run: self.ctx.dry_run,
            ..ReconciliationResult::default()
        };

        for phase in Phase::APPLY_ORDER {
            if !self.selected(phase) {
                result.skipped.extend(phase.sub_phases());
                continue;
            }

            let exec = self.build(phase, &report);
            self.register(exec.runners());
            exec.prepare(&self.ctx)
                .await
                .map_err(|e| e.in_phase(phase.key()))?;

            for sub in phase.sub_phases() {
                if self.options.start_from.is_some_and(|from| sub < from) {
                    debug!("Skipping {}, before the requested start", sub);
                    result.skipped.push(sub);
                    continue;
                }
                if state.status(sub) == PhaseStatus::Success {
                    info!("Skipping {}, already succeeded", sub);
                    result.skipped.push(sub);
                    continue;
                }

                info!("Running {}", sub);
                match exec.run_stage(sub.stage(), &self.ctx).await {
                    Ok(()) => {
                        state.set(sub, PhaseStatus::Success);
                        self.persist(&state).await?;
                        result.executed.push(sub);
                    }
                    Err(e) if e.is_aborted_by_user() => {
                        warn!("{} aborted, left pending", sub);
                        return Err(e.in_phase(sub.name()));
                    }
                    Err(e) => {
                        error!("{} failed: {}", sub, e);
                        state.set(sub, PhaseStatus::Failed);
                        if let Err(persist) = self.persist(&state).await {
                            warn!("Failed to record the failure of {}: {}", sub, persist);
                        }
                        return Err(e.in_phase(sub.name()));
                    }
                }
            }
        }

        state.finish();
        self.persist(&state).await?;

        info!(
            "Reconciliation complete: {} sub-phase(s) run, {} skipped",
            result.executed.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Resumes the stored state when it belongs to an unfinished run of the
    /// same rendered configuration, failed or interrupted, otherwise starts
    /// over.
    async fn initial_state(&self) -> Result<(UpgradeState, bool)> {
        let hash = self.hasher.hash_tree(&self.ctx.rendered);
        if self.ctx.dry_run {
            return Ok((UpgradeState::new(hash), false));
        }

        match self.ctx.store.load_upgrade_state().await? {
            Some(state) if state.resumable_for(&hash) => {
                if let Some(next) = state.first_unfinished() {
                    info!("Resuming interrupted run from {}", next);
                }
                Ok((state, true))
            }
            Some(_) => {
                debug!("Previous run finished or used another configuration, starting over");
                Ok((UpgradeState::new(hash), false))
            }
            None => Ok((UpgradeState::new(hash), false)),
        }
    }

    async fn persist(&self, state: &UpgradeState) -> Result<()> {
        if self.ctx.dry_run {
            return Ok(());
        }
        self.ctx.store.save_upgrade_state(state).await
    }

    fn selected(&self, phase: Phase) -> bool {
        if self.options.phase.is_some_and(|only| only != phase) {
            debug!("Skipping {} phase, not selected", phase);
            return false;
        }
        if self.options.skip_phases.contains(&phase) {
            info!("Skipping {} phase as requested", phase);
            return false;
        }
        if !self.ctx.declares(phase) {
            info!("Skipping {} phase, not declared in the configuration", phase);
            return false;
        }
        true
    }

    fn build(&self, phase: Phase, report: &PreFlightReport) -> Box<dyn PhaseExec> {
        let factory = self.factory.as_ref();
        match phase {
            Phase::Infrastructure => Box::new(InfrastructurePhase::new(
                &self.ctx,
                factory,
                Arc::clone(&self.renderer),
                Arc::clone(&self.prompter),
            )),
            Phase::Kubernetes => Box::new(KubernetesPhase::new(
                &self.ctx,
                factory,
                Arc::clone(&self.renderer),
                Arc::clone(&self.prompter),
            )),
            Phase::PreFlight | Phase::Distribution => Box::new(DistributionPhase::new(
                &self.ctx,
                factory,
                Arc::clone(&self.renderer),
                report.active_reducers.clone(),
            )),
        }
    }
}
