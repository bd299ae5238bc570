//! The phase state machine.
//!
//! A run goes through `PreFlight`, then the `Infrastructure`, `Kubernetes` and
//! `Distribution` phases. Every phase but `PreFlight` is split into three
//! sub-phases (pre, core, post) whose outcomes are persisted so that a failed
//! run can resume.

mod distribution;
mod gate;
mod infrastructure;
mod kubernetes;
mod preflight;
mod render;
mod template;

pub use distribution::DistributionPhase;
pub use gate::{Prompter, StdinPrompter, confirm_critical_deletions, plan_gate_apply};
pub use infrastructure::InfrastructurePhase;
pub use kubernetes::KubernetesPhase;
pub use preflight::{PreFlight, PreFlightReport};
pub use render::{phase_data, phase_merger, read_outputs, render_config};
pub use template::{FileTreeRenderer, TemplateRenderer};

#[cfg(test)]
pub use gate::MockPrompter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::config::ClusterConfig;
use crate::error::{ConfigError, Result};
use crate::runner::{Runner, ToolPaths};
use crate::state::ClusterStateStore;

/// A phase of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Checks run before anything is mutated.
    PreFlight,
    /// Cloud infrastructure (network, VPN).
    Infrastructure,
    /// Kubernetes control plane and nodes.
    Kubernetes,
    /// In-cluster distribution modules.
    Distribution,
}

impl Phase {
    /// Phases with sub-phases, in execution order.
    pub const APPLY_ORDER: [Self; 3] = [Self::Infrastructure, Self::Kubernetes, Self::Distribution];

    /// Returns the key of the phase in the configuration and on disk.
    #[must_use]
    pub const fn key(self) -> &'static str {
        match self {
            Self::PreFlight => "preflight",
            Self::Infrastructure => "infrastructure",
            Self::Kubernetes => "kubernetes",
            Self::Distribution => "distribution",
        }
    }

    /// Returns the sub-phases of this phase, in execution order.
    #[must_use]
    pub fn sub_phases(self) -> Vec<SubPhase> {
        SubPhase::ALL
            .iter()
            .copied()
            .filter(|s| s.phase() == self)
            .collect()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Phase {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "preflight" | "pre-flight" => Ok(Self::PreFlight),
            "infrastructure" | "infra" => Ok(Self::Infrastructure),
            "kubernetes" | "kube" => Ok(Self::Kubernetes),
            "distribution" | "distro" => Ok(Self::Distribution),
            _ => Err(ConfigError::UnknownPhase { name: s.to_string() }),
        }
    }
}

/// Stage of a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Preparation (tool init, data injection).
    Pre,
    /// The main action (apply).
    Core,
    /// Follow-up actions (kubeconfig, VPN, migrations).
    Post,
}

/// A persisted step of a run. Variants are declared in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubPhase {
    /// Before the infrastructure apply.
    PreInfrastructure,
    /// Infrastructure apply.
    Infrastructure,
    /// After the infrastructure apply.
    PostInfrastructure,
    /// Before the kubernetes apply.
    PreKubernetes,
    /// Kubernetes apply.
    Kubernetes,
    /// After the kubernetes apply.
    PostKubernetes,
    /// Before the distribution apply.
    PreDistribution,
    /// Distribution apply.
    Distribution,
    /// After the distribution apply.
    PostDistribution,
}

impl SubPhase {
    /// Every sub-phase, in execution order.
    pub const ALL: &'static [Self] = &[
        Self::PreInfrastructure,
        Self::Infrastructure,
        Self::PostInfrastructure,
        Self::PreKubernetes,
        Self::Kubernetes,
        Self::PostKubernetes,
        Self::PreDistribution,
        Self::Distribution,
        Self::PostDistribution,
    ];

    /// Returns the sub-phase of `phase` at `stage`.
    ///
    /// `PreFlight` has no sub-phases and maps to `None`.
    #[must_use]
    pub const fn of(phase: Phase, stage: Stage) -> Option<Self> {
        let sub = match (phase, stage) {
            (Phase::PreFlight, _) => return None,
            (Phase::Infrastructure, Stage::Pre) => Self::PreInfrastructure,
            (Phase::Infrastructure, Stage::Core) => Self::Infrastructure,
            (Phase::Infrastructure, Stage::Post) => Self::PostInfrastructure,
            (Phase::Kubernetes, Stage::Pre) => Self::PreKubernetes,
            (Phase::Kubernetes, Stage::Core) => Self::Kubernetes,
            (Phase::Kubernetes, Stage::Post) => Self::PostKubernetes,
            (Phase::Distribution, Stage::Pre) => Self::PreDistribution,
            (Phase::Distribution, Stage::Core) => Self::Distribution,
            (Phase::Distribution, Stage::Post) => Self::PostDistribution,
        };
        Some(sub)
    }

    /// Returns the phase this sub-phase belongs to.
    #[must_use]
    pub const fn phase(self) -> Phase {
        match self {
            Self::PreInfrastructure | Self::Infrastructure | Self::PostInfrastructure => {
                Phase::Infrastructure
            }
            Self::PreKubernetes | Self::Kubernetes | Self::PostKubernetes => Phase::Kubernetes,
            Self::PreDistribution | Self::Distribution | Self::PostDistribution => {
                Phase::Distribution
            }
        }
    }

    /// Returns the stage of this sub-phase.
    #[must_use]
    pub const fn stage(self) -> Stage {
        match self {
            Self::PreInfrastructure | Self::PreKubernetes | Self::PreDistribution => Stage::Pre,
            Self::Infrastructure | Self::Kubernetes | Self::Distribution => Stage::Core,
            Self::PostInfrastructure | Self::PostKubernetes | Self::PostDistribution => Stage::Post,
        }
    }

    /// Returns the kebab-case name.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::PreInfrastructure => "pre-infrastructure",
            Self::Infrastructure => "infrastructure",
            Self::PostInfrastructure => "post-infrastructure",
            Self::PreKubernetes => "pre-kubernetes",
            Self::Kubernetes => "kubernetes",
            Self::PostKubernetes => "post-kubernetes",
            Self::PreDistribution => "pre-distribution",
            Self::Distribution => "distribution",
            Self::PostDistribution => "post-distribution",
        }
    }
}

impl fmt::Display for SubPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SubPhase {
    type Err = ConfigError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let wanted = s.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|sub| sub.name() == wanted)
            .ok_or_else(|| ConfigError::UnknownPhase { name: s.to_string() })
    }
}

/// Safety checks that can be bypassed with `--force`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum ForceFeature {
    /// Bypass every check below.
    All,
    /// Proceed when the stored configuration cannot be compared.
    Migrations,
    /// Allow distribution version changes without `--upgrade`.
    Upgrades,
}

/// Materialized working directory of a phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationPhase {
    /// Phase this directory belongs to.
    pub phase: Phase,
    /// Root of the directory.
    pub path: PathBuf,
    /// Terraform working directory.
    pub terraform: PathBuf,
    /// Command logs.
    pub logs: PathBuf,
    /// Terraform outputs.
    pub outputs: PathBuf,
    /// Saved Terraform plans.
    pub plan: PathBuf,
    /// Secret material (VPN configuration).
    pub secrets: PathBuf,
    /// Kubernetes manifests.
    pub manifests: PathBuf,
}

impl OperationPhase {
    /// Lays out the directory of `phase` under `phases_dir`.
    #[must_use]
    pub fn new(phases_dir: &Path, phase: Phase) -> Self {
        let path = phases_dir.join(phase.key());
        Self {
            phase,
            terraform: path.join("terraform"),
            logs: path.join("logs"),
            outputs: path.join("outputs"),
            plan: path.join("plan"),
            secrets: path.join("secrets"),
            manifests: path.join("manifests"),
            path,
        }
    }

    /// Creates every directory.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub async fn create_dirs(&self) -> Result<()> {
        for dir in [
            &self.terraform,
            &self.logs,
            &self.outputs,
            &self.plan,
            &self.secrets,
            &self.manifests,
        ] {
            tokio::fs::create_dir_all(dir).await?;
        }
        debug!("Prepared {} working directory {}", self.phase, self.path.display());
        Ok(())
    }

    /// Saved plan file.
    #[must_use]
    pub fn plan_file(&self) -> PathBuf {
        self.plan.join("terraform.plan")
    }

    /// Terraform outputs file.
    #[must_use]
    pub fn output_file(&self) -> PathBuf {
        self.outputs.join("output.json")
    }

    /// Migration script of a reducer.
    #[must_use]
    pub fn reducer_script(&self, key: &str, lifecycle: &str) -> PathBuf {
        self.path.join("reducers").join(format!("{key}.{lifecycle}.sh"))
    }
}

/// Locations of a cluster's working files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterPaths {
    /// Cluster directory.
    pub root: PathBuf,
    /// Parent of the phase working directories.
    pub phases: PathBuf,
    /// Kubeconfig of the cluster.
    pub kubeconfig: PathBuf,
}

impl ClusterPaths {
    /// Lays out the working files of `cluster` under `<workdir>/.clusterforge/`.
    #[must_use]
    pub fn new(workdir: &Path, cluster: &str) -> Self {
        let root = workdir.join(crate::state::STATE_DIR).join(cluster);
        Self {
            phases: root.join("phases"),
            kubeconfig: root.join("kubeconfig"),
            root,
        }
    }

    /// Uses `kubeconfig` instead of the generated one.
    #[must_use]
    pub fn with_kubeconfig(mut self, kubeconfig: impl Into<PathBuf>) -> Self {
        self.kubeconfig = kubeconfig.into();
        self
    }

    /// Returns the working directory of a phase.
    #[must_use]
    pub fn operation(&self, phase: Phase) -> OperationPhase {
        OperationPhase::new(&self.phases, phase)
    }
}

/// Everything a phase needs to run.
pub struct PhaseContext {
    /// The current configuration.
    pub config: ClusterConfig,
    /// Distribution defaults (`data` root).
    pub defaults: Value,
    /// The configuration with defaults merged into every phase section.
    pub rendered: Value,
    /// Distribution directory (rules, defaults, templates).
    pub distro_dir: PathBuf,
    /// Cluster working files.
    pub paths: ClusterPaths,
    /// Tool binaries.
    pub tools: ToolPaths,
    /// Cluster state store.
    pub store: Arc<dyn ClusterStateStore>,
    /// Plan only, mutate nothing.
    pub dry_run: bool,
    /// Distribution version changes are allowed.
    pub upgrade: bool,
    /// Bypassed safety checks.
    pub force: Vec<ForceFeature>,
}

impl PhaseContext {
    /// Returns true if `feature` (or everything) is forced.
    #[must_use]
    pub fn forces(&self, feature: ForceFeature) -> bool {
        self.force.contains(&ForceFeature::All) || self.force.contains(&feature)
    }

    /// Returns the resource types whose destruction needs confirmation.
    #[must_use]
    pub fn critical_resources(&self, phase: Phase) -> &[String] {
        let critical = &self.config.header.spec.tools_configuration.critical_resources;
        match phase {
            Phase::Infrastructure => &critical.infrastructure,
            Phase::Kubernetes => &critical.kubernetes,
            Phase::PreFlight | Phase::Distribution => &[],
        }
    }

    /// Returns true if the configuration declares the phase.
    #[must_use]
    pub fn declares(&self, phase: Phase) -> bool {
        match phase {
            Phase::Infrastructure | Phase::Kubernetes => self.config.has_section(phase.key()),
            Phase::PreFlight | Phase::Distribution => true,
        }
    }
}

/// A phase with pre, core and post sub-phases.
#[async_trait]
pub trait PhaseExec: Send + Sync {
    /// The phase implemented.
    fn phase(&self) -> Phase;

    /// Materializes the working directory and the phase's template data.
    ///
    /// Runs before the sub-phases, even when every one of them is skipped.
    async fn prepare(&self, ctx: &PhaseContext) -> Result<()>;

    /// Runs one stage.
    async fn run_stage(&self, stage: Stage, ctx: &PhaseContext) -> Result<()>;

    /// Runners used by the phase.
    fn runners(&self) -> Vec<Arc<dyn Runner>>;
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sub_phase_order_and_mapping() {
        let mut sorted = SubPhase::ALL.to_vec();
        sorted.sort();
        assert_eq!(sorted, SubPhase::ALL);

        for sub in SubPhase::ALL {
            assert_eq!(SubPhase::of(sub.phase(), sub.stage()), Some(*sub));
        }
        assert_eq!(SubPhase::of(Phase::PreFlight, Stage::Core), None);
        assert_eq!(
            Phase::Kubernetes.sub_phases(),
            vec![SubPhase::PreKubernetes, SubPhase::Kubernetes, SubPhase::PostKubernetes]
        );
    }

    #[test]
    fn test_parse_names() {
        assert_eq!("infra".parse::<Phase>().ok(), Some(Phase::Infrastructure));
        assert_eq!("Distribution".parse::<Phase>().ok(), Some(Phase::Distribution));
        assert!("cloud".parse::<Phase>().is_err());
        assert_eq!(
            "post-kubernetes".parse::<SubPhase>().ok(),
            Some(SubPhase::PostKubernetes)
        );
        assert!("kubernetes-post".parse::<SubPhase>().is_err());
    }

    #[test]
    fn test_operation_layout() {
        let paths = ClusterPaths::new(Path::new("/work"), "demo");
        let op = paths.operation(Phase::Infrastructure);
        assert_eq!(op.path, Path::new("/work/.clusterforge/demo/phases/infrastructure"));
        assert_eq!(op.plan_file(), op.plan.join("terraform.plan"));
        assert_eq!(
            op.reducer_script("ingress", "pre-apply"),
            op.path.join("reducers/ingress.pre-apply.sh")
        );
        assert_eq!(paths.kubeconfig, Path::new("/work/.clusterforge/demo/kubeconfig"));
    }
}
