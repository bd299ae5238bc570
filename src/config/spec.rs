//! Cluster configuration types.
//!
//! The cluster configuration is kept as a dynamic tree so that it can be
//! merged and diffed as a whole. The handful of fields the engine itself
//! needs are deserialized into a typed header alongside it.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ConfigError, ForgeError, Result};

use super::model::lookup;

/// Default critical resource types for the infrastructure phase.
const DEFAULT_CRITICAL_INFRASTRUCTURE: &[&str] = &["aws_vpc", "aws_subnet", "aws_nat_gateway"];

/// Default critical resource types for the kubernetes phase.
const DEFAULT_CRITICAL_KUBERNETES: &[&str] = &["aws_eks_cluster", "aws_eks_node_group"];

/// A parsed cluster configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterConfig {
    /// Typed view of the fields the engine relies on.
    pub header: ClusterHeader,
    /// The whole configuration tree.
    pub tree: Value,
    /// The original document, stored verbatim after a successful run.
    pub raw: String,
}

/// Typed header of a cluster configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterHeader {
    /// Schema version of the configuration.
    pub api_version: String,
    /// Cluster kind (e.g. `EKSCluster`, `OnPremises`).
    pub kind: String,
    /// Cluster metadata.
    pub metadata: Metadata,
    /// Engine-relevant part of the spec.
    pub spec: HeaderSpec,
}

/// Cluster metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Metadata {
    /// Cluster name.
    pub name: String,
}

/// Engine-relevant part of the cluster spec.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeaderSpec {
    /// Distribution version to install.
    pub distribution_version: String,
    /// State backend configuration.
    #[serde(default)]
    pub state: StateConfig,
    /// Tool behaviour overrides.
    #[serde(default)]
    pub tools_configuration: ToolsConfiguration,
}

/// State backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct StateConfig {
    /// Backend type (local or s3).
    #[serde(default)]
    pub backend: StateBackend,
    /// S3 bucket name (required for s3 backend).
    #[serde(default)]
    pub bucket: Option<String>,
    /// S3 key prefix (optional).
    #[serde(default)]
    pub prefix: Option<String>,
    /// S3 region (optional, uses AWS default if not specified).
    #[serde(default)]
    pub region: Option<String>,
    /// Local state directory (for local backend).
    #[serde(default)]
    pub path: Option<String>,
}

/// State backend types.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StateBackend {
    /// Local file-based state storage.
    #[default]
    Local,
    /// AWS S3-based state storage.
    S3,
}

/// Tool behaviour overrides.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsConfiguration {
    /// Resource types whose destruction requires confirmation.
    #[serde(default)]
    pub critical_resources: CriticalResources,
}

/// Resource types whose destruction requires confirmation, per phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CriticalResources {
    /// Infrastructure phase critical types.
    #[serde(default = "default_critical_infrastructure")]
    pub infrastructure: Vec<String>,
    /// Kubernetes phase critical types.
    #[serde(default = "default_critical_kubernetes")]
    pub kubernetes: Vec<String>,
}

impl Default for CriticalResources {
    fn default() -> Self {
        Self {
            infrastructure: default_critical_infrastructure(),
            kubernetes: default_critical_kubernetes(),
        }
    }
}

fn default_critical_infrastructure() -> Vec<String> {
    DEFAULT_CRITICAL_INFRASTRUCTURE.iter().map(|s| (*s).to_string()).collect()
}

fn default_critical_kubernetes() -> Vec<String> {
    DEFAULT_CRITICAL_KUBERNETES.iter().map(|s| (*s).to_string()).collect()
}

impl ClusterConfig {
    /// Builds a configuration from its YAML document.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the document is not valid YAML or lacks the
    /// header fields.
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let tree: Value = serde_yaml::from_str(raw)
            .map_err(|e| ConfigError::parse(format!("YAML parse error: {e}")))?;
        Self::from_tree(tree, raw.to_string())
    }

    /// Builds a configuration from an already parsed tree.
    ///
    /// # Errors
    ///
    /// Returns a parse error if the tree lacks the header fields.
    pub fn from_tree(tree: Value, raw: String) -> Result<Self> {
        if !tree.is_object() {
            return Err(ForgeError::Config(ConfigError::parse(
                "configuration root must be a map",
            )));
        }

        let header: ClusterHeader = serde_json::from_value(tree.clone())
            .map_err(|e| ConfigError::parse(format!("invalid configuration header: {e}")))?;

        Ok(Self { header, tree, raw })
    }

    /// Returns the cluster name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.header.metadata.name
    }

    /// Returns the cluster kind.
    #[must_use]
    pub fn kind(&self) -> &str {
        &self.header.kind
    }

    /// Returns the requested distribution version.
    #[must_use]
    pub fn distribution_version(&self) -> &str {
        &self.header.spec.distribution_version
    }

    /// Returns true if the spec contains a section for the given key.
    #[must_use]
    pub fn has_section(&self, key: &str) -> bool {
        lookup(&self.tree, &format!(".spec.{key}")).is_some_and(|v| !v.is_null())
    }

    /// Returns the value at a dotted selector, if present.
    #[must_use]
    pub fn get(&self, path: &str) -> Option<&Value> {
        lookup(&self.tree, path)
    }

    /// Returns true if this is a managed EKS cluster.
    #[must_use]
    pub fn is_eks(&self) -> bool {
        self.header.kind == "EKSCluster"
    }
}
