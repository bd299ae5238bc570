//! Effective configuration of each phase.
//!
//! The first merge layer is the distribution defaults (`.data.<phase>`), the
//! second the user configuration (`.spec.<phase>`). The kubernetes phase adds
//! a third layer with infrastructure outputs discovered at runtime.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

use crate::config::{ClusterConfig, MergeModel, Merger};
use crate::error::{ForgeError, MergeError, Result, ToolError};
use crate::runner::TerraformOutput;

use super::Phase;

/// Builds the defaults-then-user merger of a phase.
///
/// Missing sections on either side count as empty maps.
///
/// # Errors
///
/// Returns `NotAMap` if a section exists but is not a map.
pub fn phase_merger(defaults: &Value, config: &Value, phase: Phase) -> std::result::Result<Merger, MergeError> {
    let key = phase.key();
    let base = layer(defaults, &format!(".data.{key}"))?;
    let custom = layer(config, &format!(".spec.{key}"))?;
    Ok(Merger::new(base, custom))
}

fn layer(tree: &Value, path: &str) -> std::result::Result<MergeModel, MergeError> {
    let mut model = MergeModel::new(tree.clone(), path);
    let selected = model.get_or_empty()?;
    model.walk_creating(Value::Object(selected))?;
    Ok(model)
}

/// Returns the configuration with the defaults merged into every phase
/// section.
///
/// Infrastructure and kubernetes sections are only rendered when the user
/// declares them; the distribution section always is.
///
/// # Errors
///
/// Returns an error if a section cannot be merged.
pub fn render_config(config: &ClusterConfig, defaults: &Value) -> Result<Value> {
    let mut rendered = config.tree.clone();

    for phase in Phase::APPLY_ORDER {
        if phase != Phase::Distribution && !config.has_section(phase.key()) {
            continue;
        }
        let merged = phase_merger(defaults, &config.tree, phase)?.merge()?;
        debug!("Rendered {} section with {} key(s)", phase, merged.len());

        let mut section = MergeModel::new(rendered, format!(".spec.{}", phase.key()));
        section.walk_creating(Value::Object(merged))?;
        rendered = section.into_content();
    }

    Ok(rendered)
}

/// Returns the rendered section of `phase` with the cluster name added.
#[must_use]
pub fn phase_data(rendered: &Value, cluster_name: &str, phase: Phase) -> Map<String, Value> {
    let mut data = crate::config::lookup(rendered, &format!(".spec.{}", phase.key()))
        .and_then(Value::as_object)
        .cloned()
        .unwrap_or_default();
    data.insert(
        String::from("clusterName"),
        Value::String(cluster_name.to_string()),
    );
    data
}

/// Reads the outputs a phase recorded after its apply.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read or parsed.
pub async fn read_outputs(file: &Path) -> Result<Option<BTreeMap<String, TerraformOutput>>> {
    let content = match tokio::fs::read_to_string(file).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    serde_json::from_str(&content).map(Some).map_err(|e| {
        ForgeError::Tool(ToolError::InvalidOutput {
            binary: String::from("terraform"),
            message: format!("{}: {e}", file.display()),
        })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(spec: &str) -> ClusterConfig {
        ClusterConfig::from_yaml(&format!(
            "apiVersion: v1\nkind: EKSCluster\nmetadata:\n  name: demo\nspec:\n  distributionVersion: v1.2.0\n{spec}"
        ))
        .expect("valid config")
    }

    #[test]
    fn test_phase_merger_user_wins() {
        let defaults = json!({ "data": { "kubernetes": { "version": "1.29", "nodePools": [] } } });
        let cfg = config("  kubernetes:\n    version: '1.30'\n");

        let merged = phase_merger(&defaults, &cfg.tree, Phase::Kubernetes)
            .expect("merger")
            .merge()
            .expect("merge");
        assert_eq!(merged["version"], json!("1.30"));
        assert_eq!(merged["nodePools"], json!([]));
    }

    #[test]
    fn test_phase_merger_missing_sections() {
        let defaults = json!({ "data": {} });
        let cfg = config("");
        let merged = phase_merger(&defaults, &cfg.tree, Phase::Distribution)
            .expect("merger")
            .merge()
            .expect("merge");
        assert!(merged.is_empty());
    }

    #[test]
    fn test_render_config_skips_undeclared_terraform_phases() {
        let defaults = json!({ "data": {
            "infrastructure": { "vpc": { "cidr": "10.0.0.0/16" } },
            "distribution": { "modules": { "ingress": { "type": "nginx" } } }
        }});
        let cfg = config("  distribution:\n    modules:\n      ingress:\n        replicas: 2\n");

        let rendered = render_config(&cfg, &defaults).expect("render");
        assert!(rendered["spec"].get("infrastructure").is_none());
        assert_eq!(
            rendered["spec"]["distribution"]["modules"]["ingress"],
            json!({ "type": "nginx", "replicas": 2 })
        );
        assert_eq!(rendered["metadata"]["name"], json!("demo"));
    }

    #[test]
    fn test_phase_data_adds_cluster_name() {
        let rendered = json!({ "spec": { "infrastructure": { "region": "eu-west-1" } } });
        let data = phase_data(&rendered, "demo", Phase::Infrastructure);
        assert_eq!(data["region"], json!("eu-west-1"));
        assert_eq!(data["clusterName"], json!("demo"));
        assert_eq!(phase_data(&rendered, "demo", Phase::Kubernetes).len(), 1);
    }

    #[tokio::test]
    async fn test_read_outputs_missing_file() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        assert!(
            read_outputs(&dir.path().join("output.json"))
                .await
                .expect("read")
                .is_none()
        );
    }
}
