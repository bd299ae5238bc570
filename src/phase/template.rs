//! Materialization of a phase's templates into its working directory.

use async_trait::async_trait;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ForgeError, Result};

use super::{OperationPhase, Phase};

/// Writes a phase's templates and data into its working directory.
#[async_trait]
pub trait TemplateRenderer: Send + Sync {
    /// Renders the templates of `op.phase` found under `distro_dir` with
    /// `data`.
    async fn render(&self, distro_dir: &Path, op: &OperationPhase, data: &Value) -> Result<()>;
}

/// Copies `<distro>/templates/<phase>/` into the working directory and writes
/// the phase data next to it.
///
/// Terraform phases get `terraform/terraform.tfvars.json`; the distribution
/// phase gets `values.json` at its root.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTreeRenderer;

impl FileTreeRenderer {
    /// Returns the template directory of a phase.
    #[must_use]
    pub fn source_dir(distro_dir: &Path, phase: Phase) -> PathBuf {
        distro_dir.join("templates").join(phase.key())
    }

    /// Returns where the phase data is written.
    #[must_use]
    pub fn data_file(op: &OperationPhase) -> PathBuf {
        match op.phase {
            Phase::Infrastructure | Phase::Kubernetes => op.terraform.join("terraform.tfvars.json"),
            Phase::PreFlight | Phase::Distribution => op.path.join("values.json"),
        }
    }
}

fn copy_tree(from: &Path, to: &Path) -> std::io::Result<usize> {
    let mut copied = 0;
    std::fs::create_dir_all(to)?;
    for entry in std::fs::read_dir(from)? {
        let entry = entry?;
        let target = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copied += copy_tree(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
            copied += 1;
        }
    }
    Ok(copied)
}

#[async_trait]
impl TemplateRenderer for FileTreeRenderer {
    async fn render(&self, distro_dir: &Path, op: &OperationPhase, data: &Value) -> Result<()> {
        let source = Self::source_dir(distro_dir, op.phase);
        if source.is_dir() {
            let target = op.path.clone();
            let from = source.clone();
            let copied = tokio::task::spawn_blocking(move || copy_tree(&from, &target))
                .await
                .map_err(|e| ForgeError::internal(format!("template copy task failed: {e}")))??;
            info!("Rendered {} template file(s) from {}", copied, source.display());
        } else {
            debug!("No templates for {} at {}", op.phase, source.display());
        }

        let file = Self::data_file(op);
        if let Some(parent) = file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(data)
            .map_err(|e| ForgeError::internal(format!("cannot serialize phase data: {e}")))?;
        tokio::fs::write(&file, json).await?;
        debug!("Wrote phase data to {}", file.display());
        Ok(())
    }
}
