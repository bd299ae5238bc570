//! Structural validation of cluster configurations.
//!
//! Schema validation of the full spec is delegated to the distribution; this
//! validator only checks the fields the engine itself relies on.

use serde::Serialize;
use tracing::debug;

use crate::error::{ConfigError, ForgeError, Result};

use super::spec::{ClusterConfig, StateBackend, StateConfig};

/// Cluster kinds the engine knows how to drive.
const KNOWN_KINDS: &[&str] = &["EKSCluster", "KFDDistribution", "OnPremises"];

/// Validator for cluster configurations.
#[derive(Debug, Default)]
pub struct ConfigValidator;

/// Validation result containing all errors found.
#[derive(Debug, Default, Serialize)]
pub struct ValidationResult {
    /// List of validation errors.
    pub errors: Vec<ValidationError>,
    /// List of warnings (non-fatal issues).
    pub warnings: Vec<String>,
}

/// A single validation error.
#[derive(Debug, Serialize)]
pub struct ValidationError {
    /// The field path that failed validation.
    pub field: String,
    /// The error message.
    pub message: String,
}

impl ValidationResult {
    fn error(&mut self, field: &str, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.to_string(),
            message: message.into(),
        });
    }
}

impl ConfigValidator {
    /// Creates a new validator.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Collects every problem found in a configuration.
    #[must_use]
    pub fn check(&self, config: &ClusterConfig) -> ValidationResult {
        let mut result = ValidationResult::default();

        Self::validate_metadata(config, &mut result);
        Self::validate_kind(config, &mut result);
        Self::validate_version(config, &mut result);
        Self::validate_state(&config.header.spec.state, &mut result);
        Self::validate_sections(config, &mut result);

        result
    }

    /// Validates a cluster configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error if any was found.
    pub fn validate(&self, config: &ClusterConfig) -> Result<ValidationResult> {
        let mut result = self.check(config);

        if result.errors.is_empty() {
            debug!("Configuration validation passed");
            Ok(result)
        } else {
            let first = result.errors.swap_remove(0);
            Err(ForgeError::Config(ConfigError::ValidationError {
                message: first.message,
                field: Some(first.field),
            }))
        }
    }

    fn validate_metadata(config: &ClusterConfig, result: &mut ValidationResult) {
        let name = config.name();
        if name.is_empty() {
            result.error("metadata.name", "Cluster name cannot be empty");
        } else if !is_valid_name(name) {
            result.error(
                "metadata.name",
                format!(
                    "Cluster name '{name}' is invalid. Must be lowercase alphanumeric with hyphens."
                ),
            );
        }
    }

    fn validate_kind(config: &ClusterConfig, result: &mut ValidationResult) {
        let kind = config.kind();
        if kind.is_empty() {
            result.error("kind", "Cluster kind cannot be empty");
        } else if !KNOWN_KINDS.contains(&kind) {
            result
                .warnings
                .push(format!("Unknown cluster kind '{kind}', rules and defaults may be missing"));
        }
    }

    fn validate_version(config: &ClusterConfig, result: &mut ValidationResult) {
        let version = config.distribution_version();
        if version.is_empty() {
            result.error("spec.distributionVersion", "Distribution version cannot be empty");
        } else if !version.starts_with('v') {
            result.warnings.push(format!(
                "Distribution version '{version}' does not start with 'v'"
            ));
        }
    }

    fn validate_state(state: &StateConfig, result: &mut ValidationResult) {
        match state.backend {
            StateBackend::S3 => {
                if state.bucket.as_ref().is_none_or(String::is_empty) {
                    result.error(
                        "spec.state.bucket",
                        "S3 bucket name is required when using S3 backend",
                    );
                }
            }
            StateBackend::Local => {}
        }
    }

    fn validate_sections(config: &ClusterConfig, result: &mut ValidationResult) {
        if config.is_eks() && !config.has_section("kubernetes") {
            result.error(
                "spec.kubernetes",
                "EKSCluster configurations require a kubernetes section",
            );
        }
        if !config.has_section("distribution") {
            result
                .warnings
                .push(String::from("No distribution section, only distribution defaults will apply"));
        }
    }
}

/// Checks if a name is valid (lowercase alphanumeric with hyphens).
fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 56 {
        return false;
    }

    let first_char = name.chars().next();
    let last_char = name.chars().last();

    if !first_char.is_some_and(|c| c.is_ascii_lowercase()) {
        return false;
    }

    if last_char == Some('-') {
        return false;
    }

    name.chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
