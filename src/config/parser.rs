//! Configuration loading.
//!
//! This module loads the cluster configuration and the distribution defaults
//! from YAML files, applies environment overrides and locates configuration
//! files on disk.

use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ConfigError, ForgeError, Result};

use super::spec::{ClusterConfig, StateBackend};

/// Environment variable overriding the S3 state bucket.
pub const ENV_STATE_BUCKET: &str = "CLUSTERFORGE_STATE_BUCKET";

/// Environment variable overriding the S3 state prefix.
pub const ENV_STATE_PREFIX: &str = "CLUSTERFORGE_STATE_PREFIX";

/// Environment variable pointing at the distribution directory.
pub const ENV_DISTRO_LOCATION: &str = "CLUSTERFORGE_DISTRO_LOCATION";

/// Configuration parser for loading cluster configuration.
#[derive(Debug, Default)]
pub struct ConfigParser {
    /// Base path for resolving relative paths.
    base_path: Option<PathBuf>,
}

impl ConfigParser {
    /// Creates a new configuration parser.
    #[must_use]
    pub const fn new() -> Self {
        Self { base_path: None }
    }

    /// Sets the base path for resolving relative paths.
    #[must_use]
    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = Some(path.into());
        self
    }

    /// Loads a cluster configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<ClusterConfig> {
        let path = path.as_ref();
        info!("Loading configuration from: {}", path.display());

        let content = read_file(path)?;
        ClusterConfig::from_yaml(&content).map_err(|e| match e {
            ForgeError::Config(ConfigError::ParseError { message, .. }) => {
                ForgeError::Config(ConfigError::ParseError {
                    message,
                    location: Some(path.display().to_string()),
                })
            }
            other => other,
        })
    }

    /// Loads a cluster configuration and applies environment overrides.
    ///
    /// Overrides only touch the state backend settings; the cluster spec is
    /// never rewritten from the environment.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_with_env(&self, path: impl AsRef<Path>) -> Result<ClusterConfig> {
        let mut config = self.load_file(path)?;
        Self::apply_env_overrides(&mut config);
        Ok(config)
    }

    fn apply_env_overrides(config: &mut ClusterConfig) {
        let state = &mut config.header.spec.state;

        if let Ok(bucket) = std::env::var(ENV_STATE_BUCKET) {
            debug!("Overriding state bucket from environment");
            state.backend = StateBackend::S3;
            state.bucket = Some(bucket);
        }

        if let Ok(prefix) = std::env::var(ENV_STATE_PREFIX) {
            debug!("Overriding state prefix from environment");
            state.prefix = Some(prefix);
        }
    }

    /// Loads the .env file if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the .env file exists but cannot be loaded.
    pub fn load_dotenv(&self) -> Result<()> {
        let env_path = self
            .base_path
            .as_ref()
            .map_or_else(|| PathBuf::from(".env"), |p| p.join(".env"));

        if env_path.exists() {
            info!("Loading environment from: {}", env_path.display());
            dotenvy::from_path(&env_path).map_err(|e| ConfigError::ParseError {
                message: format!("Failed to load .env file: {e}"),
                location: Some(env_path.display().to_string()),
            })?;
        } else {
            debug!(".env file not found at: {}", env_path.display());
        }

        Ok(())
    }

    /// Loads the distribution defaults for a cluster kind.
    ///
    /// Defaults live in `<distro>/defaults/<kind>.yaml` under a `data` root.
    /// A missing file yields empty defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be parsed.
    pub fn load_defaults(distro_dir: &Path, kind: &str) -> Result<Value> {
        let path = defaults_path(distro_dir, kind);
        if !path.exists() {
            debug!("No distribution defaults at {}", path.display());
            return Ok(json!({ "data": Map::new() }));
        }

        let content = read_file(&path)?;
        let defaults: Value = serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError {
            message: format!("YAML parse error: {e}"),
            location: Some(path.display().to_string()),
        })?;

        if defaults.get("data").is_none_or(Value::is_null) {
            return Ok(json!({ "data": Map::new() }));
        }
        Ok(defaults)
    }
}

/// Returns the path of the defaults file for a cluster kind.
#[must_use]
pub fn defaults_path(distro_dir: &Path, kind: &str) -> PathBuf {
    distro_dir
        .join("defaults")
        .join(format!("{}.yaml", kind.to_lowercase()))
}

fn read_file(path: &Path) -> Result<String> {
    if !path.exists() {
        return Err(ForgeError::Config(ConfigError::FileNotFound {
            path: path.to_path_buf(),
        }));
    }

    std::fs::read_to_string(path).map_err(|e| {
        ForgeError::Config(ConfigError::ParseError {
            message: format!("Failed to read file: {e}"),
            location: Some(path.display().to_string()),
        })
    })
}

/// Default configuration file names to search for.
pub const DEFAULT_CONFIG_FILES: &[&str] = &[
    "clusterforge.yaml",
    "clusterforge.yml",
    "cluster.yaml",
    "cluster.yml",
];

/// Finds the configuration file in the current directory or parent directories.
///
/// # Errors
///
/// Returns an error if no configuration file is found.
pub fn find_config_file(start_dir: impl AsRef<Path>) -> Result<PathBuf> {
    let start = start_dir.as_ref();
    let mut current = start.to_path_buf();

    loop {
        for filename in DEFAULT_CONFIG_FILES {
            let config_path = current.join(filename);
            if config_path.exists() {
                info!("Found configuration file: {}", config_path.display());
                return Ok(config_path);
            }
        }

        if !current.pop() {
            break;
        }
    }

    Err(ForgeError::Config(ConfigError::FileNotFound {
        path: start.join(DEFAULT_CONFIG_FILES[0]),
    }))
}
