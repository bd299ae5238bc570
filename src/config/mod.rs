//! Configuration module for the clusterforge engine.
//!
//! This module handles all configuration-related functionality:
//! - Parsing the cluster configuration and distribution defaults
//! - Path-scoped models and the layered merge chain
//! - Structural validation and hashing for resume detection

mod hash;
mod merge;
mod model;
mod parser;
mod spec;
mod validator;

pub use hash::ConfigHasher;
pub use merge::{Merger, merge_maps, merge_values};
pub use model::{MergeModel, lookup, selector_segments};
pub use parser::{
    ConfigParser, DEFAULT_CONFIG_FILES, ENV_DISTRO_LOCATION, ENV_STATE_BUCKET, ENV_STATE_PREFIX,
    defaults_path, find_config_file,
};
pub use spec::{
    ClusterConfig, ClusterHeader, CriticalResources, HeaderSpec, Metadata, StateBackend,
    StateConfig, ToolsConfiguration,
};
pub use validator::{ConfigValidator, ValidationError, ValidationResult};
