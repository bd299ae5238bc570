//! State management module for the clusterforge engine.
//!
//! This module persists, per cluster, the last applied configuration, the
//! sub-phase outcomes used to resume interrupted runs, and the run lock.

mod local;
mod lock;
mod s3;
mod store;
mod types;

pub use local::{LocalStateStore, STATE_DIR};
pub use lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
pub use s3::S3StateStore;
pub use store::{
    CONFIG_FILE, ClusterStateStore, LOCK_FILE, RENDERED_CONFIG_FILE, UPGRADE_STATE_FILE,
};
pub use types::{PhaseStatus, STATE_VERSION, UpgradeState};

use std::path::Path;
use tracing::info;

use crate::config::{ClusterConfig, StateBackend};
use crate::error::{ConfigError, Result};

/// Opens the state store configured for a cluster.
///
/// # Errors
///
/// Returns an error if the S3 backend lacks a bucket or cannot be initialized.
pub async fn open_store(config: &ClusterConfig, workdir: &Path) -> Result<Box<dyn ClusterStateStore>> {
    let state = &config.header.spec.state;

    match state.backend {
        StateBackend::Local => {
            let root = state
                .path
                .as_ref()
                .map_or_else(|| workdir.to_path_buf(), |p| workdir.join(p));
            let store = LocalStateStore::for_cluster(&root, config.name());
            info!("Using local state in {}", store.base_dir().display());
            Ok(Box::new(store))
        }
        StateBackend::S3 => {
            let bucket = state
                .bucket
                .as_deref()
                .filter(|b| !b.is_empty())
                .ok_or_else(|| {
                    ConfigError::validation(
                        "S3 bucket name is required when using S3 backend",
                        "spec.state.bucket",
                    )
                })?;
            info!("Using S3 state in bucket {}", bucket);
            let store = S3StateStore::new(
                bucket,
                state.prefix.as_deref(),
                state.region.as_deref(),
                config.name(),
            )
            .await?;
            Ok(Box::new(store))
        }
    }
}
