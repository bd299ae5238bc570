//! Cluster state store trait definition.
//!
//! A store keeps, per cluster, the last successfully applied configuration
//! (raw and rendered), the upgrade state of the current run and the lock.

use async_trait::async_trait;

use crate::error::Result;

use super::lock::LockInfo;
use super::types::UpgradeState;

/// Stored raw configuration document.
pub const CONFIG_FILE: &str = "config.yaml";

/// Stored rendered configuration document.
pub const RENDERED_CONFIG_FILE: &str = "rendered-config.json";

/// Upgrade state document.
pub const UPGRADE_STATE_FILE: &str = "upgrade-state.json";

/// Lock document.
pub const LOCK_FILE: &str = "state.lock";

/// Trait for cluster state storage backends.
#[async_trait]
pub trait ClusterStateStore: Send + Sync {
    /// Returns the last applied configuration document.
    ///
    /// Returns `None` before the first successful run.
    async fn get_config(&self) -> Result<Option<Vec<u8>>>;

    /// Returns the last applied rendered configuration.
    async fn get_rendered_config(&self) -> Result<Option<Vec<u8>>>;

    /// Stores the configuration of a successful run.
    async fn store_config(&self, raw: &[u8], rendered: &[u8]) -> Result<()>;

    /// Loads the upgrade state of the current or last run.
    async fn load_upgrade_state(&self) -> Result<Option<UpgradeState>>;

    /// Persists the upgrade state.
    async fn save_upgrade_state(&self, state: &UpgradeState) -> Result<()>;

    /// Acquires the cluster lock.
    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo>;

    /// Releases the cluster lock if `lock_id` still holds it.
    async fn release_lock(&self, lock_id: &str) -> Result<()>;

    /// Removes the lock whoever holds it.
    async fn force_unlock(&self) -> Result<()>;

    /// Gets current lock information if locked.
    async fn get_lock_info(&self) -> Result<Option<LockInfo>>;

    /// Checks if the state is locked.
    async fn is_locked(&self) -> Result<bool> {
        Ok(self
            .get_lock_info()
            .await?
            .is_some_and(|lock| !lock.is_expired()))
    }

    /// Gets the backend type name.
    fn backend_type(&self) -> &'static str;
}

#[async_trait]
impl ClusterStateStore for Box<dyn ClusterStateStore> {
    async fn get_config(&self) -> Result<Option<Vec<u8>>> {
        (**self).get_config().await
    }

    async fn get_rendered_config(&self) -> Result<Option<Vec<u8>>> {
        (**self).get_rendered_config().await
    }

    async fn store_config(&self, raw: &[u8], rendered: &[u8]) -> Result<()> {
        (**self).store_config(raw, rendered).await
    }

    async fn load_upgrade_state(&self) -> Result<Option<UpgradeState>> {
        (**self).load_upgrade_state().await
    }

    async fn save_upgrade_state(&self, state: &UpgradeState) -> Result<()> {
        (**self).save_upgrade_state(state).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        (**self).acquire_lock(holder, operation).await
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        (**self).release_lock(lock_id).await
    }

    async fn force_unlock(&self) -> Result<()> {
        (**self).force_unlock().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        (**self).get_lock_info().await
    }

    async fn is_locked(&self) -> Result<bool> {
        (**self).is_locked().await
    }

    fn backend_type(&self) -> &'static str {
        (**self).backend_type()
    }
}
