//! Local file-based state storage backend.
//!
//! State lives in `.clusterforge/<cluster>/` next to the configuration. Every
//! document is written to a temporary file first and renamed into place.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::{ForgeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{
    CONFIG_FILE, ClusterStateStore, LOCK_FILE, RENDERED_CONFIG_FILE, UPGRADE_STATE_FILE,
};
use super::types::UpgradeState;

/// Default state directory name.
pub const STATE_DIR: &str = ".clusterforge";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Directory holding the cluster's state documents.
    base_dir: PathBuf,
}

impl LocalStateStore {
    /// Creates a store for `cluster` under `<root>/.clusterforge/`.
    #[must_use]
    pub fn for_cluster(root: &Path, cluster: &str) -> Self {
        Self::with_base_dir(root.join(STATE_DIR).join(cluster))
    }

    /// Creates a store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    /// Returns the directory holding the state documents.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path(&self, file: &str) -> PathBuf {
        self.base_dir.join(file)
    }

    /// Ensures the state directory exists.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.base_dir.exists() {
            debug!("Creating state directory: {}", self.base_dir.display());
            fs::create_dir_all(&self.base_dir).await.map_err(|e| {
                ForgeError::State(StateError::local(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path(file);
        if !path.exists() {
            debug!("State document does not exist: {}", path.display());
            return Ok(None);
        }

        let content = fs::read(&path).await.map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to read {}: {e}", path.display()),
            })
        })?;
        Ok(Some(content))
    }

    async fn write_atomic(&self, file: &str, content: &[u8]) -> Result<()> {
        self.ensure_dir().await?;

        let path = self.path(file);
        let temp_path = path.with_extension("tmp");
        let local = |what: &str, e: std::io::Error| {
            ForgeError::State(StateError::local(format!("Failed to {what} {}: {e}", path.display())))
        };

        let mut handle = fs::File::create(&temp_path)
            .await
            .map_err(|e| local("create temp file for", e))?;
        handle
            .write_all(content)
            .await
            .map_err(|e| local("write", e))?;
        handle.sync_all().await.map_err(|e| local("sync", e))?;

        fs::rename(&temp_path, &path)
            .await
            .map_err(|e| local("rename into", e))?;

        debug!("Wrote {}", path.display());
        Ok(())
    }

    async fn remove(&self, file: &str) -> Result<()> {
        let path = self.path(file);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                ForgeError::State(StateError::LockFailed {
                    message: format!("Failed to delete {}: {e}", path.display()),
                })
            })?;
        }
        Ok(())
    }

    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.read(LOCK_FILE).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_slice(&content).map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }
}

#[async_trait]
impl ClusterStateStore for LocalStateStore {
    async fn get_config(&self) -> Result<Option<Vec<u8>>> {
        self.read(CONFIG_FILE).await
    }

    async fn get_rendered_config(&self) -> Result<Option<Vec<u8>>> {
        self.read(RENDERED_CONFIG_FILE).await
    }

    async fn store_config(&self, raw: &[u8], rendered: &[u8]) -> Result<()> {
        info!("Storing applied configuration in {}", self.base_dir.display());
        self.write_atomic(CONFIG_FILE, raw).await?;
        self.write_atomic(RENDERED_CONFIG_FILE, rendered).await
    }

    async fn load_upgrade_state(&self) -> Result<Option<UpgradeState>> {
        let Some(content) = self.read(UPGRADE_STATE_FILE).await? else {
            return Ok(None);
        };

        let state: UpgradeState = serde_json::from_slice(&content).map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to parse upgrade state: {e}"),
            })
        })?;
        Ok(Some(state))
    }

    async fn save_upgrade_state(&self, state: &UpgradeState) -> Result<()> {
        let content = serde_json::to_vec_pretty(state).map_err(|e| {
            ForgeError::State(StateError::serialization(format!(
                "Failed to serialize upgrade state: {e}"
            )))
        })?;
        self.write_atomic(UPGRADE_STATE_FILE, &content).await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.read_lock_file().await? {
            if !existing.is_expired() {
                return Err(ForgeError::State(StateError::LockedByOther {
                    holder: existing.holder.clone(),
                    since: existing.acquired_at.to_rfc3339(),
                }));
            }
            debug!("Expired lock found, taking over");
        }

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation);
        let content = serde_json::to_vec_pretty(&lock_info).map_err(|e| {
            ForgeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;
        self.write_atomic(LOCK_FILE, &content).await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.remove(LOCK_FILE).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        self.remove(LOCK_FILE).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}
