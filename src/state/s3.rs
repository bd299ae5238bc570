//! S3-based state storage backend.
//!
//! This module stores cluster state in AWS S3 (or compatible services) so that
//! several operators can drive the same cluster.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{ForgeError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::{
    CONFIG_FILE, ClusterStateStore, LOCK_FILE, RENDERED_CONFIG_FILE, UPGRADE_STATE_FILE,
};
use super::types::UpgradeState;

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix, ending with `/` unless empty.
    prefix: String,
}

fn normalize_prefix(prefix: Option<&str>, cluster: &str) -> String {
    let base = prefix.map(|p| p.trim_matches('/')).unwrap_or_default();
    if base.is_empty() {
        format!("{cluster}/")
    } else {
        format!("{base}/{cluster}/")
    }
}

impl S3StateStore {
    /// Creates a store for `cluster` in `bucket`.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(
        bucket: &str,
        prefix: Option<&str>,
        region: Option<&str>,
        cluster: &str,
    ) -> Result<Self> {
        let config = if let Some(region_str) = region {
            aws_config::from_env()
                .region(aws_config::Region::new(region_str.to_string()))
                .load()
                .await
        } else {
            aws_config::load_from_env().await
        };

        Ok(Self::with_client(Client::new(&config), bucket, prefix, cluster))
    }

    /// Creates a store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>, cluster: &str) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix, cluster),
        }
    }

    /// Gets the full S3 key for a document.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, file: &str) -> Result<Option<Vec<u8>>> {
        let key = self.key(file);
        debug!("Reading s3://{}/{key}", self.bucket);

        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let bytes = response.body.collect().await.map_err(|e| {
                    ForgeError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;
                Ok(Some(bytes.to_vec()))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(ForgeError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, file: &str, content: &[u8], content_type: &str) -> Result<()> {
        let key = self.key(file);
        debug!("Writing s3://{}/{key}", self.bucket);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(content.to_vec().into())
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| ForgeError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, file: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(file))
            .send()
            .await
            .map_err(|e| ForgeError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }
}

#[async_trait]
impl ClusterStateStore for S3StateStore {
    async fn get_config(&self) -> Result<Option<Vec<u8>>> {
        self.get_object(CONFIG_FILE).await
    }

    async fn get_rendered_config(&self) -> Result<Option<Vec<u8>>> {
        self.get_object(RENDERED_CONFIG_FILE).await
    }

    async fn store_config(&self, raw: &[u8], rendered: &[u8]) -> Result<()> {
        info!(
            "Storing applied configuration in s3://{}/{}",
            self.bucket, self.prefix
        );
        self.put_object(CONFIG_FILE, raw, "application/yaml").await?;
        self.put_object(RENDERED_CONFIG_FILE, rendered, "application/json")
            .await
    }

    async fn load_upgrade_state(&self) -> Result<Option<UpgradeState>> {
        let Some(content) = self.get_object(UPGRADE_STATE_FILE).await? else {
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
        self.put_object(UPGRADE_STATE_FILE, &content, "application/json")
            .await
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        if let Some(existing) = self.get_lock_info().await? {
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
        self.put_object(LOCK_FILE, &content, "application/json").await?;

        info!(
            "Acquired state lock: {} (expires in {}s)",
            lock_info.lock_id, LOCK_EXPIRY_SECS
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.get_lock_info().await? {
            if existing.lock_id == lock_id {
                self.delete_object(LOCK_FILE).await?;
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
        self.delete_object(LOCK_FILE).await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        let Some(content) = self.get_object(LOCK_FILE).await? else {
            return Ok(None);
        };

        let lock_info: LockInfo = serde_json::from_slice(&content).map_err(|e| {
            ForgeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;
        Ok(Some(lock_info))
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None, "demo"), "demo/");
        assert_eq!(normalize_prefix(Some(""), "demo"), "demo/");
        assert_eq!(normalize_prefix(Some("/clusters/"), "demo"), "clusters/demo/");
        assert_eq!(normalize_prefix(Some("a/b"), "demo"), "a/b/demo/");
    }
}
