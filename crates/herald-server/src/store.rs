//! Configuration storage backends.
//!
//! [`MemoryConfigStorage`] backs tests and single-process deployments;
//! [`FileConfigStorage`] persists one JSON document per tenant under a
//! data directory. Both sit behind the [`ConfigStorage`] seam so the
//! store logic never knows which one it is talking to.

use std::path::PathBuf;

use dashmap::DashMap;
use tracing::debug;

use herald_core::TenantId;

use crate::configstore::{ConfigStorage, ConfigStoreError, StoredConfig};

/// In-memory storage keyed by tenant.
#[derive(Default)]
pub struct MemoryConfigStorage {
    records: DashMap<TenantId, StoredConfig>,
}

impl MemoryConfigStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl ConfigStorage for MemoryConfigStorage {
    async fn load(&self, tenant: TenantId) -> Result<Option<StoredConfig>, ConfigStoreError> {
        Ok(self.records.get(&tenant).map(|r| r.clone()))
    }

    async fn store(&self, record: StoredConfig) -> Result<(), ConfigStoreError> {
        self.records.insert(record.tenant, record);
        Ok(())
    }
}

/// File-per-tenant storage: `<data_dir>/tenant-<id>.json`.
///
/// Writes go to a temporary file in the same directory and are renamed
/// into place, so a crash mid-write leaves the previous record intact.
pub struct FileConfigStorage {
    data_dir: PathBuf,
}

impl FileConfigStorage {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
        }
    }

    fn path_for(&self, tenant: TenantId) -> PathBuf {
        self.data_dir.join(format!("tenant-{}.json", tenant.0))
    }
}

#[async_trait::async_trait]
impl ConfigStorage for FileConfigStorage {
    async fn load(&self, tenant: TenantId) -> Result<Option<StoredConfig>, ConfigStoreError> {
        let path = self.path_for(tenant);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(ConfigStoreError::Storage(format!(
                    "read {}: {e}",
                    path.display()
                )))
            }
        };
        let record: StoredConfig = serde_json::from_slice(&bytes)
            .map_err(|e| ConfigStoreError::Storage(format!("decode {}: {e}", path.display())))?;
        Ok(Some(record))
    }

    async fn store(&self, record: StoredConfig) -> Result<(), ConfigStoreError> {
        tokio::fs::create_dir_all(&self.data_dir)
            .await
            .map_err(|e| {
                ConfigStoreError::Storage(format!("create {}: {e}", self.data_dir.display()))
            })?;

        let path = self.path_for(record.tenant);
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(&record)
            .map_err(|e| ConfigStoreError::Storage(format!("encode: {e}")))?;

        tokio::fs::write(&tmp, &bytes).await.map_err(|e| {
            ConfigStoreError::Storage(format!("write {}: {e}", tmp.display()))
        })?;
        tokio::fs::rename(&tmp, &path).await.map_err(|e| {
            ConfigStoreError::Storage(format!("rename {}: {e}", path.display()))
        })?;
        debug!(tenant = %record.tenant, path = %path.display(), "configuration persisted");
        Ok(())
    }
}
