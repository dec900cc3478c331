//! Optimistic-concurrency configuration store.
//!
//! Routing configuration can be edited concurrently by an interactive
//! user and an automated provisioning job. Writes are accepted only if
//! the caller's expected content hash still matches the stored one —
//! compare-and-swap detects the race without a cross-request
//! transactional lock. A conflict is surfaced verbatim and never
//! retried here: a blind retry could discard a legitimate concurrent
//! edit.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use metrics::counter;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use herald_core::{content_hash, RoutingConfig, TenantId, ValidationError};

/// A persisted configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredConfig {
    pub tenant: TenantId,
    /// The exact raw bytes the configuration was saved from, as JSON
    /// text. Hashing and parsing both operate on these bytes.
    pub raw: String,
    /// Content digest of `raw`, used solely for CAS conflict
    /// detection.
    pub hash: String,
    /// Monotonic version tag, bumped on every accepted write.
    pub version: u64,
    /// Unix seconds of the last accepted write.
    pub applied_at: i64,
}

/// The currently stored configuration, parsed.
#[derive(Debug, Clone)]
pub struct CurrentConfig {
    pub config: RoutingConfig,
    pub raw: String,
    pub hash: String,
    pub version: u64,
}

/// Errors from configuration-store operations.
#[derive(Debug, Error)]
pub enum ConfigStoreError {
    /// The tenant has never saved a configuration.
    #[error("no configuration stored for tenant {0}")]
    NotFound(TenantId),

    /// The caller's expected hash no longer matches the stored hash.
    /// Re-fetch and retry; stored state is unchanged.
    #[error("configuration conflict for tenant {tenant}: expected hash {expected}, stored {stored}")]
    Conflict {
        tenant: TenantId,
        expected: String,
        stored: String,
    },

    /// The payload failed structural validation. Nothing was written.
    #[error("invalid configuration: {0}")]
    Invalid(#[from] ValidationError),

    /// The storage backend failed.
    #[error("configuration storage error: {0}")]
    Storage(String),
}

/// Persistence seam behind the store. The SQL engine the original
/// system uses is out of scope; in-memory and file backends live in
/// [`crate::store`].
#[async_trait::async_trait]
pub trait ConfigStorage: Send + Sync {
    async fn load(&self, tenant: TenantId) -> Result<Option<StoredConfig>, ConfigStoreError>;
    async fn store(&self, record: StoredConfig) -> Result<(), ConfigStoreError>;
}

/// Hash-and-version-stamped configuration store with CAS writes.
pub struct ConfigStore {
    storage: Arc<dyn ConfigStorage>,
    /// Serializes the read-compare-write section. Held only for the
    /// duration of one save, never across user-visible awaitables
    /// other than the storage calls themselves.
    write_lock: tokio::sync::Mutex<()>,
}

impl ConfigStore {
    pub fn new(storage: Arc<dyn ConfigStorage>) -> Self {
        Self {
            storage,
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Returns the tenant's current configuration, parsed, with its
    /// content hash and version.
    pub async fn get_current(&self, tenant: TenantId) -> Result<CurrentConfig, ConfigStoreError> {
        let record = self
            .storage
            .load(tenant)
            .await?
            .ok_or(ConfigStoreError::NotFound(tenant))?;
        let config = RoutingConfig::parse(record.raw.as_bytes())?;
        Ok(CurrentConfig {
            config,
            raw: record.raw,
            hash: record.hash,
            version: record.version,
        })
    }

    /// Validates and persists a new configuration.
    ///
    /// `expected_hash` is the hash the caller last observed: `None`
    /// asserts no configuration exists yet. On mismatch the write is
    /// rejected with [`ConfigStoreError::Conflict`] and stored state
    /// is byte-for-byte unchanged.
    pub async fn save(
        &self,
        tenant: TenantId,
        raw: &str,
        expected_hash: Option<&str>,
    ) -> Result<StoredConfig, ConfigStoreError> {
        // reject before touching storage
        RoutingConfig::parse(raw.as_bytes())?;
        let hash = content_hash(raw.as_bytes());

        let _guard = self.write_lock.lock().await;
        let current = self.storage.load(tenant).await?;

        let version = match (&current, expected_hash) {
            (None, None) => 1,
            (None, Some(expected)) => {
                counter!("herald_config_conflicts_total").increment(1);
                return Err(ConfigStoreError::Conflict {
                    tenant,
                    expected: expected.to_string(),
                    stored: "<none>".to_string(),
                });
            }
            (Some(stored), Some(expected)) if stored.hash == expected => stored.version + 1,
            (Some(stored), _) => {
                counter!("herald_config_conflicts_total").increment(1);
                return Err(ConfigStoreError::Conflict {
                    tenant,
                    expected: expected_hash.unwrap_or("<none>").to_string(),
                    stored: stored.hash.clone(),
                });
            }
        };

        let record = StoredConfig {
            tenant,
            raw: raw.to_string(),
            hash,
            version,
            applied_at: unix_now(),
        };
        self.storage.store(record.clone()).await?;
        counter!("herald_config_saves_total").increment(1);
        debug!(%tenant, version, hash = %record.hash, "configuration saved");
        Ok(record)
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryConfigStorage;

    const CONFIG_A: &str = r#"{"receivers": [{"name": "ops"}], "route": {"receiver": "ops"}}"#;
    const CONFIG_B: &str = r#"{"receivers": [{"name": "night"}], "route": {"receiver": "night"}}"#;

    fn store() -> ConfigStore {
        ConfigStore::new(Arc::new(MemoryConfigStorage::new()))
    }

    #[tokio::test]
    async fn get_current_for_unknown_tenant_is_not_found() {
        let store = store();
        assert!(matches!(
            store.get_current(TenantId(7)).await,
            Err(ConfigStoreError::NotFound(TenantId(7)))
        ));
    }

    #[tokio::test]
    async fn first_save_then_get_roundtrip() {
        let store = store();
        let saved = store.save(TenantId(7), CONFIG_A, None).await.unwrap();
        assert_eq!(saved.version, 1);

        let current = store.get_current(TenantId(7)).await.unwrap();
        assert_eq!(current.hash, saved.hash);
        assert_eq!(current.config.route.receiver, "ops");
    }

    #[tokio::test]
    async fn save_with_matching_hash_bumps_version_and_hash() {
        let store = store();
        let first = store.save(TenantId(7), CONFIG_A, None).await.unwrap();
        let second = store
            .save(TenantId(7), CONFIG_B, Some(&first.hash))
            .await
            .unwrap();
        assert_eq!(second.version, 2);
        assert_ne!(second.hash, first.hash);
    }

    #[tokio::test]
    async fn stale_hash_conflicts_and_leaves_state_unchanged() {
        let store = store();
        let first = store.save(TenantId(7), CONFIG_A, None).await.unwrap();
        // an interactive edit lands in between
        store
            .save(TenantId(7), CONFIG_B, Some(&first.hash))
            .await
            .unwrap();

        // the provisioning job retries with the hash it saw first
        let err = store
            .save(TenantId(7), CONFIG_A, Some(&first.hash))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigStoreError::Conflict { .. }));

        let current = store.get_current(TenantId(7)).await.unwrap();
        assert_eq!(current.config.route.receiver, "night");
        assert_eq!(current.version, 2);
    }

    #[tokio::test]
    async fn expecting_no_config_when_one_exists_conflicts() {
        let store = store();
        store.save(TenantId(7), CONFIG_A, None).await.unwrap();
        let err = store.save(TenantId(7), CONFIG_B, None).await.unwrap_err();
        assert!(matches!(err, ConfigStoreError::Conflict { .. }));
    }

    #[tokio::test]
    async fn invalid_payload_is_rejected_before_storage() {
        let store = store();
        let err = store
            .save(TenantId(7), r#"{"receivers": [], "route": {"receiver": "x"}}"#, None)
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigStoreError::Invalid(_)));
        // nothing was written
        assert!(matches!(
            store.get_current(TenantId(7)).await,
            Err(ConfigStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let store = store();
        store.save(TenantId(1), CONFIG_A, None).await.unwrap();
        store.save(TenantId(2), CONFIG_B, None).await.unwrap();
        assert_eq!(
            store.get_current(TenantId(1)).await.unwrap().config.route.receiver,
            "ops"
        );
        assert_eq!(
            store.get_current(TenantId(2)).await.unwrap().config.route.receiver,
            "night"
        );
    }
}
