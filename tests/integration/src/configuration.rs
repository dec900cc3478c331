//! Configuration persistence and optimistic-concurrency writes
//! through the file-backed store.

use std::sync::Arc;

use herald_cluster::SingleNodeTransport;
use herald_core::TenantId;
use herald_server::store::FileConfigStorage;
use herald_server::{ConfigStore, ConfigStoreError};

use crate::helpers::{orchestrator_with, OPS_CONFIG};

const NIGHT_CONFIG: &str =
    r#"{"receivers": [{"name": "night", "integrations": [{"kind": "log"}]}], "route": {"receiver": "night"}}"#;

#[tokio::test]
async fn configuration_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let (orchestrator, _) = orchestrator_with(
            Arc::new(SingleNodeTransport),
            Arc::new(FileConfigStorage::new(dir.path())),
            &[7],
        );
        orchestrator.startup().await.unwrap();
        orchestrator
            .save_config(TenantId(7), OPS_CONFIG, None)
            .await
            .unwrap();
        orchestrator.shutdown(std::time::Duration::from_secs(5)).await;
    }

    // a fresh orchestrator over the same directory picks the config up
    let (orchestrator, store) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(FileConfigStorage::new(dir.path())),
        &[7],
    );
    orchestrator.startup().await.unwrap();

    let current = store.get_current(TenantId(7)).await.unwrap();
    assert_eq!(current.config.route.receiver, "ops");
    let status = orchestrator.status(TenantId(7)).unwrap();
    assert_eq!(status.config_hash.as_deref(), Some(current.hash.as_str()));
}

#[tokio::test]
async fn concurrent_editors_detect_each_other_through_the_hash() {
    let dir = tempfile::tempdir().unwrap();
    // two store instances over one directory, as two processes would be
    let store_a = ConfigStore::new(Arc::new(FileConfigStorage::new(dir.path())));
    let store_b = ConfigStore::new(Arc::new(FileConfigStorage::new(dir.path())));

    let first = store_a.save(TenantId(1), OPS_CONFIG, None).await.unwrap();

    // editor B updates from the hash it read
    let current_b = store_b.get_current(TenantId(1)).await.unwrap();
    store_b
        .save(TenantId(1), NIGHT_CONFIG, Some(&current_b.hash))
        .await
        .unwrap();

    // editor A retries with its stale hash and is rejected
    let err = store_a
        .save(TenantId(1), OPS_CONFIG, Some(&first.hash))
        .await
        .unwrap_err();
    match err {
        ConfigStoreError::Conflict { stored, .. } => {
            assert_eq!(
                stored,
                store_a.get_current(TenantId(1)).await.unwrap().hash
            );
        }
        other => panic!("expected conflict, got {other}"),
    }

    // B's write is intact
    let current = store_a.get_current(TenantId(1)).await.unwrap();
    assert_eq!(current.config.route.receiver, "night");
    assert_eq!(current.version, 2);
}

#[tokio::test]
async fn invalid_configuration_never_reaches_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::new(Arc::new(FileConfigStorage::new(dir.path())));

    let err = store
        .save(TenantId(2), r#"{"receivers": [], "route": {"receiver": "ghost"}}"#, None)
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigStoreError::Invalid(_)));
    assert!(!dir.path().join("tenant-2.json").exists());
}
