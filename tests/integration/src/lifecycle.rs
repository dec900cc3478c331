//! Engine lifecycle across reconcile passes.

use std::sync::Arc;

use herald_cluster::SingleNodeTransport;
use herald_core::TenantId;
use herald_server::store::MemoryConfigStorage;
use herald_server::OrchestratorError;

use crate::helpers::{orchestrator_with, OPS_CONFIG};

#[tokio::test]
async fn startup_brings_every_tenant_up_with_the_default_config() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1, 2, 3],
    );
    orchestrator.startup().await.unwrap();

    assert_eq!(
        orchestrator.active_tenants(),
        vec![TenantId(1), TenantId(2), TenantId(3)]
    );
    for tenant in [1, 2, 3] {
        let status = orchestrator.status(TenantId(tenant)).unwrap();
        assert!(status.config_hash.is_some());
    }
}

#[tokio::test]
async fn reconcile_tracks_a_changing_tenant_set() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1, 2],
    );
    orchestrator.startup().await.unwrap();
    let departed = orchestrator.engine_for(TenantId(2)).unwrap();

    // tenant 2 leaves, tenant 3 arrives
    orchestrator
        .reconcile(&[TenantId(1), TenantId(3)])
        .await;

    assert_eq!(
        orchestrator.active_tenants(),
        vec![TenantId(1), TenantId(3)]
    );
    assert!(!departed.engine.ready());
    assert!(matches!(
        orchestrator.engine_for(TenantId(2)),
        Err(OrchestratorError::NoEngineForTenant(_))
    ));
    // the new tenant is immediately usable
    assert!(orchestrator.engine_for(TenantId(3)).is_ok());
}

#[tokio::test]
async fn saved_configuration_reaches_the_engine_and_survives_reconcile() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[7],
    );
    orchestrator.startup().await.unwrap();

    let saved = orchestrator
        .save_config(TenantId(7), OPS_CONFIG, None)
        .await
        .unwrap();
    let status = orchestrator.status(TenantId(7)).unwrap();
    assert_eq!(status.config_hash.as_deref(), Some(saved.hash.as_str()));

    // a reconcile with the same tenants does not disturb the engine
    orchestrator.reconcile(&[TenantId(7)]).await;
    let status = orchestrator.status(TenantId(7)).unwrap();
    assert_eq!(status.config_hash.as_deref(), Some(saved.hash.as_str()));
}

#[tokio::test]
async fn shutdown_leaves_nothing_running() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1, 2],
    );
    orchestrator.startup().await.unwrap();
    let engine = orchestrator.engine_for(TenantId(1)).unwrap();

    orchestrator.shutdown(std::time::Duration::from_secs(5)).await;

    assert!(orchestrator.active_tenants().is_empty());
    assert!(!engine.engine.ready());
    assert!(matches!(
        orchestrator.engine_for(TenantId(1)),
        Err(OrchestratorError::NoEngineForTenant(_))
    ));
}
