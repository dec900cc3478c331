//! Receiver testing end to end, with real webhook deliveries against
//! local HTTP endpoints.

use std::sync::Arc;

use serde_json::json;

use herald_cluster::SingleNodeTransport;
use herald_core::{IntegrationConfig, TenantId, TestStatus};
use herald_server::store::MemoryConfigStorage;
use herald_server::{OrchestratorError, ReceiverTestError, TestReceiver};

use crate::helpers::{orchestrator_with, spawn_http_endpoint};

fn webhook(url: String) -> IntegrationConfig {
    IntegrationConfig {
        kind: "webhook".to_string(),
        settings: json!({ "url": url }),
    }
}

#[tokio::test]
async fn webhook_outcomes_reflect_endpoint_behavior() {
    let ok_addr = spawn_http_endpoint("HTTP/1.1 200 OK").await;
    let err_addr = spawn_http_endpoint("HTTP/1.1 500 Internal Server Error").await;

    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1],
    );
    orchestrator.startup().await.unwrap();

    let receivers = [TestReceiver {
        name: "ops".to_string(),
        integrations: vec![
            webhook(format!("http://{ok_addr}/hook")),
            webhook(format!("http://{err_addr}/hook")),
        ],
    }];
    let results = orchestrator
        .test_receivers(TenantId(1), &receivers)
        .await
        .unwrap();

    assert_eq!(results.len(), 1);
    assert_eq!(results[0].outcomes.len(), 2);
    assert_eq!(results[0].outcomes[0].status, TestStatus::Ok);
    assert_eq!(results[0].outcomes[1].status, TestStatus::Failed);
    assert!(results[0].outcomes[1]
        .error
        .as_deref()
        .unwrap()
        .contains("500"));
}

#[tokio::test]
async fn misconfigured_integrations_fail_immediately() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1],
    );
    orchestrator.startup().await.unwrap();

    let receivers = [TestReceiver {
        name: "ops".to_string(),
        integrations: vec![
            // missing url
            IntegrationConfig {
                kind: "webhook".to_string(),
                settings: json!({}),
            },
            IntegrationConfig {
                kind: "log".to_string(),
                settings: json!({}),
            },
        ],
    }];
    let results = orchestrator
        .test_receivers(TenantId(1), &receivers)
        .await
        .unwrap();

    assert_eq!(results[0].outcomes[0].status, TestStatus::Failed);
    assert!(results[0].outcomes[0]
        .error
        .as_deref()
        .unwrap()
        .contains("url"));
    assert_eq!(results[0].outcomes[1].status, TestStatus::Ok);
}

#[tokio::test]
async fn empty_receiver_list_is_rejected() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1],
    );
    orchestrator.startup().await.unwrap();

    let err = orchestrator
        .test_receivers(TenantId(1), &[])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::ReceiverTest(ReceiverTestError::NoReceivers)
    ));
}

#[tokio::test]
async fn testing_an_inactive_tenant_is_an_error() {
    let (orchestrator, _) = orchestrator_with(
        Arc::new(SingleNodeTransport),
        Arc::new(MemoryConfigStorage::new()),
        &[1],
    );
    orchestrator.startup().await.unwrap();

    let receivers = [TestReceiver {
        name: "ops".to_string(),
        integrations: vec![],
    }];
    let err = orchestrator
        .test_receivers(TenantId(42), &receivers)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        OrchestratorError::NoEngineForTenant(TenantId(42))
    ));
}
