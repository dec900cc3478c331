//! Test helpers for wiring an in-process herald stack.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use herald_cluster::ClusterTransport;
use herald_core::{IntegrationFactory, TenantId};
use herald_server::integrations::DefaultIntegrationFactory;
use herald_server::orchestrator::{
    LocalEngineFactory, Orchestrator, OrchestratorConfig, StaticTenantSource,
};
use herald_server::receivers::ReceiverTestSupervisor;
use herald_server::{ConfigStorage, ConfigStore};

pub const OPS_CONFIG: &str =
    r#"{"receivers": [{"name": "ops", "integrations": [{"kind": "log"}]}], "route": {"receiver": "ops"}}"#;

/// Builds an orchestrator over the given transport and storage,
/// serving the given tenants.
pub fn orchestrator_with(
    transport: Arc<dyn ClusterTransport>,
    storage: Arc<dyn ConfigStorage>,
    tenants: &[i64],
) -> (Arc<Orchestrator>, Arc<ConfigStore>) {
    let integrations: Arc<dyn IntegrationFactory> = Arc::new(DefaultIntegrationFactory::new());
    let store = Arc::new(ConfigStore::new(storage));
    let orchestrator = Arc::new(Orchestrator::new(
        transport,
        Arc::clone(&store),
        Arc::new(LocalEngineFactory::new(Arc::clone(&integrations))),
        Arc::new(StaticTenantSource::new(
            tenants.iter().copied().map(TenantId).collect(),
        )),
        ReceiverTestSupervisor::new(integrations),
        OrchestratorConfig {
            settle_timeout: std::time::Duration::from_millis(200),
            ..OrchestratorConfig::default()
        },
    ));
    (orchestrator, store)
}

/// Spawns a bare HTTP listener that answers every request with the
/// given status line and returns its address.
pub async fn spawn_http_endpoint(status_line: &'static str) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 8192];
                let _ = stream.read(&mut buf).await;
                let response =
                    format!("{status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                let _ = stream.write_all(response.as_bytes()).await;
            });
        }
    });
    addr
}

/// Polls `check` until it returns true or the deadline passes.
pub async fn wait_until<F: Fn() -> bool>(check: F, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
