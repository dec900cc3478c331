//! Prometheus metrics and health check HTTP server.
//!
//! When `metrics_port` is set, installs a prometheus recorder and
//! serves `/metrics` and `/health` from one address. Engines and the
//! cluster layer record counters and gauges through the `metrics`
//! crate's global recorder; this module only renders them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::orchestrator::Orchestrator;

/// Installs the prometheus recorder without starting an HTTP server.
///
/// Returns a handle that can render metrics on demand. The caller is
/// responsible for spawning both the upkeep task and the HTTP server.
pub fn install_recorder() -> Result<PrometheusHandle, Box<dyn std::error::Error>> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| format!("failed to install prometheus recorder: {e}"))?;
    Ok(handle)
}

/// Health-endpoint context: the orchestrator plus process metadata.
pub struct HealthContext {
    pub orchestrator: Arc<Orchestrator>,
    pub version: &'static str,
    pub start_time: Instant,
}

/// Spawns the HTTP server for `/metrics` and `/health` on the given
/// address, plus the prometheus upkeep task.
pub fn spawn_http_server(addr: SocketAddr, handle: PrometheusHandle, ctx: Arc<HealthContext>) {
    let upkeep_handle = handle.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(5));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            upkeep_handle.run_upkeep();
        }
    });

    tokio::spawn(async move {
        let listener = match TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!("failed to bind metrics/health server on {addr}: {e}");
                return;
            }
        };

        info!("metrics and health endpoint on http://{addr}");

        loop {
            let (stream, _) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("metrics listener accept error: {e}");
                    continue;
                }
            };

            let handle = handle.clone();
            let ctx = Arc::clone(&ctx);

            tokio::spawn(async move {
                let service = service_fn(move |req| {
                    let handle = handle.clone();
                    let ctx = Arc::clone(&ctx);
                    async move { handle_request(req, &handle, &ctx) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    // connection reset / client gone — not worth logging at warn
                    tracing::debug!("http connection error: {e}");
                }
            });
        }
    });
}

fn handle_request(
    req: Request<hyper::body::Incoming>,
    handle: &PrometheusHandle,
    ctx: &HealthContext,
) -> Result<Response<Full<Bytes>>, std::convert::Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let body = handle.render();
            Response::builder()
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static builder never fails")
        }
        "/health" => build_health_response(ctx),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from_static(b"not found")))
            .expect("static builder never fails"),
    };

    Ok(response)
}

/// Builds the /health JSON response.
///
/// The node is healthy when every active tenant's engine is ready.
/// A node with no tenants is healthy if it is running.
fn build_health_response(ctx: &HealthContext) -> Response<Full<Bytes>> {
    let tenants = ctx.orchestrator.active_tenants();
    let not_ready: Vec<i64> = tenants
        .iter()
        .filter(|t| ctx.orchestrator.engine_for(**t).is_err())
        .map(|t| t.0)
        .collect();

    let is_healthy = not_ready.is_empty();
    let status = if is_healthy { "healthy" } else { "unhealthy" };
    let code = if is_healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = serde_json::json!({
        "status": status,
        "version": ctx.version,
        "uptime_secs": ctx.start_time.elapsed().as_secs(),
        "tenants": {
            "active": tenants.len(),
            "not_ready": not_ready,
        },
    });

    Response::builder()
        .status(code)
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static builder never fails")
}
