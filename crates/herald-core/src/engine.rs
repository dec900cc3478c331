//! The dispatch-engine contract consumed by the orchestration layer.
//!
//! The grouping/silencing state machine itself is an external
//! collaborator; this trait is the narrow capability set the
//! orchestrator needs from it. Implementations are selected once at
//! construction and dispatched through `Arc<dyn DispatchEngine>` —
//! never via run-time type inspection.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::routing::{IntegrationConfig, RoutingConfig};

/// One kind of replicated engine state, e.g. "silences" or
/// "notifications". The payload is opaque to the replication layer;
/// peers merge it into their own engine. Replication is
/// eventually-consistent and unordered, so merges must tolerate
/// duplicate and out-of-order application.
#[derive(Debug, Clone)]
pub struct StateBlob {
    pub key: String,
    pub data: Bytes,
}

/// Point-in-time status snapshot of an engine.
#[derive(Debug, Clone, Default)]
pub struct EngineStatus {
    /// Content hash of the currently applied configuration, if any.
    pub config_hash: Option<String>,
    /// Unix seconds when the current configuration was applied.
    pub config_applied_at: Option<i64>,
    /// Replicated state keys the engine currently holds, with the
    /// number of merged entries per key.
    pub state_sizes: BTreeMap<String, usize>,
}

/// Outcome classification for a single integration test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    Ok,
    Failed,
    /// The downstream was slow, as opposed to the configuration being
    /// broken. Kept distinct so operators can tell the two apart.
    Timeout,
}

/// Result of sending one synthetic alert through one integration.
#[derive(Debug, Clone)]
pub struct IntegrationTestResult {
    pub status: TestStatus,
    pub error: Option<String>,
}

impl IntegrationTestResult {
    pub fn ok() -> Self {
        Self {
            status: TestStatus::Ok,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Failed,
            error: Some(error.into()),
        }
    }

    pub fn timeout(error: impl Into<String>) -> Self {
        Self {
            status: TestStatus::Timeout,
            error: Some(error.into()),
        }
    }
}

/// A synthetic alert sent through an integration's real delivery path
/// during receiver testing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestAlert {
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    /// Unix seconds the alert notionally started firing.
    pub starts_at: i64,
}

impl TestAlert {
    /// Builds the synthetic alert used for receiver testing.
    pub fn synthetic(receiver: &str) -> Self {
        let mut labels = BTreeMap::new();
        labels.insert("alertname".to_string(), "TestAlert".to_string());
        labels.insert("receiver".to_string(), receiver.to_string());
        let mut annotations = BTreeMap::new();
        annotations.insert(
            "summary".to_string(),
            "test notification, please ignore".to_string(),
        );
        Self {
            labels,
            annotations,
            starts_at: unix_now(),
        }
    }
}

/// Current wall-clock time as unix seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Capability set the orchestrator needs from a tenant's dispatch
/// engine.
#[async_trait::async_trait]
pub trait DispatchEngine: Send + Sync {
    /// Whether the engine has completed its initial configuration
    /// apply and is able to dispatch.
    fn ready(&self) -> bool;

    /// Applies a parsed routing configuration. `raw` is the exact byte
    /// payload the configuration was parsed from; engines record its
    /// content hash in their status.
    async fn apply_config(&self, config: &RoutingConfig, raw: &[u8]) -> Result<(), EngineError>;

    /// Merges a replicated state blob received from a peer. Must be
    /// idempotent: duplicates and reordering are expected.
    fn merge_state(&self, blob: StateBlob) -> Result<(), EngineError>;

    /// Returns a point-in-time status snapshot.
    fn status(&self) -> EngineStatus;

    /// Sends one synthetic alert through the integration's real
    /// delivery path. Never returns an error: delivery problems are
    /// classified into the result's status.
    async fn test_integration(
        &self,
        receiver: &str,
        integration: &IntegrationConfig,
        alert: &TestAlert,
    ) -> IntegrationTestResult;

    /// Stops the engine. Called by the orchestrator after the engine
    /// has been removed from the registry.
    async fn stop(&self);
}
