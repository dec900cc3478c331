//! An in-process dispatch engine implementing the contract.
//!
//! `LocalEngine` is the engine variant used when alerts are dispatched
//! from inside this process: it tracks the applied configuration,
//! accumulates replicated state blobs per key, and runs integration
//! tests through an injected [`IntegrationFactory`]. The actual
//! grouping/silencing pipeline is not part of this layer.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use tracing::debug;

use crate::engine::{
    unix_now, DispatchEngine, EngineStatus, IntegrationTestResult, StateBlob, TestAlert,
};
use crate::error::EngineError;
use crate::integration::{IntegrationFactory, NotifyError};
use crate::routing::{content_hash, IntegrationConfig, RoutingConfig};

/// Cap on merged entries retained per state key. Merges are a
/// correctness backstop for the out-of-band full resync, not an
/// unbounded log — beyond this the oldest entries are discarded.
const MAX_STATE_ENTRIES: usize = 1024;

#[derive(Debug, Clone)]
struct AppliedConfig {
    hash: String,
    applied_at: i64,
    receiver_count: usize,
}

/// In-process reference implementation of [`DispatchEngine`].
pub struct LocalEngine {
    factory: Arc<dyn IntegrationFactory>,
    applied: RwLock<Option<AppliedConfig>>,
    /// Merged state blobs per key, deduplicated by payload.
    states: DashMap<String, Vec<bytes::Bytes>>,
    stopped: AtomicBool,
}

impl LocalEngine {
    pub fn new(factory: Arc<dyn IntegrationFactory>) -> Self {
        Self {
            factory,
            applied: RwLock::new(None),
            states: DashMap::new(),
            stopped: AtomicBool::new(false),
        }
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("ready", &self.ready())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl DispatchEngine for LocalEngine {
    fn ready(&self) -> bool {
        !self.stopped.load(Ordering::Acquire)
            && self.applied.read().is_ok_and(|a| a.is_some())
    }

    async fn apply_config(&self, config: &RoutingConfig, raw: &[u8]) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }
        config.validate()?;
        let applied = AppliedConfig {
            hash: content_hash(raw),
            applied_at: unix_now(),
            receiver_count: config.receivers.len(),
        };
        debug!(
            hash = %applied.hash,
            receivers = applied.receiver_count,
            "applied routing configuration"
        );
        if let Ok(mut slot) = self.applied.write() {
            *slot = Some(applied);
        }
        Ok(())
    }

    fn merge_state(&self, blob: StateBlob) -> Result<(), EngineError> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(EngineError::Stopped);
        }
        let mut entries = self.states.entry(blob.key).or_default();
        // duplicate deliveries are expected; merging is idempotent
        if entries.iter().any(|e| *e == blob.data) {
            return Ok(());
        }
        entries.push(blob.data);
        if entries.len() > MAX_STATE_ENTRIES {
            entries.remove(0);
        }
        Ok(())
    }

    fn status(&self) -> EngineStatus {
        let applied = self.applied.read().ok().and_then(|a| a.clone());
        EngineStatus {
            config_hash: applied.as_ref().map(|a| a.hash.clone()),
            config_applied_at: applied.as_ref().map(|a| a.applied_at),
            state_sizes: self
                .states
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().len()))
                .collect(),
        }
    }

    async fn test_integration(
        &self,
        _receiver: &str,
        integration: &IntegrationConfig,
        alert: &TestAlert,
    ) -> IntegrationTestResult {
        if self.stopped.load(Ordering::Acquire) {
            return IntegrationTestResult::failed("engine is stopped");
        }
        let built = match self.factory.build(integration) {
            Ok(built) => built,
            Err(e) => return IntegrationTestResult::failed(e.to_string()),
        };
        match built.notify(alert).await {
            Ok(()) => IntegrationTestResult::ok(),
            Err(NotifyError::Timeout) => IntegrationTestResult::timeout("delivery timed out"),
            Err(NotifyError::Delivery(reason)) => IntegrationTestResult::failed(reason),
        }
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }
}
