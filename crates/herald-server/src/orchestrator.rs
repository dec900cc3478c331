//! Per-tenant engine lifecycle.
//!
//! The orchestrator owns one dispatch engine per active tenant and
//! reconciles the set periodically against a tenant source: engines are
//! created for new tenants, re-configured when their stored
//! configuration changes, and stopped when a tenant disappears. Each
//! engine is wired into the cluster transport with its own replication
//! keys so peers converge on silences and notification state.
//!
//! The registry lock is a plain `std::sync::RwLock` held only for map
//! lookups and insertions, never across an await. Engine construction,
//! configuration and teardown all happen outside it, so a slow engine
//! cannot stall lookups for other tenants.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::Bytes;
use metrics::{counter, gauge};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use herald_cluster::{ClusterError, ClusterTransport, ReplicatedChannel, StateHandler};
use herald_core::{
    content_hash, DispatchEngine, EngineStatus, IntegrationFactory, LocalEngine, RoutingConfig,
    StateBlob, TenantId,
};

use crate::configstore::{ConfigStore, ConfigStoreError, StoredConfig};
use crate::receivers::{
    ReceiverTestError, ReceiverTestResult, ReceiverTestSupervisor, TestReceiver,
};

/// State kinds replicated per tenant.
const STATE_KINDS: [&str; 2] = ["silences", "notifications"];

pub const DEFAULT_RECONCILE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_SETTLE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Routing configuration applied to tenants that have never saved one.
pub const DEFAULT_ROUTING_CONFIG: &str = r#"{
    "receivers": [{"name": "default", "integrations": [{"kind": "log"}]}],
    "route": {"receiver": "default"}
}"#;

/// Errors surfaced by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The tenant is not in the active set; no engine exists for it.
    #[error("no engine for tenant {0}")]
    NoEngineForTenant(TenantId),

    /// The engine exists but has not yet applied a configuration.
    /// Transient; retry after the next reconcile.
    #[error("engine for tenant {0} is not ready")]
    EngineNotReady(TenantId),

    /// The tenant source could not be queried.
    #[error("tenant source error: {0}")]
    TenantSource(String),

    #[error(transparent)]
    Config(#[from] ConfigStoreError),

    #[error(transparent)]
    ReceiverTest(#[from] ReceiverTestError),
}

/// Supplies the set of tenants that should have engines.
#[async_trait::async_trait]
pub trait TenantSource: Send + Sync {
    async fn tenant_ids(&self) -> Result<Vec<TenantId>, OrchestratorError>;
}

/// Fixed tenant set, from static configuration.
pub struct StaticTenantSource {
    tenants: Vec<TenantId>,
}

impl StaticTenantSource {
    pub fn new(tenants: Vec<TenantId>) -> Self {
        Self { tenants }
    }
}

#[async_trait::async_trait]
impl TenantSource for StaticTenantSource {
    async fn tenant_ids(&self) -> Result<Vec<TenantId>, OrchestratorError> {
        Ok(self.tenants.clone())
    }
}

/// Builds a dispatch engine for a tenant.
pub trait EngineFactory: Send + Sync {
    fn create(&self, tenant: TenantId) -> Arc<dyn DispatchEngine>;
}

/// Builds in-process [`LocalEngine`]s sharing one integration factory.
pub struct LocalEngineFactory {
    integrations: Arc<dyn IntegrationFactory>,
}

impl LocalEngineFactory {
    pub fn new(integrations: Arc<dyn IntegrationFactory>) -> Self {
        Self { integrations }
    }
}

impl EngineFactory for LocalEngineFactory {
    fn create(&self, _tenant: TenantId) -> Arc<dyn DispatchEngine> {
        Arc::new(LocalEngine::new(Arc::clone(&self.integrations)))
    }
}

/// A tenant's engine plus its outgoing replication channels.
pub struct TenantEngine {
    pub tenant: TenantId,
    pub engine: Arc<dyn DispatchEngine>,
    channels: Vec<(&'static str, ReplicatedChannel)>,
}

impl TenantEngine {
    /// Broadcasts a state payload of the given kind ("silences" or
    /// "notifications") to cluster peers. Returns false if the payload
    /// was dropped.
    pub fn broadcast(&self, kind: &str, data: Bytes) -> bool {
        match self.channels.iter().find(|(k, _)| *k == kind) {
            Some((_, channel)) => channel.broadcast(data),
            None => {
                warn!(tenant = %self.tenant, kind, "broadcast for unknown state kind");
                false
            }
        }
    }
}

/// Bridges incoming cluster broadcasts into an engine's state merge.
struct EngineStateHandler {
    key: String,
    engine: Arc<dyn DispatchEngine>,
}

impl StateHandler for EngineStateHandler {
    fn merge(&self, data: Bytes) -> Result<(), ClusterError> {
        self.engine
            .merge_state(StateBlob {
                key: self.key.clone(),
                data,
            })
            .map_err(|e| ClusterError::Merge {
                key: self.key.clone(),
                reason: e.to_string(),
            })
    }
}

/// Tunables for the orchestrator.
pub struct OrchestratorConfig {
    /// How often the active tenant set is re-read and reconciled.
    pub reconcile_interval: Duration,
    /// How long startup waits for cluster quorum before proceeding
    /// degraded.
    pub settle_timeout: Duration,
    /// Raw routing configuration for tenants with nothing stored.
    pub default_config: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            reconcile_interval: DEFAULT_RECONCILE_INTERVAL,
            settle_timeout: DEFAULT_SETTLE_TIMEOUT,
            default_config: DEFAULT_ROUTING_CONFIG.to_string(),
        }
    }
}

/// Owns all per-tenant engines and keeps them aligned with the tenant
/// source and configuration store.
pub struct Orchestrator {
    registry: RwLock<HashMap<TenantId, Arc<TenantEngine>>>,
    transport: Arc<dyn ClusterTransport>,
    store: Arc<ConfigStore>,
    factory: Arc<dyn EngineFactory>,
    source: Arc<dyn TenantSource>,
    supervisor: ReceiverTestSupervisor,
    config: OrchestratorConfig,
    shutdown: watch::Sender<bool>,
}

impl Orchestrator {
    pub fn new(
        transport: Arc<dyn ClusterTransport>,
        store: Arc<ConfigStore>,
        factory: Arc<dyn EngineFactory>,
        source: Arc<dyn TenantSource>,
        supervisor: ReceiverTestSupervisor,
        config: OrchestratorConfig,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            registry: RwLock::new(HashMap::new()),
            transport,
            store,
            factory,
            source,
            supervisor,
            config,
            shutdown,
        }
    }

    /// Waits for cluster quorum (bounded by the settle timeout) and
    /// runs the first reconcile. If quorum does not settle in time the
    /// node starts anyway; replication catches up as peers appear.
    pub async fn startup(&self) -> Result<(), OrchestratorError> {
        if tokio::time::timeout(self.config.settle_timeout, self.transport.wait_ready())
            .await
            .is_err()
        {
            warn!(
                timeout_secs = self.config.settle_timeout.as_secs(),
                "cluster did not settle before timeout, starting degraded"
            );
        }
        self.sync_tenants().await
    }

    /// Reads the tenant source and reconciles engines against it.
    pub async fn sync_tenants(&self) -> Result<(), OrchestratorError> {
        let tenants = self.source.tenant_ids().await?;
        self.reconcile(&tenants).await;
        Ok(())
    }

    /// Aligns the engine registry with the desired tenant set. Engines
    /// for new tenants are created and configured; engines for departed
    /// tenants are stopped. Engines whose stored configuration no
    /// longer matches what they applied (a save on another node, or an
    /// earlier apply failure) are re-configured.
    pub async fn reconcile(&self, tenants: &[TenantId]) {
        let desired: HashSet<TenantId> = tenants.iter().copied().collect();

        let (to_add, to_remove, to_refresh) = {
            let registry = self.registry.read().unwrap();
            let to_add: Vec<TenantId> = desired
                .iter()
                .filter(|t| !registry.contains_key(t))
                .copied()
                .collect();
            let to_remove: Vec<TenantId> = registry
                .keys()
                .filter(|t| !desired.contains(t))
                .copied()
                .collect();
            let to_refresh: Vec<Arc<TenantEngine>> = registry
                .values()
                .filter(|e| desired.contains(&e.tenant))
                .cloned()
                .collect();
            (to_add, to_remove, to_refresh)
        };

        for tenant in to_add {
            let entry = self.create_engine(tenant);
            // the registration check and the shutdown check share the
            // write lock, so a concurrent shutdown can never drain the
            // registry between them
            let inserted = {
                let mut registry = self.registry.write().unwrap();
                if *self.shutdown.borrow() || registry.contains_key(&tenant) {
                    false
                } else {
                    registry.insert(tenant, Arc::clone(&entry));
                    true
                }
            };
            if !inserted {
                entry.engine.stop().await;
                continue;
            }
            self.configure_engine(&entry).await;
            counter!("herald_engines_created_total").increment(1);
            info!(%tenant, "engine started");
        }

        for entry in to_refresh {
            let tenant = entry.tenant;
            let stored_hash = match self.store.get_current(tenant).await {
                Ok(current) => current.hash,
                Err(ConfigStoreError::NotFound(_)) => {
                    content_hash(self.config.default_config.as_bytes())
                }
                Err(e) => {
                    warn!(%tenant, error = %e, "failed to check stored configuration");
                    continue;
                }
            };
            if entry.engine.status().config_hash.as_deref() != Some(stored_hash.as_str()) {
                debug!(%tenant, "stored configuration changed, re-applying");
                self.configure_engine(&entry).await;
            }
        }

        let removed: Vec<Arc<TenantEngine>> = {
            let mut registry = self.registry.write().unwrap();
            to_remove
                .iter()
                .filter_map(|t| registry.remove(t))
                .collect()
        };
        for entry in removed {
            entry.engine.stop().await;
            counter!("herald_engines_stopped_total").increment(1);
            info!(tenant = %entry.tenant, "engine stopped");
        }

        let active = self.registry.read().unwrap().len();
        gauge!("herald_active_engines").set(active as f64);
        debug!(active, "reconcile complete");
    }

    fn create_engine(&self, tenant: TenantId) -> Arc<TenantEngine> {
        let engine = self.factory.create(tenant);
        let channels = STATE_KINDS
            .iter()
            .map(|kind| {
                let key = format!("{}/{kind}", tenant.0);
                let handler = Arc::new(EngineStateHandler {
                    key: key.clone(),
                    engine: Arc::clone(&engine),
                });
                (*kind, self.transport.add_state(&key, handler))
            })
            .collect();
        Arc::new(TenantEngine {
            tenant,
            engine,
            channels,
        })
    }

    /// Applies the tenant's stored configuration, falling back to the
    /// service default for tenants that have never saved one. A
    /// failure leaves the engine registered but not ready; the next
    /// reconcile or save retries.
    async fn configure_engine(&self, entry: &TenantEngine) {
        let tenant = entry.tenant;
        let (config, raw) = match self.store.get_current(tenant).await {
            Ok(current) => (current.config, current.raw),
            Err(ConfigStoreError::NotFound(_)) => {
                debug!(%tenant, "no stored configuration, applying default");
                let raw = self.config.default_config.clone();
                match RoutingConfig::parse(raw.as_bytes()) {
                    Ok(config) => (config, raw),
                    Err(e) => {
                        error!(error = %e, "default routing configuration is invalid");
                        return;
                    }
                }
            }
            Err(e) => {
                error!(%tenant, error = %e, "failed to load configuration");
                return;
            }
        };

        if let Err(e) = entry.engine.apply_config(&config, raw.as_bytes()).await {
            error!(%tenant, error = %e, "failed to apply configuration");
        }
    }

    /// Saves a tenant's configuration through the store and, when the
    /// tenant has a running engine, applies it immediately.
    pub async fn save_config(
        &self,
        tenant: TenantId,
        raw: &str,
        expected_hash: Option<&str>,
    ) -> Result<StoredConfig, OrchestratorError> {
        let record = self.store.save(tenant, raw, expected_hash).await?;
        if let Some(entry) = self.lookup(tenant) {
            let config = RoutingConfig::parse(raw.as_bytes()).map_err(ConfigStoreError::Invalid)?;
            if let Err(e) = entry.engine.apply_config(&config, raw.as_bytes()).await {
                error!(%tenant, error = %e, "saved configuration failed to apply");
            }
        }
        Ok(record)
    }

    fn lookup(&self, tenant: TenantId) -> Option<Arc<TenantEngine>> {
        self.registry.read().unwrap().get(&tenant).cloned()
    }

    /// Returns the tenant's engine, or an error if the tenant is not
    /// active or its engine has not applied a configuration yet.
    pub fn engine_for(&self, tenant: TenantId) -> Result<Arc<TenantEngine>, OrchestratorError> {
        let entry = self
            .lookup(tenant)
            .ok_or(OrchestratorError::NoEngineForTenant(tenant))?;
        if !entry.engine.ready() {
            return Err(OrchestratorError::EngineNotReady(tenant));
        }
        Ok(entry)
    }

    /// Status snapshot for one tenant's engine.
    pub fn status(&self, tenant: TenantId) -> Result<EngineStatus, OrchestratorError> {
        Ok(self.engine_for(tenant)?.engine.status())
    }

    /// Tenants with an active engine, sorted.
    pub fn active_tenants(&self) -> Vec<TenantId> {
        let mut tenants: Vec<TenantId> = self.registry.read().unwrap().keys().copied().collect();
        tenants.sort();
        tenants
    }

    /// Tests receivers against a tenant's engine through the bounded
    /// worker pool.
    pub async fn test_receivers(
        &self,
        tenant: TenantId,
        receivers: &[TestReceiver],
    ) -> Result<Vec<ReceiverTestResult>, OrchestratorError> {
        let entry = self.engine_for(tenant)?;
        let results = self
            .supervisor
            .test_receivers(Arc::clone(&entry.engine), receivers)
            .await?;
        Ok(results)
    }

    /// Spawns the periodic reconcile loop. Runs until [`shutdown`] is
    /// called.
    ///
    /// [`shutdown`]: Orchestrator::shutdown
    pub fn spawn_reconcile_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let orchestrator = Arc::clone(self);
        let mut stop = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(orchestrator.config.reconcile_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the first tick fires immediately; startup already reconciled
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = orchestrator.sync_tenants().await {
                            warn!(error = %e, "periodic reconcile failed");
                        }
                    }
                    _ = stop.changed() => {
                        debug!("reconcile loop stopping");
                        return;
                    }
                }
            }
        })
    }

    /// Stops the reconcile loop, all engines, and the transport. A
    /// slow engine cannot hold the process past `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        let _ = self.shutdown.send(true);
        let engines: Vec<Arc<TenantEngine>> = {
            let mut registry = self.registry.write().unwrap();
            registry.drain().map(|(_, entry)| entry).collect()
        };
        let stop_all = async {
            for entry in &engines {
                entry.engine.stop().await;
            }
            self.transport.shutdown().await;
        };
        if tokio::time::timeout(timeout, stop_all).await.is_err() {
            warn!(timeout_secs = timeout.as_secs(), "shutdown timed out");
        }
        info!(stopped = engines.len(), "all engines stopped");
    }
}
