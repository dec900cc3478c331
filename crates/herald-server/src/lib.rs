//! herald-server: the multi-tenant notification-routing service.
//!
//! Wires the pieces together: the [`Orchestrator`] owns one dispatch
//! engine per tenant and keeps the registry reconciled against the
//! tenant source; the [`ConfigStore`] persists routing configurations
//! with optimistic-concurrency writes; the [`ReceiverTestSupervisor`]
//! fans synthetic alerts out to delivery integrations. The cluster
//! transport replicating engine state between instances comes from
//! `herald-cluster` and is selected once at startup.

pub mod config;
pub mod configstore;
pub mod integrations;
pub mod metrics;
pub mod orchestrator;
pub mod receivers;
pub mod store;

pub use configstore::{ConfigStorage, ConfigStore, ConfigStoreError, CurrentConfig, StoredConfig};
pub use orchestrator::{
    EngineFactory, LocalEngineFactory, Orchestrator, OrchestratorConfig, OrchestratorError,
    StaticTenantSource, TenantEngine, TenantSource,
};
pub use receivers::{
    IntegrationOutcome, ReceiverTestError, ReceiverTestResult, ReceiverTestSupervisor,
    TestReceiver,
};
