//! herald-core: shared types and the dispatch-engine contract.
//!
//! This crate defines the narrow seam between the orchestration layer
//! and a tenant's alert-dispatch engine:
//!
//! - **Tenant identity**: [`TenantId`], the isolation boundary. Exactly
//!   one engine exists per tenant at any instant.
//! - **Routing configuration**: the parsed model, structural
//!   validation, and the content hash used for optimistic-concurrency
//!   writes.
//! - **Engine contract**: [`DispatchEngine`], the capability set the
//!   orchestrator needs (`ready`, `apply_config`, `merge_state`,
//!   `status`, `test_integration`). The grouping/silencing state
//!   machine behind it is deliberately out of scope.
//! - **Delivery seam**: [`Integration`] and [`IntegrationFactory`],
//!   implemented by the server crate (webhook, log).
//! - **Reference engine**: [`LocalEngine`], an in-process
//!   implementation of the contract used by the binary and by tests.

mod engine;
mod error;
mod integration;
mod local;
mod routing;
mod tenant;

pub use engine::{
    DispatchEngine, EngineStatus, IntegrationTestResult, StateBlob, TestAlert, TestStatus,
};
pub use error::EngineError;
pub use integration::{Integration, IntegrationError, IntegrationFactory, NotifyError};
pub use local::LocalEngine;
pub use routing::{
    content_hash, IntegrationConfig, Receiver, Route, RoutingConfig, ValidationError,
};
pub use tenant::TenantId;
