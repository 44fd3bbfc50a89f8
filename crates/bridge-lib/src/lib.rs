//! Library for bridging cluster pod scheduling onto a PBS batch scheduler
//!
//! This crate provides the core functionality for:
//! - Watching and listing unscheduled pods through the cluster API
//! - Translating pod resource requests into batch job submissions
//! - Polling job state and binding pods to the hosts the batch scheduler picked
//! - Health checks and observability

pub mod batch;
pub mod binder;
pub mod fit;
pub mod health;
pub mod models;
pub mod notifier;
pub mod observability;
pub mod orchestrator;
pub mod reconciler;
pub mod resources;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchScheduler, PbsClient, PbsConfig};
pub use binder::Binder;
pub use fit::{FitConfig, FitEngine};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use notifier::EventNotifier;
pub use observability::{BridgeMetrics, StructuredLogger};
pub use orchestrator::{HttpOrchestrator, Orchestrator, OrchestratorConfig};
pub use reconciler::{Reconciler, ReconcilerConfig};
