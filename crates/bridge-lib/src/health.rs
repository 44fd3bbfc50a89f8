//! Health tracking for the scheduling bridge
//!
//! Each component reports the outcome of its latest attempt against an
//! external system. One failure degrades it; a run of failures at or above
//! the threshold makes it unhealthy, which fails `/healthz` and `/readyz`.
//! A single success restores it.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Consecutive failures after which a component counts as unhealthy
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Component names for health tracking
pub mod components {
    /// Watch connection to the cluster API
    pub const WATCH: &str = "watch";
    /// Periodic sweep
    pub const SWEEP: &str = "sweep";
    /// Cluster API requests made by the sweep
    pub const ORCHESTRATOR: &str = "orchestrator";
    /// qsub/qstat calls
    pub const BATCH_SCHEDULER: &str = "batch_scheduler";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Healthy,
    /// Recent failures, still retrying
    Degraded,
    /// Failing persistently
    Unhealthy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    /// Last failure message while not healthy
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub consecutive_failures: u32,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            status: ComponentStatus::Healthy,
            message: None,
            consecutive_failures: 0,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    fn failed(previous_failures: u32, threshold: u32, message: String) -> Self {
        let consecutive_failures = previous_failures.saturating_add(1);
        let status = if consecutive_failures >= threshold {
            ComponentStatus::Unhealthy
        } else {
            ComponentStatus::Degraded
        };
        Self {
            status,
            message: Some(message),
            consecutive_failures,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }
}

/// Overall health, worst component wins
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    fn from_components(components: HashMap<String, ComponentHealth>) -> Self {
        let status = components
            .values()
            .map(|c| c.status)
            .max_by_key(|status| match status {
                ComponentStatus::Healthy => 0,
                ComponentStatus::Degraded => 1,
                ComponentStatus::Unhealthy => 2,
            })
            .unwrap_or(ComponentStatus::Healthy);
        Self { status, components }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Shared registry of component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
    failure_threshold: u32,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::with_failure_threshold(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn with_failure_threshold(failure_threshold: u32) -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
            failure_threshold: failure_threshold.max(1),
        }
    }

    /// Register a component as healthy, keeping any state it already reported
    pub async fn register(&self, name: &str) {
        self.components
            .write()
            .await
            .entry(name.to_string())
            .or_insert_with(ComponentHealth::healthy);
    }

    /// The latest attempt succeeded
    pub async fn record_success(&self, name: &str) {
        self.components
            .write()
            .await
            .insert(name.to_string(), ComponentHealth::healthy());
    }

    /// The latest attempt failed
    pub async fn record_failure(&self, name: &str, message: impl Into<String>) {
        let mut components = self.components.write().await;
        let previous = components
            .get(name)
            .map(|c| c.consecutive_failures)
            .unwrap_or(0);
        components.insert(
            name.to_string(),
            ComponentHealth::failed(previous, self.failure_threshold, message.into()),
        );
    }

    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        HealthResponse::from_components(self.components.read().await.clone())
    }

    /// Ready once started, as long as no component is failing persistently
    pub async fn readiness(&self) -> ReadinessResponse {
        if !*self.ready.read().await {
            return ReadinessResponse {
                ready: false,
                reason: Some("Bridge not yet initialized".to_string()),
            };
        }

        let components = self.components.read().await;
        let mut failing: Vec<&str> = components
            .iter()
            .filter(|(_, health)| health.status == ComponentStatus::Unhealthy)
            .map(|(name, _)| name.as_str())
            .collect();
        if failing.is_empty() {
            return ReadinessResponse {
                ready: true,
                reason: None,
            };
        }

        failing.sort_unstable();
        ReadinessResponse {
            ready: false,
            reason: Some(format!("Failing persistently: {}", failing.join(", "))),
        }
    }
}
