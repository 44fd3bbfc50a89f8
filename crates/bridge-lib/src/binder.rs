//! Commits a placement decision to the cluster API

use crate::models::{Binding, Pod};
use crate::notifier::EventNotifier;
use crate::orchestrator::{Orchestrator, OrchestratorError};
use std::net::IpAddr;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BindError {
    #[error("failed to resolve host {host}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("failed to bind pod {pod} to {node}: {source}")]
    Bind {
        pod: String,
        node: String,
        #[source]
        source: OrchestratorError,
    },
}

pub struct Binder {
    orchestrator: Arc<dyn Orchestrator>,
    notifier: EventNotifier,
    /// Resolve the batch host name to an address before binding
    hostname_to_ip: bool,
}

impl Binder {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        notifier: EventNotifier,
        hostname_to_ip: bool,
    ) -> Self {
        Self {
            orchestrator,
            notifier,
            hostname_to_ip,
        }
    }

    /// Bind the pod to the host chosen by the batch scheduler
    ///
    /// Returns the node name used in the binding. A failure to publish the
    /// success event is logged and does not fail the bind.
    pub async fn bind(&self, pod: &Pod, host: &str) -> Result<String, BindError> {
        let node = if self.hostname_to_ip {
            let ip = resolve_host(host).await?;
            debug!(host = %host, ip = %ip, "Resolved batch host");
            ip.to_string()
        } else {
            host.to_string()
        };

        info!(pod = %pod.name(), node = %node, "Binding pod");
        let binding = Binding::new(pod, node.clone());
        self.orchestrator
            .bind(pod, &binding)
            .await
            .map_err(|source| BindError::Bind {
                pod: pod.name().to_string(),
                node: node.clone(),
                source,
            })?;

        if let Err(e) = self.notifier.scheduled(pod, host).await {
            warn!(pod = %pod.name(), error = %e, "Pod bound but Scheduled event could not be posted");
        }

        Ok(node)
    }
}

/// Resolve a host name, preferring IPv4 addresses
pub async fn resolve_host(host: &str) -> Result<IpAddr, BindError> {
    let addrs: Vec<IpAddr> = tokio::net::lookup_host((host, 0))
        .await
        .map_err(|e| BindError::Resolve {
            host: host.to_string(),
            reason: e.to_string(),
        })?
        .map(|addr| addr.ip())
        .collect();

    addrs
        .iter()
        .find(|ip| ip.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| BindError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        })
}
