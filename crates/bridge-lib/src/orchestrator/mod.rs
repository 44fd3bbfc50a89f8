//! Cluster API client
//!
//! This module provides:
//! - The `Orchestrator` trait covering the five cluster API operations the
//!   bridge needs (list, watch, patch, bind, event)
//! - An HTTP implementation over reqwest with optional mutual TLS
//! - A newline-delimited JSON decoder for the watch stream

mod client;
mod watch;

pub use client::{HttpOrchestrator, OrchestratorConfig};
pub use watch::{WatchDecoder, WatchStream};

use crate::models::{Binding, Event, JobId, Pod};
use async_trait::async_trait;
use thiserror::Error;

/// Errors from cluster API operations
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{operation}: unexpected HTTP status {status}: {body}")]
    Status {
        operation: &'static str,
        status: u16,
        body: String,
    },

    #[error("failed to decode {what}: {message}")]
    Decode { what: &'static str, message: String },

    #[error("invalid endpoint: {0}")]
    Endpoint(String),
}

impl OrchestratorError {
    pub(crate) fn decode(what: &'static str, err: impl std::fmt::Display) -> Self {
        Self::Decode {
            what,
            message: err.to_string(),
        }
    }
}

/// Trait for cluster API implementations
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// List pods that have no node assigned
    async fn list_unscheduled_pods(&self) -> Result<Vec<Pod>, OrchestratorError>;

    /// Open a watch of pods that have no node assigned
    ///
    /// The stream yields `Err` once and ends when the connection breaks or an
    /// event fails to decode; callers reconnect.
    async fn watch_unscheduled_pods(&self) -> Result<WatchStream, OrchestratorError>;

    /// Record the job id in the pod annotations with a strategic-merge patch
    async fn annotate_job_id(&self, pod: &Pod, job_id: &JobId) -> Result<(), OrchestratorError>;

    /// Post a binding; anything other than 201 Created is an error
    async fn bind(&self, pod: &Pod, binding: &Binding) -> Result<(), OrchestratorError>;

    /// Post an event; anything other than 201 Created is an error
    async fn post_event(&self, event: &Event) -> Result<(), OrchestratorError>;
}
