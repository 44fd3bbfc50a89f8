//! Batch scheduler client
//!
//! The batch scheduler owns job queueing and node allocation. The bridge only
//! submits one job per pod and reads back its state and assigned host.

mod pbs;
mod status;

pub use pbs::{PbsClient, PbsConfig};
pub use status::{JobState, JobStatus, Placement, SUBSTATE_RUNNING};

use crate::models::JobId;
use crate::resources::ResourceRequest;
use async_trait::async_trait;
use thiserror::Error;

/// Errors from batch scheduler operations
#[derive(Debug, Error)]
pub enum BatchError {
    #[error("failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: std::process::ExitStatus,
        stderr: String,
    },

    #[error("{0} returned no job id")]
    EmptyJobId(String),

    #[error("job status is missing field {0}")]
    MissingField(&'static str),

    #[error("job status field {field} has invalid value {value:?}")]
    InvalidField { field: &'static str, value: String },
}

/// A job submission on behalf of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRequest {
    pub pod_name: String,
    pub resources: ResourceRequest,
}

/// Trait for batch scheduler implementations
#[async_trait]
pub trait BatchScheduler: Send + Sync {
    /// Submit a job requesting exactly the given resources
    async fn submit(&self, request: &JobRequest) -> Result<JobId, BatchError>;

    /// Query the state and assigned host of a job
    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BatchError>;
}
