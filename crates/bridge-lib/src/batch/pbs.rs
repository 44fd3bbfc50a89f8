//! PBS command-line client
//!
//! Submits with `qsub` and queries with `qstat -x -f`, which includes
//! finished jobs from the server history. Commands are executed directly,
//! never through a shell, so pod and job names are passed as plain
//! arguments.

use super::{BatchError, BatchScheduler, JobRequest, JobState, JobStatus};
use crate::models::JobId;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Output;
use tokio::process::Command;
use tracing::debug;

/// Configuration for the PBS client
#[derive(Debug, Clone)]
pub struct PbsConfig {
    /// Path to the `qsub` executable
    pub qsub_path: PathBuf,
    /// Path to the `qstat` executable
    pub qstat_path: PathBuf,
    /// Job script submitted for every pod
    pub job_script: PathBuf,
}

impl Default for PbsConfig {
    fn default() -> Self {
        Self {
            qsub_path: PathBuf::from("qsub"),
            qstat_path: PathBuf::from("qstat"),
            job_script: PathBuf::from("kubernetes_job.sh"),
        }
    }
}

/// Batch scheduler backed by the PBS command-line tools
pub struct PbsClient {
    config: PbsConfig,
}

impl PbsClient {
    pub fn new(config: PbsConfig) -> Self {
        Self { config }
    }

    /// Arguments passed to `qsub` for a request
    pub fn submit_args(&self, request: &JobRequest) -> Vec<String> {
        vec![
            "-l".to_string(),
            request.resources.select_spec(),
            "-N".to_string(),
            request.pod_name.clone(),
            "-v".to_string(),
            format!("PODNAME={}", request.pod_name),
            self.config.job_script.to_string_lossy().into_owned(),
        ]
    }

    async fn run(&self, program: &Path, args: &[String]) -> Result<String, BatchError> {
        let command = program.to_string_lossy().into_owned();
        debug!(command = %command, args = ?args, "Running batch command");

        let output = Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|source| BatchError::Spawn {
                command: command.clone(),
                source,
            })?;

        check_output(command, output)
    }
}

/// `qstat` refusals meaning the job is gone from the server
const FINISHED_MARKER: &str = "Job has finished";
const UNKNOWN_MARKER: &str = "Unknown Job Id";

/// Treat a refusal to report a job that no longer exists as a terminal status
///
/// Servers without job history answer for finished or purged jobs with an
/// error instead of an `F`/`X` listing.
fn vanished_job_status(err: &BatchError) -> Option<JobStatus> {
    let BatchError::CommandFailed { stderr, .. } = err else {
        return None;
    };
    let state = if stderr.contains(FINISHED_MARKER) {
        JobState::Finished
    } else if stderr.contains(UNKNOWN_MARKER) {
        JobState::Expired
    } else {
        return None;
    };
    Some(JobStatus {
        state,
        substate: None,
        exec_host: None,
        comment: Some(stderr.clone()),
    })
}

fn check_output(command: String, output: Output) -> Result<String, BatchError> {
    if !output.status.success() {
        return Err(BatchError::CommandFailed {
            command,
            status: output.status,
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl BatchScheduler for PbsClient {
    async fn submit(&self, request: &JobRequest) -> Result<JobId, BatchError> {
        let args = self.submit_args(request);
        let stdout = self.run(&self.config.qsub_path, &args).await?;

        let job_id = stdout.trim_end_matches(['\r', '\n']).trim();
        if job_id.is_empty() {
            return Err(BatchError::EmptyJobId(
                self.config.qsub_path.to_string_lossy().into_owned(),
            ));
        }
        Ok(JobId::new(job_id))
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BatchError> {
        let args = vec!["-x".to_string(), "-f".to_string(), job_id.to_string()];
        match self.run(&self.config.qstat_path, &args).await {
            Ok(stdout) => JobStatus::parse(&stdout),
            Err(err) => match vanished_job_status(&err) {
                Some(status) => {
                    debug!(job_id = %job_id, state = ?status.state, "Job no longer known to the batch server");
                    Ok(status)
                }
                None => Err(err),
            },
        }
    }
}
