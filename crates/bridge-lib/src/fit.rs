//! Per-pod placement decision
//!
//! The fit engine makes sure exactly one batch job exists for a pod, polls
//! it once, and translates its state into a placement outcome. The job id is
//! persisted in the pod annotation; an in-memory journal keyed by pod covers
//! stale pod snapshots and failed annotation patches so a retry never
//! submits a second job.

use crate::batch::{BatchError, BatchScheduler, JobRequest, Placement};
use crate::models::{JobId, Pod};
use crate::notifier::EventNotifier;
use crate::observability::{BridgeMetrics, StructuredLogger};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use crate::resources::{QuantityError, ResourceRequest};
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Errors that abort one fit attempt; the pod stays unscheduled
#[derive(Debug, Error)]
pub enum FitError {
    #[error("invalid resource request: {0}")]
    Resources(#[from] QuantityError),

    #[error("job submission failed: {0}")]
    Submit(#[source] BatchError),

    #[error("failed to record job {job_id} on pod: {source}")]
    Annotate {
        job_id: JobId,
        #[source]
        source: OrchestratorError,
    },

    #[error("failed to query job {job_id}: {source}")]
    Status {
        job_id: JobId,
        #[source]
        source: BatchError,
    },
}

/// Result of a successful fit attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FitOutcome {
    /// Job is running; bind the pod to this host
    Placed { job_id: JobId, host: String },
    /// Job not placed yet; try again later
    Pending { job_id: JobId },
    /// The batch scheduler will never place this job
    PlacementFailed { job_id: JobId },
}

/// Configuration for the fit engine
#[derive(Debug, Clone)]
pub struct FitConfig {
    /// Pause after a fresh submission before the first status poll
    pub submit_settle_delay: Duration,
}

impl Default for FitConfig {
    fn default() -> Self {
        Self {
            submit_settle_delay: Duration::from_secs(5),
        }
    }
}

/// How long a job whose annotation never landed is remembered once its pod
/// stops appearing in listings
const UNRECORDED_JOB_RETENTION: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
struct JournalEntry {
    job_id: JobId,
    annotated: bool,
    submitted_at: Instant,
}

pub struct FitEngine {
    orchestrator: Arc<dyn Orchestrator>,
    batch: Arc<dyn BatchScheduler>,
    notifier: EventNotifier,
    config: FitConfig,
    metrics: BridgeMetrics,
    logger: StructuredLogger,
    /// Jobs submitted by this process, keyed by pod, until the pod is bound or gone
    journal: DashMap<String, JournalEntry>,
    /// Jobs whose placement failure has already been reported
    reported: DashSet<JobId>,
}

impl FitEngine {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        batch: Arc<dyn BatchScheduler>,
        notifier: EventNotifier,
        config: FitConfig,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            orchestrator,
            batch,
            notifier,
            config,
            metrics: BridgeMetrics::new(),
            logger,
            journal: DashMap::new(),
            reported: DashSet::new(),
        }
    }

    /// Decide where the pod goes, submitting its batch job on first sight
    pub async fn fit(&self, pod: &Pod) -> Result<FitOutcome, FitError> {
        let job_id = self.ensure_job(pod).await?;

        let status = self
            .batch
            .status(&job_id)
            .await
            .map_err(|source| FitError::Status {
                job_id: job_id.clone(),
                source,
            })?;

        match status.placement() {
            Placement::Placed(host) => {
                info!(pod = %pod.name(), job_id = %job_id, node = %host, "Job scheduled, node assigned");
                Ok(FitOutcome::Placed { job_id, host })
            }
            Placement::Pending(comment) => {
                debug!(
                    pod = %pod.name(),
                    job_id = %job_id,
                    state = ?status.state,
                    comment = ?comment,
                    "Job not placed yet"
                );
                Ok(FitOutcome::Pending { job_id })
            }
            Placement::Failed(comment) => {
                self.report_failure(pod, &job_id, comment.as_deref()).await;
                Ok(FitOutcome::PlacementFailed { job_id })
            }
        }
    }

    /// Drop bookkeeping for a pod once it is bound
    pub fn forget(&self, pod: &Pod, job_id: &JobId) {
        self.journal.remove(&pod.key());
        self.reported.remove(job_id);
    }

    /// Number of pods with a job submitted by this process and not yet bound
    pub fn journal_len(&self) -> usize {
        self.journal.len()
    }

    /// Drop bookkeeping for pods no longer in the unscheduled listing
    ///
    /// Pods leave the listing when deleted or bound elsewhere. A job whose
    /// annotation was never recorded is kept for a while longer so a late
    /// snapshot of its pod still reuses it.
    pub fn retain_listed(&self, pods: &[Pod]) {
        let listed: HashSet<String> = pods.iter().map(Pod::key).collect();
        let before = self.journal.len();
        self.journal.retain(|key, entry| {
            listed.contains(key)
                || (!entry.annotated && entry.submitted_at.elapsed() < UNRECORDED_JOB_RETENTION)
        });

        let mut live_jobs: HashSet<JobId> = pods.iter().filter_map(Pod::job_id).collect();
        live_jobs.extend(self.journal.iter().map(|entry| entry.job_id.clone()));
        self.reported.retain(|job_id| live_jobs.contains(job_id));

        let dropped = before - self.journal.len();
        if dropped > 0 {
            debug!(dropped, "Dropped journal entries for pods no longer unscheduled");
        }
    }

    async fn ensure_job(&self, pod: &Pod) -> Result<JobId, FitError> {
        if let Some(job_id) = pod.job_id() {
            return Ok(job_id);
        }

        let key = pod.key();
        if let Some(entry) = self.journal.get(&key).map(|e| e.clone()) {
            debug!(pod = %pod.name(), job_id = %entry.job_id, "Reusing previously submitted job");
            if !entry.annotated {
                self.record(pod, &key, &entry.job_id).await?;
            }
            return Ok(entry.job_id);
        }

        let resources = ResourceRequest::from_pod(pod)?;
        let request = JobRequest {
            pod_name: pod.name().to_string(),
            resources,
        };

        let job_id = self.batch.submit(&request).await.map_err(FitError::Submit)?;
        self.metrics.inc_jobs_submitted();
        self.logger
            .log_job_submitted(pod.name(), job_id.as_str(), &resources.select_spec());
        self.journal.insert(
            key.clone(),
            JournalEntry {
                job_id: job_id.clone(),
                annotated: false,
                submitted_at: Instant::now(),
            },
        );

        self.record(pod, &key, &job_id).await?;

        if !self.config.submit_settle_delay.is_zero() {
            tokio::time::sleep(self.config.submit_settle_delay).await;
        }

        Ok(job_id)
    }

    async fn record(&self, pod: &Pod, key: &str, job_id: &JobId) -> Result<(), FitError> {
        if let Err(source) = self.orchestrator.annotate_job_id(pod, job_id).await {
            error!(
                pod = %pod.name(),
                job_id = %job_id,
                error = %source,
                "Failed to record job id on pod, will retry with the same job"
            );
            return Err(FitError::Annotate {
                job_id: job_id.clone(),
                source,
            });
        }

        if let Some(mut entry) = self.journal.get_mut(key) {
            entry.annotated = true;
        }
        info!(pod = %pod.name(), job_id = %job_id, "Associated job id with pod");
        Ok(())
    }

    async fn report_failure(&self, pod: &Pod, job_id: &JobId, comment: Option<&str>) {
        if !self.reported.insert(job_id.clone()) {
            debug!(pod = %pod.name(), job_id = %job_id, "Placement failure already reported");
            return;
        }

        self.metrics.inc_placement_failures();
        self.logger
            .log_placement_failed(pod.name(), job_id.as_str(), comment);

        if let Err(e) = self.notifier.failed_scheduling(pod, comment).await {
            warn!(pod = %pod.name(), error = %e, "Failed to publish FailedScheduling event");
            self.reported.remove(job_id);
        }
    }
}
