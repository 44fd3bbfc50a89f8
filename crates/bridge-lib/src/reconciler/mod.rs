//! Dual-trigger scheduling loop
//!
//! Pods reach the fit/bind sequence through two paths: a watch on newly
//! created unscheduled pods and a periodic sweep over every unscheduled pod.
//! Both paths take the same processing lock, so at most one pod is being
//! fitted or bound at any time. The sweep makes the system level-triggered:
//! a pod missed by the watch is picked up on the next sweep.

use crate::binder::{BindError, Binder};
use crate::fit::{FitEngine, FitError, FitOutcome};
use crate::health::{components, HealthRegistry};
use crate::models::Pod;
use crate::observability::{BridgeMetrics, StructuredLogger};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};


/// Errors from processing a single pod or a sweep
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to list unscheduled pods: {0}")]
    List(#[source] OrchestratorError),

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error(transparent)]
    Bind(#[from] BindError),
}

/// Timing and buffering for the two trigger paths
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Period of the full sweep (default: 20 seconds)
    pub sweep_interval: Duration,
    /// Pause before re-opening a failed watch (default: 5 seconds)
    pub watch_retry_delay: Duration,
    /// Pause before fitting a pod delivered by the watch (default: 2 seconds)
    pub watch_settle_delay: Duration,
    /// Pods buffered between the watch reader and the processor
    pub watch_buffer: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(20),
            watch_retry_delay: Duration::from_secs(5),
            watch_settle_delay: Duration::from_secs(2),
            watch_buffer: 16,
        }
    }
}

/// What happened to one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodOutcome {
    /// Already bound, or bound by this process a moment ago
    Skipped,
    Bound { node: String },
    Pending,
    PlacementFailed,
}

/// Per-sweep tally
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepSummary {
    pub seen: usize,
    pub bound: usize,
    pub pending: usize,
    pub failed: usize,
    pub errors: usize,
}

pub struct Reconciler {
    orchestrator: Arc<dyn Orchestrator>,
    fit: FitEngine,
    binder: Binder,
    config: ReconcilerConfig,
    /// Serializes fit/bind across the watch and sweep paths
    lock: Mutex<()>,
    /// Pods bound by this process; guards against stale watch snapshots
    recently_bound: DashMap<String, Instant>,
    health: HealthRegistry,
    metrics: BridgeMetrics,
    logger: StructuredLogger,
}

impl Reconciler {
    pub fn new(
        orchestrator: Arc<dyn Orchestrator>,
        fit: FitEngine,
        binder: Binder,
        config: ReconcilerConfig,
        health: HealthRegistry,
        logger: StructuredLogger,
    ) -> Self {
        Self {
            orchestrator,
            fit,
            binder,
            config,
            lock: Mutex::new(()),
            recently_bound: DashMap::new(),
            health,
            metrics: BridgeMetrics::new(),
            logger,
        }
    }

    pub fn config(&self) -> &ReconcilerConfig {
        &self.config
    }

    /// Fit and bind one pod delivered by the watch
    pub async fn process_watched_pod(&self, pod: &Pod) -> Result<PodOutcome, ReconcileError> {
        let _guard = self.lock.lock().await;
        if !self.config.watch_settle_delay.is_zero() {
            tokio::time::sleep(self.config.watch_settle_delay).await;
        }
        self.schedule_pod(pod).await
    }

    /// List every unscheduled pod and run fit/bind on each
    pub async fn sweep_once(&self) -> Result<SweepSummary, ReconcileError> {
        let _guard = self.lock.lock().await;
        let start = Instant::now();
        self.prune_recently_bound();

        let pods = match self.orchestrator.list_unscheduled_pods().await {
            Ok(pods) => pods,
            Err(e) => {
                self.health
                    .record_failure(components::ORCHESTRATOR, e.to_string())
                    .await;
                return Err(ReconcileError::List(e));
            }
        };
        self.health.record_success(components::ORCHESTRATOR).await;
        self.metrics.set_unscheduled_pods(pods.len() as i64);
        self.fit.retain_listed(&pods);

        let mut summary = SweepSummary {
            seen: pods.len(),
            ..Default::default()
        };
        for pod in &pods {
            match self.schedule_pod(pod).await {
                Ok(PodOutcome::Bound { .. }) => summary.bound += 1,
                Ok(PodOutcome::Pending) => summary.pending += 1,
                Ok(PodOutcome::PlacementFailed) => summary.failed += 1,
                Ok(PodOutcome::Skipped) => {}
                Err(e) => {
                    summary.errors += 1;
                    warn!(pod = %pod.name(), error = %e, "Failed to schedule pod during sweep");
                }
            }
        }

        self.metrics
            .observe_sweep_duration(start.elapsed().as_secs_f64());
        Ok(summary)
    }

    /// Caller must hold the processing lock
    async fn schedule_pod(&self, pod: &Pod) -> Result<PodOutcome, ReconcileError> {
        if pod.is_scheduled() || self.recently_bound.contains_key(&pod.key()) {
            debug!(pod = %pod.name(), "Pod already bound, skipping");
            return Ok(PodOutcome::Skipped);
        }

        let outcome = match self.fit.fit(pod).await {
            Ok(outcome) => outcome,
            Err(e) => {
                self.metrics.inc_fit_errors();
                if matches!(e, FitError::Submit(_) | FitError::Status { .. }) {
                    self.health
                        .record_failure(components::BATCH_SCHEDULER, e.to_string())
                        .await;
                }
                return Err(e.into());
            }
        };

        match outcome {
            FitOutcome::Placed { job_id, host } => {
                self.health.record_success(components::BATCH_SCHEDULER).await;
                match self.binder.bind(pod, &host).await {
                    Ok(node) => {
                        self.metrics.inc_pods_bound();
                        self.logger
                            .log_pod_bound(pod.name(), Some(job_id.as_str()), &node);
                        self.fit.forget(pod, &job_id);
                        self.recently_bound.insert(pod.key(), Instant::now());
                        Ok(PodOutcome::Bound { node })
                    }
                    Err(e) => {
                        self.metrics.inc_bind_errors();
                        Err(e.into())
                    }
                }
            }
            FitOutcome::Pending { .. } => {
                self.health.record_success(components::BATCH_SCHEDULER).await;
                Ok(PodOutcome::Pending)
            }
            FitOutcome::PlacementFailed { .. } => {
                self.health.record_success(components::BATCH_SCHEDULER).await;
                Ok(PodOutcome::PlacementFailed)
            }
        }
    }

    /// Bound pods leave the unscheduled listing; a few sweeps of memory is enough
    fn prune_recently_bound(&self) {
        let ttl = self.config.sweep_interval * 10;
        self.recently_bound
            .retain(|_, bound_at| bound_at.elapsed() < ttl);
    }

    /// Run the sweep path until shutdown
    ///
    /// The first sweep happens one interval after start.
    pub async fn run_sweep_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let period = self.config.sweep_interval;
        info!(interval_secs = period.as_secs(), "Starting sweep loop");
        self.health.register(components::SWEEP).await;

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.sweep_once().await {
                        Ok(summary) => {
                            self.health.record_success(components::SWEEP).await;
                            debug!(
                                seen = summary.seen,
                                bound = summary.bound,
                                pending = summary.pending,
                                failed = summary.failed,
                                errors = summary.errors,
                                "Sweep complete"
                            );
                        }
                        Err(e) => {
                            self.health.record_failure(components::SWEEP, e.to_string()).await;
                            warn!(error = %e, "Sweep failed, retrying next interval");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down sweep loop");
                    break;
                }
            }
        }
    }

    /// Run the watch path until shutdown
    ///
    /// A reader task keeps a watch open and hands pods to this task through a
    /// bounded channel; this task fits and binds them one at a time.
    pub async fn run_watch_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!("Starting watch loop");
        self.health.register(components::WATCH).await;

        let (tx, mut rx) = mpsc::channel(self.config.watch_buffer.max(1));
        let reader = tokio::spawn(Arc::clone(&self).read_watch(tx));

        loop {
            tokio::select! {
                pod = rx.recv() => {
                    let Some(pod) = pod else { break };
                    if let Err(e) = self.process_watched_pod(&pod).await {
                        warn!(pod = %pod.name(), error = %e, "Failed to schedule watched pod");
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down watch loop");
                    break;
                }
            }
        }

        // Dropping the receiver stops the reader
        drop(rx);
        if let Err(e) = reader.await {
            warn!(error = %e, "Watch reader task failed");
        }
    }

    /// Keep a watch open, re-opening it after a fixed delay whenever it fails or ends
    async fn read_watch(self: Arc<Self>, tx: mpsc::Sender<Pod>) {
        let retry_delay = self.config.watch_retry_delay;
        let mut connected_before = false;

        loop {
            let opened = tokio::select! {
                _ = tx.closed() => return,
                opened = self.orchestrator.watch_unscheduled_pods() => opened,
            };

            match opened {
                Ok(mut stream) => {
                    if connected_before {
                        self.metrics.inc_watch_reconnects();
                    }
                    connected_before = true;
                    self.health.record_success(components::WATCH).await;
                    info!("Watching for new unscheduled pods");

                    loop {
                        let item = tokio::select! {
                            _ = tx.closed() => return,
                            item = stream.next() => item,
                        };
                        match item {
                            Some(Ok(pod)) => {
                                debug!(pod = %pod.name(), "Watch delivered unscheduled pod");
                                if tx.send(pod).await.is_err() {
                                    return;
                                }
                            }
                            Some(Err(e)) => {
                                warn!(error = %e, "Watch stream failed");
                                break;
                            }
                            None => {
                                debug!("Watch stream ended");
                                break;
                            }
                        }
                    }
                    self.health
                        .record_failure(components::WATCH, "watch connection lost")
                        .await;
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        retry_in_secs = retry_delay.as_secs(),
                        "Failed to open pod watch"
                    );
                    self.health
                        .record_failure(components::WATCH, e.to_string())
                        .await;
                }
            }

            tokio::select! {
                _ = tx.closed() => return,
                _ = tokio::time::sleep(retry_delay) => {}
            }
        }
    }
}
