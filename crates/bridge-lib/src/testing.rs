//! In-memory fakes of the cluster API and batch scheduler for unit tests

use crate::batch::{BatchError, BatchScheduler, JobRequest, JobState, JobStatus};
use crate::models::{
    Binding, Container, Event, JobId, Pod, ResourceRequirements, JOB_ID_ANNOTATION,
};
use crate::orchestrator::{Orchestrator, OrchestratorError, WatchStream};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;

/// Write an executable shell script standing in for a batch command
pub fn fake_command(dir: &tempfile::TempDir, name: &str, body: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

pub fn test_pod(name: &str, requests: &[(&str, &str)]) -> Pod {
    let mut pod = Pod::default();
    pod.metadata.name = name.to_string();
    pod.metadata.uid = format!("uid-{}", name);
    for (i, (cpu, memory)) in requests.iter().enumerate() {
        let mut resources = ResourceRequirements::default();
        resources.requests.insert("cpu".to_string(), cpu.to_string());
        resources.requests.insert("memory".to_string(), memory.to_string());
        pod.spec.containers.push(Container {
            name: format!("c{}", i),
            resources,
        });
    }
    pod
}

pub fn running_on(host: &str) -> JobStatus {
    JobStatus {
        state: JobState::Running,
        substate: Some(42),
        exec_host: Some(format!("{}/0", host)),
        comment: None,
    }
}

pub fn queued() -> JobStatus {
    JobStatus {
        state: JobState::Queued,
        substate: Some(10),
        exec_host: None,
        comment: Some("Not Running: Insufficient amount of resource: ncpus".to_string()),
    }
}

pub fn held(comment: &str) -> JobStatus {
    JobStatus {
        state: JobState::Held,
        substate: Some(20),
        exec_host: None,
        comment: Some(comment.to_string()),
    }
}

pub fn finished_without_host(comment: &str) -> JobStatus {
    JobStatus {
        state: JobState::Finished,
        substate: Some(91),
        exec_host: None,
        comment: Some(comment.to_string()),
    }
}

/// Scripted outcome of one watch connection attempt
pub enum WatchScript {
    Refuse,
    Deliver(Vec<Pod>),
    DecodeError,
}

#[derive(Default)]
struct OrchestratorState {
    pods: Vec<Pod>,
    annotations: Vec<(String, JobId)>,
    bindings: Vec<(String, String)>,
    events: Vec<Event>,
    watch_script: VecDeque<WatchScript>,
    watch_attempts: Vec<Instant>,
    open_watches: Vec<mpsc::Sender<Result<Pod, OrchestratorError>>>,
    list_calls: usize,
    annotate_failures: usize,
}

/// Cluster API fake; bound pods drop out of the unscheduled listing
#[derive(Default)]
pub struct FakeOrchestrator {
    state: Mutex<OrchestratorState>,
    pub fail_list: AtomicBool,
    pub fail_bind: AtomicBool,
    pub fail_events: AtomicBool,
}

impl FakeOrchestrator {
    pub fn with_pods(pods: Vec<Pod>) -> Self {
        let fake = Self::default();
        fake.state.lock().unwrap().pods = pods;
        fake
    }

    pub fn script_watch(&self, script: WatchScript) {
        self.state.lock().unwrap().watch_script.push_back(script);
    }

    pub fn fail_next_annotations(&self, count: usize) {
        self.state.lock().unwrap().annotate_failures = count;
    }

    pub fn annotations(&self) -> Vec<(String, JobId)> {
        self.state.lock().unwrap().annotations.clone()
    }

    pub fn bindings(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().bindings.clone()
    }

    pub fn events(&self) -> Vec<Event> {
        self.state.lock().unwrap().events.clone()
    }

    pub fn watch_attempts(&self) -> Vec<Instant> {
        self.state.lock().unwrap().watch_attempts.clone()
    }

    pub fn list_calls(&self) -> usize {
        self.state.lock().unwrap().list_calls
    }

    /// Delete a pod from the cluster
    pub fn remove_pod(&self, name: &str) {
        self.state.lock().unwrap().pods.retain(|p| p.name() != name);
    }

    /// Current server-side copy of a pod
    pub fn pod(&self, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .unwrap()
            .pods
            .iter()
            .find(|p| p.name() == name)
            .cloned()
    }

    fn status_error(operation: &'static str) -> OrchestratorError {
        OrchestratorError::Status {
            operation,
            status: 500,
            body: "injected failure".to_string(),
        }
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_unscheduled_pods(&self) -> Result<Vec<Pod>, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        state.list_calls += 1;
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(Self::status_error("List pods"));
        }
        Ok(state.pods.clone())
    }

    async fn watch_unscheduled_pods(&self) -> Result<WatchStream, OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        state.watch_attempts.push(Instant::now());

        let (tx, rx) = mpsc::channel(64);
        match state.watch_script.pop_front() {
            Some(WatchScript::Refuse) => return Err(Self::status_error("Watch pods")),
            Some(WatchScript::Deliver(pods)) => {
                for pod in pods {
                    let _ = tx.try_send(Ok(pod));
                }
            }
            Some(WatchScript::DecodeError) => {
                let _ = tx.try_send(Err(OrchestratorError::decode("watch event", "bad json")));
            }
            None => state.open_watches.push(tx),
        }
        Ok(ReceiverStream::new(rx))
    }

    async fn annotate_job_id(&self, pod: &Pod, job_id: &JobId) -> Result<(), OrchestratorError> {
        let mut state = self.state.lock().unwrap();
        if state.annotate_failures > 0 {
            state.annotate_failures -= 1;
            return Err(Self::status_error("Annotate pod"));
        }
        state.annotations.push((pod.name().to_string(), job_id.clone()));
        if let Some(stored) = state.pods.iter_mut().find(|p| p.name() == pod.name()) {
            stored
                .metadata
                .annotations
                .insert(JOB_ID_ANNOTATION.to_string(), job_id.to_string());
        }
        Ok(())
    }

    async fn bind(&self, pod: &Pod, binding: &Binding) -> Result<(), OrchestratorError> {
        if self.fail_bind.load(Ordering::SeqCst) {
            return Err(Self::status_error("Binding"));
        }
        let mut state = self.state.lock().unwrap();
        state
            .bindings
            .push((pod.name().to_string(), binding.target.name.clone()));
        state.pods.retain(|p| p.name() != pod.name());
        Ok(())
    }

    async fn post_event(&self, event: &Event) -> Result<(), OrchestratorError> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(Self::status_error("Event"));
        }
        self.state.lock().unwrap().events.push(event.clone());
        Ok(())
    }
}

/// Batch scheduler fake that records submissions and tracks concurrent calls
pub struct FakeBatch {
    submissions: Mutex<Vec<JobRequest>>,
    statuses: Mutex<HashMap<JobId, JobStatus>>,
    default_status: Mutex<JobStatus>,
    next_id: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    call_delay: Duration,
    pub fail_submit: AtomicBool,
    pub fail_status: AtomicBool,
}

impl Default for FakeBatch {
    fn default() -> Self {
        Self::with_delay(Duration::ZERO)
    }
}

impl FakeBatch {
    pub fn with_delay(call_delay: Duration) -> Self {
        Self {
            submissions: Mutex::new(Vec::new()),
            statuses: Mutex::new(HashMap::new()),
            default_status: Mutex::new(queued()),
            next_id: AtomicUsize::new(1),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            call_delay,
            fail_submit: AtomicBool::new(false),
            fail_status: AtomicBool::new(false),
        }
    }

    /// Status returned for every job without an explicit one
    pub fn set_default_status(&self, status: JobStatus) {
        *self.default_status.lock().unwrap() = status;
    }

    pub fn set_status(&self, job_id: &JobId, status: JobStatus) {
        self.statuses.lock().unwrap().insert(job_id.clone(), status);
    }

    pub fn submissions(&self) -> Vec<JobRequest> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.call_delay.is_zero() {
            tokio::time::sleep(self.call_delay).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchScheduler for FakeBatch {
    async fn submit(&self, request: &JobRequest) -> Result<JobId, BatchError> {
        self.enter().await;
        let result = if self.fail_submit.load(Ordering::SeqCst) {
            Err(BatchError::EmptyJobId("qsub".to_string()))
        } else {
            self.submissions.lock().unwrap().push(request.clone());
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(JobId::new(format!("{}.pbs-server", id)))
        };
        self.leave();
        result
    }

    async fn status(&self, job_id: &JobId) -> Result<JobStatus, BatchError> {
        self.enter().await;
        let result = if self.fail_status.load(Ordering::SeqCst) {
            Err(BatchError::MissingField("job_state"))
        } else {
            let statuses = self.statuses.lock().unwrap();
            Ok(statuses
                .get(job_id)
                .cloned()
                .unwrap_or_else(|| self.default_status.lock().unwrap().clone()))
        };
        self.leave();
        result
    }
}
