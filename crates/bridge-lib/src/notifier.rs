//! Scheduling events published to the cluster API

use crate::models::{
    Event, EventSource, EventType, ObjectMeta, ObjectReference, Pod, DEFAULT_NAMESPACE,
};
use crate::orchestrator::{Orchestrator, OrchestratorError};
use chrono::{DateTime, SecondsFormat, Utc};
use std::sync::Arc;

/// Default reporting component name
pub const DEFAULT_COMPONENT: &str = "PBS-scheduler";

pub const REASON_SCHEDULED: &str = "Scheduled";
pub const REASON_FAILED_SCHEDULING: &str = "FailedScheduling";

/// Publishes Normal/Warning events attached to pods
#[derive(Clone)]
pub struct EventNotifier {
    orchestrator: Arc<dyn Orchestrator>,
    component: String,
    /// Namespace for events about pods whose manifest names none
    namespace: String,
}

impl EventNotifier {
    pub fn new(orchestrator: Arc<dyn Orchestrator>, component: impl Into<String>) -> Self {
        Self {
            orchestrator,
            component: component.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
        }
    }

    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Report a successful binding
    pub async fn scheduled(&self, pod: &Pod, node: &str) -> Result<(), OrchestratorError> {
        let message = format!("Successfully assigned {} to {}", pod.name(), node);
        let event = self.build(pod, EventType::Normal, REASON_SCHEDULED, message, Utc::now());
        self.orchestrator.post_event(&event).await
    }

    /// Report that the batch scheduler cannot place the pod
    pub async fn failed_scheduling(
        &self,
        pod: &Pod,
        comment: Option<&str>,
    ) -> Result<(), OrchestratorError> {
        let message = match comment {
            Some(comment) => format!("pod ({}) failed to fit in any node: {}", pod.name(), comment),
            None => format!("pod ({}) failed to fit in any node", pod.name()),
        };
        let event = self.build(
            pod,
            EventType::Warning,
            REASON_FAILED_SCHEDULING,
            message,
            Utc::now(),
        );
        self.orchestrator.post_event(&event).await
    }

    fn build(
        &self,
        pod: &Pod,
        event_type: EventType,
        reason: &str,
        message: String,
        at: DateTime<Utc>,
    ) -> Event {
        let timestamp = at.to_rfc3339_opts(SecondsFormat::Secs, true);
        Event {
            count: 1,
            message,
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", pod.name())),
                ..Default::default()
            },
            reason: reason.to_string(),
            first_timestamp: timestamp.clone(),
            last_timestamp: timestamp,
            event_type,
            source: EventSource {
                component: self.component.clone(),
            },
            involved_object: ObjectReference::pod(pod, &self.namespace),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{test_pod, FakeOrchestrator};
    use chrono::TimeZone;

    #[test]
    fn test_event_shape() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let notifier = EventNotifier::new(orchestrator, DEFAULT_COMPONENT);
        let pod = test_pod("web-1", &[("500m", "256Mi")]);
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        let event = notifier.build(
            &pod,
            EventType::Normal,
            REASON_SCHEDULED,
            "hello".to_string(),
            at,
        );

        assert_eq!(event.first_timestamp, "2024-03-01T12:30:00Z");
        assert_eq!(event.last_timestamp, event.first_timestamp);
        assert_eq!(event.metadata.generate_name.as_deref(), Some("web-1-"));
        assert_eq!(event.involved_object.kind, "Pod");
        assert_eq!(event.involved_object.namespace, "default");
        assert_eq!(event.involved_object.uid, pod.uid());
        assert_eq!(event.source.component, "PBS-scheduler");
        assert_eq!(event.count, 1);
    }

    #[test]
    fn test_event_namespace_follows_configuration() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let notifier =
            EventNotifier::new(orchestrator, DEFAULT_COMPONENT).with_namespace("batch");
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();

        let mut pod = test_pod("web-1", &[]);
        pod.metadata.namespace = None;
        let event = notifier.build(&pod, EventType::Normal, REASON_SCHEDULED, String::new(), at);
        assert_eq!(event.involved_object.namespace, "batch");

        pod.metadata.namespace = Some("jobs".to_string());
        let event = notifier.build(&pod, EventType::Normal, REASON_SCHEDULED, String::new(), at);
        assert_eq!(event.involved_object.namespace, "jobs");
    }

    #[tokio::test]
    async fn test_scheduled_event_posted() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let notifier = EventNotifier::new(orchestrator.clone(), DEFAULT_COMPONENT);
        let pod = test_pod("web-1", &[]);

        notifier.scheduled(&pod, "node07").await.unwrap();

        let events = orchestrator.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::Normal);
        assert_eq!(events[0].reason, REASON_SCHEDULED);
        assert_eq!(events[0].message, "Successfully assigned web-1 to node07");
    }

    #[tokio::test]
    async fn test_failed_scheduling_carries_comment() {
        let orchestrator = Arc::new(FakeOrchestrator::default());
        let notifier = EventNotifier::new(orchestrator.clone(), DEFAULT_COMPONENT);
        let pod = test_pod("web-1", &[]);

        notifier
            .failed_scheduling(&pod, Some("Job held, too many failed attempts"))
            .await
            .unwrap();

        let events = orchestrator.events();
        assert_eq!(events[0].event_type, EventType::Warning);
        assert_eq!(events[0].reason, REASON_FAILED_SCHEDULING);
        assert_eq!(
            events[0].message,
            "pod (web-1) failed to fit in any node: Job held, too many failed attempts"
        );
    }
}
