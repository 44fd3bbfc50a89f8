//! Core data models shared with the cluster API
//!
//! Only the fields the bridge reads or writes are modelled; everything else
//! in the API objects is ignored on decode.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Annotation key recording the batch job submitted for a pod
pub const JOB_ID_ANNOTATION: &str = "JobID";

/// Namespace used when a pod does not carry one
pub const DEFAULT_NAMESPACE: &str = "default";

/// Opaque batch scheduler job identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Object metadata subset
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generate_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creation_timestamp: Option<String>,
}

/// Resource requests of a container, keyed by resource name (`cpu`, `memory`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    #[serde(default)]
    pub requests: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
}

impl Container {
    pub fn request(&self, resource: &str) -> Option<&str> {
        self.resources.requests.get(resource).map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default)]
    pub containers: Vec<Container>,
}

/// A workload unit as seen through the cluster API
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: PodSpec,
}

impl Pod {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn uid(&self) -> &str {
        &self.metadata.uid
    }

    pub fn namespace(&self) -> &str {
        self.namespace_or(DEFAULT_NAMESPACE)
    }

    /// The pod's namespace, or `fallback` when the manifest leaves it unset
    pub fn namespace_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.metadata
            .namespace
            .as_deref()
            .filter(|ns| !ns.is_empty())
            .unwrap_or(fallback)
    }

    /// A pod with a node already assigned must never be processed again
    pub fn is_scheduled(&self) -> bool {
        self.spec
            .node_name
            .as_deref()
            .map(|n| !n.is_empty())
            .unwrap_or(false)
    }

    /// Job id recorded in the pod annotations, if any
    pub fn job_id(&self) -> Option<JobId> {
        self.metadata
            .annotations
            .get(JOB_ID_ANNOTATION)
            .filter(|id| !id.is_empty())
            .map(|id| JobId::new(id.clone()))
    }

    /// Key used for in-memory bookkeeping; uid when known, namespaced name otherwise
    pub fn key(&self) -> String {
        if self.metadata.uid.is_empty() {
            format!("{}/{}", self.namespace(), self.metadata.name)
        } else {
            self.metadata.uid.clone()
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PodList {
    #[serde(default)]
    pub items: Vec<Pod>,
}

/// Watch notification type
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WatchEventType {
    Added,
    Modified,
    Deleted,
    Bookmark,
    Error,
    #[serde(other)]
    Unknown,
}

/// Raw watch notification; the object is only decoded as a pod for `ADDED`
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent {
    #[serde(rename = "type")]
    pub event_type: WatchEventType,
    #[serde(default)]
    pub object: serde_json::Value,
}

/// Strategic-merge patch body for pod annotations
#[derive(Debug, Clone, Serialize)]
pub struct AnnotationPatch {
    pub metadata: AnnotationPatchMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnnotationPatchMeta {
    pub annotations: BTreeMap<String, String>,
}

impl AnnotationPatch {
    pub fn job_id(job_id: &JobId) -> Self {
        let mut annotations = BTreeMap::new();
        annotations.insert(JOB_ID_ANNOTATION.to_string(), job_id.to_string());
        Self {
            metadata: AnnotationPatchMeta { annotations },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingTarget {
    pub api_version: String,
    pub kind: String,
    pub name: String,
}

/// Binding subresource body
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Binding {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub target: BindingTarget,
}

impl Binding {
    pub fn new(pod: &Pod, node: impl Into<String>) -> Self {
        Self {
            api_version: "v1".to_string(),
            kind: "Binding".to_string(),
            metadata: ObjectMeta {
                name: pod.name().to_string(),
                ..Default::default()
            },
            target: BindingTarget {
                api_version: "v1".to_string(),
                kind: "Node".to_string(),
                name: node.into(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    Normal,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventSource {
    pub component: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectReference {
    pub kind: String,
    pub name: String,
    pub namespace: String,
    pub uid: String,
}

impl ObjectReference {
    /// Reference to a pod, placed in `default_namespace` if it names none
    pub fn pod(pod: &Pod, default_namespace: &str) -> Self {
        Self {
            kind: "Pod".to_string(),
            name: pod.name().to_string(),
            namespace: pod.namespace_or(default_namespace).to_string(),
            uid: pod.uid().to_string(),
        }
    }
}

/// Scheduling event posted to the cluster API
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub count: u32,
    pub message: String,
    pub metadata: ObjectMeta,
    pub reason: String,
    pub last_timestamp: String,
    pub first_timestamp: String,
    #[serde(rename = "type")]
    pub event_type: EventType,
    pub source: EventSource,
    pub involved_object: ObjectReference,
}
