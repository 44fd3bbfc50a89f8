//! Parsing of `qstat -f` job status text

use super::BatchError;
use std::collections::HashMap;

/// Substate reported by the batch server once a running job holds its hosts
pub const SUBSTATE_RUNNING: u32 = 42;

/// Batch job state letter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Held,
    Waiting,
    Transit,
    Begun,
    Running,
    Suspended,
    Exiting,
    Finished,
    Expired,
    Moved,
    Other(String),
}

impl JobState {
    pub fn parse(value: &str) -> Self {
        match value {
            "Q" => Self::Queued,
            "H" => Self::Held,
            "W" => Self::Waiting,
            "T" => Self::Transit,
            "B" => Self::Begun,
            "R" => Self::Running,
            "S" | "U" => Self::Suspended,
            "E" => Self::Exiting,
            "F" => Self::Finished,
            "X" => Self::Expired,
            "M" => Self::Moved,
            other => Self::Other(other.to_string()),
        }
    }

    /// The job will not run again under this id
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Expired)
    }

    /// The scheduler will not start the job until an operator intervenes
    ///
    /// PBS holds jobs that repeatedly fail to start; a released job may
    /// still run later and is then bound as usual.
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held)
    }
}

/// Where a job stands with respect to placement
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Job is running on this host
    Placed(String),
    /// Not placed yet; carries the scheduler comment if any
    Pending(Option<String>),
    /// Job cannot place under this id: finished, purged or held
    Failed(Option<String>),
}

/// Job status as reported by the batch scheduler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub state: JobState,
    pub substate: Option<u32>,
    pub exec_host: Option<String>,
    pub comment: Option<String>,
}

impl JobStatus {
    /// Parse the full-format status listing of a single job
    pub fn parse(text: &str) -> Result<Self, BatchError> {
        let attributes = parse_attributes(text);

        let state = attributes
            .get("job_state")
            .map(|s| JobState::parse(s))
            .ok_or(BatchError::MissingField("job_state"))?;

        let substate = match attributes.get("substate") {
            Some(raw) => Some(raw.parse().map_err(|_| BatchError::InvalidField {
                field: "substate",
                value: raw.clone(),
            })?),
            None => None,
        };

        Ok(Self {
            state,
            substate,
            exec_host: attributes.get("exec_host").cloned(),
            comment: attributes.get("comment").cloned(),
        })
    }

    /// First execution host, without the `/vnode` suffix
    pub fn assigned_host(&self) -> Option<&str> {
        let first = self.exec_host.as_deref()?.split('+').next()?;
        let host = first.split('/').next()?.trim();
        (!host.is_empty()).then_some(host)
    }

    pub fn placement(&self) -> Placement {
        if self.state == JobState::Running && self.substate == Some(SUBSTATE_RUNNING) {
            if let Some(host) = self.assigned_host() {
                return Placement::Placed(host.to_string());
            }
        }

        if self.state.is_terminal() || self.state.is_held() {
            Placement::Failed(self.comment.clone())
        } else {
            Placement::Pending(self.comment.clone())
        }
    }
}

/// Tolerant `key = value` tokenizer; tab-indented lines continue the previous value
fn parse_attributes(text: &str) -> HashMap<String, String> {
    let mut attributes: HashMap<String, String> = HashMap::new();
    let mut last_key: Option<String> = None;

    for line in text.lines() {
        if line.starts_with('\t') {
            if let Some(value) = last_key.as_ref().and_then(|k| attributes.get_mut(k)) {
                value.push_str(line.trim());
            }
            continue;
        }

        match line.split_once('=') {
            Some((key, value)) => {
                let key = key.trim().to_string();
                if key.is_empty() || key.contains(' ') {
                    last_key = None;
                    continue;
                }
                attributes.insert(key.clone(), value.trim().to_string());
                last_key = Some(key);
            }
            None => last_key = None,
        }
    }

    attributes
}
