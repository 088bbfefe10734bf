//! Webhook event types emitted on job and node state transitions.

use crate::job::JobId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Event kinds delivered to registered webhook sinks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    JobSubmitted,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobCancelled,
    JobRecovered,
    NodeJoined,
    NodeLost,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::JobSubmitted => "job_submitted",
            EventKind::JobStarted => "job_started",
            EventKind::JobCompleted => "job_completed",
            EventKind::JobFailed => "job_failed",
            EventKind::JobCancelled => "job_cancelled",
            EventKind::JobRecovered => "job_recovered",
            EventKind::NodeJoined => "node_joined",
            EventKind::NodeLost => "node_lost",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single event instance, serialized as the webhook body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: EventKind,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub detail: Value,
}

impl Event {
    pub fn for_job(kind: EventKind, job_id: JobId) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            job_id: Some(job_id),
            node_id: None,
            detail: Value::Null,
        }
    }

    pub fn for_node(kind: EventKind, node_id: impl Into<String>) -> Self {
        Self {
            kind,
            timestamp: Utc::now(),
            job_id: None,
            node_id: Some(node_id.into()),
            detail: Value::Null,
        }
    }

    pub fn with_detail(mut self, detail: Value) -> Self {
        self.detail = detail;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_snake_case() {
        let json = serde_json::to_string(&EventKind::JobFailed).unwrap();
        assert_eq!(json, r#""job_failed""#);
    }

    #[test]
    fn test_event_body_omits_empty_fields() {
        let event = Event::for_job(EventKind::JobCompleted, JobId::from("abc"));
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""job_id":"abc""#));
        assert!(!json.contains("node_id"));
        assert!(!json.contains("detail"));
    }
}
