//! Job model and lifecycle state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Canonical job identifier: an opaque string, UUID v4 in textual form.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a fresh id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl FromStr for JobId {
    type Err = JobIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(JobIdError::Empty);
        }
        Ok(Self(trimmed.to_string()))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobIdError {
    #[error("job id cannot be empty")]
    Empty,
}

/// Job lifecycle status.
/// This is the CANONICAL definition - use this everywhere for job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Job persisted but not yet claimed by a worker
    #[default]
    Pending,
    /// Job is executing on a worker
    Running,
    /// Job finished without error
    Completed,
    /// Job finished with an error (includes recovery and retry exhaustion)
    Failed,
    /// Job was cancelled before a worker claimed it
    Cancelled,
}

impl JobStatus {
    pub const ALL: &'static [JobStatus] = &[
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" | "canceled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Invalid job status: '{}'", s)),
        }
    }
}

/// A submitted playbook + context tuple with lifecycle state.
///
/// Invariants maintained by the mutators below:
/// - `started_at` is set iff the job ever left `pending`
/// - `completed_at` is set iff the status is terminal
/// - a `running` job has a non-empty `assigned_node`
/// - `retry_count` only ever increases
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Ordered rule nodes, stored as raw JSON; the engine parses them
    /// into typed rules at evaluation time.
    pub playbook: Vec<Value>,
    pub context: Map<String, Value>,
    #[serde(default)]
    pub results: Vec<Value>,
    /// Empty unless status is failed.
    #[serde(default)]
    pub error: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Node currently (or last) responsible for execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

impl Job {
    pub fn new(playbook: Vec<Value>, context: Map<String, Value>) -> Self {
        Self {
            id: JobId::generate(),
            status: JobStatus::Pending,
            playbook,
            context,
            results: Vec::new(),
            error: String::new(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            assigned_node: None,
            retry_count: 0,
            priority: 0,
            tags: Vec::new(),
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    /// Transition pending -> running. Records the start time and owner.
    pub fn mark_running(&mut self, node: impl Into<String>) {
        self.status = JobStatus::Running;
        self.started_at.get_or_insert_with(Utc::now);
        self.assigned_node = Some(node.into());
    }

    pub fn mark_completed(&mut self, results: Vec<Value>) {
        self.status = JobStatus::Completed;
        self.results = results;
        self.error.clear();
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = JobStatus::Failed;
        self.error = error.into();
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = JobStatus::Cancelled;
        self.completed_at = Some(Utc::now());
    }

    /// Reset a failed job for another attempt. Clears completion state
    /// and increments the retry counter.
    pub fn mark_retrying(&mut self) {
        self.status = JobStatus::Pending;
        self.error.clear();
        self.completed_at = None;
        self.assigned_node = None;
        self.retry_count += 1;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Wall-clock duration from start to completion, when both are known.
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_job() -> Job {
        Job::new(Vec::new(), Map::new())
    }

    #[test]
    fn test_status_roundtrip() {
        for status in JobStatus::ALL {
            let parsed: JobStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, *status);
        }
    }

    #[test]
    fn test_status_terminal() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_lifecycle_timestamps() {
        let mut job = empty_job();
        assert!(job.started_at.is_none());
        assert!(job.completed_at.is_none());

        job.mark_running("node-a");
        assert!(job.started_at.is_some());
        assert_eq!(job.assigned_node.as_deref(), Some("node-a"));

        job.mark_completed(vec![]);
        assert!(job.completed_at.is_some());
        assert!(job.is_terminal());
    }

    #[test]
    fn test_retry_clears_completion_state() {
        let mut job = empty_job();
        job.mark_running("node-a");
        job.mark_failed("boom");

        job.mark_retrying();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.error.is_empty());
        assert!(job.completed_at.is_none());
        assert!(job.assigned_node.is_none());
        assert_eq!(job.retry_count, 1);
        // started_at stays: the job did leave pending once
        assert!(job.started_at.is_some());
    }

    #[test]
    fn test_serde_roundtrip() {
        let mut job = empty_job();
        job.mark_running("node-b");
        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.status, JobStatus::Running);
        assert_eq!(back.assigned_node.as_deref(), Some("node-b"));
    }

    #[test]
    fn test_job_id_parse_rejects_empty() {
        assert!("  ".parse::<JobId>().is_err());
        assert!("abc".parse::<JobId>().is_ok());
    }
}
