//! Cluster node records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Node lifecycle status as seen through the shared store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    /// Heartbeating and eligible for claims
    #[default]
    Active,
    /// Finishing current jobs, not claiming new ones
    Draining,
    /// Missed heartbeats; jobs assigned here are requeued on eviction
    Inactive,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeStatus::Active => "active",
            NodeStatus::Draining => "draining",
            NodeStatus::Inactive => "inactive",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for NodeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(NodeStatus::Active),
            "draining" => Ok(NodeStatus::Draining),
            "inactive" => Ok(NodeStatus::Inactive),
            _ => Err(format!("Invalid node status: '{}'", s)),
        }
    }
}

/// A cluster member, refreshed on every heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub status: NodeStatus,
    pub last_seen: DateTime<Utc>,
    /// Fraction of worker capacity in use, in [0, 1].
    pub load: f64,
    pub running_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl NodeInfo {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            status: NodeStatus::Active,
            last_seen: Utc::now(),
            load: 0.0,
            running_jobs: 0,
            completed_jobs: 0,
            failed_jobs: 0,
            capabilities: Vec::new(),
        }
    }

    /// Has capacity for another claim.
    pub fn has_capacity(&self) -> bool {
        self.status == NodeStatus::Active && self.load < 1.0
    }
}
