//! Node registry over the shared store.
//!
//! Each node refreshes its own record on every heartbeat. A node that
//! stops heartbeating goes stale and is marked inactive after three
//! missed intervals; after five it is evicted outright. Record TTLs
//! are long enough (six intervals) that the inactive marker is
//! observable before the key expires.

use crate::error::Result;
use crate::keys::{node_key, node_prefix};
use chrono::{Duration as ChronoDuration, Utc};
use riposte_protocol::defaults::MISSED_HEARTBEATS_BEFORE_INACTIVE;
use riposte_protocol::{NodeInfo, NodeStatus};
use riposte_store::CoordStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub struct NodeRegistry {
    coord: Arc<dyn CoordStore>,
    cluster: String,
    heartbeat_interval: Duration,
}

impl NodeRegistry {
    pub fn new(coord: Arc<dyn CoordStore>, cluster: impl Into<String>, heartbeat_interval: Duration) -> Self {
        Self {
            coord,
            cluster: cluster.into(),
            heartbeat_interval,
        }
    }

    /// Write (or refresh) a node record. The TTL outlives the
    /// staleness and eviction horizons so the janitor can observe the
    /// record aging.
    pub fn heartbeat(&self, node: &NodeInfo) -> Result<()> {
        let mut node = node.clone();
        node.last_seen = Utc::now();
        let key = node_key(&self.cluster, &node.id);
        let body = serde_json::to_string(&node)?;
        self.coord
            .set_with_ttl(&key, &body, self.heartbeat_interval * 6);
        debug!(node = %node.id, load = node.load, "heartbeat written");
        Ok(())
    }

    /// All currently visible node records, sorted by id.
    pub fn nodes(&self) -> Result<Vec<NodeInfo>> {
        let mut nodes = Vec::new();
        for key in self.coord.keys_with_prefix(&node_prefix(&self.cluster)) {
            if let Some(raw) = self.coord.get(&key) {
                nodes.push(serde_json::from_str::<NodeInfo>(&raw)?);
            }
        }
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(nodes)
    }

    /// Nodes whose `last_seen` is older than three heartbeat intervals.
    pub fn stale_nodes(&self) -> Result<Vec<NodeInfo>> {
        let horizon = Utc::now()
            - ChronoDuration::seconds(
                self.heartbeat_interval.as_secs() as i64
                    * MISSED_HEARTBEATS_BEFORE_INACTIVE as i64,
            );
        Ok(self
            .nodes()?
            .into_iter()
            .filter(|node| node.last_seen < horizon && node.status != NodeStatus::Inactive)
            .collect())
    }

    /// Nodes past the eviction horizon (five missed intervals).
    pub fn expired_nodes(&self) -> Result<Vec<NodeInfo>> {
        let horizon = Utc::now()
            - ChronoDuration::seconds(self.heartbeat_interval.as_secs() as i64 * 5);
        Ok(self
            .nodes()?
            .into_iter()
            .filter(|node| node.last_seen < horizon)
            .collect())
    }

    /// Overwrite a record as inactive (pre-eviction marker).
    pub fn mark_inactive(&self, node: &NodeInfo) -> Result<()> {
        let mut node = node.clone();
        node.status = NodeStatus::Inactive;
        let key = node_key(&self.cluster, &node.id);
        self.coord
            .set_with_ttl(&key, &serde_json::to_string(&node)?, self.heartbeat_interval * 6);
        Ok(())
    }

    /// Drop a node's record entirely.
    pub fn evict(&self, node_id: &str) {
        self.coord.del(&node_key(&self.cluster, node_id));
    }

    /// Is a node currently visible and not inactive?
    pub fn is_alive(&self, node_id: &str) -> bool {
        self.coord
            .get(&node_key(&self.cluster, node_id))
            .and_then(|raw| serde_json::from_str::<NodeInfo>(&raw).ok())
            .map(|node| node.status != NodeStatus::Inactive)
            .unwrap_or(false)
    }

    /// Lowest-load-wins eligibility: `node_id` may claim when no other
    /// active node reports a strictly lower load, ties broken by
    /// ascending node id.
    pub fn may_claim(&self, node_id: &str) -> Result<bool> {
        let nodes = self.nodes()?;
        let Some(me) = nodes.iter().find(|n| n.id == node_id) else {
            // Not registered yet; claiming is allowed so a lone node
            // can bootstrap
            return Ok(true);
        };
        if !me.has_capacity() {
            return Ok(false);
        }
        let eligible = nodes
            .iter()
            .filter(|n| n.has_capacity())
            .min_by(|a, b| {
                a.load
                    .partial_cmp(&b.load)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.id.cmp(&b.id))
            });
        Ok(eligible.map(|n| n.id == node_id).unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use riposte_store::MemoryCoordStore;

    fn registry() -> NodeRegistry {
        NodeRegistry::new(
            Arc::new(MemoryCoordStore::new()),
            "main",
            Duration::from_secs(30),
        )
    }

    #[test]
    fn test_heartbeat_and_list() {
        let registry = registry();
        registry.heartbeat(&NodeInfo::new("n2", "h", 1)).unwrap();
        registry.heartbeat(&NodeInfo::new("n1", "h", 1)).unwrap();

        let nodes = registry.nodes().unwrap();
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "n1");
        assert!(registry.is_alive("n1"));
        assert!(!registry.is_alive("ghost"));
    }

    #[test]
    fn test_lowest_load_wins_ties_by_id() {
        let registry = registry();
        let mut a = NodeInfo::new("a", "h", 1);
        a.load = 0.5;
        let mut b = NodeInfo::new("b", "h", 1);
        b.load = 0.25;
        registry.heartbeat(&a).unwrap();
        registry.heartbeat(&b).unwrap();

        assert!(!registry.may_claim("a").unwrap());
        assert!(registry.may_claim("b").unwrap());

        // Equal load: ascending id wins
        let mut b2 = b.clone();
        b2.load = 0.5;
        registry.heartbeat(&b2).unwrap();
        assert!(registry.may_claim("a").unwrap());
        assert!(!registry.may_claim("b").unwrap());
    }

    #[test]
    fn test_full_node_cannot_claim() {
        let registry = registry();
        let mut node = NodeInfo::new("n1", "h", 1);
        node.load = 1.0;
        registry.heartbeat(&node).unwrap();
        assert!(!registry.may_claim("n1").unwrap());
    }

    #[test]
    fn test_mark_inactive_visible() {
        let registry = registry();
        let node = NodeInfo::new("n1", "h", 1);
        registry.heartbeat(&node).unwrap();
        registry.mark_inactive(&node).unwrap();
        assert!(!registry.is_alive("n1"));
    }
}
