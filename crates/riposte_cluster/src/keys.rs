//! Shared-store key layout for cluster state.
//!
//! Everything is namespaced by cluster name:
//! - `nodes:<cluster>:<nodeId>` — node record, TTL-refreshed by heartbeat
//! - `jobs:<cluster>` — priority queue (sorted set)
//! - `delayed:<cluster>` — retry holding set, scored by ready time
//! - `job:<jobId>` — canonical job record (owned by the shared job store)
//! - `claimed:<cluster>:<nodeId>:<jobId>` — claim marker with TTL
//! - `dlq:<cluster>` — dead-letter set

pub fn node_key(cluster: &str, node_id: &str) -> String {
    format!("nodes:{}:{}", cluster, node_id)
}

pub fn node_prefix(cluster: &str) -> String {
    format!("nodes:{}:", cluster)
}

pub fn queue_set(cluster: &str) -> String {
    format!("jobs:{}", cluster)
}

pub fn delayed_set(cluster: &str) -> String {
    format!("delayed:{}", cluster)
}

pub fn claim_key(cluster: &str, node_id: &str, job_id: &str) -> String {
    format!("claimed:{}:{}:{}", cluster, node_id, job_id)
}

pub fn claim_prefix(cluster: &str) -> String {
    format!("claimed:{}:", cluster)
}

pub fn dlq_set(cluster: &str) -> String {
    format!("dlq:{}", cluster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_shapes() {
        assert_eq!(node_key("main", "n1"), "nodes:main:n1");
        assert_eq!(queue_set("main"), "jobs:main");
        assert_eq!(claim_key("main", "n1", "j9"), "claimed:main:n1:j9");
        assert_eq!(dlq_set("main"), "dlq:main");
        assert!(claim_key("main", "n1", "j9").starts_with(&claim_prefix("main")));
    }
}
