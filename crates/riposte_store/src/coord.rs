//! Shared coordination store interface.
//!
//! The cluster layer and the shared job-store backend speak to a
//! key-value store with TTLs plus sorted sets whose pops are atomic.
//! The in-process implementation below provides those primitives under
//! one mutex; a networked deployment substitutes a store with the same
//! contract.

use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Sorted-set score: ordered by `primary`, ties broken by `secondary`.
/// Queue producers encode priority into `primary` and enqueue time
/// into `secondary`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Score {
    pub primary: i64,
    pub secondary: i64,
}

impl Score {
    pub fn new(primary: i64, secondary: i64) -> Self {
        Self { primary, secondary }
    }
}

/// Atomic key-value + sorted-set primitives.
///
/// Every method is linearizable with respect to the others; claim
/// protocols rely on `zpop_min` being a single atomic take.
pub trait CoordStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str);
    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration);
    fn del(&self, key: &str) -> bool;
    fn keys_with_prefix(&self, prefix: &str) -> Vec<String>;

    fn zadd(&self, set: &str, member: &str, score: Score);
    fn zrem(&self, set: &str, member: &str) -> bool;
    /// Atomically remove and return the lowest-scored member.
    fn zpop_min(&self, set: &str) -> Option<(String, Score)>;
    /// Members in score order; `rev` walks from the highest score.
    fn zrange(&self, set: &str, limit: usize, rev: bool) -> Vec<(String, Score)>;
    fn zcard(&self, set: &str) -> usize;
}

#[derive(Default)]
struct Tables {
    kv: HashMap<String, (String, Option<Instant>)>,
    zsets: HashMap<String, BTreeSet<(Score, String)>>,
}

impl Tables {
    fn expire(&mut self, now: Instant) {
        self.kv
            .retain(|_, (_, deadline)| deadline.map(|d| d > now).unwrap_or(true));
    }
}

/// In-process coordination store: all tables behind a single mutex, so
/// each operation is trivially atomic. TTLs are enforced lazily on
/// read.
#[derive(Default)]
pub struct MemoryCoordStore {
    tables: Mutex<Tables>,
}

impl MemoryCoordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoordStore for MemoryCoordStore {
    fn get(&self, key: &str) -> Option<String> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.expire(Instant::now());
        tables.kv.get(key).map(|(value, _)| value.clone())
    }

    fn set(&self, key: &str, value: &str) {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.kv.insert(key.to_string(), (value.to_string(), None));
    }

    fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.kv.insert(
            key.to_string(),
            (value.to_string(), Some(Instant::now() + ttl)),
        );
    }

    fn del(&self, key: &str) -> bool {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.kv.remove(key).is_some()
    }

    fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.expire(Instant::now());
        let mut keys: Vec<String> = tables
            .kv
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    fn zadd(&self, set: &str, member: &str, score: Score) {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let zset = tables.zsets.entry(set.to_string()).or_default();
        // A member appears at most once; re-adding moves it
        zset.retain(|(_, m)| m != member);
        zset.insert((score, member.to_string()));
    }

    fn zrem(&self, set: &str, member: &str) -> bool {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let Some(zset) = tables.zsets.get_mut(set) else {
            return false;
        };
        let before = zset.len();
        zset.retain(|(_, m)| m != member);
        zset.len() != before
    }

    fn zpop_min(&self, set: &str) -> Option<(String, Score)> {
        let mut tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let zset = tables.zsets.get_mut(set)?;
        let head = zset.iter().next().cloned()?;
        zset.remove(&head);
        let (score, member) = head;
        Some((member, score))
    }

    fn zrange(&self, set: &str, limit: usize, rev: bool) -> Vec<(String, Score)> {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        let Some(zset) = tables.zsets.get(set) else {
            return Vec::new();
        };
        let mapped = |item: &(Score, String)| (item.1.clone(), item.0);
        if rev {
            zset.iter().rev().take(limit).map(mapped).collect()
        } else {
            zset.iter().take(limit).map(mapped).collect()
        }
    }

    fn zcard(&self, set: &str) -> usize {
        let tables = self.tables.lock().unwrap_or_else(|p| p.into_inner());
        tables.zsets.get(set).map(BTreeSet::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kv_roundtrip_and_delete() {
        let store = MemoryCoordStore::new();
        store.set("a", "1");
        assert_eq!(store.get("a"), Some("1".to_string()));
        assert!(store.del("a"));
        assert!(!store.del("a"));
        assert_eq!(store.get("a"), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let store = MemoryCoordStore::new();
        store.set_with_ttl("ephemeral", "x", Duration::from_millis(20));
        assert!(store.get("ephemeral").is_some());
        std::thread::sleep(Duration::from_millis(40));
        assert!(store.get("ephemeral").is_none());
    }

    #[test]
    fn test_keys_with_prefix_sorted() {
        let store = MemoryCoordStore::new();
        store.set("nodes:main:b", "");
        store.set("nodes:main:a", "");
        store.set("jobs:main", "");
        assert_eq!(
            store.keys_with_prefix("nodes:main:"),
            vec!["nodes:main:a".to_string(), "nodes:main:b".to_string()]
        );
    }

    #[test]
    fn test_zset_ordering_and_pop() {
        let store = MemoryCoordStore::new();
        store.zadd("q", "low", Score::new(-1, 100));
        store.zadd("q", "high", Score::new(-10, 200));
        store.zadd("q", "mid", Score::new(-5, 50));

        // Lowest primary first: high priority encoded as negative
        let (member, _) = store.zpop_min("q").unwrap();
        assert_eq!(member, "high");
        let (member, _) = store.zpop_min("q").unwrap();
        assert_eq!(member, "mid");
        let (member, _) = store.zpop_min("q").unwrap();
        assert_eq!(member, "low");
        assert!(store.zpop_min("q").is_none());
    }

    #[test]
    fn test_zset_ties_broken_by_secondary() {
        let store = MemoryCoordStore::new();
        store.zadd("q", "newer", Score::new(0, 200));
        store.zadd("q", "older", Score::new(0, 100));
        let (member, _) = store.zpop_min("q").unwrap();
        assert_eq!(member, "older");
    }

    #[test]
    fn test_zadd_moves_existing_member() {
        let store = MemoryCoordStore::new();
        store.zadd("q", "job", Score::new(5, 0));
        store.zadd("q", "job", Score::new(1, 0));
        assert_eq!(store.zcard("q"), 1);
        let (_, score) = store.zpop_min("q").unwrap();
        assert_eq!(score.primary, 1);
    }

    #[test]
    fn test_concurrent_pop_takes_each_member_once() {
        use std::sync::Arc;

        let store = Arc::new(MemoryCoordStore::new());
        for i in 0..100 {
            store.zadd("q", &format!("job-{i}"), Score::new(i, 0));
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(std::thread::spawn(move || {
                let mut taken = Vec::new();
                while let Some((member, _)) = store.zpop_min("q") {
                    taken.push(member);
                }
                taken
            }));
        }

        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100, "every member claimed exactly once");
    }
}
