//! Distributed priority queue over the shared store.
//!
//! The main queue orders by priority (higher first), then enqueue time
//! (older first), encoded as a sorted-set score of
//! `(-priority, enqueue_millis)` so a single atomic pop yields the next
//! eligible job. Retries wait in a separate delayed set scored by ready
//! time; the janitor pumps due entries back into the main queue, so a
//! delayed high-priority job never blocks the head.

use crate::keys::{delayed_set, dlq_set, queue_set};
use chrono::{DateTime, Utc};
use riposte_protocol::JobId;
use riposte_store::{CoordStore, Score};
use std::sync::Arc;
use tracing::debug;

pub struct ClusterQueue {
    coord: Arc<dyn CoordStore>,
    cluster: String,
}

impl ClusterQueue {
    pub fn new(coord: Arc<dyn CoordStore>, cluster: impl Into<String>) -> Self {
        Self {
            coord,
            cluster: cluster.into(),
        }
    }

    /// Queue a job for immediate claiming.
    pub fn enqueue(&self, id: &JobId, priority: i64) {
        self.coord.zadd(
            &queue_set(&self.cluster),
            id.as_str(),
            Score::new(-priority, Utc::now().timestamp_millis()),
        );
        debug!(job = %id, priority, "job enqueued");
    }

    /// Queue a retry that becomes claimable at `ready_at`.
    pub fn enqueue_delayed(&self, id: &JobId, priority: i64, ready_at: DateTime<Utc>) {
        self.coord.zadd(
            &delayed_set(&self.cluster),
            id.as_str(),
            // Priority rides in the secondary slot so pumping restores it
            Score::new(ready_at.timestamp_millis(), -priority),
        );
        debug!(job = %id, ready_at = %ready_at, "retry scheduled");
    }

    /// Atomically take the head of the queue.
    pub fn pop(&self) -> Option<JobId> {
        self.coord
            .zpop_min(&queue_set(&self.cluster))
            .map(|(member, _)| JobId::from(member))
    }

    /// Remove a job from the queue (cancellation path).
    pub fn remove(&self, id: &JobId) -> bool {
        self.coord.zrem(&queue_set(&self.cluster), id.as_str())
            | self.coord.zrem(&delayed_set(&self.cluster), id.as_str())
    }

    /// Move due delayed entries into the main queue. Returns how many
    /// became claimable.
    pub fn pump_delayed(&self) -> usize {
        let now = Utc::now().timestamp_millis();
        let mut moved = 0;
        loop {
            let Some((member, score)) = self.coord.zpop_min(&delayed_set(&self.cluster)) else {
                break;
            };
            if score.primary > now {
                // Not due yet; put it back and stop (set is time-ordered)
                self.coord
                    .zadd(&delayed_set(&self.cluster), &member, score);
                break;
            }
            let priority = -score.secondary;
            self.enqueue(&JobId::from(member), priority);
            moved += 1;
        }
        moved
    }

    pub fn depth(&self) -> usize {
        self.coord.zcard(&queue_set(&self.cluster))
    }

    pub fn delayed_depth(&self) -> usize {
        self.coord.zcard(&delayed_set(&self.cluster))
    }

    /// Park a job in the dead-letter set.
    pub fn dead_letter(&self, id: &JobId) {
        self.coord.zadd(
            &dlq_set(&self.cluster),
            id.as_str(),
            Score::new(Utc::now().timestamp_millis(), 0),
        );
    }

    /// Dead-lettered job ids, oldest first.
    pub fn dlq(&self, limit: usize) -> Vec<JobId> {
        self.coord
            .zrange(&dlq_set(&self.cluster), limit, false)
            .into_iter()
            .map(|(member, _)| JobId::from(member))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use riposte_store::MemoryCoordStore;

    fn queue() -> ClusterQueue {
        ClusterQueue::new(Arc::new(MemoryCoordStore::new()), "main")
    }

    #[test]
    fn test_priority_order_then_fifo() {
        let queue = queue();
        let low = JobId::from("low");
        let high = JobId::from("high");
        queue.enqueue(&low, 1);
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue.enqueue(&high, 10);

        // Higher priority wins even though it enqueued later
        assert_eq!(queue.pop(), Some(high));
        assert_eq!(queue.pop(), Some(low));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_same_priority_is_fifo() {
        let queue = queue();
        let first = JobId::from("first");
        let second = JobId::from("second");
        queue.enqueue(&first, 5);
        std::thread::sleep(std::time::Duration::from_millis(5));
        queue.enqueue(&second, 5);

        assert_eq!(queue.pop(), Some(first));
        assert_eq!(queue.pop(), Some(second));
    }

    #[test]
    fn test_delayed_entries_pump_when_due() {
        let queue = queue();
        let due = JobId::from("due");
        let future = JobId::from("future");
        queue.enqueue_delayed(&due, 3, Utc::now() - ChronoDuration::seconds(1));
        queue.enqueue_delayed(&future, 3, Utc::now() + ChronoDuration::seconds(3600));

        assert_eq!(queue.pump_delayed(), 1);
        assert_eq!(queue.depth(), 1);
        assert_eq!(queue.delayed_depth(), 1);
        assert_eq!(queue.pop(), Some(due));
    }

    #[test]
    fn test_pump_restores_priority() {
        let queue = queue();
        let urgent = JobId::from("urgent");
        let routine = JobId::from("routine");
        queue.enqueue_delayed(&urgent, 10, Utc::now() - ChronoDuration::seconds(1));
        queue.enqueue(&routine, 1);

        queue.pump_delayed();
        assert_eq!(queue.pop(), Some(urgent));
    }

    #[test]
    fn test_remove_covers_both_sets() {
        let queue = queue();
        let queued = JobId::from("queued");
        let delayed = JobId::from("delayed");
        queue.enqueue(&queued, 0);
        queue.enqueue_delayed(&delayed, 0, Utc::now() + ChronoDuration::seconds(60));

        assert!(queue.remove(&queued));
        assert!(queue.remove(&delayed));
        assert!(!queue.remove(&queued));
        assert_eq!(queue.depth() + queue.delayed_depth(), 0);
    }

    #[test]
    fn test_dead_letter_listing() {
        let queue = queue();
        queue.dead_letter(&JobId::from("a"));
        queue.dead_letter(&JobId::from("b"));
        assert_eq!(queue.dlq(10).len(), 2);
    }
}
