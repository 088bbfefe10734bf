//! Cron-style schedules that materialise jobs.
//!
//! A single timer task polls the schedule set and emits due schedules
//! over a channel; the server runtime consumes them, clones the
//! context template into a fresh job, and submits it. Overlap policy
//! is skip: the consumer drops a firing when the previous invocation
//! of the same schedule is still active (tracked via a
//! `schedule:<id>` tag on materialised jobs).

use chrono::Utc;
use cron::Schedule as CronExpr;
use riposte_protocol::Schedule;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const TICK_INTERVAL: Duration = Duration::from_millis(500);

/// Tag applied to every job a schedule materialises.
pub fn schedule_tag(id: &str) -> String {
    format!("schedule:{}", id)
}

struct Entry {
    schedule: Schedule,
    cron: CronExpr,
}

pub struct Scheduler {
    entries: Mutex<HashMap<String, Entry>>,
    fire_tx: mpsc::Sender<Schedule>,
}

impl Scheduler {
    /// Returns the scheduler and the receiver of due firings.
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Schedule>) {
        let (tx, rx) = mpsc::channel(64);
        (
            Arc::new(Self {
                entries: Mutex::new(HashMap::new()),
                fire_tx: tx,
            }),
            rx,
        )
    }

    /// Add or replace a schedule. Fails on an invalid cron expression.
    pub fn add(&self, mut schedule: Schedule) -> Result<(), String> {
        let cron = CronExpr::from_str(&schedule.cron)
            .map_err(|e| format!("invalid cron expression '{}': {}", schedule.cron, e))?;
        schedule.next_fire = cron.upcoming(Utc).next();

        info!(
            schedule = %schedule.id,
            cron = %schedule.cron,
            next = ?schedule.next_fire,
            "schedule registered"
        );
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.insert(schedule.id.clone(), Entry { schedule, cron });
        Ok(())
    }

    pub fn remove(&self, id: &str) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        entries.remove(id).is_some()
    }

    /// Enable or disable without losing the definition. Disabled
    /// schedules are inert.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        match entries.get_mut(id) {
            Some(entry) => {
                entry.schedule.enabled = enabled;
                if enabled {
                    entry.schedule.next_fire = entry.cron.upcoming(Utc).next();
                }
                true
            }
            None => false,
        }
    }

    pub fn list(&self) -> Vec<Schedule> {
        let entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        let mut schedules: Vec<Schedule> =
            entries.values().map(|e| e.schedule.clone()).collect();
        schedules.sort_by(|a, b| a.id.cmp(&b.id));
        schedules
    }

    /// Start the timer task.
    pub fn spawn(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TICK_INTERVAL);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                scheduler.fire_due().await;
            }
        });
    }

    async fn fire_due(&self) {
        let due: Vec<Schedule> = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            let now = Utc::now();
            let mut due = Vec::new();
            for entry in entries.values_mut() {
                if !entry.schedule.enabled {
                    continue;
                }
                let Some(next) = entry.schedule.next_fire else {
                    continue;
                };
                if next <= now {
                    due.push(entry.schedule.clone());
                    entry.schedule.next_fire = entry.cron.upcoming(Utc).next();
                }
            }
            due
        };

        for schedule in due {
            debug!(schedule = %schedule.id, "schedule due");
            if self.fire_tx.send(schedule).await.is_err() {
                warn!("schedule consumer gone; timer stopping");
                return;
            }
        }
    }
}
