//! Periodic maintenance sweeps: ack timeouts, blocked-task re-evaluation,
//! pending-task assignment, stale in-progress rebalancing and orphan
//! detection. One background loop, never re-entrant.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::info;

use crate::clock::Clock;
use crate::events::{Event, EventSink};
use crate::matcher::Matcher;
use crate::models::TaskStatus;
use crate::persistence::Persistence;
use crate::queue::TaskQueue;

pub struct SchedulerConfig {
    pub tick_interval_ms: u64,
    pub ack_timeout_ms: u64,
    pub assigned_timeout_ms: u64,
    pub orphan_timeout_ms: u64,
}

pub struct Scheduler {
    queue: Arc<TaskQueue>,
    matcher: Arc<Matcher>,
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    config: SchedulerConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, Default)]
pub struct TickSummary {
    pub retried: usize,
    pub unblocked: usize,
    pub assigned: usize,
    pub staled: usize,
    pub orphaned: usize,
}

impl Scheduler {
    pub fn new(
        queue: Arc<TaskQueue>,
        matcher: Arc<Matcher>,
        persistence: Arc<dyn Persistence>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            queue,
            matcher,
            persistence,
            events,
            clock,
            config,
            handle: Mutex::new(None),
        }
    }

    /// Spawns the single owning loop; calling `start` twice replaces the
    /// previous handle (aborting it), which structurally prevents
    /// re-entrancy.
    pub async fn start(self: &Arc<Self>) {
        let scheduler = self.clone();
        let interval = Duration::from_millis(self.config.tick_interval_ms);
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let summary = scheduler.tick().await;
                info!(
                    retried = summary.retried,
                    unblocked = summary.unblocked,
                    assigned = summary.assigned,
                    staled = summary.staled,
                    orphaned = summary.orphaned,
                    "scheduler tick complete"
                );
            }
        });
        let mut guard = self.handle.lock().await;
        if let Some(previous) = guard.take() {
            previous.abort();
        }
        *guard = Some(handle);
    }

    pub async fn shutdown(&self) {
        if let Some(handle) = self.handle.lock().await.take() {
            handle.abort();
        }
    }

    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        summary.retried = self.requeue_stuck_tasks().await;
        summary.unblocked = match self.queue.check_blocked_tasks().await {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "check_blocked_tasks failed");
                0
            }
        };
        summary.assigned = self.assign_pending_tasks().await;
        summary.staled = self.rebalance_stale_tasks().await;
        summary.orphaned = self.detect_orphans().await;
        summary
    }

    async fn requeue_stuck_tasks(&self) -> usize {
        let now = self.clock.now_ms();
        let cutoff = now.saturating_sub(self.config.ack_timeout_ms);
        let stuck = self.matcher.reservations_older_than(cutoff).await;
        let mut retried = 0;
        for reservation in stuck {
            if self.queue.force_retry(&reservation.task_id).await.is_ok() {
                self.events.publish(Event::TaskRetry {
                    id: reservation.task_id.clone(),
                });
                retried += 1;
            }
        }
        retried
    }

    /// Fans the per-task reservation attempts out concurrently; the
    /// reservation mutex inside the matcher still serializes the actual
    /// assignment, this only overlaps each task's persistence reads.
    async fn assign_pending_tasks(&self) -> usize {
        let pending = self
            .persistence
            .get_tasks_by_statuses(&[TaskStatus::Queued, TaskStatus::ApprovedQueued])
            .await
            .unwrap_or_default();
        let attempts = pending
            .iter()
            .map(|task| self.matcher.find_and_reserve_agent(task));
        futures::future::join_all(attempts)
            .await
            .into_iter()
            .zip(pending.iter())
            .filter(|(result, task)| match result {
                Ok(Some(_)) => true,
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(task_id = %task.id, error = %e, "assignment sweep failed");
                    false
                }
            })
            .count()
    }

    async fn rebalance_stale_tasks(&self) -> usize {
        let now = self.clock.now_ms();
        let mut staled = 0;
        let in_progress = self
            .persistence
            .get_tasks_by_status(TaskStatus::InProgress)
            .await
            .unwrap_or_default();
        for task in in_progress {
            let reference = task.last_progress_at_ms.unwrap_or(task.created_at_ms);
            if now.saturating_sub(reference) > self.config.assigned_timeout_ms {
                if self.queue.force_retry(&task.id).await.is_ok() {
                    self.events.publish(Event::TaskStale { id: task.id.clone() });
                    staled += 1;
                }
            }
        }
        staled
    }

    async fn detect_orphans(&self) -> usize {
        let now = self.clock.now_ms();
        let mut orphaned = 0;
        let agents = self.persistence.get_all_agents().await.unwrap_or_default();
        for agent in agents {
            if now.saturating_sub(agent.last_seen_ms) <= self.config.orphan_timeout_ms {
                continue;
            }
            let assigned = self
                .persistence
                .get_tasks_by_assigned_to(&agent.id)
                .await
                .unwrap_or_default();
            for task in assigned.into_iter().filter(|t| !t.status.is_terminal()) {
                if self.queue.force_retry(&task.id).await.is_ok() {
                    orphaned += 1;
                }
            }
        }
        orphaned
    }
}
