//! Pure scoring function plus the reservation mutex that couples a task to
//! exactly one waiting agent.

use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::clock::Clock;
use crate::error::Result;
use crate::events::{Event, EventSink};
use crate::models::{Agent, Reservation, Task, TaskStatus};
use crate::persistence::Persistence;
use crate::waiter::{WaitOutcome, WaiterHandle, WaiterTable};

const WEIGHT_CAPABILITY: f64 = 0.40;
const WEIGHT_WORKSPACE: f64 = 0.30;
const WEIGHT_AGENT_PREFERENCE: f64 = 0.20;
const WEIGHT_FRESHNESS: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Score {
    pub eligible: bool,
    pub value: f64,
}

/// Scores how well `agent` fits `task`. Pure: equal inputs give equal
/// outputs, no I/O, no hidden state.
pub fn score_agent(task: &Task, agent: &Agent, waiting_since_ms: u64, now_ms: u64, max_wait_ms: u64) -> Score {
    if let Some(workspace_id) = &task.to.workspace_id {
        match &agent.workspace_context {
            Some(ctx) if &ctx.repo_id != workspace_id => {
                return Score {
                    eligible: false,
                    value: 0.0,
                };
            }
            _ => {}
        }
    }
    if !task.to.required_capabilities.is_empty()
        && !task
            .to
            .required_capabilities
            .iter()
            .all(|c| agent.capabilities.contains(c))
    {
        return Score {
            eligible: false,
            value: 0.0,
        };
    }

    let capability_fraction = if task.to.required_capabilities.is_empty() {
        1.0
    } else {
        let covered = task
            .to
            .required_capabilities
            .iter()
            .filter(|c| agent.capabilities.contains(c))
            .count();
        covered as f64 / task.to.required_capabilities.len() as f64
    };

    let workspace_score = match (&task.to.workspace_id, &agent.workspace_context) {
        (Some(wid), Some(ctx)) if &ctx.repo_id == wid => 1.0,
        (None, _) => 0.7,
        _ => 0.7,
    };

    let preference_score = if task.to.agent_id.as_deref() == Some(agent.id.as_str()) {
        1.0
    } else {
        0.0
    };

    let freshness_score = if max_wait_ms == 0 {
        0.0
    } else {
        let waited = now_ms.saturating_sub(waiting_since_ms).min(max_wait_ms);
        waited as f64 / max_wait_ms as f64
    };

    let value = capability_fraction * WEIGHT_CAPABILITY
        + workspace_score * WEIGHT_WORKSPACE
        + preference_score * WEIGHT_AGENT_PREFERENCE
        + freshness_score * WEIGHT_FRESHNESS;

    Score {
        eligible: true,
        value,
    }
}

/// Filters to eligible agents, sorts by score descending, tie-breaks by
/// earliest `waiting_since_ms` then lexicographic agent id. Deterministic.
pub fn find_best_agent<'a>(
    task: &Task,
    candidates: &'a [(Agent, WaiterHandle)],
    now_ms: u64,
    max_wait_ms: u64,
) -> Option<&'a Agent> {
    candidates
        .iter()
        .filter_map(|(agent, waiter)| {
            let score = score_agent(task, agent, waiter.waiting_since_ms, now_ms, max_wait_ms);
            score.eligible.then_some((agent, waiter, score.value))
        })
        .max_by(|(a_agent, a_waiter, a_score), (b_agent, b_waiter, b_score)| {
            a_score
                .partial_cmp(b_score)
                .unwrap()
                .then_with(|| b_waiter.waiting_since_ms.cmp(&a_waiter.waiting_since_ms))
                .then_with(|| b_agent.id.cmp(&a_agent.id))
        })
        .map(|(agent, _, _)| agent)
}

/// Guards the composite op described in the concurrency model: scan
/// waiters, pick one, write the status transition and reservation, remove
/// the waiter, signal its channel. The only long-lived critical section.
pub struct Matcher {
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
    waiters: Arc<WaiterTable>,
    clock: Arc<dyn Clock>,
    reservations: Mutex<std::collections::HashMap<String, Reservation>>,
    max_wait_ms: u64,
}

impl Matcher {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        events: Arc<dyn EventSink>,
        waiters: Arc<WaiterTable>,
        clock: Arc<dyn Clock>,
        max_wait_ms: u64,
    ) -> Self {
        Self {
            persistence,
            events,
            waiters,
            clock,
            reservations: Mutex::new(std::collections::HashMap::new()),
            max_wait_ms,
        }
    }

    /// Scans tasks in `{QUEUED, APPROVED_QUEUED}` with satisfied
    /// dependencies, scores each against the given agent, returns the
    /// highest scoring eligible one (tie-break: priority desc, then oldest).
    pub async fn find_pending_task_for_agent(&self, agent: &Agent) -> Result<Option<Task>> {
        let candidates = self
            .persistence
            .get_tasks_by_statuses(&[TaskStatus::Queued, TaskStatus::ApprovedQueued])
            .await?;
        let now = self.clock.now_ms();

        let mut eligible = Vec::new();
        for task in candidates {
            if !self.dependencies_satisfied(&task).await? {
                continue;
            }
            let score = score_agent(&task, agent, now, now, self.max_wait_ms);
            if score.eligible {
                eligible.push((task, score.value));
            }
        }

        eligible.sort_by(|(a_task, a_score), (b_task, b_score)| {
            b_score
                .partial_cmp(a_score)
                .unwrap()
                .then_with(|| b_task.priority.cmp(&a_task.priority))
                .then_with(|| a_task.created_at_ms.cmp(&b_task.created_at_ms))
        });

        Ok(eligible.into_iter().next().map(|(t, _)| t))
    }

    async fn dependencies_satisfied(&self, task: &Task) -> Result<bool> {
        for dep_id in &task.dependencies {
            match self.persistence.get_task(dep_id).await? {
                Some(dep) if dep.status == TaskStatus::Completed => continue,
                _ => return Ok(false),
            }
        }
        Ok(true)
    }

    /// Reserves the best-matching waiting agent for `task`, under the
    /// reservation mutex. Returns the agent id that received the task.
    pub async fn find_and_reserve_agent(&self, task: &Task) -> Result<Option<String>> {
        let _guard = self.reservations.lock().await;
        let waiters = self.waiters.snapshot().await;
        if waiters.is_empty() {
            return Ok(None);
        }

        let mut pairs = Vec::with_capacity(waiters.len());
        for (agent_id, handle) in &waiters {
            if let Some(agent) = self.persistence.get_agent(agent_id).await? {
                pairs.push((agent, handle.clone()));
            }
        }

        let now = self.clock.now_ms();
        let chosen = find_best_agent(task, &pairs, now, self.max_wait_ms).cloned();
        let Some(agent) = chosen else {
            return Ok(None);
        };

        let next_status = match task.status {
            TaskStatus::Queued => TaskStatus::PendingAck,
            TaskStatus::ApprovedQueued => TaskStatus::ApprovedPendingAck,
            _ => return Ok(None),
        };

        let mut updated = self
            .persistence
            .update_task_status(&task.id, next_status, now)
            .await?;
        updated.assigned_to = Some(agent.id.clone());
        self.persistence.update_task(updated.clone()).await?;

        self.record_reservation(Reservation {
            task_id: task.id.clone(),
            agent_id: agent.id.clone(),
            reserved_at_ms: now,
        })
        .await;

        let signalled = self
            .waiters
            .take_and_signal(&agent.id, WaitOutcome::Task(Box::new(updated.clone())))
            .await;
        debug!(task_id = %task.id, agent_id = %agent.id, signalled, "task reserved");

        self.events.publish(Event::TaskUpdated {
            id: task.id.clone(),
            patch: serde_json::json!({ "status": next_status, "assignedTo": agent.id }),
        });

        Ok(Some(agent.id))
    }

    async fn record_reservation(&self, reservation: Reservation) {
        self.reservations
            .lock()
            .await
            .insert(reservation.task_id.clone(), reservation);
    }

    pub async fn reservation_for(&self, task_id: &str) -> Option<Reservation> {
        self.reservations.lock().await.get(task_id).cloned()
    }

    pub async fn clear_reservation(&self, task_id: &str) -> Option<Reservation> {
        self.reservations.lock().await.remove(task_id)
    }

    pub async fn reservations_older_than(&self, cutoff_ms: u64) -> Vec<Reservation> {
        self.reservations
            .lock()
            .await
            .values()
            .filter(|r| r.reserved_at_ms < cutoff_ms)
            .cloned()
            .collect()
    }
}
