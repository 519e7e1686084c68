//! Task lifecycle: enqueue, status transitions, long-poll waits and ack.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::clock::Clock;
use crate::error::{BrokerError, Result};
use crate::events::{recv_for_task, Event, EventSink};
use crate::matcher::Matcher;
use crate::models::{Capability, Task, TaskHistoryEntry, TaskStatus, WorkspaceContext};
use crate::persistence::{HistoryFilter, Persistence};
use crate::registry::AgentRegistry;
use crate::waiter::{WaitOutcome, WaiterTable};

pub enum WaitForTaskOutcome {
    Task(Box<Task>),
    Evicted {
        reason: String,
        action: crate::models::EvictionAction,
    },
    TimedOut,
}

pub struct TaskQueue {
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
    matcher: Arc<Matcher>,
    waiters: Arc<WaiterTable>,
    registry: Arc<AgentRegistry>,
    clock: Arc<dyn Clock>,
}

impl TaskQueue {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        events: Arc<dyn EventSink>,
        matcher: Arc<Matcher>,
        waiters: Arc<WaiterTable>,
        registry: Arc<AgentRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            persistence,
            events,
            matcher,
            waiters,
            registry,
            clock,
        }
    }

    /// Inserts `task` as QUEUED, publishes `task:created`, then tries to
    /// wake a candidate waiter immediately.
    pub async fn enqueue(&self, mut task: Task) -> Result<Task> {
        task.status = TaskStatus::Queued;
        task.created_at_ms = self.clock.now_ms();
        self.persistence.insert_task(task.clone()).await?;
        info!(task_id = %task.id, "task enqueued");
        self.events.publish(Event::TaskCreated {
            task: Box::new(task.clone()),
        });
        let _ = self.matcher.find_and_reserve_agent(&task).await?;
        Ok(self.persistence.get_task(&task.id).await?.unwrap_or(task))
    }

    pub async fn update_status(&self, task_id: &str, status: TaskStatus) -> Result<Task> {
        let now = self.clock.now_ms();
        let updated = self.persistence.update_task_status(task_id, status, now).await?;
        self.events.publish(Event::TaskUpdated {
            id: task_id.to_string(),
            patch: serde_json::json!({ "status": status }),
        });
        if status.is_terminal() {
            self.events.publish(Event::TaskCompletion {
                id: task_id.to_string(),
                status,
            });
        }
        Ok(updated)
    }

    /// Moves a task back to QUEUED outside the strict transition table; the
    /// scheduler's recovery sweeps call this from several non-terminal
    /// statuses to re-home stuck or abandoned work.
    pub async fn force_retry(&self, task_id: &str) -> Result<Task> {
        let mut task = self
            .persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("task {task_id}")))?;
        if task.status.is_terminal() {
            return Err(BrokerError::Conflict(format!(
                "task {task_id} is terminal, cannot retry"
            )));
        }
        let now = self.clock.now_ms();
        task.assigned_to = None;
        task.record_transition(TaskStatus::Queued, now);
        self.persistence.update_task(task.clone()).await?;
        self.matcher.clear_reservation(task_id).await;
        self.events.publish(Event::TaskUpdated {
            id: task_id.to_string(),
            patch: serde_json::json!({ "status": "QUEUED", "assignedTo": null }),
        });
        Ok(task)
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        self.persistence.get_task(task_id).await
    }

    /// Same read as `get_task`, named separately because the contract lists
    /// it as its own read-through; there is no cache in front of
    /// `Persistence` for it to bypass.
    pub async fn get_task_from_db(&self, task_id: &str) -> Result<Option<Task>> {
        self.persistence.get_task(task_id).await
    }

    pub async fn get_task_history(&self, filter: HistoryFilter) -> Result<Vec<TaskHistoryEntry>> {
        self.persistence.get_history(filter).await
    }

    pub async fn get_all(&self) -> Result<Vec<Task>> {
        self.persistence.get_all_tasks().await
    }

    pub async fn get_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        self.persistence.get_tasks_by_status(status).await
    }

    pub async fn get_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        self.persistence.get_tasks_by_statuses(statuses).await
    }

    pub async fn get_assigned_tasks_for_agent(&self, agent_id: &str) -> Result<Vec<Task>> {
        self.persistence.get_tasks_by_assigned_to(agent_id).await
    }

    /// Long-poll used by agents: reserve immediately if work is available,
    /// otherwise suspend until matched, evicted, or timed out.
    pub async fn wait_for_task(
        &self,
        agent_id: &str,
        capabilities: Vec<Capability>,
        workspace_context: Option<WorkspaceContext>,
        timeout_ms: u64,
    ) -> Result<WaitForTaskOutcome> {
        if let Some(pending) = self.registry.pop_eviction(agent_id).await? {
            return Ok(WaitForTaskOutcome::Evicted {
                reason: pending.reason,
                action: pending.action,
            });
        }

        let agent = self
            .persistence
            .get_agent(agent_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;

        if let Some(task) = self.try_reserve_once(&agent, agent_id).await? {
            return Ok(WaitForTaskOutcome::Task(Box::new(task)));
        }

        let waiting_since = self.clock.now_ms();
        self.registry.mark_waiting(agent_id).await;
        let rx = self
            .waiters
            .register(agent_id, capabilities, workspace_context, waiting_since)
            .await;

        let result = tokio::time::timeout(Duration::from_millis(timeout_ms), rx).await;
        self.registry.clear_waiting(agent_id).await;
        self.waiters.remove(agent_id).await;

        match result {
            Ok(Ok(WaitOutcome::Task(task))) => {
                if let Some(pending) = self.registry.pop_eviction(agent_id).await? {
                    return Ok(WaitForTaskOutcome::Evicted {
                        reason: pending.reason,
                        action: pending.action,
                    });
                }
                Ok(WaitForTaskOutcome::Task(task))
            }
            Ok(Ok(WaitOutcome::Evicted { reason, action })) => {
                Ok(WaitForTaskOutcome::Evicted { reason, action })
            }
            Ok(Ok(WaitOutcome::Superseded)) | Ok(Err(_)) | Err(_) => {
                Ok(WaitForTaskOutcome::TimedOut)
            }
        }
    }

    /// Attempts the reservation inline, retrying once on a lost race, per
    /// the documented failure semantics.
    async fn try_reserve_once(&self, agent: &crate::models::Agent, agent_id: &str) -> Result<Option<Task>> {
        for _ in 0..2 {
            let Some(task) = self.matcher.find_pending_task_for_agent(agent).await? else {
                return Ok(None);
            };
            if let Some(reserved_to) = self.matcher.find_and_reserve_agent(&task).await? {
                if reserved_to == agent_id {
                    return Ok(self.persistence.get_task(&task.id).await?);
                }
            }
        }
        Ok(None)
    }

    /// Waits for `task_id` to reach a terminal status.
    pub async fn wait_for_task_completion(&self, task_id: &str, timeout_ms: u64) -> Result<Option<Task>> {
        if let Some(task) = self.persistence.get_task(task_id).await? {
            if task.status.is_terminal() {
                return Ok(Some(task));
            }
        } else {
            return Err(BrokerError::NotFound(format!("task {task_id}")));
        }

        let mut receiver = self.events.subscribe();
        let wait = async {
            loop {
                match recv_for_task(&mut receiver, task_id).await {
                    Some(envelope) => {
                        if matches!(envelope.event, Event::TaskCompletion { .. }) {
                            return self.persistence.get_task(task_id).await;
                        }
                    }
                    None => return Ok(None),
                }
            }
        };

        match tokio::time::timeout(Duration::from_millis(timeout_ms), wait).await {
            Ok(result) => result,
            Err(_) => Ok(None),
        }
    }

    /// Moves the reservation's task from PENDING_ACK/APPROVED_PENDING_ACK to
    /// ASSIGNED/IN_PROGRESS, asserting the caller holds the reservation.
    pub async fn ack_task(&self, task_id: &str, agent_id: &str) -> Result<Task> {
        let reservation = self
            .matcher
            .reservation_for(task_id)
            .await
            .ok_or_else(|| BrokerError::Conflict(format!("no reservation for task {task_id}")))?;
        if reservation.agent_id != agent_id {
            return Err(BrokerError::Conflict(format!(
                "task {task_id} is reserved for a different agent"
            )));
        }

        let task = self
            .persistence
            .get_task(task_id)
            .await?
            .ok_or_else(|| BrokerError::NotFound(format!("task {task_id}")))?;
        let next_status = match task.status {
            TaskStatus::PendingAck => TaskStatus::Assigned,
            TaskStatus::ApprovedPendingAck => TaskStatus::InProgress,
            other => {
                return Err(BrokerError::Conflict(format!(
                    "task {task_id} is not awaiting ack (status {other:?})"
                )))
            }
        };

        let updated = self.update_status(task_id, next_status).await?;
        self.matcher.clear_reservation(task_id).await;
        Ok(updated)
    }

    /// Moves REJECTED tasks back to QUEUED and re-checks BLOCKED/gated
    /// dependencies, called by the scheduler every tick.
    pub async fn check_blocked_tasks(&self) -> Result<usize> {
        let mut moved = 0;
        for task in self.persistence.get_tasks_by_status(TaskStatus::Rejected).await? {
            self.update_status(&task.id, TaskStatus::Queued).await?;
            moved += 1;
        }

        for task in self.persistence.get_tasks_by_status(TaskStatus::Blocked).await? {
            if task.dependencies.is_empty() {
                continue;
            }
            let mut satisfied = true;
            for dep_id in &task.dependencies {
                match self.persistence.get_task(dep_id).await? {
                    Some(dep) if dep.status == TaskStatus::Completed => continue,
                    _ => {
                        satisfied = false;
                        break;
                    }
                }
            }
            if satisfied {
                self.update_status(&task.id, TaskStatus::Queued).await?;
                moved += 1;
            }
        }
        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;
    use crate::events::BroadcastEventSink;
    use crate::models::{AgentSource, OriginKind, Priority, TaskOrigin, TaskTarget};
    use crate::persistence::InMemoryStore;
    use crate::registry::RegisterInput;

    fn wiring(clock: Arc<TestClock>) -> (Arc<dyn Persistence>, Arc<dyn EventSink>, Arc<Matcher>, Arc<WaiterTable>, Arc<AgentRegistry>) {
        let persistence: Arc<dyn Persistence> = InMemoryStore::shared();
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new());
        let waiters = WaiterTable::shared();
        let matcher = Arc::new(Matcher::new(
            persistence.clone(),
            events.clone(),
            waiters.clone(),
            clock.clone(),
            300_000,
        ));
        let registry = Arc::new(AgentRegistry::new(
            persistence.clone(),
            events.clone(),
            clock.clone(),
            300_000,
        ));
        (persistence, events, matcher, waiters, registry)
    }

    fn sample_task(id: &str, required: &[Capability]) -> Task {
        Task {
            id: id.into(),
            prompt: "do it".into(),
            title: None,
            priority: Priority::Normal,
            from: TaskOrigin {
                kind: OriginKind::User,
                id: "u".into(),
                name: "u".into(),
            },
            to: TaskTarget {
                agent_id: None,
                required_capabilities: required.iter().copied().collect(),
                workspace_id: None,
            },
            assigned_to: None,
            context: Default::default(),
            response: None,
            dependencies: vec![],
            messages: vec![],
            history: vec![],
            status: TaskStatus::Queued,
            created_at_ms: 0,
            completed_at_ms: None,
            last_progress_at_ms: None,
        }
    }

    #[tokio::test]
    async fn happy_path_reserve_ack_complete() {
        let clock = Arc::new(TestClock::new(0));
        let (persistence, events, matcher, waiters, registry) = wiring(clock.clone());
        let queue = TaskQueue::new(persistence, events, matcher, waiters, registry.clone(), clock);

        registry
            .register(RegisterInput {
                id: "a1".into(),
                display_name: Some("fixed".into()),
                role: None,
                capabilities: vec![Capability::CodeWriting],
                workspace_context: None,
                source: AgentSource::Ide,
                color: None,
            })
            .await
            .unwrap();

        let wait_future = queue.wait_for_task("a1", vec![Capability::CodeWriting], None, 2_000);
        let enqueue_future = queue.enqueue(sample_task("t1", &[Capability::CodeWriting]));

        let (wait_result, _) = tokio::join!(wait_future, enqueue_future);
        let outcome = wait_result.unwrap();
        let task = match outcome {
            WaitForTaskOutcome::Task(t) => *t,
            _ => panic!("expected task"),
        };
        assert_eq!(task.status, TaskStatus::PendingAck);

        let acked = queue.ack_task(&task.id, "a1").await.unwrap();
        assert_eq!(acked.status, TaskStatus::Assigned);

        let completed = queue.update_status(&task.id, TaskStatus::InProgress).await.unwrap();
        assert_eq!(completed.status, TaskStatus::InProgress);
        let completed = queue.update_status(&task.id, TaskStatus::Completed).await.unwrap();
        assert_eq!(completed.status, TaskStatus::Completed);
        assert!(completed.completed_at_ms.is_some());
    }

    #[tokio::test]
    async fn capability_mismatch_keeps_task_queued() {
        let clock = Arc::new(TestClock::new(0));
        let (persistence, events, matcher, waiters, registry) = wiring(clock.clone());
        let queue = TaskQueue::new(persistence, events, matcher, waiters, registry.clone(), clock);

        registry
            .register(RegisterInput {
                id: "a1".into(),
                display_name: Some("fixed".into()),
                role: None,
                capabilities: vec![Capability::DocWriting],
                workspace_context: None,
                source: AgentSource::Ide,
                color: None,
            })
            .await
            .unwrap();

        queue
            .enqueue(sample_task("t1", &[Capability::CodeWriting]))
            .await
            .unwrap();

        let outcome = queue
            .wait_for_task("a1", vec![Capability::DocWriting], None, 50)
            .await
            .unwrap();
        assert!(matches!(outcome, WaitForTaskOutcome::TimedOut));

        let task = queue.get_task("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn ack_twice_the_second_is_conflict() {
        let clock = Arc::new(TestClock::new(0));
        let (persistence, events, matcher, waiters, registry) = wiring(clock.clone());
        let queue = TaskQueue::new(persistence, events, matcher, waiters, registry.clone(), clock);

        registry
            .register(RegisterInput {
                id: "a1".into(),
                display_name: Some("fixed".into()),
                role: None,
                capabilities: vec![Capability::CodeWriting],
                workspace_context: None,
                source: AgentSource::Ide,
                color: None,
            })
            .await
            .unwrap();

        let wait_future = queue.wait_for_task("a1", vec![Capability::CodeWriting], None, 2_000);
        let enqueue_future = queue.enqueue(sample_task("t1", &[Capability::CodeWriting]));
        let (wait_result, _) = tokio::join!(wait_future, enqueue_future);
        let task = match wait_result.unwrap() {
            WaitForTaskOutcome::Task(t) => *t,
            _ => panic!("expected task"),
        };

        queue.ack_task(&task.id, "a1").await.unwrap();
        let err = queue.ack_task(&task.id, "a1").await.unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::Conflict);
    }

    #[tokio::test]
    async fn get_task_history_reports_the_acking_agent() {
        let clock = Arc::new(TestClock::new(0));
        let (persistence, events, matcher, waiters, registry) = wiring(clock.clone());
        let queue = TaskQueue::new(persistence, events, matcher, waiters, registry.clone(), clock);

        registry
            .register(RegisterInput {
                id: "a1".into(),
                display_name: Some("fixed".into()),
                role: None,
                capabilities: vec![Capability::CodeWriting],
                workspace_context: None,
                source: AgentSource::Ide,
                color: None,
            })
            .await
            .unwrap();

        let wait_future = queue.wait_for_task("a1", vec![Capability::CodeWriting], None, 2_000);
        let enqueue_future = queue.enqueue(sample_task("t1", &[Capability::CodeWriting]));
        let (wait_result, _) = tokio::join!(wait_future, enqueue_future);
        let task = match wait_result.unwrap() {
            WaitForTaskOutcome::Task(t) => *t,
            _ => panic!("expected task"),
        };
        queue.ack_task(&task.id, "a1").await.unwrap();

        let from_db = queue.get_task_from_db(&task.id).await.unwrap().unwrap();
        assert_eq!(from_db.status, TaskStatus::Assigned);

        let history = queue
            .get_task_history(crate::persistence::HistoryFilter {
                status: Some(TaskStatus::Assigned),
                agent_id: Some("a1".into()),
                limit: 10,
                offset: 0,
            })
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].task_id, task.id);
    }
}
