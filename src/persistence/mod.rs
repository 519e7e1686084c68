//! Typed CRUD over every aggregate, with one production implementation
//! backed by in-process maps. A later durable backend substitutes this
//! trait without touching the registry, queue, matcher or scheduler.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{BrokerError, Result};
use crate::models::{
    Agent, EvictionAction, Message, ProgressEntry, ReviewComment, Task, TaskHistoryEntry, TaskStatus,
};

/// Filter/paging parameters for `Persistence::get_history`, mirroring the
/// `getHistory{status?, agentId?, limit, offset}` read surface.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub status: Option<TaskStatus>,
    pub agent_id: Option<String>,
    pub limit: usize,
    pub offset: usize,
}

#[async_trait]
pub trait Persistence: Send + Sync {
    async fn insert_agent(&self, agent: Agent) -> Result<()>;
    async fn update_agent(&self, agent: Agent) -> Result<()>;
    async fn heartbeat_agent(&self, id: &str, ts_ms: u64) -> Result<()>;
    async fn get_agent(&self, id: &str) -> Result<Option<Agent>>;
    async fn get_agent_by_display_name_ci(&self, display_name: &str) -> Result<Option<Agent>>;
    async fn get_all_agents(&self) -> Result<Vec<Agent>>;
    async fn get_agents_by_capability(&self, capability: crate::models::Capability) -> Result<Vec<Agent>>;
    async fn delete_agent(&self, id: &str) -> Result<()>;
    async fn set_eviction(&self, id: &str, reason: String, action: EvictionAction, ts_ms: u64) -> Result<()>;
    async fn clear_eviction(&self, id: &str) -> Result<()>;

    async fn insert_task(&self, task: Task) -> Result<()>;
    async fn update_task(&self, task: Task) -> Result<()>;
    async fn update_task_status(
        &self,
        id: &str,
        status: TaskStatus,
        at_ms: u64,
    ) -> Result<Task>;
    async fn get_task(&self, id: &str) -> Result<Option<Task>>;
    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>>;
    async fn get_tasks_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>>;
    async fn get_tasks_by_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>>;
    async fn get_active_tasks(&self) -> Result<Vec<Task>>;
    async fn get_all_tasks(&self) -> Result<Vec<Task>>;
    async fn get_history(&self, filter: HistoryFilter) -> Result<Vec<TaskHistoryEntry>>;

    async fn append_message(&self, task_id: &str, message: Message) -> Result<()>;
    async fn get_messages(&self, task_id: &str) -> Result<Vec<Message>>;
    async fn mark_user_comments_read(&self, task_id: &str) -> Result<usize>;

    async fn append_progress(&self, entry: ProgressEntry) -> Result<()>;
    async fn get_last_progress_at(&self, task_id: &str) -> Result<Option<u64>>;

    async fn insert_review_comment(&self, comment: ReviewComment) -> Result<()>;
    async fn list_review_comments(&self, task_id: &str, unresolved_only: bool) -> Result<Vec<ReviewComment>>;
    async fn resolve_review_comment(&self, comment_id: &str, response: Option<String>) -> Result<()>;
}

/// A single production implementation: per-table `RwLock<HashMap<..>>`
/// guards, suitable for one process. Mirrors the repository-trait split the
/// orchestrator used for swappable task storage, generalized to every
/// aggregate this engine owns.
#[derive(Default)]
pub struct InMemoryStore {
    agents: RwLock<HashMap<String, Agent>>,
    tasks: RwLock<HashMap<String, Task>>,
    messages: RwLock<HashMap<String, Vec<Message>>>,
    progress: RwLock<HashMap<String, Vec<ProgressEntry>>>,
    review_comments: RwLock<HashMap<String, ReviewComment>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

#[async_trait]
impl Persistence for InMemoryStore {
    async fn insert_agent(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.write().await;
        if agents.contains_key(&agent.id) {
            return Err(BrokerError::Conflict(format!("agent {} already exists", agent.id)));
        }
        debug!(agent_id = %agent.id, "agent inserted");
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn update_agent(&self, agent: Agent) -> Result<()> {
        let mut agents = self.agents.write().await;
        agents.insert(agent.id.clone(), agent);
        Ok(())
    }

    async fn heartbeat_agent(&self, id: &str, ts_ms: u64) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("agent {id}")))?;
        agent.last_seen_ms = ts_ms;
        Ok(())
    }

    async fn get_agent(&self, id: &str) -> Result<Option<Agent>> {
        Ok(self.agents.read().await.get(id).cloned())
    }

    async fn get_agent_by_display_name_ci(&self, display_name: &str) -> Result<Option<Agent>> {
        let needle = display_name.to_lowercase();
        Ok(self
            .agents
            .read()
            .await
            .values()
            .find(|a| a.display_name.to_lowercase() == needle)
            .cloned())
    }

    async fn get_all_agents(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.read().await.values().cloned().collect())
    }

    async fn get_agents_by_capability(&self, capability: crate::models::Capability) -> Result<Vec<Agent>> {
        Ok(self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.capabilities.contains(&capability))
            .cloned()
            .collect())
    }

    async fn delete_agent(&self, id: &str) -> Result<()> {
        self.agents.write().await.remove(id);
        Ok(())
    }

    async fn set_eviction(&self, id: &str, reason: String, action: EvictionAction, ts_ms: u64) -> Result<()> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("agent {id}")))?;
        agent.pending_eviction = Some(match agent.pending_eviction.take() {
            Some(existing) => existing.merge_with(reason, action),
            None => crate::models::PendingEviction {
                requested_at_ms: ts_ms,
                reason,
                action,
            },
        });
        Ok(())
    }

    async fn clear_eviction(&self, id: &str) -> Result<()> {
        if let Some(agent) = self.agents.write().await.get_mut(id) {
            agent.pending_eviction = None;
        }
        Ok(())
    }

    async fn insert_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(BrokerError::Conflict(format!("task {} already exists", task.id)));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn update_task(&self, task: Task) -> Result<()> {
        let mut tasks = self.tasks.write().await;
        if !tasks.contains_key(&task.id) {
            return Err(BrokerError::NotFound(format!("task {}", task.id)));
        }
        tasks.insert(task.id.clone(), task);
        Ok(())
    }

    async fn update_task_status(&self, id: &str, status: TaskStatus, at_ms: u64) -> Result<Task> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| BrokerError::NotFound(format!("task {id}")))?;
        if !task.status.can_transition_to(status) {
            return Err(BrokerError::Conflict(format!(
                "illegal transition {:?} -> {:?} for task {id}",
                task.status, status
            )));
        }
        task.record_transition(status, at_ms);
        Ok(task.clone())
    }

    async fn get_task(&self, id: &str) -> Result<Option<Task>> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn get_tasks_by_status(&self, status: TaskStatus) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect())
    }

    async fn get_tasks_by_statuses(&self, statuses: &[TaskStatus]) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| statuses.contains(&t.status))
            .cloned()
            .collect())
    }

    async fn get_tasks_by_assigned_to(&self, agent_id: &str) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.assigned_to.as_deref() == Some(agent_id))
            .cloned()
            .collect())
    }

    async fn get_active_tasks(&self) -> Result<Vec<Task>> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| !t.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn get_all_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.tasks.read().await.values().cloned().collect())
    }

    async fn get_history(&self, filter: HistoryFilter) -> Result<Vec<TaskHistoryEntry>> {
        let tasks = self.tasks.read().await;
        let mut entries: Vec<TaskHistoryEntry> = tasks
            .values()
            .flat_map(|task| {
                task.history.iter().map(move |transition| TaskHistoryEntry {
                    task_id: task.id.clone(),
                    status: transition.status,
                    at_ms: transition.at_ms,
                    agent_id: transition.agent_id.clone(),
                })
            })
            .filter(|entry| filter.status.map_or(true, |s| entry.status == s))
            .filter(|entry| {
                filter
                    .agent_id
                    .as_deref()
                    .map_or(true, |a| entry.agent_id.as_deref() == Some(a))
            })
            .collect();
        entries.sort_by_key(|e| e.at_ms);
        Ok(entries.into_iter().skip(filter.offset).take(filter.limit).collect())
    }

    async fn append_message(&self, task_id: &str, message: Message) -> Result<()> {
        self.messages
            .write()
            .await
            .entry(task_id.to_string())
            .or_default()
            .push(message);
        Ok(())
    }

    async fn get_messages(&self, task_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .messages
            .read()
            .await
            .get(task_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn mark_user_comments_read(&self, task_id: &str) -> Result<usize> {
        let mut messages = self.messages.write().await;
        let mut count = 0;
        if let Some(list) = messages.get_mut(task_id) {
            for message in list
                .iter_mut()
                .filter(|m| m.role == crate::models::MessageRole::User && !m.is_read)
            {
                message.is_read = true;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn append_progress(&self, entry: ProgressEntry) -> Result<()> {
        self.progress
            .write()
            .await
            .entry(entry.task_id.clone())
            .or_default()
            .push(entry);
        Ok(())
    }

    async fn get_last_progress_at(&self, task_id: &str) -> Result<Option<u64>> {
        Ok(self
            .progress
            .read()
            .await
            .get(task_id)
            .and_then(|entries| entries.last())
            .map(|e| e.at_ms))
    }

    async fn insert_review_comment(&self, comment: ReviewComment) -> Result<()> {
        self.review_comments
            .write()
            .await
            .insert(comment.id.clone(), comment);
        Ok(())
    }

    async fn list_review_comments(&self, task_id: &str, unresolved_only: bool) -> Result<Vec<ReviewComment>> {
        Ok(self
            .review_comments
            .read()
            .await
            .values()
            .filter(|c| c.task_id == task_id && (!unresolved_only || !c.resolved))
            .cloned()
            .collect())
    }

    async fn resolve_review_comment(&self, comment_id: &str, response: Option<String>) -> Result<()> {
        let mut comments = self.review_comments.write().await;
        let comment = comments
            .get_mut(comment_id)
            .ok_or_else(|| BrokerError::NotFound(format!("review comment {comment_id}")))?;
        comment.resolved = true;
        comment.response = response;
        Ok(())
    }
}
