//! Core data model shared by the registry, queue, matcher and tool surface.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// A domain tag that governs whether an agent is eligible for a task.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    SpecWriting,
    CodeWriting,
    TestWriting,
    DocWriting,
    CodeDoctor,
}

/// Where an agent connects from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum AgentSource {
    Cli,
    Ide,
}

impl Default for AgentSource {
    fn default() -> Self {
        AgentSource::Ide
    }
}

/// The repository (and optionally branch/path) an agent or task is scoped to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceContext {
    pub kind: WorkspaceKind,
    pub repo_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum WorkspaceKind {
    Local,
    Github,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum EvictionAction {
    Restart,
    Shutdown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PendingEviction {
    pub requested_at_ms: u64,
    pub reason: String,
    pub action: EvictionAction,
}

impl PendingEviction {
    /// Applies the upgrade rule from the data model: RESTART -> SHUTDOWN is
    /// allowed, the reverse is not.
    pub fn merge_with(self, incoming_reason: String, incoming_action: EvictionAction) -> Self {
        let action = match (self.action, incoming_action) {
            (EvictionAction::Shutdown, _) => EvictionAction::Shutdown,
            (EvictionAction::Restart, action) => action,
        };
        PendingEviction {
            requested_at_ms: self.requested_at_ms,
            reason: incoming_reason,
            action,
        }
    }
}

/// A registered worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub capabilities: HashSet<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_context: Option<WorkspaceContext>,
    pub source: AgentSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    pub created_at_ms: u64,
    pub last_seen_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_eviction: Option<PendingEviction>,
}

/// Status computed on demand from an agent's assigned tasks and waiter state;
/// never persisted, so it can never drift from the facts it is derived from.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum DerivedAgentStatus {
    Processing,
    Waiting,
    Offline,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
    Critical,
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OriginKind {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskOrigin {
    pub kind: OriginKind,
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskTarget {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "HashSet::is_empty")]
    pub required_capabilities: HashSet<Capability>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub workspace_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Agent,
    System,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub content: String,
    pub timestamp_ms: u64,
    pub is_read: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StatusTransition {
    pub status: TaskStatus,
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// One row of a `getHistory` query: a status transition alongside the task
/// it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskHistoryEntry {
    pub task_id: String,
    pub status: TaskStatus,
    pub at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

/// The task lifecycle state machine. Transitions are enforced by the queue,
/// not by this type; this enum only names the reachable set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    Queued,
    PendingAck,
    Assigned,
    InProgress,
    Blocked,
    InReview,
    Rejected,
    ApprovedQueued,
    ApprovedPendingAck,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// Returns whether `self -> next` appears in the allowed transition table.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Queued, PendingAck)
                | (Queued, Cancelled)
                | (PendingAck, Assigned)
                | (PendingAck, Queued)
                | (Assigned, InProgress)
                | (Assigned, Blocked)
                | (Assigned, InReview)
                | (Assigned, Failed)
                | (Assigned, Cancelled)
                | (InProgress, Blocked)
                | (InProgress, InReview)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Cancelled)
                | (Blocked, Queued)
                | (Blocked, Cancelled)
                | (Blocked, Failed)
                | (InReview, ApprovedQueued)
                | (InReview, Rejected)
                | (InReview, Cancelled)
                | (Rejected, Queued)
                | (ApprovedQueued, ApprovedPendingAck)
                | (ApprovedQueued, Cancelled)
                | (ApprovedPendingAck, InProgress)
                | (ApprovedPendingAck, ApprovedQueued)
        )
    }
}

/// The central unit of work dispatched to agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub priority: Priority,
    pub from: TaskOrigin,
    #[serde(default)]
    pub to: TaskTarget,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub history: Vec<StatusTransition>,
    pub status: TaskStatus,
    pub created_at_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_progress_at_ms: Option<u64>,
}

impl Task {
    /// Records the transition and snapshots whichever agent this task was
    /// assigned to at the moment it happened, so `getHistory` can filter by
    /// `agentId` without the caller threading one through separately.
    pub fn record_transition(&mut self, status: TaskStatus, at_ms: u64) {
        let agent_id = self.assigned_to.clone();
        self.status = status;
        self.history.push(StatusTransition { status, at_ms, agent_id });
        if status.is_terminal() {
            self.completed_at_ms = Some(at_ms);
        }
    }
}

/// Transient coupling between a task and the one agent it was dispatched to,
/// pending acknowledgement.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub task_id: String,
    pub agent_id: String,
    pub reserved_at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEntry {
    pub task_id: String,
    pub agent_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    pub at_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReviewComment {
    pub id: String,
    pub task_id: String,
    pub content: String,
    pub resolved: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_at_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pending_eviction_upgrades_but_never_downgrades() {
        let base = PendingEviction {
            requested_at_ms: 0,
            reason: "r1".into(),
            action: EvictionAction::Restart,
        };
        let upgraded = base.clone().merge_with("r2".into(), EvictionAction::Shutdown);
        assert_eq!(upgraded.action, EvictionAction::Shutdown);

        let stays = upgraded.merge_with("r3".into(), EvictionAction::Restart);
        assert_eq!(stays.action, EvictionAction::Shutdown);
    }

    #[test]
    fn state_machine_allows_documented_transitions_only() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::PendingAck));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Assigned));
        assert!(TaskStatus::Rejected.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Queued));
    }

    #[test]
    fn terminal_statuses_are_exactly_completed_failed_cancelled() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(!TaskStatus::InProgress.is_terminal());
    }
}
