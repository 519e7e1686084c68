//! Typed lifecycle events, published to every external subscriber over a
//! broadcast channel (the out-of-scope HTTP/WebSocket layer, logging, tests).

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;
use tracing::debug;

use crate::models::{Priority, Task, TaskStatus};

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    #[serde(rename = "agent:registered")]
    AgentRegistered { agent_id: String },
    #[serde(rename = "agent:status")]
    AgentStatus {
        id: String,
        status: String,
        last_seen_ms: u64,
    },
    #[serde(rename = "task:created")]
    TaskCreated { task: Box<Task> },
    #[serde(rename = "task:updated")]
    TaskUpdated { id: String, patch: serde_json::Value },
    #[serde(rename = "task:completion")]
    TaskCompletion { id: String, status: TaskStatus },
    #[serde(rename = "task:deleted")]
    TaskDeleted { id: String },
    #[serde(rename = "task:retry")]
    TaskRetry { id: String },
    #[serde(rename = "task:stale")]
    TaskStale { id: String },
    Delegation {
        task_id: String,
        from: String,
        to: Option<String>,
        prompt: String,
        priority: Priority,
        created_at_ms: u64,
    },
    Activity {
        category: String,
        message: String,
        metadata: serde_json::Value,
    },
}

impl Event {
    /// Extracts the task id an event is about, when it has one; used by
    /// `waitForTaskCompletion`'s subscription filter.
    pub fn task_id(&self) -> Option<&str> {
        match self {
            Event::TaskCreated { task } => Some(task.id.as_str()),
            Event::TaskUpdated { id, .. }
            | Event::TaskCompletion { id, .. }
            | Event::TaskDeleted { id, .. }
            | Event::TaskRetry { id }
            | Event::TaskStale { id } => Some(id.as_str()),
            Event::Delegation { task_id, .. } => Some(task_id.as_str()),
            _ => None,
        }
    }
}

/// A published event tagged with its place in the process-wide, strictly
/// increasing sequence. Not persisted across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeqEvent {
    pub seq: u64,
    pub event: Event,
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: Event);
    fn subscribe(&self) -> broadcast::Receiver<SeqEvent>;
}

/// Production sink: one `AtomicU64` assigns sequence numbers, one
/// `broadcast::Sender` fans the event out to every subscriber.
pub struct BroadcastEventSink {
    sender: broadcast::Sender<SeqEvent>,
    seq: AtomicU64,
}

impl BroadcastEventSink {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            seq: AtomicU64::new(0),
        }
    }
}

impl Default for BroadcastEventSink {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: Event) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        let envelope = SeqEvent { seq, event };
        match self.sender.send(envelope) {
            Ok(receivers) => debug!(seq, receivers, "event published"),
            Err(_) => debug!(seq, "event published (no receivers)"),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<SeqEvent> {
        self.sender.subscribe()
    }
}

/// Filters a subscription down to events about one task, for
/// `waitForTaskCompletion`.
pub async fn recv_for_task(
    receiver: &mut broadcast::Receiver<SeqEvent>,
    task_id: &str,
) -> Option<SeqEvent> {
    loop {
        match receiver.recv().await {
            Ok(envelope) => {
                if envelope.event.task_id() == Some(task_id) {
                    return Some(envelope);
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn seq_is_strictly_increasing() {
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe();
        sink.publish(Event::AgentRegistered {
            agent_id: "a1".into(),
        });
        sink.publish(Event::AgentRegistered {
            agent_id: "a2".into(),
        });

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn publish_with_no_subscribers_does_not_panic() {
        let sink = BroadcastEventSink::new();
        sink.publish(Event::AgentRegistered {
            agent_id: "a1".into(),
        });
    }

    #[tokio::test]
    async fn recv_for_task_filters_out_unrelated_events() {
        let sink = BroadcastEventSink::new();
        let mut rx = sink.subscribe();
        sink.publish(Event::TaskDeleted { id: "other".into() });
        sink.publish(Event::TaskCompletion {
            id: "target".into(),
            status: TaskStatus::Completed,
        });

        let found = recv_for_task(&mut rx, "target").await.unwrap();
        assert_eq!(found.event.task_id(), Some("target"));
    }
}
