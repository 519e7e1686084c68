//! In-memory index of agents currently suspended inside `wait_for_task`.
//! Exactly one waiter per agent; registering a new one supersedes the old.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};

use crate::models::{Capability, Task, WorkspaceContext};

#[derive(Debug)]
pub enum WaitOutcome {
    Task(Box<Task>),
    Evicted {
        reason: String,
        action: crate::models::EvictionAction,
    },
    Superseded,
}

pub struct WaiterEntry {
    pub capabilities: Vec<Capability>,
    pub workspace_context: Option<WorkspaceContext>,
    pub waiting_since_ms: u64,
    sender: oneshot::Sender<WaitOutcome>,
}

#[derive(Clone)]
pub struct WaiterHandle {
    pub capabilities: Vec<Capability>,
    pub workspace_context: Option<WorkspaceContext>,
    pub waiting_since_ms: u64,
}

#[derive(Default)]
pub struct WaiterTable {
    waiters: Mutex<HashMap<String, WaiterEntry>>,
}

impl WaiterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Registers `agent_id` as waiting, superseding and waking any prior
    /// waiter for the same agent, and returns a receiver for the outcome.
    pub async fn register(
        &self,
        agent_id: &str,
        capabilities: Vec<Capability>,
        workspace_context: Option<WorkspaceContext>,
        waiting_since_ms: u64,
    ) -> oneshot::Receiver<WaitOutcome> {
        let (tx, rx) = oneshot::channel();
        let entry = WaiterEntry {
            capabilities,
            workspace_context,
            waiting_since_ms,
            sender: tx,
        };
        let mut waiters = self.waiters.lock().await;
        if let Some(previous) = waiters.insert(agent_id.to_string(), entry) {
            let _ = previous.sender.send(WaitOutcome::Superseded);
        }
        rx
    }

    pub async fn remove(&self, agent_id: &str) {
        self.waiters.lock().await.remove(agent_id);
    }

    /// Removes and signals the waiter for `agent_id`, if any; used by the
    /// reservation mutex and by eviction delivery.
    pub async fn take_and_signal(&self, agent_id: &str, outcome: WaitOutcome) -> bool {
        let mut waiters = self.waiters.lock().await;
        if let Some(entry) = waiters.remove(agent_id) {
            let _ = entry.sender.send(outcome);
            true
        } else {
            false
        }
    }

    pub async fn snapshot(&self) -> Vec<(String, WaiterHandle)> {
        self.waiters
            .lock()
            .await
            .iter()
            .map(|(id, e)| {
                (
                    id.clone(),
                    WaiterHandle {
                        capabilities: e.capabilities.clone(),
                        workspace_context: e.workspace_context.clone(),
                        waiting_since_ms: e.waiting_since_ms,
                    },
                )
            })
            .collect()
    }

    pub async fn contains(&self, agent_id: &str) -> bool {
        self.waiters.lock().await.contains_key(agent_id)
    }

    pub async fn len(&self) -> usize {
        self.waiters.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn registering_twice_for_same_agent_supersedes_the_first() {
        let table = WaiterTable::new();
        let rx1 = table.register("a1", vec![], None, 0).await;
        let _rx2 = table.register("a1", vec![], None, 10).await;

        let outcome = rx1.await.unwrap();
        assert!(matches!(outcome, WaitOutcome::Superseded));
        assert_eq!(table.len().await, 1);
    }

    #[tokio::test]
    async fn take_and_signal_removes_the_entry() {
        let table = WaiterTable::new();
        let rx = table.register("a1", vec![], None, 0).await;
        assert!(table.take_and_signal("a1", WaitOutcome::Superseded).await);
        assert!(!table.contains("a1").await);
        let _ = rx.await;
    }
}
