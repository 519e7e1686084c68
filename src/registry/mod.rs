//! Agent identity lifecycle: registration, heartbeat debounce, derived
//! status and the eviction queue. Split out as its own service the way the
//! orchestrator splits registration from status bookkeeping.

use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::constants::HEARTBEAT_DEBOUNCE_MS;
use crate::error::{BrokerError, Result};
use crate::events::{Event, EventSink};
use crate::models::{
    Agent, AgentSource, Capability, DerivedAgentStatus, EvictionAction, PendingEviction,
    WorkspaceContext,
};
use crate::persistence::Persistence;

const ADJECTIVES: &[&str] = &[
    "swift", "quiet", "amber", "lunar", "brisk", "coral", "eager", "gentle", "hidden", "keen",
];
const NOUNS: &[&str] = &[
    "falcon", "cedar", "harbor", "meadow", "otter", "summit", "willow", "ember", "atlas", "quartz",
];

pub struct RegisterInput {
    pub id: String,
    pub display_name: Option<String>,
    pub role: Option<String>,
    pub capabilities: Vec<Capability>,
    pub workspace_context: Option<WorkspaceContext>,
    pub source: AgentSource,
    pub color: Option<String>,
}

/// Tasks currently assigned to an agent, as seen by the queue; used only to
/// derive status, never stored here.
pub struct AssignedTaskStatuses<'a>(pub &'a [crate::models::TaskStatus]);

pub struct AgentRegistry {
    persistence: Arc<dyn Persistence>,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    offline_threshold_ms: u64,
    last_heartbeat_write: RwLock<HashMap<String, u64>>,
    waiting: RwLock<std::collections::HashSet<String>>,
}

impl AgentRegistry {
    pub fn new(
        persistence: Arc<dyn Persistence>,
        events: Arc<dyn EventSink>,
        clock: Arc<dyn Clock>,
        offline_threshold_ms: u64,
    ) -> Self {
        Self {
            persistence,
            events,
            clock,
            offline_threshold_ms,
            last_heartbeat_write: RwLock::new(HashMap::new()),
            waiting: RwLock::new(std::collections::HashSet::new()),
        }
    }

    fn generate_display_name() -> String {
        let mut rng = rand::thread_rng();
        let adjective = ADJECTIVES[rng.gen_range(0..ADJECTIVES.len())];
        let noun = NOUNS[rng.gen_range(0..NOUNS.len())];
        let suffix: u16 = rng.gen_range(0..100);
        format!("{adjective}-{noun}-{suffix:02}")
    }

    /// Registers a new agent, or re-adopts `id` with a suffix if it collides
    /// with a still-live agent under a different display name.
    pub async fn register(&self, input: RegisterInput) -> Result<Agent> {
        if input.capabilities.is_empty() {
            return Err(BrokerError::Validation(
                "capabilities must be non-empty".into(),
            ));
        }
        let now = self.clock.now_ms();
        let display_name = input
            .display_name
            .unwrap_or_else(Self::generate_display_name);

        if let Some(existing) = self.persistence.get_agent_by_display_name_ci(&display_name).await? {
            if existing.id != input.id {
                return Err(BrokerError::Conflict(format!(
                    "display name {display_name} already in use"
                )));
            }
        }

        let mut id = input.id.clone();
        if let Some(existing) = self.persistence.get_agent(&id).await? {
            let still_live = now.saturating_sub(existing.last_seen_ms) < self.offline_threshold_ms;
            if still_live && existing.display_name.to_lowercase() != display_name.to_lowercase() {
                id = format!("{id}-{}", now % 10_000);
            } else {
                self.persistence.delete_agent(&existing.id).await?;
            }
        }

        let agent = Agent {
            id: id.clone(),
            display_name,
            role: input.role,
            capabilities: input.capabilities.into_iter().collect(),
            workspace_context: input.workspace_context,
            source: input.source,
            color: input.color,
            created_at_ms: now,
            last_seen_ms: now,
            pending_eviction: None,
        };
        self.persistence.insert_agent(agent.clone()).await?;
        self.last_heartbeat_write.write().await.insert(id.clone(), now);
        info!(agent_id = %agent.id, at = %crate::clock::rfc3339(now), "agent registered");
        self.events.publish(Event::AgentRegistered {
            agent_id: agent.id.clone(),
        });
        Ok(agent)
    }

    /// Debounced at [`HEARTBEAT_DEBOUNCE_MS`] per agent.
    pub async fn heartbeat(&self, id: &str) -> Result<()> {
        let now = self.clock.now_ms();
        let mut last_write = self.last_heartbeat_write.write().await;
        if let Some(&last) = last_write.get(id) {
            if now.saturating_sub(last) < HEARTBEAT_DEBOUNCE_MS {
                return Ok(());
            }
        }
        self.persistence.heartbeat_agent(id, now).await?;
        last_write.insert(id.to_string(), now);
        debug!(agent_id = %id, "heartbeat recorded");
        self.events.publish(Event::AgentStatus {
            id: id.to_string(),
            status: "WAITING".into(),
            last_seen_ms: now,
        });
        Ok(())
    }

    pub async fn mark_waiting(&self, id: &str) {
        self.waiting.write().await.insert(id.to_string());
    }

    pub async fn clear_waiting(&self, id: &str) {
        self.waiting.write().await.remove(id);
    }

    /// Computes status from assigned-task statuses and waiter membership;
    /// never persisted, so it cannot drift from the facts it reflects.
    pub async fn derived_status(
        &self,
        agent: &Agent,
        assigned_task_statuses: &[crate::models::TaskStatus],
    ) -> DerivedAgentStatus {
        use crate::models::TaskStatus::*;
        let processing = assigned_task_statuses.iter().any(|s| {
            matches!(
                s,
                Assigned | InProgress | ApprovedQueued | ApprovedPendingAck
            )
        });
        if processing {
            return DerivedAgentStatus::Processing;
        }
        let is_waiting = self.waiting.read().await.contains(&agent.id);
        let fresh = self.clock.now_ms().saturating_sub(agent.last_seen_ms) < self.offline_threshold_ms;
        if is_waiting || fresh {
            DerivedAgentStatus::Waiting
        } else {
            DerivedAgentStatus::Offline
        }
    }

    pub async fn request_eviction(&self, id: &str, reason: String, action: EvictionAction) -> Result<()> {
        if reason.trim().is_empty() {
            return Err(BrokerError::Permission("eviction requires a reason".into()));
        }
        let now = self.clock.now_ms();
        self.persistence.set_eviction(id, reason, action, now).await
    }

    /// Atomically returns and clears a pending eviction.
    pub async fn pop_eviction(&self, id: &str) -> Result<Option<PendingEviction>> {
        let agent = self.persistence.get_agent(id).await?;
        let pending = agent.and_then(|a| a.pending_eviction);
        if pending.is_some() {
            self.persistence.clear_eviction(id).await?;
        }
        Ok(pending)
    }

    pub async fn cleanup(&self, older_than_ms: u64, exempt_ids: &[String]) -> Result<usize> {
        let now = self.clock.now_ms();
        let agents = self.persistence.get_all_agents().await?;
        let mut removed = 0;
        for agent in agents {
            if exempt_ids.contains(&agent.id) {
                continue;
            }
            if now.saturating_sub(agent.last_seen_ms) > older_than_ms {
                self.persistence.delete_agent(&agent.id).await?;
                self.last_heartbeat_write.write().await.remove(&agent.id);
                removed += 1;
            }
        }
        Ok(removed)
    }
}
