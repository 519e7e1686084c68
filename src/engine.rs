//! Owns one instance of every collaborator and exposes `start`/`shutdown`.
//! No module-level mutable state; everything lives behind this struct.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::events::{BroadcastEventSink, EventSink};
use crate::matcher::Matcher;
use crate::persistence::{InMemoryStore, Persistence};
use crate::queue::TaskQueue;
use crate::registry::AgentRegistry;
use crate::scheduler::{Scheduler, SchedulerConfig};
use crate::tools::{build_dispatch_table, caller_agent_id, Envelope, ToolHandler};
use crate::validation::{DefaultPromptValidator, PromptValidator};
use crate::waiter::{WaitOutcome, WaiterTable};

pub struct Engine {
    pub config: EngineConfig,
    pub clock: Arc<dyn Clock>,
    pub events: Arc<dyn EventSink>,
    pub persistence: Arc<dyn Persistence>,
    pub registry: Arc<AgentRegistry>,
    pub waiters: Arc<WaiterTable>,
    pub matcher: Arc<Matcher>,
    pub queue: Arc<TaskQueue>,
    pub scheduler: Arc<Scheduler>,
    pub validator: Arc<dyn PromptValidator>,
    dispatch_table: HashMap<&'static str, ToolHandler>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let events: Arc<dyn EventSink> = Arc::new(BroadcastEventSink::new());
        let persistence: Arc<dyn Persistence> = InMemoryStore::shared();
        let waiters = WaiterTable::shared();
        let registry = Arc::new(AgentRegistry::new(
            persistence.clone(),
            events.clone(),
            clock.clone(),
            config.offline_threshold_ms,
        ));
        let matcher = Arc::new(Matcher::new(
            persistence.clone(),
            events.clone(),
            waiters.clone(),
            clock.clone(),
            config.assigned_timeout_ms,
        ));
        let queue = Arc::new(TaskQueue::new(
            persistence.clone(),
            events.clone(),
            matcher.clone(),
            waiters.clone(),
            registry.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(Scheduler::new(
            queue.clone(),
            matcher.clone(),
            persistence.clone(),
            events.clone(),
            clock.clone(),
            SchedulerConfig {
                tick_interval_ms: config.scheduler_interval_ms,
                ack_timeout_ms: config.ack_timeout_ms,
                assigned_timeout_ms: config.assigned_timeout_ms,
                orphan_timeout_ms: config.orphan_timeout_ms,
            },
        ));

        Self {
            config,
            clock,
            events,
            persistence,
            registry,
            waiters,
            matcher,
            queue,
            scheduler,
            validator: Arc::new(DefaultPromptValidator),
            dispatch_table: build_dispatch_table(),
        }
    }

    pub async fn start(&self) {
        self.scheduler.start().await;
        tracing::info!("engine started");
    }

    /// Looks up `tool` in the dispatch table, debounces the caller's
    /// heartbeat when the request names an agent, then invokes the handler.
    pub async fn dispatch(&self, tool: &str, args: Value) -> Envelope {
        let Some(handler) = self.dispatch_table.get(tool).copied() else {
            return Envelope::error(crate::error::BrokerError::NotFound(format!(
                "unknown tool {tool}"
            )));
        };
        if let Some(agent_id) = caller_agent_id(&args) {
            let _ = self.registry.heartbeat(agent_id).await;
        }
        handler(args, self).await
    }

    /// Wakes every waiter with nothing, stops the scheduler at the next
    /// tick boundary, and leaves the event sink to be dropped with `self`.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
        for (agent_id, _) in self.waiters.snapshot().await {
            self.waiters
                .take_and_signal(&agent_id, WaitOutcome::Superseded)
                .await;
        }
        tracing::info!("engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn engine_builds_with_default_config() {
        let engine = Engine::new(EngineConfig::default());
        assert_eq!(engine.queue.get_all().await.unwrap().len(), 0);
    }

    #[tokio::test]
    async fn shutdown_wakes_pending_waiters_with_nothing() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .registry
            .register(crate::registry::RegisterInput {
                id: "a1".into(),
                display_name: Some("fixed".into()),
                role: None,
                capabilities: vec![crate::models::Capability::CodeWriting],
                workspace_context: None,
                source: crate::models::AgentSource::Ide,
                color: None,
            })
            .await
            .unwrap();

        let queue = engine.queue.clone();
        let wait_handle = tokio::spawn(async move {
            queue
                .wait_for_task("a1", vec![crate::models::Capability::CodeWriting], None, 5_000)
                .await
        });

        // give the spawned waiter a chance to register before shutdown signals it
        while engine.waiters.len().await == 0 {
            tokio::task::yield_now().await;
        }
        engine.shutdown().await;

        let outcome = wait_handle.await.unwrap().unwrap();
        assert!(matches!(outcome, crate::queue::WaitForTaskOutcome::TimedOut));
    }

    #[tokio::test]
    async fn dispatch_rejects_unknown_tool() {
        let engine = Engine::new(EngineConfig::default());
        let envelope = engine.dispatch("not_a_real_tool", serde_json::json!({})).await;
        assert_eq!(envelope.is_error, Some(true));
    }

    #[tokio::test]
    async fn dispatch_routes_register_agent_and_heartbeats_the_caller() {
        let engine = Engine::new(EngineConfig::default());
        let envelope = engine
            .dispatch(
                "register_agent",
                serde_json::json!({
                    "agentId": "a1",
                    "displayName": "fixed",
                    "capabilities": ["code-writing"],
                }),
            )
            .await;
        assert_eq!(envelope.is_error, None);
        assert!(engine.persistence.get_agent("a1").await.unwrap().is_some());
    }
}
