//! A flat dispatcher mapping tool name to handler, matching this codebase's
//! stated preference for composition over inheritance at integration seams:
//! no trait-object hierarchy, no macros, a `HashMap<&'static str, ToolHandler>`
//! of plain function pointers built once at `Engine` construction.

mod handlers;

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use serde_json::Value;

use crate::engine::Engine;
use crate::error::BrokerError;

#[derive(Debug, Serialize)]
pub struct ContentItem {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct Envelope {
    pub content: Vec<ContentItem>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

impl Envelope {
    pub fn ok_json(value: Value) -> Self {
        Envelope {
            content: vec![ContentItem {
                kind: "text",
                text: value.to_string(),
            }],
            is_error: None,
        }
    }

    pub fn ok_message(text: impl Into<String>) -> Self {
        Envelope {
            content: vec![ContentItem {
                kind: "text",
                text: text.into(),
            }],
            is_error: None,
        }
    }

    pub fn error(err: BrokerError) -> Self {
        Envelope {
            content: vec![ContentItem {
                kind: "text",
                text: err.to_envelope_text(),
            }],
            is_error: Some(true),
        }
    }

    pub fn from_result(result: Result<Value, BrokerError>) -> Self {
        match result {
            Ok(value) => Envelope::ok_json(value),
            Err(err) => Envelope::error(err),
        }
    }
}

pub type BoxedEnvelopeFuture<'a> = Pin<Box<dyn Future<Output = Envelope> + Send + 'a>>;
pub type ToolHandler = for<'a> fn(Value, &'a Engine) -> BoxedEnvelopeFuture<'a>;

/// Builds the dispatch table once; `Engine::dispatch` looks handlers up by
/// name and debounces the caller's heartbeat before invoking one.
pub fn build_dispatch_table() -> HashMap<&'static str, ToolHandler> {
    let mut table: HashMap<&'static str, ToolHandler> = HashMap::new();
    table.insert("register_agent", handlers::register_agent);
    table.insert("wait_for_prompt", handlers::wait_for_prompt);
    table.insert("wait_for_task", handlers::wait_for_task);
    table.insert("send_response", handlers::send_response);
    table.insert("assign_task", handlers::assign_task);
    table.insert("list_agents", handlers::list_agents);
    table.insert("get_agent_status", handlers::get_agent_status);
    table.insert("ack_task", handlers::ack_task);
    table.insert("block_task", handlers::block_task);
    table.insert("answer_task", handlers::answer_task);
    table.insert("update_progress", handlers::update_progress);
    table.insert("get_task_context", handlers::get_task_context);
    table.insert("broadcast_system_prompt", handlers::broadcast_system_prompt);
    table.insert("scaffold_plan", handlers::scaffold_plan);
    table.insert("submit_review", handlers::submit_review);
    table.insert("get_review_comments", handlers::get_review_comments);
    table.insert("resolve_review_comment", handlers::resolve_review_comment);
    table.insert("admin_update_agent", handlers::admin_update_agent);
    table.insert("admin_evict_agent", handlers::admin_evict_agent);
    table
}

/// Pulls `agentId`/`sourceAgentId` out of a request body for the dispatcher's
/// uniform heartbeat debounce.
pub fn caller_agent_id(args: &Value) -> Option<&str> {
    args.get("agentId")
        .or_else(|| args.get("sourceAgentId"))
        .and_then(Value::as_str)
}
