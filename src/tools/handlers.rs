use serde_json::{json, Value};

use crate::constants::DEFAULT_SOURCE_AGENT_ID;
use crate::engine::Engine;
use crate::error::{BrokerError, Result};
use crate::models::{
    Agent, AgentSource, Capability, EvictionAction, Message, MessageRole, OriginKind, Priority,
    ProgressEntry, ReviewComment, Task, TaskOrigin, TaskStatus, TaskTarget, WorkspaceContext,
};
use crate::queue::WaitForTaskOutcome;
use crate::registry::RegisterInput;
use crate::validation::PromptValidator;
use crate::waiter::WaitOutcome;

use super::{BoxedEnvelopeFuture, Envelope};

fn require_str<'a>(args: &'a Value, field: &str) -> Result<&'a str> {
    args.get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| BrokerError::Validation(format!("{field} is required")))
}

fn optional_str(args: &Value, field: &str) -> Option<String> {
    args.get(field).and_then(Value::as_str).map(String::from)
}

fn optional_u64(args: &Value, field: &str) -> Option<u64> {
    args.get(field).and_then(Value::as_u64)
}

fn uuid() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub fn register_agent(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move {
        Envelope::from_result(register_agent_inner(args, engine).await)
    })
}

async fn register_agent_inner(args: Value, engine: &Engine) -> Result<Value> {
    let id = require_str(&args, "agentId")?.to_string();
    let capabilities: Vec<Capability> = args
        .get("capabilities")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid capabilities: {e}")))?
        .ok_or_else(|| BrokerError::Validation("capabilities is required".into()))?;
    let workspace_context: Option<WorkspaceContext> = args
        .get("workspaceContext")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid workspaceContext: {e}")))?;
    let source = args
        .get("source")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid source: {e}")))?
        .unwrap_or(AgentSource::Ide);

    let agent = engine
        .registry
        .register(RegisterInput {
            id,
            display_name: optional_str(&args, "displayName"),
            role: optional_str(&args, "role"),
            capabilities,
            workspace_context,
            source,
            color: optional_str(&args, "color"),
        })
        .await?;
    Ok(serde_json::to_value(agent).expect("Agent serializes"))
}

pub fn wait_for_prompt(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(wait_for_prompt_inner(args, engine).await) })
}

async fn wait_for_prompt_inner(args: Value, engine: &Engine) -> Result<Value> {
    let agent_id = require_str(&args, "agentId")?.to_string();
    let requested = optional_u64(&args, "timeout").unwrap_or(0);
    let clamped = if requested == 0 || requested > engine.config.max_prompt_timeout_secs {
        engine.config.default_prompt_timeout_secs
    } else {
        requested.max(1)
    };

    let agent = engine
        .persistence
        .get_agent(&agent_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;
    let capabilities: Vec<Capability> = agent.capabilities.iter().copied().collect();

    let outcome = engine
        .queue
        .wait_for_task(
            &agent_id,
            capabilities,
            agent.workspace_context.clone(),
            clamped * 1000,
        )
        .await?;

    Ok(match outcome {
        WaitForTaskOutcome::Task(task) => json!({ "taskId": task.id, "prompt": task.prompt }),
        WaitForTaskOutcome::Evicted { reason, action } => json!({
            "controlSignal": "EVICT",
            "reason": reason,
            "action": action,
        }),
        WaitForTaskOutcome::TimedOut => json!({ "status": "IDLE" }),
    })
}

pub fn wait_for_task(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(wait_for_task_inner(args, engine).await) })
}

async fn wait_for_task_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?.to_string();
    let timeout_secs = optional_u64(&args, "timeout").unwrap_or(300);
    let task = engine
        .queue
        .wait_for_task_completion(&task_id, timeout_secs * 1000)
        .await?;
    Ok(match task {
        Some(task) => serde_json::to_value(task).expect("Task serializes"),
        None => json!({ "status": "TIMEOUT" }),
    })
}

pub fn send_response(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(send_response_inner(args, engine).await) })
}

async fn send_response_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let status_raw = require_str(&args, "status")?;
    let message = require_str(&args, "message")?.to_string();
    let status: TaskStatus = serde_json::from_value(Value::String(status_raw.to_string()))
        .map_err(|_| BrokerError::Validation(format!("unrecognised status {status_raw}")))?;

    let current = engine
        .queue
        .get_task(task_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("task {task_id}")))?;

    // An agent reporting completion straight from ASSIGNED (it never sent a
    // separate progress update) still lands on COMPLETED; the state machine
    // only allows that via IN_PROGRESS, so step through it first.
    if current.status == TaskStatus::Assigned && status == TaskStatus::Completed {
        engine.queue.update_status(task_id, TaskStatus::InProgress).await?;
    }

    let mut updated = engine.queue.update_status(task_id, status).await?;

    engine
        .persistence
        .append_message(
            task_id,
            Message {
                id: uuid(),
                role: MessageRole::Agent,
                content: message.clone(),
                timestamp_ms: engine.clock.now_ms(),
                is_read: false,
                message_type: None,
                reply_to: None,
            },
        )
        .await?;

    updated.response = Some(message);
    engine.persistence.update_task(updated.clone()).await?;

    Ok(serde_json::to_value(updated).expect("Task serializes"))
}

pub fn assign_task(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(assign_task_inner(args, engine).await) })
}

async fn assign_task_inner(args: Value, engine: &Engine) -> Result<Value> {
    let prompt = require_str(&args, "prompt")?.to_string();
    let workspace_id = require_str(&args, "workspaceId")?.to_string();

    if !engine.validator.is_valid(&prompt) {
        return Err(BrokerError::Permission("prompt rejected by validator".into()));
    }

    // `tasks` turns a single assign_task call into the same chained-dependency
    // scaffold scaffold_plan builds, with `prompt` as the lead step.
    if let Some(subtasks) = args.get("tasks") {
        let mut steps = vec![prompt.clone()];
        let rest: Vec<String> = serde_json::from_value(subtasks.clone())
            .map_err(|e| BrokerError::Validation(format!("invalid tasks: {e}")))?;
        steps.extend(rest);
        let plan_args = json!({ "workspaceId": workspace_id, "tasks": steps });
        return scaffold_plan_inner(plan_args, engine).await;
    }

    let required_capabilities: Vec<Capability> = args
        .get("requiredCapabilities")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid requiredCapabilities: {e}")))?
        .unwrap_or_default();
    let priority: Priority = args
        .get("priority")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid priority: {e}")))?
        .unwrap_or_default();
    let dependencies: Vec<String> = args
        .get("dependencies")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid dependencies: {e}")))?
        .unwrap_or_default();
    let source_agent_id = optional_str(&args, "sourceAgentId")
        .unwrap_or_else(|| DEFAULT_SOURCE_AGENT_ID.to_string());
    let origin_kind = if source_agent_id == DEFAULT_SOURCE_AGENT_ID {
        OriginKind::User
    } else {
        OriginKind::Agent
    };

    let now = engine.clock.now_ms();
    let task = Task {
        id: uuid(),
        prompt: prompt.clone(),
        title: optional_str(&args, "title"),
        priority,
        from: TaskOrigin {
            kind: origin_kind,
            id: source_agent_id.clone(),
            name: source_agent_id.clone(),
        },
        to: TaskTarget {
            agent_id: optional_str(&args, "targetAgentId"),
            required_capabilities: required_capabilities.into_iter().collect(),
            workspace_id: Some(workspace_id.clone()),
        },
        assigned_to: None,
        context: {
            let mut context: std::collections::HashMap<String, Value> = args
                .get("context")
                .and_then(Value::as_object)
                .map(|m| m.clone().into_iter().collect())
                .unwrap_or_default();
            if let Some(spec) = args.get("spec").cloned() {
                context.insert("spec".into(), spec);
            }
            context
        },
        response: None,
        dependencies,
        messages: vec![],
        history: vec![],
        status: TaskStatus::Queued,
        created_at_ms: now,
        completed_at_ms: None,
        last_progress_at_ms: None,
    };

    let created = engine.queue.enqueue(task).await?;
    engine.events.publish(crate::events::Event::Delegation {
        task_id: created.id.clone(),
        from: source_agent_id,
        to: created.to.agent_id.clone(),
        prompt,
        priority: created.priority,
        created_at_ms: now,
    });
    Ok(serde_json::to_value(created).expect("Task serializes"))
}

pub fn list_agents(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(list_agents_inner(args, engine).await) })
}

async fn list_agents_inner(args: Value, engine: &Engine) -> Result<Value> {
    let capability: Option<Capability> = args
        .get("capability")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid capability: {e}")))?;

    let agents: Vec<Agent> = match capability {
        Some(cap) => engine.persistence.get_agents_by_capability(cap).await?,
        None => engine.persistence.get_all_agents().await?,
    };
    Ok(serde_json::to_value(agents).expect("Vec<Agent> serializes"))
}

pub fn get_agent_status(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(get_agent_status_inner(args, engine).await) })
}

async fn get_agent_status_inner(args: Value, engine: &Engine) -> Result<Value> {
    let agent_id = require_str(&args, "agentId")?;
    let agent = engine
        .persistence
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;
    let assigned = engine.persistence.get_tasks_by_assigned_to(agent_id).await?;
    let statuses: Vec<TaskStatus> = assigned.iter().map(|t| t.status).collect();
    let derived = engine.registry.derived_status(&agent, &statuses).await;
    Ok(json!({ "agent": agent, "status": derived }))
}

pub fn ack_task(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(ack_task_inner(args, engine).await) })
}

async fn ack_task_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let agent_id = require_str(&args, "agentId")?;
    let task = engine.queue.ack_task(task_id, agent_id).await?;
    Ok(serde_json::to_value(task).expect("Task serializes"))
}

pub fn block_task(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(block_task_inner(args, engine).await) })
}

async fn block_task_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let question = require_str(&args, "question")?.to_string();
    let _reason = require_str(&args, "reason")?;
    let _summary = optional_str(&args, "summary");

    engine
        .persistence
        .append_message(
            task_id,
            Message {
                id: uuid(),
                role: MessageRole::User,
                content: question,
                timestamp_ms: engine.clock.now_ms(),
                is_read: false,
                message_type: Some("block_question".into()),
                reply_to: None,
            },
        )
        .await?;

    let task = engine.queue.update_status(task_id, TaskStatus::Blocked).await?;
    Ok(serde_json::to_value(task).expect("Task serializes"))
}

pub fn answer_task(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(answer_task_inner(args, engine).await) })
}

async fn answer_task_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let answer = require_str(&args, "answer")?.to_string();

    engine
        .persistence
        .append_message(
            task_id,
            Message {
                id: uuid(),
                role: MessageRole::Agent,
                content: answer,
                timestamp_ms: engine.clock.now_ms(),
                is_read: false,
                message_type: Some("block_answer".into()),
                reply_to: None,
            },
        )
        .await?;

    let task = engine.queue.update_status(task_id, TaskStatus::Queued).await?;
    let _ = engine.matcher.find_and_reserve_agent(&task).await?;
    Ok(serde_json::to_value(task).expect("Task serializes"))
}

pub fn update_progress(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(update_progress_inner(args, engine).await) })
}

async fn update_progress_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?.to_string();
    let agent_id = require_str(&args, "agentId")?.to_string();
    let message = require_str(&args, "message")?.to_string();
    let percentage = args
        .get("percentage")
        .and_then(Value::as_u64)
        .map(|p| p.min(100) as u8);
    let now = engine.clock.now_ms();

    engine
        .persistence
        .append_progress(ProgressEntry {
            task_id: task_id.clone(),
            agent_id,
            phase: optional_str(&args, "phase"),
            message,
            percentage,
            at_ms: now,
        })
        .await?;

    if let Some(mut task) = engine.queue.get_task(&task_id).await? {
        task.last_progress_at_ms = Some(now);
        engine.persistence.update_task(task).await?;
    }
    Ok(json!({ "taskId": task_id, "recordedAt": now }))
}

pub fn get_task_context(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(get_task_context_inner(args, engine).await) })
}

async fn get_task_context_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let task = engine
        .queue
        .get_task(task_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("task {task_id}")))?;
    let messages = engine.persistence.get_messages(task_id).await?;
    engine.persistence.mark_user_comments_read(task_id).await?;
    Ok(json!({ "task": task, "messages": messages }))
}

pub fn broadcast_system_prompt(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(broadcast_system_prompt_inner(args, engine).await) })
}

async fn broadcast_system_prompt_inner(args: Value, engine: &Engine) -> Result<Value> {
    let message = require_str(&args, "message")?.to_string();
    engine.events.publish(crate::events::Event::Activity {
        category: "broadcast".into(),
        message: message.clone(),
        metadata: args.get("metadata").cloned().unwrap_or(Value::Null),
    });
    Ok(json!({ "broadcast": message }))
}

pub fn scaffold_plan(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(scaffold_plan_inner(args, engine).await) })
}

async fn scaffold_plan_inner(args: Value, engine: &Engine) -> Result<Value> {
    let workspace_id = require_str(&args, "workspaceId")?.to_string();
    let prompts: Vec<String> = args
        .get("tasks")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid tasks: {e}")))?
        .ok_or_else(|| BrokerError::Validation("tasks is required".into()))?;

    let now = engine.clock.now_ms();
    let mut created_ids = Vec::with_capacity(prompts.len());
    let mut previous_id: Option<String> = None;
    for prompt in prompts {
        if !engine.validator.is_valid(&prompt) {
            return Err(BrokerError::Permission(format!("rejected plan step: {prompt}")));
        }
        let task = Task {
            id: uuid(),
            prompt,
            title: None,
            priority: Priority::Normal,
            from: TaskOrigin {
                kind: OriginKind::System,
                id: "scaffold_plan".into(),
                name: "scaffold_plan".into(),
            },
            to: TaskTarget {
                agent_id: None,
                required_capabilities: Default::default(),
                workspace_id: Some(workspace_id.clone()),
            },
            assigned_to: None,
            context: Default::default(),
            response: None,
            dependencies: previous_id.clone().into_iter().collect(),
            messages: vec![],
            history: vec![],
            status: TaskStatus::Queued,
            created_at_ms: now,
            completed_at_ms: None,
            last_progress_at_ms: None,
        };
        let created = engine.queue.enqueue(task).await?;
        previous_id = Some(created.id.clone());
        created_ids.push(created.id);
    }
    Ok(json!({ "taskIds": created_ids }))
}

pub fn submit_review(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(submit_review_inner(args, engine).await) })
}

async fn submit_review_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?.to_string();
    let comments: Vec<String> = args
        .get("comments")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
        .map_err(|e| BrokerError::Validation(format!("invalid comments: {e}")))?
        .unwrap_or_default();
    let now = engine.clock.now_ms();
    for content in comments {
        engine
            .persistence
            .insert_review_comment(ReviewComment {
                id: uuid(),
                task_id: task_id.clone(),
                content,
                resolved: false,
                response: None,
                created_at_ms: now,
            })
            .await?;
    }
    let task = engine.queue.update_status(&task_id, TaskStatus::InReview).await?;
    Ok(serde_json::to_value(task).expect("Task serializes"))
}

pub fn get_review_comments(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(get_review_comments_inner(args, engine).await) })
}

async fn get_review_comments_inner(args: Value, engine: &Engine) -> Result<Value> {
    let task_id = require_str(&args, "taskId")?;
    let unresolved_only = args
        .get("unresolvedOnly")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let comments = engine
        .persistence
        .list_review_comments(task_id, unresolved_only)
        .await?;
    Ok(serde_json::to_value(comments).expect("Vec<ReviewComment> serializes"))
}

pub fn resolve_review_comment(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(resolve_review_comment_inner(args, engine).await) })
}

async fn resolve_review_comment_inner(args: Value, engine: &Engine) -> Result<Value> {
    let comment_id = require_str(&args, "commentId")?;
    let response = optional_str(&args, "response");
    engine
        .persistence
        .resolve_review_comment(comment_id, response)
        .await?;
    Ok(json!({ "commentId": comment_id, "resolved": true }))
}

pub fn admin_update_agent(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(admin_update_agent_inner(args, engine).await) })
}

async fn admin_update_agent_inner(args: Value, engine: &Engine) -> Result<Value> {
    let agent_id = require_str(&args, "agentId")?;
    let mut agent = engine
        .persistence
        .get_agent(agent_id)
        .await?
        .ok_or_else(|| BrokerError::NotFound(format!("agent {agent_id}")))?;

    if let Some(role) = optional_str(&args, "role") {
        agent.role = Some(role);
    }
    if let Some(color) = optional_str(&args, "color") {
        agent.color = Some(color);
    }
    if let Some(caps) = args.get("capabilities").cloned() {
        let capabilities: Vec<Capability> = serde_json::from_value(caps)
            .map_err(|e| BrokerError::Validation(format!("invalid capabilities: {e}")))?;
        agent.capabilities = capabilities.into_iter().collect();
    }

    engine.persistence.update_agent(agent.clone()).await?;
    Ok(serde_json::to_value(agent).expect("Agent serializes"))
}

pub fn admin_evict_agent(args: Value, engine: &Engine) -> BoxedEnvelopeFuture<'_> {
    Box::pin(async move { Envelope::from_result(admin_evict_agent_inner(args, engine).await) })
}

async fn admin_evict_agent_inner(args: Value, engine: &Engine) -> Result<Value> {
    let agent_id = require_str(&args, "agentId")?.to_string();
    let reason = require_str(&args, "reason")?.to_string();
    let action: EvictionAction = serde_json::from_value(Value::String(
        require_str(&args, "action")?.to_string(),
    ))
    .map_err(|e| BrokerError::Validation(format!("invalid action: {e}")))?;

    engine
        .registry
        .request_eviction(&agent_id, reason.clone(), action)
        .await?;

    let delivered_now = engine
        .waiters
        .take_and_signal(
            &agent_id,
            WaitOutcome::Evicted {
                reason: reason.clone(),
                action,
            },
        )
        .await;
    if delivered_now {
        engine.registry.pop_eviction(&agent_id).await?;
    }

    Ok(json!({
        "agentId": agent_id,
        "reason": reason,
        "action": action,
        "delivered": delivered_now,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;

    fn engine() -> Engine {
        Engine::new(EngineConfig::default())
    }

    #[tokio::test]
    async fn register_agent_rejects_missing_capabilities() {
        let engine = engine();
        let envelope =
            register_agent(json!({ "agentId": "a1" }), &engine).await;
        assert_eq!(envelope.is_error, Some(true));
        assert!(envelope.content[0].text.starts_with("[VALIDATION]"));
    }

    #[tokio::test]
    async fn register_agent_rejects_empty_capability_list() {
        let engine = engine();
        let envelope = register_agent(
            json!({ "agentId": "a1", "capabilities": [] }),
            &engine,
        )
        .await;
        assert_eq!(envelope.is_error, Some(true));
    }

    #[tokio::test]
    async fn assign_task_rejects_missing_workspace_id() {
        let engine = engine();
        let envelope =
            assign_task(json!({ "prompt": "do something" }), &engine).await;
        assert_eq!(envelope.is_error, Some(true));
        assert!(envelope.content[0].text.starts_with("[VALIDATION]"));
    }

    #[tokio::test]
    async fn assign_task_with_tasks_field_chains_a_plan() {
        let engine = engine();
        let envelope = assign_task(
            json!({
                "prompt": "lead step",
                "workspaceId": "ws1",
                "tasks": ["second step", "third step"],
            }),
            &engine,
        )
        .await;
        assert_eq!(envelope.is_error, None);
        let body: Value = serde_json::from_str(&envelope.content[0].text).unwrap();
        let ids = body["taskIds"].as_array().unwrap();
        assert_eq!(ids.len(), 3);
    }

    #[tokio::test]
    async fn admin_evict_agent_requires_a_reason() {
        let engine = engine();
        register_agent(
            json!({ "agentId": "a1", "capabilities": ["code-writing"] }),
            &engine,
        )
        .await;
        let envelope = admin_evict_agent(
            json!({ "agentId": "a1", "reason": "", "action": "RESTART" }),
            &engine,
        )
        .await;
        assert_eq!(envelope.is_error, Some(true));
    }
}
