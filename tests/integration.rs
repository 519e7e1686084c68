use agent_broker::config::EngineConfig;
use agent_broker::Engine;
use serde_json::json;

fn new_engine() -> Engine {
    Engine::new(EngineConfig::default())
}

fn text_of(envelope: &agent_broker::tools::Envelope) -> serde_json::Value {
    serde_json::from_str(&envelope.content[0].text).expect("handler returns JSON text")
}

#[tokio::test]
async fn dependency_gated_task_only_assigns_after_its_dependency_completes() {
    let engine = new_engine();

    let register = engine
        .dispatch(
            "register_agent",
            json!({ "agentId": "a1", "displayName": "fixed", "capabilities": ["code-writing"] }),
        )
        .await;
    assert_eq!(register.is_error, None);

    let upstream = engine
        .dispatch(
            "assign_task",
            json!({ "prompt": "build the base", "workspaceId": "ws1", "requiredCapabilities": ["code-writing"] }),
        )
        .await;
    let upstream_id = text_of(&upstream)["id"].as_str().unwrap().to_string();

    let downstream = engine
        .dispatch(
            "assign_task",
            json!({
                "prompt": "build on top",
                "workspaceId": "ws1",
                "requiredCapabilities": ["code-writing"],
                "dependencies": [upstream_id.clone()],
            }),
        )
        .await;
    let downstream_id = text_of(&downstream)["id"].as_str().unwrap().to_string();

    // The only waiting agent should receive the upstream task first; the
    // gated downstream task stays QUEUED behind its unmet dependency.
    let prompt = engine
        .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 2 }))
        .await;
    let handed_out = text_of(&prompt)["taskId"].as_str().unwrap().to_string();
    assert_eq!(handed_out, upstream_id);

    engine
        .dispatch("ack_task", json!({ "taskId": upstream_id.clone(), "agentId": "a1" }))
        .await;
    engine
        .dispatch(
            "send_response",
            json!({ "taskId": upstream_id.clone(), "status": "IN_PROGRESS", "message": "starting" }),
        )
        .await;
    engine
        .dispatch(
            "send_response",
            json!({ "taskId": upstream_id, "status": "COMPLETED", "message": "done" }),
        )
        .await;

    let prompt = engine
        .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 2 }))
        .await;
    let handed_out = text_of(&prompt)["taskId"].as_str().unwrap().to_string();
    assert_eq!(handed_out, downstream_id);
}

#[tokio::test]
async fn block_then_answer_returns_the_task_to_the_queue() {
    let engine = new_engine();
    engine
        .dispatch(
            "register_agent",
            json!({ "agentId": "a1", "displayName": "fixed", "capabilities": ["code-writing"] }),
        )
        .await;

    let created = engine
        .dispatch(
            "assign_task",
            json!({ "prompt": "ambiguous work", "workspaceId": "ws1", "requiredCapabilities": ["code-writing"] }),
        )
        .await;
    let task_id = text_of(&created)["id"].as_str().unwrap().to_string();

    let prompt = engine
        .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 2 }))
        .await;
    assert_eq!(text_of(&prompt)["taskId"].as_str().unwrap(), task_id);
    engine
        .dispatch("ack_task", json!({ "taskId": task_id.clone(), "agentId": "a1" }))
        .await;

    let blocked = engine
        .dispatch(
            "block_task",
            json!({ "taskId": task_id.clone(), "question": "which repo?", "reason": "ambiguous target" }),
        )
        .await;
    assert_eq!(text_of(&blocked)["status"].as_str().unwrap(), "BLOCKED");

    let answered = engine
        .dispatch("answer_task", json!({ "taskId": task_id.clone(), "answer": "repo-a" }))
        .await;
    assert_eq!(text_of(&answered)["status"].as_str().unwrap(), "QUEUED");

    let context = engine
        .dispatch("get_task_context", json!({ "taskId": task_id }))
        .await;
    let messages = text_of(&context)["messages"].as_array().unwrap().len();
    assert_eq!(messages, 2);
}

#[tokio::test]
async fn evicting_a_waiting_agent_wakes_it_with_the_control_signal() {
    let engine = std::sync::Arc::new(new_engine());
    engine
        .dispatch(
            "register_agent",
            json!({ "agentId": "a1", "displayName": "fixed", "capabilities": ["code-writing"] }),
        )
        .await;

    let waiter = engine.clone();
    let wait_handle = tokio::spawn(async move {
        waiter
            .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 30 }))
            .await
    });

    while engine.waiters.len().await == 0 {
        tokio::task::yield_now().await;
    }

    let evicted = engine
        .dispatch(
            "admin_evict_agent",
            json!({ "agentId": "a1", "reason": "node draining", "action": "RESTART" }),
        )
        .await;
    assert_eq!(text_of(&evicted)["delivered"].as_bool(), Some(true));

    let outcome = wait_handle.await.unwrap();
    let body = text_of(&outcome);
    assert_eq!(body["controlSignal"].as_str(), Some("EVICT"));
    assert_eq!(body["action"].as_str(), Some("RESTART"));
}

#[tokio::test]
async fn capability_mismatch_leaves_the_task_queued_and_times_out_the_waiter() {
    let engine = new_engine();
    engine
        .dispatch(
            "register_agent",
            json!({ "agentId": "a1", "displayName": "fixed", "capabilities": ["doc-writing"] }),
        )
        .await;

    let created = engine
        .dispatch(
            "assign_task",
            json!({ "prompt": "needs code", "workspaceId": "ws1", "requiredCapabilities": ["code-writing"] }),
        )
        .await;
    let task_id = text_of(&created)["id"].as_str().unwrap().to_string();

    let prompt = engine
        .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 1 }))
        .await;
    assert_eq!(text_of(&prompt)["status"].as_str(), Some("IDLE"));

    let list = engine.dispatch("list_agents", json!({})).await;
    assert_eq!(text_of(&list).as_array().unwrap().len(), 1);

    let task = engine.dispatch("get_task_context", json!({ "taskId": task_id })).await;
    assert_eq!(text_of(&task)["task"]["status"].as_str(), Some("QUEUED"));
}

#[tokio::test]
async fn send_response_completes_a_task_straight_from_assigned() {
    let engine = new_engine();
    engine
        .dispatch(
            "register_agent",
            json!({ "agentId": "a1", "displayName": "fixed", "capabilities": ["code-writing"] }),
        )
        .await;

    let created = engine
        .dispatch(
            "assign_task",
            json!({ "prompt": "quick fix", "workspaceId": "ws1", "requiredCapabilities": ["code-writing"] }),
        )
        .await;
    let task_id = text_of(&created)["id"].as_str().unwrap().to_string();

    engine
        .dispatch("wait_for_prompt", json!({ "agentId": "a1", "timeout": 2 }))
        .await;
    engine
        .dispatch("ack_task", json!({ "taskId": task_id.clone(), "agentId": "a1" }))
        .await;

    let task = engine
        .dispatch("get_task_context", json!({ "taskId": task_id.clone() }))
        .await;
    assert_eq!(text_of(&task)["task"]["status"].as_str(), Some("ASSIGNED"));

    let completed = engine
        .dispatch(
            "send_response",
            json!({ "taskId": task_id, "status": "COMPLETED", "message": "done" }),
        )
        .await;
    let body = text_of(&completed);
    assert_eq!(body["status"].as_str(), Some("COMPLETED"));
    assert!(body["completedAtMs"].is_u64());
    assert_eq!(body["response"].as_str(), Some("done"));
}
