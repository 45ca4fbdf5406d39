//! Integration tests for the autopilot loop driven through the gateway.
//!
//! These tests exercise the full request/response path: config
//! normalization, hook construction, resolved dispatch order, the persisted
//! loop state and the effects reported back to the host.

use async_trait::async_trait;
use hookgate_core::{
    normalize, Channel, GatewayRequest, GatewayResponse, HostContext, HostEffect, NoticeLevel,
    Result, SessionMessage, SessionSnapshot, Todo,
};
use hookgate_engine::{
    loop_state_store, AutopilotLoopState, Gateway, ProcessPressureSample, ProcessSampler,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

struct FixedSampler(ProcessPressureSample);

#[async_trait]
impl ProcessSampler for FixedSampler {
    async fn sample(&self) -> Result<ProcessPressureSample> {
        Ok(self.0)
    }
}

fn quiet() -> Arc<FixedSampler> {
    Arc::new(FixedSampler(ProcessPressureSample::default()))
}

fn context(session: &str, assistant_text: &str, todos: Vec<Todo>) -> HostContext {
    let mut context = HostContext::default();
    context.sessions.insert(
        session.to_string(),
        SessionSnapshot {
            messages: vec![
                SessionMessage::new("user", "please finish the refactor"),
                SessionMessage::new("assistant", assistant_text),
            ],
            todos,
        },
    );
    context
}

fn idle(session: &str, assistant_text: &str) -> GatewayRequest {
    let mut request = GatewayRequest::new(
        Channel::Event,
        json!({ "type": "session.idle", "properties": { "sessionID": session } }),
        Value::Null,
    );
    request.context = context(session, assistant_text, Vec::new());
    request
}

fn prompts(response: &GatewayResponse) -> Vec<String> {
    response
        .effects
        .iter()
        .filter_map(|effect| match effect {
            HostEffect::SendPrompt { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

async fn start_loop(dir: &TempDir, max_iterations: u64) {
    let config = normalize(&json!({}));
    let state = AutopilotLoopState::new(
        "ses_1",
        "Finish the parser refactor",
        max_iterations,
        config.autopilot.default_completion_mode,
        "DONE",
    );
    loop_state_store(&config, dir.path())
        .save(&state)
        .await
        .unwrap();
}

async fn stored_iteration(dir: &TempDir) -> Option<u64> {
    loop_state_store(&normalize(&json!({})), dir.path())
        .load()
        .await
        .unwrap()
        .map(|state| state.iteration)
}

#[tokio::test]
async fn test_loop_runs_to_its_cap() {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::with_sampler(&normalize(&json!({})), dir.path(), quiet());
    start_loop(&dir, 2).await;

    // First idle: no completion, iteration 1 -> 2, continuation injected
    let first = gateway.handle(idle("ses_1", "Parsed half the grammar.")).await;
    assert!(first.ok);
    let sent = prompts(&first);
    assert_eq!(sent.len(), 1);
    assert!(sent[0].contains("ITERATION 2/2"));
    assert!(sent[0].contains("Finish the parser refactor"));
    assert_eq!(stored_iteration(&dir).await, Some(2));

    // Second idle: cap reached, state deleted, operator notified
    let second = gateway.handle(idle("ses_1", "Still going.")).await;
    assert!(second.ok);
    assert!(prompts(&second).is_empty());
    assert!(second.effects.iter().any(|effect| matches!(
        effect,
        HostEffect::Notify { notice }
            if notice.level == NoticeLevel::Warning
                && notice.message.contains("Max iterations reached")
    )));
    assert_eq!(stored_iteration(&dir).await, None);

    // Third idle: nothing left to drive
    let third = gateway.handle(idle("ses_1", "Hello?")).await;
    assert!(third.ok);
    assert!(third.effects.is_empty());
}

#[tokio::test]
async fn test_completion_ends_loop() {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::with_sampler(&normalize(&json!({})), dir.path(), quiet());
    start_loop(&dir, 10).await;

    let response = gateway
        .handle(idle("ses_1", "All tests pass.\n<promise>done</promise>"))
        .await;

    assert!(prompts(&response).is_empty());
    assert_eq!(stored_iteration(&dir).await, None);
}

#[tokio::test]
async fn test_stop_wins_over_idle_continuation() {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::with_sampler(&normalize(&json!({})), dir.path(), quiet());
    start_loop(&dir, 10).await;

    let stop = GatewayRequest::new(
        Channel::CommandBefore,
        json!({ "command": "autopilot-stop", "sessionID": "ses_1", "arguments": "" }),
        json!({ "parts": [] }),
    );
    let response = gateway.handle(stop).await;
    assert!(response.ok);
    assert!(gateway.stop_guard().is_stopped("ses_1"));

    let response = gateway.handle(idle("ses_1", "keep going")).await;
    assert!(prompts(&response).is_empty());
    assert_eq!(stored_iteration(&dir).await, None);
}

#[tokio::test]
async fn test_auto_pause_blocks_continuation_until_next_message() {
    let dir = TempDir::new().unwrap();
    let config = normalize(&json!({
        "processPressure": {
            "sampleCooldownToolCalls": 1,
            "criticalPauseAfterEvents": 1
        }
    }));
    let critical = ProcessPressureSample {
        total_rss_mb: config.process_pressure.critical_max_rss_mb + 1,
        process_count: 3,
    };
    let gateway = Gateway::with_sampler(&config, dir.path(), Arc::new(FixedSampler(critical)));
    start_loop(&dir, 10).await;

    let tool_after = GatewayRequest::new(
        Channel::ToolAfter,
        json!({ "tool": "bash", "sessionID": "ses_1", "callID": "c1" }),
        json!({ "title": "bash", "output": "done", "metadata": {} }),
    );
    let response = gateway.handle(tool_after).await;
    assert!(response.ok);
    let output = response.output["output"].as_str().unwrap();
    assert!(output.contains("[PROCESS PRESSURE CRITICAL]"));
    assert!(gateway.stop_guard().is_stopped("ses_1"));

    // Paused: idle does not inject, but the loop survives
    let response = gateway.handle(idle("ses_1", "working")).await;
    assert!(prompts(&response).is_empty());
    assert_eq!(stored_iteration(&dir).await, Some(1));

    // Operator speaks up: latch cleared, loop resumes
    let chat = GatewayRequest::new(
        Channel::ChatMessage,
        json!({ "sessionID": "ses_1" }),
        json!({ "parts": [{ "type": "text", "text": "memory is fine now, continue" }] }),
    );
    assert!(gateway.handle(chat).await.ok);
    assert!(!gateway.stop_guard().is_stopped("ses_1"));

    let response = gateway.handle(idle("ses_1", "working")).await;
    assert_eq!(prompts(&response).len(), 1);
    assert_eq!(stored_iteration(&dir).await, Some(2));
}

#[tokio::test]
async fn test_config_order_and_disabled_shape_dispatch() {
    let dir = TempDir::new().unwrap();
    let config = normalize(&json!({
        "order": ["context-window-monitor", "autopilot"],
        "disabled": ["preemptive-compaction"]
    }));
    let gateway = Gateway::with_sampler(&config, dir.path(), quiet());

    assert_eq!(
        gateway.hook_ids(),
        vec![
            "context-window-monitor",
            "autopilot",
            "stop-continuation-guard",
            "process-pressure-monitor",
        ]
    );
}

#[tokio::test]
async fn test_session_deleted_cleans_up_loop() {
    let dir = TempDir::new().unwrap();
    let gateway = Gateway::with_sampler(&normalize(&json!({})), dir.path(), quiet());
    start_loop(&dir, 10).await;

    let deleted = GatewayRequest::new(
        Channel::Event,
        json!({ "type": "session.deleted", "properties": { "info": { "id": "ses_1" } } }),
        Value::Null,
    );
    assert!(gateway.handle(deleted).await.ok);
    assert_eq!(stored_iteration(&dir).await, None);
}
