//! Preemptive compaction
//!
//! Same usage tracking as the context-window monitor, with a higher
//! threshold and a stronger action: instead of a reminder it asks the host to
//! summarize the session before the window overflows. One request is in
//! flight at a time per session; `session.compacted` clears the latch and
//! resets usage. A separate tool-call cooldown keeps a slow or failing host
//! from being asked on every event.

use async_trait::async_trait;
use hookgate_core::config::CompactionConfig;
use hookgate_core::{AuditEntry, AuditLog, AuditStage, LifecycleEvent, Result};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

use crate::context_window::{reported_usage, SessionUsage};
use crate::hooks::{FailurePolicy, Hook, HookEvent};
use crate::host::HostClient;
use crate::state_store::{cooled_down, BoundedSessionMap};

pub const COMPACTION_HOOK_ID: &str = "preemptive-compaction";
const COMPACTION_PRIORITY: i32 = 75;
/// Advisory monitor
const COMPACTION_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

#[derive(Debug, Default)]
struct CompactionState {
    usage: SessionUsage,
    last_compaction_at: Option<u64>,
    in_flight: bool,
}

/// Hook requesting a summarize before the context window overflows
pub struct PreemptiveCompactionHook {
    config: CompactionConfig,
    host: Arc<dyn HostClient>,
    audit: AuditLog,
    sessions: Mutex<BoundedSessionMap<CompactionState>>,
}

impl PreemptiveCompactionHook {
    pub fn new(config: CompactionConfig, host: Arc<dyn HostClient>, audit: AuditLog) -> Self {
        let capacity = config.max_session_state_entries as usize;
        Self {
            config,
            host,
            audit,
            sessions: Mutex::new(BoundedSessionMap::new(capacity)),
        }
    }

    /// Whether a summarize request is outstanding for the session
    pub fn in_flight(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .is_some_and(|state| state.in_flight)
    }

    /// Update state for one event; returns true if a compaction should start
    fn observe(&self, session_id: &str, update: impl FnOnce(&mut SessionUsage)) -> bool {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let state = sessions.entry(session_id);
        update(&mut state.usage);

        if state.in_flight {
            return false;
        }
        let ratio = state.usage.ratio(self.config.default_context_limit_tokens);
        if ratio < self.config.warning_threshold {
            return false;
        }
        let now = state.usage.tool_calls;
        if !cooled_down(
            state.last_compaction_at,
            now,
            self.config.compaction_cooldown_tool_calls,
        ) {
            return false;
        }

        state.in_flight = true;
        state.last_compaction_at = Some(now);
        true
    }

    /// Clear the in-flight latch; the cooldown still applies
    fn release(&self, session_id: &str) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(state) = sessions.get_mut(session_id) {
            state.in_flight = false;
        }
    }

    async fn compact(&self, session_id: &str, event_type: &str) {
        info!("Requesting preemptive compaction for {}", session_id);
        let (stage, reason) = match self.host.summarize(session_id).await {
            Ok(()) => (AuditStage::Inject, "compaction_requested"),
            Err(e) => {
                warn!("Compaction request for {} failed: {}", session_id, e);
                self.release(session_id);
                (AuditStage::Skip, "compaction_failed")
            }
        };

        self.audit
            .record(
                AuditEntry::new(COMPACTION_HOOK_ID, stage, reason)
                    .event(event_type)
                    .session(session_id),
            )
            .await;
    }

    async fn on_lifecycle(&self, event: &LifecycleEvent) {
        if let Some(usage) = reported_usage(event) {
            if self.observe(&usage.session_id, |u| u.record_reported(&usage)) {
                self.compact(&usage.session_id, "message.updated").await;
            }
            return;
        }

        let Some(session_id) = event.session_id() else {
            return;
        };
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        match event.event_type.as_str() {
            "session.compacted" => {
                if let Some(state) = sessions.get_mut(session_id) {
                    state.in_flight = false;
                    state.usage.reset();
                }
            }
            "session.deleted" => {
                sessions.remove(session_id);
            }
            _ => {}
        }
    }
}

#[async_trait]
impl Hook for PreemptiveCompactionHook {
    fn id(&self) -> &str {
        COMPACTION_HOOK_ID
    }

    fn priority(&self) -> i32 {
        COMPACTION_PRIORITY
    }

    fn failure_policy(&self) -> FailurePolicy {
        COMPACTION_FAILURE_POLICY
    }

    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()> {
        match event {
            HookEvent::ToolAfter { input, output } => {
                let session_id = input.session_id.as_str();
                if session_id.is_empty() {
                    return Ok(());
                }
                let text = output.output.as_str();
                if self.observe(session_id, |u| u.record_tool_output(text)) {
                    self.compact(session_id, "tool.execute.after").await;
                }
            }
            HookEvent::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle).await,
            _ => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BufferedHost;
    use hookgate_core::{
        HookgateError, HostEffect, Notice, SessionMessage, Todo, ToolAfterOutput, ToolInput,
    };
    use serde_json::json;

    fn config() -> CompactionConfig {
        CompactionConfig {
            default_context_limit_tokens: 1_000,
            warning_threshold: 0.8,
            compaction_cooldown_tool_calls: 3,
            ..CompactionConfig::default()
        }
    }

    fn updated(session: &str, input: u64) -> LifecycleEvent {
        LifecycleEvent::new(
            "message.updated",
            json!({
                "info": { "role": "assistant", "sessionID": session, "tokens": { "input": input } }
            }),
        )
    }

    async fn tool_call(hook: &PreemptiveCompactionHook, session: &str) {
        let input = ToolInput {
            tool: "bash".into(),
            session_id: session.into(),
            call_id: "c".into(),
        };
        let mut output = ToolAfterOutput::default();
        hook.handle(&mut HookEvent::ToolAfter {
            input: &input,
            output: &mut output,
        })
        .await
        .unwrap();
    }

    async fn lifecycle(hook: &PreemptiveCompactionHook, event: LifecycleEvent) {
        hook.handle(&mut HookEvent::Lifecycle(&event)).await.unwrap();
    }

    fn summarize_count(host: &BufferedHost) -> usize {
        host.effects()
            .iter()
            .filter(|e| matches!(e, HostEffect::Summarize { .. }))
            .count()
    }

    #[tokio::test]
    async fn test_below_threshold_does_nothing() {
        let host = Arc::new(BufferedHost::new());
        let hook = PreemptiveCompactionHook::new(config(), host.clone(), AuditLog::disabled());
        lifecycle(&hook, updated("ses_1", 500)).await;
        assert_eq!(summarize_count(&host), 0);
    }

    #[tokio::test]
    async fn test_crossing_requests_one_summarize() {
        let host = Arc::new(BufferedHost::new());
        let hook = PreemptiveCompactionHook::new(config(), host.clone(), AuditLog::disabled());

        lifecycle(&hook, updated("ses_1", 850)).await;
        assert_eq!(summarize_count(&host), 1);
        assert!(hook.in_flight("ses_1"));

        // Latched until the host reports the compaction
        for _ in 0..5 {
            tool_call(&hook, "ses_1").await;
        }
        lifecycle(&hook, updated("ses_1", 900)).await;
        assert_eq!(summarize_count(&host), 1);

        lifecycle(
            &hook,
            LifecycleEvent::new("session.compacted", json!({ "sessionID": "ses_1" })),
        )
        .await;
        assert!(!hook.in_flight("ses_1"));

        // Usage was reset, so the old reading no longer counts
        tool_call(&hook, "ses_1").await;
        assert_eq!(summarize_count(&host), 1);
    }

    #[tokio::test]
    async fn test_cooldown_after_compaction() {
        let host = Arc::new(BufferedHost::new());
        let hook = PreemptiveCompactionHook::new(config(), host.clone(), AuditLog::disabled());

        tool_call(&hook, "ses_1").await;
        lifecycle(&hook, updated("ses_1", 900)).await;
        assert_eq!(summarize_count(&host), 1);
        lifecycle(
            &hook,
            LifecycleEvent::new("session.compacted", json!({ "sessionID": "ses_1" })),
        )
        .await;

        // Immediately over the threshold again, but within the cooldown
        lifecycle(&hook, updated("ses_1", 950)).await;
        assert_eq!(summarize_count(&host), 1);

        for _ in 0..3 {
            tool_call(&hook, "ses_1").await;
        }
        assert_eq!(summarize_count(&host), 2);
    }

    struct FailingHost;

    #[async_trait]
    impl HostClient for FailingHost {
        async fn session_messages(&self, _: &str) -> Result<Vec<SessionMessage>> {
            Ok(Vec::new())
        }
        async fn session_todos(&self, _: &str) -> Result<Vec<Todo>> {
            Ok(Vec::new())
        }
        async fn send_prompt(&self, _: &str, _: &str) -> Result<()> {
            Ok(())
        }
        async fn summarize(&self, _: &str) -> Result<()> {
            Err(HookgateError::Host("summarize unavailable".into()))
        }
        async fn notify(&self, _: Notice) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failed_request_releases_latch() {
        let hook =
            PreemptiveCompactionHook::new(config(), Arc::new(FailingHost), AuditLog::disabled());
        lifecycle(&hook, updated("ses_1", 900)).await;
        assert!(!hook.in_flight("ses_1"));
    }

    #[tokio::test]
    async fn test_session_deleted_drops_state() {
        let host = Arc::new(BufferedHost::new());
        let hook = PreemptiveCompactionHook::new(config(), host.clone(), AuditLog::disabled());
        lifecycle(&hook, updated("ses_1", 900)).await;
        assert!(hook.in_flight("ses_1"));

        lifecycle(
            &hook,
            LifecycleEvent::new("session.deleted", json!({ "info": { "id": "ses_1" } })),
        )
        .await;
        assert!(!hook.in_flight("ses_1"));
    }
}
