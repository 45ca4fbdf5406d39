//! Context-window usage tracking and reminders
//!
//! Usage comes from the host when it reports token counts on
//! `message.updated`; until then it is estimated from tool output at roughly
//! four characters per token. When the usage ratio crosses the warning
//! threshold the monitor appends a reminder to the next tool output, gated
//! by a tool-call cooldown and a minimum token growth since the last one.

use async_trait::async_trait;
use hookgate_core::config::ContextWindowConfig;
use hookgate_core::{AuditEntry, AuditLog, AuditStage, LifecycleEvent, Result};
use serde_json::Value;
use std::sync::{Mutex, PoisonError};
use tracing::debug;

use crate::hooks::{FailurePolicy, Hook, HookEvent};
use crate::state_store::{cooled_down, BoundedSessionMap};

pub const CONTEXT_WINDOW_HOOK_ID: &str = "context-window-monitor";
const CONTEXT_WINDOW_PRIORITY: i32 = 70;
/// Advisory monitor
const CONTEXT_WINDOW_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

/// Estimate token count from text using the chars/4 heuristic
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.chars().count() as u64;
    chars.div_ceil(4)
}

/// Token usage the host reported for one assistant message
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ReportedUsage {
    pub session_id: String,
    pub tokens: u64,
    pub limit: Option<u64>,
}

/// Pull usage out of a `message.updated` event
///
/// Only assistant messages count. Usage is `tokens.input +
/// tokens.cache.read`; a zero total (message still streaming) is ignored.
pub(crate) fn reported_usage(event: &LifecycleEvent) -> Option<ReportedUsage> {
    if event.event_type != "message.updated" {
        return None;
    }
    let info = event.properties.get("info")?;
    if info.get("role").and_then(Value::as_str) != Some("assistant") {
        return None;
    }

    let tokens = info.get("tokens")?;
    let input = tokens.get("input").and_then(Value::as_u64).unwrap_or(0);
    let cache_read = tokens
        .pointer("/cache/read")
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let total = input.saturating_add(cache_read);
    if total == 0 {
        return None;
    }

    Some(ReportedUsage {
        session_id: event.session_id()?.to_string(),
        tokens: total,
        limit: info
            .get("contextLimit")
            .and_then(Value::as_u64)
            .filter(|limit| *limit > 0),
    })
}

/// Tracked usage for one session
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionUsage {
    /// Last host-reported usage, authoritative when present
    pub reported_tokens: Option<u64>,
    /// Running estimate from tool output
    pub estimated_tokens: u64,
    /// Host-supplied context limit
    pub limit_tokens: Option<u64>,
    pub tool_calls: u64,
}

impl SessionUsage {
    pub fn used(&self) -> u64 {
        self.reported_tokens.unwrap_or(self.estimated_tokens)
    }

    pub fn limit(&self, default_limit: u64) -> u64 {
        self.limit_tokens.unwrap_or(default_limit)
    }

    pub fn ratio(&self, default_limit: u64) -> f64 {
        match self.limit(default_limit) {
            0 => 0.0,
            limit => self.used() as f64 / limit as f64,
        }
    }

    /// Count a tool call and add its output to the estimate
    pub fn record_tool_output(&mut self, text: &str) {
        self.tool_calls += 1;
        self.estimated_tokens = self.estimated_tokens.saturating_add(estimate_tokens(text));
    }

    pub(crate) fn record_reported(&mut self, usage: &ReportedUsage) {
        self.reported_tokens = Some(usage.tokens);
        if usage.limit.is_some() {
            self.limit_tokens = usage.limit;
        }
    }

    /// Forget usage after the host compacted the session
    pub fn reset(&mut self) {
        self.reported_tokens = None;
        self.estimated_tokens = 0;
    }
}

#[derive(Debug, Default)]
struct MonitorState {
    usage: SessionUsage,
    last_reminder_at: Option<u64>,
    last_reminder_tokens: Option<u64>,
}

/// Hook reminding the agent when the context window fills up
pub struct ContextWindowMonitorHook {
    config: ContextWindowConfig,
    audit: AuditLog,
    sessions: Mutex<BoundedSessionMap<MonitorState>>,
}

impl ContextWindowMonitorHook {
    pub fn new(config: ContextWindowConfig, audit: AuditLog) -> Self {
        let capacity = config.max_session_state_entries as usize;
        Self {
            config,
            audit,
            sessions: Mutex::new(BoundedSessionMap::new(capacity)),
        }
    }

    /// Current usage snapshot for a session
    pub fn usage(&self, session_id: &str) -> Option<SessionUsage> {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .map(|state| state.usage.clone())
    }

    /// Record a tool call; returns the reminder to append, if one is due
    fn observe_tool_output(&self, session_id: &str, text: &str) -> Option<String> {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        let state = sessions.entry(session_id);
        state.usage.record_tool_output(text);

        let limit = self.config.default_context_limit_tokens;
        let ratio = state.usage.ratio(limit);
        if ratio < self.config.warning_threshold {
            return None;
        }

        let now = state.usage.tool_calls;
        let used = state.usage.used();
        if !cooled_down(
            state.last_reminder_at,
            now,
            self.config.reminder_cooldown_tool_calls,
        ) {
            return None;
        }
        if let Some(last) = state.last_reminder_tokens {
            if used.saturating_sub(last) < self.config.min_token_delta_for_reminder {
                debug!(
                    "Context reminder for {} suppressed: usage grew too little",
                    session_id
                );
                return None;
            }
        }

        state.last_reminder_at = Some(now);
        state.last_reminder_tokens = Some(used);
        Some(format!(
            "[CONTEXT WINDOW]\nContext usage is at {:.0}% ({} of {} tokens). Keep \
             responses concise, avoid reading large files whole, and wrap up the \
             current step before starting new work.",
            ratio * 100.0,
            used,
            state.usage.limit(limit)
        ))
    }

    fn on_lifecycle(&self, event: &LifecycleEvent) {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(usage) = reported_usage(event) {
            sessions.entry(&usage.session_id).usage.record_reported(&usage);
            return;
        }

        let Some(session_id) = event.session_id() else {
            return;
        };
        match event.event_type.as_str() {
            "session.compacted" => {
                if let Some(state) = sessions.get_mut(session_id) {
                    state.usage.reset();
                    state.last_reminder_tokens = None;
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
impl Hook for ContextWindowMonitorHook {
    fn id(&self) -> &str {
        CONTEXT_WINDOW_HOOK_ID
    }

    fn priority(&self) -> i32 {
        CONTEXT_WINDOW_PRIORITY
    }

    fn failure_policy(&self) -> FailurePolicy {
        CONTEXT_WINDOW_FAILURE_POLICY
    }

    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()> {
        match event {
            HookEvent::ToolAfter { input, output } => {
                if input.session_id.is_empty() {
                    return Ok(());
                }
                let reminder = self.observe_tool_output(&input.session_id, &output.output);
                if let Some(reminder) = reminder {
                    output.append_reminder(&reminder);
                    self.audit
                        .record(
                            AuditEntry::new(
                                CONTEXT_WINDOW_HOOK_ID,
                                AuditStage::Inject,
                                "context_reminder",
                            )
                            .event("tool.execute.after")
                            .session(input.session_id.as_str()),
                        )
                        .await;
                }
                Ok(())
            }
            HookEvent::Lifecycle(lifecycle) => {
                self.on_lifecycle(lifecycle);
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
