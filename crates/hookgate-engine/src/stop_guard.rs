//! Stop-continuation guard
//!
//! [`StopGuard`] is the shared latch: a set of sessions whose operator asked
//! the continuation loop to stop. [`StopContinuationGuardHook`] is the hook
//! that sets it from stop commands and clears it on the next chat message or
//! on session deletion. The autopilot hook consults it before every
//! re-injection, so a stop always wins over an idle-triggered continuation.
//!
//! The set is process-local and never persisted; a restart is a reset.

use async_trait::async_trait;
use hookgate_core::config::StopGuardConfig;
use hookgate_core::{
    AuditEntry, AuditLog, AuditStage, ChatOutput, Result, ToolBeforeOutput, ToolInput,
};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, PoisonError, RwLock};
use tracing::info;

use crate::hooks::{FailurePolicy, Hook, HookEvent};

pub const STOP_GUARD_HOOK_ID: &str = "stop-continuation-guard";
const STOP_GUARD_PRIORITY: i32 = 10;
/// Advisory: a broken guard must not block unrelated tool calls
const STOP_GUARD_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

/// Shared set of stopped sessions
#[derive(Debug, Default)]
pub struct StopGuard {
    stopped: RwLock<HashSet<String>>,
}

impl StopGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_stopped(&self, session_id: &str) -> bool {
        self.stopped
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(session_id)
    }

    /// Mark a session stopped; returns true if it was not already
    pub fn stop(&self, session_id: &str) -> bool {
        self.stopped
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session_id.to_string())
    }

    /// Clear a session; returns true if it was stopped
    pub fn clear(&self, session_id: &str) -> bool {
        self.stopped
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id)
    }

    /// Stopped sessions in sorted order
    pub fn stopped_sessions(&self) -> Vec<String> {
        self.stopped
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Recognises stop commands, canonical and legacy
#[derive(Debug, Clone, Default)]
pub struct StopCommands {
    names: HashSet<String>,
    slash_tools: HashSet<String>,
}

impl StopCommands {
    pub fn from_config(config: &StopGuardConfig) -> Self {
        Self {
            names: config
                .command_names
                .iter()
                .chain(config.legacy_command_names.iter())
                .map(|name| name.trim_start_matches('/').to_lowercase())
                .collect(),
            slash_tools: config
                .slash_command_tools
                .iter()
                .map(|tool| tool.to_lowercase())
                .collect(),
        }
    }

    /// Whether a command line (`/autopilot-stop now`, `ralph-stop`) names a stop command
    pub fn matches_command(&self, command: &str) -> bool {
        command
            .split_whitespace()
            .next()
            .map(|name| name.trim_start_matches('/').to_lowercase())
            .is_some_and(|name| self.names.contains(&name))
    }

    /// Whether a slash-command tool call carries a stop command
    pub fn matches_tool(&self, input: &ToolInput, output: &ToolBeforeOutput) -> bool {
        self.slash_tools.contains(&input.tool.to_lowercase())
            && output.command().is_some_and(|cmd| self.matches_command(cmd))
    }

    /// Whether a chat message is itself the stop command being echoed
    pub fn matches_chat(&self, output: &ChatOutput) -> bool {
        output
            .parts
            .iter()
            .filter_map(|part| part.text.as_deref())
            .map(str::trim_start)
            .find(|text| !text.is_empty())
            .is_some_and(|text| text.starts_with('/') && self.matches_command(text))
    }
}

/// Hook maintaining the [`StopGuard`] latch
pub struct StopContinuationGuardHook {
    guard: Arc<StopGuard>,
    commands: StopCommands,
    audit: AuditLog,
}

impl StopContinuationGuardHook {
    pub fn new(config: &StopGuardConfig, guard: Arc<StopGuard>, audit: AuditLog) -> Self {
        Self {
            guard,
            commands: StopCommands::from_config(config),
            audit,
        }
    }

    async fn latch(&self, session_id: &str, event_type: &str) {
        if session_id.is_empty() {
            return;
        }
        if self.guard.stop(session_id) {
            info!("Stop requested for session {}", session_id);
        }
        self.audit
            .record(
                AuditEntry::new(STOP_GUARD_HOOK_ID, AuditStage::State, "stop_requested")
                    .event(event_type)
                    .session(session_id),
            )
            .await;
    }

    async fn release(&self, session_id: &str, event_type: &str) {
        if self.guard.clear(session_id) {
            info!("Stop cleared for session {}", session_id);
            self.audit
                .record(
                    AuditEntry::new(STOP_GUARD_HOOK_ID, AuditStage::State, "stop_cleared")
                        .event(event_type)
                        .session(session_id),
                )
                .await;
        }
    }
}

#[async_trait]
impl Hook for StopContinuationGuardHook {
    fn id(&self) -> &str {
        STOP_GUARD_HOOK_ID
    }

    fn priority(&self) -> i32 {
        STOP_GUARD_PRIORITY
    }

    fn failure_policy(&self) -> FailurePolicy {
        STOP_GUARD_FAILURE_POLICY
    }

    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()> {
        match event {
            HookEvent::ToolBefore { input, output } => {
                if self.commands.matches_tool(input, output) {
                    self.latch(&input.session_id, "tool.execute.before").await;
                }
            }
            HookEvent::CommandBefore { input, .. } => {
                if self.commands.matches_command(&input.command) {
                    self.latch(&input.session_id, "command.execute.before").await;
                }
            }
            HookEvent::ChatMessage { input, output } => {
                if !self.commands.matches_chat(output) {
                    self.release(&input.session_id, "chat.message").await;
                }
            }
            HookEvent::Lifecycle(lifecycle) if lifecycle.event_type == "session.deleted" => {
                if let Some(session_id) = lifecycle.session_id() {
                    self.release(session_id, "session.deleted").await;
                }
            }
            _ => {}
        }
        Ok(())
    }
}
