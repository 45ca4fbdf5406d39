//! Sequential event dispatcher
//!
//! Runs every active hook for an event, in resolved order, one at a time.
//! Each handler is awaited before the next starts, so a rewrite of the
//! mutable output by one hook is what the next one sees.
//!
//! Failure handling depends on the channel:
//! - Before channels: a [`HookgateError::Blocked`] stops dispatch and goes
//!   back to the host unmodified. Other errors follow the hook's declared
//!   [`FailurePolicy`].
//! - Observational channels: every error is logged, audited and skipped.

use hookgate_core::{
    AuditEntry, AuditLog, AuditStage, ChatInput, ChatOutput, CommandInput, CommandOutput,
    GatewayConfig, HookgateError, LifecycleEvent, Result, ToolAfterOutput, ToolBeforeOutput,
    ToolInput, TransformInput, TransformOutput,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hooks::{FailurePolicy, Hook, HookEvent};
use crate::registry::{resolve, resolved_ids};

const DISPATCHER_AUDIT_ID: &str = "dispatcher";

/// Dispatcher over a fixed, resolved hook order
pub struct Dispatcher {
    hooks: Vec<Arc<dyn Hook>>,
    audit: AuditLog,
}

impl Dispatcher {
    /// Resolve `hooks` against the config's order and disabled set
    ///
    /// With the global switch off the dispatcher runs nothing.
    pub fn new(hooks: Vec<Arc<dyn Hook>>, config: &GatewayConfig, audit: AuditLog) -> Self {
        let hooks = if config.enabled {
            resolve(&hooks, &config.order, &config.disabled)
        } else {
            Vec::new()
        };
        info!("Dispatch order: {:?}", resolved_ids(&hooks));
        Self { hooks, audit }
    }

    /// Ids of the active hooks, in dispatch order
    pub fn hook_ids(&self) -> Vec<String> {
        resolved_ids(&self.hooks)
    }

    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Run every hook for one event
    pub async fn dispatch(&self, event: &mut HookEvent<'_>) -> Result<()> {
        let channel = event.channel();
        let event_type = event.event_type().to_string();
        let session_id = event.session_id().unwrap_or_default().to_string();

        debug!("Dispatching {} to {} hooks", event_type, self.hooks.len());
        self.record(
            DISPATCHER_AUDIT_ID,
            AuditStage::Dispatch,
            "dispatched",
            &event_type,
            &session_id,
        )
        .await;

        for hook in &self.hooks {
            let err = match hook.handle(event).await {
                Ok(()) => continue,
                Err(e) => e,
            };

            if channel.is_before() && err.is_blocked() {
                info!("Hook {} blocked {}: {}", hook.id(), event_type, err);
                self.record(
                    hook.id(),
                    AuditStage::Dispatch,
                    "blocked",
                    &event_type,
                    &session_id,
                )
                .await;
                return Err(err);
            }

            if channel.is_before() && hook.failure_policy() == FailurePolicy::FailClosed {
                warn!(
                    "Hook {} failed closed on {}: {}",
                    hook.id(), event_type, err
                );
                self.record(
                    hook.id(),
                    AuditStage::Dispatch,
                    "failed_closed",
                    &event_type,
                    &session_id,
                )
                .await;
                return Err(HookgateError::blocked(
                    hook.id(),
                    format!("{} could not verify this action: {}", hook.id(), err),
                ));
            }

            warn!(
                "Hook {} failed on {} (continuing): {}",
                hook.id(), event_type, err
            );
            self.record(
                hook.id(),
                AuditStage::Skip,
                "hook_error",
                &event_type,
                &session_id,
            )
            .await;
        }

        Ok(())
    }

    async fn record(
        &self,
        hook_id: &str,
        stage: AuditStage,
        reason: &str,
        event_type: &str,
        session_id: &str,
    ) {
        self.audit
            .record(
                AuditEntry::new(hook_id, stage, reason)
                    .event(event_type)
                    .session(session_id),
            )
            .await;
    }

    /// Generic lifecycle event
    pub async fn event(&self, event: &LifecycleEvent) -> Result<()> {
        self.dispatch(&mut HookEvent::Lifecycle(event)).await
    }

    /// `tool.execute.before`; an `Err` means the tool call is blocked
    pub async fn tool_before(
        &self,
        input: &ToolInput,
        output: &mut ToolBeforeOutput,
    ) -> Result<()> {
        self.dispatch(&mut HookEvent::ToolBefore { input, output }).await
    }

    /// `tool.execute.after`
    pub async fn tool_after(&self, input: &ToolInput, output: &mut ToolAfterOutput) -> Result<()> {
        self.dispatch(&mut HookEvent::ToolAfter { input, output }).await
    }

    /// `command.execute.before`; an `Err` means the command is blocked
    pub async fn command_before(
        &self,
        input: &CommandInput,
        output: &mut CommandOutput,
    ) -> Result<()> {
        self.dispatch(&mut HookEvent::CommandBefore { input, output }).await
    }

    /// `chat.message`
    pub async fn chat_message(&self, input: &ChatInput, output: &mut ChatOutput) -> Result<()> {
        self.dispatch(&mut HookEvent::ChatMessage { input, output }).await
    }

    /// `experimental.chat.messages.transform`
    pub async fn messages_transform(
        &self,
        input: &TransformInput,
        output: &mut TransformOutput,
    ) -> Result<()> {
        self.dispatch(&mut HookEvent::MessagesTransform { input, output }).await
    }
}
