//! Hook contract shared by every policy module
//!
//! A hook has a stable kebab-case id, a numeric priority used when the
//! config does not place it explicitly, a declared failure policy and one
//! async handler that sees every event on every channel.

use async_trait::async_trait;
use hookgate_core::{
    Channel, ChatInput, ChatOutput, CommandInput, CommandOutput, LifecycleEvent, Result,
    ToolAfterOutput, ToolBeforeOutput, ToolInput, TransformInput, TransformOutput,
};

/// What the dispatcher does when a hook fails with something other than a
/// deliberate block on a before channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Log, audit, keep going
    FailOpen,
    /// Turn the failure into a block of the underlying action
    FailClosed,
}

/// One event as seen by a hook
///
/// Outputs are borrowed mutably: a rewrite by one hook is what the next
/// hook in the order observes.
#[derive(Debug)]
pub enum HookEvent<'a> {
    Lifecycle(&'a LifecycleEvent),
    ToolBefore {
        input: &'a ToolInput,
        output: &'a mut ToolBeforeOutput,
    },
    ToolAfter {
        input: &'a ToolInput,
        output: &'a mut ToolAfterOutput,
    },
    CommandBefore {
        input: &'a CommandInput,
        output: &'a mut CommandOutput,
    },
    ChatMessage {
        input: &'a ChatInput,
        output: &'a mut ChatOutput,
    },
    MessagesTransform {
        input: &'a TransformInput,
        output: &'a mut TransformOutput,
    },
}

impl HookEvent<'_> {
    pub fn channel(&self) -> Channel {
        match self {
            Self::Lifecycle(_) => Channel::Event,
            Self::ToolBefore { .. } => Channel::ToolBefore,
            Self::ToolAfter { .. } => Channel::ToolAfter,
            Self::CommandBefore { .. } => Channel::CommandBefore,
            Self::ChatMessage { .. } => Channel::ChatMessage,
            Self::MessagesTransform { .. } => Channel::MessagesTransform,
        }
    }

    /// Lifecycle type for generic events, the channel name otherwise
    pub fn event_type(&self) -> &str {
        match self {
            Self::Lifecycle(event) => &event.event_type,
            other => other.channel().as_str(),
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        let id = match self {
            Self::Lifecycle(event) => return event.session_id(),
            Self::ToolBefore { input, .. } | Self::ToolAfter { input, .. } => &input.session_id,
            Self::CommandBefore { input, .. } => &input.session_id,
            Self::ChatMessage { input, .. } => &input.session_id,
            Self::MessagesTransform { .. } => return None,
        };
        Some(id.as_str()).filter(|s| !s.is_empty())
    }
}

/// Trait implemented by every policy hook
#[async_trait]
pub trait Hook: Send + Sync {
    /// Stable, unique, kebab-case identifier
    fn id(&self) -> &str;

    /// Lower runs earlier among hooks not named in the config order
    fn priority(&self) -> i32;

    /// Declared behaviour for internal errors on before channels
    fn failure_policy(&self) -> FailurePolicy;

    /// Handle one event
    ///
    /// Returning [`hookgate_core::HookgateError::Blocked`] on a before
    /// channel vetoes the action. Hooks ignore channels they do not care
    /// about by returning `Ok(())`.
    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()>;
}
