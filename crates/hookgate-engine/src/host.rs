//! Host client abstraction
//!
//! Hooks never talk to the host runtime directly; they go through
//! [`HostClient`]. A real adapter forwards to the host SDK. [`BufferedHost`]
//! serves history from a request envelope and records every requested
//! action as a [`HostEffect`], which is what the CLI shim and the tests use.

use async_trait::async_trait;
use hookgate_core::{
    HookgateError, HostContext, HostEffect, Notice, Result, SessionMessage, SessionSnapshot, Todo,
};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Calls a hook may make back into the host
#[async_trait]
pub trait HostClient: Send + Sync {
    /// Recent message history for a session, oldest first
    async fn session_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>>;

    /// The session's todo list
    async fn session_todos(&self, session_id: &str) -> Result<Vec<Todo>>;

    /// Inject a user prompt into the session
    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()>;

    /// Ask the host to summarize (compact) the session
    async fn summarize(&self, session_id: &str) -> Result<()>;

    /// Show an operator-facing notification
    async fn notify(&self, notice: Notice) -> Result<()>;
}

#[derive(Debug, Default)]
struct BufferedState {
    context: HostContext,
    effects: Vec<HostEffect>,
}

/// Host client backed by envelope context, recording effects
#[derive(Debug, Default)]
pub struct BufferedHost {
    state: Mutex<BufferedState>,
}

impl BufferedHost {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BufferedState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Replace the session snapshots served to hooks
    pub fn load_context(&self, context: HostContext) {
        self.lock().context = context;
    }

    /// Set (or replace) one session's snapshot
    pub fn set_session(&self, session_id: impl Into<String>, snapshot: SessionSnapshot) {
        self.lock().context.sessions.insert(session_id.into(), snapshot);
    }

    /// Drain recorded effects
    pub fn take_effects(&self) -> Vec<HostEffect> {
        std::mem::take(&mut self.lock().effects)
    }

    /// Copy of recorded effects, leaving them in place
    pub fn effects(&self) -> Vec<HostEffect> {
        self.lock().effects.clone()
    }

    fn snapshot(&self, session_id: &str) -> Result<SessionSnapshot> {
        self.lock()
            .context
            .sessions
            .get(session_id)
            .cloned()
            .ok_or_else(|| {
                HookgateError::Host(format!("no history supplied for session {}", session_id))
            })
    }

    fn push(&self, effect: HostEffect) {
        debug!("Recording host effect: {:?}", effect);
        self.lock().effects.push(effect);
    }
}

#[async_trait]
impl HostClient for BufferedHost {
    async fn session_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>> {
        Ok(self.snapshot(session_id)?.messages)
    }

    async fn session_todos(&self, session_id: &str) -> Result<Vec<Todo>> {
        Ok(self.snapshot(session_id)?.todos)
    }

    async fn send_prompt(&self, session_id: &str, text: &str) -> Result<()> {
        self.push(HostEffect::SendPrompt {
            session_id: session_id.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn summarize(&self, session_id: &str) -> Result<()> {
        self.push(HostEffect::Summarize {
            session_id: session_id.to_string(),
        });
        Ok(())
    }

    async fn notify(&self, notice: Notice) -> Result<()> {
        self.push(HostEffect::Notify { notice });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hookgate_core::NoticeLevel;

    #[tokio::test]
    async fn test_serves_supplied_history() {
        let host = BufferedHost::new();
        host.set_session(
            "ses_1",
            SessionSnapshot {
                messages: vec![SessionMessage::new("assistant", "hello")],
                todos: vec![Todo::new("write tests", "pending")],
            },
        );

        let messages = host.session_messages("ses_1").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(host.session_todos("ses_1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_session_is_an_error() {
        let host = BufferedHost::new();
        assert!(matches!(
            host.session_messages("nope").await,
            Err(HookgateError::Host(_))
        ));
    }

    #[tokio::test]
    async fn test_effects_are_recorded_and_drained() {
        let host = BufferedHost::new();
        host.send_prompt("s", "keep going").await.unwrap();
        host.summarize("s").await.unwrap();
        host.notify(Notice::new("t", "m", NoticeLevel::Info)).await.unwrap();

        assert_eq!(host.effects().len(), 3);
        let drained = host.take_effects();
        assert_eq!(drained.len(), 3);
        assert!(matches!(drained[1], HostEffect::Summarize { .. }));
        assert!(host.take_effects().is_empty());
    }

    #[tokio::test]
    async fn test_load_context_replaces_sessions() {
        let host = BufferedHost::new();
        host.set_session("old", SessionSnapshot::default());
        host.load_context(HostContext::default());
        assert!(host.session_messages("old").await.is_err());
    }
}
