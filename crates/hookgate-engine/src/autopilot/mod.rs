//! Autopilot continuation loop
//!
//! Keeps a session working until it signals completion. Every time the
//! session goes idle while a loop is active, the hook inspects the latest
//! assistant reply and either finishes the loop or injects a continuation
//! prompt:
//!
//! ```text
//! inactive -> active -> completed | stopped | max-iterations-reached
//! ```
//!
//! Every terminal state deletes the persisted record. The decision itself is
//! the pure [`advance`] transition, applied inside the store's critical
//! section; the hook only gathers inputs and performs the resulting effects.

mod completion;
mod loop_state;
mod prompt;

pub use completion::{latest_assistant_text, CompletionDetector};
pub use loop_state::{AutopilotLoopState, LoopStateStore};
pub use prompt::build_continuation_prompt;

use async_trait::async_trait;
use hookgate_core::config::AutopilotConfig;
use hookgate_core::{
    AuditEntry, AuditLog, AuditStage, LifecycleEvent, Notice, NoticeLevel, Result, Todo,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::hooks::{FailurePolicy, Hook, HookEvent};
use crate::host::HostClient;
use crate::stop_guard::{StopCommands, StopGuard};

pub const AUTOPILOT_HOOK_ID: &str = "autopilot";
const AUTOPILOT_PRIORITY: i32 = 20;
/// Advisory: a broken loop must never block the operator's own actions
const AUTOPILOT_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

/// What the latest assistant reply said about completion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Pending,
    Complete { open_work: bool },
}

/// Outcome of one idle cycle
#[derive(Debug, Clone, PartialEq)]
enum Transition {
    /// Loop advanced; carries the state to build the prompt from
    Continue {
        state: AutopilotLoopState,
        ignored_completion: bool,
    },
    Completed {
        iteration: u64,
    },
    CapReached {
        iteration: u64,
        max_iterations: u64,
    },
    /// Stop guard latched between the first check and the write
    Stopped,
    /// State changed owner or went inactive under us
    NotOwned,
}

/// Pure loop transition for one idle event
///
/// Returns the state to persist (`None` deletes it) and the transition.
fn advance(
    mut state: AutopilotLoopState,
    session_id: &str,
    signal: Signal,
    max_ignored_completions: u64,
    stopped: bool,
) -> (Option<AutopilotLoopState>, Transition) {
    if !state.belongs_to(session_id) {
        return (Some(state), Transition::NotOwned);
    }
    if stopped {
        return (Some(state), Transition::Stopped);
    }

    let ignored_completion = match signal {
        Signal::Complete { open_work } => {
            if !open_work || state.ignored_completions >= max_ignored_completions {
                let iteration = state.iteration;
                return (None, Transition::Completed { iteration });
            }
            state.ignored_completions += 1;
            true
        }
        Signal::Pending => {
            state.ignored_completions = 0;
            false
        }
    };

    if !state.can_continue() {
        let transition = Transition::CapReached {
            iteration: state.iteration,
            max_iterations: state.max_iterations,
        };
        return (None, transition);
    }

    state.iteration += 1;
    (
        Some(state.clone()),
        Transition::Continue {
            state,
            ignored_completion,
        },
    )
}

/// Hook driving the continuation loop
pub struct AutopilotHook {
    config: AutopilotConfig,
    store: Arc<LoopStateStore>,
    host: Arc<dyn HostClient>,
    guard: Arc<StopGuard>,
    stop_commands: StopCommands,
    audit: AuditLog,
}

impl AutopilotHook {
    pub fn new(
        config: AutopilotConfig,
        store: Arc<LoopStateStore>,
        host: Arc<dyn HostClient>,
        guard: Arc<StopGuard>,
        stop_commands: StopCommands,
        audit: AuditLog,
    ) -> Self {
        Self {
            config,
            store,
            host,
            guard,
            stop_commands,
            audit,
        }
    }

    pub fn store(&self) -> &LoopStateStore {
        self.store.as_ref()
    }

    async fn record(&self, stage: AuditStage, reason: &str, event_type: &str, session_id: &str) {
        self.audit
            .record(
                AuditEntry::new(AUTOPILOT_HOOK_ID, stage, reason)
                    .event(event_type)
                    .session(session_id),
            )
            .await;
    }

    async fn notify(&self, session_id: &str, title: &str, message: String, level: NoticeLevel) {
        if !self.config.notify_on_stop {
            return;
        }
        let notice = Notice::new(title, message, level).for_session(session_id);
        if let Err(e) = self.host.notify(notice).await {
            warn!("Autopilot notification failed: {}", e);
        }
    }

    /// Load the loop state if it belongs to `session_id`
    async fn owned_state(&self, session_id: &str, event_type: &str) -> Option<AutopilotLoopState> {
        match self.store.load().await {
            Ok(Some(state)) if state.belongs_to(session_id) => Some(state),
            Ok(_) => None,
            Err(e) => {
                warn!("Autopilot state unavailable: {}", e);
                self.record(
                    AuditStage::Skip,
                    "state_unavailable",
                    event_type,
                    session_id,
                )
                .await;
                None
            }
        }
    }

    /// Delete the loop if it belongs to `session_id`
    async fn clear_for(&self, session_id: &str, event_type: &str, reason: &str) -> Result<()> {
        if self.store.clear_session(session_id).await? {
            info!("Autopilot loop for {} cleared ({})", session_id, reason);
            self.record(AuditStage::State, reason, event_type, session_id).await;
        }
        Ok(())
    }

    async fn on_idle(&self, session_id: &str) -> Result<()> {
        const EVENT: &str = "session.idle";

        let Some(state) = self.owned_state(session_id, EVENT).await else {
            return Ok(());
        };

        if self.guard.is_stopped(session_id) {
            debug!("Autopilot skipped: {} is stopped", session_id);
            self.record(AuditStage::Skip, "stopped", EVENT, session_id).await;
            return Ok(());
        }

        let messages = match self.host.session_messages(session_id).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Autopilot could not read history for {}: {}", session_id, e);
                self.record(AuditStage::Skip, "history_unavailable", EVENT, session_id)
                    .await;
                return Ok(());
            }
        };

        let detector = CompletionDetector::new(state.completion_mode, &state.completion_promise)?;
        let text = latest_assistant_text(&messages).unwrap_or_default();
        let signal = if detector.is_complete(&text) {
            Signal::Complete {
                open_work: self.has_open_work(session_id).await,
            }
        } else {
            Signal::Pending
        };

        let max_ignored = self.config.max_ignored_completion_cycles;
        let guard = self.guard.clone();
        let transition = self
            .store
            .update(|state| {
                let stopped = guard.is_stopped(session_id);
                advance(state, session_id, signal, max_ignored, stopped)
            })
            .await?;

        match transition {
            None | Some(Transition::NotOwned) => Ok(()),
            Some(Transition::Stopped) => {
                self.record(AuditStage::Skip, "stopped", EVENT, session_id).await;
                Ok(())
            }
            Some(Transition::Completed { iteration }) => {
                info!(
                    "Autopilot loop for {} completed at iteration {}",
                    session_id, iteration
                );
                self.record(AuditStage::State, "completed", EVENT, session_id).await;
                self.notify(
                    session_id,
                    "Autopilot complete",
                    format!("Completion signalled after {} iteration(s)", iteration),
                    NoticeLevel::Info,
                )
                .await;
                Ok(())
            }
            Some(Transition::CapReached {
                iteration,
                max_iterations,
            }) => {
                info!(
                    "Autopilot loop for {} hit its cap ({}/{})",
                    session_id, iteration, max_iterations
                );
                self.record(
                    AuditStage::State,
                    "max_iterations_reached",
                    EVENT,
                    session_id,
                )
                .await;
                self.notify(
                    session_id,
                    "Autopilot stopped",
                    format!("Max iterations reached ({}/{})", iteration, max_iterations),
                    NoticeLevel::Warning,
                )
                .await;
                Ok(())
            }
            Some(Transition::Continue {
                state,
                ignored_completion,
            }) => {
                if ignored_completion {
                    info!(
                        "Completion signal ignored for {}: todos still open",
                        session_id
                    );
                    self.record(AuditStage::State, "completion_ignored", EVENT, session_id)
                        .await;
                }
                self.inject(session_id, &state).await;
                Ok(())
            }
        }
    }

    async fn has_open_work(&self, session_id: &str) -> bool {
        match self.host.session_todos(session_id).await {
            Ok(todos) => todos.iter().any(Todo::is_open),
            Err(e) => {
                debug!(
                    "Todos unavailable for {}, honouring completion: {}",
                    session_id, e
                );
                false
            }
        }
    }

    async fn inject(&self, session_id: &str, state: &AutopilotLoopState) {
        // A stop that landed while we were writing still wins
        if self.guard.is_stopped(session_id) {
            self.record(AuditStage::Skip, "stopped", "session.idle", session_id).await;
            return;
        }

        let prompt = build_continuation_prompt(state);
        match self.host.send_prompt(session_id, &prompt).await {
            Ok(()) => {
                info!(
                    "Autopilot iteration {} injected into {}",
                    state.iteration, session_id
                );
                self.record(
                    AuditStage::Inject,
                    "continuation_sent",
                    "session.idle",
                    session_id,
                )
                .await;
            }
            Err(e) => {
                warn!("Autopilot continuation for {} failed: {}", session_id, e);
                self.record(
                    AuditStage::Skip,
                    "prompt_failed",
                    "session.idle",
                    session_id,
                )
                .await;
            }
        }
    }

    async fn on_lifecycle(&self, event: &LifecycleEvent) -> Result<()> {
        let Some(session_id) = event.session_id() else {
            return Ok(());
        };
        match event.event_type.as_str() {
            "session.idle" => self.on_idle(session_id).await,
            "session.deleted" => {
                self.clear_for(session_id, "session.deleted", "session_deleted")
                    .await
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Hook for AutopilotHook {
    fn id(&self) -> &str {
        AUTOPILOT_HOOK_ID
    }

    fn priority(&self) -> i32 {
        AUTOPILOT_PRIORITY
    }

    fn failure_policy(&self) -> FailurePolicy {
        AUTOPILOT_FAILURE_POLICY
    }

    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()> {
        match event {
            HookEvent::Lifecycle(lifecycle) => self.on_lifecycle(lifecycle).await,
            HookEvent::ToolBefore { input, output } => {
                if self.stop_commands.matches_tool(input, output) {
                    self.clear_for(&input.session_id, "tool.execute.before", "stop_command")
                        .await?;
                }
                Ok(())
            }
            HookEvent::CommandBefore { input, .. } => {
                if self.stop_commands.matches_command(&input.command) {
                    self.clear_for(&input.session_id, "command.execute.before", "stop_command")
                        .await?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::BufferedHost;
    use hookgate_core::config::{CompletionMode, StopGuardConfig};
    use hookgate_core::{CommandInput, CommandOutput, HostEffect, SessionMessage, SessionSnapshot};
    use serde_json::json;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        hook: AutopilotHook,
        host: Arc<BufferedHost>,
        guard: Arc<StopGuard>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let host = Arc::new(BufferedHost::new());
        let guard = Arc::new(StopGuard::new());
        let hook = AutopilotHook::new(
            AutopilotConfig::default(),
            Arc::new(LoopStateStore::new(dir.path().join("state.json"))),
            host.clone(),
            guard.clone(),
            StopCommands::from_config(&StopGuardConfig::default()),
            AuditLog::disabled(),
        );
        Fixture {
            _dir: dir,
            hook,
            host,
            guard,
        }
    }

    fn start(max: u64) -> AutopilotLoopState {
        AutopilotLoopState::new(
            "ses_1",
            "Refactor the parser",
            max,
            CompletionMode::Promise,
            "DONE",
        )
    }

    fn reply(host: &BufferedHost, text: &str, todos: Vec<Todo>) {
        host.set_session(
            "ses_1",
            SessionSnapshot {
                messages: vec![
                    SessionMessage::new("user", "go"),
                    SessionMessage::new("assistant", text),
                ],
                todos,
            },
        );
    }

    async fn idle(hook: &AutopilotHook, session: &str) {
        let event = LifecycleEvent::new("session.idle", json!({ "sessionID": session }));
        hook.handle(&mut HookEvent::Lifecycle(&event)).await.unwrap();
    }

    fn prompts(host: &BufferedHost) -> usize {
        host.effects()
            .iter()
            .filter(|e| matches!(e, HostEffect::SendPrompt { .. }))
            .count()
    }

    #[test]
    fn test_advance_pending_increments() {
        let (next, transition) = advance(start(3), "ses_1", Signal::Pending, 1, false);
        assert_eq!(next.as_ref().map(|s| s.iteration), Some(2));
        assert!(matches!(
            transition,
            Transition::Continue {
                ignored_completion: false,
                ..
            }
        ));
    }

    #[test]
    fn test_advance_cap_is_exclusive() {
        let mut state = start(3);
        state.iteration = 2;
        let (next, _) = advance(state, "ses_1", Signal::Pending, 1, false);
        let next = next.unwrap();
        assert_eq!(next.iteration, 3);

        let (gone, transition) = advance(next, "ses_1", Signal::Pending, 1, false);
        assert!(gone.is_none());
        assert_eq!(
            transition,
            Transition::CapReached {
                iteration: 3,
                max_iterations: 3
            }
        );
    }

    #[test]
    fn test_advance_unbounded() {
        let mut state = start(0);
        state.iteration = 10_000;
        let (next, _) = advance(state, "ses_1", Signal::Pending, 1, false);
        assert_eq!(next.map(|s| s.iteration), Some(10_001));
    }

    #[test]
    fn test_advance_ignored_completion_cycle() {
        let complete_with_work = Signal::Complete { open_work: true };

        let (next, transition) = advance(start(10), "ses_1", complete_with_work, 1, false);
        let next = next.unwrap();
        assert_eq!(next.ignored_completions, 1);
        assert!(matches!(
            transition,
            Transition::Continue {
                ignored_completion: true,
                ..
            }
        ));

        let (gone, transition) = advance(next, "ses_1", complete_with_work, 1, false);
        assert!(gone.is_none());
        assert!(matches!(transition, Transition::Completed { .. }));
    }

    #[test]
    fn test_advance_pending_resets_ignored_count() {
        let mut state = start(10);
        state.ignored_completions = 1;
        let (next, _) = advance(state, "ses_1", Signal::Pending, 1, false);
        assert_eq!(next.unwrap().ignored_completions, 0);
    }

    #[test]
    fn test_advance_other_session_or_stopped() {
        let (kept, transition) = advance(start(3), "ses_2", Signal::Pending, 1, false);
        assert_eq!(kept.unwrap().iteration, 1);
        assert_eq!(transition, Transition::NotOwned);

        let (kept, transition) = advance(start(3), "ses_1", Signal::Pending, 1, true);
        assert_eq!(kept.unwrap().iteration, 1);
        assert_eq!(transition, Transition::Stopped);
    }

    #[tokio::test]
    async fn test_idle_without_loop_is_noop() {
        let f = fixture();
        reply(&f.host, "still working", vec![]);
        idle(&f.hook, "ses_1").await;
        assert!(f.host.effects().is_empty());
    }

    #[tokio::test]
    async fn test_idle_injects_continuation() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();
        reply(&f.host, "halfway there", vec![]);

        idle(&f.hook, "ses_1").await;

        let state = f.hook.store().load().await.unwrap().unwrap();
        assert_eq!(state.iteration, 2);
        let effects = f.host.effects();
        assert!(matches!(
            &effects[0],
            HostEffect::SendPrompt { session_id, text }
                if session_id == "ses_1" && text.contains("ITERATION 2/5")
        ));
    }

    #[tokio::test]
    async fn test_completion_deletes_state() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();
        reply(
            &f.host,
            "All green. <promise>done</promise>",
            vec![Todo::new("x", "completed")],
        );

        idle(&f.hook, "ses_1").await;

        assert_eq!(f.hook.store().load().await.unwrap(), None);
        assert_eq!(prompts(&f.host), 0);
    }

    #[tokio::test]
    async fn test_completion_with_open_todos_reinjects_once() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();
        reply(
            &f.host,
            "<promise>DONE</promise> but the migration is blocked",
            vec![Todo::new("migrate", "in_progress")],
        );

        idle(&f.hook, "ses_1").await;
        assert_eq!(prompts(&f.host), 1);
        assert!(f.hook.store().load().await.unwrap().is_some());

        idle(&f.hook, "ses_1").await;
        assert_eq!(prompts(&f.host), 1);
        assert_eq!(f.hook.store().load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stopped_session_is_not_reinjected() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();
        reply(&f.host, "working", vec![]);
        f.guard.stop("ses_1");

        idle(&f.hook, "ses_1").await;

        assert_eq!(prompts(&f.host), 0);
        // Paused, not cancelled
        assert_eq!(f.hook.store().load().await.unwrap().unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn test_missing_history_skips() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();

        idle(&f.hook, "ses_1").await;

        assert!(f.host.effects().is_empty());
        assert_eq!(f.hook.store().load().await.unwrap().unwrap().iteration, 1);
    }

    #[tokio::test]
    async fn test_other_session_idle_is_ignored() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();
        reply(&f.host, "working", vec![]);

        idle(&f.hook, "ses_other").await;

        assert!(f.host.effects().is_empty());
    }

    #[tokio::test]
    async fn test_session_deleted_clears_matching_state() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();

        let other = LifecycleEvent::new("session.deleted", json!({ "info": { "id": "ses_2" } }));
        f.hook.handle(&mut HookEvent::Lifecycle(&other)).await.unwrap();
        assert!(f.hook.store().load().await.unwrap().is_some());

        let mine = LifecycleEvent::new("session.deleted", json!({ "info": { "id": "ses_1" } }));
        f.hook.handle(&mut HookEvent::Lifecycle(&mine)).await.unwrap();
        assert!(f.hook.store().load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_state_without_started_at_still_runs() {
        let f = fixture();
        let path = f.hook.store().path().to_path_buf();
        let raw = json!({
            "active": true,
            "sessionId": "ses_1",
            "prompt": "task",
            "iteration": 1,
            "maxIterations": 3,
            "completionMode": "promise",
            "completionPromise": "DONE"
        });
        std::fs::write(&path, raw.to_string()).unwrap();
        reply(&f.host, "working", vec![]);

        idle(&f.hook, "ses_1").await;

        assert_eq!(prompts(&f.host), 1);
        assert_eq!(f.hook.store().load().await.unwrap().unwrap().iteration, 2);
    }

    #[tokio::test]
    async fn test_session_deleted_removes_unreadable_state() {
        let f = fixture();
        let path = f.hook.store().path().to_path_buf();
        std::fs::write(&path, r#"{"sessionId":"ses_1","iteration":"garbled"}"#).unwrap();

        let deleted = LifecycleEvent::new("session.deleted", json!({ "info": { "id": "ses_1" } }));
        f.hook.handle(&mut HookEvent::Lifecycle(&deleted)).await.unwrap();

        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_stop_command_clears_state() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();

        let input = CommandInput {
            command: "/autopilot-stop".into(),
            session_id: "ses_1".into(),
            arguments: String::new(),
        };
        let mut output = CommandOutput::default();
        f.hook
            .handle(&mut HookEvent::CommandBefore {
                input: &input,
                output: &mut output,
            })
            .await
            .unwrap();

        assert!(f.hook.store().load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_legacy_pause_alias_is_a_stop() {
        let f = fixture();
        f.hook.store().save(&start(5)).await.unwrap();

        let input = CommandInput {
            command: "autopilot-pause".into(),
            session_id: "ses_1".into(),
            arguments: String::new(),
        };
        let mut output = CommandOutput::default();
        f.hook
            .handle(&mut HookEvent::CommandBefore {
                input: &input,
                output: &mut output,
            })
            .await
            .unwrap();

        // Explicit commands cancel; only auto-pause keeps the loop
        assert!(f.hook.store().load().await.unwrap().is_none());
    }
}
