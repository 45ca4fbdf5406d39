//! Global process-pressure monitor
//!
//! Watches the combined memory footprint of every host agent process on the
//! machine and nudges the agent (through reminders appended to tool output)
//! when it gets too high. Sampling is gated by elapsed tool calls rather than
//! wall-clock time, so behaviour under test is deterministic.
//!
//! Sustained critical pressure escalates: after `criticalPauseAfterEvents`
//! critical samples inside the sliding window the session's continuation
//! loop is paused through the stop guard, and after
//! `criticalEscalationAfterEvents` a stronger remediation notice is shown.

mod sampler;

pub use sampler::{parse_ps_output, ProcessPressureSample, ProcessSampler, PsSampler};

use async_trait::async_trait;
use hookgate_core::config::ProcessPressureConfig;
use hookgate_core::{
    AuditEntry, AuditLog, AuditStage, Notice, NoticeLevel, Result, ToolAfterOutput, ToolInput,
};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use crate::autopilot::LoopStateStore;
use crate::hooks::{FailurePolicy, Hook, HookEvent};
use crate::host::HostClient;
use crate::state_store::{cooled_down, BoundedSessionMap};
use crate::stop_guard::StopGuard;

pub const PROCESS_PRESSURE_HOOK_ID: &str = "process-pressure-monitor";
const PROCESS_PRESSURE_PRIORITY: i32 = 60;
/// Advisory monitor
const PROCESS_PRESSURE_FAILURE_POLICY: FailurePolicy = FailurePolicy::FailOpen;

/// Severity of a sample against the configured thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PressureLevel {
    Normal,
    Warning,
    Critical,
}

impl PressureLevel {
    pub fn classify(sample: &ProcessPressureSample, config: &ProcessPressureConfig) -> Self {
        if sample.total_rss_mb >= config.critical_max_rss_mb {
            Self::Critical
        } else if sample.total_rss_mb >= config.warning_max_rss_mb
            || sample.process_count >= config.warning_opencode_processes
        {
            Self::Warning
        } else {
            Self::Normal
        }
    }
}

/// What one observation asks the hook to do
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct PressureActions {
    reminder: Option<PressureLevel>,
    pause: bool,
    escalate: bool,
    critical_events: usize,
}

/// Per-session counters, all measured in tool calls
#[derive(Debug, Default)]
struct PressureCounters {
    tool_calls: u64,
    last_check_at: Option<u64>,
    last_reminder_at: Option<u64>,
    last_critical_reminder_at: Option<u64>,
    critical_events: VecDeque<u64>,
    escalated: bool,
}

impl PressureCounters {
    /// Count a tool call; returns true if a sample is due
    fn tick(&mut self, sample_cooldown: u64) -> bool {
        self.tool_calls += 1;
        if cooled_down(self.last_check_at, self.tool_calls, sample_cooldown) {
            self.last_check_at = Some(self.tool_calls);
            true
        } else {
            false
        }
    }

    /// Fold one classified sample into the counters
    fn observe(&mut self, level: PressureLevel, config: &ProcessPressureConfig) -> PressureActions {
        let now = self.tool_calls;
        let window = config.critical_escalation_window_tool_calls;
        while let Some(&oldest) = self.critical_events.front() {
            if now.saturating_sub(oldest) >= window {
                self.critical_events.pop_front();
            } else {
                break;
            }
        }

        let mut actions = PressureActions::default();
        match level {
            PressureLevel::Normal => {}
            PressureLevel::Warning => {
                if cooled_down(
                    self.last_reminder_at,
                    now,
                    config.reminder_cooldown_tool_calls,
                ) {
                    self.last_reminder_at = Some(now);
                    actions.reminder = Some(PressureLevel::Warning);
                }
            }
            PressureLevel::Critical => {
                self.critical_events.push_back(now);
                if cooled_down(
                    self.last_critical_reminder_at,
                    now,
                    config.critical_reminder_cooldown_tool_calls,
                ) {
                    self.last_critical_reminder_at = Some(now);
                    actions.reminder = Some(PressureLevel::Critical);
                }
            }
        }

        let events = self.critical_events.len();
        actions.critical_events = events;
        if events < config.critical_escalation_after_events as usize {
            self.escalated = false;
        }
        if level == PressureLevel::Critical {
            actions.pause = events >= config.critical_pause_after_events as usize;
            if events >= config.critical_escalation_after_events as usize && !self.escalated {
                self.escalated = true;
                actions.escalate = true;
            }
        }
        actions
    }
}

/// Hook sampling process pressure after tool calls
pub struct ProcessPressureHook {
    config: ProcessPressureConfig,
    sampler: Arc<dyn ProcessSampler>,
    host: Arc<dyn HostClient>,
    guard: Arc<StopGuard>,
    loop_state: Arc<LoopStateStore>,
    audit: AuditLog,
    sessions: Mutex<BoundedSessionMap<PressureCounters>>,
}

impl ProcessPressureHook {
    pub fn new(
        config: ProcessPressureConfig,
        sampler: Arc<dyn ProcessSampler>,
        host: Arc<dyn HostClient>,
        guard: Arc<StopGuard>,
        loop_state: Arc<LoopStateStore>,
        audit: AuditLog,
    ) -> Self {
        let capacity = config.max_session_state_entries as usize;
        Self {
            config,
            sampler,
            host,
            guard,
            loop_state,
            audit,
            sessions: Mutex::new(BoundedSessionMap::new(capacity)),
        }
    }

    fn with_counters<T>(&self, session_id: &str, f: impl FnOnce(&mut PressureCounters) -> T) -> T {
        let mut sessions = self.sessions.lock().unwrap_or_else(PoisonError::into_inner);
        f(sessions.entry(session_id))
    }

    /// Number of sessions currently tracked
    pub fn tracked_sessions(&self) -> usize {
        self.sessions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    async fn record(&self, stage: AuditStage, reason: &str, session_id: &str) {
        self.audit
            .record(
                AuditEntry::new(PROCESS_PRESSURE_HOOK_ID, stage, reason)
                    .event("tool.execute.after")
                    .session(session_id),
            )
            .await;
    }

    async fn on_tool_after(&self, input: &ToolInput, output: &mut ToolAfterOutput) -> Result<()> {
        let session_id = input.session_id.as_str();
        if session_id.is_empty() {
            return Ok(());
        }

        let cooldown = self.config.sample_cooldown_tool_calls;
        if !self.with_counters(session_id, |c| c.tick(cooldown)) {
            return Ok(());
        }

        let sample = match self.sampler.sample().await {
            Ok(sample) => sample,
            Err(e) => {
                warn!("Process sampling failed: {}", e);
                self.record(AuditStage::Skip, "sampler_failed", session_id).await;
                return Ok(());
            }
        };

        let level = PressureLevel::classify(&sample, &self.config);
        debug!(
            "Process pressure for {}: {:?} ({:?})",
            session_id, level, sample
        );
        let actions = self.with_counters(session_id, |c| c.observe(level, &self.config));

        match actions.reminder {
            Some(PressureLevel::Warning) => {
                output.append_reminder(&self.warning_reminder(&sample));
                self.record(AuditStage::Inject, "pressure_warning", session_id).await;
            }
            Some(PressureLevel::Critical) => {
                output.append_reminder(&self.critical_reminder(&sample));
                self.record(AuditStage::Inject, "pressure_critical", session_id).await;
            }
            _ => {}
        }

        if actions.pause
            && self.config.auto_pause
            && self.owns_loop(session_id).await
            && self.guard.stop(session_id)
        {
            info!(
                "Auto-paused continuation for {} under memory pressure",
                session_id
            );
            output.append_reminder(
                "[AUTOPILOT PAUSED]\nContinuation is paused for this session because memory \
                 pressure stayed critical. Send a message to resume.",
            );
            self.record(AuditStage::State, "auto_paused", session_id).await;
            self.notify(
                session_id,
                "Autopilot paused",
                format!("Sustained memory pressure: {} MB RSS", sample.total_rss_mb),
                NoticeLevel::Warning,
            )
            .await;
        }

        if actions.escalate {
            warn!(
                "Process pressure escalated for {}: {} critical samples",
                session_id, actions.critical_events
            );
            output.append_reminder(&self.escalation_notice(actions.critical_events));
            self.record(AuditStage::State, "pressure_escalated", session_id).await;
            self.notify(
                session_id,
                "Memory pressure critical",
                format!(
                    "{} critical samples within {} tool calls; close other agent sessions",
                    actions.critical_events, self.config.critical_escalation_window_tool_calls
                ),
                NoticeLevel::Error,
            )
            .await;
        }

        Ok(())
    }

    /// Whether an active continuation loop belongs to the session
    async fn owns_loop(&self, session_id: &str) -> bool {
        let reason = match self.loop_state.load().await {
            Ok(Some(state)) if state.belongs_to(session_id) => return true,
            Ok(_) => "no_active_loop",
            Err(e) => {
                warn!("Loop state unavailable, not pausing {}: {}", session_id, e);
                "state_unavailable"
            }
        };
        debug!("Auto-pause skipped for {}: {}", session_id, reason);
        self.record(AuditStage::Skip, reason, session_id).await;
        false
    }

    async fn notify(&self, session_id: &str, title: &str, message: String, level: NoticeLevel) {
        let notice = Notice::new(title, message, level).for_session(session_id);
        if let Err(e) = self.host.notify(notice).await {
            warn!("Pressure notification failed: {}", e);
        }
    }

    fn warning_reminder(&self, sample: &ProcessPressureSample) -> String {
        format!(
            "[PROCESS PRESSURE WARNING]\n{} agent processes are using {} MB RSS \
             (warning at {} MB or {} processes). Avoid starting new background \
             sessions and close idle ones.",
            sample.process_count,
            sample.total_rss_mb,
            self.config.warning_max_rss_mb,
            self.config.warning_opencode_processes
        )
    }

    fn critical_reminder(&self, sample: &ProcessPressureSample) -> String {
        format!(
            "[PROCESS PRESSURE CRITICAL]\n{} agent processes are using {} MB RSS \
             (critical at {} MB). Finish the current step, then stop launching \
             subagents or long-running commands until memory is released.",
            sample.process_count, sample.total_rss_mb, self.config.critical_max_rss_mb
        )
    }

    fn escalation_notice(&self, events: usize) -> String {
        format!(
            "[PROCESS PRESSURE ESCALATION]\n{} critical samples in the last {} tool calls. \
             Save your work and ask the operator to close other agent sessions before \
             continuing.",
            events, self.config.critical_escalation_window_tool_calls
        )
    }
}

#[async_trait]
impl Hook for ProcessPressureHook {
    fn id(&self) -> &str {
        PROCESS_PRESSURE_HOOK_ID
    }

    fn priority(&self) -> i32 {
        PROCESS_PRESSURE_PRIORITY
    }

    fn failure_policy(&self) -> FailurePolicy {
        PROCESS_PRESSURE_FAILURE_POLICY
    }

    async fn handle(&self, event: &mut HookEvent<'_>) -> Result<()> {
        match event {
            HookEvent::ToolAfter { input, output } => self.on_tool_after(input, output).await,
            HookEvent::Lifecycle(lifecycle) if lifecycle.event_type == "session.deleted" => {
                if let Some(session_id) = lifecycle.session_id() {
                    self.sessions
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .remove(session_id);
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
