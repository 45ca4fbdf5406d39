//! # hookgate-engine
//!
//! Hook registry, event dispatcher and the stateful policy hooks.
//!
//! This crate provides:
//! - The hook contract every policy module implements
//! - A pure resolver that turns config `order`/`disabled` into one dispatch order
//! - A sequential dispatcher with per-channel fail-open/fail-closed semantics
//! - The autopilot continuation loop and the stop-continuation guard
//! - Process-pressure, context-window and preemptive-compaction monitors
//! - The envelope-level [`Gateway`] used by the CLI shim and tests

mod autopilot;
mod compaction;
mod context_window;
mod dispatcher;
mod gateway;
mod hooks;
mod host;
mod process_pressure;
mod registry;
mod state_store;
mod stop_guard;

pub use autopilot::{
    build_continuation_prompt, latest_assistant_text, AutopilotHook, AutopilotLoopState,
    CompletionDetector, LoopStateStore,
};
pub use compaction::PreemptiveCompactionHook;
pub use context_window::{estimate_tokens, ContextWindowMonitorHook, SessionUsage};
pub use dispatcher::Dispatcher;
pub use gateway::{audit_log, build_hooks, loop_state_store, Gateway, HookDeps};
pub use hooks::{FailurePolicy, Hook, HookEvent};
pub use host::{BufferedHost, HostClient};
pub use process_pressure::{
    parse_ps_output, PressureLevel, ProcessPressureHook, ProcessPressureSample, ProcessSampler,
    PsSampler,
};
pub use registry::{resolve, resolved_ids};
pub use state_store::BoundedSessionMap;
pub use stop_guard::{StopCommands, StopContinuationGuardHook, StopGuard};
