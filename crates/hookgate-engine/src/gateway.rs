//! Envelope-level entry point
//!
//! [`Gateway`] turns one versioned [`GatewayRequest`] into one
//! [`GatewayResponse`]: it checks the version, decodes the channel's
//! input/output pair, runs the dispatcher and reports the (possibly
//! rewritten) output together with every host action the hooks asked for.
//! Tests, the CLI shim and host adapters all drive the engine through here.

use hookgate_core::config::GatewayConfig;
use hookgate_core::{
    AuditLog, Channel, ChatInput, ChatOutput, CommandInput, CommandOutput, GatewayRequest,
    GatewayResponse, HookgateError, HostEffect, LifecycleEvent, ResponseError, Result,
    ToolAfterOutput, ToolBeforeOutput, ToolInput, TransformInput, TransformOutput,
    PROTOCOL_VERSION,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::autopilot::{AutopilotHook, LoopStateStore};
use crate::compaction::PreemptiveCompactionHook;
use crate::context_window::ContextWindowMonitorHook;
use crate::dispatcher::Dispatcher;
use crate::hooks::Hook;
use crate::host::{BufferedHost, HostClient};
use crate::process_pressure::{ProcessPressureHook, ProcessSampler, PsSampler};
use crate::stop_guard::{StopCommands, StopContinuationGuardHook, StopGuard};

/// Shared collaborators handed to every hook
#[derive(Clone)]
pub struct HookDeps {
    pub host: Arc<dyn HostClient>,
    pub sampler: Arc<dyn ProcessSampler>,
    pub stop_guard: Arc<StopGuard>,
    pub loop_state: Arc<LoopStateStore>,
    pub audit: AuditLog,
}

/// Audit sink configured for `project_dir`
pub fn audit_log(config: &GatewayConfig, project_dir: &Path) -> AuditLog {
    if config.audit.enabled {
        AuditLog::new(project_dir.join(&config.audit.path))
    } else {
        AuditLog::disabled()
    }
}

/// Loop-state store configured for `project_dir`
pub fn loop_state_store(config: &GatewayConfig, project_dir: &Path) -> LoopStateStore {
    LoopStateStore::new(project_dir.join(&config.autopilot.state_file))
}

/// Construct every enabled hook
///
/// Ordering is not decided here; the dispatcher resolves it.
pub fn build_hooks(config: &GatewayConfig, deps: &HookDeps) -> Vec<Arc<dyn Hook>> {
    let mut hooks: Vec<Arc<dyn Hook>> = Vec::new();

    if config.stop_continuation_guard.enabled {
        hooks.push(Arc::new(StopContinuationGuardHook::new(
            &config.stop_continuation_guard,
            deps.stop_guard.clone(),
            deps.audit.clone(),
        )));
    }

    if config.autopilot.enabled {
        hooks.push(Arc::new(AutopilotHook::new(
            config.autopilot.clone(),
            deps.loop_state.clone(),
            deps.host.clone(),
            deps.stop_guard.clone(),
            StopCommands::from_config(&config.stop_continuation_guard),
            deps.audit.clone(),
        )));
    }

    if config.process_pressure.enabled {
        hooks.push(Arc::new(ProcessPressureHook::new(
            config.process_pressure.clone(),
            deps.sampler.clone(),
            deps.host.clone(),
            deps.stop_guard.clone(),
            deps.loop_state.clone(),
            deps.audit.clone(),
        )));
    }

    if config.context_window_monitor.enabled {
        hooks.push(Arc::new(ContextWindowMonitorHook::new(
            config.context_window_monitor.clone(),
            deps.audit.clone(),
        )));
    }

    if config.preemptive_compaction.enabled {
        hooks.push(Arc::new(PreemptiveCompactionHook::new(
            config.preemptive_compaction.clone(),
            deps.host.clone(),
            deps.audit.clone(),
        )));
    }

    debug!("Built {} hooks", hooks.len());
    hooks
}

/// Request/response front end over a [`Dispatcher`]
pub struct Gateway {
    dispatcher: Dispatcher,
    host: Arc<BufferedHost>,
    stop_guard: Arc<StopGuard>,
}

impl Gateway {
    /// Gateway sampling the real process table
    pub fn new(config: &GatewayConfig, project_dir: impl AsRef<Path>) -> Self {
        let sampler = Arc::new(PsSampler::new(
            config.process_pressure.process_patterns.clone(),
            Duration::from_millis(config.process_pressure.sampler_timeout_ms),
        ));
        Self::with_sampler(config, project_dir, sampler)
    }

    /// Gateway with an injected process sampler
    pub fn with_sampler(
        config: &GatewayConfig,
        project_dir: impl AsRef<Path>,
        sampler: Arc<dyn ProcessSampler>,
    ) -> Self {
        let project_dir = project_dir.as_ref();
        let host = Arc::new(BufferedHost::new());
        let stop_guard = Arc::new(StopGuard::new());
        let audit = audit_log(config, project_dir);

        let deps = HookDeps {
            host: host.clone(),
            sampler,
            stop_guard: stop_guard.clone(),
            loop_state: Arc::new(loop_state_store(config, project_dir)),
            audit: audit.clone(),
        };
        let hooks = build_hooks(config, &deps);
        let dispatcher = Dispatcher::new(hooks, config, audit);
        info!("Gateway ready for {}", project_dir.display());

        Self {
            dispatcher,
            host,
            stop_guard,
        }
    }

    pub fn hook_ids(&self) -> Vec<String> {
        self.dispatcher.hook_ids()
    }

    pub fn stop_guard(&self) -> &Arc<StopGuard> {
        &self.stop_guard
    }

    /// Handle one request envelope
    ///
    /// Never fails: problems are reported in the response's `error`.
    /// Requests are handled one at a time; effects are collected per call.
    pub async fn handle(&self, request: GatewayRequest) -> GatewayResponse {
        if request.version != PROTOCOL_VERSION {
            let err = HookgateError::ProtocolVersion {
                found: request.version,
                expected: PROTOCOL_VERSION,
            };
            return failure(request.output, &err, Vec::new());
        }

        self.host.load_context(request.context);
        let original = request.output.clone();
        let result = self
            .dispatch(request.channel, request.input, request.output)
            .await;
        let effects = self.host.take_effects();

        match result {
            Ok(output) => GatewayResponse {
                version: PROTOCOL_VERSION,
                ok: true,
                output,
                error: None,
                effects,
            },
            Err(err) => failure(original, &err, effects),
        }
    }

    async fn dispatch(&self, channel: Channel, input: Value, output: Value) -> Result<Value> {
        match channel {
            Channel::Event => {
                let event: LifecycleEvent = decode(unwrap_event(input), "event")?;
                self.dispatcher.event(&event).await?;
                Ok(Value::Null)
            }
            Channel::ToolBefore => {
                let input: ToolInput = decode(input, "tool input")?;
                let mut output: ToolBeforeOutput = decode_output(output, "tool output")?;
                self.dispatcher.tool_before(&input, &mut output).await?;
                encode(&output)
            }
            Channel::ToolAfter => {
                let input: ToolInput = decode(input, "tool input")?;
                let mut output: ToolAfterOutput = decode_output(output, "tool output")?;
                self.dispatcher.tool_after(&input, &mut output).await?;
                encode(&output)
            }
            Channel::CommandBefore => {
                let input: CommandInput = decode(input, "command input")?;
                let mut output: CommandOutput = decode_output(output, "command output")?;
                self.dispatcher.command_before(&input, &mut output).await?;
                encode(&output)
            }
            Channel::ChatMessage => {
                let input: ChatInput = decode(input, "chat input")?;
                let mut output: ChatOutput = decode_output(output, "chat output")?;
                self.dispatcher.chat_message(&input, &mut output).await?;
                encode(&output)
            }
            Channel::MessagesTransform => {
                let input: TransformInput = decode_output(input, "transform input")?;
                let mut output: TransformOutput = decode_output(output, "transform output")?;
                self.dispatcher.messages_transform(&input, &mut output).await?;
                encode(&output)
            }
        }
    }
}

/// Accept both `{type, properties}` and the host's `{event: {type, properties}}`
fn unwrap_event(input: Value) -> Value {
    if input.get("type").is_none() {
        if let Some(inner) = input.get("event") {
            return inner.clone();
        }
    }
    input
}

fn decode<T: DeserializeOwned>(value: Value, what: &str) -> Result<T> {
    serde_json::from_value(value)
        .map_err(|e| HookgateError::InvalidPayload(format!("{}: {}", what, e)))
}

/// Like [`decode`], with a missing (null) value meaning the default
fn decode_output<T: DeserializeOwned + Default>(value: Value, what: &str) -> Result<T> {
    if value.is_null() {
        return Ok(T::default());
    }
    decode(value, what)
}

fn encode<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn response_error(err: &HookgateError) -> ResponseError {
    match err {
        HookgateError::Blocked { hook, message } => ResponseError {
            kind: "blocked".to_string(),
            hook: Some(hook.clone()),
            message: message.clone(),
        },
        other => ResponseError {
            kind: "error".to_string(),
            hook: None,
            message: other.to_string(),
        },
    }
}

fn failure(output: Value, err: &HookgateError, effects: Vec<HostEffect>) -> GatewayResponse {
    GatewayResponse {
        version: PROTOCOL_VERSION,
        ok: false,
        output,
        error: Some(response_error(err)),
        effects,
    }
}
