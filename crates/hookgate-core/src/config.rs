//! Configuration normalization for Hookgate
//!
//! The host hands us configuration as an untyped JSON document. [`normalize`]
//! runs it through a single defaulting pass and returns a fully typed
//! [`GatewayConfig`]. Validation is per leaf: a malformed field falls back to
//! its own default and never invalidates its siblings.
//!
//! Hooks only ever see the typed config; nothing downstream reads raw keys.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// How the autopilot loop recognises that the agent is done
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompletionMode {
    /// `<promise>TOKEN</promise>` in the latest assistant text
    #[default]
    Promise,
    /// `<objective-complete>true</objective-complete>` in the latest assistant text
    Objective,
}

impl fmt::Display for CompletionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Promise => write!(f, "promise"),
            Self::Objective => write!(f, "objective"),
        }
    }
}

impl FromStr for CompletionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "promise" => Ok(Self::Promise),
            "objective" => Ok(Self::Objective),
            _ => Err(format!("Invalid completion mode: {}", s)),
        }
    }
}

/// Fully defaulted gateway configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Global switch; when false no hook runs
    pub enabled: bool,
    /// Hook ids that are never dispatched
    pub disabled: BTreeSet<String>,
    /// Explicit dispatch order; unlisted hooks follow by priority
    pub order: Vec<String>,
    pub audit: AuditConfig,
    pub stop_continuation_guard: StopGuardConfig,
    pub autopilot: AutopilotConfig,
    pub process_pressure: ProcessPressureConfig,
    pub context_window_monitor: ContextWindowConfig,
    pub preemptive_compaction: CompactionConfig,
}

/// JSONL audit stream settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditConfig {
    pub enabled: bool,
    /// Relative paths resolve against the project directory
    pub path: String,
}

/// Stop-continuation guard settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StopGuardConfig {
    pub enabled: bool,
    /// Canonical stop command names (without the leading slash)
    pub command_names: Vec<String>,
    /// Older names still honoured for compatibility
    pub legacy_command_names: Vec<String>,
    /// Tool names through which the host routes slash commands
    pub slash_command_tools: Vec<String>,
}

/// Autopilot continuation loop settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutopilotConfig {
    pub enabled: bool,
    /// Loop state file, relative to the project directory
    pub state_file: String,
    /// Cap used by the start command when none is given; 0 means unbounded
    pub default_max_iterations: u64,
    pub default_completion_mode: CompletionMode,
    pub default_completion_promise: String,
    /// Completion signals tolerated while work is still open before stopping
    pub max_ignored_completion_cycles: u64,
    pub notify_on_stop: bool,
}

/// Global process-pressure monitor settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessPressureConfig {
    pub enabled: bool,
    pub sample_cooldown_tool_calls: u64,
    pub warning_max_rss_mb: u64,
    pub critical_max_rss_mb: u64,
    pub warning_opencode_processes: u64,
    pub reminder_cooldown_tool_calls: u64,
    pub critical_reminder_cooldown_tool_calls: u64,
    pub critical_escalation_window_tool_calls: u64,
    pub critical_pause_after_events: u64,
    pub critical_escalation_after_events: u64,
    pub auto_pause: bool,
    pub max_session_state_entries: u64,
    pub sampler_timeout_ms: u64,
    /// Case-insensitive substrings identifying host agent processes
    pub process_patterns: Vec<String>,
}

/// Context-window reminder settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextWindowConfig {
    pub enabled: bool,
    pub warning_threshold: f64,
    pub default_context_limit_tokens: u64,
    pub reminder_cooldown_tool_calls: u64,
    pub min_token_delta_for_reminder: u64,
    pub max_session_state_entries: u64,
}

/// Preemptive compaction settings
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionConfig {
    pub enabled: bool,
    pub warning_threshold: f64,
    pub default_context_limit_tokens: u64,
    pub compaction_cooldown_tool_calls: u64,
    pub max_session_state_entries: u64,
}

// Default value providers
fn default_command_names() -> Vec<String> {
    vec!["autopilot-stop".to_string(), "stop-continuation".to_string()]
}

fn default_legacy_command_names() -> Vec<String> {
    vec![
        "ralph-stop".to_string(),
        "cancel-ralph".to_string(),
        "autopilot-pause".to_string(),
    ]
}

fn default_slash_command_tools() -> Vec<String> {
    vec!["slashcommand".to_string()]
}

fn default_process_patterns() -> Vec<String> {
    vec!["opencode".to_string()]
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            disabled: BTreeSet::new(),
            order: Vec::new(),
            audit: AuditConfig::default(),
            stop_continuation_guard: StopGuardConfig::default(),
            autopilot: AutopilotConfig::default(),
            process_pressure: ProcessPressureConfig::default(),
            context_window_monitor: ContextWindowConfig::default(),
            preemptive_compaction: CompactionConfig::default(),
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            path: ".hookgate/audit.jsonl".to_string(),
        }
    }
}

impl Default for StopGuardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            command_names: default_command_names(),
            legacy_command_names: default_legacy_command_names(),
            slash_command_tools: default_slash_command_tools(),
        }
    }
}

impl Default for AutopilotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            state_file: ".hookgate/autopilot-state.json".to_string(),
            default_max_iterations: 25,
            default_completion_mode: CompletionMode::Promise,
            default_completion_promise: "DONE".to_string(),
            max_ignored_completion_cycles: 1,
            notify_on_stop: true,
        }
    }
}

impl Default for ProcessPressureConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_cooldown_tool_calls: 5,
            warning_max_rss_mb: 6144,
            critical_max_rss_mb: 10240,
            warning_opencode_processes: 6,
            reminder_cooldown_tool_calls: 25,
            critical_reminder_cooldown_tool_calls: 10,
            critical_escalation_window_tool_calls: 40,
            critical_pause_after_events: 2,
            critical_escalation_after_events: 4,
            auto_pause: true,
            max_session_state_entries: 256,
            sampler_timeout_ms: 2500,
            process_patterns: default_process_patterns(),
        }
    }
}

impl Default for ContextWindowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 0.70,
            default_context_limit_tokens: 200_000,
            reminder_cooldown_tool_calls: 15,
            min_token_delta_for_reminder: 10_000,
            max_session_state_entries: 256,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            warning_threshold: 0.85,
            default_context_limit_tokens: 200_000,
            compaction_cooldown_tool_calls: 20,
            max_session_state_entries: 256,
        }
    }
}

/// Normalize an untyped configuration document
///
/// Total: never fails. Unknown keys are ignored; anything that is not an
/// object where a record is expected yields that record's defaults.
pub fn normalize(raw: &Value) -> GatewayConfig {
    let root = Fields::of(Some(raw));
    let d = GatewayConfig::default();

    GatewayConfig {
        enabled: root.bool("enabled", d.enabled),
        disabled: root.string_list("disabled", &[]).into_iter().collect(),
        order: dedup_preserving_order(root.string_list("order", &d.order)),
        audit: normalize_audit(root.record("audit")),
        stop_continuation_guard: normalize_stop_guard(root.record("stopContinuationGuard")),
        autopilot: normalize_autopilot(root.record("autopilot")),
        process_pressure: normalize_process_pressure(root.record("processPressure")),
        context_window_monitor: normalize_context_window(root.record("contextWindowMonitor")),
        preemptive_compaction: normalize_compaction(root.record("preemptiveCompaction")),
    }
}

fn normalize_audit(f: Fields<'_>) -> AuditConfig {
    let d = AuditConfig::default();
    AuditConfig {
        enabled: f.bool("enabled", d.enabled),
        path: f.string("path", &d.path),
    }
}

fn normalize_stop_guard(f: Fields<'_>) -> StopGuardConfig {
    let d = StopGuardConfig::default();
    StopGuardConfig {
        enabled: f.bool("enabled", d.enabled),
        command_names: f.string_list("commandNames", &d.command_names),
        legacy_command_names: f.string_list("legacyCommandNames", &d.legacy_command_names),
        slash_command_tools: f.string_list("slashCommandTools", &d.slash_command_tools),
    }
}

fn normalize_autopilot(f: Fields<'_>) -> AutopilotConfig {
    let d = AutopilotConfig::default();
    AutopilotConfig {
        enabled: f.bool("enabled", d.enabled),
        state_file: f.string("stateFile", &d.state_file),
        default_max_iterations: f.u64("defaultMaxIterations", d.default_max_iterations),
        default_completion_mode: f.parsed("defaultCompletionMode", d.default_completion_mode),
        default_completion_promise: f.string(
            "defaultCompletionPromise",
            &d.default_completion_promise,
        ),
        max_ignored_completion_cycles: f.u64(
            "maxIgnoredCompletionCycles",
            d.max_ignored_completion_cycles,
        ),
        notify_on_stop: f.bool("notifyOnStop", d.notify_on_stop),
    }
}

fn normalize_process_pressure(f: Fields<'_>) -> ProcessPressureConfig {
    let d = ProcessPressureConfig::default();
    let mut p = ProcessPressureConfig {
        enabled: f.bool("enabled", d.enabled),
        sample_cooldown_tool_calls: f.u64("sampleCooldownToolCalls", d.sample_cooldown_tool_calls),
        warning_max_rss_mb: f.positive_u64("warningMaxRssMb", d.warning_max_rss_mb),
        critical_max_rss_mb: f.positive_u64("criticalMaxRssMb", d.critical_max_rss_mb),
        warning_opencode_processes: f.positive_u64(
            "warningOpencodeProcesses",
            d.warning_opencode_processes,
        ),
        reminder_cooldown_tool_calls: f.u64(
            "reminderCooldownToolCalls",
            d.reminder_cooldown_tool_calls,
        ),
        critical_reminder_cooldown_tool_calls: f.u64(
            "criticalReminderCooldownToolCalls",
            d.critical_reminder_cooldown_tool_calls,
        ),
        critical_escalation_window_tool_calls: f.positive_u64(
            "criticalEscalationWindowToolCalls",
            d.critical_escalation_window_tool_calls,
        ),
        critical_pause_after_events: f.positive_u64(
            "criticalPauseAfterEvents",
            d.critical_pause_after_events,
        ),
        critical_escalation_after_events: f.positive_u64(
            "criticalEscalationAfterEvents",
            d.critical_escalation_after_events,
        ),
        auto_pause: f.bool("autoPause", d.auto_pause),
        max_session_state_entries: f.positive_u64(
            "maxSessionStateEntries",
            d.max_session_state_entries,
        ),
        sampler_timeout_ms: f.positive_u64("samplerTimeoutMs", d.sampler_timeout_ms),
        process_patterns: f.string_list("processPatterns", &d.process_patterns),
    };

    // Ordered pairs: an inverted pair falls back as a whole
    if p.warning_max_rss_mb > p.critical_max_rss_mb {
        p.warning_max_rss_mb = d.warning_max_rss_mb;
        p.critical_max_rss_mb = d.critical_max_rss_mb;
    }
    if p.critical_pause_after_events > p.critical_escalation_after_events {
        p.critical_pause_after_events = d.critical_pause_after_events;
        p.critical_escalation_after_events = d.critical_escalation_after_events;
    }
    p
}

fn normalize_context_window(f: Fields<'_>) -> ContextWindowConfig {
    let d = ContextWindowConfig::default();
    ContextWindowConfig {
        enabled: f.bool("enabled", d.enabled),
        warning_threshold: f.ratio("warningThreshold", d.warning_threshold),
        default_context_limit_tokens: f.positive_u64(
            "defaultContextLimitTokens",
            d.default_context_limit_tokens,
        ),
        reminder_cooldown_tool_calls: f.u64(
            "reminderCooldownToolCalls",
            d.reminder_cooldown_tool_calls,
        ),
        min_token_delta_for_reminder: f.u64(
            "minTokenDeltaForReminder",
            d.min_token_delta_for_reminder,
        ),
        max_session_state_entries: f.positive_u64(
            "maxSessionStateEntries",
            d.max_session_state_entries,
        ),
    }
}

fn normalize_compaction(f: Fields<'_>) -> CompactionConfig {
    let d = CompactionConfig::default();
    CompactionConfig {
        enabled: f.bool("enabled", d.enabled),
        warning_threshold: f.ratio("warningThreshold", d.warning_threshold),
        default_context_limit_tokens: f.positive_u64(
            "defaultContextLimitTokens",
            d.default_context_limit_tokens,
        ),
        compaction_cooldown_tool_calls: f.u64(
            "compactionCooldownToolCalls",
            d.compaction_cooldown_tool_calls,
        ),
        max_session_state_entries: f.positive_u64(
            "maxSessionStateEntries",
            d.max_session_state_entries,
        ),
    }
}

fn dedup_preserving_order(items: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}

/// Typed leaf reader over an optional JSON object
///
/// Every accessor takes the documented default and returns it whenever the
/// key is absent or the value does not validate.
#[derive(Clone, Copy)]
struct Fields<'a> {
    obj: Option<&'a Map<String, Value>>,
}

impl<'a> Fields<'a> {
    fn of(value: Option<&'a Value>) -> Self {
        Self {
            obj: value.and_then(Value::as_object),
        }
    }

    fn get(&self, key: &str) -> Option<&'a Value> {
        self.obj.and_then(|obj| obj.get(key))
    }

    fn record(&self, key: &str) -> Fields<'a> {
        Fields::of(self.get(key))
    }

    fn bool(&self, key: &str, default: bool) -> bool {
        self.get(key).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Non-negative integer; floats, negatives and strings are rejected
    fn u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).and_then(Value::as_u64).unwrap_or(default)
    }

    fn positive_u64(&self, key: &str, default: u64) -> u64 {
        match self.u64(key, default) {
            0 => default,
            n => n,
        }
    }

    /// Finite float in (0, 1]
    fn ratio(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(Value::as_f64)
            .filter(|v| v.is_finite() && *v > 0.0 && *v <= 1.0)
            .unwrap_or(default)
    }

    fn string(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(default)
            .to_string()
    }

    fn parsed<T: FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
            .unwrap_or(default)
    }

    /// Absent key yields `default`; an explicit array (even empty) is honoured
    fn string_list(&self, key: &str, default: &[String]) -> Vec<String> {
        match self.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            _ => default.to_vec(),
        }
    }
}
