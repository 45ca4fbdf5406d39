//! Event and message contract shared with the host
//!
//! Every host callback is modelled as an explicit request/response pair so
//! the same engine can be driven by tests, the CLI shim or a real host
//! adapter. Field names follow the host's camelCase wire format.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Version of the request/response envelope
pub const PROTOCOL_VERSION: u32 = 1;

/// Host callback channels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "event")]
    Event,
    #[serde(rename = "tool.execute.before")]
    ToolBefore,
    #[serde(rename = "tool.execute.after")]
    ToolAfter,
    #[serde(rename = "command.execute.before")]
    CommandBefore,
    #[serde(rename = "chat.message")]
    ChatMessage,
    #[serde(rename = "experimental.chat.messages.transform")]
    MessagesTransform,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Event => "event",
            Self::ToolBefore => "tool.execute.before",
            Self::ToolAfter => "tool.execute.after",
            Self::CommandBefore => "command.execute.before",
            Self::ChatMessage => "chat.message",
            Self::MessagesTransform => "experimental.chat.messages.transform",
        }
    }

    /// Before channels can veto the underlying action
    pub fn is_before(&self) -> bool {
        matches!(self, Self::ToolBefore | Self::CommandBefore)
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generic lifecycle event (`session.idle`, `session.deleted`, `message.updated`, ...)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LifecycleEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub properties: Value,
}

impl LifecycleEvent {
    pub fn new(event_type: impl Into<String>, properties: Value) -> Self {
        Self {
            event_type: event_type.into(),
            properties,
        }
    }

    /// Session the event refers to, wherever the host put it
    ///
    /// Message events carry `info.sessionID`; session events carry the
    /// session itself as `info`.
    pub fn session_id(&self) -> Option<&str> {
        let props = &self.properties;
        let info = props.get("info");
        props
            .get("sessionID")
            .or_else(|| props.get("sessionId"))
            .or_else(|| info.and_then(|i| i.get("sessionID")))
            .or_else(|| {
                if self.event_type.starts_with("session.") {
                    info.and_then(|i| i.get("id"))
                } else {
                    None
                }
            })
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
    }
}

/// Input of `tool.execute.before` / `tool.execute.after`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInput {
    pub tool: String,
    #[serde(rename = "sessionId", alias = "sessionID")]
    pub session_id: String,
    #[serde(rename = "callId", alias = "callID", default)]
    pub call_id: String,
}

/// Mutable output of `tool.execute.before`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolBeforeOutput {
    #[serde(default)]
    pub args: Value,
}

impl ToolBeforeOutput {
    /// `args.command` when it is a string
    pub fn command(&self) -> Option<&str> {
        self.args.get("command").and_then(Value::as_str)
    }
}

/// Mutable output of `tool.execute.after`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolAfterOutput {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub metadata: Value,
}

impl ToolAfterOutput {
    /// Append a reminder block to the tool output the agent will read
    pub fn append_reminder(&mut self, text: &str) {
        if !self.output.is_empty() {
            self.output.push_str("\n\n");
        }
        self.output.push_str(text);
    }
}

/// Input of `command.execute.before`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandInput {
    pub command: String,
    #[serde(rename = "sessionId", alias = "sessionID", default)]
    pub session_id: String,
    #[serde(default)]
    pub arguments: String,
}

/// Mutable output of `command.execute.before`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CommandOutput {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Input of `chat.message`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatInput {
    #[serde(alias = "sessionID")]
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, alias = "messageID", skip_serializing_if = "Option::is_none")]
    pub message_id: Option<String>,
}

/// Mutable output of `chat.message`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatOutput {
    #[serde(default)]
    pub parts: Vec<Part>,
}

/// Input of `experimental.chat.messages.transform`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformInput {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Mutable output of `experimental.chat.messages.transform`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformOutput {
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
}

/// One message part; only `text` parts are interpreted
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Part {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            kind: "text".to_string(),
            text: Some(text.into()),
            extra: Map::new(),
        }
    }
}

/// Message metadata as reported by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageInfo {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub role: String,
    #[serde(rename = "sessionID", alias = "sessionId", default)]
    pub session_id: String,
}

/// A message from a session's history
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMessage {
    pub info: MessageInfo,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl SessionMessage {
    pub fn new(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            info: MessageInfo {
                role: role.into(),
                ..Default::default()
            },
            parts: vec![Part::text(text)],
        }
    }

    pub fn is_assistant(&self) -> bool {
        self.info.role.eq_ignore_ascii_case("assistant")
    }

    /// Concatenated text parts
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter(|p| p.kind == "text")
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Session todo item as tracked by the host
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub content: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
}

impl Todo {
    pub fn new(content: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: status.into(),
            priority: None,
        }
    }

    /// Pending or in-progress work
    pub fn is_open(&self) -> bool {
        matches!(self.status.as_str(), "pending" | "in_progress")
    }
}

/// Severity of a host notification
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// Operator-facing notification (toast)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notice {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub title: String,
    pub message: String,
    #[serde(default)]
    pub level: NoticeLevel,
}

impl Notice {
    pub fn new(title: impl Into<String>, message: impl Into<String>, level: NoticeLevel) -> Self {
        Self {
            session_id: None,
            title: title.into(),
            message: message.into(),
            level,
        }
    }

    pub fn for_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// Host action requested by a hook during dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum HostEffect {
    #[serde(rename_all = "camelCase")]
    SendPrompt { session_id: String, text: String },
    #[serde(rename_all = "camelCase")]
    Summarize { session_id: String },
    Notify { notice: Notice },
}

/// Session history snapshot supplied alongside a request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionSnapshot {
    #[serde(default)]
    pub messages: Vec<SessionMessage>,
    #[serde(default)]
    pub todos: Vec<Todo>,
}

/// Host-side context carried in a request envelope
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HostContext {
    #[serde(default)]
    pub sessions: BTreeMap<String, SessionSnapshot>,
}

/// Versioned request envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayRequest {
    pub version: u32,
    pub channel: Channel,
    #[serde(default)]
    pub input: Value,
    #[serde(default)]
    pub output: Value,
    #[serde(default)]
    pub context: HostContext,
}

impl GatewayRequest {
    pub fn new(channel: Channel, input: Value, output: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            channel,
            input,
            output,
            context: HostContext::default(),
        }
    }
}

/// Why a dispatch did not complete normally
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseError {
    /// `blocked` for policy violations, `error` otherwise
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hook: Option<String>,
    pub message: String,
}

/// Versioned response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub version: u32,
    pub ok: bool,
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default)]
    pub effects: Vec<HostEffect>,
}
