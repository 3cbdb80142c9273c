//! Frame types for the agent NDJSON protocol.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// One decoded line of the agent's stream-json protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    System(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    ToolUse(ToolUse),
    ToolResult(ToolResult),
    Result(SessionResult),
    ControlRequest(ControlRequest),
    ControlResponse(ControlResponse),
    ControlCancelRequest(ControlCancelRequest),
    Unknown { msg_type: String, payload: Value },
}

impl Frame {
    /// Wire discriminant of this frame.
    pub fn frame_type(&self) -> &str {
        match self {
            Self::System(_) => "system",
            Self::Assistant(_) => "assistant",
            Self::User(_) => "user",
            Self::ToolUse(_) => "tool_use",
            Self::ToolResult(_) => "tool_result",
            Self::Result(_) => "result",
            Self::ControlRequest(_) => "control_request",
            Self::ControlResponse(_) => "control_response",
            Self::ControlCancelRequest(_) => "control_cancel_request",
            Self::Unknown { msg_type, .. } => msg_type,
        }
    }
}

/// System initialization message.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemInit {
    pub subtype: String,
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub tools: Vec<String>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Usage,
}

/// Content block in assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown(String),
}

impl StopReason {
    pub fn as_str(&self) -> &str {
        match self {
            Self::EndTurn => "end_turn",
            Self::ToolUse => "tool_use",
            Self::MaxTokens => "max_tokens",
            Self::Unknown(other) => other,
        }
    }
}

/// Token usage statistics.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u32,
    #[serde(default)]
    pub output_tokens: u32,
    #[serde(default)]
    pub cache_read_input_tokens: u32,
    #[serde(default)]
    pub cache_creation_input_tokens: u32,
}

/// User message (tool results echo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

/// A standalone tool invocation announced by the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolUse {
    pub tool_use_id: String,
    pub name: String,
    pub input: Value,
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Session completion result.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub session_id: String,
    pub result: Option<String>,
    pub is_error: bool,
    pub num_turns: u32,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    pub usage: Usage,
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    Unknown(String),
}

impl ResultSubtype {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown(other) => other,
        }
    }
}

/// Control request sent by either peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlRequest {
    pub request_id: String,
    pub request: ControlRequestType,
}

/// Control request type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequestType {
    CanUseTool { tool_name: String, input: Value },
    Interrupt,
    Unknown(Value),
}

impl ControlRequestType {
    pub fn subtype(&self) -> &str {
        match self {
            Self::CanUseTool { .. } => "can_use_tool",
            Self::Interrupt => "interrupt",
            Self::Unknown(value) => value
                .get("subtype")
                .and_then(Value::as_str)
                .unwrap_or("unknown"),
        }
    }
}

/// Answer to a control request, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlResponse {
    pub request_id: String,
    pub outcome: ControlOutcome,
}

/// Outcome carried by a control response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Success(Value),
    Error(String),
}

/// Advisory notice that a control request was abandoned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlCancelRequest {
    pub request_id: String,
}
