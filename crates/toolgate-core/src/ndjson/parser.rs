//! NDJSON frame decoder for the agent protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types preserved.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Decode a single NDJSON line from the agent's stdout.
pub fn decode(line: &str) -> Result<Frame> {
    let raw: Value =
        serde_json::from_str(line).map_err(|e| Error::MalformedFrame(e.to_string()))?;
    decode_value(&raw)
}

/// Decode a JSON value into a frame.
pub fn decode_value(raw: &Value) -> Result<Frame> {
    let msg_type = raw
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::MalformedFrame("Missing 'type' field".into()))?;

    match msg_type {
        "system" => Ok(parse_system(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "user" => Ok(parse_user(raw)),
        "tool_use" => Ok(parse_tool_use(raw)),
        "tool_result" => Ok(Frame::ToolResult(parse_tool_result(raw))),
        "result" => Ok(parse_result(raw)),
        "control_request" => parse_control_request(raw),
        "control_response" => parse_control_response(raw),
        "control_cancel_request" => parse_control_cancel(raw),
        _ => Ok(Frame::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn parse_system(raw: &Value) -> Frame {
    let cwd = raw
        .get("cwd")
        .and_then(|v| v.as_str())
        .map(std::path::PathBuf::from)
        .unwrap_or_default();

    let tools = raw
        .get("tools")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    t.as_str()
                        .or_else(|| t.get("name").and_then(|n| n.as_str()))
                        .map(String::from)
                })
                .collect()
        })
        .unwrap_or_default();

    Frame::System(SystemInit {
        subtype: str_field(raw, "subtype"),
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd,
        tools,
    })
}

fn parse_assistant(raw: &Value) -> Frame {
    let msg = raw.get("message").unwrap_or(raw);

    Frame::Assistant(AssistantMessage {
        content: parse_content_blocks(msg.get("content")),
        stop_reason: parse_stop_reason(msg.get("stop_reason")),
        usage: parse_usage(msg.get("usage")),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    let Some(arr) = content.and_then(|v| v.as_array()) else {
        return Vec::new();
    };

    arr.iter()
        .filter_map(|block| {
            let block_type = block.get("type")?.as_str()?;
            match block_type {
                "text" => {
                    let text = block.get("text")?.as_str()?.to_string();
                    Some(ContentBlock::Text { text })
                }
                "tool_use" => {
                    let id = block.get("id")?.as_str()?.to_string();
                    let name = block.get("name")?.as_str()?.to_string();
                    let input = block.get("input").cloned().unwrap_or(Value::Null);
                    Some(ContentBlock::ToolUse { id, name, input })
                }
                _ => None,
            }
        })
        .collect()
}

fn parse_stop_reason(val: Option<&Value>) -> StopReason {
    match val.and_then(|v| v.as_str()) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Unknown(other.to_string()),
    }
}

fn parse_usage(val: Option<&Value>) -> Usage {
    val.and_then(|v| serde_json::from_value(v.clone()).ok())
        .unwrap_or_default()
}

/// Tool result content is either a plain string or a list of text blocks.
fn content_text(val: Option<&Value>) -> String {
    match val {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_tool_result(block: &Value) -> ToolResult {
    ToolResult {
        tool_use_id: str_field(block, "tool_use_id"),
        content: content_text(block.get("content").or_else(|| block.get("output"))),
        is_error: block
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
    }
}

fn parse_user(raw: &Value) -> Frame {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter(|block| {
                    block.get("type").and_then(|t| t.as_str()) == Some("tool_result")
                })
                .map(parse_tool_result)
                .collect()
        })
        .unwrap_or_default();

    Frame::User(UserMessage { content })
}

fn parse_tool_use(raw: &Value) -> Frame {
    let body = raw.get("request").unwrap_or(raw);
    let input = body
        .get("input")
        .or_else(|| raw.get("input"))
        .cloned()
        .unwrap_or(Value::Null);
    let name = body
        .get("name")
        .or_else(|| raw.get("name"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();

    Frame::ToolUse(ToolUse {
        tool_use_id: str_field(raw, "tool_use_id"),
        name,
        input,
    })
}

fn parse_result(raw: &Value) -> Frame {
    let subtype = match raw.get("subtype").and_then(|v| v.as_str()) {
        Some("success") | None => ResultSubtype::Success,
        Some("error") => ResultSubtype::Error,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    let num_turns = raw
        .get("num_turns")
        .and_then(|v| v.as_u64())
        .and_then(|n| u32::try_from(n).ok())
        .unwrap_or(0);

    Frame::Result(SessionResult {
        subtype,
        session_id: str_field(raw, "session_id"),
        result: raw.get("result").and_then(|v| v.as_str()).map(String::from),
        is_error: raw
            .get("is_error")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        num_turns,
        duration_ms: raw.get("duration_ms").and_then(|v| v.as_u64()).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(|v| v.as_f64()),
        usage: parse_usage(raw.get("usage")),
    })
}

fn required_request_id(raw: &Value) -> Result<String> {
    raw.get("request_id")
        .and_then(|v| v.as_str())
        .map(String::from)
        .ok_or_else(|| Error::MalformedFrame("Missing request_id".into()))
}

fn parse_control_request(raw: &Value) -> Result<Frame> {
    let request_id = required_request_id(raw)?;

    let request = raw.get("request").cloned().unwrap_or(Value::Null);
    let subtype = request
        .get("subtype")
        .and_then(|v| v.as_str())
        .unwrap_or("");

    let request_type = match subtype {
        "can_use_tool" => ControlRequestType::CanUseTool {
            tool_name: str_field(&request, "tool_name"),
            input: request.get("input").cloned().unwrap_or(Value::Null),
        },
        "interrupt" => ControlRequestType::Interrupt,
        _ => ControlRequestType::Unknown(request),
    };

    Ok(Frame::ControlRequest(ControlRequest {
        request_id,
        request: request_type,
    }))
}

fn parse_control_response(raw: &Value) -> Result<Frame> {
    // request_id lives inside `response`; older agents put it at the top level.
    let response = raw.get("response").unwrap_or(raw);
    let request_id = required_request_id(response).or_else(|_| required_request_id(raw))?;

    let outcome = match response.get("subtype").and_then(|v| v.as_str()) {
        Some("error") => ControlOutcome::Error(str_field(response, "error")),
        _ => ControlOutcome::Success(response.get("response").cloned().unwrap_or(Value::Null)),
    };

    Ok(Frame::ControlResponse(ControlResponse {
        request_id,
        outcome,
    }))
}

fn parse_control_cancel(raw: &Value) -> Result<Frame> {
    Ok(Frame::ControlCancelRequest(ControlCancelRequest {
        request_id: required_request_id(raw)?,
    }))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn decode_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4-20250514","cwd":"/home/user","tools":["Bash","Read"]}"#;
        let Frame::System(init) = decode(json).unwrap() else {
            panic!("expected system frame");
        };
        assert_eq!(init.session_id, "abc123");
        assert_eq!(init.tools, vec!["Bash", "Read"]);
    }

    #[test]
    fn decode_control_request_works() {
        let json = r#"{"type":"control_request","request_id":"req_001","request":{"subtype":"can_use_tool","tool_name":"Bash","input":{"command":"ls"}}}"#;
        let Frame::ControlRequest(req) = decode(json).unwrap() else {
            panic!("expected control request");
        };
        assert_eq!(req.request_id, "req_001");
        assert_eq!(
            req.request,
            ControlRequestType::CanUseTool {
                tool_name: "Bash".into(),
                input: serde_json::json!({"command": "ls"}),
            }
        );
    }

    #[test]
    fn control_request_without_id_is_malformed() {
        let json = r#"{"type":"control_request","request":{"subtype":"can_use_tool"}}"#;
        assert!(matches!(decode(json), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn decode_control_response_error() {
        let json = r#"{"type":"control_response","response":{"subtype":"error","request_id":"req_9","error":"nope"}}"#;
        let Frame::ControlResponse(resp) = decode(json).unwrap() else {
            panic!("expected control response");
        };
        assert_eq!(resp.request_id, "req_9");
        assert_eq!(resp.outcome, ControlOutcome::Error("nope".into()));
    }

    #[test]
    fn decode_cancel_request() {
        let json = r#"{"type":"control_cancel_request","request_id":"req_3"}"#;
        assert_eq!(
            decode(json).unwrap(),
            Frame::ControlCancelRequest(ControlCancelRequest {
                request_id: "req_3".into()
            })
        );
    }

    #[test]
    fn tool_use_accepts_nested_request() {
        let json = r#"{"type":"tool_use","tool_use_id":"t1","request":{"name":"Edit","input":{"path":"a.rs"}}}"#;
        let Frame::ToolUse(tool) = decode(json).unwrap() else {
            panic!("expected tool_use");
        };
        assert_eq!(tool.name, "Edit");
        assert_eq!(tool.input["path"], "a.rs");
    }

    #[test]
    fn user_frame_collects_tool_results() {
        let json = r#"{"type":"user","message":{"role":"user","content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"denied"}],"is_error":true}]}}"#;
        let Frame::User(user) = decode(json).unwrap() else {
            panic!("expected user frame");
        };
        assert_eq!(user.content.len(), 1);
        assert!(user.content[0].is_error);
        assert_eq!(user.content[0].content, "denied");
    }

    #[test]
    fn invalid_json_is_malformed() {
        assert!(matches!(decode("{not json"), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn missing_type_is_malformed() {
        assert!(matches!(
            decode(r#"{"session_id":"x"}"#),
            Err(Error::MalformedFrame(_))
        ));
        assert!(matches!(decode("42"), Err(Error::MalformedFrame(_))));
    }

    #[test]
    fn tolerant_reader_ignores_unknown_fields() {
        let json = r#"{"type":"system","session_id":"x","model":"m","cwd":"/","tools":[],"unknown":"ignored"}"#;
        assert!(decode(json).is_ok());
    }

    #[test]
    fn unknown_type_returns_unknown_frame() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        let frame = decode(json).unwrap();
        assert!(matches!(frame, Frame::Unknown { .. }));
        assert_eq!(frame.frame_type(), "future_type");
    }
}
