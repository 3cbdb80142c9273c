//! NDJSON frame encoder and builders for outgoing lines.
//!
//! Every function here is total: frames are built with `serde_json::json!`
//! from owned strings and values, which cannot fail to serialize.

use serde_json::{Value, json};

use super::types::*;

/// Encode a frame as a single NDJSON line (without the trailing newline).
pub fn encode(frame: &Frame) -> String {
    to_value(frame).to_string()
}

/// Encode a frame as a JSON value.
pub fn to_value(frame: &Frame) -> Value {
    match frame {
        Frame::System(init) => json!({
            "type": "system",
            "subtype": init.subtype,
            "session_id": init.session_id,
            "model": init.model,
            "cwd": init.cwd.to_string_lossy(),
            "tools": init.tools,
        }),
        Frame::Assistant(msg) => {
            let content: Vec<Value> = msg.content.iter().map(content_block_value).collect();
            json!({
                "type": "assistant",
                "message": {
                    "role": "assistant",
                    "content": content,
                    "stop_reason": msg.stop_reason.as_str(),
                    "usage": msg.usage,
                },
            })
        }
        Frame::User(msg) => {
            let content: Vec<Value> = msg.content.iter().map(tool_result_value).collect();
            json!({
                "type": "user",
                "message": { "role": "user", "content": content },
            })
        }
        Frame::ToolUse(tool) => json!({
            "type": "tool_use",
            "tool_use_id": tool.tool_use_id,
            "request": { "name": tool.name, "input": tool.input },
        }),
        Frame::ToolResult(result) => tool_result_value(result),
        Frame::Result(result) => json!({
            "type": "result",
            "subtype": result.subtype.as_str(),
            "session_id": result.session_id,
            "result": result.result,
            "is_error": result.is_error,
            "num_turns": result.num_turns,
            "duration_ms": result.duration_ms,
            "total_cost_usd": result.cost_usd,
            "usage": result.usage,
        }),
        Frame::ControlRequest(req) => json!({
            "type": "control_request",
            "request_id": req.request_id,
            "request": control_request_body(&req.request),
        }),
        Frame::ControlResponse(resp) => {
            let body = match &resp.outcome {
                ControlOutcome::Success(response) => json!({
                    "subtype": "success",
                    "request_id": resp.request_id,
                    "response": response,
                }),
                ControlOutcome::Error(message) => json!({
                    "subtype": "error",
                    "request_id": resp.request_id,
                    "error": message,
                }),
            };
            json!({ "type": "control_response", "response": body })
        }
        Frame::ControlCancelRequest(cancel) => json!({
            "type": "control_cancel_request",
            "request_id": cancel.request_id,
        }),
        Frame::Unknown { msg_type, payload } => {
            let mut value = payload.clone();
            if let Value::Object(map) = &mut value {
                map.insert("type".into(), Value::from(msg_type.as_str()));
                value
            } else {
                json!({ "type": msg_type, "payload": payload })
            }
        }
    }
}

fn content_block_value(block: &ContentBlock) -> Value {
    match block {
        ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
        ContentBlock::ToolUse { id, name, input } => json!({
            "type": "tool_use",
            "id": id,
            "name": name,
            "input": input,
        }),
    }
}

fn tool_result_value(result: &ToolResult) -> Value {
    json!({
        "type": "tool_result",
        "tool_use_id": result.tool_use_id,
        "content": result.content,
        "is_error": result.is_error,
    })
}

fn control_request_body(request: &ControlRequestType) -> Value {
    match request {
        ControlRequestType::CanUseTool { tool_name, input } => json!({
            "subtype": "can_use_tool",
            "tool_name": tool_name,
            "input": input,
        }),
        ControlRequestType::Interrupt => json!({ "subtype": "interrupt" }),
        ControlRequestType::Unknown(value) => value.clone(),
    }
}

/// A user turn in the `--input-format stream-json` shape the agent expects on stdin.
pub fn user_message(content: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": content },
        "parent_tool_use_id": null,
    })
    .to_string()
}

/// Allow response for a `can_use_tool` request.
///
/// The agent requires `updatedInput` to be present on allow; passing back the
/// original tool input leaves the invocation unchanged.
pub fn permission_allow(request_id: &str, original_input: &Value) -> String {
    let input = if original_input.is_object() {
        original_input.clone()
    } else {
        json!({})
    };
    encode(&Frame::ControlResponse(ControlResponse {
        request_id: request_id.to_string(),
        outcome: ControlOutcome::Success(json!({
            "behavior": "allow",
            "updatedInput": input,
        })),
    }))
}

/// Deny response for a `can_use_tool` request; `reason` reaches the agent as the
/// tool-result failure message.
pub fn permission_deny(request_id: &str, reason: &str) -> String {
    let message = if reason.is_empty() {
        "Permission denied"
    } else {
        reason
    };
    encode(&Frame::ControlResponse(ControlResponse {
        request_id: request_id.to_string(),
        outcome: ControlOutcome::Success(json!({
            "behavior": "deny",
            "message": message,
        })),
    }))
}

/// Error response for a control request that could not be handled.
pub fn control_error(request_id: &str, message: &str) -> String {
    encode(&Frame::ControlResponse(ControlResponse {
        request_id: request_id.to_string(),
        outcome: ControlOutcome::Error(message.to_string()),
    }))
}

/// Advisory cancel for a control request.
pub fn cancel_request(request_id: &str) -> String {
    encode(&Frame::ControlCancelRequest(ControlCancelRequest {
        request_id: request_id.to_string(),
    }))
}

/// Interrupt request asking the agent to stop the current turn.
pub fn interrupt_request(request_id: &str) -> String {
    encode(&Frame::ControlRequest(ControlRequest {
        request_id: request_id.to_string(),
        request: ControlRequestType::Interrupt,
    }))
}
