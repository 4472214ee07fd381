//! AI SDK data stream protocol (v1): one `<code>:<json>\n` line per part.

use crate::agent::AgentEvent;
use serde_json::{json, Value};

/// Response header announcing the protocol to `useChat` clients.
pub const STREAM_HEADER: &str = "x-vercel-ai-data-stream";
pub const STREAM_VERSION: &str = "v1";
pub const CONTENT_TYPE: &str = "text/plain; charset=utf-8";

fn part(code: char, value: &Value) -> String {
    format!("{code}:{value}\n")
}

/// Encode one agent event as a data stream line.
pub fn encode(event: &AgentEvent) -> String {
    match event {
        AgentEvent::StepStart { message_id } => part('f', &json!({ "messageId": message_id })),
        AgentEvent::TextDelta(text) => part('0', &Value::String(text.clone())),
        AgentEvent::ToolCall { id, name, args } => part(
            '9',
            &json!({ "toolCallId": id, "toolName": name, "args": args }),
        ),
        AgentEvent::ToolResult { id, result } => {
            part('a', &json!({ "toolCallId": id, "result": result }))
        }
        AgentEvent::StepFinish {
            finish_reason,
            usage,
            is_continued,
        } => part(
            'e',
            &json!({
                "finishReason": finish_reason,
                "usage": usage,
                "isContinued": is_continued,
            }),
        ),
        AgentEvent::Finish {
            finish_reason,
            usage,
        } => part('d', &json!({ "finishReason": finish_reason, "usage": usage })),
        AgentEvent::Error(message) => part('3', &Value::String(message.clone())),
    }
}
