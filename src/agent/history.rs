//! Chat-UI message history: wire types, pruning, trimming and conversion to
//! provider messages.

use crate::providers::{ChatMessage, ContentPart, ToolCall};
use crate::tools::ToolResult;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Replacement text for screenshots dropped from older turns.
pub const REDACTED_IMAGE_TEXT: &str = "Image redacted to save input tokens";

/// Tool-message body standing in for an image that follows as a user message.
pub const IMAGE_RESULT_STUB: &str = "Screenshot captured. The image is attached in the next message.";

const SCREENSHOT_TOOL: &str = "computer";

pub const SYSTEM_PROMPT: &str = "You control a virtual Linux desktop to carry out the user's tasks. \
ALWAYS begin by taking a screenshot. It is essential for judging the current state of the \
desktop before taking any other action. \
Available actions: screenshot, wait, left_click, double_click, right_click, mouse_move, type, key, \
scroll, left_click_drag, bash. \
Coordinates use the format [x, y]. The longest wait is 2 seconds. \
Scroll with direction 'up' or 'down' and an amount. \
You can run bash commands in a Linux terminal.";

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiMessage {
    #[serde(default)]
    pub id: String,
    pub role: String,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parts: Vec<UiPart>,
    /// Legacy flat list used by clients that predate `parts`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_invocations: Vec<ToolInvocation>,
}

impl UiMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            id: String::new(),
            role: role.to_string(),
            parts: vec![UiPart::Text {
                text: content.clone(),
            }],
            content,
            tool_invocations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiPart {
    Text {
        text: String,
    },
    ToolInvocation {
        #[serde(rename = "toolInvocation")]
        tool_invocation: ToolInvocation,
    },
    StepStart,
    /// Reasoning, sources, files and anything newer: ignored.
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInvocation {
    #[serde(default)]
    pub state: String,
    pub tool_call_id: String,
    pub tool_name: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
}

impl ToolInvocation {
    fn is_screenshot(&self) -> bool {
        self.tool_name == SCREENSHOT_TOOL
            && self.args.get("action").and_then(Value::as_str) == Some("screenshot")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("Unsupported message role '{role}' at position {index}")]
    UnknownRole { index: usize, role: String },
}

// ── Pruning and trimming ─────────────────────────────────────────

/// Replace screenshot results with a short text marker, unless the
/// conversation currently ends on an assistant turn.
pub fn prune(messages: &mut [UiMessage]) {
    if messages.last().map_or(true, |m| m.role == "assistant") {
        return;
    }
    let redacted = serde_json::json!({"type": "text", "text": REDACTED_IMAGE_TEXT});
    let redact = |invocation: &mut ToolInvocation| {
        if invocation.is_screenshot() && invocation.result.is_some() {
            invocation.result = Some(redacted.clone());
        }
    };
    for message in messages.iter_mut() {
        for part in &mut message.parts {
            if let UiPart::ToolInvocation { tool_invocation } = part {
                redact(tool_invocation);
            }
        }
        message.tool_invocations.iter_mut().for_each(redact);
    }
}

/// Keep at most `max_messages` of the newest messages, starting at a user turn.
pub fn trim(messages: &mut Vec<UiMessage>, max_messages: usize) {
    if messages.len() > max_messages {
        let excess = messages.len() - max_messages;
        messages.drain(..excess);
    }
    let first_user = messages
        .iter()
        .position(|m| m.role == "user")
        .unwrap_or(messages.len());
    messages.drain(..first_user);
}

// ── Conversion ───────────────────────────────────────────────────

fn result_to_tool_result(value: &Value) -> ToolResult {
    match serde_json::from_value::<ToolResult>(value.clone()) {
        Ok(result) => result,
        Err(_) => match value {
            Value::String(s) => ToolResult::text(s.clone()),
            other => ToolResult::text(other.to_string()),
        },
    }
}

/// Accumulates one assistant step: its text and completed tool calls.
#[derive(Default)]
struct StepBuffer {
    text: String,
    invocations: Vec<ToolInvocation>,
}

impl StepBuffer {
    fn is_empty(&self) -> bool {
        self.text.is_empty() && self.invocations.is_empty()
    }

    fn flush_into(&mut self, out: &mut Vec<ChatMessage>) {
        if self.is_empty() {
            return;
        }
        let text = std::mem::take(&mut self.text);
        let invocations = std::mem::take(&mut self.invocations);
        if invocations.is_empty() {
            out.push(ChatMessage::assistant(text));
            return;
        }
        push_tool_turn(out, text, &invocations);
    }
}

fn push_tool_turn(out: &mut Vec<ChatMessage>, text: String, invocations: &[ToolInvocation]) {
    let calls = invocations
        .iter()
        .map(|inv| ToolCall {
            id: inv.tool_call_id.clone(),
            name: inv.tool_name.clone(),
            arguments: inv.args.to_string(),
        })
        .collect();
    out.push(ChatMessage::assistant_tool_calls(text, calls));
    out.extend(tool_result_messages(
        invocations.iter().filter_map(|inv| {
            inv.result
                .as_ref()
                .map(|r| (inv.tool_call_id.as_str(), result_to_tool_result(r)))
        }),
    ));
}

/// `tool` messages for each result, then one user message carrying any images.
pub fn tool_result_messages<'a, I>(results: I) -> Vec<ChatMessage>
where
    I: IntoIterator<Item = (&'a str, ToolResult)>,
{
    let mut messages = Vec::new();
    let mut images = Vec::new();
    for (id, result) in results {
        match result {
            ToolResult::Text { text } => messages.push(ChatMessage::tool(id, text)),
            ToolResult::Image { data } => {
                messages.push(ChatMessage::tool(id, IMAGE_RESULT_STUB));
                images.push(data);
            }
        }
    }
    if !images.is_empty() {
        let caption = "Screenshot";
        let mut parts = vec![ContentPart::text(caption)];
        parts.extend(images.into_iter().map(|d| ContentPart::image(d, "image/png")));
        messages.push(ChatMessage {
            parts: Some(parts),
            ..ChatMessage::user(caption)
        });
    }
    messages
}

fn text_of(message: &UiMessage) -> String {
    let from_parts: Vec<&str> = message
        .parts
        .iter()
        .filter_map(|p| match p {
            UiPart::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if from_parts.is_empty() {
        message.content.clone()
    } else {
        from_parts.join("\n")
    }
}

fn convert_assistant(message: &UiMessage, out: &mut Vec<ChatMessage>) {
    if message.parts.is_empty() {
        let completed: Vec<ToolInvocation> = message
            .tool_invocations
            .iter()
            .filter(|inv| inv.result.is_some())
            .cloned()
            .collect();
        if completed.is_empty() {
            if !message.content.is_empty() {
                out.push(ChatMessage::assistant(message.content.clone()));
            }
        } else {
            push_tool_turn(out, message.content.clone(), &completed);
        }
        return;
    }

    let mut step = StepBuffer::default();
    for part in &message.parts {
        match part {
            UiPart::StepStart => step.flush_into(out),
            UiPart::Text { text } => {
                if !step.invocations.is_empty() {
                    step.flush_into(out);
                }
                step.text.push_str(text);
            }
            UiPart::ToolInvocation { tool_invocation } if tool_invocation.result.is_some() => {
                step.invocations.push(tool_invocation.clone());
            }
            UiPart::ToolInvocation { .. } | UiPart::Other => {}
        }
    }
    step.flush_into(out);
}

/// Convert UI history into provider messages, prefixed by `system_prompt`.
pub fn to_chat_messages(
    system_prompt: &str,
    messages: &[UiMessage],
) -> Result<Vec<ChatMessage>, HistoryError> {
    let mut out = vec![ChatMessage::system(system_prompt)];
    for (index, message) in messages.iter().enumerate() {
        match message.role.as_str() {
            "system" => out.push(ChatMessage::system(text_of(message))),
            "user" => out.push(ChatMessage::user(text_of(message))),
            "assistant" => convert_assistant(message, &mut out),
            // Client-side annotations, never shown to the model.
            "data" => {}
            other => {
                return Err(HistoryError::UnknownRole {
                    index,
                    role: other.to_string(),
                })
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn screenshot_invocation(id: &str) -> ToolInvocation {
        ToolInvocation {
            state: "result".into(),
            tool_call_id: id.into(),
            tool_name: "computer".into(),
            args: json!({"action": "screenshot"}),
            result: Some(json!({"type": "image", "data": "iVBOR"})),
            step: Some(0),
        }
    }

    fn assistant_with(invocations: Vec<ToolInvocation>) -> UiMessage {
        let mut parts = vec![UiPart::StepStart];
        parts.extend(
            invocations
                .into_iter()
                .map(|tool_invocation| UiPart::ToolInvocation { tool_invocation }),
        );
        UiMessage {
            id: "a1".into(),
            role: "assistant".into(),
            content: String::new(),
            parts,
            tool_invocations: Vec::new(),
        }
    }

    fn first_result(message: &UiMessage) -> Option<Value> {
        message.parts.iter().find_map(|p| match p {
            UiPart::ToolInvocation { tool_invocation } => tool_invocation.result.clone(),
            _ => None,
        })
    }

    #[test]
    fn deserializes_ai_sdk_messages() {
        let raw = json!([
            {"id": "u1", "role": "user", "content": "open firefox",
             "parts": [{"type": "text", "text": "open firefox"}], "createdAt": "2025-01-01T00:00:00Z"},
            {"id": "a1", "role": "assistant", "content": "",
             "parts": [
                {"type": "step-start"},
                {"type": "reasoning", "reasoning": "hmm"},
                {"type": "tool-invocation", "toolInvocation": {
                    "state": "result", "step": 0, "toolCallId": "c1", "toolName": "computer",
                    "args": {"action": "screenshot"},
                    "result": {"type": "image", "data": "iVBOR"}}}
             ]}
        ]);
        let messages: Vec<UiMessage> = serde_json::from_value(raw).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].parts[1], UiPart::Other);
        match &messages[1].parts[2] {
            UiPart::ToolInvocation { tool_invocation } => {
                assert_eq!(tool_invocation.tool_call_id, "c1");
                assert!(tool_invocation.is_screenshot());
            }
            other => panic!("unexpected part {other:?}"),
        }
    }

    #[test]
    fn prune_redacts_screenshots_when_user_spoke_last() {
        let mut messages = vec![
            UiMessage::new("user", "hi"),
            assistant_with(vec![screenshot_invocation("c1")]),
            UiMessage::new("user", "now click"),
        ];
        prune(&mut messages);
        assert_eq!(
            first_result(&messages[1]),
            Some(json!({"type": "text", "text": REDACTED_IMAGE_TEXT}))
        );
    }

    #[test]
    fn prune_keeps_images_when_assistant_spoke_last() {
        let mut messages = vec![
            UiMessage::new("user", "hi"),
            assistant_with(vec![screenshot_invocation("c1")]),
        ];
        prune(&mut messages);
        assert_eq!(
            first_result(&messages[1]),
            Some(json!({"type": "image", "data": "iVBOR"}))
        );
    }

    #[test]
    fn prune_leaves_other_actions_alone() {
        let click = ToolInvocation {
            args: json!({"action": "left_click", "coordinate": [1, 2]}),
            result: Some(json!({"type": "text", "text": "Left clicked at 1, 2"})),
            ..screenshot_invocation("c2")
        };
        let mut messages = vec![
            UiMessage::new("user", "hi"),
            assistant_with(vec![click]),
            UiMessage::new("user", "again"),
        ];
        prune(&mut messages);
        assert_eq!(
            first_result(&messages[1]),
            Some(json!({"type": "text", "text": "Left clicked at 1, 2"}))
        );
    }

    #[test]
    fn trim_keeps_tail_and_starts_on_user() {
        let mut messages: Vec<UiMessage> = (0..6)
            .map(|i| {
                let role = if i % 2 == 0 { "user" } else { "assistant" };
                UiMessage::new(role, format!("m{i}"))
            })
            .collect();
        trim(&mut messages, 3);
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["m4", "m5"]);
    }

    #[test]
    fn trim_under_limit_is_noop() {
        let mut messages = vec![UiMessage::new("user", "a"), UiMessage::new("assistant", "b")];
        trim(&mut messages, 50);
        assert_eq!(messages.len(), 2);
    }

    #[test]
    fn converts_tool_steps_with_images() {
        let messages = vec![
            UiMessage::new("user", "open firefox"),
            assistant_with(vec![screenshot_invocation("c1")]),
        ];
        let chat = to_chat_messages(SYSTEM_PROMPT, &messages).unwrap();
        let roles: Vec<&str> = chat.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "user"]);

        let calls = chat[2].tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].id, "c1");
        assert_eq!(calls[0].arguments, r#"{"action":"screenshot"}"#);
        assert_eq!(chat[3].tool_call_id.as_deref(), Some("c1"));
        assert_eq!(chat[3].content, IMAGE_RESULT_STUB);
        assert!(chat[4].has_images());
    }

    #[test]
    fn splits_steps_and_keeps_text() {
        let click = ToolInvocation {
            args: json!({"action": "left_click", "coordinate": [1, 2]}),
            result: Some(json!({"type": "text", "text": "Left clicked at 1, 2"})),
            ..screenshot_invocation("c2")
        };
        let message = UiMessage {
            parts: vec![
                UiPart::StepStart,
                UiPart::Text {
                    text: "Clicking.".into(),
                },
                UiPart::ToolInvocation {
                    tool_invocation: click,
                },
                UiPart::StepStart,
                UiPart::Text {
                    text: "Done.".into(),
                },
            ],
            ..assistant_with(vec![])
        };
        let chat = to_chat_messages("sys", &[UiMessage::new("user", "go"), message]).unwrap();
        let roles: Vec<&str> = chat.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "tool", "assistant"]);
        assert_eq!(chat[2].content, "Clicking.");
        assert_eq!(chat[3].content, "Left clicked at 1, 2");
        assert_eq!(chat[4].content, "Done.");
        assert!(chat[4].tool_calls.is_none());
    }

    #[test]
    fn drops_invocations_without_results() {
        let pending = ToolInvocation {
            state: "call".into(),
            result: None,
            ..screenshot_invocation("c3")
        };
        let chat = to_chat_messages(
            "sys",
            &[UiMessage::new("user", "go"), assistant_with(vec![pending])],
        )
        .unwrap();
        assert_eq!(chat.len(), 2);
    }

    #[test]
    fn legacy_tool_invocations_are_converted() {
        let message = UiMessage {
            id: "a".into(),
            role: "assistant".into(),
            content: "Looking".into(),
            parts: Vec::new(),
            tool_invocations: vec![ToolInvocation {
                result: Some(json!("plain string result")),
                ..screenshot_invocation("c4")
            }],
        };
        let chat = to_chat_messages("sys", &[UiMessage::new("user", "go"), message]).unwrap();
        assert_eq!(chat[2].content, "Looking");
        assert_eq!(chat[3].content, "plain string result");
    }

    #[test]
    fn unknown_role_is_rejected() {
        let err = to_chat_messages("sys", &[UiMessage::new("moderator", "x")]).unwrap_err();
        assert!(err.to_string().contains("'moderator'"));
    }

    #[test]
    fn data_messages_are_skipped() {
        let chat = to_chat_messages(
            "sys",
            &[
                UiMessage::new("user", "open the browser"),
                UiMessage::new("data", "{\"progress\":1}"),
                UiMessage::new("user", "then search"),
            ],
        )
        .unwrap();
        let roles: Vec<&str> = chat.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "user", "user"]);
        assert_eq!(chat[2].content, "then search");
    }

    #[test]
    fn tool_results_group_images_after_tool_messages() {
        let messages = tool_result_messages(vec![
            ("a", ToolResult::image(b"one")),
            ("b", ToolResult::text("ok")),
            ("c", ToolResult::image(b"two")),
        ]);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["tool", "tool", "tool", "user"]);
        assert_eq!(messages[3].parts.as_ref().unwrap().len(), 3);
    }

    #[test]
    fn system_prompt_lists_every_action() {
        for kind in crate::tools::ActionKind::ALL {
            assert!(SYSTEM_PROMPT.contains(kind.as_str()), "{kind}");
        }
        assert!(SYSTEM_PROMPT.contains("[x, y]"));
    }
}
