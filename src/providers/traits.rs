use crate::tools::ToolSpec;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Type of content within a multimodal message part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ContentPartType {
    Text,
    Image,
}

/// A single part of a multimodal message (text or image).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentPart {
    pub content_type: ContentPartType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    /// Base64-encoded image data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content_type: ContentPartType::Text,
            text: Some(text.into()),
            image_base64: None,
            mime_type: None,
        }
    }

    pub fn image(base64_data: impl Into<String>, mime: impl Into<String>) -> Self {
        Self {
            content_type: ContentPartType::Image,
            text: None,
            image_base64: Some(base64_data.into()),
            mime_type: Some(mime.into()),
        }
    }
}

/// A single message in a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
    /// When Some, providers serialize a content array instead of `content`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<ContentPart>>,
    /// Calls requested by an assistant turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Set on `tool` messages: the call this message answers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ChatMessage {
    fn with_role(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::with_role("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role("assistant", content)
    }

    /// Assistant turn that requested tool calls, with any text it produced.
    pub fn assistant_tool_calls(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: Some(tool_calls),
            ..Self::with_role("assistant", content)
        }
    }

    pub fn tool(tool_call_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            tool_call_id: Some(tool_call_id.into()),
            ..Self::with_role("tool", content)
        }
    }

    /// User message carrying text and an image for vision models.
    pub fn with_image(
        text: impl Into<String>,
        image_base64: impl Into<String>,
        mime_type: impl Into<String>,
    ) -> Self {
        let text: String = text.into();
        Self {
            parts: Some(vec![
                ContentPart::text(text.clone()),
                ContentPart::image(image_base64, mime_type),
            ]),
            ..Self::with_role("user", text)
        }
    }

    pub fn has_images(&self) -> bool {
        self.parts.as_ref().map_or(false, |p| {
            p.iter().any(|c| c.content_type == ContentPartType::Image)
        })
    }
}

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// Raw JSON arguments as produced by the model.
    pub arguments: String,
}

/// Why the model stopped generating. Serialized the way chat UIs expect it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
    ToolCalls,
    Error,
    Other,
    #[default]
    Unknown,
}

impl FinishReason {
    /// Map an OpenAI-style `finish_reason` string.
    pub fn from_openai(reason: &str) -> Self {
        match reason {
            "stop" | "end_turn" => Self::Stop,
            "length" | "max_tokens" => Self::Length,
            "content_filter" => Self::ContentFilter,
            "tool_calls" | "function_call" => Self::ToolCalls,
            "error" => Self::Error,
            _ => Self::Other,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.prompt_tokens += rhs.prompt_tokens;
        self.completion_tokens += rhs.completion_tokens;
    }
}

/// An LLM response that may contain text, tool calls, or both.
#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    /// Text content of the response (may be empty if only tool calls).
    pub text: Option<String>,
    pub tool_calls: Vec<ToolCall>,
    pub finish_reason: FinishReason,
    pub usage: Option<TokenUsage>,
}

impl ChatResponse {
    /// True when the LLM wants to invoke at least one tool.
    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }

    pub fn text_or_empty(&self) -> &str {
        self.text.as_deref().unwrap_or("")
    }
}

/// Request payload for provider chat calls.
#[derive(Debug, Clone, Copy)]
pub struct ChatRequest<'a> {
    pub messages: &'a [ChatMessage],
    pub tools: Option<&'a [ToolSpec]>,
}

#[async_trait]
pub trait Provider: Send + Sync {
    /// Structured chat API for agent loop callers.
    async fn chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: Option<f64>,
    ) -> anyhow::Result<ChatResponse>;

    /// Like [`Provider::chat`], but reports text as it arrives. The default
    /// implementation delivers the whole text as a single delta.
    async fn stream_chat(
        &self,
        request: ChatRequest<'_>,
        model: &str,
        temperature: Option<f64>,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> anyhow::Result<ChatResponse> {
        let response = self.chat(request, model, temperature).await?;
        if let Some(text) = response.text.as_deref().filter(|t| !t.is_empty()) {
            on_text(text);
        }
        Ok(response)
    }

    /// Warm up the HTTP connection pool (TLS handshake, DNS, HTTP/2 setup).
    async fn warmup(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
