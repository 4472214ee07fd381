use crate::config::ProviderConfig;
use crate::providers::traits::{
    ChatMessage, ChatRequest as ProviderChatRequest, ChatResponse as ProviderChatResponse,
    ContentPartType, FinishReason, Provider, TokenUsage, ToolCall as ProviderToolCall,
};
use crate::tools::ToolSpec;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Any endpoint speaking the OpenAI chat-completions dialect (xAI by default).
pub struct OpenAiCompatibleProvider {
    base_url: String,
    api_key: Option<String>,
    client: Client,
}

// ── Wire types ───────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct NativeChatRequest {
    model: String,
    messages: Vec<NativeMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<NativeToolSpec>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<String>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct NativeMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<NativeToolCall>>,
}

#[derive(Debug, Serialize)]
struct NativeToolSpec {
    #[serde(rename = "type")]
    kind: String,
    function: NativeToolFunctionSpec,
}

#[derive(Debug, Serialize)]
struct NativeToolFunctionSpec {
    name: String,
    description: String,
    parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct NativeToolCall {
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
    function: NativeFunctionCall,
}

#[derive(Debug, Serialize, Deserialize)]
struct NativeFunctionCall {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct NativeChatResponse {
    #[serde(default)]
    choices: Vec<NativeChoice>,
    #[serde(default)]
    usage: Option<NativeUsage>,
}

#[derive(Debug, Deserialize)]
struct NativeChoice {
    message: NativeResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NativeResponseMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<NativeToolCall>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
struct NativeUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

impl From<NativeUsage> for TokenUsage {
    fn from(u: NativeUsage) -> Self {
        Self {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
        }
    }
}

// ── Streaming ────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<NativeUsage>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// One `data:` payload from a server-sent event stream.
#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Data(String),
    Done,
}

/// Splits a byte stream into SSE `data:` lines. Partial lines (including
/// split multibyte characters) stay buffered until their newline arrives.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = Self::parse_line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing line that never got its newline.
    fn finish(&mut self) -> Option<SseEvent> {
        let rest = std::mem::take(&mut self.buffer);
        let line = String::from_utf8_lossy(&rest);
        Self::parse_line(line.trim())
    }

    fn parse_line(line: &str) -> Option<SseEvent> {
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            Some(SseEvent::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseEvent::Data(data.to_string()))
        }
    }
}

#[derive(Debug, Default)]
struct PartialToolCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Folds stream chunks into a complete response. Tool-call fragments are
/// keyed by their `index` and concatenated in arrival order.
#[derive(Debug, Default)]
struct StreamAccumulator {
    text: String,
    tool_calls: BTreeMap<usize, PartialToolCall>,
    finish_reason: Option<String>,
    usage: Option<TokenUsage>,
}

impl StreamAccumulator {
    /// Apply one chunk, returning any text delta it carried.
    fn apply(&mut self, chunk: StreamChunk) -> anyhow::Result<Option<String>> {
        if let Some(error) = chunk.error {
            anyhow::bail!("Provider stream error: {error}");
        }
        if let Some(usage) = chunk.usage {
            self.usage = Some(usage.into());
        }

        let mut delta_text = String::new();
        for choice in chunk.choices {
            if let Some(reason) = choice.finish_reason {
                self.finish_reason = Some(reason);
            }
            if let Some(content) = choice.delta.content {
                delta_text.push_str(&content);
            }
            for (position, call) in choice.delta.tool_calls.unwrap_or_default().into_iter().enumerate() {
                let slot = self
                    .tool_calls
                    .entry(call.index.unwrap_or(position))
                    .or_default();
                if let Some(id) = call.id.filter(|id| !id.is_empty()) {
                    slot.id = Some(id);
                }
                if let Some(function) = call.function {
                    if let Some(name) = function.name {
                        slot.name.push_str(&name);
                    }
                    if let Some(arguments) = function.arguments {
                        slot.arguments.push_str(&arguments);
                    }
                }
            }
        }

        if delta_text.is_empty() {
            return Ok(None);
        }
        self.text.push_str(&delta_text);
        Ok(Some(delta_text))
    }

    fn finish(self) -> ProviderChatResponse {
        let tool_calls: Vec<ProviderToolCall> = self
            .tool_calls
            .into_values()
            .map(|call| ProviderToolCall {
                id: call.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: call.name,
                arguments: call.arguments,
            })
            .collect();
        let finish_reason = match self.finish_reason.as_deref() {
            Some(reason) => FinishReason::from_openai(reason),
            None if !tool_calls.is_empty() => FinishReason::ToolCalls,
            None => FinishReason::Unknown,
        };
        ProviderChatResponse {
            text: (!self.text.is_empty()).then_some(self.text),
            tool_calls,
            finish_reason,
            usage: self.usage,
        }
    }
}

// ── Provider ─────────────────────────────────────────────────────

impl OpenAiCompatibleProvider {
    pub fn new(config: &ProviderConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone().filter(|k| !k.is_empty()),
            client: Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .connect_timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_else(|_| Client::new()),
        }
    }

    fn api_key(&self) -> anyhow::Result<&str> {
        self.api_key.as_deref().ok_or_else(|| {
            anyhow::anyhow!("Model API key not set. Set DESKPILOT_API_KEY or XAI_API_KEY.")
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }

    fn convert_tools(tools: Option<&[ToolSpec]>) -> Option<Vec<NativeToolSpec>> {
        let items = tools?;
        if items.is_empty() {
            return None;
        }
        Some(
            items
                .iter()
                .map(|tool| NativeToolSpec {
                    kind: "function".to_string(),
                    function: NativeToolFunctionSpec {
                        name: tool.name.clone(),
                        description: tool.description.clone(),
                        parameters: tool.parameters.clone(),
                    },
                })
                .collect(),
        )
    }

    fn convert_content(m: &ChatMessage) -> Option<serde_json::Value> {
        if let Some(parts) = &m.parts {
            let content_parts: Vec<serde_json::Value> = parts
                .iter()
                .map(|p| match p.content_type {
                    ContentPartType::Text => {
                        serde_json::json!({"type": "text", "text": p.text.as_deref().unwrap_or("")})
                    }
                    ContentPartType::Image => {
                        let mime = p.mime_type.as_deref().unwrap_or("image/png");
                        let data = p.image_base64.as_deref().unwrap_or("");
                        serde_json::json!({
                            "type": "image_url",
                            "image_url": {"url": format!("data:{mime};base64,{data}")}
                        })
                    }
                })
                .collect();
            return Some(serde_json::Value::Array(content_parts));
        }
        if m.content.is_empty() && m.tool_calls.is_some() {
            return None;
        }
        Some(serde_json::Value::String(m.content.clone()))
    }

    fn convert_messages(messages: &[ChatMessage]) -> Vec<NativeMessage> {
        messages
            .iter()
            .map(|m| NativeMessage {
                role: m.role.clone(),
                content: Self::convert_content(m),
                tool_call_id: m.tool_call_id.clone(),
                tool_calls: m.tool_calls.as_ref().map(|calls| {
                    calls
                        .iter()
                        .map(|tc| NativeToolCall {
                            id: Some(tc.id.clone()),
                            kind: Some("function".to_string()),
                            function: NativeFunctionCall {
                                name: tc.name.clone(),
                                arguments: tc.arguments.clone(),
                            },
                        })
                        .collect()
                }),
            })
            .collect()
    }

    fn build_request(
        request: ProviderChatRequest<'_>,
        model: &str,
        temperature: Option<f64>,
        stream: bool,
    ) -> NativeChatRequest {
        let tools = Self::convert_tools(request.tools);
        NativeChatRequest {
            model: model.to_string(),
            messages: Self::convert_messages(request.messages),
            temperature,
            tool_choice: tools.as_ref().map(|_| "auto".to_string()),
            tools,
            stream,
            stream_options: stream.then_some(StreamOptions {
                include_usage: true,
            }),
        }
    }

    fn parse_native_response(response: NativeChatResponse) -> anyhow::Result<ProviderChatResponse> {
        let choice = response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No response from model provider"))?;
        let tool_calls = choice
            .message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|tc| ProviderToolCall {
                id: tc.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: tc.function.name,
                arguments: tc.function.arguments,
            })
            .collect::<Vec<_>>();

        Ok(ProviderChatResponse {
            text: choice.message.content,
            finish_reason: choice
                .finish_reason
                .as_deref()
                .map_or(FinishReason::Unknown, FinishReason::from_openai),
            tool_calls,
            usage: response.usage.map(Into::into),
        })
    }

    async fn post(&self, body: &NativeChatRequest) -> anyhow::Result<reqwest::Response> {
        let api_key = self.api_key()?;
        let response = self
            .client
            .post(self.completions_url())
            .bearer_auth(api_key)
            .json(body)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(super::api_error("Model provider", response).await);
        }
        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiCompatibleProvider {
    async fn warmup(&self) -> anyhow::Result<()> {
        if let Some(api_key) = self.api_key.as_ref() {
            self.client
                .get(format!("{}/models", self.base_url))
                .bearer_auth(api_key)
                .send()
                .await?
                .error_for_status()?;
        }
        Ok(())
    }

    async fn chat(
        &self,
        request: ProviderChatRequest<'_>,
        model: &str,
        temperature: Option<f64>,
    ) -> anyhow::Result<ProviderChatResponse> {
        let native_request = Self::build_request(request, model, temperature, false);
        let response = self.post(&native_request).await?;
        let native_response: NativeChatResponse = response.json().await?;
        Self::parse_native_response(native_response)
    }

    async fn stream_chat(
        &self,
        request: ProviderChatRequest<'_>,
        model: &str,
        temperature: Option<f64>,
        on_text: &(dyn for<'s> Fn(&'s str) + Send + Sync),
    ) -> anyhow::Result<ProviderChatResponse> {
        let native_request = Self::build_request(request, model, temperature, true);
        let response = self.post(&native_request).await?;

        let mut parser = SseParser::default();
        let mut acc = StreamAccumulator::default();
        let mut stream = response.bytes_stream();
        let mut done = false;

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            for event in parser.push(&chunk) {
                match event {
                    SseEvent::Done => {
                        done = true;
                        break 'read;
                    }
                    SseEvent::Data(data) => {
                        let parsed: StreamChunk = serde_json::from_str(&data).map_err(|e| {
                            anyhow::anyhow!("Malformed stream chunk ({e}): {}", crate::util::truncate_with_ellipsis(&data, 200))
                        })?;
                        if let Some(delta) = acc.apply(parsed)? {
                            on_text(&delta);
                        }
                    }
                }
            }
        }

        if !done {
            if let Some(SseEvent::Data(data)) = parser.finish() {
                if let Some(delta) = acc.apply(serde_json::from_str(&data)?)? {
                    on_text(&delta);
                }
            }
        }

        Ok(acc.finish())
    }
}
