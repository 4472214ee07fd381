pub mod openai;
pub mod traits;

pub use openai::OpenAiCompatibleProvider;
pub use traits::{
    ChatMessage, ChatRequest, ChatResponse, ContentPart, ContentPartType, FinishReason, Provider,
    TokenUsage, ToolCall,
};

use crate::config::ProviderConfig;
use crate::util::truncate_with_ellipsis;

/// Longest slice of an error body kept in error messages.
const MAX_ERROR_BODY_CHARS: usize = 400;

/// Key prefixes scrubbed from provider error bodies before they reach logs.
const SECRET_PREFIXES: &[&str] = &["xai-", "sk-", "e2b_", "Bearer "];

pub fn create_provider(config: &ProviderConfig) -> Box<dyn Provider> {
    Box::new(OpenAiCompatibleProvider::new(config))
}

/// Replace anything that looks like an API key with `[REDACTED]`.
pub fn scrub_secrets(input: &str) -> String {
    let mut out = input.to_string();
    for prefix in SECRET_PREFIXES {
        let mut search_from = 0;
        while let Some(rel) = out[search_from..].find(prefix) {
            let start = search_from + rel + prefix.len();
            let end = out[start..]
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.'))
                .map_or(out.len(), |n| start + n);
            if end > start {
                out.replace_range(start..end, "[REDACTED]");
                search_from = start + "[REDACTED]".len();
            } else {
                search_from = start;
            }
        }
    }
    out
}

/// Build an error from a non-2xx provider response.
pub async fn api_error(provider: &str, response: reqwest::Response) -> anyhow::Error {
    let status = response.status();
    let body = response
        .text()
        .await
        .unwrap_or_else(|e| format!("<failed to read body: {e}>"));
    let body = scrub_secrets(&truncate_with_ellipsis(body.trim(), MAX_ERROR_BODY_CHARS));
    anyhow::anyhow!("{provider} API error ({status}): {body}")
}
