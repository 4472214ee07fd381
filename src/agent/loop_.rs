use crate::agent::history::tool_result_messages;
use crate::observability::{Observer, ObserverEvent};
use crate::providers::{ChatMessage, ChatRequest, FinishReason, Provider, TokenUsage, ToolCall};
use crate::tools::{Tool, ToolResult, ToolSpec};
use serde_json::Value;
use std::time::Instant;
use tokio::sync::mpsc::UnboundedSender;

/// Progress of one agent run, in the order a chat client should render it.
#[derive(Debug, Clone, PartialEq)]
pub enum AgentEvent {
    StepStart {
        message_id: String,
    },
    TextDelta(String),
    ToolCall {
        id: String,
        name: String,
        args: Value,
    },
    ToolResult {
        id: String,
        result: Value,
    },
    StepFinish {
        finish_reason: FinishReason,
        usage: TokenUsage,
        is_continued: bool,
    },
    Finish {
        finish_reason: FinishReason,
        usage: TokenUsage,
    },
    Error(String),
}

/// Model settings for a run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub model: String,
    pub temperature: Option<f64>,
    pub max_steps: usize,
}

fn find_tool<'a>(tools: &'a [Box<dyn Tool>], name: &str) -> Option<&'a dyn Tool> {
    tools.iter().find(|t| t.name() == name).map(|t| t.as_ref())
}

/// Execute one requested call. Failures come back as error text for the model.
async fn execute_call(
    tools: &[Box<dyn Tool>],
    call: &ToolCall,
    args: Result<Value, String>,
    observer: &dyn Observer,
) -> ToolResult {
    let started = Instant::now();
    let action = args
        .as_ref()
        .ok()
        .and_then(|a| a.get("action"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let outcome = match (find_tool(tools, &call.name), args) {
        (None, _) => Err(format!("Unknown tool: {}", call.name)),
        (Some(_), Err(e)) => Err(e),
        (Some(tool), Ok(args)) => tool.execute(args).await.map_err(|e| e.to_string()),
    };

    observer.record_event(&ObserverEvent::ToolCall {
        tool: call.name.clone(),
        action,
        duration: started.elapsed(),
        success: outcome.is_ok(),
    });

    outcome.unwrap_or_else(|e| {
        tracing::warn!(tool = %call.name, "Tool call failed: {e}");
        ToolResult::text(format!("Error: {e}"))
    })
}

fn parse_arguments(raw: &str) -> Result<Value, String> {
    if raw.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(raw).map_err(|e| format!("Invalid tool arguments ({e}): {raw}"))
}

/// Run the model/tool loop until the model stops calling tools or
/// `settings.max_steps` provider round-trips have been made. `history` grows
/// with every assistant turn and tool result.
///
/// Returns early without error when the event receiver is gone.
pub async fn agent_turn(
    provider: &dyn Provider,
    history: &mut Vec<ChatMessage>,
    tools: &[Box<dyn Tool>],
    observer: &dyn Observer,
    settings: &RunSettings,
    events: &UnboundedSender<AgentEvent>,
) -> anyhow::Result<()> {
    let result = drive(provider, history, tools, observer, settings, events).await;
    if let Err(e) = &result {
        let message = e.to_string();
        tracing::error!("Agent run failed: {message}");
        observer.record_event(&ObserverEvent::RunError {
            message: message.clone(),
        });
        let _ = events.send(AgentEvent::Error(message));
    }
    result
}

async fn drive(
    provider: &dyn Provider,
    history: &mut Vec<ChatMessage>,
    tools: &[Box<dyn Tool>],
    observer: &dyn Observer,
    settings: &RunSettings,
    events: &UnboundedSender<AgentEvent>,
) -> anyhow::Result<()> {
    let specs: Vec<ToolSpec> = tools.iter().map(|t| t.spec()).collect();
    let mut total_usage = TokenUsage::default();
    let mut finish_reason = FinishReason::Unknown;

    let on_text = |delta: &str| {
        let _ = events.send(AgentEvent::TextDelta(delta.to_string()));
    };

    for step in 0..settings.max_steps {
        let message_id = format!("msg-{}", uuid::Uuid::new_v4().simple());
        if events.send(AgentEvent::StepStart { message_id }).is_err() {
            tracing::info!("Client went away; stopping agent run");
            return Ok(());
        }

        let request = ChatRequest {
            messages: history.as_slice(),
            tools: (!specs.is_empty()).then_some(specs.as_slice()),
        };
        let response = provider
            .stream_chat(request, &settings.model, settings.temperature, &on_text)
            .await?;

        let usage = response.usage.unwrap_or_default();
        total_usage += usage;
        finish_reason = response.finish_reason;
        observer.record_event(&ObserverEvent::AgentStep {
            step,
            tool_calls: response.tool_calls.len(),
        });

        let text = response.text.unwrap_or_default();
        if response.tool_calls.is_empty() {
            history.push(ChatMessage::assistant(text));
            let _ = events.send(AgentEvent::StepFinish {
                finish_reason,
                usage,
                is_continued: false,
            });
            let _ = events.send(AgentEvent::Finish {
                finish_reason,
                usage: total_usage,
            });
            return Ok(());
        }

        history.push(ChatMessage::assistant_tool_calls(
            text,
            response.tool_calls.clone(),
        ));

        let mut results = Vec::with_capacity(response.tool_calls.len());
        for call in &response.tool_calls {
            let args = parse_arguments(&call.arguments);
            let shown_args = args
                .clone()
                .unwrap_or_else(|_| Value::String(call.arguments.clone()));
            let _ = events.send(AgentEvent::ToolCall {
                id: call.id.clone(),
                name: call.name.clone(),
                args: shown_args,
            });

            let result = execute_call(tools, call, args, observer).await;
            let _ = events.send(AgentEvent::ToolResult {
                id: call.id.clone(),
                result: serde_json::to_value(&result)?,
            });
            results.push((call.id.as_str(), result));
        }
        history.extend(tool_result_messages(results));

        let _ = events.send(AgentEvent::StepFinish {
            finish_reason,
            usage,
            is_continued: false,
        });
    }

    tracing::warn!(max_steps = settings.max_steps, "Agent run hit the step limit");
    let _ = events.send(AgentEvent::Finish {
        finish_reason,
        usage: total_usage,
    });
    Ok(())
}
