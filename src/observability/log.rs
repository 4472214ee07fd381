use super::traits::{Observer, ObserverEvent};

/// Writes events as structured `tracing` records.
pub struct LogObserver;

impl Observer for LogObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::ChatStarted { sandbox_id } => {
                tracing::info!(sandbox_id = %sandbox_id, "chat run started");
            }
            ObserverEvent::ChatFailed { sandbox_id } => {
                tracing::warn!(sandbox_id = %sandbox_id, "chat run failed to start");
            }
            ObserverEvent::AgentStep { step, tool_calls } => {
                tracing::debug!(step, tool_calls, "agent step finished");
            }
            ObserverEvent::ToolCall {
                tool,
                action,
                duration,
                success,
            } => {
                tracing::info!(
                    tool = %tool,
                    action = action.as_deref().unwrap_or("-"),
                    duration_ms = duration.as_millis() as u64,
                    success,
                    "tool call"
                );
            }
            ObserverEvent::RunError { message } => {
                tracing::error!(error = %message, "chat run error");
            }
        }
    }

    fn name(&self) -> &str {
        "log"
    }
}
