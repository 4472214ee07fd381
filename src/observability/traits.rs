use std::time::Duration;

/// Events emitted by the agent loop and the gateway.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A chat run was accepted and streaming started.
    ChatStarted { sandbox_id: String },
    /// A chat run could not be prepared; the sandbox was torn down.
    ChatFailed { sandbox_id: String },
    /// One provider round-trip finished.
    AgentStep { step: usize, tool_calls: usize },
    /// A tool invocation finished, successfully or not.
    ToolCall {
        tool: String,
        action: Option<String>,
        duration: Duration,
        success: bool,
    },
    /// A run ended with an error after streaming began.
    RunError { message: String },
}

/// Pluggable sink for [`ObserverEvent`]s.
pub trait Observer: Send + Sync {
    fn record_event(&self, event: &ObserverEvent);

    fn name(&self) -> &str;

    /// Prometheus text exposition, when this backend keeps metrics.
    fn export(&self) -> Option<String> {
        None
    }
}
