use super::traits::{Observer, ObserverEvent};
use crate::tools::ActionKind;
use anyhow::Result;
use prometheus::{HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};

/// Label for calls whose action is missing or not one of the known kinds.
const INVALID_ACTION: &str = "invalid";

/// Action names come from the model, so only known kinds become label values.
fn action_label(action: Option<&str>) -> &'static str {
    action
        .and_then(|a| a.parse::<ActionKind>().ok())
        .map_or(INVALID_ACTION, ActionKind::as_str)
}

/// Keeps counters and histograms in a private registry served at `/metrics`.
pub struct PrometheusObserver {
    registry: Registry,
    actions: IntCounterVec,
    action_duration: HistogramVec,
    chat_requests: IntCounterVec,
    agent_steps: IntCounter,
    run_errors: IntCounter,
}

impl PrometheusObserver {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let actions = IntCounterVec::new(
            Opts::new("deskpilot_actions_total", "Tool invocations by action and outcome"),
            &["action", "outcome"],
        )?;
        let action_duration = HistogramVec::new(
            HistogramOpts::new(
                "deskpilot_action_duration_seconds",
                "Wall time of tool invocations",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]),
            &["action"],
        )?;
        let chat_requests = IntCounterVec::new(
            Opts::new("deskpilot_chat_requests_total", "Chat runs by outcome"),
            &["outcome"],
        )?;
        let agent_steps = IntCounter::new("deskpilot_agent_steps_total", "Provider round-trips")?;
        let run_errors = IntCounter::new(
            "deskpilot_run_errors_total",
            "Runs that failed after streaming started",
        )?;

        registry.register(Box::new(actions.clone()))?;
        registry.register(Box::new(action_duration.clone()))?;
        registry.register(Box::new(chat_requests.clone()))?;
        registry.register(Box::new(agent_steps.clone()))?;
        registry.register(Box::new(run_errors.clone()))?;

        Ok(Self {
            registry,
            actions,
            action_duration,
            chat_requests,
            agent_steps,
            run_errors,
        })
    }
}

impl Observer for PrometheusObserver {
    fn record_event(&self, event: &ObserverEvent) {
        match event {
            ObserverEvent::ChatStarted { .. } => {
                self.chat_requests.with_label_values(&["started"]).inc();
            }
            ObserverEvent::ChatFailed { .. } => {
                self.chat_requests.with_label_values(&["failed"]).inc();
            }
            ObserverEvent::AgentStep { .. } => self.agent_steps.inc(),
            ObserverEvent::ToolCall {
                action,
                duration,
                success,
                ..
            } => {
                let label = action_label(action.as_deref());
                let outcome = if *success { "ok" } else { "error" };
                self.actions.with_label_values(&[label, outcome]).inc();
                self.action_duration
                    .with_label_values(&[label])
                    .observe(duration.as_secs_f64());
            }
            ObserverEvent::RunError { .. } => self.run_errors.inc(),
        }
    }

    fn name(&self) -> &str {
        "prometheus"
    }

    fn export(&self) -> Option<String> {
        match TextEncoder::new().encode_to_string(&self.registry.gather()) {
            Ok(text) => Some(text),
            Err(e) => {
                tracing::warn!("Failed to encode metrics: {e}");
                None
            }
        }
    }
}
