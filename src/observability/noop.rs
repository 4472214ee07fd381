use super::traits::{Observer, ObserverEvent};

/// Discards every event.
pub struct NoopObserver;

impl Observer for NoopObserver {
    fn record_event(&self, _event: &ObserverEvent) {}

    fn name(&self) -> &str {
        "none"
    }
}
