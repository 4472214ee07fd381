pub mod log;
pub mod noop;
pub mod prometheus;
pub mod traits;

pub use self::log::LogObserver;
pub use self::noop::NoopObserver;
pub use self::prometheus::PrometheusObserver;
pub use traits::{Observer, ObserverEvent};

use crate::config::ObservabilityConfig;

/// Build the observer named by `config.backend`. Unknown names fall back to logging.
pub fn create_observer(config: &ObservabilityConfig) -> Box<dyn Observer> {
    match config.backend.as_str() {
        "none" | "noop" => Box::new(NoopObserver),
        "prometheus" => match PrometheusObserver::new() {
            Ok(observer) => Box::new(observer),
            Err(e) => {
                tracing::warn!("Prometheus observer unavailable ({e}); using log backend");
                Box::new(LogObserver)
            }
        },
        "log" => Box::new(LogObserver),
        other => {
            tracing::warn!("Unknown observability backend '{other}'; using log backend");
            Box::new(LogObserver)
        }
    }
}
