pub mod schema;

pub use schema::{
    AgentConfig, Config, GatewayConfig, ObservabilityConfig, ProviderConfig, SandboxConfig,
};
