pub mod e2b;
pub mod envd;
pub mod traits;

pub use e2b::{E2bDesktop, E2bSandboxService};
pub use traits::{
    CommandOutput, Coordinate, DesktopError, RemoteDesktop, SandboxService, ScrollDirection,
};

use crate::config::SandboxConfig;

pub fn create_sandbox_service(config: &SandboxConfig) -> E2bSandboxService {
    E2bSandboxService::new(config.clone())
}
