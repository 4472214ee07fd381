pub mod computer;
pub mod traits;

pub use computer::{Action, ActionKind, ActionRequest, ComputerTool, DispatchError, Target};
pub use traits::{Tool, ToolResult, ToolSpec};

use crate::desktop::SandboxService;
use std::sync::Arc;

/// Tools available to the model for one sandbox session.
pub fn tools_for_sandbox(sandbox_id: &str, sandboxes: Arc<dyn SandboxService>) -> Vec<Box<dyn Tool>> {
    vec![Box::new(ComputerTool::new(sandbox_id, sandboxes))]
}
