use super::traits::{Tool, ToolResult};
use crate::desktop::{Coordinate, DesktopError, RemoteDesktop, SandboxService, ScrollDirection};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

/// Longest pause a single `wait` action may take, in seconds.
pub const MAX_WAIT_SECS: f64 = 2.0;
/// Result text for a shell command that printed nothing to stdout.
pub const EMPTY_OUTPUT_PLACEHOLDER: &str = "(Command executed successfully with no output)";

const DESCRIPTION: &str = "Use a mouse and keyboard to interact with a computer, and take screenshots. \
    Also run bash commands in a Linux terminal.\n\
    * The screen is a Linux desktop. Always start with a screenshot to see what is on the screen.\n\
    * Coordinates are [x, y] pixel positions measured from the top-left corner.\n\
    * Waits are capped at 2 seconds; take another screenshot to check progress.\n\
    * Scroll with scroll_direction \"up\" or \"down\" and a scroll_amount in wheel clicks.";

// ── Action kinds ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Screenshot,
    Wait,
    LeftClick,
    DoubleClick,
    RightClick,
    MouseMove,
    Type,
    Key,
    Scroll,
    LeftClickDrag,
    Bash,
}

impl ActionKind {
    pub const ALL: [ActionKind; 11] = [
        Self::Screenshot,
        Self::Wait,
        Self::LeftClick,
        Self::DoubleClick,
        Self::RightClick,
        Self::MouseMove,
        Self::Type,
        Self::Key,
        Self::Scroll,
        Self::LeftClickDrag,
        Self::Bash,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Screenshot => "screenshot",
            Self::Wait => "wait",
            Self::LeftClick => "left_click",
            Self::DoubleClick => "double_click",
            Self::RightClick => "right_click",
            Self::MouseMove => "mouse_move",
            Self::Type => "type",
            Self::Key => "key",
            Self::Scroll => "scroll",
            Self::LeftClickDrag => "left_click_drag",
            Self::Bash => "bash",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ActionKind {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| DispatchError::InvalidAction(s.to_string()))
    }
}

// ── Errors ───────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid action: {0:?}")]
    InvalidAction(String),

    #[error("{field} required for {action} action")]
    MissingField {
        action: ActionKind,
        field: &'static str,
    },

    #[error("Malformed arguments: {0}")]
    MalformedArguments(String),

    #[error("{action} failed: {source}")]
    Desktop {
        action: ActionKind,
        #[source]
        source: DesktopError,
    },
}

// ── Requests ─────────────────────────────────────────────────────

/// A pointer position as the model asked for it, plus the pixel it lands on.
/// Result text echoes the requested numbers.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(from = "[f64; 2]")]
pub struct Target {
    pub requested: [f64; 2],
    pub pixel: Coordinate,
}

impl From<[f64; 2]> for Target {
    fn from(requested: [f64; 2]) -> Self {
        Self {
            requested,
            pixel: Coordinate::from(requested),
        }
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.requested[0], self.requested[1])
    }
}

/// Optional fields of a tool call. Which ones matter depends on the action.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ActionParams {
    pub coordinate: Option<Target>,
    pub start_coordinate: Option<Target>,
    pub text: Option<String>,
    pub command: Option<String>,
    pub duration: Option<f64>,
    pub scroll_direction: Option<ScrollDirection>,
    pub scroll_amount: Option<f64>,
}

/// Raw tool-call arguments: the discriminant plus loosely typed fields.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub kind: ActionKind,
    pub params: ActionParams,
}

/// A fully validated action, ready to perform.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    Screenshot,
    /// Already clamped to [`MAX_WAIT_SECS`].
    Wait { seconds: f64 },
    LeftClick(Target),
    DoubleClick(Target),
    RightClick(Target),
    MouseMove(Target),
    Type(String),
    Key(String),
    Scroll {
        direction: ScrollDirection,
        /// Wheel clicks sent to the desktop.
        clicks: u32,
        amount: f64,
    },
    LeftClickDrag {
        from: Target,
        to: Target,
    },
    Bash(String),
}

impl ActionRequest {
    pub fn new(kind: ActionKind) -> Self {
        Self {
            kind,
            params: ActionParams::default(),
        }
    }

    /// Parse tool-call arguments. The `action` discriminant is checked before
    /// any other field.
    pub fn from_value(args: &serde_json::Value) -> Result<Self, DispatchError> {
        let kind = match args.get("action") {
            Some(serde_json::Value::String(name)) => name.parse::<ActionKind>()?,
            Some(other) => return Err(DispatchError::InvalidAction(other.to_string())),
            None => return Err(DispatchError::InvalidAction(String::new())),
        };
        let params = ActionParams::deserialize(args)
            .map_err(|e| DispatchError::MalformedArguments(format!("{kind}: {e}")))?;
        Ok(Self { kind, params })
    }

    pub fn validate(&self) -> Result<Action, DispatchError> {
        let p = &self.params;
        let action = match self.kind {
            ActionKind::Screenshot => Action::Screenshot,
            ActionKind::Wait => {
                let duration = self.require_nonzero(p.duration, "duration")?;
                Action::Wait {
                    seconds: duration.clamp(0.0, MAX_WAIT_SECS),
                }
            }
            ActionKind::LeftClick => Action::LeftClick(self.require(p.coordinate, "coordinate")?),
            ActionKind::DoubleClick => {
                Action::DoubleClick(self.require(p.coordinate, "coordinate")?)
            }
            ActionKind::RightClick => Action::RightClick(self.require(p.coordinate, "coordinate")?),
            ActionKind::MouseMove => Action::MouseMove(self.require(p.coordinate, "coordinate")?),
            ActionKind::Type => Action::Type(self.require_text(p.text.as_deref(), "text")?),
            ActionKind::Key => Action::Key(self.require_text(p.text.as_deref(), "text")?),
            ActionKind::Scroll => {
                let direction = self.require(p.scroll_direction, "scroll_direction")?;
                let amount = self.require_nonzero(p.scroll_amount, "scroll_amount")?;
                if amount < 0.0 || amount > f64::from(u32::MAX) {
                    return Err(DispatchError::MalformedArguments(format!(
                        "scroll_amount must be a positive number of clicks, got {amount}"
                    )));
                }
                Action::Scroll {
                    direction,
                    clicks: amount.round().max(1.0) as u32,
                    amount,
                }
            }
            ActionKind::LeftClickDrag => Action::LeftClickDrag {
                from: self.require(p.start_coordinate, "start_coordinate")?,
                to: self.require(p.coordinate, "coordinate")?,
            },
            ActionKind::Bash => Action::Bash(self.require_text(p.command.as_deref(), "command")?),
        };
        Ok(action)
    }

    fn missing(&self, field: &'static str) -> DispatchError {
        DispatchError::MissingField {
            action: self.kind,
            field,
        }
    }

    fn require<T: Copy>(&self, value: Option<T>, field: &'static str) -> Result<T, DispatchError> {
        value.ok_or_else(|| self.missing(field))
    }

    fn require_text(&self, value: Option<&str>, field: &'static str) -> Result<String, DispatchError> {
        match value {
            Some(s) if !s.is_empty() => Ok(s.to_string()),
            _ => Err(self.missing(field)),
        }
    }

    fn require_nonzero(&self, value: Option<f64>, field: &'static str) -> Result<f64, DispatchError> {
        match value {
            Some(n) if n != 0.0 => Ok(n),
            _ => Err(self.missing(field)),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────

/// Perform a validated action against a live desktop.
pub async fn perform(desktop: &dyn RemoteDesktop, action: &Action) -> Result<ToolResult, DesktopError> {
    let result = match action {
        Action::Screenshot => ToolResult::image(&desktop.screenshot().await?),
        Action::Wait { seconds } => {
            tokio::time::sleep(Duration::from_secs_f64(*seconds)).await;
            ToolResult::text(format!("Waited for {seconds} seconds"))
        }
        Action::LeftClick(at) => {
            desktop.move_mouse(at.pixel).await?;
            desktop.left_click().await?;
            ToolResult::text(format!("Left clicked at {at}"))
        }
        Action::DoubleClick(at) => {
            desktop.move_mouse(at.pixel).await?;
            desktop.double_click().await?;
            ToolResult::text(format!("Double clicked at {at}"))
        }
        Action::RightClick(at) => {
            desktop.move_mouse(at.pixel).await?;
            desktop.right_click().await?;
            ToolResult::text(format!("Right clicked at {at}"))
        }
        Action::MouseMove(at) => {
            desktop.move_mouse(at.pixel).await?;
            ToolResult::text(format!("Moved mouse to {at}"))
        }
        Action::Type(text) => {
            desktop.write(text).await?;
            ToolResult::text(format!("Typed: {text}"))
        }
        Action::Key(text) => {
            let key = if text == "Return" { "enter" } else { text.as_str() };
            desktop.press(key).await?;
            ToolResult::text(format!("Pressed key: {text}"))
        }
        Action::Scroll {
            direction,
            clicks,
            amount,
        } => {
            desktop.scroll(*direction, *clicks).await?;
            ToolResult::text(format!("Scrolled {direction} by {amount}"))
        }
        Action::LeftClickDrag { from, to } => {
            desktop.move_mouse(from.pixel).await?;
            desktop.drag(from.pixel, to.pixel).await?;
            ToolResult::text(format!("Dragged mouse from {from} to {to}"))
        }
        Action::Bash(command) => match desktop.run_command(command).await {
            Ok(output) if output.stdout.is_empty() => ToolResult::text(EMPTY_OUTPUT_PLACEHOLDER),
            Ok(output) => ToolResult::text(output.stdout),
            Err(e) => {
                tracing::warn!("Remote command failed: {e}");
                ToolResult::text(format!("Error executing command: {e}"))
            }
        },
    };
    Ok(result)
}

/// The `computer` tool: one sandbox, eleven actions.
pub struct ComputerTool {
    sandbox_id: String,
    sandboxes: Arc<dyn SandboxService>,
}

impl ComputerTool {
    pub fn new(sandbox_id: impl Into<String>, sandboxes: Arc<dyn SandboxService>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            sandboxes,
        }
    }

    pub fn sandbox_id(&self) -> &str {
        &self.sandbox_id
    }

    pub async fn dispatch(&self, request: &ActionRequest) -> Result<ToolResult, DispatchError> {
        let action = request.validate()?;
        let desktop_error = |source| DispatchError::Desktop {
            action: request.kind,
            source,
        };
        let desktop = self
            .sandboxes
            .connect(&self.sandbox_id)
            .await
            .map_err(desktop_error)?;
        tracing::debug!(sandbox = %self.sandbox_id, action = %request.kind, "Performing action");
        perform(desktop.as_ref(), &action).await.map_err(desktop_error)
    }
}

#[async_trait]
impl Tool for ComputerTool {
    fn name(&self) -> &str {
        "computer"
    }

    fn description(&self) -> &str {
        DESCRIPTION
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let actions: Vec<&str> = ActionKind::ALL.iter().map(|k| k.as_str()).collect();
        let point = json!({
            "type": "array",
            "items": {"type": "number"},
            "minItems": 2,
            "maxItems": 2
        });
        json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": actions,
                    "description": "The action to perform"
                },
                "coordinate": point.clone(),
                "start_coordinate": point,
                "text": {
                    "type": "string",
                    "description": "Text to type, or the key to press for the key action"
                },
                "command": {
                    "type": "string",
                    "description": "Shell command for the bash action"
                },
                "duration": {
                    "type": "number",
                    "description": "Seconds to wait (at most 2)"
                },
                "scroll_direction": {
                    "type": "string",
                    "enum": ["up", "down"]
                },
                "scroll_amount": {
                    "type": "number",
                    "description": "Number of wheel clicks"
                }
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, args: serde_json::Value) -> anyhow::Result<ToolResult> {
        let request = ActionRequest::from_value(&args)?;
        Ok(self.dispatch(&request).await?)
    }
}
