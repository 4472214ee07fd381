use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Pixel position on the remote screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[f64; 2]", into = "[i32; 2]")]
pub struct Coordinate {
    pub x: i32,
    pub y: i32,
}

impl Coordinate {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

impl From<[f64; 2]> for Coordinate {
    fn from([x, y]: [f64; 2]) -> Self {
        Self {
            x: x.round() as i32,
            y: y.round() as i32,
        }
    }
}

impl From<Coordinate> for [i32; 2] {
    fn from(c: Coordinate) -> Self {
        [c.x, c.y]
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, {}", self.x, self.y)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

impl fmt::Display for ScrollDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured output of a finished remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

#[derive(Debug, thiserror::Error)]
pub enum DesktopError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Sandbox API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Sandbox {0} not found")]
    NotFound(String),

    #[error("{0}")]
    NotConfigured(String),

    #[error("Command exited with code {exit_code} and error:\n{stderr}")]
    CommandExit { exit_code: i32, stderr: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Sandbox daemon error: {code}: {message}")]
    Rpc { code: String, message: String },

    #[error("Timed out after {0}s")]
    Timeout(u64),
}

impl DesktopError {
    /// The sandbox is gone or its access token no longer works, so a cached
    /// connection to it must be re-resolved.
    pub fn is_session_lost(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::Api { status, .. } => matches!(status, 401 | 404),
            Self::Rpc { code, .. } => matches!(code.as_str(), "unauthenticated" | "not_found"),
            _ => false,
        }
    }
}

/// Live handle to one sandbox's screen, input devices and shell.
#[async_trait]
pub trait RemoteDesktop: Send + Sync {
    /// Capture the current frame as PNG bytes.
    async fn screenshot(&self) -> Result<Vec<u8>, DesktopError>;

    async fn move_mouse(&self, at: Coordinate) -> Result<(), DesktopError>;

    async fn left_click(&self) -> Result<(), DesktopError>;

    async fn double_click(&self) -> Result<(), DesktopError>;

    async fn right_click(&self) -> Result<(), DesktopError>;

    /// Type text as keystrokes.
    async fn write(&self, text: &str) -> Result<(), DesktopError>;

    /// Press a single named key.
    async fn press(&self, key: &str) -> Result<(), DesktopError>;

    async fn scroll(&self, direction: ScrollDirection, amount: u32) -> Result<(), DesktopError>;

    /// Press the left button at `from`, move to `to`, release.
    async fn drag(&self, from: Coordinate, to: Coordinate) -> Result<(), DesktopError>;

    /// Run a shell command. A nonzero exit is [`DesktopError::CommandExit`].
    async fn run_command(&self, command: &str) -> Result<CommandOutput, DesktopError>;
}

/// Looks sandboxes up by id. Creation is out of scope; teardown is only used
/// for emergency cleanup.
#[async_trait]
pub trait SandboxService: Send + Sync {
    async fn connect(&self, sandbox_id: &str) -> Result<Arc<dyn RemoteDesktop>, DesktopError>;

    async fn kill(&self, sandbox_id: &str) -> Result<(), DesktopError>;
}
