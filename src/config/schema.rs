use anyhow::{Context, Result};
use directories::UserDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default OpenAI-compatible endpoint (xAI).
pub const DEFAULT_BASE_URL: &str = "https://api.x.ai/v1";
pub const DEFAULT_MODEL: &str = "grok-4-fast-non-reasoning";
pub const DEFAULT_SANDBOX_API_URL: &str = "https://api.e2b.dev";
pub const DEFAULT_SANDBOX_DOMAIN: &str = "e2b.app";
pub const DEFAULT_ENVD_PORT: u16 = 49983;

// ── Top-level config ─────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Where this config was loaded from. Never serialized.
    #[serde(skip)]
    pub config_path: PathBuf,

    /// Max tracing level: error, warn, info, debug, trace.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub provider: ProviderConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub gateway: GatewayConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

fn default_log_level() -> String {
    "info".into()
}

// ── Provider ─────────────────────────────────────────────────────

/// Chat completion endpoint. Any OpenAI-compatible API works.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Sampling temperature. `None` leaves it to the provider.
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.into()
}

fn default_model() -> String {
    DEFAULT_MODEL.into()
}

fn default_provider_timeout() -> u64 {
    120
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key: None,
            model: default_model(),
            temperature: None,
            timeout_secs: default_provider_timeout(),
        }
    }
}

// ── Sandbox ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Control-plane API (lookup and kill).
    #[serde(default = "default_sandbox_api_url")]
    pub api_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    /// Domain used to reach the in-sandbox daemon when the API does not report one.
    #[serde(default = "default_sandbox_domain")]
    pub domain: String,
    #[serde(default = "default_envd_port")]
    pub envd_port: u16,
    /// Linux user commands run as inside the sandbox.
    #[serde(default = "default_sandbox_user")]
    pub user: String,
    /// X display the desktop runs on.
    #[serde(default = "default_display")]
    pub display: String,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_secs: u64,
}

fn default_sandbox_api_url() -> String {
    DEFAULT_SANDBOX_API_URL.into()
}

fn default_sandbox_domain() -> String {
    DEFAULT_SANDBOX_DOMAIN.into()
}

fn default_envd_port() -> u16 {
    DEFAULT_ENVD_PORT
}

fn default_sandbox_user() -> String {
    "user".into()
}

fn default_display() -> String {
    ":0".into()
}

fn default_command_timeout() -> u64 {
    60
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            api_url: default_sandbox_api_url(),
            api_key: None,
            domain: default_sandbox_domain(),
            envd_port: default_envd_port(),
            user: default_sandbox_user(),
            display: default_display(),
            command_timeout_secs: default_command_timeout(),
        }
    }
}

// ── Agent ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Provider round-trips per request before the run is cut off.
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    /// UI messages kept from the client history.
    #[serde(default = "default_max_history_messages")]
    pub max_history_messages: usize,
}

fn default_max_steps() -> usize {
    30
}

fn default_max_history_messages() -> usize {
    50
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            max_history_messages: default_max_history_messages(),
        }
    }
}

// ── Gateway ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Upper bound for one streamed chat run.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// Chat histories carry base64 screenshots, so this is generous.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

fn default_host() -> String {
    "127.0.0.1".into()
}

fn default_port() -> u16 {
    3000
}

fn default_request_timeout() -> u64 {
    300
}

fn default_max_body_bytes() -> usize {
    32 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// "none", "log" or "prometheus"
    #[serde(default = "default_observability_backend")]
    pub backend: String,
}

fn default_observability_backend() -> String {
    "log".into()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            backend: default_observability_backend(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl Default for Config {
    fn default() -> Self {
        Self {
            config_path: default_config_path().unwrap_or_else(|_| PathBuf::from("config.toml")),
            log_level: default_log_level(),
            provider: ProviderConfig::default(),
            sandbox: SandboxConfig::default(),
            agent: AgentConfig::default(),
            gateway: GatewayConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

/// `~/.deskpilot/config.toml`
pub fn default_config_path() -> Result<PathBuf> {
    let home = UserDirs::new()
        .map(|u| u.home_dir().to_path_buf())
        .context("Could not find home directory")?;
    Ok(home.join(".deskpilot").join("config.toml"))
}

impl Config {
    /// Load the config from `path` (or the default location), writing a
    /// default file first if none exists. Env overrides are applied last.
    pub fn load_or_init(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).into_owned()),
            None => default_config_path()?,
        };

        let mut config = if config_path.exists() {
            let contents = fs::read_to_string(&config_path)
                .with_context(|| format!("Failed to read {}", config_path.display()))?;
            let mut config: Config = toml::from_str(&contents)
                .with_context(|| format!("Failed to parse {}", config_path.display()))?;
            config.config_path = config_path;
            config
        } else {
            let config = Config {
                config_path: config_path.clone(),
                ..Config::default()
            };
            config.save()?;
            tracing::info!("Wrote default config to {}", config_path.display());
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Environment wins over the file so secrets can stay out of it.
    pub fn apply_env_overrides(&mut self) {
        if let Some(key) = env_non_empty("DESKPILOT_API_KEY").or_else(|| env_non_empty("XAI_API_KEY")) {
            self.provider.api_key = Some(key);
        }
        if let Some(url) = env_non_empty("DESKPILOT_BASE_URL") {
            self.provider.base_url = url;
        }
        if let Some(model) = env_non_empty("DESKPILOT_MODEL") {
            self.provider.model = model;
        }
        if let Some(key) = env_non_empty("E2B_API_KEY") {
            self.sandbox.api_key = Some(key);
        }
        if let Some(host) = env_non_empty("DESKPILOT_HOST") {
            self.gateway.host = host;
        }
        let port = env_non_empty("DESKPILOT_PORT").or_else(|| env_non_empty("PORT"));
        if let Some(port) = port {
            match port.parse::<u16>() {
                Ok(p) => self.gateway.port = p,
                Err(_) => tracing::warn!("Ignoring invalid port override: {port}"),
            }
        }
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.config_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let toml_str = toml::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(&self.config_path, toml_str)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;
        Ok(())
    }

    /// Render the effective config with secrets masked.
    pub fn redacted_toml(&self) -> Result<String> {
        let mut copy = self.clone();
        copy.provider.api_key = copy.provider.api_key.as_deref().map(mask_secret);
        copy.sandbox.api_key = copy.sandbox.api_key.as_deref().map(mask_secret);
        toml::to_string_pretty(&copy).context("Failed to serialize config")
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn mask_secret(secret: &str) -> String {
    let prefix: String = secret.chars().take(4).collect();
    format!("{prefix}****")
}
