#![warn(clippy::all)]

use anyhow::{Context, Result};
use base64::Engine;
use clap::{Parser, Subcommand};
use deskpilot::config::Config;
use deskpilot::desktop::{create_sandbox_service, SandboxService};
use deskpilot::tools::{ActionRequest, ComputerTool, ToolResult};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    " (",
    env!("DESKPILOT_GIT_SHA"),
    ", built ",
    env!("DESKPILOT_BUILD_TIME"),
    ")"
);

/// Let a language model drive a remote virtual desktop.
#[derive(Parser, Debug)]
#[command(name = "deskpilot")]
#[command(author = "deskpilot contributors")]
#[command(version = VERSION)]
#[command(about = "Stream a tool-calling model session against a remote desktop sandbox.", long_about = None)]
struct Cli {
    /// Config file (default: ~/.deskpilot/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the chat gateway
    Serve {
        /// Interface to bind (overrides config)
        #[arg(long)]
        host: Option<String>,

        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Perform one desktop action against a sandbox and print the result
    Act {
        /// Sandbox id to act on
        #[arg(long)]
        sandbox: String,

        /// Action as JSON, e.g. '{"action":"left_click","coordinate":[100,200]}'
        action: String,

        /// Where to write screenshot PNGs
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Print the effective configuration with secrets masked
    Config,
}

/// `log_level` takes `RUST_LOG` syntax, e.g. `info` or `deskpilot=debug,reqwest=warn`.
fn log_filter(level: &str) -> Result<EnvFilter> {
    EnvFilter::try_new(level).with_context(|| format!("Invalid log_level {level:?}"))
}

fn init_logging(level: &str) {
    let (filter, rejected) = match log_filter(level) {
        Ok(filter) => (filter, None),
        Err(e) => (EnvFilter::new("info"), Some(e)),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
    if let Some(e) = rejected {
        tracing::warn!("{e:#}; falling back to \"info\"");
    }
}

async fn act(config: &Config, sandbox: &str, action: &str, out: Option<PathBuf>) -> Result<()> {
    let args: serde_json::Value =
        serde_json::from_str(action).context("Action must be a JSON object")?;
    let request = ActionRequest::from_value(&args)?;

    let sandboxes: Arc<dyn SandboxService> = Arc::new(create_sandbox_service(&config.sandbox));
    let tool = ComputerTool::new(sandbox, sandboxes);

    match tool.dispatch(&request).await? {
        ToolResult::Text { text } => println!("{text}"),
        ToolResult::Image { data } => {
            let png = base64::engine::general_purpose::STANDARD
                .decode(&data)
                .context("Screenshot payload is not valid base64")?;
            match out {
                Some(path) => {
                    tokio::fs::write(&path, &png)
                        .await
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("Screenshot saved to {} ({} bytes)", path.display(), png.len());
                }
                None => println!("Screenshot captured ({} bytes); pass --out to save it", png.len()),
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load_or_init(cli.config.as_deref())?;
    init_logging(&config.log_level);

    match cli.command {
        Commands::Serve { host, port } => {
            if let Some(host) = host {
                config.gateway.host = host;
            }
            if let Some(port) = port {
                config.gateway.port = port;
            }
            tracing::info!("deskpilot {VERSION}");
            deskpilot::gateway::run_gateway(config).await
        }
        Commands::Act {
            sandbox,
            action,
            out,
        } => act(&config, &sandbox, &action, out).await,
        Commands::Config => {
            println!("# {}", config.config_path.display());
            print!("{}", config.redacted_toml()?);
            Ok(())
        }
    }
}
