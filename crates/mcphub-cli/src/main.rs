//! # mcphub-cli
//!
//! Command-line interface for mcphub.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mcphub_core::error::format_error_with_suggestion;
use mcphub_core::Config;
use mcphub_mcp::{Hub, McpError};

mod commands;

/// Application context containing shared state.
pub struct AppContext {
    pub config: Config,
    pub hub: Hub,
}

/// mcphub - connect to MCP tool servers and route tool calls
#[derive(Parser)]
#[command(name = "mcphub")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file to use instead of the default locations
    #[arg(short, long, value_name = "PATH", env = "MCPHUB_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured servers and their status
    Servers {
        /// Connect every enabled server before listing
        #[arg(long)]
        connect: bool,
    },
    /// List tools offered by connected servers
    Tools,
    /// Invoke a tool with JSON arguments
    Call {
        /// Tool name
        tool: String,
        /// Arguments as a JSON object
        #[arg(default_value = "{}")]
        args: String,
    },
    /// Print lifecycle events until interrupted
    Watch,
    /// Validate the configuration and exit
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG wins over --verbose
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", describe(e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    if let Commands::CheckConfig = cli.command {
        return commands::check_config::run(cli.config.as_deref());
    }

    let config = load_config(cli.config.as_deref())?;
    let store = mcphub_store::open(&config.store)?;
    let hub = Hub::start(&config, store).await?;
    let ctx = AppContext { config, hub };

    let result = match cli.command {
        Commands::Servers { connect } => commands::servers::run(&ctx, connect).await,
        Commands::Tools => commands::tools::run(&ctx).await,
        Commands::Call { tool, args } => commands::call::run(&ctx, &tool, &args).await,
        Commands::Watch => commands::watch::run(&ctx).await,
        Commands::CheckConfig => Ok(()),
    };

    ctx.hub.shutdown().await;
    result
}

/// Render an error for the terminal, with a recovery hint when one applies.
fn describe(error: anyhow::Error) -> String {
    let error = match error.downcast::<mcphub_core::Error>() {
        Ok(e) => return format_error_with_suggestion(&e),
        Err(e) => e,
    };
    match error.downcast::<McpError>() {
        Ok(e) => format_error_with_suggestion(&e.into()),
        Err(e) => format!("{:#}", e),
    }
}

/// Load and validate configuration, from `path` when given.
fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<Config> {
    let config = match path {
        Some(path) => {
            let config = Config::load_from(path)?;
            config.check()?;
            config
        }
        None => Config::load_validated()?,
    };
    Ok(config)
}
