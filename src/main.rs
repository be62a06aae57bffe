//! psremote - run PowerShell on remote Windows hosts
//!
//! This is the main entry point for the psremote CLI.

mod cli;

use anyhow::{Context, Result};
use cli::commands::CommandContext;
use cli::{Cli, Commands};
use psremote::config::{AppConfig, LogFormat, LoggingConfig};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command line arguments
    let cli = Cli::parse_args();

    // Load configuration
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    // Initialize logging based on verbosity
    init_logging(cli.verbosity(), &config.logging);
    tracing::debug!(version = psremote::version(), "Starting psremote");

    let mut ctx = CommandContext::new(&cli, config);

    let result = match &cli.command {
        Commands::Run(args) => args.execute(&mut ctx).await,
        Commands::Encode(args) => args.execute(),
        Commands::DecodeClixml(args) => args.execute(&ctx),
    };

    match result {
        Ok(exit_code) => std::process::exit(exit_code),
        Err(e) => {
            ctx.output.error(&format!("{:#}", e));
            std::process::exit(1);
        }
    }
}

/// Initialize logging based on verbosity level.
///
/// `RUST_LOG` wins, then `-v` flags, then the configured level.
fn init_logging(verbosity: u8, logging: &LoggingConfig) {
    let filter = match verbosity {
        0 => logging.level.as_deref().unwrap_or("warn"),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let registry = tracing_subscriber::registry().with(env_filter);
    match logging.output_format() {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(
                fmt::layer()
                    .with_target(verbosity >= 3)
                    .with_writer(std::io::stderr),
            )
            .init(),
    }
}
