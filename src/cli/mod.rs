//! CLI module for psremote
//!
//! This module provides the command-line interface, including argument
//! parsing and subcommand handling.

pub mod commands;
pub mod output;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// psremote - run PowerShell on remote Windows hosts over WinRM or SSH
#[derive(Parser, Debug, Clone)]
#[command(name = "psremote")]
#[command(version = psremote::version())]
#[command(about = "Run PowerShell on remote Windows hosts over WinRM or SSH", long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short = 'v', long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Path to configuration file
    #[arg(short = 'c', long, global = true, env = "PSREMOTE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Disable colored output
    #[arg(long, global = true)]
    pub no_color: bool,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Run a command on the configured host
    Run(RunArgs),

    /// Print the encoded powershell.exe invocation for a script
    Encode(EncodeArgs),

    /// Decode a CLIXML error stream from a file or stdin
    #[command(name = "decode-clixml")]
    DecodeClixml(DecodeArgs),
}

/// Arguments for run command
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// PowerShell script to run
    pub command: String,

    /// Send the command verbatim instead of wrapping it in powershell.exe
    #[arg(long)]
    pub raw: bool,

    /// Give up after this many seconds
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
}

/// Arguments for encode command
#[derive(Parser, Debug, Clone)]
pub struct EncodeArgs {
    /// Script to encode
    pub script: String,
}

/// Arguments for decode-clixml command
#[derive(Parser, Debug, Clone)]
pub struct DecodeArgs {
    /// File holding the error stream (reads stdin when omitted)
    pub file: Option<PathBuf>,
}

impl Cli {
    /// Parse command-line arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Get the effective verbosity level (0-3)
    pub fn verbosity(&self) -> u8 {
        self.verbose.min(3)
    }
}
