//! Subcommand implementations

use anyhow::{bail, Context, Result};
use psremote::config::AppConfig;
use psremote::connection::{Connection, Transport};
use psremote::invoke::remote_message;
use psremote::parsing::clixml;
use psremote::powershell;
use std::io::Read;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::output::OutputFormatter;
use super::{DecodeArgs, EncodeArgs, RunArgs};

/// Common context shared between commands
pub struct CommandContext {
    /// Configuration
    pub config: AppConfig,
    /// Output formatter
    pub output: OutputFormatter,
}

impl CommandContext {
    /// Create a new command context from CLI arguments
    pub fn new(cli: &super::Cli, config: AppConfig) -> Self {
        Self {
            config,
            output: OutputFormatter::new(!cli.no_color, cli.verbosity()),
        }
    }
}

impl RunArgs {
    /// Connect, run the command, and print its output.
    ///
    /// Returns the process exit code: the remote exit code when it is
    /// non-zero, 1 when the command wrote to stderr, 0 otherwise.
    pub async fn execute(&self, ctx: &mut CommandContext) -> Result<i32> {
        let conn = Transport::connect(ctx.config.connection())
            .await
            .context("Failed to connect")?;
        ctx.output.info(&format!(
            "Connected to {} over {}",
            conn.identifier(),
            conn.kind()
        ));

        let cancel = CancellationToken::new();
        let interrupt = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                debug!("Interrupt received, cancelling command");
                interrupt.cancel();
            }
        });

        let run = async {
            if self.raw {
                conn.run(&cancel, &self.command).await
            } else {
                conn.run_with_powershell(&cancel, &self.command).await
            }
        };

        let outcome = match self.timeout {
            Some(secs) => match tokio::time::timeout(Duration::from_secs(secs), run).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    cancel.cancel();
                    if let Some(warning) = close_connection(&conn).await {
                        ctx.output.warning(&warning);
                    }
                    bail!("Command timed out after {} seconds", secs);
                }
            },
            None => run.await,
        };

        if let Some(warning) = close_connection(&conn).await {
            ctx.output.warning(&warning);
        }

        let result = match outcome {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => {
                ctx.output.error("Command cancelled");
                return Ok(130);
            }
            Err(e) => return Err(e).context("Remote command failed"),
        };

        ctx.output.remote_output(&result.stdout);

        if result.has_stderr() {
            ctx.output.error(&remote_message(&result.stderr));
        }

        Ok(match result.exit_code {
            Some(code) if code != 0 => code,
            _ if result.has_stderr() => 1,
            _ => 0,
        })
    }
}

/// Closes `conn`, returning the warning to print when that fails
async fn close_connection(conn: &impl Connection) -> Option<String> {
    conn.close()
        .await
        .err()
        .map(|e| format!("Failed to close connection: {}", e))
}

impl EncodeArgs {
    /// Print the invocation `run` would send
    pub fn execute(&self) -> Result<i32> {
        println!("{}", powershell::encode_command(&self.script));
        Ok(0)
    }
}

impl DecodeArgs {
    /// Decode a CLIXML stream and print the message text
    pub fn execute(&self, ctx: &CommandContext) -> Result<i32> {
        let input = match &self.file {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read {}", path.display()))?,
            None => {
                let mut buf = String::new();
                std::io::stdin()
                    .read_to_string(&mut buf)
                    .context("Failed to read stdin")?;
                buf
            }
        };

        let message = clixml::decode(input.trim_start()).context("Failed to decode CLIXML")?;
        ctx.output.remote_output(&message);
        Ok(0)
    }
}
