//! Connection layer for remote PowerShell execution.
//!
//! This module provides one interface for running commands on a Windows host
//! regardless of whether the host is reached over WinRM or SSH.
//!
//! # Overview
//!
//! Every transport implements the [`Connection`] trait. Callers that need to
//! pick a transport from configuration use [`Transport::connect`], which
//! accepts exactly one of the two transport configs and fails before any
//! network I/O when given neither or both.
//!
//! # Supported Transports
//!
//! - **WinRM** ([`winrm`]): WS-Management over HTTP(S), Basic or Kerberos
//!   authenticated. Each run is a request/response exchange.
//! - **SSH** ([`ssh`]): pure Rust SSH via `russh`, host keys checked against
//!   a known_hosts file.
//!
//! # Cancellation
//!
//! Both transports take a [`CancellationToken`], but they honour it
//! differently:
//!
//! - SSH sends `SIGINT` to the remote session (best-effort) and stops
//!   waiting for output. The remote process may still be running.
//! - WinRM abandons the in-flight HTTP exchange. The remote command is not
//!   signalled and its shell is left for the server to reap.
//!
//! # Example
//!
//! ```rust,ignore
//! use psremote::connection::{Config, Connection, Transport};
//! use tokio_util::sync::CancellationToken;
//!
//! let conn = Transport::connect(config).await?;
//! let cancel = CancellationToken::new();
//!
//! let result = conn.run_with_powershell(&cancel, "Get-LocalUser | ConvertTo-Json").await?;
//! println!("{}", result.stdout);
//! conn.close().await?;
//! ```

/// Transport configuration types.
pub mod config;

/// known_hosts parsing and host key verification.
pub mod known_hosts;

/// NTLMv2 message construction for WinRM's Negotiate authentication.
pub mod ntlm;

/// Pure Rust SSH transport using russh.
pub mod ssh;

/// WinRM (WS-Management) transport.
pub mod winrm;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::powershell;

pub use config::{Config, KerberosConfig, SshConfig, WinRmAuthMethod, WinRmConfig};
pub use ssh::SshConnection;
pub use winrm::{KerberosRequest, KerberosTokenSource, WinRmConnection};

/// Russh-related error type - wraps russh::Error for compatibility with the Handler trait
#[derive(Debug)]
pub struct RusshError(pub ::russh::Error);

impl From<::russh::Error> for RusshError {
    fn from(err: ::russh::Error) -> Self {
        RusshError(err)
    }
}

impl std::fmt::Display for RusshError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Russh error: {}", self.0)
    }
}

impl std::error::Error for RusshError {}

impl From<RusshError> for ConnectionError {
    fn from(err: RusshError) -> Self {
        ConnectionError::Ssh(err.0)
    }
}

/// Errors that can occur during connection operations.
///
/// Configuration errors are raised before any network I/O. Errors from a
/// command that reached the transport are wrapped in
/// [`ConnectionError::Command`] so the command string stays recoverable.
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Configuration is invalid or incomplete.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Failed to establish the connection or build the client.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Authentication was rejected by the remote host.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The server's host key is unknown or does not match known_hosts.
    #[error("Host key rejected for {0}")]
    HostKeyRejected(String),

    /// Connection or operation timed out.
    #[error("Connection timeout after {0} seconds")]
    Timeout(u64),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// Connection was closed before or during the operation.
    #[error("Connection closed")]
    ConnectionClosed,

    /// SSH protocol error from russh.
    #[error("SSH error: {0}")]
    Ssh(#[from] ::russh::Error),

    /// HTTP error from the WinRM client.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The WinRM service answered with a SOAP fault.
    #[error("WinRM fault: {0}")]
    WinRmFault(String),

    /// I/O error during connection operations.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A remote command failed at the transport level.
    #[error("Command `{command}` failed: {source}")]
    Command {
        command: String,
        #[source]
        source: Box<ConnectionError>,
    },
}

impl ConnectionError {
    /// Associates an error with the command that produced it.
    pub fn command(command: impl Into<String>, source: impl Into<ConnectionError>) -> Self {
        ConnectionError::Command {
            command: command.into(),
            source: Box::new(source.into()),
        }
    }

    /// The command string, when the error came from a remote call.
    pub fn failed_command(&self) -> Option<&str> {
        match self {
            ConnectionError::Command { command, .. } => Some(command),
            _ => None,
        }
    }

    /// The innermost error, looking through command context.
    pub fn root(&self) -> &ConnectionError {
        match self {
            ConnectionError::Command { source, .. } => source.root(),
            other => other,
        }
    }

    /// True when the operation stopped because the caller cancelled it.
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ConnectionError::Cancelled)
    }
}

/// Result type for connection operations.
pub type ConnectionResult<T> = Result<T, ConnectionError>;

/// Captured output of a remote command.
///
/// A non-empty `stderr` means the remote pipeline wrote to its error stream.
/// That is not a transport failure; the caller decides what it means,
/// usually after decoding it with [`crate::parsing::clixml::decode`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdResult {
    /// Content written to standard output.
    pub stdout: String,
    /// Content written to standard error.
    pub stderr: String,
    /// Exit code, when the transport reported one.
    pub exit_code: Option<i32>,
}

impl CmdResult {
    /// Create a result from captured streams
    pub fn new(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code: None,
        }
    }

    /// Attach an exit code
    pub fn with_exit_code(mut self, code: i32) -> Self {
        self.exit_code = Some(code);
        self
    }

    /// True when the remote error stream is not empty
    pub fn has_stderr(&self) -> bool {
        !self.stderr.trim().is_empty()
    }

    /// Get the combined output (stdout + stderr)
    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else if self.stdout.is_empty() {
            self.stderr.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// A remote host that can run commands.
///
/// Implementations are meant for sequential use by one caller; concurrent
/// `run` calls on the same value are not serialized here.
#[async_trait]
pub trait Connection: Send + Sync {
    /// `user@host:port` of the remote end, for logging.
    fn identifier(&self) -> &str;

    /// Runs `cmd` verbatim on the remote host.
    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> ConnectionResult<CmdResult>;

    /// Wraps `cmd` with [`powershell::encode_command`] and runs it.
    async fn run_with_powershell(
        &self,
        cancel: &CancellationToken,
        cmd: &str,
    ) -> ConnectionResult<CmdResult> {
        debug!(host = %self.identifier(), script = %cmd, "Running PowerShell");
        self.run(cancel, &powershell::encode_command(cmd)).await
    }

    /// Releases transport resources.
    async fn close(&self) -> ConnectionResult<()>;
}

/// A connection over exactly one transport, selected at construction.
#[derive(Debug)]
pub enum Transport {
    WinRm(WinRmConnection),
    Ssh(SshConnection),
}

impl Transport {
    /// Builds the transport named by `config`.
    ///
    /// Fails with [`ConnectionError::InvalidConfig`] before any I/O when the
    /// config names neither transport or both.
    pub async fn connect(config: Config) -> ConnectionResult<Self> {
        match (config.winrm, config.ssh) {
            (Some(winrm), None) => Ok(Transport::WinRm(WinRmConnection::new(winrm)?)),
            (None, Some(ssh)) => Ok(Transport::Ssh(SshConnection::connect(ssh).await?)),
            (None, None) => Err(ConnectionError::InvalidConfig(
                "either a WinRM or an SSH configuration is required".to_string(),
            )),
            (Some(_), Some(_)) => Err(ConnectionError::InvalidConfig(
                "WinRM and SSH configurations are mutually exclusive".to_string(),
            )),
        }
    }

    /// Name of the active transport.
    pub fn kind(&self) -> &'static str {
        match self {
            Transport::WinRm(_) => "winrm",
            Transport::Ssh(_) => "ssh",
        }
    }

    fn inner(&self) -> &dyn Connection {
        match self {
            Transport::WinRm(c) => c,
            Transport::Ssh(c) => c,
        }
    }
}

impl From<WinRmConnection> for Transport {
    fn from(conn: WinRmConnection) -> Self {
        Transport::WinRm(conn)
    }
}

impl From<SshConnection> for Transport {
    fn from(conn: SshConnection) -> Self {
        Transport::Ssh(conn)
    }
}

#[async_trait]
impl Connection for Transport {
    fn identifier(&self) -> &str {
        self.inner().identifier()
    }

    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> ConnectionResult<CmdResult> {
        self.inner().run(cancel, cmd).await
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.inner().close().await
    }
}
