//! # psremote - Remote PowerShell over WinRM or SSH
//!
//! psremote runs PowerShell on remote Windows hosts and turns what comes back
//! into typed values. One [`Connection`](connection::Connection) trait covers
//! both transports, so code built on it does not care how the host is reached.
//!
//! ## Architecture Overview
//!
//! ```text
//! caller / invoke::run_json
//!     │ script
//!     ▼
//! powershell::encode_command      (UTF-16LE + Base64 powershell.exe line)
//!     │
//!     ▼
//! connection::Transport ──► WinRM (SOAP over reqwest) | SSH (russh)
//!     │ CmdResult { stdout, stderr, exit_code }
//!     ▼
//! parsing                         (CLIXML, DotnetTime, CIM duration/key-val/IPv4)
//! ```
//!
//! ## Quick Example
//!
//! ```rust,ignore
//! use psremote::prelude::*;
//!
//! let conn = Transport::connect(Config::winrm(WinRmConfig::new("win01", "admin", "secret"))).await?;
//! let cancel = CancellationToken::new();
//!
//! let names: OneOrMany<String> =
//!     run_json(&conn, &cancel, "Get-LocalUser | Select-Object -ExpandProperty Name | ConvertTo-Json").await?;
//! ```

#![warn(clippy::all)]

// Re-export commonly used items in prelude
pub mod prelude {
    //! Convenient re-exports of commonly used types and traits.

    pub use crate::connection::{
        CmdResult, Config, Connection, ConnectionError, ConnectionResult, SshConfig,
        SshConnection, Transport, WinRmConfig, WinRmConnection,
    };
    pub use crate::invoke::{run_json, InvokeError, OneOrMany};
    pub use crate::parsing::{
        CimClassKeyVal, CimIpAddress, CimTimeDuration, DotnetTime, ParseError,
    };
    pub use tokio_util::sync::CancellationToken;
}

/// Connection layer for remote host communication.
///
/// Provides the [`Connection`](connection::Connection) trait and its WinRM
/// and SSH implementations.
pub mod connection;

/// PowerShell command encoding.
pub mod powershell;

/// Decoders for CLIXML and the JSON shapes of .NET and CIM values.
pub mod parsing;

/// Typed invocation on top of a connection.
pub mod invoke;

/// Configuration file loading for the `psremote` binary.
pub mod config;

/// Returns the current version of psremote.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
