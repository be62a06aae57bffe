//! Typed PowerShell invocation
//!
//! [`run_json`] runs a script that ends in `ConvertTo-Json`, treats anything
//! on the error stream as a remote failure, and decodes stdout into `T`.
//!
//! ```rust,ignore
//! use psremote::invoke::{run_json, OneOrMany};
//!
//! #[derive(serde::Deserialize)]
//! #[serde(rename_all = "PascalCase")]
//! struct LocalUser { name: String, enabled: bool }
//!
//! let users: OneOrMany<LocalUser> =
//!     run_json(&conn, &cancel, "Get-LocalUser | ConvertTo-Json").await?;
//! ```

use serde::de::{DeserializeOwned, Deserializer, Error as _};
use serde::Deserialize;
use serde_json::value::RawValue;
use std::ops::Deref;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::connection::{Connection, ConnectionError};
use crate::parsing::clixml;

/// Errors from [`run_json`]
#[derive(Error, Debug)]
pub enum InvokeError {
    /// The transport failed to run the command.
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    /// The command ran but wrote to its error stream.
    #[error("Command `{command}` reported an error: {message}")]
    Remote { command: String, message: String },

    /// Stdout was not the JSON shape the caller asked for.
    #[error("Failed to decode output of `{command}`: {source}")]
    Decode {
        command: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Result type for typed invocations.
pub type InvokeResult<T> = Result<T, InvokeError>;

/// Runs `script` through PowerShell and decodes its JSON output.
///
/// Blank stdout decodes as JSON `null`, so `Option<T>` and [`OneOrMany<T>`]
/// targets see "nothing" instead of a decode error.
pub async fn run_json<T: DeserializeOwned>(
    conn: &dyn Connection,
    cancel: &CancellationToken,
    script: &str,
) -> InvokeResult<T> {
    let result = conn.run_with_powershell(cancel, script).await?;

    if result.has_stderr() {
        let message = remote_message(&result.stderr);
        debug!(host = %conn.identifier(), error = %message, "Remote command wrote to stderr");
        return Err(InvokeError::Remote {
            command: script.to_string(),
            message,
        });
    }

    let stdout = result.stdout.trim();
    let json = if stdout.is_empty() { "null" } else { stdout };
    trace!(host = %conn.identifier(), bytes = json.len(), "Decoding JSON output");

    serde_json::from_str(json).map_err(|source| InvokeError::Decode {
        command: script.to_string(),
        source,
    })
}

/// Human-readable text of an error stream, decoding CLIXML when present.
pub fn remote_message(stderr: &str) -> String {
    if clixml::is_clixml(stderr) {
        if let Ok(message) = clixml::decode(stderr) {
            return message;
        }
    }
    stderr.trim().to_string()
}

/// A JSON value that may be a single object, an array of them, or null.
///
/// `ConvertTo-Json` unwraps one-element pipelines into a bare object; this
/// normalizes all three shapes to a list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneOrMany<T>(pub Vec<T>);

impl<T> Default for OneOrMany<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> OneOrMany<T> {
    pub fn into_vec(self) -> Vec<T> {
        self.0
    }
}

impl<T> Deref for OneOrMany<T> {
    type Target = [T];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<T> IntoIterator for OneOrMany<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

// Items are re-parsed from the raw text so wrappers such as `DotnetTime`
// still see undecoded JSON. Only works with serde_json's deserializer.
impl<'de, T: DeserializeOwned> Deserialize<'de> for OneOrMany<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = Box::<RawValue>::deserialize(deserializer)?;
        let text = raw.get().trim();

        let items = if text == "null" {
            Vec::new()
        } else if text.starts_with('[') {
            serde_json::from_str(text).map_err(D::Error::custom)?
        } else {
            vec![serde_json::from_str(text).map_err(D::Error::custom)?]
        };
        Ok(Self(items))
    }
}
