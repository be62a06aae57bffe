//! Shared test utilities and fixtures for the psremote test suite.
//!
//! This module provides:
//! - A mock [`Connection`] that records commands and replays canned results
//! - CLIXML and SOAP fixtures captured from Windows Server hosts
//!
//! # Usage
//!
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use psremote::connection::{CmdResult, Connection, ConnectionError, ConnectionResult};
use psremote::powershell;

// ============================================================================
// Mock Connection Implementation
// ============================================================================

/// A mock connection for testing code built on [`Connection`].
///
/// Results are keyed by the exact command string the transport would see, so
/// scripts sent through `run_with_powershell` are registered with
/// [`MockConnection::set_script_result`].
///
/// # Example
///
/// ```rust,ignore
/// let mock = MockConnection::new("admin@win01:5985");
/// mock.set_script_result("hostname", CmdResult::new("WIN01\r\n", ""));
///
/// let result = mock.run_with_powershell(&cancel, "hostname").await.unwrap();
/// assert_eq!(result.stdout, "WIN01\r\n");
/// assert_eq!(mock.command_count(), 1);
/// ```
#[derive(Debug)]
pub struct MockConnection {
    identifier: String,
    commands_executed: Mutex<Vec<String>>,
    command_results: Mutex<HashMap<String, CmdResult>>,
    default_result: Mutex<CmdResult>,
    should_fail: AtomicBool,
    closed: AtomicBool,
    command_count: AtomicU32,
}

impl MockConnection {
    /// Create a new mock connection with the given identifier.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            commands_executed: Mutex::new(Vec::new()),
            command_results: Mutex::new(HashMap::new()),
            default_result: Mutex::new(CmdResult::default()),
            should_fail: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            command_count: AtomicU32::new(0),
        }
    }

    /// Set the result for a verbatim command.
    pub fn set_command_result(&self, command: impl Into<String>, result: CmdResult) {
        self.command_results
            .lock()
            .unwrap()
            .insert(command.into(), result);
    }

    /// Set the result for a script run through `run_with_powershell`.
    pub fn set_script_result(&self, script: &str, result: CmdResult) {
        self.set_command_result(powershell::encode_command(script), result);
    }

    /// Set the default result for commands not explicitly configured.
    pub fn set_default_result(&self, result: CmdResult) {
        *self.default_result.lock().unwrap() = result;
    }

    /// Configure the mock to fail all operations.
    pub fn set_should_fail(&self, should_fail: bool) {
        self.should_fail.store(should_fail, Ordering::SeqCst);
    }

    /// Get the number of commands executed.
    pub fn command_count(&self) -> u32 {
        self.command_count.load(Ordering::SeqCst)
    }

    /// Get all commands that were executed.
    pub fn get_commands(&self) -> Vec<String> {
        self.commands_executed.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MockConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> ConnectionResult<CmdResult> {
        if cancel.is_cancelled() {
            return Err(ConnectionError::Cancelled);
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConnectionError::ConnectionClosed);
        }
        if self.should_fail.load(Ordering::SeqCst) {
            return Err(ConnectionError::command(
                cmd,
                ConnectionError::ConnectionFailed("Mock connection failed".to_string()),
            ));
        }

        self.command_count.fetch_add(1, Ordering::SeqCst);
        self.commands_executed.lock().unwrap().push(cmd.to_string());

        if let Some(result) = self.command_results.lock().unwrap().get(cmd) {
            return Ok(result.clone());
        }
        Ok(self.default_result.lock().unwrap().clone())
    }

    async fn close(&self) -> ConnectionResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

/// Error stream of `Get-LocalUser -Name nobody` on Windows Server 2022.
pub const CLIXML_USER_NOT_FOUND: &str = r#"#< CLIXML
<Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04"><Obj S="progress" RefId="0"><TN RefId="0"><T>System.Management.Automation.PSCustomObject</T><T>System.Object</T></TN><MS><I64 N="SourceId">1</I64><PR N="Record"><AV>Preparing modules for first use.</AV><AI>0</AI><Nil /><PI>-1</PI><PC>-1</PC><T>Completed</T><SR>-1</SR><SD> </SD></PR></MS></Obj><S S="Error">Get-LocalUser : User nobody was not found._x000D__x000A_</S><S S="Error">At line:1 char:1_x000D__x000A_</S><S S="Error">+ Get-LocalUser -Name nobody_x000D__x000A_</S><S S="Error">+ ~~~~~~~~~~~~~~~~~~~~~~~~~~_x000D__x000A_</S><S S="Error">    + CategoryInfo          : ObjectNotFound: (nobody:String) [Get-LocalUser], UserNotFoundException_x000D__x000A_</S><S S="Error">    + FullyQualifiedErrorId : UserNotFound,Microsoft.PowerShell.Commands.GetLocalUserCommand_x000D__x000A_</S><S S="Error"> _x000D__x000A_</S></Objs>"#;

/// Decoded text of [`CLIXML_USER_NOT_FOUND`].
pub const CLIXML_USER_NOT_FOUND_TEXT: &str = "Get-LocalUser : User nobody was not found.At line:1 char:1\nGet-LocalUser -Name nobody\n~~~~~~~~~~~~~~~~~~~~~~~~~~\nCategoryInfo          : ObjectNotFound: (nobody:String) [Get-LocalUser], UserNotFoundException\nFullyQualifiedErrorId : UserNotFound,Microsoft.PowerShell.Commands.GetLocalUserCommand";

/// `Get-LocalUser | ConvertTo-Json` output for a single account.
pub const LOCAL_USER_JSON: &str = r#"{
    "AccountExpires":  null,
    "Description":  "Built-in account for administering the computer/domain",
    "Enabled":  true,
    "FullName":  "",
    "PasswordChangeableDate":  "\/Date(1701379505092)\/",
    "PasswordExpires":  null,
    "UserMayChangePassword":  true,
    "PasswordRequired":  true,
    "PasswordLastSet":  "\/Date(1701293105092)\/",
    "LastLogon":  null,
    "Name":  "Administrator",
    "SID":  {
                "BinaryLength":  28,
                "AccountDomainSid":  "S-1-5-21-1004336348-1177238915-682003330",
                "Value":  "S-1-5-21-1004336348-1177238915-682003330-500"
            },
    "PrincipalSource":  1,
    "ObjectClass":  "User"
}"#;
