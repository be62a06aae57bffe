//! PowerShell command encoding
//!
//! Remote hosts receive scripts as `powershell.exe -NoProfile -EncodedCommand`
//! invocations. The script travels as Base64 of its UTF-16LE bytes so that
//! quoting, newlines and pipes survive both the WinRM command line and an
//! SSH exec request unchanged.

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};

/// Prepended to every encoded script.
///
/// PowerShell writes progress records to the error stream, which callers
/// would otherwise mistake for a failed command.
pub const PROGRESS_PREFERENCE_PREFIX: &str = "$ProgressPreference = 'SilentlyContinue'; ";

/// Executable and flags placed in front of the encoded payload.
pub const POWERSHELL_INVOCATION: &str = "powershell.exe -NoProfile -EncodedCommand";

/// Wraps a script into a single `powershell.exe` command line.
///
/// The output is deterministic and byte-exact:
///
/// ```
/// let cmd = psremote::powershell::encode_command("Get-LocalUser");
/// assert!(cmd.starts_with("powershell.exe -NoProfile -EncodedCommand JABQ"));
/// ```
pub fn encode_command(script: &str) -> String {
    let mut full = String::with_capacity(PROGRESS_PREFERENCE_PREFIX.len() + script.len());
    full.push_str(PROGRESS_PREFERENCE_PREFIX);
    full.push_str(script);

    format!("{} {}", POWERSHELL_INVOCATION, encode_utf16le_base64(&full))
}

/// Base64 of the UTF-16 little-endian encoding of `s`, without a byte-order mark.
pub fn encode_utf16le_base64(s: &str) -> String {
    let bytes: Vec<u8> = s.encode_utf16().flat_map(|c| c.to_le_bytes()).collect();
    BASE64_STANDARD.encode(bytes)
}

/// Quotes a value as a PowerShell single-quoted literal.
///
/// Embedded single quotes are doubled, which is the only escape a
/// single-quoted PowerShell string recognises.
pub fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "''"))
}
