//! Connection configuration module
//!
//! Transport settings as supplied by the caller. Validation happens when a
//! transport is constructed; defaults (ports, known_hosts location, timeouts)
//! are applied only after validation succeeds.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use super::{ConnectionError, ConnectionResult};

/// Default WinRM HTTP port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

/// Default WinRM HTTPS port
pub const DEFAULT_WINRM_TLS_PORT: u16 = 5986;

/// Default WinRM operation timeout in seconds
pub const DEFAULT_WINRM_TIMEOUT: u64 = 60;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default SSH connect timeout in seconds
pub const DEFAULT_SSH_TIMEOUT: u64 = 30;

/// Default Kerberos protocol scheme
pub const DEFAULT_KERBEROS_PROTOCOL: &str = "https";

/// Choice of transport. Exactly one of the two must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub winrm: Option<WinRmConfig>,
    #[serde(default)]
    pub ssh: Option<SshConfig>,
}

impl Config {
    /// Config for a WinRM connection.
    pub fn winrm(config: WinRmConfig) -> Self {
        Self {
            winrm: Some(config),
            ssh: None,
        }
    }

    /// Config for an SSH connection.
    pub fn ssh(config: SshConfig) -> Self {
        Self {
            winrm: None,
            ssh: Some(config),
        }
    }
}

// ============================================================================
// WinRM
// ============================================================================

/// WinRM connection settings
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct WinRmConfig {
    /// Target hostname or IP address
    pub host: String,
    /// WinRM port (default: 5985, or 5986 with TLS)
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    /// May be left out of files and supplied through the environment
    #[serde(default)]
    pub password: String,
    /// Use HTTPS instead of HTTP
    #[serde(default)]
    pub use_tls: bool,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub insecure: bool,
    /// Operation timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
    /// Password authentication scheme, ignored when Kerberos is configured
    #[serde(default)]
    pub auth: WinRmAuthMethod,
    /// Kerberos settings; password authentication is used when absent
    #[serde(default)]
    pub kerberos: Option<KerberosConfig>,
}

/// Password-based WinRM authentication scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinRmAuthMethod {
    /// NTLMv2 over `Authorization: Negotiate`, the Windows default
    #[default]
    Ntlm,
    /// HTTP Basic; must be enabled on the host
    Basic,
}

/// Kerberos settings for WinRM
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KerberosConfig {
    pub realm: String,
    /// Path to krb5.conf
    #[serde(default)]
    pub krb_config_file: Option<PathBuf>,
    /// `http` or `https` (default: https)
    #[serde(default)]
    pub protocol: Option<String>,
}

impl WinRmConfig {
    /// Create a config with the required fields
    pub fn new(
        host: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: password.into(),
            ..Default::default()
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Enable HTTPS
    pub fn with_tls(mut self, use_tls: bool) -> Self {
        self.use_tls = use_tls;
        self
    }

    /// Skip certificate verification
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Set the operation timeout in seconds
    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout = Some(secs);
        self
    }

    /// Choose the password authentication scheme
    pub fn with_auth(mut self, auth: WinRmAuthMethod) -> Self {
        self.auth = auth;
        self
    }

    /// Use Kerberos authentication
    pub fn with_kerberos(mut self, kerberos: KerberosConfig) -> Self {
        self.kerberos = Some(kerberos);
        self
    }

    /// Checks required fields and applies defaults.
    pub fn resolve(&self) -> ConnectionResult<ResolvedWinRm> {
        require("WinRM host", &self.host)?;
        require("WinRM username", &self.username)?;
        require("WinRM password", &self.password)?;

        let port = self.port.unwrap_or(if self.use_tls {
            DEFAULT_WINRM_TLS_PORT
        } else {
            DEFAULT_WINRM_PORT
        });
        let timeout = Duration::from_secs(self.timeout.unwrap_or(DEFAULT_WINRM_TIMEOUT));

        Ok(ResolvedWinRm {
            host: self.host.clone(),
            port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_tls: self.use_tls,
            insecure: self.insecure,
            timeout,
            auth: self.auth,
        })
    }
}

impl fmt::Debug for WinRmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("use_tls", &self.use_tls)
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .field("auth", &self.auth)
            .field("kerberos", &self.kerberos)
            .finish()
    }
}

/// WinRM settings after validation, with defaults applied
#[derive(Clone)]
pub struct ResolvedWinRm {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
    pub insecure: bool,
    pub timeout: Duration,
    pub auth: WinRmAuthMethod,
}

impl ResolvedWinRm {
    /// Get the WinRM endpoint URL
    pub fn endpoint_url(&self) -> String {
        let scheme = if self.use_tls { "https" } else { "http" };
        format!("{}://{}:{}/wsman", scheme, self.host, self.port)
    }
}

impl KerberosConfig {
    /// Create Kerberos settings for a realm
    pub fn new(realm: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            ..Default::default()
        }
    }

    /// Protocol scheme after defaulting. Must be exactly `http` or `https`.
    pub fn resolved_protocol(&self) -> ConnectionResult<&str> {
        match self.protocol.as_deref() {
            None | Some("") => Ok(DEFAULT_KERBEROS_PROTOCOL),
            Some(p @ ("http" | "https")) => Ok(p),
            Some(other) => Err(ConnectionError::InvalidConfig(format!(
                "Kerberos protocol must be http or https, got {:?}",
                other
            ))),
        }
    }
}

// ============================================================================
// SSH
// ============================================================================

/// SSH connection settings
///
/// Any combination of `private_key`, `private_key_path` and `password` may
/// be set; every supplied method is offered to the server in that order.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SshConfig {
    pub host: String,
    /// SSH port (default: 22)
    #[serde(default)]
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// Private key material in OpenSSH or PEM form
    #[serde(default)]
    pub private_key: Option<String>,
    /// Path to a private key file
    #[serde(default)]
    pub private_key_path: Option<String>,
    /// known_hosts file (default: ~/.ssh/known_hosts)
    #[serde(default)]
    pub known_hosts_path: Option<String>,
    /// Accept any host key
    #[serde(default)]
    pub insecure: bool,
    /// TCP connect timeout in seconds
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl SshConfig {
    /// Create a config for `username@host`
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Authenticate with a password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Authenticate with in-memory key material
    pub fn with_private_key(mut self, key: impl Into<String>) -> Self {
        self.private_key = Some(key.into());
        self
    }

    /// Authenticate with a key file
    pub fn with_private_key_path(mut self, path: impl Into<String>) -> Self {
        self.private_key_path = Some(path.into());
        self
    }

    /// Use a specific known_hosts file
    pub fn with_known_hosts(mut self, path: impl Into<String>) -> Self {
        self.known_hosts_path = Some(path.into());
        self
    }

    /// Skip host key verification
    pub fn with_insecure(mut self, insecure: bool) -> Self {
        self.insecure = insecure;
        self
    }

    /// Checks required fields and applies defaults.
    pub fn resolve(&self) -> ConnectionResult<ResolvedSsh> {
        require("SSH host", &self.host)?;
        require("SSH username", &self.username)?;

        let has_auth = [&self.password, &self.private_key, &self.private_key_path]
            .iter()
            .any(|v| v.as_deref().is_some_and(|s| !s.is_empty()));
        if !has_auth {
            return Err(ConnectionError::InvalidConfig(
                "SSH requires a password, private key or private key path".to_string(),
            ));
        }

        let known_hosts = if self.insecure {
            None
        } else {
            Some(match self.known_hosts_path.as_deref() {
                Some(p) if !p.is_empty() => expand_path(p),
                _ => default_known_hosts()?,
            })
        };

        Ok(ResolvedSsh {
            host: self.host.clone(),
            port: self.port.unwrap_or(DEFAULT_SSH_PORT),
            username: self.username.clone(),
            known_hosts,
            timeout: Duration::from_secs(self.timeout.unwrap_or(DEFAULT_SSH_TIMEOUT)),
        })
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .field("private_key_path", &self.private_key_path)
            .field("known_hosts_path", &self.known_hosts_path)
            .field("insecure", &self.insecure)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// SSH settings after validation, with defaults applied
#[derive(Debug, Clone)]
pub struct ResolvedSsh {
    pub host: String,
    pub port: u16,
    pub username: String,
    /// `None` when host key checking is disabled
    pub known_hosts: Option<PathBuf>,
    pub timeout: Duration,
}

fn require(name: &str, value: &str) -> ConnectionResult<()> {
    if value.trim().is_empty() {
        return Err(ConnectionError::InvalidConfig(format!("{} is required", name)));
    }
    Ok(())
}

/// `$HOME/.ssh/known_hosts`
pub fn default_known_hosts() -> ConnectionResult<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".ssh").join("known_hosts"))
        .ok_or_else(|| {
            ConnectionError::InvalidConfig(
                "cannot locate home directory for the default known_hosts file".to_string(),
            )
        })
}

/// Expand `~` and environment variables in a path
pub fn expand_path(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or_else(|_| path.into());
    PathBuf::from(expanded.as_ref())
}
