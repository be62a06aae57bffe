//! Configuration for the psremote binary
//!
//! Handles loading and merging configuration from multiple sources:
//! - System configuration (/etc/psremote/config.toml)
//! - User configuration (~/.psremote.toml)
//! - Project configuration (./psremote.toml)
//! - Environment variables
//!
//! Files may be TOML, YAML or JSON, chosen by extension.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::connection::{self, SshConfig, WinRmConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// WinRM target
    pub winrm: Option<WinRmConfig>,

    /// SSH target
    pub ssh: Option<SshConfig>,

    /// Logging settings
    pub logging: LoggingConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when neither `-v` nor `RUST_LOG` is given
    pub level: Option<String>,

    /// Log format, text unless some file sets it
    pub format: Option<LogFormat>,
}

impl LoggingConfig {
    /// The configured format, falling back to [`LogFormat::Text`]
    pub fn output_format(&self) -> LogFormat {
        self.format.unwrap_or_default()
    }
}

impl AppConfig {
    /// Load configuration from all sources
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = AppConfig::default();

        for path in Self::get_config_paths(config_path) {
            if path.exists() {
                config = config.merge_from_file(&path)?;
            }
        }

        config.apply_env_overrides();

        Ok(config)
    }

    /// Get the list of configuration file paths to check, lowest priority first
    fn get_config_paths(explicit_path: Option<&Path>) -> Vec<PathBuf> {
        if let Some(path) = explicit_path {
            return vec![path.to_path_buf()];
        }

        if let Ok(env_config) = std::env::var("PSREMOTE_CONFIG") {
            return vec![PathBuf::from(env_config)];
        }

        let mut paths = vec![PathBuf::from("/etc/psremote/config.toml")];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".psremote.toml"));
        }
        paths.push(PathBuf::from("psremote.toml"));
        paths
    }

    /// Merge configuration from a file
    fn merge_from_file(&self, path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

        let file_config: AppConfig = match extension {
            "yml" | "yaml" => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            "json" => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
        };

        Ok(self.merge(file_config))
    }

    /// Merge another config into this one.
    ///
    /// A file that names any transport replaces both transport sections, so
    /// a user file never combines with a system file into a WinRM+SSH config.
    fn merge(&self, other: AppConfig) -> AppConfig {
        let (winrm, ssh) = if other.winrm.is_some() || other.ssh.is_some() {
            (other.winrm, other.ssh)
        } else {
            (self.winrm.clone(), self.ssh.clone())
        };

        AppConfig {
            winrm,
            ssh,
            logging: LoggingConfig {
                level: other.logging.level.or_else(|| self.logging.level.clone()),
                format: other.logging.format.or(self.logging.format),
            },
        }
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        // PSREMOTE_WINRM_PASSWORD
        if let (Ok(password), Some(winrm)) =
            (std::env::var("PSREMOTE_WINRM_PASSWORD"), self.winrm.as_mut())
        {
            winrm.password = password;
        }

        // PSREMOTE_SSH_PASSWORD
        if let (Ok(password), Some(ssh)) =
            (std::env::var("PSREMOTE_SSH_PASSWORD"), self.ssh.as_mut())
        {
            ssh.password = Some(password);
        }

        // PSREMOTE_LOG_LEVEL
        if let Ok(level) = std::env::var("PSREMOTE_LOG_LEVEL") {
            self.logging.level = Some(level);
        }
    }

    /// Transport configuration for [`connection::Transport::connect`]
    pub fn connection(&self) -> connection::Config {
        connection::Config {
            winrm: self.winrm.clone(),
            ssh: self.ssh.clone(),
        }
    }

    /// Load from a specific file, without environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        AppConfig::default().merge_from_file(path.as_ref())
    }
}
