//! Server configuration: TOML file + CLI overrides.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;
use webterm_core::{RelayError, RelayResult};

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub ssh: SshSection,
    #[serde(default)]
    pub log: LogSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_sessions: default_max_sessions(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// `[ssh]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct SshSection {
    /// Dial and authentication timeout.
    #[serde(default = "default_ssh_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u64,
    /// Largest output chunk forwarded to the browser in one message.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for SshSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_ssh_timeout(),
            keepalive_secs: default_keepalive(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// `[log]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct LogSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_max_sessions() -> usize {
    100
}
fn default_queue_capacity() -> usize {
    crate::channel::DEFAULT_QUEUE_CAPACITY
}
fn default_ssh_timeout() -> u64 {
    15
}
fn default_keepalive() -> u64 {
    30
}
fn default_buffer_size() -> usize {
    8192
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Values given on the command line; `None` keeps the file value.
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub max_sessions: Option<usize>,
    pub ssh_timeout: Option<u64>,
    pub log_level: Option<String>,
}

/// Resolved server configuration (file values with CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub max_sessions: usize,
    pub queue_capacity: usize,
    pub ssh: SshSection,
    pub log_level: String,
}

impl ServerConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error: every setting has a default.
    pub fn load(config_path: Option<&Path>, overrides: ConfigOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    Self::parse(&content)?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };
        Ok(Self::resolve(file_config, overrides))
    }

    fn parse(content: &str) -> RelayResult<ConfigFile> {
        toml::from_str::<ConfigFile>(content)
            .map_err(|e| RelayError::Config(format!("config parse error: {e}")))
    }

    fn resolve(file_config: ConfigFile, overrides: ConfigOverrides) -> Self {
        let mut ssh = file_config.ssh;
        if let Some(timeout) = overrides.ssh_timeout {
            ssh.timeout_secs = timeout;
        }
        Self {
            host: overrides.host.unwrap_or(file_config.server.host),
            port: overrides.port.unwrap_or(file_config.server.port),
            max_sessions: overrides
                .max_sessions
                .unwrap_or(file_config.server.max_sessions),
            queue_capacity: file_config.server.queue_capacity,
            ssh,
            log_level: overrides.log_level.unwrap_or(file_config.log.level),
        }
    }

    /// `host:port` to listen on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    path.to_path_buf()
}
