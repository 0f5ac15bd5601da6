//! Proxy configuration: TOML file + CLI overrides.

use mcp_proxy_core::codec::DEFAULT_MAX_MESSAGE_BYTES;
use mcp_proxy_core::{RelayError, RelayResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub transport: TransportSection,
}

/// `[server]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Command shown to the web client as the default stdio server.
    #[serde(default)]
    pub default_command: String,
    /// Arguments shown to the web client as the default stdio arguments.
    #[serde(default)]
    pub default_args: String,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            default_command: String::new(),
            default_args: String::new(),
        }
    }
}

/// `[transport]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TransportSection {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            startup_timeout_secs: default_startup_timeout(),
            max_message_bytes: default_max_message_bytes(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_startup_timeout() -> u64 {
    30
}
fn default_max_message_bytes() -> usize {
    DEFAULT_MAX_MESSAGE_BYTES
}

/// Command-line values that take precedence over the config file.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub default_command: Option<String>,
    pub default_args: Option<String>,
}

/// Resolved proxy configuration (file loaded, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub default_command: String,
    pub default_args: String,
    pub connect_timeout: Duration,
    pub startup_timeout: Duration,
    pub max_message_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self::resolve(ConfigFile::default(), CliOverrides::default())
    }
}

impl ProxyConfig {
    /// Load config from TOML file, then apply CLI overrides.
    ///
    /// A missing file is not an error; defaults are used instead.
    pub fn load(config_path: Option<&Path>, cli: CliOverrides) -> RelayResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded)?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| RelayError::Other(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Ok(Self::resolve(file_config, cli))
    }

    fn resolve(file: ConfigFile, cli: CliOverrides) -> Self {
        Self {
            host: cli.host.unwrap_or(file.server.host),
            port: cli.port.unwrap_or(file.server.port),
            default_command: cli.default_command.unwrap_or(file.server.default_command),
            default_args: cli.default_args.unwrap_or(file.server.default_args),
            connect_timeout: Duration::from_secs(file.transport.connect_timeout_secs),
            startup_timeout: Duration::from_secs(file.transport.startup_timeout_secs),
            max_message_bytes: file.transport.max_message_bytes,
        }
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
