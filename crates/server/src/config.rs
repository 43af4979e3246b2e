use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub data: DataConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub relay: RelayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataConfig {
    /// Base directory for workspace databases and the blob store.
    pub dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// API keys accepted on the relay control channel and REST mutations.
    pub api_keys: Vec<String>,
    /// Secret for signed file URLs.
    pub signing_secret: String,
    /// Shared secret from which per-workspace credential keys are derived.
    pub credential_secret: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Sandbox session TTL; heartbeats extend it.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,
    /// How long expired rows linger before the sweep hard-deletes them.
    #[serde(default = "default_expired_grace")]
    pub expired_grace_secs: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Agent binary run by `execute` requests.
    #[serde(default = "default_agent_command")]
    pub agent_command: String,
    #[serde(default = "default_git_binary")]
    pub git_binary: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_relay_timeout")]
    pub query_timeout_secs: u64,
    #[serde(default = "default_relay_timeout")]
    pub action_timeout_secs: u64,
}

fn default_session_ttl() -> u64 { 1800 }
fn default_expired_grace() -> u64 { 300 }
fn default_sweep_interval() -> u64 { 60 }
fn default_agent_command() -> String { "claude".to_string() }
fn default_git_binary() -> String { "git".to_string() }
fn default_relay_timeout() -> u64 { 5 }

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            session_ttl_secs: default_session_ttl(),
            expired_grace_secs: default_expired_grace(),
            sweep_interval_secs: default_sweep_interval(),
            agent_command: default_agent_command(),
            git_binary: default_git_binary(),
        }
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            query_timeout_secs: default_relay_timeout(),
            action_timeout_secs: default_relay_timeout(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            data: DataConfig {
                dir: "./data".to_string(),
            },
            auth: AuthConfig {
                api_keys: vec![],
                signing_secret: "change-me-in-production".to_string(),
                credential_secret: "change-me-in-production".to_string(),
            },
            sandbox: SandboxConfig::default(),
            relay: RelayConfig::default(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        // Try to load from environment variable
        if let Ok(path) = std::env::var("LOFT_CONFIG") {
            return Self::load_from_path(&PathBuf::from(path));
        }

        // Try to load from default locations
        let default_paths = vec![
            PathBuf::from("loft-server.toml"),
            PathBuf::from("config/loft-server.toml"),
            PathBuf::from("/etc/loft/server.toml"),
        ];

        for path in default_paths {
            if path.exists() {
                return Self::load_from_path(&path);
            }
        }

        // Return default config if no file found
        tracing::warn!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_path(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
