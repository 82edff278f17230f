// Configuration for the ptt CLI
//
// Stored as JSON under the platform config dir:
// - Linux: ~/.config/ptt/config.json
// - macOS: ~/Library/Application Support/ptt/config.json
// - Windows: %APPDATA%\ptt\config.json

use anyhow::{Context, Result};
use ptt_core::PttConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name given to a fresh identity
    pub name: String,

    /// libp2p listen port, 0 for any
    pub listen_port: u16,

    /// Local RPC port
    pub rpc_port: u16,

    /// Multiaddrs ending in /p2p/<peer id>, dialed on start
    pub bootstrap_nodes: Vec<String>,

    /// Store location, defaults to the platform data dir
    pub data_dir: Option<String>,

    /// Emit logs as JSON lines
    pub log_json: bool,

    /// Also write daily-rolled logs here
    pub log_dir: Option<String>,

    pub network: NetworkConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub network_id: u32,
    pub max_peers: usize,
    pub max_pending_peers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: "ptt".to_string(),
            listen_port: 0,
            rpc_port: 9774,
            bootstrap_nodes: vec![],
            data_dir: None,
            log_json: false,
            log_dir: None,
            network: NetworkConfig::default(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        let defaults = PttConfig::default();
        Self {
            network_id: defaults.network_id,
            max_peers: defaults.max_peers,
            max_pending_peers: defaults.max_pending_peers,
        }
    }
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to determine config directory")?
            .join("ptt");
        std::fs::create_dir_all(&config_dir).context("Failed to create config directory")?;
        Ok(config_dir)
    }

    pub fn config_file() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.json"))
    }

    /// Store directory, created on demand.
    pub fn data_dir(&self) -> Result<PathBuf> {
        let data_dir = match &self.data_dir {
            Some(dir) => PathBuf::from(dir),
            None => dirs::data_local_dir()
                .context("Failed to determine data directory")?
                .join("ptt"),
        };
        std::fs::create_dir_all(&data_dir).context("Failed to create data directory")?;
        Ok(data_dir)
    }

    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_file()?)
    }

    /// Reads `path`, writing the defaults there first if it is missing.
    /// Keys absent from the file keep their default values.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).context("Failed to read config file")?;
            serde_json::from_str(&contents).context("Failed to parse config file")
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_file()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let contents = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents).context("Failed to write config file")
    }

    pub fn ptt_config(&self) -> PttConfig {
        PttConfig {
            network_id: self.network.network_id,
            max_peers: self.network.max_peers,
            max_pending_peers: self.network.max_pending_peers,
            ..PttConfig::default()
        }
    }

    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "name" => self.name = value.to_string(),
            "listen_port" => self.listen_port = value.parse().context("Invalid port number")?,
            "rpc_port" => self.rpc_port = value.parse().context("Invalid port number")?,
            "data_dir" => self.data_dir = non_empty(value),
            "log_json" => self.log_json = value.parse().context("Invalid boolean value")?,
            "log_dir" => self.log_dir = non_empty(value),
            "network_id" => self.network.network_id = value.parse().context("Invalid number")?,
            "max_peers" => self.network.max_peers = value.parse().context("Invalid number")?,
            "max_pending_peers" => {
                self.network.max_pending_peers = value.parse().context("Invalid number")?
            }
            "bootstrap_nodes" => {
                self.bootstrap_nodes = value
                    .split(',')
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            }
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.list().into_iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            ("name".to_string(), self.name.clone()),
            ("listen_port".to_string(), self.listen_port.to_string()),
            ("rpc_port".to_string(), self.rpc_port.to_string()),
            ("data_dir".to_string(), self.data_dir.clone().unwrap_or_else(|| "(auto)".to_string())),
            ("log_json".to_string(), self.log_json.to_string()),
            ("log_dir".to_string(), self.log_dir.clone().unwrap_or_else(|| "(none)".to_string())),
            ("network_id".to_string(), self.network.network_id.to_string()),
            ("max_peers".to_string(), self.network.max_peers.to_string()),
            ("max_pending_peers".to_string(), self.network.max_pending_peers.to_string()),
            ("bootstrap_nodes".to_string(), self.bootstrap_nodes.join(",")),
        ]
    }
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}
