use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

use crate::wallet::WalletSnapshot;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid listen address {0}")]
    InvalidListenAddr(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

#[derive(Debug, Clone, Deserialize)]
pub struct StepConfig {
    /// Seconds between STEP broadcasts.
    #[serde(default = "default_step_interval")]
    pub interval: f64,
}

impl Default for StepConfig {
    fn default() -> Self {
        Self { interval: default_step_interval() }
    }
}

fn default_step_interval() -> f64 {
    5.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
    /// Seconds to collect SYNC_RESPONSE messages before picking a chain.
    #[serde(default = "default_sync_timeout")]
    pub timeout: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { timeout: default_sync_timeout() }
    }
}

fn default_sync_timeout() -> f64 {
    2.0
}

#[derive(Debug, Clone, Deserialize)]
pub struct VoteConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Seconds before an unratified pending block is discarded.
    #[serde(default = "default_vote_timeout")]
    pub timeout: f64,
    /// Fraction of online validators whose votes ratify a block.
    #[serde(default = "default_vote_threshold")]
    pub threshold: f64,
}

impl Default for VoteConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            timeout: default_vote_timeout(),
            threshold: default_vote_threshold(),
        }
    }
}

fn default_vote_timeout() -> f64 {
    5.0
}

fn default_vote_threshold() -> f64 {
    0.66
}

#[derive(Debug, Clone, Deserialize)]
pub struct DetectorConfig {
    /// Sliding detection horizon in seconds.
    #[serde(default = "default_detection_window")]
    pub detection_window: f64,
    /// Similarity score in [0,1] above which a pattern is emitted.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            detection_window: default_detection_window(),
            similarity_threshold: default_similarity_threshold(),
        }
    }
}

fn default_detection_window() -> f64 {
    60.0
}

fn default_similarity_threshold() -> f64 {
    0.8
}

/// Whole testbed configuration, shared by nodes and the relay.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub step: StepConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub vote: VoteConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    /// Genesis account map: identifier -> { balance, stake }.
    #[serde(default)]
    pub initial_state: WalletSnapshot,
}

impl Config {
    /// Load and validate a YAML config file. Missing file, bad YAML, and an
    /// unresolvable listen address are all fatal.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&raw)?;
        if config.server.addr().parse::<SocketAddr>().is_err() {
            // Allow hostnames too; only reject clearly malformed host:port
            if config.server.host.is_empty() || config.server.host.contains([' ', '/']) {
                return Err(ConfigError::InvalidListenAddr(config.server.addr()));
            }
        }
        Ok(config)
    }
}
