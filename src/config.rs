use crate::types::EvacuateMode;
use anyhow::{anyhow, bail, Result};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub server_name: Option<String>,

    pub bind_addr: String,
    pub bind_port: u16,

    pub data_dir: PathBuf,

    pub architecture: Option<String>,

    pub heartbeat_interval_secs: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            server_name: None,
            bind_addr: "0.0.0.0".to_string(),
            bind_port: 8443,
            data_dir: PathBuf::from("/var/lib/paddock"),
            architecture: None,
            heartbeat_interval_secs: 10,
        }
    }
}

impl NodeConfig {
    pub fn load(path: &PathBuf) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn effective_server_name(&self) -> String {
        self.server_name.clone().unwrap_or_else(|| {
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string())
        })
    }

    pub fn effective_architecture(&self) -> String {
        self.architecture
            .clone()
            .unwrap_or_else(|| std::env::consts::ARCH.to_string())
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_addr, self.bind_port)
    }
}

pub const DEFAULT_OFFLINE_THRESHOLD: u64 = 20;
pub const MIN_OFFLINE_THRESHOLD: u64 = 10;
pub const DEFAULT_MAX_VOTERS: usize = 3;
pub const DEFAULT_MAX_STANDBYS: usize = 2;
pub const DEFAULT_JOIN_TOKEN_EXPIRY: &str = "3H";

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    values: HashMap<String, String>,
}

impl ClusterConfig {
    pub fn new(values: HashMap<String, String>) -> Self {
        Self { values }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn values(&self) -> &HashMap<String, String> {
        &self.values
    }

    pub fn patch(&mut self, updates: HashMap<String, String>) {
        for (key, value) in updates {
            if value.is_empty() {
                self.values.remove(&key);
            } else {
                self.values.insert(key, value);
            }
        }
    }

    pub fn offline_threshold(&self) -> u64 {
        self.get("cluster.offline_threshold")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_OFFLINE_THRESHOLD)
    }

    pub fn max_voters(&self) -> usize {
        self.get("cluster.max_voters")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_VOTERS)
    }

    pub fn max_standbys(&self) -> usize {
        self.get("cluster.max_standbys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_MAX_STANDBYS)
    }

    pub fn https_address(&self) -> Option<&str> {
        self.get("cluster.https_address").filter(|v| !v.is_empty())
    }

    pub fn join_token_expiry(&self) -> Duration {
        self.get("cluster.join_token_expiry")
            .and_then(|v| parse_expiry(v).ok())
            .unwrap_or_else(|| parse_expiry(DEFAULT_JOIN_TOKEN_EXPIRY).unwrap())
    }

    pub fn evacuate_mode(&self) -> EvacuateMode {
        self.get("cluster.evacuate")
            .and_then(|v| v.parse().ok())
            .unwrap_or_default()
    }

    pub fn validate(updates: &HashMap<String, String>) -> Result<()> {
        for (key, value) in updates {
            if key.starts_with("user.") {
                continue;
            }

            if value.is_empty() {
                continue;
            }

            match key.as_str() {
                "cluster.offline_threshold" => {
                    let secs: u64 = value
                        .parse()
                        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))?;
                    if secs < MIN_OFFLINE_THRESHOLD {
                        bail!(
                            "Value for cluster.offline_threshold must be at least {} seconds",
                            MIN_OFFLINE_THRESHOLD
                        );
                    }
                }
                "cluster.max_voters" => {
                    let n: usize = value
                        .parse()
                        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))?;
                    if n < 1 || n % 2 == 0 {
                        bail!("Value for cluster.max_voters must be an odd number >= 1");
                    }
                }
                "cluster.max_standbys" => {
                    value
                        .parse::<usize>()
                        .map_err(|_| anyhow!("Invalid value for {}: {}", key, value))?;
                }
                "cluster.join_token_expiry" => {
                    parse_expiry(value)?;
                }
                "cluster.https_address" => {}
                "cluster.evacuate" => {
                    value.parse::<EvacuateMode>()?;
                }
                other => bail!("Unknown cluster configuration key: {}", other),
            }
        }

        Ok(())
    }
}

pub fn parse_expiry(value: &str) -> Result<Duration> {
    let value = value.trim();
    if value.is_empty() {
        bail!("Empty expiry value");
    }

    let (amount, unit) = value.split_at(value.len() - 1);
    let scale = match unit {
        "S" | "s" => 1,
        "M" | "m" => 60,
        "H" | "h" => 3600,
        "D" | "d" => 86400,
        _ => {
            let secs: i64 = value
                .parse()
                .map_err(|_| anyhow!("Invalid expiry value: {}", value))?;
            return Ok(Duration::seconds(secs));
        }
    };

    let amount: i64 = amount
        .parse()
        .map_err(|_| anyhow!("Invalid expiry value: {}", value))?;
    Ok(Duration::seconds(amount * scale))
}
