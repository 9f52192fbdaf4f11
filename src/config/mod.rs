use serde::{Deserialize, Serialize};
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::scheduler::MAX_DUE_WINDOW;
use crate::utils::paths::{default_data_root, expand_home};

const MAX_CONFIG_BYTES: u64 = 1_048_576;

/// Server configuration
///
/// Resolution order: built-in defaults, then the optional YAML file named by
/// `CADENCE_CONFIG`, then individual `CADENCE_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub api_host: String,
    pub api_port: u16,
    pub data_root: PathBuf,
    /// Seconds between scheduler ticks
    pub check_interval: u64,
    /// Seconds a fire time stays eligible after it passes
    pub due_window: u64,
    /// Executions started per tick
    pub max_concurrent: usize,
    /// Seconds between approval expiry sweeps
    pub sweep_interval: u64,
    /// Agent CLI binary
    pub agent_bin: String,
    pub event_capacity: usize,
    /// Seconds between SIGTERM and SIGKILL when stopping an agent
    pub stop_grace: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            api_host: "127.0.0.1".to_string(),
            api_port: 8001,
            data_root: default_data_root().unwrap_or_else(|_| PathBuf::from(".cadence")),
            check_interval: 60,
            due_window: 60,
            max_concurrent: 1,
            sweep_interval: 30,
            agent_bin: "claude".to_string(),
            event_capacity: 1024,
            stop_grace: 5,
        }
    }
}

impl ServerConfig {
    /// Load from defaults, config file and process environment
    pub fn load() -> Result<Self, String> {
        let mut config = match std::env::var("CADENCE_CONFIG") {
            Ok(path) if !path.trim().is_empty() => Self::from_file(&expand_home(&path))?,
            _ => {
                let defaults = Self::default();
                let candidate = defaults.data_root.join("config.yaml");
                if candidate.is_file() {
                    Self::from_file(&candidate)?
                } else {
                    defaults
                }
            }
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML config file with a 1MB size cap
    pub fn from_file(path: &Path) -> Result<Self, String> {
        let metadata = fs::metadata(path)
            .map_err(|e| format!("Failed to read config {}: {}", path.display(), e))?;

        if metadata.len() > MAX_CONFIG_BYTES {
            return Err(format!(
                "Config file too large: {} bytes (max 1MB)",
                metadata.len()
            ));
        }

        let contents = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        serde_yaml::from_str(&contents).map_err(|e| format!("Failed to parse YAML: {}", e))
    }

    /// Override fields from `CADENCE_*` variables provided by `lookup`
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), String>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(key: &str, value: String) -> Result<T, String> {
            value
                .trim()
                .parse()
                .map_err(|_| format!("Invalid value for {}: '{}'", key, value))
        }

        if let Some(v) = lookup("CADENCE_API_HOST") {
            self.api_host = v;
        }
        if let Some(v) = lookup("CADENCE_API_PORT") {
            self.api_port = parsed("CADENCE_API_PORT", v)?;
        }
        if let Some(v) = lookup("CADENCE_DATA_ROOT") {
            if !v.trim().is_empty() {
                self.data_root = expand_home(&v);
            }
        }
        if let Some(v) = lookup("CADENCE_CHECK_INTERVAL") {
            self.check_interval = parsed("CADENCE_CHECK_INTERVAL", v)?;
        }
        if let Some(v) = lookup("CADENCE_DUE_WINDOW") {
            self.due_window = parsed("CADENCE_DUE_WINDOW", v)?;
        }
        if let Some(v) = lookup("CADENCE_MAX_CONCURRENT") {
            self.max_concurrent = parsed("CADENCE_MAX_CONCURRENT", v)?;
        }
        if let Some(v) = lookup("CADENCE_SWEEP_INTERVAL") {
            self.sweep_interval = parsed("CADENCE_SWEEP_INTERVAL", v)?;
        }
        if let Some(v) = lookup("CADENCE_AGENT_BIN") {
            self.agent_bin = v;
        }
        if let Some(v) = lookup("CADENCE_EVENT_CAPACITY") {
            self.event_capacity = parsed("CADENCE_EVENT_CAPACITY", v)?;
        }
        if let Some(v) = lookup("CADENCE_STOP_GRACE") {
            self.stop_grace = parsed("CADENCE_STOP_GRACE", v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.check_interval == 0 {
            return Err("check_interval must be at least 1 second".to_string());
        }
        if self.due_window == 0 || self.due_window > MAX_DUE_WINDOW {
            return Err(format!(
                "due_window must be between 1 and {} seconds",
                MAX_DUE_WINDOW
            ));
        }
        if self.max_concurrent == 0 {
            return Err("max_concurrent must be at least 1".to_string());
        }
        if self.sweep_interval == 0 {
            return Err("sweep_interval must be at least 1 second".to_string());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be at least 1".to_string());
        }
        if self.agent_bin.trim().is_empty() {
            return Err("agent_bin must not be empty".to_string());
        }
        if self.api_host != "localhost" && self.api_host.parse::<IpAddr>().is_err() {
            return Err(format!("Invalid api_host '{}'", self.api_host));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api_host, self.api_port)
    }
}
