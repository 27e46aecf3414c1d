use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Hub serving broadcast, private and group messaging
    pub hub_url: String,

    /// Hub serving streamed AI generation
    pub ai_hub_url: String,

    /// Fixed delay between connection attempts, in milliseconds
    pub retry_delay_ms: u64,

    /// Delays the hub transport waits between reconnect attempts after an
    /// established link drops
    pub reconnect_delays_ms: Vec<u64>,

    /// Models offered for AI generation
    pub models: Vec<String>,

    /// Model used when none is picked; empty means the server default
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_model: Option<String>,

    /// Author label of the greeting in the broadcast channel
    pub app_name: String,

    /// Greeting that opens the broadcast channel
    pub welcome_message: String,

    /// Log filter used when RUST_LOG is not set
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            hub_url: "https://localhost:44368/hub".to_string(),
            ai_hub_url: "https://localhost:7202/hub".to_string(),
            retry_delay_ms: 5000,
            reconnect_delays_ms: vec![0, 2000, 10000, 30000],
            models: vec![
                "gemma:2b".to_string(),
                "orca-mini:3b".to_string(),
                "llama2".to_string(),
            ],
            default_model: None,
            app_name: "CChat".to_string(),
            welcome_message: "Welcome to CChat!".to_string(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Default location: ~/.cchat/config.toml
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not find home directory")?;
        Ok(home.join(".cchat").join("config.toml"))
    }

    /// Load configuration from `path`, or the default location when `None`.
    /// A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !config_path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file {}", config_path.display()))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse config file")
    }

    /// Save configuration to `path`
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).context("Failed to create config directory")?;
        }
        let content = self.to_toml()?;
        fs::write(path, content).context("Failed to write config file")?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn reconnect_delays(&self) -> Vec<Duration> {
        self.reconnect_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    /// Apply command-line overrides
    pub fn with_overrides(
        mut self,
        hub_url: Option<String>,
        ai_hub_url: Option<String>,
        log_level: Option<String>,
    ) -> Self {
        if let Some(url) = hub_url {
            self.hub_url = url;
        }
        if let Some(url) = ai_hub_url {
            self.ai_hub_url = url;
        }
        if let Some(level) = log_level {
            self.log_level = level;
        }
        self
    }
}
