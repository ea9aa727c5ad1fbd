//! Policy configuration: a YAML document deserialised into a statically
//! validated struct. Loaded once at startup and immutable for the process's
//! lifetime; a missing or invalid file is fatal there and nowhere else.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use {
    serde::{Deserialize, Serialize},
    thiserror::Error,
};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("invalid config: {0}")]
    Invalid(&'static str),
}

/// Top-level policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Domains blocked unconditionally.
    #[serde(default)]
    pub static_blocklist: Vec<String>,

    /// Visit-frequency rule applied on top of the static list.
    #[serde(default)]
    pub dynamic_rule: DynamicRule,

    /// Spacing between evaluation ticks.
    #[serde(default = "default_interval")]
    pub evaluation_interval_seconds: u64,

    /// System host-resolution table to enforce into.
    #[serde(default = "default_hosts_path")]
    pub hosts_path: PathBuf,

    /// SQLite database holding the visit history.
    #[serde(default = "default_activity_db")]
    pub activity_db: PathBuf,

    /// Loopback port the observing proxy listens on.
    #[serde(default = "default_proxy_port")]
    pub proxy_port: u16,

    /// The monitored browser to launch.
    #[serde(default)]
    pub browser: BrowserConfig,
}

/// Blocks any domain visited more than `visit_count` times within the
/// trailing `time_period_minutes` window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DynamicRule {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_time_period")]
    pub time_period_minutes: u64,

    #[serde(default = "default_visit_count")]
    pub visit_count: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Browser executable to spawn.
    #[serde(default = "default_browser_command")]
    pub command: String,

    /// Extra arguments passed before the proxy wiring.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_interval() -> u64 {
    60
}

fn default_time_period() -> u64 {
    60
}

fn default_visit_count() -> u64 {
    100
}

fn default_hosts_path() -> PathBuf {
    PathBuf::from("/etc/hosts")
}

fn default_activity_db() -> PathBuf {
    PathBuf::from("activity.db")
}

fn default_proxy_port() -> u16 {
    18790
}

fn default_browser_command() -> String {
    "chromium".to_string()
}

impl Default for DynamicRule {
    fn default() -> Self {
        Self {
            enabled: false,
            time_period_minutes: default_time_period(),
            visit_count: default_visit_count(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            command: default_browser_command(),
            args: Vec::new(),
        }
    }
}

impl PolicyConfig {
    /// Load and validate the config at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_yaml::from_str(&data)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate once at load time instead of defensively on every read.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.evaluation_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "evaluation_interval_seconds must be greater than zero",
            ));
        }
        if self.dynamic_rule.time_period_minutes == 0 {
            return Err(ConfigError::Invalid(
                "dynamic_rule.time_period_minutes must be greater than zero",
            ));
        }
        if self.dynamic_rule.visit_count == 0 {
            return Err(ConfigError::Invalid(
                "dynamic_rule.visit_count must be greater than zero",
            ));
        }
        Ok(())
    }

    pub fn evaluation_interval(&self) -> Duration {
        Duration::from_secs(self.evaluation_interval_seconds)
    }

    /// Trailing window the dynamic rule aggregates over.
    pub fn time_window(&self) -> Duration {
        Duration::from_secs(self.dynamic_rule.time_period_minutes * 60)
    }

    /// The static blocklist as a set, with blank entries dropped.
    pub fn static_set(&self) -> BTreeSet<String> {
        self.static_blocklist
            .iter()
            .map(|d| d.trim())
            .filter(|d| !d.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            static_blocklist: Vec::new(),
            dynamic_rule: DynamicRule::default(),
            evaluation_interval_seconds: default_interval(),
            hosts_path: default_hosts_path(),
            activity_db: default_activity_db(),
            proxy_port: default_proxy_port(),
            browser: BrowserConfig::default(),
        }
    }
}
