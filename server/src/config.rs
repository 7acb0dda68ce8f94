use accounting::parse_utc_offset;
use anyhow::{Context, Result, bail};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Environment prefix for configuration overrides, e.g. `TRAFFIC_LISTEN_ADDR`.
const ENV_PREFIX: &str = "TRAFFIC";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// JSON file holding the persisted accounting state
    #[serde(default = "default_data_file")]
    pub data_file: String,

    /// Shared secret required to delete a server
    #[serde(default)]
    pub delete_password: String,

    /// Shared secret required to change server settings
    #[serde(default)]
    pub agent_password: String,

    /// Fixed UTC offset in which reset anchors are interpreted, e.g. "+08:00"
    #[serde(default = "default_billing_utc_offset")]
    pub billing_utc_offset: String,

    #[serde(default = "default_reset_check_interval_secs")]
    pub reset_check_interval_secs: u64,

    /// A server with no report for this long is shown as offline
    #[serde(default = "default_offline_after_secs")]
    pub offline_after_secs: u64,

    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging; logs go to stdout when unset
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,
}

fn default_listen_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_data_file() -> String {
    "server_data.json".to_string()
}

fn default_billing_utc_offset() -> String {
    "+00:00".to_string()
}

fn default_reset_check_interval_secs() -> u64 {
    60
}

fn default_offline_after_secs() -> u64 {
    15
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "traffic-server.log".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            data_file: default_data_file(),
            delete_password: String::new(),
            agent_password: String::new(),
            billing_utc_offset: default_billing_utc_offset(),
            reset_check_interval_secs: default_reset_check_interval_secs(),
            offline_after_secs: default_offline_after_secs(),
            log_level: default_log_level(),
            log_dir: None,
            log_file: default_log_file(),
        }
    }
}

impl ServerConfig {
    /// Layer defaults, the optional TOML file and `TRAFFIC_*` environment
    /// variables. The bare `DELETE_PASSWORD` and `AGENT_INSTALL_PASSWORD`
    /// variables are honoured when the prefixed ones are not set.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::load_with_env(path, None)?;
        if config.delete_password.is_empty()
            && let Ok(password) = std::env::var("DELETE_PASSWORD")
        {
            config.delete_password = password;
        }
        if config.agent_password.is_empty()
            && let Ok(password) = std::env::var("AGENT_INSTALL_PASSWORD")
        {
            config.agent_password = password;
        }
        Ok(config)
    }

    fn load_with_env(
        path: Option<&Path>,
        env: Option<config::Map<String, String>>,
    ) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .source(env),
        );

        let config = builder
            .build()
            .context("Failed to read configuration")?
            .try_deserialize::<ServerConfig>()
            .context("Failed to parse configuration")?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.delete_password.is_empty() || self.agent_password.is_empty() {
            bail!(
                "delete_password and agent_password must both be set \
                 (config file, TRAFFIC_* or DELETE_PASSWORD / AGENT_INSTALL_PASSWORD)"
            );
        }
        if self.reset_check_interval_secs == 0 {
            bail!("reset_check_interval_secs must be greater than zero");
        }
        self.billing_offset()?;
        Ok(())
    }

    pub fn billing_offset(&self) -> Result<FixedOffset> {
        parse_utc_offset(&self.billing_utc_offset)
            .with_context(|| format!("Invalid billing_utc_offset: {}", self.billing_utc_offset))
    }
}
