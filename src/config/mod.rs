//! Configuration module

pub mod descriptor;
pub mod sanitize;

pub use descriptor::ServerDescriptor;
pub use sanitize::{sanitize, SanitizedConfig};

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;

/// Default local SOCKS5 port of the proxy core
pub const DEFAULT_SOCKS_PORT: u16 = 10808;

/// Default proxy core executable name
#[cfg(windows)]
pub const DEFAULT_EXECUTABLE: &str = "xray.exe";

#[cfg(not(windows))]
pub const DEFAULT_EXECUTABLE: &str = "xray";

/// Name of the per-run config file inside the work directory
pub const RUN_CONFIG_FILE: &str = "proxy-config.json";

/// Default echo endpoint used by the connectivity test
pub const DEFAULT_ECHO_URL: &str = "https://api.ipify.org";

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// Remote candidate feed (one base64 descriptor per line)
    pub feed_url: Option<String>,

    /// Local feed file in the same format, used instead of `feed-url`
    pub feed_file: Option<PathBuf>,

    /// Proxy core executable
    pub executable: PathBuf,

    /// Directory holding the per-run config file
    pub work_dir: PathBuf,

    /// Local SOCKS5 port the core listens on
    pub socks_port: u16,

    pub probe_timeout_ms: u64,
    pub fetch_timeout_ms: u64,
    pub port_poll_interval_ms: u64,
    pub port_ready_timeout_ms: u64,
    pub connectivity_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL
    pub kill_grace_ms: u64,

    /// Echo endpoint for the end-to-end test
    pub echo_url: String,

    /// User toggle for routing through the local proxy
    pub enabled: bool,

    /// Hosts that should go through the proxy (empty means all)
    pub proxied_hosts: Vec<String>,

    /// How often the VPN interface watcher rescans
    pub vpn_poll_interval_ms: u64,

    /// Control API address
    pub external_controller: Option<String>,

    /// Control API secret
    pub secret: Option<String>,

    /// Log level
    pub log_level: String,

    /// Start the supervisor as soon as the daemon comes up
    pub auto_start: bool,
}

impl Config {
    /// Load configuration from file (synchronous)
    pub fn load(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from file (async)
    pub async fn load_async<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path).await?;
        let config: Config = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.feed_url.is_none() && self.feed_file.is_none() {
            return Err(Error::config("one of feed-url or feed-file is required"));
        }

        if let Some(ref feed) = self.feed_url {
            url::Url::parse(feed).map_err(|e| Error::config(format!("invalid feed-url: {}", e)))?;
        }

        url::Url::parse(&self.echo_url)
            .map_err(|e| Error::config(format!("invalid echo-url: {}", e)))?;

        if self.socks_port == 0 {
            return Err(Error::config("socks-port must be non-zero"));
        }

        let timeouts = [
            ("probe-timeout-ms", self.probe_timeout_ms),
            ("fetch-timeout-ms", self.fetch_timeout_ms),
            ("port-poll-interval-ms", self.port_poll_interval_ms),
            ("port-ready-timeout-ms", self.port_ready_timeout_ms),
            ("connectivity-timeout-ms", self.connectivity_timeout_ms),
            ("vpn-poll-interval-ms", self.vpn_poll_interval_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::config(format!("{} must be non-zero", name)));
            }
        }

        Ok(())
    }

    /// Save configuration to file
    pub async fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        fs::write(path, content).await?;
        Ok(())
    }

    /// Path of the per-run proxy core config
    pub fn run_config_path(&self) -> PathBuf {
        self.work_dir.join(RUN_CONFIG_FILE)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn port_poll_interval(&self) -> Duration {
        Duration::from_millis(self.port_poll_interval_ms)
    }

    pub fn port_ready_timeout(&self) -> Duration {
        Duration::from_millis(self.port_ready_timeout_ms)
    }

    pub fn connectivity_timeout(&self) -> Duration {
        Duration::from_millis(self.connectivity_timeout_ms)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn vpn_poll_interval(&self) -> Duration {
        Duration::from_millis(self.vpn_poll_interval_ms)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            feed_url: None,
            feed_file: None,
            executable: PathBuf::from(DEFAULT_EXECUTABLE),
            work_dir: PathBuf::from("."),
            socks_port: DEFAULT_SOCKS_PORT,
            probe_timeout_ms: 2000,
            fetch_timeout_ms: 15_000,
            port_poll_interval_ms: 200,
            port_ready_timeout_ms: 10_000,
            connectivity_timeout_ms: 10_000,
            kill_grace_ms: 500,
            echo_url: DEFAULT_ECHO_URL.to_string(),
            enabled: true,
            proxied_hosts: Vec::new(),
            vpn_poll_interval_ms: 3000,
            external_controller: None,
            secret: None,
            log_level: "info".to_string(),
            auto_start: true,
        }
    }
}
