//! Proxy Bootstrap - latency-ranked startup of an external SOCKS5 proxy core
//!
//! Fetches candidate server descriptors, probes them concurrently, launches
//! the proxy core against the fastest one that actually carries traffic, and
//! tells the rest of the application, per request, whether to use it.
//!
//! # Architecture
//!
//! ```text
//!   +----------------+        +-------------------+
//!   |   provider/    |------->|    supervisor/    |----> proxy core process
//!   | fetch + probe  |        | launch + readiness|        (SOCKS5 :10808)
//!   +----------------+        +---------+---------+
//!          ^                            | ready
//!          |                            v
//!   +------+---------+        +-------------------+
//!   |    config/     |        |     routing/      |<---- NetworkMonitor
//!   | descriptor +   |        |  RoutingDecider   |<---- ProxyPreferences
//!   | sanitize       |        +---------+---------+
//!   +----------------+                  |
//!                             +---------v---------+
//!                             |    hub/ (API)     |
//!                             +-------------------+
//! ```

pub mod common;
pub mod config;
pub mod hub;
pub mod provider;
pub mod routing;
pub mod supervisor;

pub use common::error::{Error, Result};
pub use config::{Config, ServerDescriptor};
pub use routing::{Route, RoutingDecider};
pub use supervisor::{ProxySupervisor, SupervisorSnapshot};

use hub::AppState;
use routing::{InterfaceWatcher, SharedPreferences};
use std::net::SocketAddr;
use std::sync::Arc;
use supervisor::EchoCheck;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Daemon wiring: supervisor, VPN watcher, routing decider and control API
pub struct Bootstrap {
    config: Config,
    supervisor: Arc<ProxySupervisor>,
    watcher: Arc<InterfaceWatcher>,
    preferences: Arc<SharedPreferences>,
    decider: Arc<RoutingDecider>,
    echo: Arc<EchoCheck>,
    api_addr: Option<SocketAddr>,
    shutdown: CancellationToken,
}

impl Bootstrap {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing proxy bootstrap v{}", VERSION);
        config.validate()?;

        let api_addr = match &config.external_controller {
            Some(addr) => Some(
                addr.parse::<SocketAddr>()
                    .map_err(|e| Error::config(format!("external-controller {}: {}", addr, e)))?,
            ),
            None => None,
        };

        let supervisor = Arc::new(ProxySupervisor::from_config(&config)?);
        let watcher = Arc::new(InterfaceWatcher::new(config.vpn_poll_interval()));
        let preferences = Arc::new(SharedPreferences::new(
            config.enabled,
            config.proxied_hosts.clone(),
        ));
        let decider = Arc::new(RoutingDecider::new(
            watcher.clone(),
            preferences.clone(),
            supervisor.state(),
            config.socks_port,
        ));
        let echo = Arc::new(EchoCheck::new(
            config.echo_url.clone(),
            config.connectivity_timeout(),
        ));

        Ok(Bootstrap {
            config,
            supervisor,
            watcher,
            preferences,
            decider,
            echo,
            api_addr,
            shutdown: CancellationToken::new(),
        })
    }

    /// Run until Ctrl-C, then destroy the supervisor
    pub async fn run(&self) -> Result<()> {
        let mut handles = Vec::new();

        handles.push(self.watcher.clone().spawn(self.shutdown.child_token()));

        if let Some(addr) = self.api_addr {
            let state = self.app_state();
            let shutdown = self.shutdown.child_token();
            handles.push(tokio::spawn(async move {
                if let Err(e) = hub::start_server(state, addr, shutdown).await {
                    warn!("Control API error: {}", e);
                }
            }));
        }

        if self.config.auto_start {
            // Keep serving the control API so the failure stays visible in /status
            if let Err(e) = self.supervisor.start().await {
                warn!("Initial start failed: {}", e);
            }
        } else {
            info!("auto-start disabled, waiting for POST /start");
        }

        tokio::signal::ctrl_c().await?;
        info!("Received shutdown signal");

        self.supervisor.destroy().await;
        self.shutdown.cancel();
        for handle in handles {
            let _ = handle.await;
        }

        info!("Proxy bootstrap stopped");
        Ok(())
    }

    fn app_state(&self) -> AppState {
        AppState::new(
            self.config.secret.clone().unwrap_or_default(),
            self.supervisor.clone(),
            self.decider.clone(),
            self.preferences.clone(),
            self.echo.clone(),
        )
    }

    pub fn supervisor(&self) -> &Arc<ProxySupervisor> {
        &self.supervisor
    }

    /// Decider for wiring into the application's HTTP clients
    pub fn decider(&self) -> &Arc<RoutingDecider> {
        &self.decider
    }

    pub fn preferences(&self) -> &Arc<SharedPreferences> {
        &self.preferences
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert_eq!(VERSION, env!("CARGO_PKG_VERSION"));
    }

    #[tokio::test]
    async fn test_bootstrap_wiring() {
        let config = Config {
            feed_url: Some("https://feed.example.com/list".into()),
            external_controller: Some("127.0.0.1:9090".into()),
            ..Config::default()
        };
        let bootstrap = Bootstrap::new(config).unwrap();
        assert_eq!(bootstrap.decider().port(), 10808);
        assert_eq!(bootstrap.decider().decide("example.com"), Route::Direct);
        assert!(!bootstrap.supervisor().is_ready());
    }

    #[test]
    fn test_bad_controller_address() {
        let config = Config {
            feed_url: Some("https://feed.example.com/list".into()),
            external_controller: Some("not an address".into()),
            ..Config::default()
        };
        assert!(matches!(Bootstrap::new(config), Err(Error::Config(_))));
    }
}
