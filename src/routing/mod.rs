//! Per-request routing
//!
//! Every outbound request asks the decider whether to go through the local
//! SOCKS port or directly. Decision order:
//!
//! 1. VPN active: direct (the tunnel already owns routing)
//! 2. proxy disabled by the user: direct
//! 3. proxy not ready: direct
//! 4. host not in the proxied list (when the list is non-empty): direct
//! 5. otherwise: local proxy
//!
//! `decide` only reads cached flags. It never blocks and never does I/O.

mod network;
mod preferences;

pub use network::{InterfaceWatcher, NetworkMonitor, StaticNetwork, SYS_CLASS_NET};
pub use preferences::{ProxyPreferences, SharedPreferences};

use crate::supervisor::SupervisorState;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{trace, warn};

/// Where a request should go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "route", rename_all = "kebab-case")]
pub enum Route {
    #[serde(rename = "proxy")]
    UseLocalProxy { port: u16 },
    Direct,
}

impl Route {
    pub fn is_proxied(&self) -> bool {
        matches!(self, Route::UseLocalProxy { .. })
    }

    /// Proxy URL for HTTP clients, `None` for direct
    pub fn proxy_url(&self) -> Option<String> {
        match self {
            Route::UseLocalProxy { port } => Some(format!("socks5h://127.0.0.1:{}", port)),
            Route::Direct => None,
        }
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Route::UseLocalProxy { port } => write!(f, "proxy(127.0.0.1:{})", port),
            Route::Direct => write!(f, "direct"),
        }
    }
}

/// Readiness of the local proxy
pub trait ReadinessProbe: Send + Sync {
    fn proxy_ready(&self) -> bool;
}

impl ReadinessProbe for SupervisorState {
    fn proxy_ready(&self) -> bool {
        self.is_ready()
    }
}

impl ReadinessProbe for AtomicBool {
    fn proxy_ready(&self) -> bool {
        self.load(Ordering::Acquire)
    }
}

/// Why a request went direct
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reason {
    Vpn,
    Disabled,
    NotReady,
    HostExcluded,
}

pub struct RoutingDecider {
    network: Arc<dyn NetworkMonitor>,
    preferences: Arc<dyn ProxyPreferences>,
    readiness: Arc<dyn ReadinessProbe>,
    port: u16,
}

impl RoutingDecider {
    pub fn new(
        network: Arc<dyn NetworkMonitor>,
        preferences: Arc<dyn ProxyPreferences>,
        readiness: Arc<dyn ReadinessProbe>,
        port: u16,
    ) -> Self {
        RoutingDecider {
            network,
            preferences,
            readiness,
            port,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Route for a request to `host`
    pub fn decide(&self, host: &str) -> Route {
        match self.evaluate(host) {
            Ok(route) => {
                trace!("{} -> {}", host, route);
                route
            }
            Err(reason) => {
                trace!("{} -> direct ({:?})", host, reason);
                Route::Direct
            }
        }
    }

    fn evaluate(&self, host: &str) -> std::result::Result<Route, Reason> {
        if self.network.vpn_active() {
            return Err(Reason::Vpn);
        }
        if !self.preferences.enabled() {
            return Err(Reason::Disabled);
        }
        if !self.readiness.proxy_ready() {
            return Err(Reason::NotReady);
        }
        if !self.preferences.should_proxy(host) {
            return Err(Reason::HostExcluded);
        }
        Ok(Route::UseLocalProxy { port: self.port })
    }

    /// Report a request that failed after being routed through the proxy.
    ///
    /// The request is not retried direct. Readiness is owned by the
    /// supervisor, which notices a dead core on its own.
    pub fn connect_failed(&self, host: &str, err: &dyn std::error::Error) {
        warn!("Request to {} via local proxy failed: {}", host, err);
    }

    /// A `reqwest::Proxy` that consults this decider for every request
    pub fn reqwest_proxy(self: &Arc<Self>) -> reqwest::Proxy {
        let decider = Arc::clone(self);
        reqwest::Proxy::custom(move |url| {
            let host = url.host_str()?;
            decider.decide(host).proxy_url()
        })
    }
}

impl fmt::Debug for RoutingDecider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RoutingDecider")
            .field("vpn_active", &self.network.vpn_active())
            .field("enabled", &self.preferences.enabled())
            .field("ready", &self.readiness.proxy_ready())
            .field("port", &self.port)
            .finish()
    }
}
