//! User preferences consulted by the decider

use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// Preferences owned by the host application
pub trait ProxyPreferences: Send + Sync {
    /// User toggle for the local proxy
    fn enabled(&self) -> bool;

    /// Whether `host` is one the user wants proxied
    fn should_proxy(&self, host: &str) -> bool;
}

/// In-memory preferences, updatable at runtime
#[derive(Debug)]
pub struct SharedPreferences {
    enabled: AtomicBool,
    hosts: RwLock<Vec<String>>,
}

impl SharedPreferences {
    pub fn new(enabled: bool, hosts: Vec<String>) -> Self {
        SharedPreferences {
            enabled: AtomicBool::new(enabled),
            hosts: RwLock::new(normalize(hosts)),
        }
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    pub fn set_proxied_hosts(&self, hosts: Vec<String>) {
        *self.hosts.write() = normalize(hosts);
    }

    pub fn proxied_hosts(&self) -> Vec<String> {
        self.hosts.read().clone()
    }
}

impl Default for SharedPreferences {
    fn default() -> Self {
        Self::new(true, Vec::new())
    }
}

impl ProxyPreferences for SharedPreferences {
    fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// An empty list proxies everything. Otherwise exact or subdomain match.
    fn should_proxy(&self, host: &str) -> bool {
        let hosts = self.hosts.read();
        if hosts.is_empty() {
            return true;
        }

        let host = host.trim_end_matches('.');
        hosts.iter().any(|entry| host_matches(host, entry))
    }
}

fn host_matches(host: &str, entry: &str) -> bool {
    if host.len() == entry.len() {
        return host.eq_ignore_ascii_case(entry);
    }
    // Subdomain: "<label>." + entry
    host.len() > entry.len()
        && host.as_bytes()[host.len() - entry.len() - 1] == b'.'
        && host[host.len() - entry.len()..].eq_ignore_ascii_case(entry)
}

fn normalize(hosts: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = hosts
        .into_iter()
        .map(|h| {
            h.trim()
                .trim_start_matches("*.")
                .trim_end_matches('.')
                .to_ascii_lowercase()
        })
        .filter(|h| !h.is_empty())
        .collect();
    out.sort();
    out.dedup();
    out
}
