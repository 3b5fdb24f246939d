//! VPN detection
//!
//! The decider runs on the request path and must not touch the filesystem,
//! so detection happens in a background task and the result is cached in an
//! atomic.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Default sysfs network class directory
pub const SYS_CLASS_NET: &str = "/sys/class/net";

/// Interface name prefixes that indicate a tunnel
const VPN_PREFIXES: &[&str] = &["tun", "tap", "wg", "ppp", "utun", "ipsec", "nordlynx"];

/// Current network transport as seen by the host application
pub trait NetworkMonitor: Send + Sync {
    /// Is the active transport a VPN tunnel
    fn vpn_active(&self) -> bool;
}

/// Flag set by the host application
#[derive(Debug, Default)]
pub struct StaticNetwork {
    vpn: AtomicBool,
}

impl StaticNetwork {
    pub fn new(vpn_active: bool) -> Self {
        StaticNetwork {
            vpn: AtomicBool::new(vpn_active),
        }
    }

    pub fn set_vpn_active(&self, active: bool) {
        self.vpn.store(active, Ordering::Release);
    }
}

impl NetworkMonitor for StaticNetwork {
    fn vpn_active(&self) -> bool {
        self.vpn.load(Ordering::Acquire)
    }
}

/// Polls the interface list for up tunnel devices
pub struct InterfaceWatcher {
    root: PathBuf,
    interval: Duration,
    vpn: AtomicBool,
}

impl InterfaceWatcher {
    pub fn new(interval: Duration) -> Self {
        Self::with_root(PathBuf::from(SYS_CLASS_NET), interval)
    }

    /// Watch a different sysfs-style directory
    pub fn with_root(root: PathBuf, interval: Duration) -> Self {
        InterfaceWatcher {
            root,
            interval,
            vpn: AtomicBool::new(false),
        }
    }

    /// Rescan once and update the cached flag
    pub async fn refresh(&self) -> bool {
        let active = scan(&self.root).await;
        let previous = self.vpn.swap(active, Ordering::AcqRel);
        if previous != active {
            info!("VPN {}", if active { "detected" } else { "gone" });
        }
        active
    }

    /// Background refresh loop until `cancel` fires
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.refresh().await;
                    }
                }
            }
            debug!("Interface watcher stopped");
        })
    }
}

impl NetworkMonitor for InterfaceWatcher {
    fn vpn_active(&self) -> bool {
        self.vpn.load(Ordering::Acquire)
    }
}

fn is_vpn_name(name: &str) -> bool {
    VPN_PREFIXES.iter().any(|prefix| name.starts_with(prefix))
}

async fn scan(root: &Path) -> bool {
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(e) => {
            debug!("Cannot read {:?}: {}", root, e);
            return false;
        }
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !is_vpn_name(&name) {
            continue;
        }

        // Tunnels usually report "unknown" rather than "up"
        let operstate = tokio::fs::read_to_string(entry.path().join("operstate"))
            .await
            .unwrap_or_default();
        match operstate.trim() {
            "up" | "unknown" => {
                debug!("Tunnel interface {} is {}", name, operstate.trim());
                return true;
            }
            _ => {}
        }
    }

    false
}
