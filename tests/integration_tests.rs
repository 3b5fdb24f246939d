//! End-to-end supervisor runs
//!
//! The `proxy_core_stub` binary stands in for the proxy core and listens on
//! the SOCKS5 port itself. Latency and connectivity are simulated per
//! candidate host.

#![cfg(unix)]

use async_trait::async_trait;
use proxy_bootstrap::common::net::port_accepting;
use proxy_bootstrap::provider::{Probe, ServerPool, StaticSource};
use proxy_bootstrap::routing::{RoutingDecider, SharedPreferences, StaticNetwork};
use proxy_bootstrap::supervisor::{ConnectivityCheck, Phase, SupervisorConfig};
use proxy_bootstrap::{Error, ProxySupervisor, Result, Route, ServerDescriptor};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Latency per host; hosts not listed never answer
struct SimulatedProbe {
    delays: HashMap<String, u64>,
}

impl SimulatedProbe {
    fn new(delays: &[(&str, u64)]) -> Self {
        SimulatedProbe {
            delays: delays.iter().map(|(h, d)| (h.to_string(), *d)).collect(),
        }
    }
}

#[async_trait]
impl Probe for SimulatedProbe {
    async fn probe(&self, descriptor: &ServerDescriptor) -> Result<Duration> {
        match self.delays.get(&descriptor.host) {
            Some(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await;
                Ok(Duration::from_millis(*ms))
            }
            None => std::future::pending().await,
        }
    }
}

/// Passes unless the written core config targets a blocked host
struct ConfigAwareCheck {
    config_path: PathBuf,
    blocked: Vec<String>,
}

#[async_trait]
impl ConnectivityCheck for ConfigAwareCheck {
    async fn check(&self, socks_port: u16) -> Result<String> {
        if !port_accepting(socks_port, Duration::from_millis(200)).await {
            return Err(Error::connectivity("socks port closed"));
        }
        let written = tokio::fs::read_to_string(&self.config_path).await?;
        if self.blocked.iter().any(|h| written.contains(h.as_str())) {
            return Err(Error::connectivity("echo endpoint unreachable"));
        }
        Ok("203.0.113.7".to_string())
    }
}

/// Payload for one candidate; `stub` is passed through to the stub core
fn descriptor(label: &str, host: &str, stub: &Value) -> ServerDescriptor {
    ServerDescriptor::from_payload(json!({
        "remarks": label,
        "stub": stub,
        "outbounds": [{
            "protocol": "vless",
            "settings": { "vnext": [{ "address": host, "port": 443, "users": [{ "id": "u" }] }] },
            "streamSettings": { "network": "ws", "security": "tls", "wsSettings": { "headers": { "Host": host } } }
        }]
    }))
    .unwrap()
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

struct Harness {
    supervisor: ProxySupervisor,
    config_path: PathBuf,
    _dir: tempfile::TempDir,
}

struct Setup<'a> {
    stub: Value,
    delays: &'a [(&'a str, u64)],
    blocked: &'a [&'a str],
}

impl Default for Setup<'_> {
    fn default() -> Self {
        Setup {
            stub: json!({}),
            delays: &[("fast.test", 50), ("slow.test", 120)],
            blocked: &[],
        }
    }
}

fn harness(setup: Setup<'_>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let config_path = dir.path().join("proxy-config.json");
    let socks_port = free_port();

    let config = SupervisorConfig {
        executable: PathBuf::from(env!("CARGO_BIN_EXE_proxy_core_stub")),
        config_path: config_path.clone(),
        socks_port,
        port_poll_interval: Duration::from_millis(20),
        port_ready_timeout: Duration::from_millis(1500),
        kill_grace: Duration::from_millis(300),
    };
    let source = StaticSource::new(vec![
        descriptor("edge-fast", "fast.test", &setup.stub),
        descriptor("edge-dead", "dead.test", &setup.stub),
        descriptor("edge-slow", "slow.test", &setup.stub),
    ]);
    let pool = ServerPool::new(
        Arc::new(SimulatedProbe::new(setup.delays)),
        Duration::from_millis(500),
    );
    let check = ConfigAwareCheck {
        config_path: config_path.clone(),
        blocked: setup.blocked.iter().map(|s| s.to_string()).collect(),
    };

    Harness {
        supervisor: ProxySupervisor::new(config, Arc::new(source), pool, Arc::new(check)),
        config_path,
        _dir: dir,
    }
}

const SETTLE: Duration = Duration::from_secs(10);

#[tokio::test]
async fn test_start_reaches_ready_on_fastest_candidate() {
    let h = harness(Setup::default());

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert_eq!(snap.phase, Phase::Ready);
    assert!(snap.running);
    assert!(snap.ready);
    assert_eq!(snap.active_server_host.as_deref(), Some("fast.test"));
    assert_eq!(snap.exit_ip.as_deref(), Some("203.0.113.7"));
    assert!(snap.last_error.is_none());

    let pid = h.supervisor.process_id().await.unwrap();
    assert!(alive(pid));
    assert!(port_accepting(h.supervisor.socks_port(), Duration::from_millis(200)).await);

    let written = std::fs::read_to_string(&h.config_path).unwrap();
    let written: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(written["inbounds"][0]["protocol"], "socks");
    assert_eq!(written["inbounds"][0]["listen"], "127.0.0.1");
    assert_eq!(
        written["outbounds"][0]["streamSettings"]["tlsSettings"]["serverName"],
        "fast.test"
    );

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_connectivity_failure_falls_through() {
    let h = harness(Setup {
        blocked: &["fast.test"],
        ..Setup::default()
    });

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert!(snap.ready);
    assert_eq!(snap.active_server_host.as_deref(), Some("slow.test"));

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_no_reachable_candidates() {
    let h = harness(Setup {
        delays: &[],
        ..Setup::default()
    });

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert_eq!(snap.phase, Phase::Failed);
    assert!(!snap.ready);
    assert!(!snap.running);
    assert!(!snap.last_error.unwrap_or_default().is_empty());
    assert!(h.supervisor.process_id().await.is_none());
}

#[tokio::test]
async fn test_port_never_opens() {
    let h = harness(Setup {
        stub: json!({ "listen": false }),
        ..Setup::default()
    });

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert_eq!(snap.phase, Phase::Failed);
    let err = snap.last_error.unwrap();
    assert!(err.contains("Proxy not ready"), "unexpected error: {}", err);
    assert!(h.supervisor.process_id().await.is_none());
}

#[tokio::test]
async fn test_foreign_listener_on_socks_port_fails_run() {
    let h = harness(Setup::default());
    let _foreign = TcpListener::bind(("127.0.0.1", h.supervisor.socks_port()))
        .await
        .unwrap();

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert_eq!(snap.phase, Phase::Failed);
    assert!(!snap.ready);
    assert!(snap.active_server_host.is_none());
    let err = snap.last_error.unwrap();
    assert!(err.contains("Port in use"), "unexpected error: {}", err);
    assert!(h.supervisor.process_id().await.is_none());
    assert!(!h.config_path.exists());
}

#[tokio::test]
async fn test_start_while_running_is_noop() {
    let h = harness(Setup::default());

    h.supervisor.start().await.unwrap();
    let first = h.supervisor.wait_settled(SETTLE).await.unwrap();
    let pid = h.supervisor.process_id().await.unwrap();

    h.supervisor.start().await.unwrap();
    let second = h.supervisor.snapshot();

    assert_eq!(first.generation, second.generation);
    assert_eq!(second.phase, Phase::Ready);
    assert_eq!(h.supervisor.process_id().await, Some(pid));

    h.supervisor.stop().await;
}

#[tokio::test]
async fn test_stop_leaves_nothing_behind() {
    let h = harness(Setup::default());

    h.supervisor.start().await.unwrap();
    h.supervisor.wait_settled(SETTLE).await.unwrap();
    let pid = h.supervisor.process_id().await.unwrap();

    h.supervisor.stop().await;

    let snap = h.supervisor.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(!snap.running);
    assert!(!snap.ready);
    assert!(snap.active_server_host.is_none());
    assert!(!alive(pid));
    assert!(h.supervisor.process_id().await.is_none());
    assert!(!h.config_path.exists());
    assert!(!port_accepting(h.supervisor.socks_port(), Duration::from_millis(200)).await);
}

#[tokio::test]
async fn test_stop_during_bootstrap() {
    let h = harness(Setup {
        delays: &[("fast.test", 300)],
        ..Setup::default()
    });

    h.supervisor.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    h.supervisor.stop().await;

    let snap = h.supervisor.snapshot();
    assert_eq!(snap.phase, Phase::Idle);
    assert!(!snap.ready);

    // The cancelled run must not publish anything afterwards
    tokio::time::sleep(Duration::from_millis(500)).await;
    let later = h.supervisor.snapshot();
    assert_eq!(later.phase, Phase::Idle);
    assert_eq!(later.generation, snap.generation);
    assert!(h.supervisor.process_id().await.is_none());
}

#[tokio::test]
async fn test_restart_opens_new_generation() {
    let h = harness(Setup::default());

    h.supervisor.start().await.unwrap();
    let first = h.supervisor.wait_settled(SETTLE).await.unwrap();
    h.supervisor.stop().await;

    h.supervisor.start().await.unwrap();
    let second = h.supervisor.wait_settled(SETTLE).await.unwrap();

    assert!(second.generation > first.generation);
    assert!(second.ready);

    h.supervisor.destroy().await;
    assert_eq!(h.supervisor.snapshot().phase, Phase::Destroyed);
    assert!(matches!(h.supervisor.start().await, Err(Error::Destroyed)));
}

#[tokio::test]
async fn test_concurrent_stop_and_start_leave_one_live_run() {
    let h = harness(Setup::default());

    h.supervisor.start().await.unwrap();
    let first = h.supervisor.wait_settled(SETTLE).await.unwrap();
    let old_pid = h.supervisor.process_id().await.unwrap();

    let (_, started) = tokio::join!(h.supervisor.stop(), h.supervisor.start());
    started.unwrap();

    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();
    assert_eq!(snap.phase, Phase::Ready);
    assert!(snap.running);
    assert_eq!(snap.generation, first.generation + 2);

    let pid = h.supervisor.process_id().await.unwrap();
    assert_ne!(pid, old_pid);
    assert!(alive(pid));
    assert!(!alive(old_pid));
    assert!(h.config_path.exists());

    h.supervisor.stop().await;
    assert!(!alive(pid));
}

#[tokio::test]
async fn test_core_exit_after_ready_fails_run() {
    let h = harness(Setup {
        stub: json!({ "exitAfterMs": 2500 }),
        ..Setup::default()
    });

    h.supervisor.start().await.unwrap();
    let snap = h.supervisor.wait_settled(SETTLE).await.unwrap();
    assert!(snap.ready);

    let mut rx = h.supervisor.subscribe();
    tokio::time::timeout(SETTLE, rx.wait_for(|p| *p == Phase::Failed))
        .await
        .unwrap()
        .unwrap();

    let snap = h.supervisor.snapshot();
    assert!(!snap.ready);
    assert!(snap.last_error.unwrap().contains("exited"));
    assert!(h.supervisor.process_id().await.is_none());
}

#[tokio::test]
async fn test_decider_follows_supervisor() {
    let h = harness(Setup::default());
    let network = Arc::new(StaticNetwork::new(false));
    let decider = RoutingDecider::new(
        network.clone(),
        Arc::new(SharedPreferences::default()),
        h.supervisor.state(),
        h.supervisor.socks_port(),
    );

    assert_eq!(decider.decide("example.com"), Route::Direct);

    h.supervisor.start().await.unwrap();
    h.supervisor.wait_settled(SETTLE).await.unwrap();
    assert_eq!(
        decider.decide("example.com"),
        Route::UseLocalProxy {
            port: h.supervisor.socks_port()
        }
    );

    network.set_vpn_active(true);
    assert_eq!(decider.decide("example.com"), Route::Direct);
    network.set_vpn_active(false);

    h.supervisor.stop().await;
    assert_eq!(decider.decide("example.com"), Route::Direct);
}
