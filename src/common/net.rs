//! Network utilities

use crate::{Error, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

/// Loopback address of a local port
#[inline]
pub fn local_addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Measure how long a TCP connect to `host:port` takes.
///
/// Resolution is part of the measurement, so a slow resolver counts against
/// the candidate the same way a slow handshake does.
pub async fn tcp_connect_latency(host: &str, port: u16, limit: Duration) -> Result<Duration> {
    let start = Instant::now();
    let stream = timeout(limit, TcpStream::connect((host, port)))
        .await
        .map_err(|_| Error::timeout(format!("connect to {}:{} exceeded {:?}", host, port, limit)))??;
    let elapsed = start.elapsed();
    drop(stream);
    Ok(elapsed)
}

/// Whether something is accepting connections on the loopback port
pub async fn port_accepting(port: u16, limit: Duration) -> bool {
    matches!(timeout(limit, TcpStream::connect(local_addr(port))).await, Ok(Ok(_)))
}

/// Poll a loopback port until it accepts a connection.
///
/// `abort` is checked before every attempt; returning true stops the wait
/// early (the process that should own the port has gone away).
pub async fn wait_for_port<F>(
    port: u16,
    interval: Duration,
    deadline: Duration,
    mut abort: F,
) -> Result<()>
where
    F: FnMut() -> bool,
{
    let start = Instant::now();
    let addr = local_addr(port);
    let mut attempts = 0u32;

    loop {
        if abort() {
            return Err(Error::proxy_not_ready(format!(
                "process exited before port {} opened",
                port
            )));
        }

        attempts += 1;
        if let Ok(Ok(_)) = timeout(interval, TcpStream::connect(addr)).await {
            debug!("Port {} accepting after {} attempts ({:?})", port, attempts, start.elapsed());
            return Ok(());
        }

        if start.elapsed() >= deadline {
            return Err(Error::proxy_not_ready(format!(
                "port {} not accepting after {:?}",
                port, deadline
            )));
        }

        sleep(interval).await;
    }
}
