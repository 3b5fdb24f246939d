//! End-to-end connectivity test
//!
//! An open SOCKS port only proves the core started. One real request through
//! it proves the selected upstream actually carries traffic.

use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

/// Connectivity test through the local proxy
#[async_trait]
pub trait ConnectivityCheck: Send + Sync {
    /// Request the echo endpoint through `127.0.0.1:<socks_port>`.
    ///
    /// Returns the response body (the exit address for echo-IP services).
    async fn check(&self, socks_port: u16) -> Result<String>;
}

/// HTTP GET against an echo-IP endpoint
pub struct EchoCheck {
    url: String,
    timeout: Duration,
}

impl EchoCheck {
    pub fn new(url: String, timeout: Duration) -> Self {
        EchoCheck { url, timeout }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Query the echo endpoint without any proxy
    pub async fn direct(&self) -> Result<String> {
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .no_proxy()
            .build()
            .map_err(|e| Error::internal(e.to_string()))?;
        self.get(&client).await
    }

    async fn get(&self, client: &reqwest::Client) -> Result<String> {
        let resp = client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| Error::connectivity(format!("{}: {}", self.url, e)))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::connectivity(format!("{} returned {}", self.url, status)));
        }

        let body = resp
            .text()
            .await
            .map_err(|e| Error::connectivity(format!("{}: {}", self.url, e)))?;
        Ok(body.trim().to_string())
    }
}

#[async_trait]
impl ConnectivityCheck for EchoCheck {
    async fn check(&self, socks_port: u16) -> Result<String> {
        // socks5h: let the proxy resolve names, local DNS may be filtered
        let proxy = reqwest::Proxy::all(format!("socks5h://127.0.0.1:{}", socks_port))
            .map_err(|e| Error::internal(e.to_string()))?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .map_err(|e| Error::internal(e.to_string()))?;

        let body = self.get(&client).await?;
        debug!("Connectivity via port {} ok, echo: {}", socks_port, body);
        Ok(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    async fn serve_once(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            if let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let resp = format!(
                    "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = stream.write_all(resp.as_bytes()).await;
            }
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn test_direct_echo() {
        let url = serve_once("200 OK", "198.51.100.4\n").await;
        let check = EchoCheck::new(url, Duration::from_secs(5));
        assert_eq!(check.direct().await.unwrap(), "198.51.100.4");
    }

    #[tokio::test]
    async fn test_direct_echo_bad_status() {
        let url = serve_once("502 Bad Gateway", "").await;
        let check = EchoCheck::new(url, Duration::from_secs(5));
        assert!(matches!(check.direct().await, Err(Error::ConnectivityTest(_))));
    }

    #[tokio::test]
    async fn test_check_without_proxy_listening() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
            l.local_addr().unwrap().port()
        };
        let check = EchoCheck::new("http://example.invalid/".to_string(), Duration::from_secs(2));
        assert!(matches!(check.check(port).await, Err(Error::ConnectivityTest(_))));
    }
}
