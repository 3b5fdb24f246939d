//! Error types for the bootstrap core

use std::io;
use thiserror::Error;

/// Bootstrap error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    /// Candidate feed unreachable or empty after decoding
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// No candidate answered its probe
    #[error("No servers available: {0}")]
    NoServers(String),

    /// Proxy executable absent or not executable
    #[error("Proxy executable missing: {0}")]
    BinaryMissing(String),

    /// Local SOCKS5 port never opened
    #[error("Proxy not ready: {0}")]
    ProxyNotReady(String),

    /// End-to-end request through the local proxy failed
    #[error("Connectivity test failed: {0}")]
    ConnectivityTest(String),

    /// Something other than our core already listens on the SOCKS port
    #[error("Port in use: {0}")]
    PortInUse(String),

    #[error("Process teardown error: {0}")]
    ProcessTeardown(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("Supervisor destroyed")]
    Destroyed,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn fetch<S: Into<String>>(msg: S) -> Self {
        Error::Fetch(msg.into())
    }

    pub fn no_servers<S: Into<String>>(msg: S) -> Self {
        Error::NoServers(msg.into())
    }

    pub fn binary_missing<S: Into<String>>(msg: S) -> Self {
        Error::BinaryMissing(msg.into())
    }

    pub fn proxy_not_ready<S: Into<String>>(msg: S) -> Self {
        Error::ProxyNotReady(msg.into())
    }

    pub fn connectivity<S: Into<String>>(msg: S) -> Self {
        Error::ConnectivityTest(msg.into())
    }

    pub fn port_in_use<S: Into<String>>(msg: S) -> Self {
        Error::PortInUse(msg.into())
    }

    pub fn teardown<S: Into<String>>(msg: S) -> Self {
        Error::ProcessTeardown(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Error::Internal(msg.into())
    }

    /// Whether the supervisor should move on to the next ranked candidate
    pub fn is_candidate_failure(&self) -> bool {
        !matches!(
            self,
            Error::Fetch(_)
                | Error::NoServers(_)
                | Error::BinaryMissing(_)
                | Error::PortInUse(_)
                | Error::Destroyed
        )
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        Error::Timeout(e.to_string())
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Error::Fetch(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_creation() {
        let e = Error::config("test error");
        assert!(matches!(e, Error::Config(_)));
    }

    #[test]
    fn test_error_display() {
        let e = Error::proxy_not_ready("port 10808 closed after 10s");
        assert_eq!(e.to_string(), "Proxy not ready: port 10808 closed after 10s");
        assert_eq!(Error::Destroyed.to_string(), "Supervisor destroyed");
    }

    #[test]
    fn test_candidate_failure_classification() {
        assert!(Error::proxy_not_ready("x").is_candidate_failure());
        assert!(Error::connectivity("x").is_candidate_failure());
        assert!(Error::Io(io::Error::new(io::ErrorKind::Other, "spawn")).is_candidate_failure());
        assert!(!Error::fetch("x").is_candidate_failure());
        assert!(!Error::no_servers("x").is_candidate_failure());
        assert!(!Error::binary_missing("x").is_candidate_failure());
        assert!(!Error::port_in_use("127.0.0.1:10808").is_candidate_failure());
    }
}
