//! Candidate server descriptors
//!
//! A descriptor wraps one protocol-specific payload (an Xray/V2Ray style JSON
//! document) together with the address extracted from it. The payload itself
//! is opaque: only the proxy core understands it.

use crate::{Error, Result};
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use std::fmt;

/// Outbound protocols that never leave the machine
const LOCAL_PROTOCOLS: &[&str] = &["freedom", "blackhole", "dns", "loopback"];

/// One candidate upstream server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServerDescriptor {
    pub label: String,
    pub host: String,
    pub port: u16,
    #[serde(skip)]
    payload: Value,
}

impl ServerDescriptor {
    /// Build a descriptor from a decoded payload.
    ///
    /// Fails if no host/port can be extracted.
    pub fn from_payload(payload: Value) -> Result<Self> {
        if !payload.is_object() {
            return Err(Error::parse("payload is not a JSON object"));
        }

        let outbound = primary_outbound(&payload)
            .ok_or_else(|| Error::parse("payload has no remote outbound"))?;
        let (host, port) = extract_address(outbound)?;

        let label = ["remarks", "ps", "tag"]
            .iter()
            .find_map(|key| payload.get(*key).and_then(Value::as_str))
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("{}:{}", host, port));

        Ok(ServerDescriptor {
            label,
            host,
            port,
            payload,
        })
    }

    /// Decode one feed line (base64 of a JSON document)
    pub fn from_line(line: &str) -> Result<Self> {
        let bytes = decode_base64(line.trim())?;
        let payload: Value = serde_json::from_slice(&bytes)
            .map_err(|e| Error::parse(format!("Invalid JSON: {}", e)))?;
        Self::from_payload(payload)
    }

    /// The original payload, untouched
    pub fn payload(&self) -> &Value {
        &self.payload
    }

    /// `host:port` for logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ServerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.label, self.host, self.port)
    }
}

/// Decode base64 in any of the common alphabets
pub fn decode_base64(input: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(input)
        .or_else(|_| STANDARD_NO_PAD.decode(input))
        .or_else(|_| URL_SAFE.decode(input))
        .or_else(|_| URL_SAFE_NO_PAD.decode(input))
        .map_err(|e| Error::parse(format!("Invalid base64: {}", e)))
}

/// True if the document is itself a single outbound object
pub(crate) fn is_bare_outbound(payload: &Value) -> bool {
    payload.get("protocol").is_some() && payload.get("settings").is_some()
}

/// Whether an outbound talks to a remote server
pub(crate) fn is_remote_outbound(outbound: &Value) -> bool {
    match outbound.get("protocol").and_then(Value::as_str) {
        Some(protocol) => !LOCAL_PROTOCOLS.contains(&protocol),
        None => false,
    }
}

fn primary_outbound(payload: &Value) -> Option<&Value> {
    if is_bare_outbound(payload) {
        return Some(payload);
    }

    payload
        .get("outbounds")
        .and_then(Value::as_array)?
        .iter()
        .find(|o| is_remote_outbound(o))
}

fn extract_address(outbound: &Value) -> Result<(String, u16)> {
    let settings = outbound
        .get("settings")
        .ok_or_else(|| Error::parse("outbound has no settings"))?;

    let endpoint = settings
        .get("vnext")
        .or_else(|| settings.get("servers"))
        .and_then(Value::as_array)
        .and_then(|list| list.first())
        .unwrap_or(settings);

    let host = endpoint
        .get("address")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::parse("outbound has no server address"))?;

    let port = endpoint
        .get("port")
        .and_then(parse_port)
        .ok_or_else(|| Error::parse(format!("outbound for {} has no valid port", host)))?;

    Ok((host.to_string(), port))
}

fn parse_port(value: &Value) -> Option<u16> {
    let port = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    u16::try_from(port).ok().filter(|p| *p != 0)
}
