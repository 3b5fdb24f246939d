//! Per-attempt configuration for the proxy core
//!
//! The payload shipped in the feed is written for a full client. Before it is
//! handed to the local core it is copied and trimmed:
//! - `routing` and `dns` are dropped (they reference geo data files that may
//!   not be bundled)
//! - `inbounds` are replaced by a single loopback SOCKS listener on the port
//!   the supervisor polls
//! - the server outbound is moved to the front, since without routing rules
//!   the core sends everything to the first outbound
//! - TLS outbounds without `serverName` get one from the transport host hint

use super::descriptor::{is_bare_outbound, is_remote_outbound, ServerDescriptor};
use serde_json::{json, Map, Value};
use std::path::Path;
use tokio::fs;
use tracing::debug;

/// Top-level sections removed from every payload
const STRIPPED_SECTIONS: &[&str] = &["routing", "dns"];

/// Tag of the injected SOCKS inbound
pub const SOCKS_INBOUND_TAG: &str = "socks-in";

/// Sanitized configuration ready to be written for the proxy core
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedConfig {
    document: Value,
}

impl SanitizedConfig {
    /// The sanitized document
    pub fn document(&self) -> &Value {
        &self.document
    }

    /// Serialize to a pretty JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.document)
    }

    /// Write configuration to file
    pub async fn write_to_file<P: AsRef<Path>>(&self, path: P) -> std::io::Result<()> {
        let json = self.to_json().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string())
        })?;
        fs::write(path, json).await
    }
}

/// Produce a sanitized copy of the descriptor's payload
pub fn sanitize(descriptor: &ServerDescriptor, socks_port: u16) -> SanitizedConfig {
    let payload = descriptor.payload();

    let mut document = if is_bare_outbound(payload) {
        json!({ "outbounds": [payload.clone()] })
    } else {
        payload.clone()
    };

    if let Some(root) = document.as_object_mut() {
        for section in STRIPPED_SECTIONS {
            if root.remove(*section).is_some() {
                debug!("{}: dropped '{}' section", descriptor.label, section);
            }
        }

        root.insert("inbounds".to_string(), json!([socks_inbound(socks_port)]));

        if let Some(outbounds) = root.get_mut("outbounds").and_then(Value::as_array_mut) {
            if let Some(index) = outbounds.iter().position(is_remote_outbound) {
                if index > 0 {
                    let primary = outbounds.remove(index);
                    outbounds.insert(0, primary);
                    debug!("{}: moved server outbound to the front", descriptor.label);
                }
            }

            for outbound in outbounds.iter_mut() {
                if let Some(name) = patch_server_name(outbound) {
                    debug!("{}: patched TLS serverName to {}", descriptor.label, name);
                }
            }
        }
    }

    SanitizedConfig { document }
}

fn socks_inbound(port: u16) -> Value {
    json!({
        "tag": SOCKS_INBOUND_TAG,
        "listen": "127.0.0.1",
        "port": port,
        "protocol": "socks",
        "settings": { "auth": "noauth", "udp": true }
    })
}

/// Fill `tlsSettings.serverName` from a transport hint.
///
/// Returns the value written, if any.
fn patch_server_name(outbound: &mut Value) -> Option<String> {
    let stream = outbound.get_mut("streamSettings")?.as_object_mut()?;

    if stream.get("security").and_then(Value::as_str) != Some("tls") {
        return None;
    }

    let current = stream
        .get("tlsSettings")
        .and_then(|t| t.get("serverName"))
        .and_then(Value::as_str)
        .unwrap_or_default();
    if !current.is_empty() {
        return None;
    }

    let hint = server_name_hint(stream)?;

    let tls = stream
        .entry("tlsSettings")
        .or_insert_with(|| Value::Object(Map::new()));
    if !tls.is_object() {
        *tls = Value::Object(Map::new());
    }
    tls.as_object_mut()?
        .insert("serverName".to_string(), Value::String(hint.clone()));

    Some(hint)
}

fn server_name_hint(stream: &Map<String, Value>) -> Option<String> {
    let ws = stream.get("wsSettings");

    let candidates = [
        ws.and_then(|w| w.get("headers")).and_then(|h| h.get("Host")),
        ws.and_then(|w| w.get("host")),
        stream
            .get("httpSettings")
            .and_then(|h| h.get("host"))
            .and_then(|h| h.get(0)),
        stream.get("grpcSettings").and_then(|g| g.get("authority")),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::trim)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}
