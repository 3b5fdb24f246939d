//! Stand-in proxy core for local runs and the integration tests
//!
//! Accepts the same `run -c <config>` invocation as the real core, reads the
//! SOCKS inbound port from the written config and listens on it, dropping
//! every connection. An optional top-level `stub` section changes that:
//! `{"listen": false}` never binds, `{"exitAfterMs": N}` exits after N ms.
//!
//! Usage: cargo run --bin proxy_core_stub -- run -c proxy-config.json

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "proxy_core_stub")]
struct Args {
    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    Run {
        #[arg(short = 'c', long = "config")]
        config: PathBuf,
    },
}

#[derive(Deserialize)]
struct CoreConfig {
    #[serde(default)]
    inbounds: Vec<Inbound>,
    #[serde(default)]
    stub: StubOptions,
}

#[derive(Deserialize)]
struct Inbound {
    port: u16,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StubOptions {
    #[serde(default = "default_listen")]
    listen: bool,
    exit_after_ms: Option<u64>,
}

impl Default for StubOptions {
    fn default() -> Self {
        StubOptions {
            listen: true,
            exit_after_ms: None,
        }
    }
}

fn default_listen() -> bool {
    true
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let Cmd::Run { config } = Args::parse().command;

    let text = tokio::fs::read_to_string(&config)
        .await
        .with_context(|| format!("reading {}", config.display()))?;
    let core: CoreConfig = serde_json::from_str(&text).context("parsing core config")?;
    let port = core
        .inbounds
        .first()
        .map(|i| i.port)
        .context("config has no inbound")?;

    let listener = if core.stub.listen {
        let listener = TcpListener::bind(("127.0.0.1", port))
            .await
            .with_context(|| format!("binding 127.0.0.1:{}", port))?;
        println!("socks inbound listening on 127.0.0.1:{}", port);
        Some(listener)
    } else {
        eprintln!("socks inbound disabled");
        None
    };

    let serve = async move {
        match listener {
            Some(listener) => loop {
                if let Ok((stream, _)) = listener.accept().await {
                    drop(stream);
                }
            },
            None => std::future::pending::<()>().await,
        }
    };

    match core.stub.exit_after_ms {
        Some(ms) => {
            let _ = tokio::time::timeout(Duration::from_millis(ms), serve).await;
            eprintln!("exiting after {}ms", ms);
        }
        None => serve.await,
    }
    Ok(())
}
