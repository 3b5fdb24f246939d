//! Proxy Bootstrap - CLI Entry Point

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use proxy_bootstrap::{Bootstrap, Config, VERSION};
use std::path::PathBuf;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "proxy-bootstrap")]
#[command(author = "Tsang")]
#[command(version = VERSION)]
#[command(about = "Latency-ranked bootstrap and supervision of an external SOCKS5 proxy core")]
struct Args {
    /// Path to configuration file
    #[arg(short = 'c', long = "config", default_value = "config.yaml")]
    config: PathBuf,

    /// Working directory (config path and proxy core config resolve from here)
    #[arg(short = 'd', long = "directory")]
    directory: Option<PathBuf>,

    /// Control API address (overrides config)
    #[arg(long = "ext-ctl")]
    external_controller: Option<String>,

    /// Control API secret (overrides config)
    #[arg(long = "secret")]
    secret: Option<String>,

    /// Local SOCKS5 port (overrides config)
    #[arg(long = "socks-port")]
    socks_port: Option<u16>,

    /// Emit logs as JSON lines
    #[arg(long = "log-json")]
    log_json: bool,

    /// Test configuration and exit
    #[arg(short = 't', long = "test")]
    test: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get().clamp(2, 4))
        .enable_all()
        .thread_name("bootstrap-worker")
        .build()?;

    runtime.block_on(async_main(args))
}

fn init_logging(level: &str, json: bool) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env()
        .add_directive(format!("proxy_bootstrap={}", level).parse()?)
        .add_directive("tower_http=info".parse()?);

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
    Ok(())
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    if let Some(ref dir) = args.directory {
        std::env::set_current_dir(dir)?;
    }

    let loaded = Config::load_async(&args.config).await;

    let level = loaded
        .as_ref()
        .map(|c| c.log_level.clone())
        .unwrap_or_else(|_| "info".to_string());
    init_logging(&level, args.log_json)?;

    info!("Proxy Bootstrap v{}", VERSION);
    info!("Loading configuration from: {}", args.config.display());

    let mut config = match loaded {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    if let Some(ext_ctl) = args.external_controller {
        config.external_controller = Some(ext_ctl);
    }
    if let Some(secret) = args.secret {
        config.secret = Some(secret);
    }
    if let Some(port) = args.socks_port {
        config.socks_port = port;
    }

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        std::process::exit(1);
    }

    if args.test {
        info!("Configuration test passed");
        return Ok(());
    }

    let bootstrap = match Bootstrap::new(config) {
        Ok(b) => b,
        Err(e) => {
            error!("Failed to initialize: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = bootstrap.run().await {
        error!("Bootstrap error: {}", e);
        std::process::exit(1);
    }

    Ok(())
}
