//! loopctl host entry point.
//!
//! ```text
//! loopctl-host                    Run with ./loopctl-host.toml or defaults
//! loopctl-host --config <path>    Load a custom config TOML
//! loopctl-host --listen <addr>    Override the listen address
//! loopctl-host --gen-config       Write default config to stdout
//! ```

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use loopctl_host::config::HostConfig;
use loopctl_host::service::HostService;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "loopctl-host", about = "Headless GUI host driven over the loopctl protocol")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "loopctl-host.toml")]
    config: PathBuf,

    /// Listen address, overriding the config file and LOOPCTL_ADDR.
    #[arg(short, long)]
    listen: Option<String>,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", HostConfig::default().to_toml()?);
        return Ok(());
    }

    let mut config = HostConfig::load(&cli.config);
    config.apply_env();
    if let Some(listen) = cli.listen {
        config.network.listen_address = listen;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("loopctl-host v{}", env!("CARGO_PKG_VERSION"));
    info!("listen address: {}", config.network.listen_address);
    info!(
        "queue capacity {}, tick budget {} ms, {} workers",
        config.event_loop.queue_capacity,
        config.event_loop.tick_budget_ms,
        config.workers.worker_pool_size
    );

    let service = HostService::new(&config);
    let stop = service.stop_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, draining");
        stop.cancel();
    });

    service.run().await
}
