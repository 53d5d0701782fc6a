//! The node daemon binary.

use clap::Parser;
use meshtun::daemon;
use meshtun::device::os::OsTunProvider;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "meshtun-node", version, about = "mesh VPN node daemon")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "node.toml")]
    config: String,
}

#[tokio::main]
async fn main() {
    tracing::subscriber::set_global_default(
        tracing_subscriber::FmtSubscriber::builder()
            .with_env_filter(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .with_line_number(true)
            .with_file(true)
            .finish(),
    )
    .expect("subscriber already installed");

    let args = Args::parse();

    // Configuration errors are fatal before any side effect.
    let cfg = match daemon::config::load(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::error!("configuration error: {:#}", e);
            std::process::exit(1);
        }
    };

    tracing::info!(
        "starting {} ({:?} mode, version {})",
        cfg.node.name,
        cfg.node.mode,
        meshtun::VERSION
    );

    let cancel = CancellationToken::new();
    if let Err(e) = daemon::run(cfg, Arc::new(OsTunProvider), cancel).await {
        tracing::error!("daemon failed: {}", e);
        std::process::exit(1);
    }
}
