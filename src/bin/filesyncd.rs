use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;

use filesync::cli::{init_tracing, DaemonOpts};
use filesync::config::ServerConfig;
use filesync::server::Server;

fn main() -> Result<()> {
    let opts = DaemonOpts::parse();
    init_tracing(opts.verbose);

    let config = opts.apply(
        ServerConfig::load(opts.config.as_deref()).context("Failed to load daemon config")?,
    );

    if config.bind.starts_with("0.0.0.0") {
        tracing::warn!(
            bind = %config.bind,
            "binding to all interfaces; the protocol has no authentication"
        );
    }

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    rt.block_on(async move {
        tracing::info!(
            base_dir = %config.base_dir.display(),
            repair = config.repair_on_start,
            "starting filesync daemon"
        );
        let server = Server::open(&config)
            .await
            .with_context(|| format!("Failed to open store under {}", config.base_dir.display()))?;
        let listener = TcpListener::bind(&config.bind)
            .await
            .with_context(|| format!("bind {}", config.bind))?;
        server
            .serve(listener, async {
                let _ = tokio::signal::ctrl_c().await;
            })
            .await?;
        Ok::<(), anyhow::Error>(())
    })
}
