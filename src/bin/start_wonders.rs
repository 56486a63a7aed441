//! `start_wonders`: the Internet-side forwarder daemon.
//!
//! Runs until SIGINT or SIGTERM, then drains in-flight requests before
//! exiting.

use anyhow::{Context, Result};
use clap::Parser;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

use della_wonders::cli::{init_tracing, StartWondersCli};
use della_wonders::forwarder::{FetchPolicy, Forwarder, ForwarderConfig};

fn main() -> Result<()> {
    let cli = StartWondersCli::parse();
    init_tracing(cli.verbose);

    let config = ForwarderConfig {
        blocked_domains: cli.block_domains.clone(),
        extra_patterns: cli.block_patterns.clone(),
        workers: cli.workers,
        stale_after: Duration::from_secs(cli.stale_after),
        fetch: FetchPolicy {
            request_timeout: Duration::from_secs(cli.request_timeout),
            ..FetchPolicy::default()
        },
        ..ForwarderConfig::new(&cli.shared_dir)
    };

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    rt.block_on(async {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // stop claiming on the first SIGINT/SIGTERM; the forwarder drains
        tokio::spawn(async move {
            use tokio::signal::unix::{signal, SignalKind};
            let Ok(mut sigterm) = signal(SignalKind::terminate()) else {
                return;
            };
            let Ok(mut sigint) = signal(SignalKind::interrupt()) else {
                return;
            };
            tokio::select! {
                _ = sigterm.recv() => info!("SIGTERM received"),
                _ = sigint.recv() => info!("SIGINT received"),
            }
            let _ = shutdown_tx.send(true);
        });

        let forwarder =
            Forwarder::new(config, shutdown_rx).context("failed to start forwarder")?;
        forwarder.run().await.context("forwarder failed")
    })
}
