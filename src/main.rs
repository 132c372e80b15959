//! motarei daemon entry point.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use clap::Parser;
use log::{error, info, warn};
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use motarei::cli::Cli;
use motarei::config::Config;
use motarei::{Dispatcher, DispatcherConfig, DockerInventory, Registry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    // Load configuration
    let cfg = Config::load(&cli)?;
    info!(
        "Starting motarei {} with config: {:?}",
        env!("CARGO_PKG_VERSION"),
        cfg
    );

    // Backend registry
    let inventory = Arc::new(
        DockerInventory::connect()
            .await
            .context("failed to connect to Docker")?,
    );
    let registry = Arc::new(
        Registry::new(inventory, cfg.label(), cfg.explicit_ports())
            .await
            .context("failed to initialize discovery")?,
    );
    let first = registry
        .refresh()
        .await
        .context("failed first discovery")?;
    info!(
        "Found {} backends for label {}",
        first.endpoint_count(),
        registry.label()
    );

    let cancel = CancellationToken::new();

    let refresh_handle = tokio::spawn({
        let registry = Arc::clone(&registry);
        let cancel = cancel.clone();
        let interval = cfg.refresh_interval();
        async move { registry.run(interval, cancel).await }
    });

    // One dispatcher per private port
    let dispatcher_config = DispatcherConfig {
        connect_timeout: cfg.connect_timeout(),
        ..Default::default()
    };
    let mut accept_loops = JoinSet::new();
    let mut trackers = Vec::new();
    for &port in registry.private_ports() {
        let dispatcher = Arc::new(Dispatcher::new(
            port,
            Arc::clone(&registry),
            dispatcher_config.clone(),
        ));
        trackers.push(dispatcher.tracker());
        let addr = SocketAddr::new(cfg.bind_ip, port);
        accept_loops.spawn(dispatcher.start(addr, cancel.clone()));
    }

    let outcome = tokio::select! {
        _ = shutdown_signal() => {
            info!("Received shutdown signal, shutting down...");
            Ok(())
        }
        Some(joined) = accept_loops.join_next() => match joined {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(anyhow!("accept loop failed: {}", e)),
            Err(e) => Err(anyhow!("accept loop panicked: {}", e)),
        },
    };

    cancel.cancel();
    while let Some(joined) = accept_loops.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("Accept loop failed: {}", e),
            Err(e) => error!("Accept loop panicked: {}", e),
        }
    }
    if let Err(e) = refresh_handle.await {
        error!("Background refresh panicked: {}", e);
    }

    drain(&trackers, cfg.shutdown_grace()).await;

    info!("Shutdown complete.");
    outcome
}

/// Wait up to `grace` for open connections to finish on their own.
async fn drain(trackers: &[TaskTracker], grace: Duration) {
    let open: usize = trackers.iter().map(TaskTracker::len).sum();
    if open == 0 {
        return;
    }

    info!("Waiting up to {:?} for {} open connections", grace, open);
    let all_closed = async {
        for tracker in trackers {
            tracker.wait().await;
        }
    };
    if tokio::time::timeout(grace, all_closed).await.is_err() {
        let open: usize = trackers.iter().map(TaskTracker::len).sum();
        warn!("Dropping {} connections still open after {:?}", open, grace);
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
