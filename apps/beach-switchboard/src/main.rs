use anyhow::{Context, Result};
use beach_switchboard::{
    config::{Cli, Commands, RelayConfig},
    probe, serve,
    telemetry::Telemetry,
};
use clap::Parser;
use tokio::{net::TcpListener, signal, sync::oneshot};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Probe(args)) = cli.command {
        let _telemetry = Telemetry::init_probe()?;
        return probe::run_probe(args).await;
    }

    let telemetry = Telemetry::init_relay()?;
    let config = RelayConfig::try_from(cli.serve)?;
    info!(listen_addr = %config.listen_addr, "starting beach-switchboard");

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;

    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let mut server = tokio::spawn(serve(
        listener,
        config.clone(),
        telemetry.metrics_handle(),
        async move {
            let _ = stop_rx.await;
        },
    ));

    tokio::select! {
        joined = &mut server => {
            return joined.context("relay task failed")?;
        }
        _ = shutdown_signal() => {}
    }

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; draining connections"
    );
    let _ = stop_tx.send(());
    match tokio::time::timeout(config.shutdown_grace, &mut server).await {
        Ok(joined) => joined.context("relay task failed")??,
        Err(_) => {
            warn!("grace period elapsed with sockets still open");
            server.abort();
        }
    }
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
