mod election;
mod error;
mod identity;
mod inventory;
mod mutate;
mod reclaim;
mod server;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use allocator::Store;
use clap::Parser;
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::error::ControllerResult;
use crate::identity::PodIdentity;

/// Keep every NodePort Service inside its namespace's configured sub-range.
#[derive(Parser)]
#[command(name = "port-allocator", version)]
struct Cli {
    /// Path to the PEM certificate presented to the API server
    #[arg(long)]
    tls_cert_file: PathBuf,
    /// Path to the PEM private key
    #[arg(long)]
    tls_key_file: PathBuf,
    /// Port the webhook listens on
    #[arg(long, short = 'p', default_value_t = 443)]
    port: u16,
    /// Path to the per-namespace sub-range configuration
    #[arg(long, default_value = "port-range.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> ControllerResult<()> {
    let ranges = allocator::load(&cli.config).await?;
    info!(
        namespaces = ranges.len(),
        config = %cli.config.display(),
        "loaded sub-range configuration"
    );

    let client = Client::try_default().await?;

    let identity = PodIdentity::from_env()?;
    identity.confirm(client.clone()).await?;
    info!(pod = %identity.name, namespace = %identity.namespace, "resolved pod identity");

    let store = Arc::new(Store::new());
    for entry in &ranges {
        store.register_namespace(&entry.namespace, entry.range)?;
    }

    inventory::reconcile(client.clone(), &store).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (leader_tx, leader_rx) = watch::channel(false);

    // SIGINT/SIGTERM fan out to every task through the shutdown channel
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();
        tokio::select! {
            _ = recv_signal(&mut sigterm) => info!("received SIGTERM, shutting down"),
            _ = recv_signal(&mut sigint) => info!("received SIGINT, shutting down"),
        }
        let _ = shutdown_tx.send(true);
    });

    let mut tasks = reclaim::spawn(
        client.clone(),
        Arc::clone(&store),
        leader_rx.clone(),
        shutdown_rx.clone(),
    );

    let elector = election::Elector::new(client, &identity);
    tasks.spawn(elector.run(leader_tx, shutdown_rx.clone()));

    server::serve(
        server::ServerConfig {
            cert: cli.tls_cert_file,
            key: cli.tls_key_file,
            port: cli.port,
        },
        server::AppState {
            store: Arc::clone(&store),
            leader: leader_rx,
        },
        shutdown_rx,
    )
    .await?;

    // the webhook has drained; wait for the watcher, workers, and elector
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result {
            error!(error = %e, "background task panicked");
        }
    }

    info!("port allocator stopped");
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(sig) => {
            sig.recv().await;
        }
        None => std::future::pending::<()>().await,
    }
}
