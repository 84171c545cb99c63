//! DevServer Operator
//!
//! Control plane for ephemeral development servers:
//! - DevServer: converges a StatefulSet, services, SSH config and host keys
//! - DevServerFlavor: keeps a single default and reports schedulability
//! - DevServerUser: provisions a namespace, RBAC and quota per user
//!
//! Expired and idle DevServers are retired by a periodic lifecycle sweep.

mod backoff;
mod config;
mod controller;
mod converger;
mod dispatcher;
mod drift;
mod error;
mod events;
mod flavor;
mod host_keys;
mod lifecycle;
mod schedulability;
mod synthesizer;
mod user;
mod watcher;

#[cfg(test)]
mod test_utils;

use crate::config::OperatorConfig;
use crate::controller::Controller;
use crate::error::ControllerError;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    // kube's rustls client needs a process-wide crypto provider
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        return Err(ControllerError::InvalidConfig(
            "a rustls crypto provider was already installed".to_string(),
        ));
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!("Starting DevServer operator");

    let config = Arc::new(OperatorConfig::load()?);
    info!("Configuration:");
    info!("  Watch namespace: {}", config.watch_namespace.as_deref().unwrap_or("all namespaces"));
    info!("  Worker limit: {}", config.worker_limit);
    info!("  Expiration interval: {:?}", config.expiration_interval());
    info!("  Flavor reconciliation interval: {:?}", config.flavor_reconciliation_interval());
    info!("  Event posting: {}", config.posting_enabled);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let controller = Controller::new(config, shutdown).await?;
    controller.run().await?;

    info!("DevServer operator stopped");
    Ok(())
}

/// Cancel `shutdown` on Ctrl-C or SIGTERM.
fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to register ctrl-c handler: {}", e);
                std::future::pending::<()>().await;
            }
        };

        let term = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sig) => {
                    sig.recv().await;
                }
                Err(e) => {
                    error!("Failed to register SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = term => info!("Received SIGTERM, shutting down"),
        }
        shutdown.cancel();
    });
}
