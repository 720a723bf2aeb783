use super::{log_entries, wait_for_shutdown};
use crate::{
    discovery::ConsulRegistry,
    gateway::{self, SharedAuthClient},
    rpc::AuthServiceConnector,
};
use anyhow::Result;
use std::{sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::error;

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub registry_url: String,
    pub auth_service_name: String,
    pub request_timeout: Duration,
    pub shutdown_grace: Duration,
    pub allowed_origin: Option<String>,
}

/// Run the gateway until a shutdown signal arrives.
///
/// # Errors
/// Returns an error if the registry URL or the allowed origin is invalid, or
/// if the listener fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let registry = Arc::new(ConsulRegistry::new(&args.registry_url)?);
    let connector = Arc::new(
        AuthServiceConnector::new(registry, args.auth_service_name.clone())
            .with_timeout(args.request_timeout),
    );
    let client: SharedAuthClient = connector.clone();
    let app = gateway::app(client, args.allowed_origin.as_deref())?;

    let listener = TcpListener::bind(format!("[::]:{}", args.port)).await?;

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown().await {
            error!("Failed to listen for shutdown signals: {e}");
        }
        signal.cancel();
    });

    let result = gateway::serve(listener, app, shutdown, args.shutdown_grace).await;
    connector.close().await;
    result
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("registry_url", args.registry_url.clone()),
        ("auth_service_name", args.auth_service_name.clone()),
        (
            "request_timeout",
            humantime::format_duration(args.request_timeout).to_string(),
        ),
        (
            "shutdown_grace",
            humantime::format_duration(args.shutdown_grace).to_string(),
        ),
        (
            "allowed_origin",
            args.allowed_origin
                .clone()
                .unwrap_or_else(|| "none".to_string()),
        ),
    ];
    log_entries("Gateway configuration", &entries);
}
