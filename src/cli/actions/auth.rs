use super::{log_entries, redact_dsn, wait_for_shutdown};
use crate::{
    auth::{AuthEngine, TokenConfig},
    discovery::{ConsulRegistry, HealthCheckSpec, ServiceRegistry},
    rpc,
    security::Argon2Hasher,
    store::PgCredentialStore,
    token::JwtAuthenticator,
};
use anyhow::{Context, Result};
use secrecy::{ExposeSecret, SecretString};
use std::{fmt::Display, sync::Arc, time::Duration};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug)]
pub struct Args {
    pub port: u16,
    pub advertise_address: String,
    pub dsn: SecretString,
    pub max_db_connections: u32,
    pub registry_url: String,
    pub service_name: String,
    pub instance_id: String,
    pub access_token_secret: SecretString,
    pub refresh_token_secret: SecretString,
    pub access_token_ttl: Duration,
    pub refresh_token_ttl: Duration,
    pub token_issuer: String,
    pub token_audience: String,
    pub check: HealthCheckSpec,
    pub shutdown_grace: Duration,
}

/// Run the auth service until a shutdown signal arrives.
///
/// Shutdown order: report NOT_SERVING, deregister, stop accepting, then give
/// in-flight calls the grace period.
///
/// # Errors
/// Returns an error if the database, the registry or the listener cannot be
/// set up, or if the server fails.
pub async fn execute(args: Args) -> Result<()> {
    log_startup_args(&args);

    let store = PgCredentialStore::connect(&args.dsn, args.max_db_connections)
        .await
        .context("Could not connect to the database")?;
    store
        .apply_schema()
        .await
        .context("Could not apply the database schema")?;

    let config = TokenConfig::new(args.access_token_secret, args.refresh_token_secret)
        .with_ttls(args.access_token_ttl, args.refresh_token_ttl)
        .with_identity(args.token_issuer.clone(), args.token_audience.clone());
    let engine = AuthEngine::new(
        Arc::new(store),
        Arc::new(Argon2Hasher::new()?),
        JwtAuthenticator::new(args.token_issuer, args.token_audience),
        config,
    )
    .context("Invalid token configuration")?;

    let registry = ConsulRegistry::new(&args.registry_url)?;

    let listener = TcpListener::bind(format!("[::]:{}", args.port)).await?;
    let (reporter, health) = tonic_health::server::health_reporter();
    rpc::mark_serving(&reporter).await;

    let shutdown = CancellationToken::new();
    let mut server = tokio::spawn(rpc::serve(
        listener,
        Arc::new(engine),
        health,
        shutdown.clone(),
        args.shutdown_grace,
    ));

    if let Err(e) = registry
        .register(
            &args.instance_id,
            &args.service_name,
            &args.advertise_address,
            &args.check,
        )
        .await
    {
        stop_server(&shutdown, server).await;
        return Err(e).context("Could not register with the service registry");
    }
    info!(
        instance_id = %args.instance_id,
        service = %args.service_name,
        "registered as {}",
        args.advertise_address
    );

    tokio::select! {
        result = wait_for_shutdown() => result?,
        result = &mut server => {
            error!("gRPC server exited before shutdown was requested");
            deregister(&registry, &args.instance_id, &args.service_name).await;
            result??;
            return Ok(());
        }
    }

    info!("shutting down");
    rpc::mark_not_serving(&reporter).await;
    deregister(&registry, &args.instance_id, &args.service_name).await;
    shutdown.cancel();
    server.await??;

    Ok(())
}

/// Cancels `server` and waits for it. Returns whether it stopped cleanly.
async fn stop_server<E: Display>(
    shutdown: &CancellationToken,
    server: JoinHandle<Result<(), E>>,
) -> bool {
    shutdown.cancel();
    match server.await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!("gRPC server failed while stopping: {e}");
            false
        }
        Err(e) => {
            warn!("gRPC server task did not finish: {e}");
            false
        }
    }
}

async fn deregister(registry: &ConsulRegistry, instance_id: &str, service_name: &str) {
    match registry.deregister(instance_id, service_name).await {
        Ok(()) => info!(instance_id, "deregistered"),
        Err(e) => warn!(instance_id, "Failed to deregister: {e}"),
    }
}

fn log_startup_args(args: &Args) {
    let entries = [
        ("listen", format!("tcp:{}", args.port)),
        ("advertise", args.advertise_address.clone()),
        ("dsn", redact_dsn(args.dsn.expose_secret())),
        ("max_db_connections", args.max_db_connections.to_string()),
        ("registry_url", args.registry_url.clone()),
        ("service_name", args.service_name.clone()),
        ("instance_id", args.instance_id.clone()),
        (
            "token_ttls",
            format!(
                "access {}, refresh {}",
                humantime::format_duration(args.access_token_ttl),
                humantime::format_duration(args.refresh_token_ttl)
            ),
        ),
        (
            "token_claims",
            format!("iss={} aud={}", args.token_issuer, args.token_audience),
        ),
        (
            "health_check",
            format!(
                "every {}, timeout {}, deregister after {}",
                humantime::format_duration(args.check.interval),
                humantime::format_duration(args.check.timeout),
                humantime::format_duration(args.check.deregister_after)
            ),
        ),
        (
            "shutdown_grace",
            humantime::format_duration(args.shutdown_grace).to_string(),
        ),
    ];
    log_entries("Auth service configuration", &entries);
}
