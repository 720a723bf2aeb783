use crate::cli::actions::{auth, gateway, Action};
use crate::discovery::{CheckStatus, HealthCheckSpec};
use anyhow::{anyhow, bail, Context, Result};
use clap::ArgMatches;
use secrecy::SecretString;
use std::time::Duration;
use ulid::Ulid;
use url::Url;

/// # Errors
/// Returns an error if required arguments are missing or inconsistent.
pub fn handler(matches: &ArgMatches) -> Result<Action> {
    match matches.subcommand() {
        Some(("auth", sub)) => auth_args(sub).map(Action::Auth),
        Some(("gateway", sub)) => gateway_args(sub).map(Action::Gateway),
        Some((name, _)) => bail!("unknown subcommand: {name}"),
        None => bail!("missing subcommand"),
    }
}

fn string(matches: &ArgMatches, name: &str) -> Result<String> {
    matches
        .get_one::<String>(name)
        .cloned()
        .with_context(|| format!("missing required argument: --{name}"))
}

fn duration(matches: &ArgMatches, name: &str) -> Result<Duration> {
    matches
        .get_one::<Duration>(name)
        .copied()
        .with_context(|| format!("missing required argument: --{name}"))
}

fn secret(matches: &ArgMatches, name: &str) -> Result<SecretString> {
    string(matches, name).map(SecretString::from)
}

/// Only postgres DSNs are accepted.
fn postgres_dsn(dsn: &str) -> Result<SecretString> {
    let parsed = Url::parse(dsn).map_err(|e| anyhow!("invalid --dsn: {e}"))?;
    match parsed.scheme() {
        "postgres" | "postgresql" => Ok(SecretString::from(dsn.to_string())),
        scheme => bail!("invalid --dsn: unsupported scheme {scheme}"),
    }
}

fn auth_args(matches: &ArgMatches) -> Result<auth::Args> {
    let service_name = string(matches, "service-name")?;
    let instance_id = matches
        .get_one::<String>("instance-id")
        .cloned()
        .unwrap_or_else(|| format!("{service_name}-{}", Ulid::new().to_string().to_lowercase()));

    let check = HealthCheckSpec {
        interval: duration(matches, "health-interval")?,
        timeout: duration(matches, "health-timeout")?,
        deregister_after: duration(matches, "deregister-after")?,
        initial_status: CheckStatus::Critical,
    };
    if check.timeout > check.interval {
        bail!("--health-timeout must not exceed --health-interval");
    }

    Ok(auth::Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(50051),
        advertise_address: string(matches, "advertise-address")?,
        dsn: postgres_dsn(&string(matches, "dsn")?)?,
        max_db_connections: matches
            .get_one::<u32>("max-db-connections")
            .copied()
            .unwrap_or(5),
        registry_url: string(matches, "registry-url")?,
        service_name,
        instance_id,
        access_token_secret: secret(matches, "access-token-secret")?,
        refresh_token_secret: secret(matches, "refresh-token-secret")?,
        access_token_ttl: duration(matches, "access-token-ttl")?,
        refresh_token_ttl: duration(matches, "refresh-token-ttl")?,
        token_issuer: string(matches, "token-issuer")?,
        token_audience: string(matches, "token-audience")?,
        check,
        shutdown_grace: duration(matches, "shutdown-grace")?,
    })
}

fn gateway_args(matches: &ArgMatches) -> Result<gateway::Args> {
    Ok(gateway::Args {
        port: matches.get_one::<u16>("port").copied().unwrap_or(8080),
        registry_url: string(matches, "registry-url")?,
        auth_service_name: string(matches, "auth-service-name")?,
        request_timeout: duration(matches, "request-timeout")?,
        shutdown_grace: duration(matches, "shutdown-grace")?,
        allowed_origin: matches.get_one::<String>("allowed-origin").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::commands;
    use secrecy::ExposeSecret;

    const AUTH_ENV: [(&str, Option<&str>); 7] = [
        ("AUTHMESH_ADVERTISE_ADDRESS", Some("auth-1.internal:50051")),
        ("AUTHMESH_DSN", Some("postgres://app:pw@db:5432/authmesh")),
        ("AUTHMESH_REGISTRY_URL", Some("http://consul:8500")),
        ("AUTHMESH_ACCESS_TOKEN_SECRET", Some("access-secret")),
        ("AUTHMESH_REFRESH_TOKEN_SECRET", Some("refresh-secret")),
        ("AUTHMESH_INSTANCE_ID", None),
        ("AUTHMESH_HEALTH_TIMEOUT", None),
    ];

    fn dispatch(args: &[&str]) -> Result<Action> {
        let matches = commands::new().try_get_matches_from(args)?;
        handler(&matches)
    }

    #[test]
    fn test_auth_action() {
        temp_env::with_vars(AUTH_ENV, || {
            let Ok(Action::Auth(args)) = dispatch(&["authmesh", "auth"]) else {
                panic!("expected auth action");
            };
            assert_eq!(args.port, 50051);
            assert_eq!(args.advertise_address, "auth-1.internal:50051");
            assert_eq!(args.dsn.expose_secret(), "postgres://app:pw@db:5432/authmesh");
            assert_eq!(args.max_db_connections, 5);
            assert!(args.instance_id.starts_with("auth-service-"));
            assert_eq!(args.check.interval, Duration::from_secs(10));
            assert_eq!(args.check.timeout, Duration::from_secs(5));
            assert_eq!(args.check.initial_status, CheckStatus::Critical);
            assert_eq!(args.shutdown_grace, Duration::from_secs(10));
        });
    }

    #[test]
    fn test_instance_ids_are_unique() {
        temp_env::with_vars(AUTH_ENV, || {
            let ids: Vec<String> = (0..2)
                .map(|_| match dispatch(&["authmesh", "auth"]) {
                    Ok(Action::Auth(args)) => args.instance_id,
                    other => panic!("unexpected {other:?}"),
                })
                .collect();
            assert_ne!(ids[0], ids[1]);
        });
    }

    #[test]
    fn test_explicit_instance_id() {
        temp_env::with_vars(AUTH_ENV, || {
            let Ok(Action::Auth(args)) =
                dispatch(&["authmesh", "auth", "--instance-id", "auth-blue-1"])
            else {
                panic!("expected auth action");
            };
            assert_eq!(args.instance_id, "auth-blue-1");
        });
    }

    #[test]
    fn test_rejects_non_postgres_dsn() {
        temp_env::with_vars(AUTH_ENV, || {
            let err = dispatch(&["authmesh", "auth", "--dsn", "mysql://db/authmesh"]).unwrap_err();
            assert!(err.to_string().contains("unsupported scheme mysql"));

            let err = dispatch(&["authmesh", "auth", "--dsn", "not a url"]).unwrap_err();
            assert!(err.to_string().contains("invalid --dsn"));
        });
    }

    #[test]
    fn test_rejects_timeout_longer_than_interval() {
        temp_env::with_vars(AUTH_ENV, || {
            let err = dispatch(&["authmesh", "auth", "--health-timeout", "30s"]).unwrap_err();
            assert!(err.to_string().contains("--health-timeout"));
        });
    }

    #[test]
    fn test_gateway_action() {
        temp_env::with_vars(
            [
                ("AUTHMESH_REGISTRY_URL", Some("http://consul:8500")),
                ("AUTHMESH_PORT", None),
            ],
            || {
                let Ok(Action::Gateway(args)) = dispatch(&[
                    "authmesh",
                    "gateway",
                    "--allowed-origin",
                    "https://app.example.com",
                ]) else {
                    panic!("expected gateway action");
                };
                assert_eq!(args.port, 8080);
                assert_eq!(args.auth_service_name, "auth-service");
                assert_eq!(args.request_timeout, Duration::from_secs(5));
                assert_eq!(args.allowed_origin.as_deref(), Some("https://app.example.com"));
            },
        );
    }
}
