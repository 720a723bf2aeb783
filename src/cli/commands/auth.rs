use super::validator_duration;
use crate::discovery::parse_host_port;
use clap::{builder::ValueParser, Arg, Command};

fn validator_host_port() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<String, String> {
        parse_host_port(value).map_err(|e| e.to_string())?;
        Ok(value.to_string())
    })
}

pub fn subcommand() -> Command {
    Command::new("auth")
        .about("Run the authentication gRPC service and register it for discovery")
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("50051")
                .env("AUTHMESH_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("advertise-address")
                .long("advertise-address")
                .help("host:port other services use to reach this instance")
                .env("AUTHMESH_ADVERTISE_ADDRESS")
                .required(true)
                .value_parser(validator_host_port()),
        )
        .arg(
            Arg::new("dsn")
                .short('d')
                .long("dsn")
                .help("Database connection string")
                .env("AUTHMESH_DSN")
                .required(true),
        )
        .arg(
            Arg::new("max-db-connections")
                .long("max-db-connections")
                .help("Maximum number of pooled database connections")
                .default_value("5")
                .env("AUTHMESH_MAX_DB_CONNECTIONS")
                .value_parser(clap::value_parser!(u32).range(1..)),
        )
        .arg(
            Arg::new("registry-url")
                .long("registry-url")
                .help("Consul agent URL, example: http://127.0.0.1:8500")
                .env("AUTHMESH_REGISTRY_URL")
                .required(true),
        )
        .arg(
            Arg::new("service-name")
                .long("service-name")
                .help("Logical name to register under")
                .default_value("auth-service")
                .env("AUTHMESH_SERVICE_NAME"),
        )
        .arg(
            Arg::new("instance-id")
                .long("instance-id")
                .help("Registration id (default: <service-name>-<ulid>)")
                .env("AUTHMESH_INSTANCE_ID"),
        )
        .arg(
            Arg::new("access-token-secret")
                .long("access-token-secret")
                .help("HMAC secret for access tokens")
                .env("AUTHMESH_ACCESS_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("refresh-token-secret")
                .long("refresh-token-secret")
                .help("HMAC secret for refresh tokens, must differ from the access secret")
                .env("AUTHMESH_REFRESH_TOKEN_SECRET")
                .hide_env_values(true)
                .required(true),
        )
        .arg(
            Arg::new("access-token-ttl")
                .long("access-token-ttl")
                .help("Access token lifetime")
                .default_value("15m")
                .env("AUTHMESH_ACCESS_TOKEN_TTL")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("refresh-token-ttl")
                .long("refresh-token-ttl")
                .help("Refresh token lifetime")
                .default_value("7d")
                .env("AUTHMESH_REFRESH_TOKEN_TTL")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("token-issuer")
                .long("token-issuer")
                .help("Issuer claim of issued tokens")
                .default_value("authmesh")
                .env("AUTHMESH_TOKEN_ISSUER"),
        )
        .arg(
            Arg::new("token-audience")
                .long("token-audience")
                .help("Audience claim of issued tokens")
                .default_value("authmesh")
                .env("AUTHMESH_TOKEN_AUDIENCE"),
        )
        .arg(
            Arg::new("health-interval")
                .long("health-interval")
                .help("Registry health check interval")
                .default_value("10s")
                .env("AUTHMESH_HEALTH_INTERVAL")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("health-timeout")
                .long("health-timeout")
                .help("Registry health check timeout")
                .default_value("5s")
                .env("AUTHMESH_HEALTH_TIMEOUT")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("deregister-after")
                .long("deregister-after")
                .help("Remove the registration after failing checks for this long")
                .default_value("1m")
                .env("AUTHMESH_DEREGISTER_AFTER")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("shutdown-grace")
                .long("shutdown-grace")
                .help("Time in-flight calls get to finish on shutdown")
                .default_value("10s")
                .env("AUTHMESH_SHUTDOWN_GRACE")
                .value_parser(validator_duration()),
        )
}
