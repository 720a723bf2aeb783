use super::validator_duration;
use clap::{Arg, Command};

pub fn subcommand() -> Command {
    Command::new("gateway")
        .about("Run the HTTP gateway in front of the authentication service")
        .arg(
            Arg::new("port")
                .short('p')
                .long("port")
                .help("Port to listen on")
                .default_value("8080")
                .env("AUTHMESH_PORT")
                .value_parser(clap::value_parser!(u16)),
        )
        .arg(
            Arg::new("registry-url")
                .long("registry-url")
                .help("Consul agent URL, example: http://127.0.0.1:8500")
                .env("AUTHMESH_REGISTRY_URL")
                .required(true),
        )
        .arg(
            Arg::new("auth-service-name")
                .long("auth-service-name")
                .help("Logical name the auth service registers under")
                .default_value("auth-service")
                .env("AUTHMESH_AUTH_SERVICE_NAME"),
        )
        .arg(
            Arg::new("request-timeout")
                .long("request-timeout")
                .help("Deadline for each call to the auth service, retries included")
                .default_value("5s")
                .env("AUTHMESH_REQUEST_TIMEOUT")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("shutdown-grace")
                .long("shutdown-grace")
                .help("Time in-flight requests get to finish on shutdown")
                .default_value("10s")
                .env("AUTHMESH_SHUTDOWN_GRACE")
                .value_parser(validator_duration()),
        )
        .arg(
            Arg::new("allowed-origin")
                .long("allowed-origin")
                .help("Browser origin allowed by CORS, example: https://app.example.com")
                .env("AUTHMESH_ALLOWED_ORIGIN"),
        )
}
