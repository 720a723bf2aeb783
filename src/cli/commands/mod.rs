mod auth;
mod gateway;

use clap::{
    builder::{
        styling::{AnsiColor, Effects, Styles},
        ValueParser,
    },
    Arg, ColorChoice, Command,
};
use std::time::Duration;

pub fn validator_log_level() -> ValueParser {
    ValueParser::from(move |level: &str| -> std::result::Result<u8, String> {
        if let Ok(parsed) = level.parse::<u8>() {
            if parsed <= 5 {
                return Ok(parsed);
            }
        }

        match level.to_lowercase().as_str() {
            "error" => Ok(0),
            "warn" => Ok(1),
            "info" => Ok(2),
            "debug" => Ok(3),
            "trace" => Ok(4),
            _ => Err("invalid log level".to_string()),
        }
    })
}

/// Accepts humantime durations such as `15m`, `7d` or `500ms`.
pub fn validator_duration() -> ValueParser {
    ValueParser::from(move |value: &str| -> std::result::Result<Duration, String> {
        let duration = humantime::parse_duration(value).map_err(|e| e.to_string())?;
        if duration.is_zero() {
            return Err("duration must be greater than zero".to_string());
        }
        Ok(duration)
    })
}

#[must_use]
pub fn new() -> Command {
    let styles = Styles::styled()
        .header(AnsiColor::Yellow.on_default() | Effects::BOLD)
        .usage(AnsiColor::Green.on_default() | Effects::BOLD)
        .literal(AnsiColor::Blue.on_default() | Effects::BOLD)
        .placeholder(AnsiColor::Green.on_default());

    let long_version: &'static str = Box::leak(
        format!("{} - {}", env!("CARGO_PKG_VERSION"), crate::GIT_COMMIT_HASH).into_boxed_str(),
    );

    Command::new("authmesh")
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .version(env!("CARGO_PKG_VERSION"))
        .long_version(long_version)
        .color(ColorChoice::Auto)
        .styles(styles)
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(auth::subcommand())
        .subcommand(gateway::subcommand())
        .arg(
            Arg::new("verbosity")
                .short('v')
                .long("verbose")
                .help("Verbosity level: ERROR, WARN, INFO, DEBUG, TRACE (default: ERROR)")
                .env("AUTHMESH_LOG_LEVEL")
                .global(true)
                .action(clap::ArgAction::Count)
                .value_parser(validator_log_level()),
        )
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUTH_ENV: [(&str, Option<&str>); 5] = [
        ("AUTHMESH_ADVERTISE_ADDRESS", Some("10.0.0.7:50051")),
        ("AUTHMESH_DSN", Some("postgres://authmesh@localhost:5432/authmesh")),
        ("AUTHMESH_REGISTRY_URL", Some("http://127.0.0.1:8500")),
        ("AUTHMESH_ACCESS_TOKEN_SECRET", Some("access-secret")),
        ("AUTHMESH_REFRESH_TOKEN_SECRET", Some("refresh-secret")),
    ];

    #[test]
    fn test_new() {
        let command = new();

        assert_eq!(command.get_name(), "authmesh");
        assert_eq!(
            command.get_about().unwrap().to_string(),
            env!("CARGO_PKG_DESCRIPTION")
        );
        assert_eq!(
            command.get_version().unwrap().to_string(),
            env!("CARGO_PKG_VERSION")
        );
        let subcommands: Vec<_> = command.get_subcommands().map(Command::get_name).collect();
        assert_eq!(subcommands, vec!["auth", "gateway"]);
    }

    #[test]
    fn test_auth_from_env() {
        temp_env::with_vars(AUTH_ENV, || {
            let matches = new().get_matches_from(vec!["authmesh", "auth"]);
            let (name, sub) = matches.subcommand().unwrap();
            assert_eq!(name, "auth");
            assert_eq!(sub.get_one::<u16>("port").copied(), Some(50051));
            assert_eq!(
                sub.get_one::<String>("advertise-address").map(String::as_str),
                Some("10.0.0.7:50051")
            );
            assert_eq!(
                sub.get_one::<Duration>("access-token-ttl").copied(),
                Some(Duration::from_secs(15 * 60))
            );
            assert_eq!(
                sub.get_one::<Duration>("refresh-token-ttl").copied(),
                Some(Duration::from_secs(7 * 24 * 60 * 60))
            );
            assert_eq!(
                sub.get_one::<Duration>("deregister-after").copied(),
                Some(Duration::from_secs(60))
            );
            assert_eq!(
                sub.get_one::<String>("service-name").map(String::as_str),
                Some("auth-service")
            );
            assert!(sub.get_one::<String>("instance-id").is_none());
        });
    }

    #[test]
    fn test_auth_rejects_bad_advertise_address() {
        temp_env::with_vars(AUTH_ENV, || {
            let result = new().try_get_matches_from(vec![
                "authmesh",
                "auth",
                "--advertise-address",
                "no-port",
            ]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_auth_rejects_bad_duration() {
        temp_env::with_vars(AUTH_ENV, || {
            let result = new().try_get_matches_from(vec![
                "authmesh",
                "auth",
                "--access-token-ttl",
                "soon",
            ]);
            assert!(result.is_err());

            let result =
                new().try_get_matches_from(vec!["authmesh", "auth", "--health-interval", "0s"]);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_auth_requires_secrets() {
        temp_env::with_vars(
            [
                ("AUTHMESH_ACCESS_TOKEN_SECRET", None::<&str>),
                ("AUTHMESH_REFRESH_TOKEN_SECRET", None),
            ],
            || {
                let result = new().try_get_matches_from(vec![
                    "authmesh",
                    "auth",
                    "--advertise-address",
                    "auth:50051",
                    "--dsn",
                    "postgres://localhost/authmesh",
                    "--registry-url",
                    "http://consul:8500",
                ]);
                assert!(result.is_err());
            },
        );
    }

    #[test]
    fn test_gateway_args() {
        temp_env::with_vars([("AUTHMESH_ALLOWED_ORIGIN", None::<&str>)], || {
            let matches = new().get_matches_from(vec![
                "authmesh",
                "gateway",
                "--registry-url",
                "http://consul:8500",
                "--request-timeout",
                "750ms",
            ]);
            let sub = matches.subcommand_matches("gateway").unwrap();
            assert_eq!(sub.get_one::<u16>("port").copied(), Some(8080));
            assert_eq!(
                sub.get_one::<String>("auth-service-name").map(String::as_str),
                Some("auth-service")
            );
            assert_eq!(
                sub.get_one::<Duration>("request-timeout").copied(),
                Some(Duration::from_millis(750))
            );
            assert!(sub.get_one::<String>("allowed-origin").is_none());
        });
    }

    #[test]
    fn test_check_log_level_env() {
        let levels = ["error", "warn", "info", "debug", "trace"];
        for (index, &level) in levels.iter().enumerate() {
            temp_env::with_vars(
                [
                    ("AUTHMESH_LOG_LEVEL", Some(level)),
                    ("AUTHMESH_REGISTRY_URL", Some("http://127.0.0.1:8500")),
                ],
                || {
                    let matches = new().get_matches_from(vec!["authmesh", "gateway"]);
                    assert_eq!(
                        matches.get_one::<u8>("verbosity").copied(),
                        Some(u8::try_from(index).unwrap())
                    );
                },
            );
        }
    }

    #[test]
    fn test_check_log_level_verbosity() {
        for index in 0..5_usize {
            temp_env::with_vars(
                [
                    ("AUTHMESH_LOG_LEVEL", None::<&str>),
                    ("AUTHMESH_REGISTRY_URL", Some("http://127.0.0.1:8500")),
                ],
                || {
                    let mut args = vec!["authmesh".to_string(), "gateway".to_string()];
                    if index > 0 {
                        args.push(format!("-{}", "v".repeat(index)));
                    }

                    let matches = new().get_matches_from(args);
                    assert_eq!(
                        matches.get_one::<u8>("verbosity").copied(),
                        Some(u8::try_from(index).unwrap())
                    );
                },
            );
        }
    }
}
