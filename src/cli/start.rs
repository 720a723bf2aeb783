use crate::cli::{actions::Action, commands, dispatch::handler, telemetry};
use anyhow::Result;
use tracing::Level;

fn verbosity(level: u8) -> Level {
    match level {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        3 => Level::DEBUG,
        _ => Level::TRACE,
    }
}

/// Parse arguments, install the subscriber, and build the action.
///
/// # Errors
/// Returns an error if telemetry cannot be initialized or the arguments are
/// inconsistent.
pub fn start() -> Result<Action> {
    let matches = commands::new().get_matches();

    let level = matches.get_one::<u8>("verbosity").map_or(0, |&v| v);
    telemetry::init(Some(verbosity(level)))?;

    handler(&matches)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_levels() {
        assert_eq!(verbosity(0), Level::ERROR);
        assert_eq!(verbosity(2), Level::INFO);
        assert_eq!(verbosity(9), Level::TRACE);
    }
}
