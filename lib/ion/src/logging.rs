//! Logging bootstrap shared by all the positron crates. Components receive a
//! `Logger` from their creator and derive child loggers with key-value
//! context; library code handed no logger falls back to a discarding root.

pub use slog::{b, crit, debug, error, info, o, record, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_LOGGER_SPEC: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds the default root logger (terminal output on stderr, info level).
pub fn init() -> Logger {
    from_spec(DEFAULT_LOGGER_SPEC).expect("Default logger spec must be valid")
}

/// Builds a root logger from a TOML logger description understood by
/// `sloggers` (type/level/destination and friends).
pub fn from_spec(spec: &str) -> Result<Logger, String> {
    let config: LoggerConfig = serdeconv::from_toml_str(spec).map_err(|err| err.to_string())?;
    config.build_logger().map_err(|err| err.to_string())
}

/// Returns a logger that drops every record. Used for tests and for
/// components constructed without a parent logger.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger, falling back to the discarding root.
#[inline]
pub fn opt<'a, L: Into<Option<&'a Logger>>>(log: L) -> Logger {
    match log.into() {
        Some(log) => log.new(o!()),
        None => discard(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_spec_builds() {
        init();
    }

    #[test]
    fn test_bad_spec_is_an_error() {
        assert!(from_spec("type = \"carrier-pigeon\"").is_err());
    }

    #[test]
    fn test_opt_fallback() {
        let log = opt(None);
        trace!(log, "dropped");

        let root = init();
        let log = opt(&root);
        trace!(log, "forwarded");
    }
}
