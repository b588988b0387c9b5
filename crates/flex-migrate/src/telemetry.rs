//! Logging setup.

use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::EnvFilter;

use crate::error::{MigrateError, Result};

fn level_for(verbosity: &str) -> Level {
    match verbosity.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Install the global subscriber.
///
/// `verbosity` is one of trace/debug/info/warn/error (default info) and
/// `format` is "json" or anything else for text. `RUST_LOG` overrides the
/// level when set.
pub fn init_tracing(verbosity: &str, format: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level_for(verbosity).as_str().to_ascii_lowercase()));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_target(false);

    let installed = if format == "json" {
        subscriber.json().try_init()
    } else {
        subscriber.try_init()
    };
    installed.map_err(|e| MigrateError::Config(format!("logging already initialized: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_parsing() {
        assert_eq!(level_for("DEBUG"), Level::DEBUG);
        assert_eq!(level_for("warn"), Level::WARN);
        assert_eq!(level_for("loud"), Level::INFO);
    }

    #[test]
    fn test_second_init_is_error() {
        // The first call may already fail if another test installed one.
        let _ = init_tracing("info", "text");
        assert!(init_tracing("info", "json").is_err());
    }
}
