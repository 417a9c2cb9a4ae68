//! Tracing initialisation.

use thiserror::Error;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Install a global fmt subscriber.
///
/// `RUST_LOG` wins when set; otherwise `default_level` is used as the filter.
pub fn init_tracing(default_level: &str) -> Result<(), TelemetryError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(default_level)?,
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| TelemetryError::Install(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bad_filter_is_reported() {
        // Only meaningful when RUST_LOG is not set for the test process.
        if std::env::var_os("RUST_LOG").is_none() {
            assert!(matches!(
                init_tracing("keel=notalevel"),
                Err(TelemetryError::Filter(_))
            ));
        }
    }
}
