//! # Observability Infrastructure
//!
//! Structured logging for the meshplane core. Compilation and patching are
//! synchronous and CPU-bound, so logging is the only observability concern
//! carried here; callers embedding the library can layer their own exporters
//! on top of the `tracing` spans the builders and extenders emit.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Initialize the global tracing subscriber from the given configuration.
///
/// Honors `RUST_LOG` when set, falling back to the configured log level.
/// Returns an error if a global subscriber is already installed.
pub fn init_logging(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| Error::config(format!("invalid log filter '{}': {}", config.log_level, e)))?;

    let result = if config.json_logs {
        fmt().with_env_filter(filter).json().with_current_span(true).try_init()
    } else {
        fmt().with_env_filter(filter).try_init()
    };
    result.map_err(|e| Error::config(format!("failed to initialize logging: {}", e)))?;

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        json_logs = config.json_logs,
        "Logging initialized"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_logging() {
        let config = ObservabilityConfig::default();
        // May fail if another test installed a subscriber first; both are fine.
        let result = init_logging(&config);
        assert!(result.is_ok() || result.is_err());
    }

    #[test]
    fn test_invalid_filter_is_config_error() {
        let config = ObservabilityConfig {
            log_level: "not[a]filter=".to_string(),
            ..Default::default()
        };
        // Only meaningful when RUST_LOG is unset, so accept either outcome,
        // but a failure must be a Config error.
        if let Err(err) = init_logging(&config) {
            assert!(matches!(err, Error::Config(_)));
        }
    }
}
