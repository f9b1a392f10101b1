//! Runtime configuration for the meshplane library.
//!
//! The compiler itself takes no configuration beyond the IR; this module
//! holds the knobs for the ambient pieces, currently just logging.

use serde::{Deserialize, Serialize};

/// Observability configuration consumed by [`crate::observability`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObservabilityConfig {
    /// Log level filter, e.g. "info" or "meshplane=debug,warn".
    pub log_level: String,

    /// Emit JSON-formatted log lines instead of human-readable text.
    pub json_logs: bool,

    /// Service name attached to log output.
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logs: false,
            service_name: "meshplane".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ObservabilityConfig::default();
        assert_eq!(config.log_level, "info");
        assert!(!config.json_logs);
    }

    #[test]
    fn test_deserialize_camel_case() {
        let config: ObservabilityConfig =
            serde_json::from_str(r#"{"logLevel": "debug", "jsonLogs": true}"#).unwrap();
        assert_eq!(config.log_level, "debug");
        assert!(config.json_logs);
        assert_eq!(config.service_name, "meshplane");
    }
}
