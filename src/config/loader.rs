/// Configuration loading from TOML file
use std::path::Path;
use tracing::info;

use crate::error::{GatewayError, Result};
use crate::types::Config;
use crate::utils::parse_timezone;

/// Environment variable naming an optional config file
pub const CONFIG_PATH_ENV: &str = "CONFIG_PATH";

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = std::fs::read_to_string(path.as_ref())
        .map_err(|e| GatewayError::ConfigError(format!("Failed to read config file: {}", e)))?;

    let config = parse_config(&content)?;
    info!("Loaded configuration from {}", path.as_ref().display());
    Ok(config)
}

/// Load from `CONFIG_PATH` when set, otherwise fall back to defaults
pub fn load_config_from_env() -> Result<Config> {
    match std::env::var(CONFIG_PATH_ENV) {
        Ok(path) if !path.trim().is_empty() => load_config(path.trim()),
        _ => {
            let config = Config::default();
            validate_config(&config)?;
            Ok(config)
        }
    }
}

fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content)
        .map_err(|e| GatewayError::ConfigError(format!("Failed to parse config: {}", e)))?;

    validate_config(&config)?;

    Ok(config)
}

pub fn validate_config(config: &Config) -> Result<()> {
    if config.gateway.host.trim().is_empty() {
        return Err(GatewayError::ConfigError("gateway.host is empty".to_string()));
    }

    if config.gateway.port == 0 {
        return Err(GatewayError::ConfigError("gateway.port must be non-zero".to_string()));
    }

    // Wait bounds of zero would return before any callback can arrive
    if config.requests.quote_wait_ms == 0 || config.requests.history_wait_ms == 0 {
        return Err(GatewayError::ConfigError(
            "requests.quote_wait_ms and requests.history_wait_ms must be > 0".to_string(),
        ));
    }

    parse_timezone(&config.requests.display_timezone)
        .map_err(|e| GatewayError::ConfigError(format!("requests.display_timezone: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MarketDataType;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = parse_config("").unwrap();
        assert_eq!(config.gateway.host, "localhost");
        assert_eq!(config.gateway.port, 4002);
        assert_eq!(config.gateway.client_id, 1);
        assert_eq!(config.requests.quote_wait_ms, 2_000);
        assert_eq!(config.requests.history_wait_ms, 10_000);
        assert_eq!(config.requests.market_data_type, MarketDataType::Live);
    }

    #[test]
    fn test_partial_override() {
        let config = parse_config(
            r#"
            log_level = "debug"

            [gateway]
            port = 7497
            client_id = 7

            [requests]
            market_data_type = "delayed_frozen"
            history_wait_ms = 30000
            "#,
        )
        .unwrap();

        assert_eq!(config.log_level, "debug");
        assert_eq!(config.gateway.host, "localhost");
        assert_eq!(config.gateway.port, 7497);
        assert_eq!(config.gateway.client_id, 7);
        assert_eq!(config.requests.market_data_type, MarketDataType::DelayedFrozen);
        assert_eq!(config.requests.history_wait_ms, 30_000);
        assert!(config.requests.cancel_quote_subscription);
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(parse_config("[gateway]\nport = 0").is_err());
        assert!(parse_config("[gateway]\nhost = \"\"").is_err());
        assert!(parse_config("[requests]\nquote_wait_ms = 0").is_err());
        assert!(parse_config("[requests]\ndisplay_timezone = \"Nowhere/Land\"").is_err());
        assert!(parse_config("[gateway]\nport = \"four\"").is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = load_config("/nonexistent/optionv1.toml");
        assert!(matches!(result, Err(GatewayError::ConfigError(_))));
    }
}
