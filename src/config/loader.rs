//! Configuration loading
//!
//! JSON file loading with environment overrides. Overrides use the
//! `RUST_TUNNEL_*` prefix and win over the file, which keeps container
//! deployments from templating the whole config for one knob.

use std::env;
use std::fs;
use std::path::Path;

use tracing::debug;

use crate::error::ConfigError;
use crate::tunnel::TunnelMode;

use super::types::Config;

/// Load a configuration file
///
/// # Errors
///
/// `FileNotFound` when the path does not exist, `ParseError` on bad
/// JSON, `ValidationError` on semantic problems.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let content = fs::read_to_string(path)?;
    let config: Config =
        serde_json::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    config.validate()?;
    debug!(path = %path.display(), rules = config.rules.len(), "configuration loaded");
    Ok(config)
}

/// Load a configuration file and apply `RUST_TUNNEL_*` overrides
///
/// # Errors
///
/// As [`load_config`], plus `ValidationError` for malformed override
/// values.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    config.validate()?;
    Ok(config)
}

fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(mode) = env::var("RUST_TUNNEL_MODE") {
        config.mode = match mode.to_ascii_lowercase().as_str() {
            "rule" => TunnelMode::Rule,
            "global" => TunnelMode::Global,
            "direct" => TunnelMode::Direct,
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "RUST_TUNNEL_MODE: unknown mode '{other}'"
                )))
            }
        };
    }

    if let Ok(value) = env::var("RUST_TUNNEL_SNIFFING") {
        config.sniffing_enable = parse_bool("RUST_TUNNEL_SNIFFING", &value)?;
    }

    if let Ok(value) = env::var("RUST_TUNNEL_DISABLE_IPV6") {
        config.dns.disable_ipv6 = parse_bool("RUST_TUNNEL_DISABLE_IPV6", &value)?;
    }

    Ok(())
}

fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::ValidationError(format!(
            "{name}: expected boolean, got '{other}'"
        ))),
    }
}

/// Default configuration as pretty JSON, for `--generate-config`
#[must_use]
pub fn default_config_json() -> String {
    serde_json::to_string_pretty(&Config::default()).expect("default config serializes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_load_missing_file() {
        let err = load_config("/nonexistent/config.json").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }

    #[test]
    fn test_load_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, "{ not json").unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_load_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        let mut file = fs::File::create(&path).unwrap();
        file.write_all(br#"{ "mode": "direct", "rules": ["MATCH,DIRECT"] }"#)
            .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.mode, TunnelMode::Direct);
        assert_eq!(config.rules.len(), 1);
    }

    #[test]
    fn test_default_config_round_trips() {
        let json = default_config_json();
        let config: Config = serde_json::from_str(&json).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_bool() {
        assert!(parse_bool("X", "true").unwrap());
        assert!(parse_bool("X", "1").unwrap());
        assert!(!parse_bool("X", "off").unwrap());
        assert!(parse_bool("X", "maybe").is_err());
    }
}
