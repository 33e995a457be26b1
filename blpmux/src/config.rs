// blpmux/src/config.rs
// Dispatcher configuration and process-wide logging setup.

use crate::base::BlpError;
use crate::error_set::ErrorBehaviour;
use crate::session::SessionOptions;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

/// Connection, pool and chunking limits.
///
/// Every field has a default, so a JSON file only needs the keys it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  pub host: String,
  pub port: u16,
  /// Upper bound on concurrent request sessions.
  pub max_sessions: usize,
  pub max_securities_per_request: usize,
  pub max_fields_per_request: usize,
  pub error_behaviour: ErrorBehaviour,
  /// `error`, `warn`, `info`, `debug`, `trace` or `off`.
  pub log_level: String,
}

impl Default for Config {
  fn default() -> Self {
    Config {
      host: "127.0.0.1".to_string(),
      port: 8194,
      max_sessions: 5,
      max_securities_per_request: 100,
      max_fields_per_request: 50,
      error_behaviour: ErrorBehaviour::Return,
      log_level: "warn".to_string(),
    }
  }
}

impl Config {
  pub fn from_json_str(json: &str) -> Result<Self, BlpError> {
    let config: Config = serde_json::from_str(json)
      .map_err(|e| BlpError::ConfigurationError(format!("invalid config: {}", e)))?;
    config.validate()?;
    Ok(config)
  }

  pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, BlpError> {
    let path = path.as_ref();
    let json = std::fs::read_to_string(path)
      .map_err(|e| BlpError::ConfigurationError(format!("cannot read {}: {}", path.display(), e)))?;
    Self::from_json_str(&json)
  }

  pub fn validate(&self) -> Result<(), BlpError> {
    if self.max_sessions == 0 {
      return Err(BlpError::ConfigurationError("max_sessions must be at least 1".into()));
    }
    if self.max_securities_per_request == 0 || self.max_fields_per_request == 0 {
      return Err(BlpError::ConfigurationError("chunk sizes must be at least 1".into()));
    }
    self.level_filter()?;
    Ok(())
  }

  pub fn session_options(&self) -> SessionOptions {
    SessionOptions { server_host: self.host.clone(), server_port: self.port }
  }

  pub fn level_filter(&self) -> Result<LevelFilter, BlpError> {
    LevelFilter::from_str(&self.log_level)
      .map_err(|_| BlpError::ConfigurationError(format!("unknown log level: {}", self.log_level)))
  }
}

/// Initialise `env_logger` at `level` unless `RUST_LOG` says otherwise.
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging(level: LevelFilter) {
  let env = env_logger::Env::default().default_filter_or(level.to_string().to_lowercase());
  if env_logger::Builder::from_env(env).format_timestamp_millis().try_init().is_err() {
    log::debug!("Logger already initialised");
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.port, 8194);
    assert_eq!(config.max_sessions, 5);
    assert_eq!(config.error_behaviour, ErrorBehaviour::Return);
    assert_eq!(config.level_filter().unwrap(), LevelFilter::Warn);
    assert_eq!(config.session_options(), SessionOptions::default());
  }

  #[test]
  fn test_partial_json_keeps_defaults() {
    let config = Config::from_json_str(r#"{"max_sessions": 2, "error_behaviour": "raise"}"#).unwrap();
    assert_eq!(config.max_sessions, 2);
    assert_eq!(config.error_behaviour, ErrorBehaviour::Raise);
    assert_eq!(config.max_fields_per_request, 50);
  }

  #[test]
  fn test_invalid_configs_are_rejected() {
    for json in [r#"{"max_sessions": 0}"#, r#"{"max_fields_per_request": 0}"#, r#"{"log_level": "loud"}"#, "not json"] {
      assert!(matches!(Config::from_json_str(json), Err(BlpError::ConfigurationError(_))), "{}", json);
    }
  }

  #[test]
  fn test_from_json_file() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{"host": "10.0.0.5", "port": 8195, "log_level": "debug"}}"#).unwrap();
    let config = Config::from_json_file(file.path()).unwrap();
    assert_eq!(config.session_options().server_host, "10.0.0.5");
    assert_eq!(config.session_options().server_port, 8195);
    assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);

    assert!(Config::from_json_file("/nonexistent/blpmux.json").is_err());
  }

  #[test]
  fn test_init_logging_twice() {
    init_logging(LevelFilter::Info);
    init_logging(LevelFilter::Debug);
  }
}
