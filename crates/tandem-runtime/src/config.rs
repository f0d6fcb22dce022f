#![forbid(unsafe_code)]

//! Loading [`HistoryConfig`] from TOML or JSON.
//!
//! ```toml
//! # tandem.toml
//! max_depth = 250
//! ```
//!
//! ```rust,ignore
//! let config = HistoryConfig::from_toml_file("tandem.toml")?;
//! let config = HistoryConfig::from_json_str(r#"{ "max_depth": 50 }"#)?;
//! ```
//!
//! Missing fields take their defaults, so an empty document yields
//! `HistoryConfig::default()`.

use std::path::Path;

use crate::undo::HistoryConfig;

/// Errors from loading a configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

impl HistoryConfig {
    /// Load from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        toml::from_str::<Self>(s)?.validated()
    }

    /// Load from a TOML file on disk.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&content)
    }

    /// Load from a JSON string.
    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        serde_json::from_str::<Self>(s)?.validated()
    }

    /// Load from a JSON file on disk.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&content)
    }

    /// Problems with the current values. Empty means valid.
    #[must_use]
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.max_depth == 0 {
            errors.push("max_depth must be > 0".into());
        }
        errors
    }

    fn validated(self) -> Result<Self, ConfigError> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(self)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_toml_is_default() {
        assert_eq!(HistoryConfig::from_toml_str("").unwrap(), HistoryConfig::default());
    }

    #[test]
    fn toml_overrides_depth() {
        let config = HistoryConfig::from_toml_str("max_depth = 7").unwrap();
        assert_eq!(config.max_depth, 7);
    }

    #[test]
    fn json_roundtrip() {
        let json = serde_json::to_string(&HistoryConfig::new(12)).unwrap();
        assert_eq!(HistoryConfig::from_json_str(&json).unwrap().max_depth, 12);
    }

    #[test]
    fn zero_depth_is_rejected() {
        let err = HistoryConfig::from_json_str(r#"{ "max_depth": 0 }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
        assert_eq!(err.to_string(), "invalid config: max_depth must be > 0");
    }

    #[test]
    fn malformed_toml_reports_parse_error() {
        let err = HistoryConfig::from_toml_str("max_depth = \"many\"").unwrap_err();
        assert!(matches!(err, ConfigError::Toml(_)));
    }

    #[test]
    fn loads_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_depth = 42").unwrap();
        let config = HistoryConfig::from_toml_file(file.path()).unwrap();
        assert_eq!(config.max_depth, 42);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = HistoryConfig::from_toml_file("/nonexistent/tandem.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io(_)));
    }
}
