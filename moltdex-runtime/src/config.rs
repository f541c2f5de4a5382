//! Indexer configuration
//!
//! Loaded from a TOML file. Every field has a default, so a missing
//! section (or an empty file) falls back to the stock settings.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use moltdex_core::{RuleSpec, SanitizeError, Sanitizer};
use moltdex_fetch::FetchConfig;

/// Errors from loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Sanitizer(#[from] SanitizeError),
}

/// Where snapshots are published
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub data_dir: PathBuf,
    /// Keep a copy of every published snapshot under `history/`
    pub keep_history: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            keep_history: true,
        }
    }
}

/// Extra redaction rules, applied after the built-in ones
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SanitizerConfig {
    pub rules: Vec<RuleSpec>,
}

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub api: FetchConfig,
    pub store: StoreConfig,
    pub sanitizer: SanitizerConfig,
}

impl IndexerConfig {
    pub fn from_toml_str(content: &str, path: &Path) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Load from `path`; the file must exist
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content, path)
    }

    /// Load from `path` if given, otherwise use defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    /// Built-in rules plus any configured extras
    pub fn sanitizer(&self) -> Result<Sanitizer, ConfigError> {
        Ok(Sanitizer::with_extra_rules(&self.sanitizer.rules)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = IndexerConfig::from_toml_str("", Path::new("empty.toml")).unwrap();
        assert_eq!(config, IndexerConfig::default());
        assert_eq!(config.store.data_dir, PathBuf::from("data"));
        assert!(config.store.keep_history);
    }

    #[test]
    fn test_partial_sections() {
        let toml = r#"
            [api]
            page_size = 25
            max_pages = 4

            [store]
            data_dir = "/var/lib/moltdex"

            [[sanitizer.rules]]
            name = "internal_token"
            pattern = "itk_[A-Za-z0-9]{24,}"
            replacement = "[REDACTED_TOKEN]"
        "#;
        let config = IndexerConfig::from_toml_str(toml, Path::new("moltdex.toml")).unwrap();

        assert_eq!(config.api.page_size, 25);
        assert_eq!(config.api.max_pages, 4);
        assert_eq!(config.api.max_retries, FetchConfig::default().max_retries);
        assert_eq!(config.store.data_dir, PathBuf::from("/var/lib/moltdex"));
        assert!(config.store.keep_history);
        assert_eq!(config.sanitizer.rules.len(), 1);

        let sanitizer = config.sanitizer().unwrap();
        assert_eq!(
            sanitizer.sanitize("itk_abcdefghijklmnopqrstuvwx1"),
            "[REDACTED_TOKEN]"
        );
    }

    #[test]
    fn test_bad_toml_names_the_file() {
        let err = IndexerConfig::from_toml_str("[api\npage_size = ", Path::new("broken.toml")).unwrap_err();
        assert!(err.to_string().contains("broken.toml"));
    }

    #[test]
    fn test_bad_rule_pattern() {
        let toml = r#"
            [[sanitizer.rules]]
            name = "oops"
            pattern = "[unterminated"
        "#;
        let config = IndexerConfig::from_toml_str(toml, Path::new("c.toml")).unwrap();
        assert!(matches!(config.sanitizer(), Err(ConfigError::Sanitizer(_))));
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let err = IndexerConfig::load_or_default(Some(Path::new("/nonexistent/moltdex.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
