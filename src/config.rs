//! Engine Configuration
//!
//! Loads [`EngineConfig`] from YAML:
//!
//! ```yaml
//! diagnostics: strict
//! rollback_scope: resume
//! pause_ttl_ms: 86400000
//! session_store:
//!   kind: file
//!   dir: .recipeflow/sessions
//! ```
//!
//! Every field is optional; missing fields take their defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::diagnostics::DiagnosticsMode;
use crate::error::{EngineError, Result};
use crate::session::RollbackScope;

/// Backend for pause snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    #[default]
    Memory,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionStoreConfig {
    pub kind: SessionStoreKind,
    /// Snapshot directory, required for the file store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

/// Process-wide engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub diagnostics: DiagnosticsMode,
    pub rollback_scope: RollbackScope,
    /// Pause snapshot lifetime; no expiry when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause_ttl_ms: Option<u64>,
    pub session_store: SessionStoreConfig,
}

impl EngineConfig {
    /// Reads, parses and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading engine configuration from: {}", path.display());

        let text = fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!(
                "Failed to read configuration file '{}': {}",
                path.display(),
                e
            ))
        })?;
        debug!("Configuration loaded ({} bytes)", text.len());

        Self::from_yaml_str(&text)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.session_store.kind == SessionStoreKind::File && self.session_store.dir.is_none() {
            return Err(EngineError::Config(
                "session_store.dir is required when session_store.kind is 'file'".to_string(),
            ));
        }
        if self.pause_ttl_ms == Some(0) {
            return Err(EngineError::Config(
                "pause_ttl_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn pause_ttl(&self) -> Option<Duration> {
        self.pause_ttl_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EngineConfig::from_yaml_str("{}").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.diagnostics, DiagnosticsMode::Default);
        assert_eq!(config.rollback_scope, RollbackScope::Resume);
        assert!(config.pause_ttl().is_none());
    }

    #[test]
    fn test_full_config() {
        let yaml = r#"
diagnostics: strict
rollback_scope: run
pause_ttl_ms: 1500
session_store:
  kind: file
  dir: /tmp/sessions
"#;
        let config = EngineConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.diagnostics, DiagnosticsMode::Strict);
        assert_eq!(config.rollback_scope, RollbackScope::Run);
        assert_eq!(config.pause_ttl(), Some(Duration::from_millis(1500)));
        assert_eq!(config.session_store.kind, SessionStoreKind::File);
        assert_eq!(config.session_store.dir, Some(PathBuf::from("/tmp/sessions")));
    }

    #[test]
    fn test_file_store_requires_dir() {
        let err = EngineConfig::from_yaml_str("session_store:\n  kind: file\n").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }

    #[test]
    fn test_zero_ttl_rejected() {
        let err = EngineConfig::from_yaml_str("pause_ttl_ms: 0").unwrap_err();
        assert!(err.to_string().contains("pause_ttl_ms"));
    }

    #[test]
    fn test_unknown_mode_is_yaml_error() {
        let err = EngineConfig::from_yaml_str("diagnostics: loud").unwrap_err();
        assert!(matches!(err, EngineError::Yaml(_)));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "diagnostics: strict").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.diagnostics, DiagnosticsMode::Strict);
    }

    #[test]
    fn test_load_missing_file() {
        let err = EngineConfig::load("/nonexistent/recipeflow.yaml").unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
