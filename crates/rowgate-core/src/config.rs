//! Engine configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigurationError;
use crate::store::EnforcementMode;

/// Default batch size at which `filter_read` switches to parallel evaluation.
pub const DEFAULT_PARALLEL_THRESHOLD: usize = 1024;

/// Claim root that end users can edit about themselves.
pub const DEFAULT_UNTRUSTED_CLAIM_ROOT: &str = "user_metadata";

/// Policy engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Mode of collections that never had a mode set.
    pub default_mode: EnforcementMode,

    /// Batch size at or above which reads are filtered in parallel. 0 disables.
    pub parallel_threshold: usize,

    /// Log a warning when a command is locked out by having no policies.
    pub warn_on_lockout: bool,

    /// Log evaluation errors that were collapsed to a deny.
    pub log_evaluation_errors: bool,

    /// Claim roots sourced from self-editable profiles.
    pub untrusted_claim_roots: Vec<String>,
}

impl EngineConfig {
    /// Create a configuration with defaults.
    pub fn new() -> Self {
        Self {
            default_mode: EnforcementMode::Enabled,
            parallel_threshold: DEFAULT_PARALLEL_THRESHOLD,
            warn_on_lockout: true,
            log_evaluation_errors: true,
            untrusted_claim_roots: vec![DEFAULT_UNTRUSTED_CLAIM_ROOT.to_string()],
        }
    }

    /// Load a configuration from a JSON file. Missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigurationError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            ConfigurationError::Invalid(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ConfigurationError::Invalid(format!("cannot parse {}: {}", path.display(), e))
        })
    }

    /// Set the mode of collections without an explicit mode.
    pub fn with_default_mode(mut self, mode: EnforcementMode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Set the parallel filtering threshold.
    pub fn with_parallel_threshold(mut self, threshold: usize) -> Self {
        self.parallel_threshold = threshold;
        self
    }

    /// Never filter reads in parallel.
    pub fn without_parallelism(self) -> Self {
        self.with_parallel_threshold(0)
    }

    /// Enable or disable lockout warnings.
    pub fn with_lockout_warnings(mut self, enabled: bool) -> Self {
        self.warn_on_lockout = enabled;
        self
    }

    /// Enable or disable logging of collapsed evaluation errors.
    pub fn with_evaluation_error_logging(mut self, enabled: bool) -> Self {
        self.log_evaluation_errors = enabled;
        self
    }

    /// Replace the set of untrusted claim roots.
    pub fn with_untrusted_claim_roots<I, S>(mut self, roots: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.untrusted_claim_roots = roots.into_iter().map(Into::into).collect();
        self
    }

    /// Check if a batch of `rows` should be filtered in parallel.
    pub fn is_parallel(&self, rows: usize) -> bool {
        self.parallel_threshold > 0 && rows >= self.parallel_threshold
    }

    /// Check if a claim root is self-editable.
    pub fn is_untrusted_root(&self, root: &str) -> bool {
        self.untrusted_claim_roots.iter().any(|r| r == root)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_mode, EnforcementMode::Enabled);
        assert!(config.is_parallel(DEFAULT_PARALLEL_THRESHOLD));
        assert!(!config.is_parallel(DEFAULT_PARALLEL_THRESHOLD - 1));
        assert!(config.is_untrusted_root("user_metadata"));
        assert!(!config.is_untrusted_root("app_metadata"));
    }

    #[test]
    fn test_builder() {
        let config = EngineConfig::new()
            .with_default_mode(EnforcementMode::Forced)
            .without_parallelism()
            .with_lockout_warnings(false)
            .with_evaluation_error_logging(false)
            .with_untrusted_claim_roots(["profile"]);
        assert_eq!(config.default_mode, EnforcementMode::Forced);
        assert!(!config.is_parallel(1_000_000));
        assert!(!config.warn_on_lockout);
        assert!(!config.log_evaluation_errors);
        assert!(config.is_untrusted_root("profile"));
        assert!(!config.is_untrusted_root("user_metadata"));
    }

    #[test]
    fn test_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_mode": "forced", "parallel_threshold": 16}}"#).unwrap();

        let config = EngineConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.default_mode, EnforcementMode::Forced);
        assert_eq!(config.parallel_threshold, 16);
        assert!(config.warn_on_lockout);
    }

    #[test]
    fn test_from_json_file_errors() {
        let err = EngineConfig::from_json_file("/nonexistent/rowgate.json").unwrap_err();
        assert!(matches!(err, ConfigurationError::Invalid(_)));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"default_mode": "sometimes"}}"#).unwrap();
        assert!(EngineConfig::from_json_file(file.path()).is_err());
    }
}
