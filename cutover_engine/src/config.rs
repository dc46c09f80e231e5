//! Orchestrator options and their schema check.
//!
//! Options are plain serde structs with every field defaulted, so a YAML or
//! JSON document only needs to name what it changes:
//!
//! ```yaml
//! execution_id: release-1.4.0
//! timeout_ms: 600000
//! enabled_features: [github, changelog]
//! rollback:
//!   strategy: compensation
//!   max_retries: 2
//! ```

use crate::error::WorkflowError;
use crate::workflow::rollback::RollbackConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;
use uuid::Uuid;

static EXECUTION_ID_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,127}$").expect("Invalid execution id regex")
});

/// Upper bound for `rollback.max_retries`.
pub const MAX_ROLLBACK_RETRIES: u32 = 10;

/// Upper bound for `rollback.retry_delay_ms`.
pub const MAX_RETRY_DELAY_MS: u64 = 60_000;

/// Whether a skipped dependency lets its dependents run.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyPolicy {
    /// Skipped or bypassed dependencies count as satisfied
    #[default]
    SkippedSatisfies,
    /// A task whose dependency did not execute is skipped too
    SkippedBlocks,
}

/// Orchestrator-level options.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorOptions {
    /// Identifier stamped on the context and the audit trail
    pub execution_id: String,
    /// Undo completed tasks when a run fails
    pub enable_rollback: bool,
    /// Tasks see `is_dry_run() == true` and decide how to behave
    pub dry_run: bool,
    /// Run deadline, checked at task boundaries
    pub timeout_ms: Option<u64>,
    /// Enabled feature names; `None` disables feature filtering
    pub enabled_features: Option<Vec<String>>,
    /// Treatment of skipped dependencies
    pub dependency_policy: DependencyPolicy,
    /// Directory receiving `<run-id>.json` audit files
    pub audit_dir: Option<PathBuf>,
    /// Rollback strategy and retry policy
    pub rollback: RollbackConfig,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            enable_rollback: true,
            dry_run: false,
            timeout_ms: None,
            enabled_features: None,
            dependency_policy: DependencyPolicy::default(),
            audit_dir: None,
            rollback: RollbackConfig::default(),
        }
    }
}

impl OrchestratorOptions {
    /// Parses and validates options from YAML.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, WorkflowError> {
        let options: Self = serde_yaml::from_str(yaml)?;
        options.validate()?;
        Ok(options)
    }

    /// Reads, parses and validates options from a YAML file.
    pub async fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, WorkflowError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_yaml_str(&content)
    }

    /// Parses and validates options from JSON.
    pub fn from_json_str(json: &str) -> Result<Self, WorkflowError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    /// Checks the options against their schema.
    ///
    /// # Errors
    ///
    /// `WorkflowError::InvalidOptions` describing the first violation.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if !EXECUTION_ID_REGEX.is_match(&self.execution_id) {
            return Err(invalid(format!(
                "execution_id {:?} must be 1-128 characters of [A-Za-z0-9._-] starting with a letter or digit",
                self.execution_id
            )));
        }

        if let Some(features) = &self.enabled_features {
            let mut seen = HashSet::new();
            for feature in features {
                if feature.is_empty() || feature.chars().any(char::is_whitespace) {
                    return Err(invalid(format!(
                        "feature name {:?} must be non-empty without whitespace",
                        feature
                    )));
                }
                if !seen.insert(feature.as_str()) {
                    return Err(invalid(format!("feature {:?} is listed twice", feature)));
                }
            }
        }

        if self.timeout_ms == Some(0) {
            return Err(invalid("timeout_ms must be greater than zero".to_string()));
        }
        if self.rollback.max_retries > MAX_ROLLBACK_RETRIES {
            return Err(invalid(format!(
                "rollback.max_retries must be at most {}",
                MAX_ROLLBACK_RETRIES
            )));
        }
        if self.rollback.retry_delay_ms > MAX_RETRY_DELAY_MS {
            return Err(invalid(format!(
                "rollback.retry_delay_ms must be at most {}",
                MAX_RETRY_DELAY_MS
            )));
        }
        Ok(())
    }

    /// Returns the run deadline, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }

    /// Returns true if every feature in `required` is enabled.
    ///
    /// Always true when feature filtering is off.
    pub fn features_enabled(&self, required: &[String]) -> bool {
        match &self.enabled_features {
            Some(enabled) => required.iter().all(|feature| enabled.contains(feature)),
            None => true,
        }
    }
}

fn invalid(message: String) -> WorkflowError {
    WorkflowError::InvalidOptions(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::workflow::rollback::RollbackStrategy;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let options = OrchestratorOptions::default();

        assert!(options.enable_rollback);
        assert!(!options.dry_run);
        assert_eq!(options.rollback.strategy, RollbackStrategy::Reverse);
        assert!(options.rollback.continue_on_error);
        assert_eq!(options.dependency_policy, DependencyPolicy::SkippedSatisfies);
        options.validate().unwrap();
    }

    #[test]
    fn test_yaml_partial_document() {
        let options = OrchestratorOptions::from_yaml_str(
            r#"
execution_id: release-1.4.0
timeout_ms: 600000
enabled_features: [github, changelog]
dependency_policy: skipped-blocks
rollback:
  strategy: compensation
  max_retries: 2
"#,
        )
        .unwrap();

        assert_eq!(options.execution_id, "release-1.4.0");
        assert_eq!(options.timeout(), Some(Duration::from_secs(600)));
        assert_eq!(options.dependency_policy, DependencyPolicy::SkippedBlocks);
        assert_eq!(options.rollback.strategy, RollbackStrategy::Compensation);
        assert_eq!(options.rollback.max_retries, 2);
        assert!(options.rollback.continue_on_error);
        assert!(options.enable_rollback);
    }

    #[test]
    fn test_json_document() {
        let options =
            OrchestratorOptions::from_json_str(r#"{"execution_id": "r1", "enable_rollback": false}"#)
                .unwrap();
        assert!(!options.enable_rollback);
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = OrchestratorOptions::from_yaml_str("execution_id: r1\nretries: 3\n").unwrap_err();
        assert!(matches!(err, WorkflowError::Yaml(_)));
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_unknown_strategy_is_rejected() {
        let err = OrchestratorOptions::from_yaml_str("rollback:\n  strategy: sideways\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_schema_violations() {
        let cases = [
            OrchestratorOptions {
                execution_id: String::new(),
                ..Default::default()
            },
            OrchestratorOptions {
                execution_id: "-leading-dash".into(),
                ..Default::default()
            },
            OrchestratorOptions {
                execution_id: "has space".into(),
                ..Default::default()
            },
            OrchestratorOptions {
                enabled_features: Some(vec!["github".into(), "github".into()]),
                ..Default::default()
            },
            OrchestratorOptions {
                enabled_features: Some(vec!["two words".into()]),
                ..Default::default()
            },
            OrchestratorOptions {
                enabled_features: Some(vec![String::new()]),
                ..Default::default()
            },
            OrchestratorOptions {
                timeout_ms: Some(0),
                ..Default::default()
            },
            OrchestratorOptions {
                rollback: RollbackConfig {
                    max_retries: 11,
                    ..Default::default()
                },
                ..Default::default()
            },
            OrchestratorOptions {
                rollback: RollbackConfig {
                    retry_delay_ms: 60_001,
                    ..Default::default()
                },
                ..Default::default()
            },
        ];

        for options in cases {
            let err = options.validate().unwrap_err();
            assert!(
                matches!(err, WorkflowError::InvalidOptions(_)),
                "unexpected error for {:?}",
                options
            );
        }
    }

    #[test]
    fn test_long_execution_id() {
        let options = OrchestratorOptions {
            execution_id: "a".repeat(128),
            ..Default::default()
        };
        options.validate().unwrap();

        let options = OrchestratorOptions {
            execution_id: "a".repeat(129),
            ..Default::default()
        };
        assert!(options.validate().is_err());
    }

    #[test]
    fn test_feature_filtering() {
        let mut options = OrchestratorOptions::default();
        assert!(options.features_enabled(&["anything".into()]));

        options.enabled_features = Some(vec!["github".into()]);
        assert!(options.features_enabled(&[]));
        assert!(options.features_enabled(&["github".into()]));
        assert!(!options.features_enabled(&["github".into(), "npm".into()]));
    }

    #[tokio::test]
    async fn test_from_yaml_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("release.yaml");
        tokio::fs::write(&path, "execution_id: nightly\ndry_run: true\n")
            .await
            .unwrap();

        let options = OrchestratorOptions::from_yaml_file(&path).await.unwrap();
        assert_eq!(options.execution_id, "nightly");
        assert!(options.dry_run);

        let missing = OrchestratorOptions::from_yaml_file(temp_dir.path().join("missing.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(missing, WorkflowError::Io(_)));
    }
}
