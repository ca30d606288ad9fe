//! Error types for simetl.
//!
//! All errors are strongly typed using thiserror. Each stage of the pipeline
//! has its own enum so callers can match on the failure that matters to them,
//! and [`EtlError`] wraps them all at the facade level.

use std::path::PathBuf;

use thiserror::Error;

/// Malformed or schema-invalid configuration.
///
/// Fatal: surfaced immediately, no partial state is retained.
#[derive(Debug, Error)]
pub enum ConfigFormatError {
    #[error("Unsupported config version {found} (expected {expected})")]
    UnsupportedVersion {
        found: u32,
        expected: u32,
    },

    #[error("Failed to read config {path}: {message}")]
    Io {
        path: PathBuf,
        message: String,
    },

    #[error("Malformed config: {message}")]
    Malformed {
        message: String,
    },

    #[error("Required field '{field}' is missing")]
    MissingField {
        field: String,
    },

    #[error("Zipped parameter lists must have equal length ({details})")]
    ZipLengthMismatch {
        details: String,
    },

    #[error("Parameter '{name}' is declared in more than one section")]
    DuplicateParameter {
        name: String,
    },

    #[error("Parameter '{name}' has an empty value list")]
    EmptyParameterList {
        name: String,
    },

    #[error("Parameter '{name}' in {section} must be a list")]
    NotAList {
        name: String,
        section: &'static str,
    },

    #[error("Unknown function '{function}' for feature '{feature}'")]
    UnknownFunction {
        feature: String,
        function: String,
    },

    #[error("Feature '{feature}' depends on unknown feature '{dependency}'")]
    UnknownDependency {
        feature: String,
        dependency: String,
    },

    #[error("Feature dependency cycle through '{feature}'")]
    DependencyCycle {
        feature: String,
    },

    #[error("Duplicate feature name '{name}'")]
    DuplicateFeature {
        name: String,
    },

    #[error("Invalid simulation campaign: {reason}")]
    InvalidCampaign {
        reason: String,
    },
}

impl ConfigFormatError {
    pub(crate) fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
        }
    }

    pub(crate) fn campaign(reason: impl Into<String>) -> Self {
        Self::InvalidCampaign {
            reason: reason.into(),
        }
    }
}

/// A filter referenced something that does not exist or is not valid.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Unknown key '{key}' (available: {})", .available.join(", "))]
    UnknownKey {
        key: String,
        available: Vec<String>,
    },

    #[error("Invalid operator '{operator}' for key '{key}'")]
    InvalidOperator {
        key: String,
        operator: String,
    },

    #[error("Invalid regex '{pattern}' for key '{key}': {message}")]
    InvalidRegex {
        key: String,
        pattern: String,
        message: String,
    },

    #[error("Invalid value for key '{key}': {reason}")]
    InvalidValue {
        key: String,
        reason: String,
    },
}

/// A simulation's raw report could not be turned into a repo table.
///
/// Fatal for the extraction of that report only.
#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("Report '{report}' failed for simulation {simulation_id} ({path}): {message}")]
    Source {
        report: String,
        simulation_id: usize,
        path: PathBuf,
        message: String,
    },

    #[error(
        "Report '{report}' for simulation {simulation_id} has columns [{}], expected [{}]",
        .actual.join(", "),
        .expected.join(", ")
    )]
    ColumnMismatch {
        report: String,
        simulation_id: usize,
        expected: Vec<String>,
        actual: Vec<String>,
    },

    #[error("Report '{report}' is not configured")]
    UnknownReport {
        report: String,
    },

    #[error("Report '{report}' could not be extracted: {message}")]
    Cache {
        report: String,
        message: String,
    },
}

/// Failure of a single parameter combination.
///
/// Isolated: it never blocks sibling combinations or invalidates their
/// cache entries.
#[derive(Debug, Clone, Error)]
#[error("Feature '{feature}' combination '{combination}' failed: {message}")]
pub struct FeatureComputationError {
    /// Feature being computed.
    pub feature: String,
    /// Name of the failed combination.
    pub combination: String,
    /// Message returned by the function.
    pub message: String,
}

/// Errors raised while calculating a feature.
#[derive(Debug, Error)]
pub enum FeatureError {
    #[error(
        "{} combination(s) of feature '{feature}' failed: {}",
        .failures.len(),
        combination_names(.failures)
    )]
    Computation {
        feature: String,
        failures: Vec<FeatureComputationError>,
    },

    #[error("Feature '{feature}' could not be merged: {reason}")]
    Merge {
        feature: String,
        reason: String,
    },

    #[error("Unknown feature '{name}'")]
    UnknownFeature {
        name: String,
    },

    #[error("Extraction failed: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigFormatError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),
}

impl FeatureError {
    /// Returns the per-combination failures, if any.
    #[must_use]
    pub fn failures(&self) -> &[FeatureComputationError] {
        match self {
            Self::Computation { failures, .. } => failures,
            _ => &[],
        }
    }
}

fn combination_names(failures: &[FeatureComputationError]) -> String {
    failures
        .iter()
        .map(|f| f.combination.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cache I/O errors.
///
/// Treated as transient by the pipeline: corrupt reads become misses and
/// failed writes still return the computed value.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("Cache I/O error at {path}: {message}")]
    Io {
        path: PathBuf,
        message: String,
    },

    #[error("Corrupt cache entry {path}: {message}")]
    Corrupt {
        path: PathBuf,
        message: String,
    },

    #[error("Cache is read-only, cannot {operation}")]
    ReadOnly {
        operation: &'static str,
    },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, err: &std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }
}

/// Top-level error type for simetl.
#[derive(Debug, Error)]
pub enum EtlError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigFormatError),

    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    #[error("Extraction error: {0}")]
    Extraction(#[from] ExtractionError),

    #[error("Feature error: {0}")]
    Feature(#[from] FeatureError),

    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("No {kind} named '{name}'")]
    UnknownName {
        kind: &'static str,
        name: String,
    },
}

impl EtlError {
    /// Creates a lookup error for a missing registry entry.
    #[must_use]
    pub fn unknown(kind: &'static str, name: impl Into<String>) -> Self {
        Self::UnknownName {
            kind,
            name: name.into(),
        }
    }

    /// Returns true if this is a configuration error.
    #[must_use]
    pub const fn is_config(&self) -> bool {
        matches!(self, Self::Config(_))
    }

    /// Returns true if this is a query error.
    #[must_use]
    pub const fn is_query(&self) -> bool {
        matches!(self, Self::Query(_))
    }

    /// Returns true if this is an extraction error.
    #[must_use]
    pub const fn is_extraction(&self) -> bool {
        matches!(self, Self::Extraction(_))
    }

    /// Returns true if this is a feature error.
    #[must_use]
    pub const fn is_feature(&self) -> bool {
        matches!(self, Self::Feature(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Cache(e) => matches!(e, CacheError::Io { .. }),
            Self::Feature(FeatureError::Cache(CacheError::Io { .. })) => true,
            _ => false,
        }
    }
}

/// Result type alias for simetl operations.
pub type EtlResult<T> = Result<T, EtlError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zip_mismatch_message() {
        let err = ConfigFormatError::ZipLengthMismatch {
            details: "a=2, b=3".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("equal length"));
        assert!(msg.contains("b=3"));
    }

    #[test]
    fn test_unknown_key_lists_available() {
        let err = QueryError::UnknownKey {
            key: "stim".to_string(),
            available: vec!["seed".to_string(), "stimulus".to_string()],
        };
        let msg = format!("{err}");
        assert!(msg.contains("'stim'"));
        assert!(msg.contains("seed, stimulus"));
    }

    #[test]
    fn test_extraction_error_names_simulation() {
        let err = ExtractionError::Source {
            report: "spikes".to_string(),
            simulation_id: 3,
            path: PathBuf::from("/sims/3"),
            message: "missing output".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("simulation 3"));
        assert!(msg.contains("/sims/3"));
        assert!(msg.contains("missing output"));
    }

    #[test]
    fn test_feature_error_lists_failed_combinations() {
        let err = FeatureError::Computation {
            feature: "rates".to_string(),
            failures: vec![
                FeatureComputationError {
                    feature: "rates".to_string(),
                    combination: "rates_0".to_string(),
                    message: "boom".to_string(),
                },
                FeatureComputationError {
                    feature: "rates".to_string(),
                    combination: "rates_2".to_string(),
                    message: "boom".to_string(),
                },
            ],
        };
        let msg = format!("{err}");
        assert!(msg.contains("2 combination(s)"));
        assert!(msg.contains("rates_0, rates_2"));
        assert_eq!(err.failures().len(), 2);
    }

    #[test]
    fn test_etl_error_from_config() {
        let err: EtlError = ConfigFormatError::malformed("bad").into();
        assert!(err.is_config());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_etl_error_retryable() {
        let err: EtlError = CacheError::Io {
            path: PathBuf::from("/tmp/x"),
            message: "disk full".to_string(),
        }
        .into();
        assert!(err.is_retryable());

        let err: EtlError = QueryError::InvalidOperator {
            key: "seed".to_string(),
            operator: "between".to_string(),
        }
        .into();
        assert!(err.is_query());
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_unknown_name() {
        let err = EtlError::unknown("analysis", "spikes");
        assert_eq!(format!("{err}"), "No analysis named 'spikes'");
    }
}
