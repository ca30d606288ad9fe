//! Analysis configuration.
//!
//! One JSON document describes a campaign, a cache directory and any number
//! of named analyses, each bound to one report and a list of features:
//!
//! ```json
//! {
//!   "version": 1,
//!   "simulation_campaign": "campaign.json",
//!   "output": "cache",
//!   "simulations_filter": {"seed": [1, 2]},
//!   "analysis": {
//!     "spikes": {
//!       "extraction": {"report": {"type": "spikes"}},
//!       "features": [
//!         {"name": "rates", "function": "mean_rate", "params_product": {"window": [0, 1]}}
//!       ]
//!     }
//!   }
//! }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ConfigFormatError, QueryError};
use crate::features::FeatureConfig;
use crate::pool::default_workers;
use crate::query::Query;

/// Supported analysis config version.
pub const CONFIG_VERSION: u32 = 1;

/// A raw report to extract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReportConfig {
    /// Kind of report, interpreted by the report source.
    #[serde(rename = "type")]
    pub report_type: String,
    /// Name the report is known by; defaults to its type.
    #[serde(default)]
    pub name: String,
}

impl ReportConfig {
    /// Report of `report_type`, named after its type.
    #[must_use]
    pub fn new(report_type: impl Into<String>) -> Self {
        let report_type = report_type.into();
        Self {
            name: report_type.clone(),
            report_type,
        }
    }

    /// Renames the report.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    fn normalize(&mut self) {
        if self.name.is_empty() {
            self.name = self.report_type.clone();
        }
    }
}

/// Reports extracted by one analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractionConfig {
    /// Report the analysis features are computed from.
    pub report: ReportConfig,
    /// Further reports extracted alongside, available to feature functions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reports: Vec<ReportConfig>,
}

impl ExtractionConfig {
    /// Extraction of a single report.
    #[must_use]
    pub fn new(report: ReportConfig) -> Self {
        Self {
            report,
            reports: Vec::new(),
        }
    }

    /// Primary report first, then the additional ones.
    #[must_use]
    pub fn all_reports(&self) -> Vec<ReportConfig> {
        std::iter::once(&self.report).chain(&self.reports).cloned().collect()
    }

    fn validate(&mut self) -> Result<(), ConfigFormatError> {
        self.report.normalize();
        self.reports.iter_mut().for_each(ReportConfig::normalize);
        let mut seen = HashSet::new();
        for report in std::iter::once(&self.report).chain(&self.reports) {
            if !seen.insert(report.name.as_str()) {
                return Err(ConfigFormatError::malformed(format!(
                    "report '{}' is declared more than once",
                    report.name
                )));
            }
        }
        Ok(())
    }
}

/// Configuration of one named analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SingleAnalysisConfig {
    /// Reports to extract.
    pub extraction: ExtractionConfig,
    /// Features computed from the main report.
    #[serde(default)]
    pub features: Vec<FeatureConfig>,
    /// Overrides keys of the global filter.
    #[serde(default)]
    pub simulations_filter: serde_json::Map<String, serde_json::Value>,
}

impl SingleAnalysisConfig {
    /// Analysis with no features.
    #[must_use]
    pub fn new(extraction: ExtractionConfig) -> Self {
        Self {
            extraction,
            features: Vec::new(),
            simulations_filter: serde_json::Map::new(),
        }
    }

    /// Appends a feature.
    #[must_use]
    pub fn with_feature(mut self, feature: FeatureConfig) -> Self {
        self.features.push(feature);
        self
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AnalysisConfig {
    /// Config format version; must be [`CONFIG_VERSION`].
    pub version: u32,
    /// Campaign description, relative to the config file.
    pub simulation_campaign: PathBuf,
    /// Cache directory, relative to the config file.
    pub output: PathBuf,
    /// Remove every cached table before loading.
    #[serde(default)]
    pub clear_cache: bool,
    /// Campaign query applied to every analysis.
    #[serde(default)]
    pub simulations_filter: serde_json::Map<String, serde_json::Value>,
    /// Worker threads; defaults to the available parallelism.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Extract every repo while loading.
    #[serde(default)]
    pub extract_on_load: bool,
    /// Calculate every feature while loading; implies extraction.
    #[serde(default)]
    pub calculate_on_load: bool,
    /// Named analyses.
    pub analysis: BTreeMap<String, SingleAnalysisConfig>,
}

impl AnalysisConfig {
    /// Creates a config with no analyses.
    #[must_use]
    pub fn new(simulation_campaign: impl Into<PathBuf>, output: impl Into<PathBuf>) -> Self {
        Self {
            version: CONFIG_VERSION,
            simulation_campaign: simulation_campaign.into(),
            output: output.into(),
            clear_cache: false,
            simulations_filter: serde_json::Map::new(),
            workers: None,
            extract_on_load: false,
            calculate_on_load: false,
            analysis: BTreeMap::new(),
        }
    }

    /// Adds or replaces the analysis `name`.
    #[must_use]
    pub fn with_analysis(mut self, name: impl Into<String>, analysis: SingleAnalysisConfig) -> Self {
        self.analysis.insert(name.into(), analysis);
        self
    }

    /// Reads and validates a config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFormatError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigFormatError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Self::from_json_str(&text)
    }

    /// Parses and validates a config document.
    ///
    /// The version is checked before anything else, so documents written
    /// for another version fail with `UnsupportedVersion` rather than a
    /// schema error.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigFormatError> {
        let raw: serde_json::Value =
            serde_json::from_str(text).map_err(|e| ConfigFormatError::malformed(e.to_string()))?;
        let version = raw
            .get("version")
            .ok_or_else(|| ConfigFormatError::MissingField {
                field: "version".to_string(),
            })?
            .as_u64()
            .ok_or_else(|| ConfigFormatError::malformed("version must be an integer"))?;
        if version != u64::from(CONFIG_VERSION) {
            return Err(ConfigFormatError::UnsupportedVersion {
                found: u32::try_from(version).unwrap_or(u32::MAX),
                expected: CONFIG_VERSION,
            });
        }

        let mut config: Self =
            serde_json::from_value(raw).map_err(|e| ConfigFormatError::malformed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the config and fills in defaults.
    pub fn validate(&mut self) -> Result<(), ConfigFormatError> {
        if self.version != CONFIG_VERSION {
            return Err(ConfigFormatError::UnsupportedVersion {
                found: self.version,
                expected: CONFIG_VERSION,
            });
        }
        if self.workers == Some(0) {
            return Err(ConfigFormatError::malformed("workers must be at least 1"));
        }
        for (name, analysis) in &mut self.analysis {
            if name.is_empty() {
                return Err(ConfigFormatError::malformed("analysis names must not be empty"));
            }
            analysis.extraction.validate()?;
            let mut seen = HashSet::new();
            for feature in &analysis.features {
                if !seen.insert(feature.name.as_str()) {
                    return Err(ConfigFormatError::DuplicateFeature {
                        name: feature.name.clone(),
                    });
                }
                feature.param_spec()?;
            }
        }
        Ok(())
    }

    /// Resolves relative paths against `base_dir`.
    #[must_use]
    pub fn resolved(mut self, base_dir: &Path) -> Self {
        if self.simulation_campaign.is_relative() {
            self.simulation_campaign = base_dir.join(&self.simulation_campaign);
        }
        if self.output.is_relative() {
            self.output = base_dir.join(&self.output);
        }
        self
    }

    /// Worker threads to use.
    #[must_use]
    pub fn workers(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }

    /// Filter of one analysis: its own keys override the global ones.
    pub fn simulations_filter(&self, analysis: &str) -> Result<Query, QueryError> {
        let mut merged = self.simulations_filter.clone();
        if let Some(single) = self.analysis.get(analysis) {
            for (key, value) in &single.simulations_filter {
                merged.insert(key.clone(), value.clone());
            }
        }
        Query::from_map(&merged)
    }

    /// Cache root of one analysis.
    #[must_use]
    pub fn cache_dir(&self, analysis: &str) -> PathBuf {
        self.output.join(analysis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "version": 1,
        "simulation_campaign": "campaign.json",
        "output": "out",
        "simulations_filter": {"seed": [1, 2], "stimulus": "a"},
        "analysis": {
            "spikes": {
                "extraction": {"report": {"type": "spikes"}},
                "features": [
                    {"name": "rates", "function": "mean_rate", "params_product": {"window": [0, 1]}}
                ],
                "simulations_filter": {"stimulus": "b"}
            }
        }
    }"#;

    #[test]
    fn test_parse_and_defaults() {
        let config = AnalysisConfig::from_json_str(CONFIG).unwrap();
        assert!(!config.clear_cache);
        assert!(config.workers() >= 1);
        let spikes = &config.analysis["spikes"];
        assert_eq!(spikes.extraction.report.name, "spikes");
        assert_eq!(spikes.features[0].name, "rates");
    }

    #[test]
    fn test_version_checked_first() {
        let err = AnalysisConfig::from_json_str(r#"{"version": 2, "bogus": true}"#).unwrap_err();
        assert!(matches!(
            err,
            ConfigFormatError::UnsupportedVersion { found: 2, expected: 1 }
        ));

        let err = AnalysisConfig::from_json_str(r#"{"output": "x"}"#).unwrap_err();
        assert!(matches!(err, ConfigFormatError::MissingField { .. }));
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let text = CONFIG.replace(
            "\"output\": \"out\",",
            "\"output\": \"out\", \"clear_cache_typo\": true,",
        );
        let err = AnalysisConfig::from_json_str(&text).unwrap_err();
        assert!(matches!(err, ConfigFormatError::Malformed { .. }));
    }

    #[test]
    fn test_duplicate_feature_rejected() {
        let text = CONFIG.replace(
            r#"{"name": "rates", "function": "mean_rate", "params_product": {"window": [0, 1]}}"#,
            r#"{"name": "rates", "function": "a"}, {"name": "rates", "function": "b"}"#,
        );
        let err = AnalysisConfig::from_json_str(&text).unwrap_err();
        assert!(matches!(err, ConfigFormatError::DuplicateFeature { .. }));
    }

    #[test]
    fn test_filter_override() {
        let config = AnalysisConfig::from_json_str(CONFIG).unwrap();
        let query = config.simulations_filter("spikes").unwrap();
        let keys: Vec<&str> = query.keys().collect();
        assert_eq!(keys, vec!["seed", "stimulus"]);

        let table = crate::table::Table::from_rows(
            ["seed", "stimulus"],
            vec![vec![1.into(), "a".into()], vec![1.into(), "b".into()]],
        )
        .unwrap();
        assert_eq!(table.matching_rows(&query).unwrap(), vec![1]);
    }

    #[test]
    fn test_resolved_paths() {
        let config = AnalysisConfig::from_json_str(CONFIG)
            .unwrap()
            .resolved(Path::new("/work"));
        assert_eq!(config.simulation_campaign, Path::new("/work/campaign.json"));
        assert_eq!(config.cache_dir("spikes"), Path::new("/work/out/spikes"));
    }

    #[test]
    fn test_duplicate_report_rejected() {
        let text = CONFIG.replace(
            r#"{"report": {"type": "spikes"}}"#,
            r#"{"report": {"type": "spikes"}, "reports": [{"type": "soma", "name": "spikes"}]}"#,
        );
        let err = AnalysisConfig::from_json_str(&text).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }
}
