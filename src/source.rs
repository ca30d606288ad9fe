//! Raw report sources.
//!
//! Reading simulation output is outside this crate. A [`ReportSource`]
//! turns one simulation's raw report into a table; the repository calls it
//! once per selected simulation and takes care of ids, ordering and caching.

use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::campaign::SimulationRow;
use crate::config::ReportConfig;
use crate::table::Table;

/// A source failed to produce a table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SourceError {
    message: String,
}

impl SourceError {
    /// Error with `message`.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Error message.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for SourceError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for SourceError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Extracts a report of one simulation.
///
/// Implementations must be deterministic for a given simulation and report:
/// cached repo tables are reused as long as the campaign and the report
/// config are unchanged.
pub trait ReportSource: Send + Sync {
    /// Returns the rows of `report` for `simulation`.
    fn extract(&self, simulation: &SimulationRow, report: &ReportConfig) -> Result<Table, SourceError>;
}

impl<F> ReportSource for F
where
    F: Fn(&SimulationRow, &ReportConfig) -> Result<Table, SourceError> + Send + Sync,
{
    fn extract(&self, simulation: &SimulationRow, report: &ReportConfig) -> Result<Table, SourceError> {
        self(simulation, report)
    }
}

/// Reads reports that were exported as JSON tables next to each simulation.
///
/// For a simulation at `sim/simulation_config.json` (or a directory `sim/`),
/// the `spikes` report is read from `sim/<subdir>/spikes.json`, where the
/// file holds `{"columns": [...], "rows": [[...], ...]}`.
#[derive(Debug, Clone, Default)]
pub struct JsonTableSource {
    subdir: Option<PathBuf>,
}

impl JsonTableSource {
    /// Source reading tables from the simulation directories.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads from `subdir` below each simulation directory.
    #[must_use]
    pub fn with_subdir(subdir: impl Into<PathBuf>) -> Self {
        Self {
            subdir: Some(subdir.into()),
        }
    }

    /// File a report of `simulation` is read from.
    #[must_use]
    pub fn report_path(&self, simulation: &SimulationRow, report: &ReportConfig) -> PathBuf {
        let sim_dir = if simulation.path.extension().is_some() {
            simulation.path.parent().unwrap_or_else(|| Path::new("."))
        } else {
            simulation.path.as_path()
        };
        let dir = match &self.subdir {
            Some(subdir) => sim_dir.join(subdir),
            None => sim_dir.to_path_buf(),
        };
        dir.join(format!("{}.json", report.name))
    }
}

impl ReportSource for JsonTableSource {
    fn extract(&self, simulation: &SimulationRow, report: &ReportConfig) -> Result<Table, SourceError> {
        let path = self.report_path(simulation, report);
        let text = fs::read_to_string(&path)
            .map_err(|e| SourceError::new(format!("cannot read {}: {e}", path.display())))?;
        serde_json::from_str(&text).map_err(|e| SourceError::new(format!("invalid table {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaign::SimulationCampaign;
    use crate::value::Value;
    use tempfile::tempdir;

    fn report(name: &str) -> ReportConfig {
        ReportConfig {
            report_type: "spikes".to_string(),
            name: name.to_string(),
        }
    }

    fn campaign(dir: &Path) -> SimulationCampaign {
        let text = r#"{
            "name": "c",
            "conditions": ["seed"],
            "data": [
                {"simulation_path": "a/simulation_config.json", "seed": 1},
                {"simulation_path": "b/simulation_config.json", "seed": 2}
            ]
        }"#;
        SimulationCampaign::from_json_str(text, dir).unwrap()
    }

    #[test]
    fn test_closure_source() {
        let dir = tempdir().unwrap();
        let campaign = campaign(dir.path());
        let source = |sim: &SimulationRow, _: &ReportConfig| -> Result<Table, SourceError> {
            Table::from_rows(["seed"], vec![vec![sim.condition("seed").cloned().unwrap_or_default()]])
                .map_err(|e| SourceError::new(e.to_string()))
        };

        let table = source.extract(&campaign[1], &report("spikes")).unwrap();
        assert_eq!(table.get(0, "seed"), Some(&Value::Int(2)));
    }

    #[test]
    fn test_json_table_source() {
        let dir = tempdir().unwrap();
        let campaign = campaign(dir.path());
        fs::create_dir_all(dir.path().join("a")).unwrap();
        fs::write(
            dir.path().join("a/spikes.json"),
            r#"{"columns": ["time", "gid"], "rows": [[0.5, 1], [1.5, 2]]}"#,
        )
        .unwrap();

        let source = JsonTableSource::new();
        let table = source.extract(&campaign[0], &report("spikes")).unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.columns(), ["time", "gid"]);

        let err = source.extract(&campaign[1], &report("spikes")).unwrap_err();
        assert!(err.message().contains("cannot read"));
    }

    #[test]
    fn test_json_table_source_subdir() {
        let dir = tempdir().unwrap();
        let campaign = campaign(dir.path());
        let source = JsonTableSource::with_subdir("reports");
        let path = source.report_path(&campaign[0], &report("soma"));
        assert!(path.ends_with("a/reports/soma.json"));
    }
}
