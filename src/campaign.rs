//! Simulation campaigns.
//!
//! A campaign is an immutable, ordered set of simulation runs varying along
//! named conditions. It is loaded once from a JSON description and then only
//! queried.

use std::collections::HashSet;
use std::fs;
use std::ops::Index;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::cache::Fingerprint;
use crate::error::{ConfigFormatError, QueryError};
use crate::query::Query;
use crate::table::Table;
use crate::value::{Attrs, Value};

/// Supported campaign description version.
pub const CAMPAIGN_CONFIG_VERSION: u32 = 1;

/// Column holding the simulation index in campaign and repo tables.
pub const SIMULATION_ID: &str = "simulation_id";

/// Column and row key holding the simulation path.
pub const SIMULATION_PATH: &str = "simulation_path";

/// Attribute that relative simulation paths are resolved against.
pub const PATH_PREFIX: &str = "path_prefix";

/// Report-source protocol used by the simulations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SimulationFormat {
    /// SONATA simulations, described by a `*.json` config.
    Sonata,
    /// Legacy BlueConfig simulations.
    Bluepy,
}

impl SimulationFormat {
    fn detect(path: &Path) -> Self {
        if path.extension().is_some_and(|ext| ext == "json") {
            Self::Sonata
        } else {
            Self::Bluepy
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CampaignConfig {
    #[serde(default = "default_version")]
    version: u32,
    name: String,
    #[serde(default)]
    attrs: Attrs,
    #[serde(default)]
    coupled: bool,
    #[serde(default)]
    format: Option<SimulationFormat>,
    #[serde(default)]
    conditions: Option<Vec<String>>,
    data: Vec<serde_json::Map<String, serde_json::Value>>,
}

const fn default_version() -> u32 {
    CAMPAIGN_CONFIG_VERSION
}

/// One simulation of a campaign. Owned by its campaign and never mutated.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationRow {
    /// Position in the campaign, 0-based.
    pub index: usize,
    /// Location of the simulation's raw data.
    pub path: PathBuf,
    conditions: Vec<(String, Value)>,
}

impl SimulationRow {
    /// Value of a condition.
    #[must_use]
    pub fn condition(&self, name: &str) -> Option<&Value> {
        self.conditions.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Conditions in campaign order.
    pub fn conditions(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.conditions.iter().map(|(k, v)| (k.as_str(), v))
    }
}

/// Immutable, ordered collection of simulations.
#[derive(Debug, Clone)]
pub struct SimulationCampaign {
    name: String,
    attrs: Attrs,
    condition_names: Vec<String>,
    rows: Vec<SimulationRow>,
    coupled: bool,
    format: SimulationFormat,
}

impl SimulationCampaign {
    /// Loads a campaign from a JSON file.
    ///
    /// Relative simulation paths resolve against the `path_prefix` attribute
    /// or, without one, against the directory containing the file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigFormatError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ConfigFormatError::Io {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_json_str(&text, base_dir)
    }

    /// Parses a campaign from JSON text.
    pub fn from_json_str(text: &str, base_dir: &Path) -> Result<Self, ConfigFormatError> {
        let config: CampaignConfig =
            serde_json::from_str(text).map_err(|e| ConfigFormatError::malformed(e.to_string()))?;
        Self::from_config(config, base_dir)
    }

    fn from_config(config: CampaignConfig, base_dir: &Path) -> Result<Self, ConfigFormatError> {
        if config.version != CAMPAIGN_CONFIG_VERSION {
            return Err(ConfigFormatError::UnsupportedVersion {
                found: config.version,
                expected: CAMPAIGN_CONFIG_VERSION,
            });
        }

        let prefix = match config.attrs.get(PATH_PREFIX) {
            Some(Value::String(prefix)) => base_dir.join(prefix),
            Some(other) => {
                return Err(ConfigFormatError::campaign(format!(
                    "attribute '{PATH_PREFIX}' must be a string, got {}",
                    other.type_name()
                )))
            }
            None => base_dir.to_path_buf(),
        };

        let condition_names = match (&config.conditions, config.data.first()) {
            (Some(names), _) => names.clone(),
            (None, Some(first)) => first.keys().filter(|k| *k != SIMULATION_PATH).cloned().collect(),
            (None, None) => Vec::new(),
        };
        let mut unique = HashSet::new();
        for name in &condition_names {
            if name == SIMULATION_PATH || !unique.insert(name.as_str()) {
                return Err(ConfigFormatError::campaign(format!(
                    "invalid or repeated condition name '{name}'"
                )));
            }
        }

        let mut rows = Vec::with_capacity(config.data.len());
        for (index, mut record) in config.data.into_iter().enumerate() {
            let path = match record.remove(SIMULATION_PATH) {
                Some(serde_json::Value::String(p)) => prefix.join(p),
                Some(_) => {
                    return Err(ConfigFormatError::campaign(format!(
                        "simulation {index}: '{SIMULATION_PATH}' must be a string"
                    )))
                }
                None => {
                    return Err(ConfigFormatError::MissingField {
                        field: format!("data[{index}].{SIMULATION_PATH}"),
                    })
                }
            };
            if record.len() != condition_names.len()
                || condition_names.iter().any(|k| !record.contains_key(k))
            {
                let keys: Vec<&str> = record.keys().map(String::as_str).collect();
                return Err(ConfigFormatError::campaign(format!(
                    "simulation {index} has conditions [{}], expected [{}]",
                    keys.join(", "),
                    condition_names.join(", ")
                )));
            }
            let conditions = condition_names
                .iter()
                .map(|k| {
                    let value = record.remove(k).unwrap_or(serde_json::Value::Null);
                    (k.clone(), Value::from(value))
                })
                .collect();
            rows.push(SimulationRow {
                index,
                path,
                conditions,
            });
        }

        let format = match config.format {
            Some(format) => format,
            None => Self::detect_format(&rows)?,
        };

        let campaign = Self {
            name: config.name,
            attrs: config.attrs,
            condition_names,
            rows,
            coupled: config.coupled,
            format,
        };
        if !campaign.coupled {
            campaign.check_full_product()?;
        }
        Ok(campaign)
    }

    fn detect_format(rows: &[SimulationRow]) -> Result<SimulationFormat, ConfigFormatError> {
        let mut formats = rows.iter().map(|r| SimulationFormat::detect(&r.path));
        let Some(first) = formats.next() else {
            return Ok(SimulationFormat::Sonata);
        };
        if formats.any(|f| f != first) {
            return Err(ConfigFormatError::campaign(
                "simulations mix SONATA and BlueConfig paths",
            ));
        }
        Ok(first)
    }

    /// Uncoupled campaigns must cover the full cross product of their
    /// condition values, each tuple exactly once.
    fn check_full_product(&self) -> Result<(), ConfigFormatError> {
        if self.rows.is_empty() {
            return Ok(());
        }
        let mut tuples = HashSet::with_capacity(self.rows.len());
        for row in &self.rows {
            let key: Vec<String> = row.conditions.iter().map(|(_, v)| v.canonical()).collect();
            if !tuples.insert(key) {
                return Err(ConfigFormatError::campaign(format!(
                    "simulation {} repeats the conditions of an earlier simulation",
                    row.index
                )));
            }
        }
        let expected: usize = self
            .condition_names
            .iter()
            .map(|name| self.condition_values(name).map_or(0, |v| v.len()))
            .product();
        if expected != self.rows.len() {
            return Err(ConfigFormatError::campaign(format!(
                "uncoupled campaign has {} simulations but its conditions span {expected}; \
                 set \"coupled\": true for paired conditions",
                self.rows.len()
            )));
        }
        Ok(())
    }

    /// Campaign name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Campaign-level attributes.
    #[must_use]
    pub fn attrs(&self) -> &Attrs {
        &self.attrs
    }

    /// Number of simulations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the campaign has no simulations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Simulation at `index`.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&SimulationRow> {
        self.rows.get(index)
    }

    /// Simulations in index order.
    pub fn iter(&self) -> std::slice::Iter<'_, SimulationRow> {
        self.rows.iter()
    }

    /// Condition keys shared by every simulation, in declaration order.
    #[must_use]
    pub fn condition_names(&self) -> &[String] {
        &self.condition_names
    }

    /// Distinct values of a condition in first-seen order.
    #[must_use]
    pub fn condition_values(&self, name: &str) -> Option<Vec<Value>> {
        if !self.condition_names.iter().any(|c| c == name) {
            return None;
        }
        let mut seen = HashSet::new();
        Some(
            self.rows
                .iter()
                .filter_map(|r| r.condition(name))
                .filter(|v| seen.insert(v.canonical()))
                .cloned()
                .collect(),
        )
    }

    /// One row per simulation, one column per condition.
    #[must_use]
    pub fn conditions(&self) -> Table {
        let rows = self
            .rows
            .iter()
            .map(|r| r.conditions.iter().map(|(_, v)| v.clone()).collect())
            .collect();
        Table::from_rows(self.condition_names.iter().cloned(), rows).unwrap_or_default()
    }

    /// Simulation id, path and conditions of every simulation.
    #[must_use]
    pub fn to_table(&self) -> Table {
        let columns = [SIMULATION_ID.to_string(), SIMULATION_PATH.to_string()]
            .into_iter()
            .chain(self.condition_names.iter().cloned());
        let rows = self
            .rows
            .iter()
            .map(|r| {
                [
                    Value::from(r.index),
                    Value::from(r.path.to_string_lossy().into_owned()),
                ]
                .into_iter()
                .chain(r.conditions.iter().map(|(_, v)| v.clone()))
                .collect()
            })
            .collect();
        Table::from_rows(columns, rows).unwrap_or_default()
    }

    /// Indices of the simulations matching `query`, in campaign order.
    ///
    /// # Errors
    /// `QueryError::UnknownKey` if the query names something that is not a
    /// condition.
    pub fn ids(&self, query: &Query) -> Result<Vec<usize>, QueryError> {
        self.conditions().matching_rows(query)
    }

    /// Tabular view of the simulations matching `query`.
    pub fn get_filtered(&self, query: &Query) -> Result<Table, QueryError> {
        let ids = self.ids(query)?;
        Ok(self.to_table().select_rows(&ids))
    }

    /// Returns true for coupled campaigns.
    #[must_use]
    pub const fn is_coupled(&self) -> bool {
        self.coupled
    }

    /// Returns true for SONATA campaigns.
    #[must_use]
    pub fn is_sonata(&self) -> bool {
        self.format == SimulationFormat::Sonata
    }

    /// Simulation format of the campaign.
    #[must_use]
    pub const fn format(&self) -> SimulationFormat {
        self.format
    }

    /// Dumps the campaign back to its description format.
    #[must_use]
    pub fn to_json_value(&self) -> serde_json::Value {
        let data: Vec<serde_json::Value> = self
            .rows
            .iter()
            .map(|r| {
                let mut record = serde_json::Map::new();
                record.insert(
                    SIMULATION_PATH.to_string(),
                    serde_json::Value::String(r.path.to_string_lossy().into_owned()),
                );
                for (k, v) in &r.conditions {
                    record.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(record)
            })
            .collect();
        let attrs: serde_json::Map<String, serde_json::Value> =
            self.attrs.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        serde_json::json!({
            "version": CAMPAIGN_CONFIG_VERSION,
            "name": self.name,
            "attrs": attrs,
            "coupled": self.coupled,
            "format": self.format,
            "conditions": self.condition_names,
            "data": data,
        })
    }

    /// Stable identity of the campaign's content.
    #[must_use]
    pub fn checksum(&self) -> Fingerprint {
        Fingerprint::of_json(&self.to_json_value())
    }
}

impl Index<usize> for SimulationCampaign {
    type Output = SimulationRow;

    fn index(&self, index: usize) -> &Self::Output {
        &self.rows[index]
    }
}

impl<'a> IntoIterator for &'a SimulationCampaign {
    type Item = &'a SimulationRow;
    type IntoIter = std::slice::Iter<'a, SimulationRow>;

    fn into_iter(self) -> Self::IntoIter {
        self.rows.iter()
    }
}
