//! Merging per-combination tables under short parameter columns.
//!
//! Every combination of a feature yields its own table. Merging prepends one
//! column per varying parameter so rows stay distinguishable. Those columns
//! get short aliases (`p0`, `p1`, ...) and an `aliases` table maps each
//! alias back to the full parameter name and its values. Parameters with the
//! same value in every combination are not columns at all: they go to the
//! shared attrs.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::params::ParameterCombination;
use crate::table::{Table, TableError};
use crate::value::{Attrs, Value};

/// Parameters with at most this many distinct values have them listed in
/// the aliases table.
pub const MAX_ENUMERATED_VALUES: usize = 32;

/// Alias column of the aliases table.
pub const ALIAS_COLUMN: &str = "alias";
/// Full parameter name column of the aliases table.
pub const NAME_COLUMN: &str = "name";
/// Parameter value column of the aliases table.
pub const VALUE_COLUMN: &str = "value";

/// A feature's combinations merged into one table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConcatenatedTable {
    /// Alias columns followed by the feature columns, rows of each
    /// combination in enumeration order.
    pub table: Table,
    /// `alias`, `name`, `value` rows.
    pub aliases: Table,
    /// Parameters shared by every combination.
    pub attrs: Attrs,
}

impl ConcatenatedTable {
    /// Full parameter name behind an alias.
    #[must_use]
    pub fn full_name(&self, alias: &str) -> Option<&str> {
        self.alias_rows()
            .find(|(a, _, _)| a.as_str() == Some(alias))
            .and_then(|(_, name, _)| name.as_str())
    }

    /// Alias assigned to a parameter.
    #[must_use]
    pub fn alias_of(&self, name: &str) -> Option<&str> {
        self.alias_rows()
            .find(|(_, n, _)| n.as_str() == Some(name))
            .and_then(|(alias, _, _)| alias.as_str())
    }

    /// Alias columns in table order.
    #[must_use]
    pub fn alias_columns(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.alias_rows()
            .filter_map(|(alias, _, _)| alias.as_str())
            .filter(|alias| seen.insert(*alias))
            .collect()
    }

    /// Resolves a cell of an alias column to the parameter name and value.
    ///
    /// Returns `None` for an unknown alias, or for a value that is not among
    /// the enumerated values of the parameter.
    #[must_use]
    pub fn resolve(&self, alias: &str, cell: &Value) -> Option<(String, Value)> {
        let mut enumerated = false;
        let mut name = None;
        for (a, n, value) in self.alias_rows() {
            if a.as_str() != Some(alias) {
                continue;
            }
            name = n.as_str();
            if value.is_null() && !cell.is_null() {
                // Too many values to enumerate, any cell is valid.
                continue;
            }
            enumerated = true;
            if same_value(value, cell) {
                return name.map(|n| (n.to_string(), cell.clone()));
            }
        }
        match (name, enumerated) {
            (Some(n), false) => Some((n.to_string(), cell.clone())),
            _ => None,
        }
    }

    fn alias_rows(&self) -> impl Iterator<Item = (&Value, &Value, &Value)> {
        let idx = |c| self.aliases.column_index(c);
        let cols = idx(ALIAS_COLUMN).zip(idx(NAME_COLUMN)).zip(idx(VALUE_COLUMN));
        self.aliases.rows().iter().filter_map(move |row| {
            let ((a, n), v) = cols?;
            Some((row.get(a)?, row.get(n)?, row.get(v)?))
        })
    }
}

/// Builds [`ConcatenatedTable`]s.
#[derive(Debug, Clone)]
pub struct Aliaser {
    prefix: String,
    max_enumerated: usize,
}

impl Default for Aliaser {
    fn default() -> Self {
        Self {
            prefix: "p".to_string(),
            max_enumerated: MAX_ENUMERATED_VALUES,
        }
    }
}

impl Aliaser {
    /// Aliases `p0`, `p1`, ... with at most [`MAX_ENUMERATED_VALUES`]
    /// values listed per parameter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `prefix` instead of `p` for alias names.
    #[must_use]
    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Lists at most `max` values per parameter in the aliases table.
    #[must_use]
    pub const fn with_max_enumerated(mut self, max: usize) -> Self {
        self.max_enumerated = max;
        self
    }

    /// Merges per-combination tables.
    ///
    /// `keys` orders the parameters (product keys, zip keys, then the
    /// rest); parameters not listed follow in name order. Aliases are
    /// assigned in that order, skipping any that clash with a feature
    /// column. A parameter missing from a combination is `Null` there.
    ///
    /// # Errors
    /// `TableError` if the tables do not share the same columns.
    pub fn merge(&self, parts: &[(ParameterCombination, Table)], keys: &[&str]) -> Result<ConcatenatedTable, TableError> {
        let Some((_, first)) = parts.first() else {
            return Ok(ConcatenatedTable {
                table: Table::default(),
                aliases: alias_table(Vec::new())?,
                attrs: Attrs::new(),
            });
        };
        let existing: HashSet<&str> = first.columns().iter().map(String::as_str).collect();

        let mut ordered: Vec<String> = keys.iter().map(|k| (*k).to_string()).collect();
        let mut extra: Vec<&String> = parts
            .iter()
            .flat_map(|(c, _)| c.params.keys())
            .filter(|k| !keys.contains(&k.as_str()))
            .collect();
        extra.sort();
        extra.dedup();
        ordered.extend(extra.into_iter().cloned());

        let mut attrs = Attrs::new();
        let mut varying: Vec<(String, String)> = Vec::new();
        let mut counter = 0usize;
        for key in ordered {
            let values: Vec<Option<&Value>> = parts.iter().map(|(c, _)| c.params.get(&key)).collect();
            let constant = values.iter().all(|v| match (v, values[0]) {
                (Some(a), Some(b)) => same_value(a, b),
                _ => false,
            });
            if constant {
                if let Some(Some(value)) = values.first() {
                    attrs.insert(key, (*value).clone());
                }
                continue;
            }
            let alias = loop {
                let candidate = format!("{}{counter}", self.prefix);
                counter += 1;
                if !existing.contains(candidate.as_str()) {
                    break candidate;
                }
            };
            varying.push((alias, key));
        }

        let alias_names: Vec<String> = varying.iter().map(|(a, _)| a.clone()).collect();
        let mut merged = Vec::with_capacity(parts.len());
        for (combination, table) in parts {
            let values: Vec<Value> = varying
                .iter()
                .map(|(_, key)| combination.params.get(key).cloned().unwrap_or(Value::Null))
                .collect();
            merged.push(table.with_leading_columns(&alias_names, &values)?);
        }
        let table = Table::concat(&merged)?;

        let mut rows = Vec::new();
        for (alias, key) in &varying {
            let mut distinct: Vec<Value> = Vec::new();
            for (c, _) in parts {
                let value = c.params.get(key).cloned().unwrap_or(Value::Null);
                if !distinct.iter().any(|d| same_value(d, &value)) {
                    distinct.push(value);
                }
            }
            if distinct.len() <= self.max_enumerated {
                for value in distinct {
                    rows.push(vec![Value::from(alias.as_str()), Value::from(key.as_str()), value]);
                }
            } else {
                rows.push(vec![Value::from(alias.as_str()), Value::from(key.as_str()), Value::Null]);
            }
        }

        Ok(ConcatenatedTable {
            table,
            aliases: alias_table(rows)?,
            attrs,
        })
    }
}

/// Equal under filter semantics (`1` and `1.0`), or identical encodings
/// (`NaN` and `NaN`).
fn same_value(a: &Value, b: &Value) -> bool {
    a.matches(b) || a.canonical() == b.canonical()
}

fn alias_table(rows: Vec<Vec<Value>>) -> Result<Table, TableError> {
    Table::from_rows([ALIAS_COLUMN, NAME_COLUMN, VALUE_COLUMN], rows)
}

/// Parameters of a merged row, resolved through its alias columns.
///
/// Useful for turning a row back into the combination it came from.
#[must_use]
pub fn row_params(merged: &ConcatenatedTable, row: usize) -> BTreeMap<String, Value> {
    let mut out: BTreeMap<String, Value> = merged.attrs.clone();
    for alias in merged.alias_columns() {
        if let Some(cell) = merged.table.get(row, alias) {
            if let Some((name, value)) = merged.resolve(alias, cell) {
                out.insert(name, value);
            }
        }
    }
    out
}
