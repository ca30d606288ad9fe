//! A small row-oriented table.
//!
//! Tables are the unit of data moving through the pipeline: raw reports,
//! repo tables, per-combination feature tables and merged tables. Metadata
//! never lives inside a table; it travels next to it as [`Attrs`](crate::Attrs).

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::QueryError;
use crate::query::{row_matches, Query};
use crate::value::Value;

/// Errors from building or combining tables.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TableError {
    #[error("Duplicate column '{0}'")]
    DuplicateColumn(String),

    #[error("Row has {actual} values, expected {expected}")]
    RowWidth {
        expected: usize,
        actual: usize,
    },

    #[error("Column sets differ: [{}] vs [{}]", .left.join(", "), .right.join(", "))]
    ColumnMismatch {
        left: Vec<String>,
        right: Vec<String>,
    },
}

/// Ordered columns and rows of values.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawTable")]
pub struct Table {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

#[derive(Deserialize)]
struct RawTable {
    columns: Vec<String>,
    rows: Vec<Vec<Value>>,
}

impl TryFrom<RawTable> for Table {
    type Error = TableError;

    fn try_from(raw: RawTable) -> Result<Self, Self::Error> {
        Self::from_rows(raw.columns, raw.rows)
    }
}

impl Table {
    /// A table with no columns and no rows.
    pub const EMPTY: Self = Self {
        columns: Vec::new(),
        rows: Vec::new(),
    };

    /// Creates an empty table with the given columns.
    pub fn new<I, S>(columns: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        let mut seen = HashSet::with_capacity(columns.len());
        for col in &columns {
            if !seen.insert(col.as_str()) {
                return Err(TableError::DuplicateColumn(col.clone()));
            }
        }
        Ok(Self {
            columns,
            rows: Vec::new(),
        })
    }

    /// Creates a table from columns and rows, validating row widths.
    pub fn from_rows<I, S>(columns: I, rows: Vec<Vec<Value>>) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::new(columns)?;
        for row in rows {
            table.push_row(row)?;
        }
        Ok(table)
    }

    /// Appends a row.
    pub fn push_row(&mut self, row: Vec<Value>) -> Result<(), TableError> {
        if row.len() != self.columns.len() {
            return Err(TableError::RowWidth {
                expected: self.columns.len(),
                actual: row.len(),
            });
        }
        self.rows.push(row);
        Ok(())
    }

    /// Number of rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Returns true if the table has no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Column names in order.
    #[must_use]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Rows in order.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Value>] {
        &self.rows
    }

    /// Row at `idx`.
    #[must_use]
    pub fn row(&self, idx: usize) -> Option<&[Value]> {
        self.rows.get(idx).map(Vec::as_slice)
    }

    /// Position of column `name`.
    #[must_use]
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c == name)
    }

    /// Returns every value of a column, in row order.
    #[must_use]
    pub fn column(&self, name: &str) -> Option<Vec<&Value>> {
        let idx = self.column_index(name)?;
        Some(self.rows.iter().map(|row| &row[idx]).collect())
    }

    /// Returns one cell.
    #[must_use]
    pub fn get(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).map(|r| &r[idx])
    }

    /// Distinct values of a column in first-seen order.
    #[must_use]
    pub fn distinct(&self, name: &str) -> Option<Vec<Value>> {
        let idx = self.column_index(name)?;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for row in &self.rows {
            if seen.insert(row[idx].canonical()) {
                out.push(row[idx].clone());
            }
        }
        Some(out)
    }

    /// Indices of rows matching `query`, in order.
    pub fn matching_rows(&self, query: &Query) -> Result<Vec<usize>, QueryError> {
        let resolved = query.resolve(&self.columns)?;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row_matches(&resolved, row))
            .map(|(idx, _)| idx)
            .collect())
    }

    /// Filtered copy keeping the original row order.
    pub fn query(&self, query: &Query) -> Result<Self, QueryError> {
        let ids = self.matching_rows(query)?;
        Ok(self.select_rows(&ids))
    }

    /// Copy containing the given rows; out-of-range indices are skipped.
    #[must_use]
    pub fn select_rows(&self, indices: &[usize]) -> Self {
        Self {
            columns: self.columns.clone(),
            rows: indices
                .iter()
                .filter_map(|&idx| self.rows.get(idx).cloned())
                .collect(),
        }
    }

    /// Returns a copy with constant columns prepended to every row.
    pub fn with_leading_columns(&self, names: &[String], values: &[Value]) -> Result<Self, TableError> {
        if names.len() != values.len() {
            return Err(TableError::RowWidth {
                expected: names.len(),
                actual: values.len(),
            });
        }
        let columns = names.iter().chain(self.columns.iter()).cloned();
        let mut out = Self::new(columns)?;
        out.rows = self
            .rows
            .iter()
            .map(|row| values.iter().chain(row.iter()).cloned().collect())
            .collect();
        Ok(out)
    }

    /// Concatenates tables sharing the same columns.
    ///
    /// An empty input yields an empty table with no columns.
    pub fn concat<'a, I>(tables: I) -> Result<Self, TableError>
    where
        I: IntoIterator<Item = &'a Table>,
    {
        let mut iter = tables.into_iter();
        let Some(first) = iter.next() else {
            return Ok(Self::default());
        };
        let mut out = first.clone();
        for table in iter {
            if table.columns != out.columns {
                return Err(TableError::ColumnMismatch {
                    left: out.columns.clone(),
                    right: table.columns.clone(),
                });
            }
            out.rows.extend(table.rows.iter().cloned());
        }
        Ok(out)
    }
}
