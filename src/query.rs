//! Filter queries over named columns.
//!
//! The same query surface filters simulation campaigns and tables. A query
//! maps column names to predicates; a row matches when every predicate
//! holds. Referencing an unknown column is an error, never a silent no-op.
//!
//! JSON forms accepted by [`Query::from_json`]:
//!
//! ```text
//! {"seed": 1}                         equality
//! {"seed": [1, 2]}                    membership
//! {"seed": {"ge": 1, "lt": 10}}       operators, all must hold
//! {"stimulus": {"regex": "^sin_.*"}}  full-string regex match
//! ```

use std::cmp::Ordering;

use regex::Regex;

use crate::error::QueryError;
use crate::value::Value;

/// A single condition on one column.
#[derive(Debug, Clone)]
pub enum Predicate {
    /// Equal to the value.
    Eq(Value),
    /// Not equal to the value.
    Ne(Value),
    /// Less than the value.
    Lt(Value),
    /// At most the value.
    Le(Value),
    /// Greater than the value.
    Gt(Value),
    /// At least the value.
    Ge(Value),
    /// Equal to one of the values.
    IsIn(Vec<Value>),
    /// String matching the pattern.
    Regex(Regex),
    /// Conjunction of predicates.
    All(Vec<Predicate>),
}

impl Predicate {
    /// Parses the JSON form of a predicate for `key`.
    pub fn from_json(key: &str, value: &serde_json::Value) -> Result<Self, QueryError> {
        match value {
            serde_json::Value::Array(items) => Ok(Self::IsIn(
                items.iter().cloned().map(Value::from).collect(),
            )),
            serde_json::Value::Object(ops) => {
                let mut all = Vec::with_capacity(ops.len());
                for (op, operand) in ops {
                    all.push(Self::operator(key, op, operand)?);
                }
                Ok(Self::All(all))
            }
            scalar => Ok(Self::Eq(Value::from(scalar.clone()))),
        }
    }

    fn operator(key: &str, op: &str, operand: &serde_json::Value) -> Result<Self, QueryError> {
        let value = || Value::from(operand.clone());
        match op {
            "eq" => Ok(Self::Eq(value())),
            "ne" => Ok(Self::Ne(value())),
            "lt" => Ok(Self::Lt(value())),
            "le" => Ok(Self::Le(value())),
            "gt" => Ok(Self::Gt(value())),
            "ge" => Ok(Self::Ge(value())),
            "isin" => match operand {
                serde_json::Value::Array(items) => Ok(Self::IsIn(
                    items.iter().cloned().map(Value::from).collect(),
                )),
                _ => Err(QueryError::InvalidValue {
                    key: key.to_string(),
                    reason: "'isin' requires a list".to_string(),
                }),
            },
            "regex" => {
                let pattern = operand.as_str().ok_or_else(|| QueryError::InvalidValue {
                    key: key.to_string(),
                    reason: "'regex' requires a string".to_string(),
                })?;
                Self::regex(key, pattern)
            }
            other => Err(QueryError::InvalidOperator {
                key: key.to_string(),
                operator: other.to_string(),
            }),
        }
    }

    /// Builds a full-string regex predicate.
    pub fn regex(key: &str, pattern: &str) -> Result<Self, QueryError> {
        Regex::new(&format!("^(?:{pattern})$"))
            .map(Self::Regex)
            .map_err(|e| QueryError::InvalidRegex {
                key: key.to_string(),
                pattern: pattern.to_string(),
                message: e.to_string(),
            })
    }

    /// Returns true if `value` satisfies the predicate.
    #[must_use]
    pub fn test(&self, value: &Value) -> bool {
        match self {
            Self::Eq(v) => value.matches(v),
            Self::Ne(v) => !value.matches(v),
            Self::Lt(v) => value.compare(v) == Some(Ordering::Less),
            Self::Le(v) => matches!(value.compare(v), Some(Ordering::Less | Ordering::Equal)),
            Self::Gt(v) => value.compare(v) == Some(Ordering::Greater),
            Self::Ge(v) => matches!(value.compare(v), Some(Ordering::Greater | Ordering::Equal)),
            Self::IsIn(values) => values.iter().any(|v| value.matches(v)),
            Self::Regex(re) => value.as_str().is_some_and(|s| re.is_match(s)),
            Self::All(preds) => preds.iter().all(|p| p.test(value)),
        }
    }
}

/// Ordered mapping from column name to predicate.
#[derive(Debug, Clone, Default)]
pub struct Query {
    terms: Vec<(String, Predicate)>,
}

impl Query {
    /// Creates an empty query, which matches everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an equality term.
    #[must_use]
    pub fn eq(self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(key, Predicate::Eq(value.into()))
    }

    /// Adds a membership term.
    #[must_use]
    pub fn isin(self, key: impl Into<String>, values: Vec<Value>) -> Self {
        self.with(key, Predicate::IsIn(values))
    }

    /// Adds an arbitrary predicate.
    #[must_use]
    pub fn with(mut self, key: impl Into<String>, predicate: Predicate) -> Self {
        self.terms.push((key.into(), predicate));
        self
    }

    /// Parses a query from its JSON object form.
    pub fn from_json(value: &serde_json::Value) -> Result<Self, QueryError> {
        match value {
            serde_json::Value::Null => Ok(Self::new()),
            serde_json::Value::Object(map) => {
                let mut query = Self::new();
                for (key, term) in map {
                    query = query.with(key.clone(), Predicate::from_json(key, term)?);
                }
                Ok(query)
            }
            other => Err(QueryError::InvalidValue {
                key: String::new(),
                reason: format!("query must be an object, got {other}"),
            }),
        }
    }

    /// Parses a query from a JSON object map.
    pub fn from_map(map: &serde_json::Map<String, serde_json::Value>) -> Result<Self, QueryError> {
        let mut query = Self::new();
        for (key, term) in map {
            query = query.with(key.clone(), Predicate::from_json(key, term)?);
        }
        Ok(query)
    }

    /// Returns true if the query matches everything.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// Column names referenced by the query.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().map(|(k, _)| k.as_str())
    }

    /// Resolves every key against `columns`, returning the column positions.
    pub fn resolve(&self, columns: &[String]) -> Result<Vec<(usize, &Predicate)>, QueryError> {
        self.terms
            .iter()
            .map(|(key, pred)| {
                columns
                    .iter()
                    .position(|c| c == key)
                    .map(|idx| (idx, pred))
                    .ok_or_else(|| QueryError::UnknownKey {
                        key: key.clone(),
                        available: columns.to_vec(),
                    })
            })
            .collect()
    }
}

/// Tests a resolved query against one row.
pub(crate) fn row_matches(resolved: &[(usize, &Predicate)], row: &[Value]) -> bool {
    resolved
        .iter()
        .all(|(idx, pred)| row.get(*idx).is_some_and(|v| pred.test(v)))
}
