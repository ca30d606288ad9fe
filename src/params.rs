//! Parameter specs and their expansion into named combinations.
//!
//! A [`ParamSpec`] has three sections:
//! - `params`: base values shared by every combination;
//! - `params_product`: lists whose cartesian product is enumerated, first
//!   declared list outermost;
//! - `params_zip`: equal-length lists walked in lockstep, innermost.
//!
//! Expansion is a pure function of the spec: the same spec always yields the
//! same combinations, in the same order, with the same names.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::cache::Fingerprint;
use crate::error::ConfigFormatError;
use crate::value::Value;

/// One resolved assignment of values to a feature's parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterCombination {
    /// Generated name, e.g. `rates_0_1__2`.
    pub name: String,
    /// Base, product and zip values merged together.
    pub params: BTreeMap<String, Value>,
    /// Position along each product axis, in declaration order.
    pub product_indices: Vec<usize>,
    /// Position within the zip group, if there is one.
    pub zip_index: Option<usize>,
}

impl ParameterCombination {
    /// Value of one parameter.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.params.get(name)
    }

    /// Content key of the resolved parameters.
    ///
    /// Unlike the name, it does not depend on where the combination sits in
    /// the expansion, so inserting, removing or reordering sibling values
    /// leaves it unchanged.
    #[must_use]
    pub fn cache_key(&self) -> String {
        let params: serde_json::Map<String, serde_json::Value> =
            self.params.iter().map(|(k, v)| (k.clone(), v.to_json())).collect();
        let fingerprint = Fingerprint::builder("params")
            .part("params", &serde_json::Value::Object(params))
            .finish();
        fingerprint.as_str()[..16].to_string()
    }
}

/// Declarative parameter spec with declaration order preserved.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParamSpec {
    params: Vec<(String, Value)>,
    product: Vec<(String, Vec<Value>)>,
    zip: Vec<(String, Vec<Value>)>,
}

impl ParamSpec {
    /// Spec with no parameters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a base parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    /// Adds a product axis.
    #[must_use]
    pub fn product(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.product.push((name.into(), values));
        self
    }

    /// Adds a list to the zip group.
    #[must_use]
    pub fn zip(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.zip.push((name.into(), values));
        self
    }

    /// Builds a spec from the three JSON sections of a feature config.
    ///
    /// Product and zip entries must be lists.
    pub fn from_json_maps(
        params: &serde_json::Map<String, serde_json::Value>,
        product: &serde_json::Map<String, serde_json::Value>,
        zip: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<Self, ConfigFormatError> {
        fn lists(
            map: &serde_json::Map<String, serde_json::Value>,
            section: &'static str,
        ) -> Result<Vec<(String, Vec<Value>)>, ConfigFormatError> {
            map.iter()
                .map(|(name, value)| match value {
                    serde_json::Value::Array(items) => Ok((
                        name.clone(),
                        items.iter().cloned().map(Value::from).collect(),
                    )),
                    _ => Err(ConfigFormatError::NotAList {
                        name: name.clone(),
                        section,
                    }),
                })
                .collect()
        }

        Ok(Self {
            params: params
                .iter()
                .map(|(k, v)| (k.clone(), Value::from(v.clone())))
                .collect(),
            product: lists(product, "params_product")?,
            zip: lists(zip, "params_zip")?,
        })
    }

    /// Returns true if no parameter is declared.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.params.is_empty() && self.product.is_empty() && self.zip.is_empty()
    }

    /// Product keys then zip keys, in declaration order.
    #[must_use]
    pub fn varying_keys(&self) -> Vec<&str> {
        self.product
            .iter()
            .chain(self.zip.iter())
            .map(|(k, _)| k.as_str())
            .collect()
    }

    /// Every key: product, zip, then base, in declaration order.
    #[must_use]
    pub fn all_keys(&self) -> Vec<&str> {
        let mut keys = self.varying_keys();
        keys.extend(self.params.iter().map(|(k, _)| k.as_str()));
        keys
    }

    /// Number of combinations the spec expands to, without validating it.
    #[must_use]
    pub fn combination_count(&self) -> usize {
        let product: usize = self.product.iter().map(|(_, v)| v.len()).product();
        let zip = self.zip.first().map_or(1, |(_, v)| v.len());
        product * zip
    }

    /// JSON rendering that keeps section order significant.
    ///
    /// Product and zip sections are arrays of `[name, values]` pairs because
    /// their order decides enumeration order and names.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        let pairs = |section: &[(String, Vec<Value>)]| {
            serde_json::Value::Array(
                section
                    .iter()
                    .map(|(k, v)| {
                        serde_json::json!([k, v.iter().map(Value::to_json).collect::<Vec<_>>()])
                    })
                    .collect(),
            )
        };
        serde_json::json!({
            "params": self
                .params
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect::<serde_json::Map<_, _>>(),
            "params_product": pairs(&self.product),
            "params_zip": pairs(&self.zip),
        })
    }

    /// Stable identity of the whole spec.
    #[must_use]
    pub fn checksum(&self) -> Fingerprint {
        Fingerprint::of_json(&self.to_json())
    }

    fn validate(&self) -> Result<(), ConfigFormatError> {
        let mut seen = HashSet::new();
        let names = self
            .params
            .iter()
            .map(|(k, _)| k)
            .chain(self.product.iter().map(|(k, _)| k))
            .chain(self.zip.iter().map(|(k, _)| k));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(ConfigFormatError::DuplicateParameter { name: name.clone() });
            }
        }

        for (name, values) in self.product.iter().chain(self.zip.iter()) {
            if values.is_empty() {
                return Err(ConfigFormatError::EmptyParameterList { name: name.clone() });
            }
        }

        if let Some((_, first)) = self.zip.first() {
            if self.zip.iter().any(|(_, v)| v.len() != first.len()) {
                let details = self
                    .zip
                    .iter()
                    .map(|(k, v)| format!("{k}={}", v.len()))
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(ConfigFormatError::ZipLengthMismatch { details });
            }
        }
        Ok(())
    }
}

/// Digits needed to print every index of an axis of length `len`.
fn index_width(len: usize) -> usize {
    let mut width = 1;
    let mut rest = len.saturating_sub(1) / 10;
    while rest > 0 {
        width += 1;
        rest /= 10;
    }
    width
}

fn combination_name(
    base: &str,
    product_indices: &[usize],
    widths: &[usize],
    zip: Option<(usize, usize)>,
) -> String {
    let mut name = base.to_string();
    for (&idx, &width) in product_indices.iter().zip(widths) {
        name.push_str(&format!("_{idx:0width$}"));
    }
    if let Some((idx, width)) = zip {
        name.push_str(&format!("__{idx:0width$}"));
    }
    name
}

/// Expands a spec into its ordered, named combinations.
///
/// # Errors
/// - `ZipLengthMismatch` if the zipped lists differ in length
/// - `DuplicateParameter` if a name appears in two sections
/// - `EmptyParameterList` if a product or zip list is empty
pub fn expand(base: &str, spec: &ParamSpec) -> Result<Vec<ParameterCombination>, ConfigFormatError> {
    spec.validate()?;

    let base_params: BTreeMap<String, Value> = spec.params.iter().cloned().collect();
    let widths: Vec<usize> = spec.product.iter().map(|(_, v)| index_width(v.len())).collect();
    let zip_len = spec.zip.first().map(|(_, v)| v.len());
    let zip_width = zip_len.map_or(1, index_width);

    let mut out = Vec::with_capacity(spec.combination_count());
    // Odometer over the product axes, last axis fastest.
    let mut indices = vec![0usize; spec.product.len()];
    loop {
        let mut params = base_params.clone();
        for ((name, values), &idx) in spec.product.iter().zip(&indices) {
            params.insert(name.clone(), values[idx].clone());
        }

        match zip_len {
            Some(len) => {
                for z in 0..len {
                    let mut zipped = params.clone();
                    for (name, values) in &spec.zip {
                        zipped.insert(name.clone(), values[z].clone());
                    }
                    out.push(ParameterCombination {
                        name: combination_name(base, &indices, &widths, Some((z, zip_width))),
                        params: zipped,
                        product_indices: indices.clone(),
                        zip_index: Some(z),
                    });
                }
            }
            None => out.push(ParameterCombination {
                name: combination_name(base, &indices, &widths, None),
                params,
                product_indices: indices.clone(),
                zip_index: None,
            }),
        }

        let mut axis = indices.len();
        loop {
            if axis == 0 {
                return Ok(out);
            }
            axis -= 1;
            indices[axis] += 1;
            if indices[axis] < spec.product[axis].1.len() {
                break;
            }
            indices[axis] = 0;
        }
    }
}
