//! Feature calculation.
//!
//! A feature is a named function applied to the repo table of an analysis
//! once per parameter combination. Each combination is cached on its own,
//! so a failing or changed combination never touches its siblings. When all
//! combinations succeed they are merged through the [`Aliaser`] into one
//! [`ConcatenatedTable`], which is cached separately.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::aliases::{Aliaser, ConcatenatedTable};
use crate::cache::{CacheScope, Fingerprint};
use crate::campaign::{SimulationCampaign, SIMULATION_ID};
use crate::error::{ConfigFormatError, EtlError, FeatureComputationError, FeatureError};
use crate::logging::Timer;
use crate::params::{expand, ParamSpec, ParameterCombination};
use crate::pool::WorkerPool;
use crate::query::Query;
use crate::repository::Repository;
use crate::table::Table;
use crate::value::{Attrs, Value};

/// Declaration of one feature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FeatureConfig {
    /// Feature name, unique within an analysis.
    pub name: String,
    /// Name of a function in the [`FunctionRegistry`].
    pub function: String,
    /// Features whose merged tables are passed to the function.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
    /// Parameters passed as-is.
    #[serde(default)]
    pub params: serde_json::Map<String, serde_json::Value>,
    /// Parameters expanded as a cartesian product.
    #[serde(default)]
    pub params_product: serde_json::Map<String, serde_json::Value>,
    /// Parameters zipped together.
    #[serde(default)]
    pub params_zip: serde_json::Map<String, serde_json::Value>,
}

impl FeatureConfig {
    /// Feature `name` computed by the registered `function`.
    #[must_use]
    pub fn new(name: impl Into<String>, function: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: function.into(),
            depends_on: Vec::new(),
            params: serde_json::Map::new(),
            params_product: serde_json::Map::new(),
            params_zip: serde_json::Map::new(),
        }
    }

    /// Adds a fixed parameter.
    #[must_use]
    pub fn param(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(name.into(), value.into().to_json());
        self
    }

    /// Adds a product parameter.
    #[must_use]
    pub fn product(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.params_product.insert(name.into(), Value::List(values).to_json());
        self
    }

    /// Adds a zip parameter.
    #[must_use]
    pub fn zip(mut self, name: impl Into<String>, values: Vec<Value>) -> Self {
        self.params_zip.insert(name.into(), Value::List(values).to_json());
        self
    }

    /// Adds a dependency on another feature.
    #[must_use]
    pub fn depends_on(mut self, feature: impl Into<String>) -> Self {
        self.depends_on.push(feature.into());
        self
    }

    /// Parameter spec, with declaration order kept.
    pub fn param_spec(&self) -> Result<ParamSpec, ConfigFormatError> {
        ParamSpec::from_json_maps(&self.params, &self.params_product, &self.params_zip)
    }

    /// Expanded combinations.
    pub fn combinations(&self) -> Result<Vec<ParameterCombination>, ConfigFormatError> {
        expand(&self.name, &self.param_spec()?)
    }
}

/// What a feature function sees for one combination.
pub struct FeatureInput<'a> {
    combination: &'a ParameterCombination,
    report: &'a str,
    reports: &'a BTreeMap<String, Arc<Table>>,
    dependencies: &'a BTreeMap<String, Arc<Feature>>,
    campaign: &'a SimulationCampaign,
}

impl<'a> FeatureInput<'a> {
    /// Combination being computed.
    #[must_use]
    pub fn combination(&self) -> &'a ParameterCombination {
        self.combination
    }

    /// Resolved parameter `name`.
    #[must_use]
    pub fn param(&self, name: &str) -> Option<&'a Value> {
        self.combination.params.get(name)
    }

    /// All resolved parameters.
    #[must_use]
    pub fn params(&self) -> &'a BTreeMap<String, Value> {
        &self.combination.params
    }

    /// Repo table of the analysis report.
    #[must_use]
    pub fn repo(&self) -> &'a Table {
        self.reports
            .get(self.report)
            .map_or(&EMPTY_TABLE, Arc::as_ref)
    }

    /// Repo table of any report of the analysis.
    #[must_use]
    pub fn report(&self, name: &str) -> Option<&'a Table> {
        self.reports.get(name).map(Arc::as_ref)
    }

    /// Merged table of a declared dependency.
    #[must_use]
    pub fn dependency(&self, feature: &str) -> Option<&'a ConcatenatedTable> {
        self.dependencies.get(feature).map(|f| &f.merged)
    }

    /// Campaign of the repository.
    #[must_use]
    pub fn campaign(&self) -> &'a SimulationCampaign {
        self.campaign
    }
}

static EMPTY_TABLE: Table = Table::EMPTY;

/// A computation producing one feature table per combination.
pub trait FeatureFunction: Send + Sync {
    /// Returns the table or a failure message.
    fn compute(&self, input: &FeatureInput<'_>) -> Result<Table, String>;
}

impl<F> FeatureFunction for F
where
    F: Fn(&FeatureInput<'_>) -> Result<Table, String> + Send + Sync,
{
    fn compute(&self, input: &FeatureInput<'_>) -> Result<Table, String> {
        self(input)
    }
}

/// Named feature functions available to configurations.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, Arc<dyn FeatureFunction>>,
}

impl std::fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FunctionRegistry").field("functions", &self.names()).finish()
    }
}

impl FunctionRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a function, replacing any previous one with that name.
    pub fn register(&mut self, name: impl Into<String>, function: impl FeatureFunction + 'static) -> &mut Self {
        self.functions.insert(name.into(), Arc::new(function));
        self
    }

    /// Registers `function` under `name`.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, function: impl FeatureFunction + 'static) -> Self {
        self.register(name, function);
        self
    }

    /// Function registered under `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn FeatureFunction>> {
        self.functions.get(name).cloned()
    }

    /// Returns true if `name` is registered.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Table of one combination, as cached.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureTable {
    /// Output of the function.
    pub table: Table,
    /// The combination's resolved parameters.
    pub attrs: Attrs,
}

/// A calculated feature.
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    /// Feature name.
    pub name: String,
    /// Fingerprint of the merged table.
    pub fingerprint: Fingerprint,
    /// Combinations in expansion order.
    pub combinations: Vec<ParameterCombination>,
    /// Merged table with its aliases.
    pub merged: ConcatenatedTable,
}

impl Feature {
    /// Merged table.
    #[must_use]
    pub fn table(&self) -> &Table {
        &self.merged.table
    }

    /// Alias table, one row per combination.
    #[must_use]
    pub fn aliases(&self) -> &Table {
        &self.merged.aliases
    }

    /// Parameters shared by every combination.
    #[must_use]
    pub fn attrs(&self) -> &Attrs {
        &self.merged.attrs
    }
}

struct Planned {
    combination: ParameterCombination,
    /// Content key naming the combination's cache scope.
    key: String,
    fingerprint: Fingerprint,
}

/// Calculates the features of one analysis.
pub struct FeatureCalculator {
    repo: Arc<Repository>,
    report: String,
    registry: Arc<FunctionRegistry>,
    features: Vec<FeatureConfig>,
    pool: WorkerPool,
    aliaser: Aliaser,
    computed: Mutex<HashMap<String, Arc<Feature>>>,
}

impl std::fmt::Debug for FeatureCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureCalculator")
            .field("report", &self.report)
            .field("features", &self.names())
            .finish_non_exhaustive()
    }
}

impl FeatureCalculator {
    /// Validates the feature configs against the registry.
    ///
    /// # Errors
    /// - `DuplicateFeature` for repeated names
    /// - `UnknownFunction` for unregistered functions
    /// - `UnknownDependency` or `DependencyCycle` for bad `depends_on`
    /// - any error of parameter expansion
    pub fn new(
        repo: Arc<Repository>,
        report: impl Into<String>,
        registry: Arc<FunctionRegistry>,
        features: Vec<FeatureConfig>,
    ) -> Result<Self, ConfigFormatError> {
        let mut names = HashSet::new();
        for feature in &features {
            if !names.insert(feature.name.as_str()) {
                return Err(ConfigFormatError::DuplicateFeature {
                    name: feature.name.clone(),
                });
            }
            if !registry.contains(&feature.function) {
                return Err(ConfigFormatError::UnknownFunction {
                    feature: feature.name.clone(),
                    function: feature.function.clone(),
                });
            }
            feature.combinations()?;
        }
        for feature in &features {
            for dependency in &feature.depends_on {
                if !names.contains(dependency.as_str()) {
                    return Err(ConfigFormatError::UnknownDependency {
                        feature: feature.name.clone(),
                        dependency: dependency.clone(),
                    });
                }
            }
        }
        check_acyclic(&features)?;

        Ok(Self {
            repo,
            report: report.into(),
            registry,
            features,
            pool: WorkerPool::new("features", 1),
            aliaser: Aliaser::new(),
            computed: Mutex::new(HashMap::new()),
        })
    }

    /// Runs combinations on `pool`.
    #[must_use]
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Repository the features read from.
    #[must_use]
    pub fn repo(&self) -> &Arc<Repository> {
        &self.repo
    }

    /// Feature names in declaration order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.features.iter().map(|f| f.name.as_str()).collect()
    }

    /// Declaration of feature `name`.
    #[must_use]
    pub fn config(&self, name: &str) -> Option<&FeatureConfig> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Returns true if `name` has been calculated in this session.
    #[must_use]
    pub fn is_calculated(&self, name: &str) -> bool {
        self.memo().contains_key(name)
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<String, Arc<Feature>>> {
        self.computed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Looks up a feature by name and calculates it if needed.
    ///
    /// # Errors
    /// `EtlError::UnknownName` for a name that is not configured.
    pub fn get(&self, name: &str) -> Result<Arc<Feature>, EtlError> {
        if self.config(name).is_none() {
            return Err(EtlError::unknown("feature", name));
        }
        Ok(self.calculate(name)?)
    }

    /// Calculates every feature in declaration order.
    pub fn calculate_all(&self) -> Result<Vec<Arc<Feature>>, FeatureError> {
        self.features.iter().map(|f| self.calculate(&f.name)).collect()
    }

    /// Calculates one feature, its dependencies first.
    ///
    /// # Errors
    /// `FeatureError::Computation` lists every failed combination; the
    /// successful ones stay cached and no merged table is produced.
    pub fn calculate(&self, name: &str) -> Result<Arc<Feature>, FeatureError> {
        if let Some(feature) = self.memo().get(name) {
            return Ok(Arc::clone(feature));
        }
        let config = self
            .config(name)
            .ok_or_else(|| FeatureError::UnknownFeature { name: name.to_string() })?;

        let dependencies: BTreeMap<String, Arc<Feature>> = config
            .depends_on
            .iter()
            .map(|d| self.calculate(d).map(|feature| (d.clone(), feature)))
            .collect::<Result<_, FeatureError>>()?;

        let timer = Timer::start();
        let reports: BTreeMap<String, Arc<Table>> = self.repo.extract_all()?.into_iter().collect();
        let mut upstream = Vec::new();
        for report in self.repo.names() {
            upstream.push((format!("repo:{report}"), self.repo.fingerprint(report)?));
        }
        for (dependency, feature) in &dependencies {
            upstream.push((format!("dependency:{dependency}"), feature.fingerprint.clone()));
        }

        let spec = config.param_spec()?;
        let planned: Vec<Planned> = expand(&config.name, &spec)?
            .into_iter()
            .map(|combination| {
                let fingerprint = combination_fingerprint(config, &combination, &upstream);
                Planned {
                    key: combination.cache_key(),
                    combination,
                    fingerprint,
                }
            })
            .collect();

        let merged_fp = planned
            .iter()
            .fold(
                Fingerprint::builder("merged")
                    .part("name", &serde_json::Value::String(config.name.clone()))
                    .part("function", &serde_json::Value::String(config.function.clone()))
                    .part("params", &spec.to_json())
                    .part("depends_on", &serde_json::json!(config.depends_on)),
                |builder, p| builder.upstream(&p.combination.name, &p.fingerprint),
            )
            .finish();

        let cache = self.repo.cache();
        let (merged, status) = cache.get_or_compute(&CacheScope::merged(name), &merged_fp, || {
            let parts = self.compute_combinations(config, &planned, &reports, &dependencies)?;
            let keys = spec.all_keys();
            self.aliaser.merge(&parts, &keys).map_err(|e| FeatureError::Merge {
                feature: config.name.clone(),
                reason: e.to_string(),
            })
        })?;

        if !cache.is_readonly() {
            let keys: Vec<&str> = planned.iter().map(|p| p.key.as_str()).collect();
            if let Err(e) = cache.retain_combinations(name, &keys) {
                warn!(feature = name, error = %e, "failed to prune stale combinations");
            }
        }
        info!(
            feature = name,
            combinations = planned.len(),
            rows = merged.table.len(),
            cached = status.is_hit(),
            seconds = timer.elapsed().as_secs_f64(),
            "calculated feature"
        );

        let feature = Arc::new(Feature {
            name: config.name.clone(),
            fingerprint: merged_fp,
            combinations: planned.into_iter().map(|p| p.combination).collect(),
            merged,
        });
        self.memo().insert(name.to_string(), Arc::clone(&feature));
        Ok(feature)
    }

    fn compute_combinations(
        &self,
        config: &FeatureConfig,
        planned: &[Planned],
        reports: &BTreeMap<String, Arc<Table>>,
        dependencies: &BTreeMap<String, Arc<Feature>>,
    ) -> Result<Vec<(ParameterCombination, Table)>, FeatureError> {
        let function = self
            .registry
            .get(&config.function)
            .ok_or_else(|| ConfigFormatError::UnknownFunction {
                feature: config.name.clone(),
                function: config.function.clone(),
            })?;
        let cache = self.repo.cache();
        let campaign = self.repo.campaign().as_ref();

        let results = self.pool.map(planned.iter().collect(), |p: &Planned| {
            let scope = CacheScope::combination(&config.name, &p.key);
            let timer = Timer::start();
            let result = cache.get_or_compute(&scope, &p.fingerprint, || {
                let input = FeatureInput {
                    combination: &p.combination,
                    report: &self.report,
                    reports,
                    dependencies,
                    campaign,
                };
                let table = panic::catch_unwind(AssertUnwindSafe(|| function.compute(&input)))
                    .unwrap_or_else(|payload| Err(panic_message(payload.as_ref())))?;
                Ok(FeatureTable {
                    table,
                    attrs: p.combination.params.clone(),
                })
            });
            match &result {
                Ok((_, status)) => debug!(
                    feature = %config.name,
                    combination = %p.combination.name,
                    cached = status.is_hit(),
                    seconds = timer.elapsed().as_secs_f64(),
                    "combination done"
                ),
                Err(message) => warn!(
                    feature = %config.name,
                    combination = %p.combination.name,
                    error = %message,
                    "combination failed"
                ),
            }
            result.map_err(|message| FeatureComputationError {
                feature: config.name.clone(),
                combination: p.combination.name.clone(),
                message,
            })
        });

        let mut parts = Vec::with_capacity(planned.len());
        let mut failures = Vec::new();
        for (p, result) in planned.iter().zip(results) {
            match result {
                Ok((computed, _)) => parts.push((p.combination.clone(), computed.table)),
                Err(failure) => failures.push(failure),
            }
        }
        if !failures.is_empty() {
            return Err(FeatureError::Computation {
                feature: config.name.clone(),
                failures,
            });
        }
        Ok(parts)
    }

    /// Returns a calculator over `repo` with the same features.
    ///
    /// Features already calculated here that carry a `simulation_id` column
    /// are filtered in memory; the others are recalculated on demand.
    pub fn apply_filter(&self, repo: Arc<Repository>) -> Self {
        let ids: Vec<Value> = repo.simulation_ids().iter().copied().map(Value::from).collect();
        let keep = Query::new().isin(SIMULATION_ID, ids);
        let mut computed = HashMap::new();
        for (name, feature) in self.memo().iter() {
            if let Ok(table) = feature.merged.table.query(&keep) {
                let mut filtered = Feature::clone(feature);
                filtered.merged.table = table;
                computed.insert(name.clone(), Arc::new(filtered));
            }
        }
        Self {
            repo,
            report: self.report.clone(),
            registry: Arc::clone(&self.registry),
            features: self.features.clone(),
            pool: self.pool.clone(),
            aliaser: self.aliaser.clone(),
            computed: Mutex::new(computed),
        }
    }
}

fn combination_fingerprint(
    config: &FeatureConfig,
    combination: &ParameterCombination,
    upstream: &[(String, Fingerprint)],
) -> Fingerprint {
    let params: serde_json::Map<String, serde_json::Value> = combination
        .params
        .iter()
        .map(|(k, v)| (k.clone(), v.to_json()))
        .collect();
    upstream
        .iter()
        .fold(
            Fingerprint::builder("combination")
                .part("name", &serde_json::Value::String(config.name.clone()))
                .part("function", &serde_json::Value::String(config.function.clone()))
                .part("params", &serde_json::Value::Object(params)),
            |builder, (name, fp)| builder.upstream(name, fp),
        )
        .finish()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

fn check_acyclic(features: &[FeatureConfig]) -> Result<(), ConfigFormatError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        by_name: &HashMap<&'a str, &'a FeatureConfig>,
        marks: &mut HashMap<&'a str, Mark>,
    ) -> Result<(), ConfigFormatError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                return Err(ConfigFormatError::DependencyCycle {
                    feature: name.to_string(),
                })
            }
            None => {}
        }
        marks.insert(name, Mark::Visiting);
        if let Some(&config) = by_name.get(name) {
            for dependency in &config.depends_on {
                visit(dependency, by_name, marks)?;
            }
        }
        marks.insert(name, Mark::Done);
        Ok(())
    }

    let by_name: HashMap<&str, &FeatureConfig> = features.iter().map(|f| (f.name.as_str(), f)).collect();
    let mut marks = HashMap::new();
    for feature in features {
        visit(&feature.name, &by_name, &mut marks)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheConfig, CacheManager};
    use crate::campaign::SimulationRow;
    use crate::config::ReportConfig;
    use crate::source::SourceError;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    static CALLS: AtomicUsize = AtomicUsize::new(0);

    fn repo(dir: &Path) -> Arc<Repository> {
        let text = r#"{
            "name": "c",
            "data": [
                {"simulation_path": "s0", "seed": 1},
                {"simulation_path": "s1", "seed": 2}
            ]
        }"#;
        let campaign = Arc::new(SimulationCampaign::from_json_str(text, dir).unwrap());
        let source = |sim: &SimulationRow, _: &ReportConfig| -> Result<Table, SourceError> {
            Table::from_rows(["v"], vec![vec![Value::from(sim.index * 10)]]).map_err(|e| SourceError::new(e.to_string()))
        };
        let cache = Arc::new(
            CacheManager::open(
                dir.join("cache"),
                CacheConfig {
                    readonly: false,
                    sync_on_write: false,
                },
            )
            .unwrap(),
        );
        Arc::new(
            Repository::new(
                campaign,
                Arc::new(source),
                cache,
                vec![ReportConfig::new("spikes")],
                &Query::new(),
            )
            .unwrap(),
        )
    }

    fn tag_window(input: &FeatureInput<'_>) -> Result<Table, String> {
        let window = input.param("window").cloned().unwrap_or_default();
        let rows = input
            .repo()
            .distinct(SIMULATION_ID)
            .unwrap_or_default()
            .into_iter()
            .map(|id| vec![id, window.clone()])
            .collect();
        Table::from_rows([SIMULATION_ID, "window_seen"], rows).map_err(|e| e.to_string())
    }

    fn fail_on_one(input: &FeatureInput<'_>) -> Result<Table, String> {
        if input.param("window") == Some(&Value::Int(1)) {
            return Err("window 1 is broken".to_string());
        }
        tag_window(input)
    }

    fn panics(_: &FeatureInput<'_>) -> Result<Table, String> {
        panic!("kaboom")
    }

    fn count_dependency_rows(input: &FeatureInput<'_>) -> Result<Table, String> {
        let rows = input.dependency("tagged").map_or(0, |d| d.table.len());
        Table::from_rows(["n"], vec![vec![Value::from(rows)]]).map_err(|e| e.to_string())
    }

    fn counted(input: &FeatureInput<'_>) -> Result<Table, String> {
        CALLS.fetch_add(1, Ordering::SeqCst);
        tag_window(input)
    }

    struct Counting {
        calls: Arc<AtomicUsize>,
    }

    impl FeatureFunction for Counting {
        fn compute(&self, input: &FeatureInput<'_>) -> Result<Table, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tag_window(input)
        }
    }

    fn non_finite(_: &FeatureInput<'_>) -> Result<Table, String> {
        Table::from_rows(
            ["rate"],
            vec![vec![Value::Float(f64::NAN)], vec![Value::Float(f64::INFINITY)]],
        )
        .map_err(|e| e.to_string())
    }

    fn registry() -> Arc<FunctionRegistry> {
        Arc::new(
            FunctionRegistry::new()
                .with("tag_window", tag_window)
                .with("fail_on_one", fail_on_one)
                .with("panics", panics)
                .with("count_dependency_rows", count_dependency_rows)
                .with("counted", counted)
                .with("non_finite", non_finite),
        )
    }

    fn windows() -> Vec<Value> {
        vec![Value::Int(0), Value::Int(1)]
    }

    #[test]
    fn test_product_merges_with_alias() {
        let dir = tempdir().unwrap();
        let features = vec![FeatureConfig::new("tagged", "tag_window").product("window", windows())];
        let calc = FeatureCalculator::new(repo(dir.path()), "spikes", registry(), features).unwrap();

        let feature = calc.calculate("tagged").unwrap();
        assert_eq!(feature.combinations.len(), 2);
        assert_eq!(feature.table().len(), 4);
        assert_eq!(feature.table().columns(), ["p0", SIMULATION_ID, "window_seen"]);
        assert_eq!(feature.merged.full_name("p0"), Some("window"));
        let cell = feature.table().get(3, "p0").unwrap();
        assert_eq!(
            feature.merged.resolve("p0", cell),
            Some(("window".to_string(), Value::Int(1)))
        );
        assert!(calc.is_calculated("tagged"));
    }

    #[test]
    fn test_failures_are_aggregated_and_siblings_cached() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let cache = Arc::clone(repo.cache());
        let features = vec![FeatureConfig::new("f", "fail_on_one").product("window", windows())];
        let calc = FeatureCalculator::new(repo, "spikes", registry(), features).unwrap();

        let err = calc.calculate("f").unwrap_err();
        let failures = err.failures();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].combination, "f_1");
        assert!(failures[0].message.contains("broken"));

        let combos = FeatureConfig::new("f", "fail_on_one")
            .product("window", windows())
            .combinations()
            .unwrap();
        assert_eq!(cache.entries(&CacheScope::combination("f", combos[0].cache_key())).len(), 1);
        assert!(cache.entries(&CacheScope::combination("f", combos[1].cache_key())).is_empty());
        assert!(cache.entries(&CacheScope::merged("f")).is_empty());
        assert!(!calc.is_calculated("f"));
    }

    #[test]
    fn test_panic_becomes_failure() {
        let dir = tempdir().unwrap();
        let features = vec![FeatureConfig::new("p", "panics")];
        let calc = FeatureCalculator::new(repo(dir.path()), "spikes", registry(), features).unwrap();
        let err = calc.calculate("p").unwrap_err();
        assert!(err.failures()[0].message.contains("kaboom"));
    }

    #[test]
    fn test_dependencies_are_calculated_first() {
        let dir = tempdir().unwrap();
        let features = vec![
            FeatureConfig::new("counts", "count_dependency_rows").depends_on("tagged"),
            FeatureConfig::new("tagged", "tag_window").product("window", windows()),
        ];
        let calc = FeatureCalculator::new(repo(dir.path()), "spikes", registry(), features).unwrap();

        let counts = calc.calculate("counts").unwrap();
        assert_eq!(counts.table().get(0, "n"), Some(&Value::Int(4)));
        assert!(calc.is_calculated("tagged"));
        assert_eq!(calc.names(), vec!["counts", "tagged"]);
    }

    #[test]
    fn test_config_validation() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let build = |features| FeatureCalculator::new(Arc::clone(&repo), "spikes", registry(), features);

        assert!(matches!(
            build(vec![FeatureConfig::new("a", "missing")]),
            Err(ConfigFormatError::UnknownFunction { .. })
        ));
        assert!(matches!(
            build(vec![FeatureConfig::new("a", "tag_window").depends_on("b")]),
            Err(ConfigFormatError::UnknownDependency { .. })
        ));
        assert!(matches!(
            build(vec![
                FeatureConfig::new("a", "tag_window").depends_on("b"),
                FeatureConfig::new("b", "tag_window").depends_on("a"),
            ]),
            Err(ConfigFormatError::DependencyCycle { .. })
        ));
        assert!(matches!(
            build(vec![
                FeatureConfig::new("a", "tag_window"),
                FeatureConfig::new("a", "tag_window"),
            ]),
            Err(ConfigFormatError::DuplicateFeature { .. })
        ));
        assert!(matches!(
            build(vec![FeatureConfig::new("a", "tag_window")
                .zip("x", vec![1.into()])
                .zip("y", vec![1.into(), 2.into()])]),
            Err(ConfigFormatError::ZipLengthMismatch { .. })
        ));
    }

    #[test]
    fn test_get_unknown_name() {
        let dir = tempdir().unwrap();
        let calc = FeatureCalculator::new(repo(dir.path()), "spikes", registry(), Vec::new()).unwrap();
        let err = calc.get("nope").unwrap_err();
        assert!(matches!(err, EtlError::UnknownName { kind: "feature", .. }));
    }

    #[test]
    fn test_second_calculator_hits_cache() {
        let dir = tempdir().unwrap();
        let features = vec![FeatureConfig::new("counted", "counted").product("window", windows())];
        let repo = repo(dir.path());

        let before = CALLS.load(Ordering::SeqCst);
        let first = FeatureCalculator::new(Arc::clone(&repo), "spikes", registry(), features.clone())
            .unwrap()
            .calculate("counted")
            .unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst) - before, 2);

        let second = FeatureCalculator::new(repo, "spikes", registry(), features)
            .unwrap()
            .with_pool(WorkerPool::new("features", 2))
            .calculate("counted")
            .unwrap();
        assert_eq!(CALLS.load(Ordering::SeqCst) - before, 2);
        assert_eq!(first.merged, second.merged);
        assert_eq!(first.fingerprint, second.fingerprint);
    }

    #[test]
    fn test_changed_product_list_keeps_unchanged_combinations() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let calls = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(FunctionRegistry::new().with(
            "counting",
            Counting {
                calls: Arc::clone(&calls),
            },
        ));
        let run = |values: Vec<Value>| {
            let features = vec![FeatureConfig::new("w", "counting").product("window", values)];
            FeatureCalculator::new(Arc::clone(&repo), "spikes", Arc::clone(&registry), features)
                .unwrap()
                .calculate("w")
                .unwrap()
        };

        run(windows());
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // prepending renames every combination, yet only the new one runs
        let feature = run(vec![Value::Int(9), Value::Int(0), Value::Int(1)]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(feature.combinations[1].name, "w_1");
        assert_eq!(feature.table().get(2, "window_seen"), Some(&Value::Int(0)));

        // 10 -> 11 values widens the index from one digit to two
        run((0..10).map(Value::Int).collect());
        let before = calls.load(Ordering::SeqCst);
        run((0..11).map(Value::Int).collect());
        assert_eq!(calls.load(Ordering::SeqCst) - before, 1);

        // dropped values are pruned from the cache
        run(windows());
        let cache = repo.cache();
        let combos = FeatureConfig::new("w", "counting")
            .product("window", vec![Value::Int(5)])
            .combinations()
            .unwrap();
        assert!(cache.entries(&CacheScope::combination("w", combos[0].cache_key())).is_empty());
        let live = FeatureConfig::new("w", "counting")
            .product("window", windows())
            .combinations()
            .unwrap();
        for combination in &live {
            assert_eq!(cache.entries(&CacheScope::combination("w", combination.cache_key())).len(), 1);
        }
    }

    #[test]
    fn test_non_finite_cells_survive_a_cache_hit() {
        let dir = tempdir().unwrap();
        let repo = repo(dir.path());
        let features = vec![FeatureConfig::new("nf", "non_finite")];

        let first = FeatureCalculator::new(Arc::clone(&repo), "spikes", registry(), features.clone())
            .unwrap()
            .calculate("nf")
            .unwrap();
        let second = FeatureCalculator::new(repo, "spikes", registry(), features)
            .unwrap()
            .calculate("nf")
            .unwrap();

        for feature in [&first, &second] {
            let rate = feature.table().get(0, "rate");
            assert_eq!(rate.map(Value::type_name), Some("float"));
            assert!(rate.and_then(Value::as_float).is_some_and(f64::is_nan));
            assert_eq!(feature.table().get(1, "rate"), Some(&Value::Float(f64::INFINITY)));
        }
    }
}
