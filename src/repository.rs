//! Report extraction over a campaign.
//!
//! A [`Repository`] owns the extracted repo tables of one analysis. Each
//! report is extracted once per repository: from the cache when a matching
//! entry exists, otherwise by calling the [`ReportSource`] on every selected
//! simulation in campaign order.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info};

use crate::cache::{CacheManager, CacheScope, Fingerprint};
use crate::campaign::{SimulationCampaign, SIMULATION_ID};
use crate::config::ReportConfig;
use crate::error::{ExtractionError, QueryError};
use crate::logging::Timer;
use crate::pool::WorkerPool;
use crate::query::Query;
use crate::source::ReportSource;
use crate::table::Table;
use crate::value::Value;

/// Extracted repo tables of one analysis.
pub struct Repository {
    campaign: Arc<SimulationCampaign>,
    campaign_checksum: Fingerprint,
    source: Arc<dyn ReportSource>,
    cache: Arc<CacheManager>,
    reports: Vec<ReportConfig>,
    simulation_ids: Vec<usize>,
    pool: WorkerPool,
    extracted: Mutex<HashMap<String, Arc<Table>>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("campaign", &self.campaign.name())
            .field("reports", &self.names())
            .field("simulation_ids", &self.simulation_ids)
            .finish_non_exhaustive()
    }
}

impl Repository {
    /// Creates a repository over the simulations matching `filter`.
    ///
    /// # Errors
    /// `QueryError` if the filter references an unknown condition.
    pub fn new(
        campaign: Arc<SimulationCampaign>,
        source: Arc<dyn ReportSource>,
        cache: Arc<CacheManager>,
        reports: Vec<ReportConfig>,
        filter: &Query,
    ) -> Result<Self, QueryError> {
        let simulation_ids = campaign.ids(filter)?;
        let campaign_checksum = campaign.checksum();
        Ok(Self {
            campaign,
            campaign_checksum,
            source,
            cache,
            reports,
            simulation_ids,
            pool: WorkerPool::new("repo", 1),
            extracted: Mutex::new(HashMap::new()),
        })
    }

    /// Runs independent reports on `pool`.
    #[must_use]
    pub fn with_pool(mut self, pool: WorkerPool) -> Self {
        self.pool = pool;
        self
    }

    /// Campaign the repository extracts from.
    #[must_use]
    pub fn campaign(&self) -> &Arc<SimulationCampaign> {
        &self.campaign
    }

    /// Cache of the analysis.
    #[must_use]
    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    /// Indices of the selected simulations, in campaign order.
    #[must_use]
    pub fn simulation_ids(&self) -> &[usize] {
        &self.simulation_ids
    }

    /// Names of the configured reports.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.reports.iter().map(|r| r.name.as_str()).collect()
    }

    /// Report config named `name`.
    #[must_use]
    pub fn report(&self, name: &str) -> Option<&ReportConfig> {
        self.reports.iter().find(|r| r.name == name)
    }

    /// Returns true if the report is available without calling the source.
    #[must_use]
    pub fn is_extracted(&self, name: &str) -> bool {
        if self.memo().contains_key(name) {
            return true;
        }
        self.fingerprint(name)
            .is_ok_and(|fp| self.cache.contains(&CacheScope::repo(name), &fp))
    }

    /// Cache key of a report: its config, the campaign content and the
    /// selected simulations.
    pub fn fingerprint(&self, name: &str) -> Result<Fingerprint, ExtractionError> {
        let report = self.report_config(name)?;
        Ok(self.fingerprint_of(report))
    }

    fn fingerprint_of(&self, report: &ReportConfig) -> Fingerprint {
        Fingerprint::builder("repo")
            .part("report_type", &serde_json::Value::String(report.report_type.clone()))
            .part("report_name", &serde_json::Value::String(report.name.clone()))
            .upstream("campaign", &self.campaign_checksum)
            .part("simulation_ids", &serde_json::json!(self.simulation_ids))
            .finish()
    }

    fn report_config(&self, name: &str) -> Result<&ReportConfig, ExtractionError> {
        self.report(name).ok_or_else(|| ExtractionError::UnknownReport {
            report: name.to_string(),
        })
    }

    fn memo(&self) -> MutexGuard<'_, HashMap<String, Arc<Table>>> {
        self.extracted.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the repo table of a report, extracting it if needed.
    ///
    /// The table has a `simulation_id` column followed by the source's
    /// columns, rows ordered by simulation.
    pub fn extract(&self, name: &str) -> Result<Arc<Table>, ExtractionError> {
        if let Some(table) = self.memo().get(name) {
            return Ok(Arc::clone(table));
        }
        let report = self.report_config(name)?;
        let fingerprint = self.fingerprint_of(report);

        let timer = Timer::start();
        let (table, status) = self
            .cache
            .get_or_compute(&CacheScope::repo(name), &fingerprint, || self.extract_from_source(report))?;
        info!(
            report = name,
            rows = table.len(),
            cached = status.is_hit(),
            seconds = timer.elapsed().as_secs_f64(),
            "extracted report"
        );

        let table = Arc::new(table);
        self.memo().insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    fn extract_from_source(&self, report: &ReportConfig) -> Result<Table, ExtractionError> {
        let id_column = [SIMULATION_ID.to_string()];
        let mut parts = Vec::with_capacity(self.simulation_ids.len());
        let mut expected: Option<Vec<String>> = None;

        for &id in &self.simulation_ids {
            let simulation = &self.campaign[id];
            debug!(report = %report.name, simulation_id = id, "calling report source");
            let raw = self
                .source
                .extract(simulation, report)
                .map_err(|e| ExtractionError::Source {
                    report: report.name.clone(),
                    simulation_id: id,
                    path: simulation.path.clone(),
                    message: e.to_string(),
                })?;

            match &expected {
                Some(columns) if columns.as_slice() != raw.columns() => {
                    return Err(ExtractionError::ColumnMismatch {
                        report: report.name.clone(),
                        simulation_id: id,
                        expected: columns.clone(),
                        actual: raw.columns().to_vec(),
                    });
                }
                Some(_) => {}
                None => expected = Some(raw.columns().to_vec()),
            }

            let part = raw
                .with_leading_columns(&id_column, &[Value::from(id)])
                .map_err(|e| ExtractionError::Source {
                    report: report.name.clone(),
                    simulation_id: id,
                    path: simulation.path.clone(),
                    message: e.to_string(),
                })?;
            parts.push(part);
        }

        if parts.is_empty() {
            return Table::new(id_column).map_err(|e| ExtractionError::Cache {
                report: report.name.clone(),
                message: e.to_string(),
            });
        }
        Table::concat(&parts).map_err(|e| ExtractionError::Cache {
            report: report.name.clone(),
            message: e.to_string(),
        })
    }

    /// Extracts every configured report, independent reports in parallel.
    ///
    /// Returns the tables in configuration order; the first failure wins.
    pub fn extract_all(&self) -> Result<Vec<(String, Arc<Table>)>, ExtractionError> {
        let names: Vec<String> = self.reports.iter().map(|r| r.name.clone()).collect();
        let results = self.pool.map(names, |name| -> Result<(String, Arc<Table>), ExtractionError> {
            let table = self.extract(&name)?;
            Ok((name, table))
        });
        results.into_iter().collect()
    }

    /// Returns a repository restricted to the simulations matching `query`.
    ///
    /// The new repository shares the cache in read-only mode. Reports
    /// already extracted here are filtered in memory.
    ///
    /// # Errors
    /// `QueryError` if the query references an unknown condition.
    pub fn apply_filter(&self, query: &Query) -> Result<Self, QueryError> {
        let matching = self.campaign.ids(query)?;
        let simulation_ids: Vec<usize> = self
            .simulation_ids
            .iter()
            .copied()
            .filter(|id| matching.contains(id))
            .collect();

        let mut extracted = HashMap::new();
        for (name, table) in self.memo().iter() {
            let keep = Query::new().isin(
                SIMULATION_ID,
                simulation_ids.iter().copied().map(Value::from).collect(),
            );
            extracted.insert(name.clone(), Arc::new(table.query(&keep)?));
        }

        Ok(Self {
            campaign: Arc::clone(&self.campaign),
            campaign_checksum: self.campaign_checksum.clone(),
            source: Arc::clone(&self.source),
            cache: Arc::new(self.cache.to_readonly()),
            reports: self.reports.clone(),
            simulation_ids,
            pool: self.pool.clone(),
            extracted: Mutex::new(extracted),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheConfig;
    use crate::campaign::SimulationRow;
    use crate::source::SourceError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    fn campaign(dir: &std::path::Path) -> Arc<SimulationCampaign> {
        let text = r#"{
            "name": "c",
            "data": [
                {"simulation_path": "s0", "seed": 1},
                {"simulation_path": "s1", "seed": 2},
                {"simulation_path": "s2", "seed": 3}
            ]
        }"#;
        Arc::new(SimulationCampaign::from_json_str(text, dir).unwrap())
    }

    struct CountingSource {
        calls: AtomicUsize,
    }

    impl ReportSource for CountingSource {
        fn extract(&self, simulation: &SimulationRow, _report: &ReportConfig) -> Result<Table, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let seed = simulation.condition("seed").cloned().unwrap_or_default();
            Table::from_rows(["value"], vec![vec![seed.clone()], vec![seed]])
                .map_err(|e| SourceError::new(e.to_string()))
        }
    }

    fn repository(dir: &std::path::Path, source: Arc<CountingSource>, filter: &Query) -> Repository {
        let cache = Arc::new(CacheManager::open(dir.join("cache"), CacheConfig::default()).unwrap());
        Repository::new(
            campaign(dir),
            source,
            cache,
            vec![ReportConfig::new("spikes"), ReportConfig::new("soma")],
            filter,
        )
        .unwrap()
    }

    #[test]
    fn test_extract_prepends_simulation_id() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let repo = repository(dir.path(), Arc::clone(&source), &Query::new());

        let table = repo.extract("spikes").unwrap();
        assert_eq!(table.columns(), [SIMULATION_ID, "value"]);
        assert_eq!(table.len(), 6);
        assert_eq!(table.get(2, SIMULATION_ID), Some(&Value::Int(1)));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        // Memoized
        repo.extract("spikes").unwrap();
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
        assert!(repo.is_extracted("spikes"));
        assert!(!repo.is_extracted("soma"));
    }

    #[test]
    fn test_cached_extraction_skips_source() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let first = repository(dir.path(), Arc::clone(&source), &Query::new())
            .extract("spikes")
            .unwrap();

        let again = repository(dir.path(), Arc::clone(&source), &Query::new());
        assert!(again.is_extracted("spikes"));
        let second = again.extract("spikes").unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_filter_changes_fingerprint() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let all = repository(dir.path(), Arc::clone(&source), &Query::new());
        let some = repository(dir.path(), Arc::clone(&source), &Query::new().isin("seed", vec![1.into(), 3.into()]));
        assert_eq!(some.simulation_ids(), [0, 2]);
        assert_ne!(all.fingerprint("spikes").unwrap(), some.fingerprint("spikes").unwrap());
    }

    #[test]
    fn test_unknown_report() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let repo = repository(dir.path(), source, &Query::new());
        assert!(matches!(
            repo.extract("voltage"),
            Err(ExtractionError::UnknownReport { .. })
        ));
    }

    #[test]
    fn test_source_failure_names_simulation_and_caches_nothing() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(CacheManager::open(dir.path().join("cache"), CacheConfig::default()).unwrap());
        let source = |sim: &SimulationRow, _: &ReportConfig| -> Result<Table, SourceError> {
            if sim.index == 1 {
                return Err(SourceError::new("no output"));
            }
            Ok(Table::new(["x"]).unwrap())
        };
        let repo = Repository::new(
            campaign(dir.path()),
            Arc::new(source),
            Arc::clone(&cache),
            vec![ReportConfig::new("spikes")],
            &Query::new(),
        )
        .unwrap();

        let err = repo.extract("spikes").unwrap_err();
        match err {
            ExtractionError::Source {
                simulation_id, path, ..
            } => {
                assert_eq!(simulation_id, 1);
                assert!(path.ends_with("s1"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(cache.entries(&CacheScope::repo("spikes")).is_empty());
    }

    #[test]
    fn test_column_mismatch() {
        let dir = tempdir().unwrap();
        let cache = Arc::new(CacheManager::open(dir.path().join("cache"), CacheConfig::default()).unwrap());
        let source = |sim: &SimulationRow, _: &ReportConfig| -> Result<Table, SourceError> {
            let column = if sim.index == 2 { "y" } else { "x" };
            Ok(Table::new([column]).unwrap())
        };
        let repo = Repository::new(
            campaign(dir.path()),
            Arc::new(source),
            cache,
            vec![ReportConfig::new("spikes")],
            &Query::new(),
        )
        .unwrap();
        assert!(matches!(
            repo.extract("spikes"),
            Err(ExtractionError::ColumnMismatch { simulation_id: 2, .. })
        ));
    }

    #[test]
    fn test_extract_all_in_config_order() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let repo = repository(dir.path(), Arc::clone(&source), &Query::new()).with_pool(WorkerPool::new("repo", 2));
        let tables = repo.extract_all().unwrap();
        let names: Vec<&str> = tables.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["spikes", "soma"]);
        assert_eq!(source.calls.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn test_apply_filter_uses_memory_and_readonly_cache() {
        let dir = tempdir().unwrap();
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
        });
        let repo = repository(dir.path(), Arc::clone(&source), &Query::new());
        repo.extract("spikes").unwrap();

        let filtered = repo.apply_filter(&Query::new().eq("seed", 2)).unwrap();
        assert_eq!(filtered.simulation_ids(), [1]);
        assert!(filtered.cache().is_readonly());

        let table = filtered.extract("spikes").unwrap();
        assert_eq!(table.len(), 2);
        assert_eq!(table.distinct(SIMULATION_ID), Some(vec![Value::Int(1)]));
        assert_eq!(source.calls.load(Ordering::SeqCst), 3);

        assert!(matches!(
            repo.apply_filter(&Query::new().eq("stimulus", "x")),
            Err(QueryError::UnknownKey { .. })
        ));
    }
}
