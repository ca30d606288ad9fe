//! Analyses over a campaign.
//!
//! A [`MultiAnalyzer`] loads an [`AnalysisConfig`], the campaign it points
//! to, and one [`Analyzer`] per named analysis. Each analyzer has its own
//! cache root (`<output>/<analysis name>`), repository and feature
//! calculator; lookups by name are explicit and fail for unknown names.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use tracing::info;

use crate::cache::{CacheConfig, CacheManager, ClearScope};
use crate::campaign::SimulationCampaign;
use crate::config::AnalysisConfig;
use crate::error::{EtlError, EtlResult, ExtractionError, FeatureError, QueryError};
use crate::features::{Feature, FeatureCalculator, FunctionRegistry};
use crate::logging::Timer;
use crate::pool::WorkerPool;
use crate::query::Query;
use crate::repository::Repository;
use crate::source::ReportSource;
use crate::table::Table;

/// One analysis: a repository and the features computed from it.
#[derive(Debug)]
pub struct Analyzer {
    name: String,
    features: FeatureCalculator,
}

impl Analyzer {
    /// Wraps a feature calculator under an analysis name.
    #[must_use]
    pub fn new(name: impl Into<String>, features: FeatureCalculator) -> Self {
        Self {
            name: name.into(),
            features,
        }
    }

    /// Name of the analysis in the config.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Repository the features read from.
    #[must_use]
    pub fn repo(&self) -> &Arc<Repository> {
        self.features.repo()
    }

    /// Feature calculator of the analysis.
    #[must_use]
    pub fn features(&self) -> &FeatureCalculator {
        &self.features
    }

    /// Extracts every report of the analysis.
    pub fn extract_repo(&self) -> Result<Vec<(String, Arc<Table>)>, ExtractionError> {
        self.repo().extract_all()
    }

    /// Calculates every feature of the analysis.
    pub fn calculate_features(&self) -> Result<Vec<Arc<Feature>>, FeatureError> {
        self.features.calculate_all()
    }

    /// Returns an analyzer restricted to the simulations matching `query`,
    /// sharing the cache in read-only mode.
    pub fn apply_filter(&self, query: &Query) -> Result<Self, QueryError> {
        let repo = Arc::new(self.repo().apply_filter(query)?);
        Ok(Self {
            name: self.name.clone(),
            features: self.features.apply_filter(repo),
        })
    }
}

/// Registry of the named analyses of one configuration.
#[derive(Debug)]
pub struct MultiAnalyzer {
    config: AnalysisConfig,
    campaign: Arc<SimulationCampaign>,
    analyzers: BTreeMap<String, Analyzer>,
}

impl MultiAnalyzer {
    /// Loads a config file; relative paths in it resolve against its
    /// directory.
    pub fn load(
        path: impl AsRef<Path>,
        source: Arc<dyn ReportSource>,
        registry: Arc<FunctionRegistry>,
    ) -> EtlResult<Self> {
        let path = path.as_ref();
        let config = AnalysisConfig::load(path)?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_config(config, base_dir, source, registry)
    }

    /// Builds every analyzer of `config`.
    ///
    /// Every analysis is validated before any cache is touched. Then the
    /// caches are cleared when `clear_cache` is set, and the repos are
    /// extracted or the features calculated eagerly if asked to.
    pub fn from_config(
        config: AnalysisConfig,
        base_dir: &Path,
        source: Arc<dyn ReportSource>,
        registry: Arc<FunctionRegistry>,
    ) -> EtlResult<Self> {
        let mut config = config.resolved(base_dir);
        config.validate()?;
        let mut timer = Timer::start();

        let campaign = Arc::new(SimulationCampaign::load(&config.simulation_campaign)?);
        let workers = config.workers();

        let mut analyzers = BTreeMap::new();
        for (name, single) in &config.analysis {
            let cache = CacheManager::open(config.cache_dir(name), CacheConfig::default())?;
            let filter = config.simulations_filter(name)?;
            let repo = Repository::new(
                Arc::clone(&campaign),
                Arc::clone(&source),
                Arc::new(cache),
                single.extraction.all_reports(),
                &filter,
            )?
            .with_pool(WorkerPool::new("repo", workers));
            let features = FeatureCalculator::new(
                Arc::new(repo),
                single.extraction.report.name.clone(),
                Arc::clone(&registry),
                single.features.clone(),
            )?
            .with_pool(WorkerPool::new("features", workers));
            analyzers.insert(name.clone(), Analyzer::new(name.clone(), features));
        }

        if config.clear_cache {
            for analyzer in analyzers.values() {
                analyzer.repo().cache().clear(&ClearScope::All)?;
            }
        }
        info!(
            campaign = campaign.name(),
            simulations = campaign.len(),
            analyses = analyzers.len(),
            cleared = config.clear_cache,
            seconds = timer.lap(),
            "loaded analyses"
        );

        let multi = Self {
            config,
            campaign,
            analyzers,
        };
        if multi.config.calculate_on_load {
            multi.calculate_features()?;
            info!(seconds = timer.lap(), "calculated features on load");
        } else if multi.config.extract_on_load {
            multi.extract_repo()?;
            info!(seconds = timer.lap(), "extracted repos on load");
        }
        Ok(multi)
    }

    /// Resolved configuration.
    #[must_use]
    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    /// Campaign shared by every analysis.
    #[must_use]
    pub fn campaign(&self) -> &Arc<SimulationCampaign> {
        &self.campaign
    }

    /// Analysis names, sorted.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.analyzers.keys().map(String::as_str).collect()
    }

    /// Looks up an analysis.
    ///
    /// # Errors
    /// `EtlError::UnknownName` if no analysis has that name.
    pub fn get(&self, name: &str) -> EtlResult<&Analyzer> {
        self.analyzers
            .get(name)
            .ok_or_else(|| EtlError::unknown("analysis", name))
    }

    /// Analyses in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Analyzer)> {
        self.analyzers.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Extracts the repo of every analysis.
    pub fn extract_repo(&self) -> EtlResult<()> {
        for analyzer in self.analyzers.values() {
            analyzer.extract_repo()?;
        }
        Ok(())
    }

    /// Calculates the features of every analysis.
    pub fn calculate_features(&self) -> EtlResult<()> {
        for analyzer in self.analyzers.values() {
            analyzer.calculate_features()?;
        }
        Ok(())
    }

    /// Restricts every analysis to the simulations matching `query`.
    pub fn apply_filter(&self, query: &Query) -> EtlResult<Self> {
        let mut analyzers = BTreeMap::new();
        for (name, analyzer) in &self.analyzers {
            analyzers.insert(name.clone(), analyzer.apply_filter(query)?);
        }
        Ok(Self {
            config: self.config.clone(),
            campaign: Arc::clone(&self.campaign),
            analyzers,
        })
    }
}

impl<'a> IntoIterator for &'a MultiAnalyzer {
    type Item = (&'a str, &'a Analyzer);
    type IntoIter = Box<dyn Iterator<Item = (&'a str, &'a Analyzer)> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}
