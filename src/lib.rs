//! # simetl - feature extraction and caching for simulation campaigns
//!
//! A simulation campaign is a set of runs varying along named conditions
//! (seed, stimulus, ...). simetl extracts raw reports from every run into
//! one repo table per report, computes derived features over sweeps of extra
//! parameters, and caches every step on disk so that reruns only compute
//! what changed.
//!
//! ## Core Concepts
//!
//! - **SimulationCampaign**: immutable, ordered, filterable set of runs
//! - **ParamSpec**: `params`, `params_product` and `params_zip` sections,
//!   expanded into named combinations
//! - **Repository**: per-report tables with a `simulation_id` column
//! - **FeatureCalculator**: one cached table per combination, merged into a
//!   single table with short alias columns
//! - **CacheManager**: fingerprint-keyed entries written atomically
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use simetl::{FeatureInput, FunctionRegistry, JsonTableSource, MultiAnalyzer, Table};
//!
//! fn mean_rate(input: &FeatureInput<'_>) -> Result<Table, String> {
//!     let window = input.param("window");
//!     // ...
//! #   unimplemented!()
//! }
//!
//! let registry = FunctionRegistry::new().with("mean_rate", mean_rate);
//! let ma = MultiAnalyzer::load("analysis.json", Arc::new(JsonTableSource::new()), Arc::new(registry))?;
//! ma.calculate_features()?;
//! let rates = ma.get("spikes")?.features().get("rates")?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

// Data model
pub mod error;
pub mod query;
pub mod table;
pub mod value;

// Campaign and parameters
pub mod campaign;
pub mod params;

// Pipeline
pub mod aliases;
pub mod analysis;
pub mod cache;
pub mod config;
pub mod features;
pub mod logging;
pub mod pool;
pub mod repository;
pub mod source;

// Re-export primary types at crate root for convenience
pub use aliases::{Aliaser, ConcatenatedTable, MAX_ENUMERATED_VALUES};
pub use analysis::{Analyzer, MultiAnalyzer};
pub use cache::{CacheConfig, CacheManager, CacheScope, CacheStatus, ClearScope, Fingerprint};
pub use campaign::{SimulationCampaign, SimulationFormat, SimulationRow, SIMULATION_ID, SIMULATION_PATH};
pub use config::{AnalysisConfig, ExtractionConfig, ReportConfig, SingleAnalysisConfig, CONFIG_VERSION};
pub use error::{
    CacheError, ConfigFormatError, EtlError, EtlResult, ExtractionError, FeatureComputationError, FeatureError,
    QueryError,
};
pub use features::{
    Feature, FeatureCalculator, FeatureConfig, FeatureFunction, FeatureInput, FeatureTable, FunctionRegistry,
};
pub use params::{expand, ParamSpec, ParameterCombination};
pub use pool::WorkerPool;
pub use query::{Predicate, Query};
pub use repository::Repository;
pub use source::{JsonTableSource, ReportSource, SourceError};
pub use table::{Table, TableError};
pub use value::{Attrs, Value};
