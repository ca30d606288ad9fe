//! Content-addressed on-disk cache.
//!
//! Every cached table lives in a scope directory and is keyed by the
//! fingerprint of the inputs that produced it:
//!
//! ```text
//! <root>/repo/<report>/<fp>.entry
//! <root>/features/<feature>/combinations/<params key>/<fp>.entry
//! <root>/features/<feature>/merged/<fp>.entry
//! ```
//!
//! A scope holds at most one committed entry. Writers of a scope serialize
//! on the scope's lock file and re-check for an entry once they hold it, so
//! the first writer wins and later ones read its result.

pub mod codec;
pub mod entry;
pub mod file_lock;
pub mod fingerprint;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, info, warn};

use crate::error::CacheError;

pub use entry::{entry_path, read_entry, EntryHeader, EntryWriter};
pub use file_lock::FileLock;
pub use fingerprint::{canonical_json, Fingerprint, FingerprintBuilder};

/// Bumped whenever the layout or payload encoding changes; part of every
/// fingerprint.
pub const CACHE_FORMAT_VERSION: u32 = 1;

const REPO_DIR: &str = "repo";
const FEATURES_DIR: &str = "features";
const COMBINATIONS_DIR: &str = "combinations";
const MERGED_DIR: &str = "merged";

/// Cache behavior switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Never write, lock or delete.
    pub readonly: bool,
    /// fsync entries before renaming them into place.
    pub sync_on_write: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            readonly: false,
            sync_on_write: true,
        }
    }
}

/// Where a cached value belongs.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Repo table of one report.
    Repo {
        /// Report name.
        report: String,
    },
    /// One combination of a feature, keyed by its parameter content.
    Combination {
        /// Feature name.
        feature: String,
        /// [`ParameterCombination::cache_key`](crate::ParameterCombination::cache_key) of the combination.
        key: String,
    },
    /// Merged table of a feature.
    Merged {
        /// Feature name.
        feature: String,
    },
}

impl CacheScope {
    /// Scope of a report's repo table.
    #[must_use]
    pub fn repo(report: impl Into<String>) -> Self {
        Self::Repo { report: report.into() }
    }

    /// Scope of the combination whose parameters have content key `key`.
    #[must_use]
    pub fn combination(feature: impl Into<String>, key: impl Into<String>) -> Self {
        Self::Combination {
            feature: feature.into(),
            key: key.into(),
        }
    }

    /// Scope of a feature's merged table.
    #[must_use]
    pub fn merged(feature: impl Into<String>) -> Self {
        Self::Merged { feature: feature.into() }
    }

    fn relative_dir(&self) -> PathBuf {
        match self {
            Self::Repo { report } => Path::new(REPO_DIR).join(dir_name(report)),
            Self::Combination { feature, key } => Path::new(FEATURES_DIR)
                .join(dir_name(feature))
                .join(COMBINATIONS_DIR)
                .join(dir_name(key)),
            Self::Merged { feature } => Path::new(FEATURES_DIR).join(dir_name(feature)).join(MERGED_DIR),
        }
    }
}

impl fmt::Display for CacheScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Repo { report } => write!(f, "repo/{report}"),
            Self::Combination { feature, key } => write!(f, "features/{feature}/combinations/{key}"),
            Self::Merged { feature } => write!(f, "features/{feature}/merged"),
        }
    }
}

/// What [`CacheManager::clear`] removes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearScope {
    /// Every entry.
    All,
    /// The repo table of one report.
    Report(String),
    /// Every combination and the merged table of one feature.
    Feature(String),
}

/// How a value returned by [`CacheManager::get_or_compute`] was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    /// Read from an existing entry.
    Hit,
    /// Computed now; `persisted` is false when the entry could not be
    /// written or the cache is read-only.
    Computed {
        /// Whether the entry reached the disk.
        persisted: bool,
    },
}

impl CacheStatus {
    /// Returns true if the value was read from disk.
    #[must_use]
    pub const fn is_hit(self) -> bool {
        matches!(self, Self::Hit)
    }
}

/// Handle on one cache root.
#[derive(Debug, Clone)]
pub struct CacheManager {
    root: PathBuf,
    config: CacheConfig,
}

impl CacheManager {
    /// Opens a cache rooted at `root`, creating the directory unless
    /// read-only.
    pub fn open(root: impl Into<PathBuf>, config: CacheConfig) -> Result<Self, CacheError> {
        let root = root.into();
        if !config.readonly {
            fs::create_dir_all(&root).map_err(|e| CacheError::io(&root, &e))?;
        }
        debug!(root = %root.display(), readonly = config.readonly, "opened cache");
        Ok(Self { root, config })
    }

    /// Root directory of the cache.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns true if stores, removals and clears are skipped.
    #[must_use]
    pub const fn is_readonly(&self) -> bool {
        self.config.readonly
    }

    /// Returns a read-only handle on the same root.
    #[must_use]
    pub fn to_readonly(&self) -> Self {
        Self {
            root: self.root.clone(),
            config: CacheConfig {
                readonly: true,
                ..self.config
            },
        }
    }

    /// Directory holding the entries of `scope`.
    #[must_use]
    pub fn scope_dir(&self, scope: &CacheScope) -> PathBuf {
        self.root.join(scope.relative_dir())
    }

    /// Returns true if a committed entry exists for `fingerprint`.
    #[must_use]
    pub fn contains(&self, scope: &CacheScope, fingerprint: &Fingerprint) -> bool {
        entry_path(&self.scope_dir(scope), fingerprint).is_file()
    }

    /// Fingerprints of the committed entries of `scope`.
    #[must_use]
    pub fn entries(&self, scope: &CacheScope) -> Vec<Fingerprint> {
        let Ok(read_dir) = fs::read_dir(self.scope_dir(scope)) else {
            return Vec::new();
        };
        let mut found: Vec<Fingerprint> = read_dir
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == entry::ENTRY_EXTENSION))
            .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).and_then(Fingerprint::from_hex))
            .collect();
        found.sort();
        found
    }

    /// Reads the entry for `fingerprint` without touching the directory.
    ///
    /// # Errors
    /// - `CacheError::Corrupt` for a partial, mismatched or undecodable entry
    /// - `CacheError::Io` when the entry exists but cannot be read
    pub fn try_load<T: DeserializeOwned>(
        &self,
        scope: &CacheScope,
        fingerprint: &Fingerprint,
    ) -> Result<Option<T>, CacheError> {
        let path = entry_path(&self.scope_dir(scope), fingerprint);
        match read_entry::<T>(&path, fingerprint) {
            Ok((_, value)) => Ok(Some(value)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) if matches!(e.kind(), io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof) => {
                Err(CacheError::Corrupt {
                    path,
                    message: e.to_string(),
                })
            }
            Err(e) => Err(CacheError::io(path, &e)),
        }
    }

    /// Reads the entry for `fingerprint`.
    ///
    /// A missing entry is `None`. A corrupt or partial entry is logged,
    /// removed (unless read-only) and also reported as `None`.
    pub fn load<T: DeserializeOwned>(&self, scope: &CacheScope, fingerprint: &Fingerprint) -> Option<T> {
        match self.try_load(scope, fingerprint) {
            Ok(value) => value,
            Err(CacheError::Corrupt { path, message }) => {
                warn!(scope = %scope, path = %path.display(), error = %message, "discarding corrupt cache entry");
                if !self.config.readonly {
                    let _ = fs::remove_file(&path);
                }
                None
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "cannot read cache entry");
                None
            }
        }
    }

    /// Writes the entry for `fingerprint` and removes other entries of the
    /// scope.
    pub fn store<T: Serialize>(
        &self,
        scope: &CacheScope,
        fingerprint: &Fingerprint,
        value: &T,
    ) -> Result<PathBuf, CacheError> {
        if self.config.readonly {
            return Err(CacheError::ReadOnly { operation: "store" });
        }
        let dir = self.scope_dir(scope);
        fs::create_dir_all(&dir).map_err(|e| CacheError::io(&dir, &e))?;
        let _lock = FileLock::acquire(&dir).map_err(|e| CacheError::io(&dir, &e))?;
        let path = self.write_entry(&dir, scope, fingerprint, value)?;
        remove_stale(&dir, fingerprint, true);
        Ok(path)
    }

    /// Returns the cached value for `fingerprint`, computing and storing it
    /// on a miss.
    ///
    /// Errors of `compute` are returned unchanged and leave the cache
    /// untouched. Cache failures never fail the call: the computed value is
    /// returned with `persisted: false`.
    pub fn get_or_compute<T, E, F>(
        &self,
        scope: &CacheScope,
        fingerprint: &Fingerprint,
        compute: F,
    ) -> Result<(T, CacheStatus), E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<T, E>,
    {
        if let Some(value) = self.load(scope, fingerprint) {
            debug!(scope = %scope, fingerprint = fingerprint.short(), "cache hit");
            return Ok((value, CacheStatus::Hit));
        }
        debug!(scope = %scope, fingerprint = fingerprint.short(), "cache miss");

        if self.config.readonly {
            let value = compute()?;
            return Ok((value, CacheStatus::Computed { persisted: false }));
        }

        let dir = self.scope_dir(scope);
        if let Err(e) = fs::create_dir_all(&dir) {
            warn!(scope = %scope, error = %e, "cannot create cache directory, value will not be persisted");
            let value = compute()?;
            return Ok((value, CacheStatus::Computed { persisted: false }));
        }

        let lock = match FileLock::acquire(&dir) {
            Ok(lock) => Some(lock),
            Err(e) => {
                warn!(scope = %scope, error = %e, "cannot lock cache scope, writing unlocked");
                None
            }
        };

        if lock.is_some() {
            if let Some(value) = self.load(scope, fingerprint) {
                debug!(scope = %scope, fingerprint = fingerprint.short(), "cache filled by another writer");
                return Ok((value, CacheStatus::Hit));
            }
        }

        let value = compute()?;
        let persisted = match self.write_entry(&dir, scope, fingerprint, &value) {
            Ok(_) => {
                remove_stale(&dir, fingerprint, lock.is_some());
                true
            }
            Err(e) => {
                warn!(scope = %scope, error = %e, "failed to write cache entry");
                false
            }
        };
        drop(lock);
        Ok((value, CacheStatus::Computed { persisted }))
    }

    fn write_entry<T: Serialize>(
        &self,
        dir: &Path,
        scope: &CacheScope,
        fingerprint: &Fingerprint,
        value: &T,
    ) -> Result<PathBuf, CacheError> {
        let header = EntryHeader {
            format_version: CACHE_FORMAT_VERSION,
            fingerprint: fingerprint.clone(),
            scope: scope.to_string(),
            created_at: Utc::now(),
        };
        let mut writer =
            EntryWriter::new(dir, fingerprint, self.config.sync_on_write).map_err(|e| CacheError::io(dir, &e))?;
        writer.write(&header, value).map_err(|e| CacheError::io(dir, &e))?;
        writer.finalize().map_err(|e| CacheError::io(dir, &e))
    }

    /// Removes cached data.
    pub fn clear(&self, scope: &ClearScope) -> Result<(), CacheError> {
        if self.config.readonly {
            return Err(CacheError::ReadOnly { operation: "clear" });
        }
        let targets = match scope {
            ClearScope::All => vec![self.root.join(REPO_DIR), self.root.join(FEATURES_DIR)],
            ClearScope::Report(report) => vec![self.root.join(REPO_DIR).join(dir_name(report))],
            ClearScope::Feature(feature) => vec![self.root.join(FEATURES_DIR).join(dir_name(feature))],
        };
        for target in targets {
            match fs::remove_dir_all(&target) {
                Ok(()) => info!(path = %target.display(), "cleared cache"),
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(CacheError::io(&target, &e)),
            }
        }
        Ok(())
    }

    /// Drops the combination directories of `feature` whose content key is
    /// not in `keys`. Returns the number removed.
    pub fn retain_combinations<S: AsRef<str>>(&self, feature: &str, keys: &[S]) -> Result<usize, CacheError> {
        if self.config.readonly {
            return Err(CacheError::ReadOnly {
                operation: "retain combinations",
            });
        }
        let dir = self.root.join(FEATURES_DIR).join(dir_name(feature)).join(COMBINATIONS_DIR);
        let keep: Vec<String> = keys.iter().map(|k| dir_name(k.as_ref())).collect();
        let read_dir = match fs::read_dir(&dir) {
            Ok(read_dir) => read_dir,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(CacheError::io(&dir, &e)),
        };

        let mut removed = 0;
        for entry in read_dir.filter_map(Result::ok) {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() && !keep.contains(&name) {
                fs::remove_dir_all(&path).map_err(|e| CacheError::io(&path, &e))?;
                debug!(feature, combination = %name, "pruned stale combination");
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Removes every entry of `dir` other than `keep`, plus leftover temp files
/// when the scope lock is held.
fn remove_stale(dir: &Path, keep: &Fingerprint, locked: bool) {
    let Ok(read_dir) = fs::read_dir(dir) else {
        return;
    };
    let keep_name = format!("{keep}.{}", entry::ENTRY_EXTENSION);
    for path in read_dir.filter_map(Result::ok).map(|e| e.path()) {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        let stale_entry = path.extension().is_some_and(|ext| ext == entry::ENTRY_EXTENSION) && name != keep_name;
        let stale_temp = locked && entry::is_temp_file(&path);
        if stale_entry || stale_temp {
            if let Err(e) = fs::remove_file(&path) {
                warn!(path = %path.display(), error = %e, "failed to remove stale cache file");
            }
        }
    }
}

/// Maps a report, feature or combination name to a directory name.
///
/// Names made only of `[A-Za-z0-9._-]` are kept. Anything else is replaced
/// by `_` and suffixed with a short hash so distinct names stay distinct.
fn dir_name(name: &str) -> String {
    let plain = !name.is_empty()
        && name != "."
        && name != ".."
        && name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if plain {
        return name.to_string();
    }
    let cleaned: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-') { c } else { '_' })
        .collect();
    let hash = Fingerprint::of_json(&serde_json::Value::String(name.to_string()));
    format!("{cleaned}-{}", &hash.short()[..8])
}
