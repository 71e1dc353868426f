// 🔎 Change Detector - decides whether (and what) to resync
//
// Strategy PerFile compares each file's marker with its stored fingerprint.
// Strategy Aggregate hashes every (name, marker) pair into one SHA-256 value.

use crate::config::ChangeStrategy;
use crate::error::{CatalogError, Result};
use crate::source::SourceFile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::path::Path;

/// Persisted change marker for one source file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncFingerprint {
    pub source_file: String,
    pub marker: String,
}

/// Fingerprints recorded by the last successful sync
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FingerprintState {
    pub per_file: BTreeMap<String, String>,
    pub aggregate: Option<String>,
}

impl FingerprintState {
    pub fn is_empty(&self) -> bool {
        self.per_file.is_empty() && self.aggregate.is_none()
    }
}

/// Output of the change detector
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub changed: bool,

    /// Files that must be re-parsed
    pub plan: Vec<SourceFile>,

    /// Previously fingerprinted files no longer present
    pub missing: Vec<String>,

    /// Fingerprints to persist for the planned files once the rebuild commits
    pub fingerprints: Vec<SyncFingerprint>,

    /// Aggregate hash over all current sources
    pub aggregate: String,
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetector {
    strategy: ChangeStrategy,
}

impl ChangeDetector {
    pub fn new(strategy: ChangeStrategy) -> Self {
        ChangeDetector { strategy }
    }

    pub fn strategy(&self) -> ChangeStrategy {
        self.strategy
    }

    /// Compare current sources with the stored state.
    ///
    /// An empty source set is reported as `SourceUnavailable` rather than
    /// "nothing changed".
    pub fn needs_sync(
        &self,
        location: &Path,
        sources: &[SourceFile],
        previous: &FingerprintState,
    ) -> Result<SyncPlan> {
        if sources.is_empty() {
            return Err(CatalogError::SourceUnavailable {
                dir: location.to_path_buf(),
            });
        }

        let aggregate = aggregate_fingerprint(sources);
        let current: HashSet<&str> = sources.iter().map(|s| s.name.as_str()).collect();
        let missing: Vec<String> = previous
            .per_file
            .keys()
            .filter(|name| !current.contains(name.as_str()))
            .cloned()
            .collect();

        let plan: Vec<SourceFile> = match self.strategy {
            ChangeStrategy::PerFile => sources
                .iter()
                .filter(|s| previous.per_file.get(&s.name) != Some(&s.marker()))
                .cloned()
                .collect(),
            ChangeStrategy::Aggregate => {
                if previous.aggregate.as_deref() == Some(aggregate.as_str()) {
                    Vec::new()
                } else {
                    sources.to_vec()
                }
            }
        };

        Ok(SyncPlan {
            changed: !plan.is_empty(),
            fingerprints: fingerprints_for(&plan),
            plan,
            missing,
            aggregate,
        })
    }

    /// Plan that rebuilds every source regardless of stored fingerprints
    pub fn full_plan(&self, location: &Path, sources: &[SourceFile]) -> Result<SyncPlan> {
        self.needs_sync(location, sources, &FingerprintState::default())
            .map(|mut plan| {
                plan.missing.clear();
                plan
            })
    }
}

fn fingerprints_for(files: &[SourceFile]) -> Vec<SyncFingerprint> {
    files
        .iter()
        .map(|f| SyncFingerprint {
            source_file: f.name.clone(),
            marker: f.marker(),
        })
        .collect()
}

/// SHA-256 over "name:marker;" for every source, in name order
pub fn aggregate_fingerprint(sources: &[SourceFile]) -> String {
    let mut sorted: Vec<&SourceFile> = sources.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut hasher = Sha256::new();
    for source in sorted {
        hasher.update(format!("{}:{};", source.name, source.marker()));
    }
    format!("{:x}", hasher.finalize())
}
