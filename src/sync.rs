// 🔄 Sync Orchestrator - detector → parser → store, single-flight and transactional
//
// 1. enumerate sources
// 2. change detection (no change → cache hit, zero writes)
// 3. parse every planned file
// 4+5. one transaction: keyed upsert + stale-line pruning + fingerprints
// 6. any failure → abort, prior catalog and fingerprints stay intact

use crate::config::CatalogConfig;
use crate::db::{CatalogStore, FileRebuild, MaterialUpsert, SyncEvent};
use crate::error::{CatalogError, Result, SyncStage};
use crate::fingerprint::ChangeDetector;
use crate::parser::{BlockParser, KitTitleMatcher, ParseWarning, ParsedRow};
use crate::source::{DirectorySource, SourceProvider};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, error, info, warn};

// ============================================================================
// SYNC REPORT
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,

    /// Nothing changed since the last successful sync
    pub cache_hit: bool,

    pub items_written: usize,
    pub warnings: Vec<ParseWarning>,
    pub skipped: usize,
    pub files_synced: Vec<String>,

    /// Previously synced files that disappeared; their records are kept
    pub missing_files: Vec<String>,

    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SyncMode {
    Incremental,
    Full,
}

// ============================================================================
// ORCHESTRATOR
// ============================================================================

pub struct SyncOrchestrator {
    source: Arc<dyn SourceProvider>,
    store: CatalogStore,
    detector: ChangeDetector,
    parser: BlockParser,
    in_flight: Mutex<()>,
}

impl SyncOrchestrator {
    pub fn new(
        source: Arc<dyn SourceProvider>,
        store: CatalogStore,
        detector: ChangeDetector,
        parser: BlockParser,
    ) -> Self {
        SyncOrchestrator {
            source,
            store,
            detector,
            parser,
            in_flight: Mutex::new(()),
        }
    }

    pub fn from_config(config: &CatalogConfig, store: CatalogStore) -> Result<Self> {
        config.validate()?;
        let source = DirectorySource::new(&config.source_dir, &config.source_extension);
        let parser = BlockParser::new(
            KitTitleMatcher::new(&config.kit_title_pattern)?,
            config.columns,
        );

        Ok(SyncOrchestrator::new(
            Arc::new(source),
            store,
            ChangeDetector::new(config.change_strategy),
            parser,
        ))
    }

    pub fn store(&self) -> &CatalogStore {
        &self.store
    }

    pub fn source(&self) -> &dyn SourceProvider {
        self.source.as_ref()
    }

    /// Initial sync at process start. Forces a full rebuild when fingerprints
    /// claim the catalog is current but lines or kits declared by the synced
    /// files are missing from it.
    pub fn startup(&self) -> Result<SyncReport> {
        let fingerprints = self.store.fingerprints()?;
        if !fingerprints.is_empty() {
            let missing = self.store.missing_declared_entries()?;
            if missing > 0 || !self.store.is_initialized()? {
                warn!(missing, "catalog does not match its fingerprints, forcing full rebuild");
                return self.run(SyncMode::Full);
            }
        }
        self.run(SyncMode::Incremental)
    }

    /// Audit trail of past runs, newest first
    pub fn recent_sync_events(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        self.store.recent_events(limit)
    }

    /// Resync whatever changed since the last successful run
    pub fn sync(&self) -> Result<SyncReport> {
        self.run(SyncMode::Incremental)
    }

    /// Rebuild from every source, ignoring stored fingerprints
    pub fn sync_full(&self) -> Result<SyncReport> {
        self.run(SyncMode::Full)
    }

    fn run(&self, mode: SyncMode) -> Result<SyncReport> {
        let _guard = self
            .in_flight
            .lock()
            .map_err(|_| CatalogError::LockPoisoned("sync"))?;

        let started = Instant::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        match self.run_locked(mode, &run_id, started) {
            Ok(report) => Ok(report),
            Err(err) => {
                error!(run_id = %run_id, "catalog sync failed: {err}");
                self.audit(SyncEvent::new(
                    "sync_failed",
                    serde_json::json!({
                        "run_id": run_id,
                        "error": err.to_string(),
                        "duration_ms": started.elapsed().as_millis() as u64,
                    }),
                ));
                Err(err)
            }
        }
    }

    fn run_locked(&self, mode: SyncMode, run_id: &str, started: Instant) -> Result<SyncReport> {
        // 1. enumerate
        let sources = self
            .source
            .list()
            .map_err(|e| CatalogError::sync_failure(SyncStage::Read, e))?;

        // 2. detect
        let location = self.source.location();
        let plan = match mode {
            SyncMode::Incremental => {
                let previous = self.store.fingerprints()?;
                self.detector.needs_sync(location, &sources, &previous)?
            }
            SyncMode::Full => self.detector.full_plan(location, &sources)?,
        };

        for missing in &plan.missing {
            warn!(source_file = %missing, "source file disappeared, keeping its last synced records");
        }

        if !plan.changed {
            debug!(run_id, "catalog up to date (cache hit)");
            return Ok(SyncReport {
                run_id: run_id.to_string(),
                cache_hit: true,
                missing_files: plan.missing,
                duration_ms: started.elapsed().as_millis() as u64,
                ..SyncReport::default()
            });
        }

        info!(
            run_id,
            files = plan.plan.len(),
            strategy = ?self.detector.strategy(),
            "catalog sources changed, resyncing"
        );

        // 3. parse
        let mut warnings = Vec::new();
        let mut skipped = 0;
        let mut rebuilds = Vec::with_capacity(plan.plan.len());

        for file in &plan.plan {
            let content = self.source.read(file).map_err(|e| {
                CatalogError::sync_failure(SyncStage::Read, format!("{}: {e}", file.name))
            })?;
            let output = self.parser.parse(&file.name, &content).map_err(|e| {
                CatalogError::sync_failure(SyncStage::Parse, format!("{}: {e}", file.name))
            })?;

            debug!(
                source_file = %file.name,
                kits = output.kits.len(),
                rows = output.rows.len(),
                warnings = output.warnings.len(),
                "source parsed"
            );

            let (records, duplicates) = dedupe_rows(&output.rows);
            for (kit, code, line_number) in duplicates {
                warn!(
                    source_file = %file.name,
                    line_number,
                    kit = %kit,
                    code = %code,
                    "duplicate code in kit, later row wins"
                );
                warnings.push(ParseWarning {
                    source_file: file.name.clone(),
                    line_number,
                    kit_name: Some(kit),
                    reason: format!("duplicate code {code} in kit, later row wins"),
                });
            }

            warnings.extend(output.warnings);
            skipped += output.skipped;
            rebuilds.push(FileRebuild {
                source_file: file.name.clone(),
                kits: output.kits,
                records,
            });
        }

        // 4 + 5. write and commit atomically
        let items_written = self
            .store
            .apply_rebuild(&rebuilds, &plan.fingerprints, &plan.aggregate)?;

        let report = SyncReport {
            run_id: run_id.to_string(),
            cache_hit: false,
            items_written,
            warnings,
            skipped,
            files_synced: plan.plan.iter().map(|f| f.name.clone()).collect(),
            missing_files: plan.missing,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            run_id,
            items_written = report.items_written,
            warnings = report.warnings.len(),
            skipped = report.skipped,
            duration_ms = report.duration_ms,
            "catalog sync complete"
        );
        self.audit(SyncEvent::new(
            "sync_completed",
            serde_json::json!({
                "run_id": report.run_id,
                "items_written": report.items_written,
                "warnings": report.warnings.len(),
                "files": report.files_synced,
                "duration_ms": report.duration_ms,
            }),
        ));

        Ok(report)
    }

    /// Audit trail writes never fail a sync
    fn audit(&self, event: SyncEvent) {
        if let Err(err) = self.store.record_event(&event) {
            warn!("failed to record sync event: {err}");
        }
    }
}

/// Collapse repeated (kit, code) rows within one file, keeping the last one.
/// Returns the surviving rows in first-seen order plus (kit, code, line) of
/// every replaced duplicate.
fn dedupe_rows(rows: &[ParsedRow]) -> (Vec<MaterialUpsert>, Vec<(String, String, u64)>) {
    let mut index: HashMap<(&str, &str), usize> = HashMap::new();
    let mut kept: Vec<MaterialUpsert> = Vec::with_capacity(rows.len());
    let mut duplicates = Vec::new();

    for row in rows {
        let key = (row.kit_name.as_str(), row.code.as_str());
        match index.get(&key) {
            Some(&slot) => {
                kept[slot] = MaterialUpsert::from(row);
                duplicates.push((row.kit_name.clone(), row.code.clone(), row.line_number));
            }
            None => {
                index.insert(key, kept.len());
                kept.push(MaterialUpsert::from(row));
            }
        }
    }

    (kept, duplicates)
}
