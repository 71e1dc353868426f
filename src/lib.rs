// Kit Catalog - Core Library
// Catalog sync (sources → fingerprints → parser → store), watch loop,
// calculation history and budget consolidation. Used by the CLI and tests.

pub mod config;
pub mod error;
pub mod source;
pub mod fingerprint;
pub mod parser;
pub mod db;
pub mod sync;
pub mod watcher;
pub mod history;
pub mod recorder;
pub mod consolidation;
pub mod budget;

// Re-export commonly used types
pub use config::{CatalogConfig, ChangeStrategy, ColumnLayout, WatchConfig};
pub use error::{CatalogError, Result, SyncStage};
pub use source::{DirectorySource, SourceFile, SourceProvider};
pub use fingerprint::{ChangeDetector, FingerprintState, SyncFingerprint, SyncPlan};
pub use parser::{BlockParser, KitTitleMatcher, ParseOutput, ParseWarning, ParsedRow};
pub use db::{
    CatalogStore, CodePrice, FileRebuild, MaterialRecord, MaterialUpsert,
    PriceChange, SyncEvent,
};
pub use sync::{SyncOrchestrator, SyncReport};
pub use watcher::{CatalogWatcher, SyncUpdate, WatcherStatus};
pub use history::{
    CalculationKind, CalculationRecord, CalculationSource, MaterialEntry,
    Project, SqliteHistory,
};
pub use recorder::{
    CalculationRecorder, Calculator, RecordedCalculation,
    SagInputs, SagResult, VoltageDropInputs, VoltageDropResult,
};
pub use consolidation::{ConsolidatedLineItem, ConsolidationEngine};
pub use budget::{BudgetLineItem, BudgetReport, BudgetResolver};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
