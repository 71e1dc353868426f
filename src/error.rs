// ⚠️ Error taxonomy for the kit catalog
//
// Parse-level problems are NOT errors: they are collected as ParseWarning
// values and returned inside the SyncReport. Everything here is surfaced to
// the caller as a typed failure.

use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CatalogError>;

/// Phase of a sync run in which an abort happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStage {
    Read,
    Parse,
    Write,
    Commit,
}

impl fmt::Display for SyncStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SyncStage::Read => "read",
            SyncStage::Parse => "parse",
            SyncStage::Write => "write",
            SyncStage::Commit => "commit",
        };
        f.write_str(name)
    }
}

#[derive(Error, Debug)]
pub enum CatalogError {
    /// No catalog source file was found at all
    #[error("no catalog source available in {}", dir.display())]
    SourceUnavailable { dir: PathBuf },

    /// A sync run was aborted; the previous catalog and fingerprints are intact
    #[error("sync aborted during {stage}: {message}")]
    SyncTransactionFailure { stage: SyncStage, message: String },

    /// Query issued before the first successful sync
    #[error("catalog not initialized: no successful sync has completed yet")]
    CatalogNotInitialized,

    #[error("kit not found: {0}")]
    KitNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config error: {0}")]
    Config(String),

    #[error("watcher error: {0}")]
    Watcher(#[from] notify::Error),

    #[error("catalog watcher has stopped")]
    WatcherStopped,

    #[error("{0} lock poisoned")]
    LockPoisoned(&'static str),
}

impl CatalogError {
    pub(crate) fn sync_failure(stage: SyncStage, err: impl fmt::Display) -> Self {
        CatalogError::SyncTransactionFailure {
            stage,
            message: err.to_string(),
        }
    }

    /// True for conditions that a later retry can clear (source reappears,
    /// transient write failure)
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CatalogError::SourceUnavailable { .. }
                | CatalogError::SyncTransactionFailure { .. }
                | CatalogError::Io(_)
        )
    }
}

impl From<figment::Error> for CatalogError {
    fn from(err: figment::Error) -> Self {
        CatalogError::Config(err.to_string())
    }
}

impl From<regex::Error> for CatalogError {
    fn from(err: regex::Error) -> Self {
        CatalogError::Config(format!("invalid kit title pattern: {err}"))
    }
}
