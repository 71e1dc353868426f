// 📂 Source Reader - enumerates catalog source files and exposes their content

use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

// ============================================================================
// SOURCE FILE
// ============================================================================

/// One candidate catalog file, read fresh from the filesystem each sync cycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFile {
    /// File name (the fingerprint key)
    pub name: String,
    pub path: PathBuf,
    pub last_modified: DateTime<Utc>,
    pub size_bytes: u64,
}

impl SourceFile {
    /// Modification marker compared against the stored fingerprint.
    /// Size is folded in because some filesystems only keep second-level mtimes.
    pub fn marker(&self) -> String {
        format!("{}:{}", self.last_modified.timestamp_millis(), self.size_bytes)
    }
}

// ============================================================================
// PROVIDER TRAIT
// ============================================================================

/// Filesystem abstraction consumed by the sync orchestrator
pub trait SourceProvider: Send + Sync {
    /// List candidate source files, sorted by name. A missing location yields
    /// an empty list, not an error.
    fn list(&self) -> Result<Vec<SourceFile>>;

    /// Raw content of one source file
    fn read(&self, file: &SourceFile) -> Result<Vec<u8>>;

    /// Where sources live (for diagnostics and watching)
    fn location(&self) -> &Path;

    /// Whether a path belongs to this provider's candidate set
    fn is_candidate(&self, path: &Path) -> bool;
}

// ============================================================================
// DIRECTORY SOURCE
// ============================================================================

/// Flat directory of exported catalog files filtered by extension
#[derive(Debug, Clone)]
pub struct DirectorySource {
    dir: PathBuf,
    extension: String,
}

impl DirectorySource {
    pub fn new(dir: impl Into<PathBuf>, extension: &str) -> Self {
        DirectorySource {
            dir: dir.into(),
            extension: extension.trim_start_matches('.').to_lowercase(),
        }
    }
}

impl SourceProvider for DirectorySource {
    fn list(&self) -> Result<Vec<SourceFile>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut files = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !self.is_candidate(&path) {
                continue;
            }

            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            files.push(SourceFile {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                last_modified: DateTime::<Utc>::from(modified),
                size_bytes: metadata.len(),
            });
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(files)
    }

    fn read(&self, file: &SourceFile) -> Result<Vec<u8>> {
        Ok(fs::read(&file.path)?)
    }

    fn location(&self) -> &Path {
        &self.dir
    }

    fn is_candidate(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };

        // Office lock files and editor temporaries share the extension
        if name.starts_with("~$") || name.starts_with(".~lock") || name.starts_with('.') {
            return false;
        }

        path.extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case(&self.extension))
            .unwrap_or(false)
    }
}
