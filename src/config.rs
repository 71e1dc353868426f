// ⚙️ Configuration - defaults, then kit-catalog.toml, then KIT_CATALOG_* env vars

use crate::error::{CatalogError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "kit-catalog.toml";
pub const ENV_PREFIX: &str = "KIT_CATALOG_";

/// Kit headers in the spreadsheet exports look like "CE2 BRAÇO J"; hand-made
/// sources use a "KIT-" / "KIT " prefix.
pub const DEFAULT_KIT_TITLE_PATTERN: &str = r"(?i)(BRAÇO J|^KIT[-\s])";

/// How the change detector decides which source files need a rebuild
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeStrategy {
    /// One fingerprint per file; only changed files are re-parsed
    PerFile,

    /// One hash over every (name, marker) pair; any change rebuilds all files
    Aggregate,
}

/// Zero-based column positions in the headerless source rows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ColumnLayout {
    pub identifier: usize,
    pub description: usize,
    pub quantity: usize,
}

impl Default for ColumnLayout {
    fn default() -> Self {
        ColumnLayout {
            identifier: 1,
            description: 2,
            quantity: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Quiet window after the last file event before a sync fires
    pub debounce_ms: u64,

    /// Upper bound on how long a continuous burst can postpone a sync
    pub max_batch_wait_ms: u64,

    /// Poll interval for backends without native notifications
    pub poll_interval_ms: u64,
}

impl Default for WatchConfig {
    fn default() -> Self {
        WatchConfig {
            debounce_ms: 500,
            max_batch_wait_ms: 3_000,
            poll_interval_ms: 2_000,
        }
    }
}

impl WatchConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn max_batch_wait(&self) -> Duration {
        Duration::from_millis(self.max_batch_wait_ms.max(self.debounce_ms))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CatalogConfig {
    pub source_dir: PathBuf,
    pub database_path: PathBuf,
    pub source_extension: String,
    pub kit_title_pattern: String,
    pub columns: ColumnLayout,
    pub change_strategy: ChangeStrategy,
    pub default_currency: String,
    pub default_unit: String,
    pub watch: WatchConfig,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        CatalogConfig {
            source_dir: PathBuf::from("data"),
            database_path: PathBuf::from("data/catalog.db"),
            source_extension: "csv".to_string(),
            kit_title_pattern: DEFAULT_KIT_TITLE_PATTERN.to_string(),
            columns: ColumnLayout::default(),
            change_strategy: ChangeStrategy::PerFile,
            default_currency: "BRL".to_string(),
            default_unit: "UN".to_string(),
            watch: WatchConfig::default(),
        }
    }
}

impl CatalogConfig {
    /// Load from `kit-catalog.toml` in the working directory (if present) and
    /// the environment.
    pub fn load() -> Result<Self> {
        Self::load_from(Path::new(CONFIG_FILE_NAME))
    }

    pub fn load_from(config_path: &Path) -> Result<Self> {
        let config: CatalogConfig = Figment::from(Serialized::defaults(CatalogConfig::default()))
            .merge(Toml::file(config_path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config rooted at a source directory, keeping all other defaults
    pub fn for_source_dir(source_dir: impl Into<PathBuf>) -> Self {
        CatalogConfig {
            source_dir: source_dir.into(),
            ..CatalogConfig::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        regex::Regex::new(&self.kit_title_pattern)?;

        let ColumnLayout {
            identifier,
            description,
            quantity,
        } = self.columns;
        if identifier == description || identifier == quantity || description == quantity {
            return Err(CatalogError::Config(format!(
                "column layout must use distinct columns (identifier={identifier}, description={description}, quantity={quantity})"
            )));
        }

        if self.source_extension.trim().is_empty() {
            return Err(CatalogError::Config(
                "source_extension must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
