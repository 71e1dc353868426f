// 🗄️ Catalog Store - SQLite (WAL) table of kit → material lines
//
// Writers go through one transaction per rebuild; the shared connection is
// behind a mutex, so a reader sees either the pre-sync or the committed
// post-sync catalog, never a half-written one.

use crate::error::{CatalogError, Result, SyncStage};
use crate::fingerprint::{FingerprintState, SyncFingerprint};
use crate::parser::ParsedRow;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const META_LAST_SYNC: &str = "last_successful_sync";
const META_AGGREGATE: &str = "aggregate_fingerprint";

// ============================================================================
// RECORDS
// ============================================================================

/// One material line of a kit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialRecord {
    pub kit_name: String,
    pub code: String,
    pub description: String,
    pub quantity_per_kit: f64,

    /// Set out of band by the pricing workflow; survives rebuilds
    pub unit_price: Option<f64>,
    pub currency: String,
}

/// Record to upsert, with an optional explicit price
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialUpsert {
    pub kit_name: String,
    pub code: String,
    pub description: String,
    pub quantity_per_kit: f64,
    pub unit_price: Option<f64>,
    pub currency: Option<String>,
    pub source_file: Option<String>,
}

impl From<&ParsedRow> for MaterialUpsert {
    fn from(row: &ParsedRow) -> Self {
        MaterialUpsert {
            kit_name: row.kit_name.clone(),
            code: row.code.clone(),
            description: row.description.clone(),
            quantity_per_kit: row.quantity,
            unit_price: None,
            currency: None,
            source_file: Some(row.source_file.clone()),
        }
    }
}

/// Catalog content re-parsed from one source file
#[derive(Debug, Clone, Default)]
pub struct FileRebuild {
    pub source_file: String,
    pub kits: Vec<String>,
    pub records: Vec<MaterialUpsert>,
}

/// Price for a code, independent of kit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CodePrice {
    pub unit_price: f64,
    pub currency: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub code: String,
    pub kit_name: String,
    pub old_price: Option<f64>,
    pub new_price: f64,
    pub currency: String,
    pub changed_at: DateTime<Utc>,
}

/// Audit trail entry for a sync run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub data: serde_json::Value,
}

impl SyncEvent {
    pub fn new(event_type: &str, data: serde_json::Value) -> Self {
        SyncEvent {
            event_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            event_type: event_type.to_string(),
            data,
        }
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

pub fn setup_database(conn: &Connection) -> Result<()> {
    // WAL for crash recovery; in-memory databases report "memory" and that's fine
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS materials (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            kit_name TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            quantity_per_kit REAL NOT NULL,
            unit_price REAL,
            currency TEXT NOT NULL,
            source_file TEXT,
            updated_at TEXT NOT NULL,
            UNIQUE(kit_name, code)
        );

        CREATE TABLE IF NOT EXISTS kits (
            kit_name TEXT PRIMARY KEY,
            source_file TEXT,
            material_count INTEGER NOT NULL DEFAULT 0,
            synced_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_fingerprints (
            source_file TEXT PRIMARY KEY,
            marker TEXT NOT NULL,
            synced_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_metadata (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            event_id TEXT UNIQUE NOT NULL,
            timestamp TEXT NOT NULL,
            event_type TEXT NOT NULL,
            data TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS price_history (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            code TEXT NOT NULL,
            kit_name TEXT NOT NULL,
            old_price REAL,
            new_price REAL NOT NULL,
            currency TEXT NOT NULL,
            changed_at TEXT NOT NULL
        );

        -- Which source file declares which line / kit; a key can come from several files
        CREATE TABLE IF NOT EXISTS material_sources (
            source_file TEXT NOT NULL,
            kit_name TEXT NOT NULL,
            code TEXT NOT NULL,
            description TEXT NOT NULL,
            quantity_per_kit REAL NOT NULL,
            PRIMARY KEY (source_file, kit_name, code)
        );

        CREATE TABLE IF NOT EXISTS kit_sources (
            source_file TEXT NOT NULL,
            kit_name TEXT NOT NULL,
            PRIMARY KEY (source_file, kit_name)
        );

        CREATE INDEX IF NOT EXISTS idx_materials_code ON materials(code);
        CREATE INDEX IF NOT EXISTS idx_material_sources_key ON material_sources(kit_name, code);
        CREATE INDEX IF NOT EXISTS idx_materials_source ON materials(source_file);
        CREATE INDEX IF NOT EXISTS idx_price_history_code ON price_history(code);
        CREATE INDEX IF NOT EXISTS idx_sync_events_timestamp ON sync_events(timestamp);",
    )?;

    Ok(())
}

// ============================================================================
// CATALOG STORE
// ============================================================================

/// Injectable handle to the catalog; clones share one connection
#[derive(Clone)]
pub struct CatalogStore {
    conn: Arc<Mutex<Connection>>,
    default_currency: String,
}

impl CatalogStore {
    pub fn open(path: &Path, default_currency: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        Self::from_connection(Connection::open(path)?, default_currency)
    }

    pub fn open_in_memory(default_currency: &str) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, default_currency)
    }

    pub fn from_connection(conn: Connection, default_currency: &str) -> Result<Self> {
        setup_database(&conn)?;
        Ok(CatalogStore {
            conn: Arc::new(Mutex::new(conn)),
            default_currency: default_currency.to_string(),
        })
    }

    pub fn default_currency(&self) -> &str {
        &self.default_currency
    }

    /// Raw connection access for collaborators sharing the database file
    pub fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::LockPoisoned("catalog connection"))
    }

    // ------------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------------

    /// True once a sync has committed at least once
    pub fn is_initialized(&self) -> Result<bool> {
        let conn = self.connection()?;
        Ok(read_meta(&conn, META_LAST_SYNC)?.is_some())
    }

    pub fn last_successful_sync(&self) -> Result<Option<DateTime<Utc>>> {
        let conn = self.connection()?;
        Ok(read_meta(&conn, META_LAST_SYNC)?
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }

    /// Material lines of one kit, in code order.
    ///
    /// `KitNotFound` for an absent kit, `CatalogNotInitialized` before the
    /// first successful sync. A present kit with no lines is `Ok(vec![])`.
    pub fn lookup(&self, kit_name: &str) -> Result<Vec<MaterialRecord>> {
        let conn = self.connection()?;
        ensure_initialized(&conn)?;

        let kit_name = kit_name.trim();
        let known: Option<String> = conn
            .query_row(
                "SELECT kit_name FROM kits WHERE kit_name = ?1",
                [kit_name],
                |row| row.get(0),
            )
            .optional()?;

        let mut stmt = conn.prepare(
            "SELECT kit_name, code, description, quantity_per_kit, unit_price, currency
             FROM materials
             WHERE kit_name = ?1
             ORDER BY code",
        )?;
        let records = stmt
            .query_map([kit_name], row_to_material)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        if known.is_none() && records.is_empty() {
            return Err(CatalogError::KitNotFound(kit_name.to_string()));
        }

        Ok(records)
    }

    pub fn list_kits(&self) -> Result<Vec<String>> {
        let conn = self.connection()?;
        ensure_initialized(&conn)?;

        let mut stmt = conn.prepare(
            "SELECT kit_name FROM kits
             UNION
             SELECT DISTINCT kit_name FROM materials
             ORDER BY kit_name",
        )?;
        let kits = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(kits)
    }

    pub fn all_materials(&self) -> Result<Vec<MaterialRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT kit_name, code, description, quantity_per_kit, unit_price, currency
             FROM materials
             ORDER BY kit_name, code",
        )?;
        let records = stmt
            .query_map([], row_to_material)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(records)
    }

    pub fn material_count(&self) -> Result<i64> {
        let conn = self.connection()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM materials", [], |row| row.get(0))?)
    }

    pub fn kit_count(&self) -> Result<i64> {
        let conn = self.connection()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM kits", [], |row| row.get(0))?)
    }

    /// Unit prices by code. A code priced in several kits resolves to the
    /// alphabetically first kit that carries a price.
    pub fn prices_for_codes(&self, codes: &[String]) -> Result<HashMap<String, CodePrice>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT unit_price, currency FROM materials
             WHERE code = ?1 AND unit_price IS NOT NULL
             ORDER BY kit_name
             LIMIT 1",
        )?;

        let mut prices = HashMap::new();
        for code in codes {
            let price = stmt
                .query_row([code], |row| {
                    Ok(CodePrice {
                        unit_price: row.get(0)?,
                        currency: row.get(1)?,
                    })
                })
                .optional()?;
            if let Some(price) = price {
                prices.insert(code.clone(), price);
            }
        }
        Ok(prices)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Keyed upsert of records in one transaction; returns rows written
    pub fn upsert_batch(&self, records: &[MaterialUpsert]) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn.transaction()?;
        let written = upsert_records(&tx, records, &self.default_currency)?;
        touch_kits(&tx, records.iter().map(|r| (r.kit_name.as_str(), r.source_file.as_deref())))?;
        refresh_kit_counts(&tx)?;
        tx.commit()?;
        Ok(written)
    }

    /// Apply a full rebuild of the given files plus their fingerprints in a
    /// single transaction. Nothing is visible unless everything commits.
    ///
    /// Failures are `SyncTransactionFailure` tagged `Write` or `Commit`.
    pub fn apply_rebuild(
        &self,
        rebuilds: &[FileRebuild],
        fingerprints: &[SyncFingerprint],
        aggregate: &str,
    ) -> Result<usize> {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction()
            .map_err(|e| CatalogError::sync_failure(SyncStage::Write, e))?;

        let written = write_rebuild(&tx, rebuilds, fingerprints, aggregate, &self.default_currency)
            .map_err(|e| CatalogError::sync_failure(SyncStage::Write, e))?;

        // Deferred constraints are only checked here
        tx.commit()
            .map_err(|e| CatalogError::sync_failure(SyncStage::Commit, e))?;
        Ok(written)
    }

    /// Declared lines or kits (per source provenance) missing from the catalog
    pub fn missing_declared_entries(&self) -> Result<i64> {
        let conn = self.connection()?;
        Ok(conn.query_row(
            "SELECT
                (SELECT COUNT(*) FROM (
                    SELECT DISTINCT kit_name, code FROM material_sources ms
                    WHERE NOT EXISTS (
                        SELECT 1 FROM materials m
                        WHERE m.kit_name = ms.kit_name AND m.code = ms.code)))
              + (SELECT COUNT(*) FROM (
                    SELECT DISTINCT kit_name FROM kit_sources ks
                    WHERE NOT EXISTS (SELECT 1 FROM kits k WHERE k.kit_name = ks.kit_name)))",
            [],
            |row| row.get(0),
        )?)
    }

    /// Forget all fingerprints so the next sync rebuilds everything
    pub fn clear_fingerprints(&self) -> Result<()> {
        let conn = self.connection()?;
        conn.execute("DELETE FROM sync_fingerprints", [])?;
        conn.execute("DELETE FROM sync_metadata WHERE key = ?1", [META_AGGREGATE])?;
        Ok(())
    }

    pub fn fingerprints(&self) -> Result<FingerprintState> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT source_file, marker FROM sync_fingerprints")?;
        let per_file: BTreeMap<String, String> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;

        Ok(FingerprintState {
            per_file,
            aggregate: read_meta(&conn, META_AGGREGATE)?,
        })
    }

    // ------------------------------------------------------------------------
    // Pricing workflow
    // ------------------------------------------------------------------------

    /// Set the unit price of a code (in one kit, or in every kit carrying it)
    /// and record each effective change. Returns the number of lines updated.
    pub fn set_unit_price(
        &self,
        code: &str,
        kit_name: Option<&str>,
        unit_price: f64,
        currency: Option<&str>,
    ) -> Result<usize> {
        let mut conn = self.connection()?;
        ensure_initialized(&conn)?;
        let tx = conn.transaction()?;

        let current: Vec<(String, Option<f64>, String)> = {
            let mut stmt = tx.prepare(
                "SELECT kit_name, unit_price, currency FROM materials
                 WHERE code = ?1 AND (?2 IS NULL OR kit_name = ?2)",
            )?;
            let rows = stmt
                .query_map(params![code, kit_name], |row| {
                    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows
        };

        if current.is_empty() {
            if let Some(kit) = kit_name {
                return Err(CatalogError::KitNotFound(kit.to_string()));
            }
            return Ok(0);
        }

        let now = Utc::now().to_rfc3339();
        let mut updated = 0;
        for (kit, old_price, old_currency) in current {
            let new_currency = currency.unwrap_or(&old_currency);
            if old_price == Some(unit_price) && new_currency == old_currency {
                continue;
            }

            tx.execute(
                "UPDATE materials SET unit_price = ?1, currency = ?2, updated_at = ?3
                 WHERE kit_name = ?4 AND code = ?5",
                params![unit_price, new_currency, now, kit, code],
            )?;
            tx.execute(
                "INSERT INTO price_history (code, kit_name, old_price, new_price, currency, changed_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![code, kit, old_price, unit_price, new_currency, now],
            )?;
            updated += 1;
        }

        tx.commit()?;
        Ok(updated)
    }

    /// Price changes for a code, newest first
    pub fn price_history(&self, code: &str) -> Result<Vec<PriceChange>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT code, kit_name, old_price, new_price, currency, changed_at
             FROM price_history
             WHERE code = ?1
             ORDER BY changed_at DESC, id DESC",
        )?;

        let changes = stmt
            .query_map([code], |row| {
                let changed_at: String = row.get(5)?;
                Ok(PriceChange {
                    code: row.get(0)?,
                    kit_name: row.get(1)?,
                    old_price: row.get(2)?,
                    new_price: row.get(3)?,
                    currency: row.get(4)?,
                    changed_at: parse_timestamp(&changed_at),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(changes)
    }

    // ------------------------------------------------------------------------
    // Audit trail
    // ------------------------------------------------------------------------

    pub fn record_event(&self, event: &SyncEvent) -> Result<()> {
        let conn = self.connection()?;
        let data_json = serde_json::to_string(&event.data)?;
        conn.execute(
            "INSERT INTO sync_events (event_id, timestamp, event_type, data)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                event.event_id,
                event.timestamp.to_rfc3339(),
                event.event_type,
                data_json,
            ],
        )?;
        Ok(())
    }

    pub fn recent_events(&self, limit: usize) -> Result<Vec<SyncEvent>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT event_id, timestamp, event_type, data
             FROM sync_events
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let events = stmt
            .query_map([limit as i64], |row| {
                let timestamp: String = row.get(1)?;
                let data_json: String = row.get(3)?;
                Ok(SyncEvent {
                    event_id: row.get(0)?,
                    timestamp: parse_timestamp(&timestamp),
                    event_type: row.get(2)?,
                    data: serde_json::from_str(&data_json).unwrap_or(serde_json::Value::Null),
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(events)
    }
}

// ============================================================================
// HELPERS
// ============================================================================

fn ensure_initialized(conn: &Connection) -> Result<()> {
    if read_meta(conn, META_LAST_SYNC)?.is_none() {
        return Err(CatalogError::CatalogNotInitialized);
    }
    Ok(())
}

fn read_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row("SELECT value FROM sync_metadata WHERE key = ?1", [key], |row| {
            row.get(0)
        })
        .optional()?)
}

fn write_meta(tx: &Transaction<'_>, key: &str, value: &str) -> Result<()> {
    tx.execute(
        "INSERT INTO sync_metadata (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        params![key, value],
    )?;
    Ok(())
}

fn write_rebuild(
    tx: &Transaction<'_>,
    rebuilds: &[FileRebuild],
    fingerprints: &[SyncFingerprint],
    aggregate: &str,
    default_currency: &str,
) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let mut written = 0;

    for rebuild in rebuilds {
        written += upsert_records(tx, &rebuild.records, default_currency)?;
        replace_file_lines(tx, rebuild)?;

        touch_kits(
            tx,
            rebuild
                .kits
                .iter()
                .map(|k| (k.as_str(), Some(rebuild.source_file.as_str()))),
        )?;
    }
    refresh_kit_counts(tx)?;

    for fp in fingerprints {
        tx.execute(
            "INSERT INTO sync_fingerprints (source_file, marker, synced_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(source_file) DO UPDATE SET
                marker = excluded.marker,
                synced_at = excluded.synced_at",
            params![fp.source_file, fp.marker, now],
        )?;
    }
    write_meta(tx, META_AGGREGATE, aggregate)?;
    write_meta(tx, META_LAST_SYNC, &now)?;

    Ok(written)
}

/// Upsert on (kit_name, code): description and quantity are overwritten,
/// price and currency only when the record carries them.
fn upsert_records(
    tx: &Transaction<'_>,
    records: &[MaterialUpsert],
    default_currency: &str,
) -> Result<usize> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = tx.prepare(
        "INSERT INTO materials
            (kit_name, code, description, quantity_per_kit, unit_price, currency, source_file, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, ?7), ?8, ?9)
         ON CONFLICT(kit_name, code) DO UPDATE SET
            description = excluded.description,
            quantity_per_kit = excluded.quantity_per_kit,
            unit_price = COALESCE(?5, materials.unit_price),
            currency = COALESCE(?6, materials.currency),
            source_file = COALESCE(excluded.source_file, materials.source_file),
            updated_at = excluded.updated_at",
    )?;

    let mut written = 0;
    for record in records {
        written += stmt.execute(params![
            record.kit_name,
            record.code,
            record.description,
            record.quantity_per_kit,
            record.unit_price,
            record.currency,
            default_currency,
            record.source_file,
            now,
        ])?;
    }
    Ok(written)
}

/// Swap a re-parsed file's provenance for its new content, then settle the
/// lines and kits it no longer declares: a key still declared by another
/// file falls back to that file's values, otherwise it is removed.
fn replace_file_lines(tx: &Transaction<'_>, rebuild: &FileRebuild) -> Result<usize> {
    let file = rebuild.source_file.as_str();

    let old_lines: Vec<(String, String)> = {
        let mut stmt =
            tx.prepare("SELECT kit_name, code FROM material_sources WHERE source_file = ?1")?;
        let rows = stmt
            .query_map([file], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };
    let old_kits: Vec<String> = {
        let mut stmt = tx.prepare("SELECT kit_name FROM kit_sources WHERE source_file = ?1")?;
        let rows = stmt
            .query_map([file], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    tx.execute("DELETE FROM material_sources WHERE source_file = ?1", [file])?;
    tx.execute("DELETE FROM kit_sources WHERE source_file = ?1", [file])?;
    {
        let mut line_stmt = tx.prepare(
            "INSERT OR REPLACE INTO material_sources
                (source_file, kit_name, code, description, quantity_per_kit)
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )?;
        for record in &rebuild.records {
            line_stmt.execute(params![
                file,
                record.kit_name,
                record.code,
                record.description,
                record.quantity_per_kit,
            ])?;
        }
        let mut kit_stmt =
            tx.prepare("INSERT OR IGNORE INTO kit_sources (source_file, kit_name) VALUES (?1, ?2)")?;
        for kit in &rebuild.kits {
            kit_stmt.execute(params![file, kit])?;
        }
    }

    let keep: BTreeSet<(&str, &str)> = rebuild
        .records
        .iter()
        .map(|r| (r.kit_name.as_str(), r.code.as_str()))
        .collect();
    let now = Utc::now().to_rfc3339();
    let mut pruned = 0;

    for (kit, code) in old_lines {
        if keep.contains(&(kit.as_str(), code.as_str())) {
            continue;
        }

        let fallback: Option<(String, f64, String)> = tx
            .query_row(
                "SELECT description, quantity_per_kit, source_file FROM material_sources
                 WHERE kit_name = ?1 AND code = ?2
                 ORDER BY source_file
                 LIMIT 1",
                params![kit, code],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        match fallback {
            Some((description, quantity, other_file)) => {
                tx.execute(
                    "UPDATE materials
                     SET description = ?1, quantity_per_kit = ?2, source_file = ?3, updated_at = ?4
                     WHERE kit_name = ?5 AND code = ?6",
                    params![description, quantity, other_file, now, kit, code],
                )?;
            }
            None => {
                pruned += tx.execute(
                    "DELETE FROM materials WHERE kit_name = ?1 AND code = ?2",
                    params![kit, code],
                )?;
            }
        }
    }

    let declared: BTreeSet<&str> = rebuild.kits.iter().map(String::as_str).collect();
    for kit in old_kits {
        if declared.contains(kit.as_str()) {
            continue;
        }
        tx.execute(
            "DELETE FROM kits WHERE kit_name = ?1
               AND kit_name NOT IN (SELECT kit_name FROM kit_sources)
               AND kit_name NOT IN (SELECT DISTINCT kit_name FROM materials)",
            [&kit],
        )?;
    }

    Ok(pruned)
}

fn touch_kits<'a>(
    tx: &Transaction<'_>,
    kits: impl Iterator<Item = (&'a str, Option<&'a str>)>,
) -> Result<()> {
    let now = Utc::now().to_rfc3339();
    let mut stmt = tx.prepare(
        "INSERT INTO kits (kit_name, source_file, material_count, synced_at)
         VALUES (?1, ?2, 0, ?3)
         ON CONFLICT(kit_name) DO UPDATE SET
            source_file = COALESCE(excluded.source_file, kits.source_file),
            synced_at = excluded.synced_at",
    )?;
    for (kit, source_file) in kits {
        stmt.execute(params![kit, source_file, now])?;
    }
    Ok(())
}

fn refresh_kit_counts(tx: &Transaction<'_>) -> Result<()> {
    tx.execute(
        "UPDATE kits SET material_count =
            (SELECT COUNT(*) FROM materials WHERE materials.kit_name = kits.kit_name)",
        [],
    )?;
    Ok(())
}

fn row_to_material(row: &rusqlite::Row<'_>) -> rusqlite::Result<MaterialRecord> {
    Ok(MaterialRecord {
        kit_name: row.get(0)?,
        code: row.get(1)?,
        description: row.get(2)?,
        quantity_per_kit: row.get(3)?,
        unit_price: row.get(4)?,
        currency: row.get(5)?,
    })
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
