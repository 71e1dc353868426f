// 📜 Calculation history - persistence collaborator for calculation records
//
// The consolidation engine only reads through `CalculationSource`; the SQLite
// implementation below also owns projects and the writes made by the recorder.

use crate::error::{CatalogError, Result};
use crate::parser::parse_quantity;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Deserializer, Serialize};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

// ============================================================================
// CORE TYPES
// ============================================================================

/// Closed set of calculation kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CalculationKind {
    /// Cable sag / tension; suggests a kit and carries its materials
    Sag,

    /// Voltage drop; no materials
    VoltageDrop,
}

impl CalculationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CalculationKind::Sag => "SAG",
            CalculationKind::VoltageDrop => "VOLTAGE_DROP",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "SAG" => Some(CalculationKind::Sag),
            "VOLTAGE_DROP" => Some(CalculationKind::VoltageDrop),
            _ => None,
        }
    }

    pub fn carries_materials(&self) -> bool {
        matches!(self, CalculationKind::Sag)
    }
}

/// One entry of a calculation's materials bundle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterialEntry {
    pub code: String,
    #[serde(default)]
    pub description: String,
    #[serde(deserialize_with = "quantity_from_number_or_text")]
    pub quantity: f64,
}

/// Historical bundles store quantities either as numbers or as raw cell text
fn quantity_from_number_or_text<'de, D>(deserializer: D) -> std::result::Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    Ok(match Raw::deserialize(deserializer)? {
        Raw::Number(n) => n,
        Raw::Text(s) => parse_quantity(&s).unwrap_or(1.0),
    })
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalculationRecord {
    pub id: i64,
    pub project_id: i64,
    pub kind: CalculationKind,
    pub materials: Vec<MaterialEntry>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: i64,
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Read-only view the consolidation engine depends on
pub trait CalculationSource: Send + Sync {
    fn records_for_project(&self, project_id: i64) -> Result<Vec<CalculationRecord>>;
}

// ============================================================================
// SQLITE HISTORY
// ============================================================================

#[derive(Clone)]
pub struct SqliteHistory {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteHistory {
    pub fn open(path: &Path) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    pub fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS projects (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                description TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS calculation_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                project_id INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
                kind TEXT NOT NULL,
                inputs TEXT NOT NULL,
                results TEXT NOT NULL,
                materials TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_history_project ON calculation_history(project_id);",
        )?;
        Ok(SqliteHistory {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn connection(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CatalogError::LockPoisoned("history connection"))
    }

    pub fn create_project(&self, name: &str, description: Option<&str>) -> Result<i64> {
        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO projects (name, description, created_at) VALUES (?1, ?2, ?3)",
            params![name, description, Utc::now().to_rfc3339()],
        )?;
        let id = conn.last_insert_rowid();
        info!(project_id = id, name, "project created");
        Ok(id)
    }

    pub fn project(&self, project_id: i64) -> Result<Option<Project>> {
        let conn = self.connection()?;
        let project = conn
            .query_row(
                "SELECT id, name, description, created_at FROM projects WHERE id = ?1",
                [project_id],
                |row| {
                    let created_at: String = row.get(3)?;
                    Ok(Project {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        description: row.get(2)?,
                        created_at: parse_timestamp(&created_at),
                    })
                },
            )
            .optional()?;
        Ok(project)
    }

    /// Persist a calculation. Bundles on kinds that carry no materials are dropped.
    pub fn save_calculation(
        &self,
        project_id: i64,
        kind: CalculationKind,
        inputs: &serde_json::Value,
        results: &serde_json::Value,
        materials: &[MaterialEntry],
    ) -> Result<i64> {
        let materials_json = if kind.carries_materials() {
            Some(serde_json::to_string(materials)?)
        } else {
            None
        };

        let conn = self.connection()?;
        conn.execute(
            "INSERT INTO calculation_history
                (project_id, kind, inputs, results, materials, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                project_id,
                kind.as_str(),
                serde_json::to_string(inputs)?,
                serde_json::to_string(results)?,
                materials_json,
                Utc::now().to_rfc3339(),
            ],
        )?;
        let id = conn.last_insert_rowid();
        info!(calculation_id = id, project_id, kind = kind.as_str(), "calculation saved");
        Ok(id)
    }
}

impl CalculationSource for SqliteHistory {
    fn records_for_project(&self, project_id: i64) -> Result<Vec<CalculationRecord>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, project_id, kind, materials, created_at
             FROM calculation_history
             WHERE project_id = ?1
             ORDER BY created_at, id",
        )?;

        let rows = stmt
            .query_map([project_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, Option<String>>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(rows.len());
        for (id, project_id, kind, materials_json, created_at) in rows {
            let Some(kind) = CalculationKind::parse(&kind) else {
                warn!(calculation_id = id, kind = %kind, "unknown calculation kind, skipped");
                continue;
            };

            // A corrupt bundle degrades to an empty one rather than failing the report
            let materials = match materials_json.as_deref() {
                Some(json) if kind.carries_materials() => {
                    serde_json::from_str::<Vec<MaterialEntry>>(json).unwrap_or_else(|err| {
                        warn!(calculation_id = id, "unreadable materials bundle: {err}");
                        Vec::new()
                    })
                }
                _ => Vec::new(),
            };

            records.push(CalculationRecord {
                id,
                project_id,
                kind,
                materials,
                timestamp: parse_timestamp(&created_at),
            });
        }

        Ok(records)
    }
}

fn parse_timestamp(value: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entry(code: &str, description: &str, quantity: f64) -> MaterialEntry {
        MaterialEntry {
            code: code.to_string(),
            description: description.to_string(),
            quantity,
        }
    }

    #[test]
    fn test_save_and_read_back() {
        let history = SqliteHistory::open_in_memory().unwrap();
        let project = history.create_project("Linha Norte", None).unwrap();

        history
            .save_calculation(
                project,
                CalculationKind::Sag,
                &json!({"span": 40.0}),
                &json!({"sag": 0.8}),
                &[entry("C1", "Bracket", 2.0)],
            )
            .unwrap();
        history
            .save_calculation(
                project,
                CalculationKind::VoltageDrop,
                &json!({}),
                &json!({}),
                &[entry("IGNORED", "", 1.0)],
            )
            .unwrap();

        let records = history.records_for_project(project).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].kind, CalculationKind::Sag);
        assert_eq!(records[0].materials, vec![entry("C1", "Bracket", 2.0)]);
        assert!(records[1].materials.is_empty());

        assert_eq!(history.project(project).unwrap().unwrap().name, "Linha Norte");
        assert!(history.project(999).unwrap().is_none());
    }

    #[test]
    fn test_text_quantities_are_accepted() {
        let bundle: Vec<MaterialEntry> =
            serde_json::from_str(r#"[{"code":"C1","description":"Bolt","quantity":"10,5"},{"code":"C2","quantity":3}]"#)
                .unwrap();

        assert_eq!(bundle[0].quantity, 10.5);
        assert_eq!(bundle[1].quantity, 3.0);
        assert_eq!(bundle[1].description, "");
    }

    #[test]
    fn test_corrupt_bundle_degrades_to_empty() {
        let history = SqliteHistory::open_in_memory().unwrap();
        let project = history.create_project("P", None).unwrap();
        history
            .connection()
            .unwrap()
            .execute(
                "INSERT INTO calculation_history (project_id, kind, inputs, results, materials, created_at)
                 VALUES (?1, 'SAG', '{}', '{}', 'not json', ?2)",
                params![project, Utc::now().to_rfc3339()],
            )
            .unwrap();

        let records = history.records_for_project(project).unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].materials.is_empty());
    }

    #[test]
    fn test_unknown_project_has_no_records() {
        let history = SqliteHistory::open_in_memory().unwrap();
        assert!(history.records_for_project(42).unwrap().is_empty());
    }
}
