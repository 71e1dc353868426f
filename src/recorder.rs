// 📝 Calculation Recorder - runs a calculation and files it under a project
//
// The formulas live behind `Calculator`; this module only wires their output
// to the catalog (kit → materials bundle) and to the history store.

use crate::db::CatalogStore;
use crate::error::Result;
use crate::history::{CalculationKind, MaterialEntry, SqliteHistory};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

// ============================================================================
// CALCULATOR CONTRACT
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SagInputs {
    pub span: f64,
    pub weight_per_unit: f64,
    pub initial_tension: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagResult {
    pub sag: f64,
    pub suggested_kit_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VoltageDropInputs {
    pub nominal_voltage: f64,
    pub current: f64,
    pub length: f64,
    pub resistance_per_km: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VoltageDropResult {
    pub drop_volts: f64,
    pub drop_percent: f64,
    pub status: String,
}

/// Pure engineering formulas, consumed as a black box
pub trait Calculator: Send + Sync {
    fn compute_sag(&self, inputs: &SagInputs) -> SagResult;
    fn compute_voltage_drop(&self, inputs: &VoltageDropInputs) -> VoltageDropResult;
}

/// A calculation as it was stored
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordedCalculation<R> {
    pub id: i64,
    pub project_id: i64,
    pub result: R,
    pub materials: Vec<MaterialEntry>,
}

// ============================================================================
// RECORDER
// ============================================================================

pub struct CalculationRecorder {
    calculator: Arc<dyn Calculator>,
    catalog: CatalogStore,
    history: SqliteHistory,
}

impl CalculationRecorder {
    pub fn new(calculator: Arc<dyn Calculator>, catalog: CatalogStore, history: SqliteHistory) -> Self {
        CalculationRecorder {
            calculator,
            catalog,
            history,
        }
    }

    /// Compute sag, resolve the suggested kit and store its materials as the
    /// record's bundle. Fails with `KitNotFound` if the catalog lacks the kit.
    pub fn record_sag(&self, project_id: i64, inputs: &SagInputs) -> Result<RecordedCalculation<SagResult>> {
        let result = self.calculator.compute_sag(inputs);
        let materials: Vec<MaterialEntry> = self
            .catalog
            .lookup(&result.suggested_kit_name)?
            .into_iter()
            .map(|m| MaterialEntry {
                code: m.code,
                description: m.description,
                quantity: m.quantity_per_kit,
            })
            .collect();

        let id = self.history.save_calculation(
            project_id,
            CalculationKind::Sag,
            &serde_json::to_value(inputs)?,
            &serde_json::to_value(&result)?,
            &materials,
        )?;

        info!(
            calculation_id = id,
            project_id,
            kit = %result.suggested_kit_name,
            materials = materials.len(),
            "sag calculation recorded"
        );
        Ok(RecordedCalculation {
            id,
            project_id,
            result,
            materials,
        })
    }

    pub fn record_voltage_drop(
        &self,
        project_id: i64,
        inputs: &VoltageDropInputs,
    ) -> Result<RecordedCalculation<VoltageDropResult>> {
        let result = self.calculator.compute_voltage_drop(inputs);
        let id = self.history.save_calculation(
            project_id,
            CalculationKind::VoltageDrop,
            &serde_json::to_value(inputs)?,
            &serde_json::to_value(&result)?,
            &[],
        )?;

        info!(calculation_id = id, project_id, status = %result.status, "voltage drop recorded");
        Ok(RecordedCalculation {
            id,
            project_id,
            result,
            materials: Vec::new(),
        })
    }
}
