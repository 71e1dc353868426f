// 🧮 Consolidation Engine - one deduplicated bill of materials per project
//
// Quantities are summed per material code across every calculation that
// carries a bundle. First-seen description wins: descriptions are assumed
// consistent per code, and a conflict is logged, not fatal.

use crate::error::Result;
use crate::history::{CalculationRecord, CalculationSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidatedLineItem {
    pub code: String,
    pub description: String,
    pub aggregated_quantity: f64,
    pub unit: String,
}

pub struct ConsolidationEngine {
    history: Arc<dyn CalculationSource>,
    default_unit: String,
}

impl ConsolidationEngine {
    pub fn new(history: Arc<dyn CalculationSource>, default_unit: &str) -> Self {
        ConsolidationEngine {
            history,
            default_unit: default_unit.to_string(),
        }
    }

    /// Deduplicated line items for a project, sorted by description.
    /// A project with no calculations yields an empty list.
    pub fn consolidate(&self, project_id: i64) -> Result<Vec<ConsolidatedLineItem>> {
        let records = self.history.records_for_project(project_id)?;
        let items = consolidate_records(&records, &self.default_unit);

        info!(
            project_id,
            calculations = records.len(),
            unique_items = items.len(),
            "material report consolidated"
        );
        Ok(items)
    }
}

/// Pure aggregation over a fixed set of records. The result does not depend
/// on the order of `records`: descriptions are taken in (timestamp, id) order
/// and each code's quantities are summed in ascending order.
pub fn consolidate_records(records: &[CalculationRecord], unit: &str) -> Vec<ConsolidatedLineItem> {
    let mut ordered: Vec<&CalculationRecord> = records
        .iter()
        .filter(|r| r.kind.carries_materials())
        .collect();
    ordered.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

    let mut by_code: HashMap<&str, (ConsolidatedLineItem, Vec<f64>)> = HashMap::new();

    for record in ordered {
        for entry in &record.materials {
            match by_code.get_mut(entry.code.as_str()) {
                Some((item, quantities)) => {
                    quantities.push(entry.quantity);
                    if item.description.is_empty() && !entry.description.is_empty() {
                        item.description = entry.description.clone();
                    } else if !entry.description.is_empty() && item.description != entry.description {
                        debug!(
                            code = %entry.code,
                            kept = %item.description,
                            ignored = %entry.description,
                            "conflicting description for code"
                        );
                    }
                }
                None => {
                    by_code.insert(
                        entry.code.as_str(),
                        (
                            ConsolidatedLineItem {
                                code: entry.code.clone(),
                                description: entry.description.clone(),
                                aggregated_quantity: 0.0,
                                unit: unit.to_string(),
                            },
                            vec![entry.quantity],
                        ),
                    );
                }
            }
        }
    }

    let mut items: Vec<ConsolidatedLineItem> = by_code
        .into_values()
        .map(|(mut item, mut quantities)| {
            quantities.sort_by(f64::total_cmp);
            item.aggregated_quantity = quantities.iter().sum();
            item
        })
        .collect();
    items.sort_by(|a, b| {
        a.description
            .cmp(&b.description)
            .then_with(|| a.code.cmp(&b.code))
    });
    items
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::{CalculationKind, MaterialEntry};
    use chrono::Utc;

    fn record(id: i64, kind: CalculationKind, entries: &[(&str, &str, f64)]) -> CalculationRecord {
        CalculationRecord {
            id,
            project_id: 7,
            kind,
            materials: entries
                .iter()
                .map(|(code, description, quantity)| MaterialEntry {
                    code: code.to_string(),
                    description: description.to_string(),
                    quantity: *quantity,
                })
                .collect(),
            timestamp: Utc::now(),
        }
    }

    struct FixedHistory(Vec<CalculationRecord>);

    impl CalculationSource for FixedHistory {
        fn records_for_project(&self, project_id: i64) -> Result<Vec<CalculationRecord>> {
            Ok(self
                .0
                .iter()
                .filter(|r| r.project_id == project_id)
                .cloned()
                .collect())
        }
    }

    #[test]
    fn test_two_bundles_sum_per_code() {
        let records = vec![
            record(1, CalculationKind::Sag, &[("C1", "Bracket", 2.0)]),
            record(2, CalculationKind::Sag, &[("C1", "Bracket", 3.0), ("C2", "Bolt", 1.0)]),
        ];
        let engine = ConsolidationEngine::new(Arc::new(FixedHistory(records)), "UN");

        let items = engine.consolidate(7).unwrap();

        assert_eq!(items.len(), 2);
        let c1 = items.iter().find(|i| i.code == "C1").unwrap();
        let c2 = items.iter().find(|i| i.code == "C2").unwrap();
        assert_eq!(c1.aggregated_quantity, 5.0);
        assert_eq!(c2.aggregated_quantity, 1.0);
        assert_eq!(c1.unit, "UN");
    }

    #[test]
    fn test_sorted_by_description() {
        let records = vec![record(
            1,
            CalculationKind::Sag,
            &[("Z9", "Arruela", 1.0), ("A1", "Poste", 1.0), ("B2", "Cinta", 1.0)],
        )];

        let items = consolidate_records(&records, "UN");
        let descriptions: Vec<&str> = items.iter().map(|i| i.description.as_str()).collect();
        assert_eq!(descriptions, vec!["Arruela", "Cinta", "Poste"]);
    }

    #[test]
    fn test_fractional_sums_do_not_depend_on_record_order() {
        let mut records = vec![
            record(1, CalculationKind::Sag, &[("C1", "Bracket", 0.1), ("C2", "Nut", 0.5)]),
            record(2, CalculationKind::Sag, &[("C1", "Bracket", 0.2)]),
            record(3, CalculationKind::Sag, &[("C1", "Bracket", 0.3), ("C2", "Nut", 0.7)]),
        ];
        let forward = consolidate_records(&records, "UN");
        records.reverse();
        let backward = consolidate_records(&records, "UN");
        records.swap(0, 1);
        let shuffled = consolidate_records(&records, "UN");

        assert_eq!(forward, backward);
        assert_eq!(forward, shuffled);
        let c1 = forward.iter().find(|i| i.code == "C1").unwrap();
        assert!((c1.aggregated_quantity - 0.6).abs() < 1e-12);
    }

    #[test]
    fn test_first_description_follows_recorded_order_not_slice_order() {
        let mut records = vec![
            record(2, CalculationKind::Sag, &[("C1", "Bracket (old)", 1.0)]),
            record(1, CalculationKind::Sag, &[("C1", "Bracket", 1.0)]),
        ];
        records[1].timestamp = records[0].timestamp;

        let items = consolidate_records(&records, "UN");
        assert_eq!(items[0].description, "Bracket");
    }

    #[test]
    fn test_first_description_wins() {
        let records = vec![
            record(1, CalculationKind::Sag, &[("C1", "Bracket", 1.0)]),
            record(2, CalculationKind::Sag, &[("C1", "Bracket (old)", 1.0)]),
        ];
        let items = consolidate_records(&records, "UN");
        assert_eq!(items[0].description, "Bracket");
    }

    #[test]
    fn test_kinds_without_materials_ignored() {
        let records = vec![record(1, CalculationKind::VoltageDrop, &[("C1", "Bracket", 1.0)])];
        assert!(consolidate_records(&records, "UN").is_empty());
    }

    #[test]
    fn test_no_records_is_empty() {
        let engine = ConsolidationEngine::new(Arc::new(FixedHistory(Vec::new())), "UN");
        assert!(engine.consolidate(7).unwrap().is_empty());
    }
}
