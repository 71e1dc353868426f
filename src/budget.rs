// 💰 Budget Resolver - prices a project's consolidated bill of materials
//
// Prices come from the *current* catalog, joined by material code (pricing
// is kit-independent). Unpriced codes degrade to zero with a flag. Totals are
// kept per currency; a single `total` is only reported when every priced line
// shares one currency.

use crate::consolidation::{ConsolidatedLineItem, ConsolidationEngine};
use crate::db::CatalogStore;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetLineItem {
    #[serde(flatten)]
    pub item: ConsolidatedLineItem,
    pub unit_price: f64,
    pub currency: String,
    pub subtotal: f64,

    /// No catalog price exists for this code
    pub unpriced: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BudgetReport {
    pub project_id: i64,
    pub items: Vec<BudgetLineItem>,

    /// Sum of subtotals; None when priced lines mix currencies
    pub total: Option<f64>,

    /// Report currency; None when priced lines mix currencies
    pub currency: Option<String>,

    pub totals_by_currency: BTreeMap<String, f64>,
    pub unpriced_count: usize,
}

impl BudgetReport {
    pub fn has_mixed_currencies(&self) -> bool {
        self.totals_by_currency.len() > 1
    }
}

/// Round half away from zero to two decimals
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub struct BudgetResolver {
    store: CatalogStore,
    consolidation: ConsolidationEngine,
}

impl BudgetResolver {
    pub fn new(store: CatalogStore, consolidation: ConsolidationEngine) -> Self {
        BudgetResolver {
            store,
            consolidation,
        }
    }

    pub fn resolve_budget(&self, project_id: i64) -> Result<BudgetReport> {
        let items = self.consolidation.consolidate(project_id)?;
        let report = self.price_items(project_id, items)?;

        if report.has_mixed_currencies() {
            warn!(
                project_id,
                currencies = ?report.totals_by_currency.keys().collect::<Vec<_>>(),
                "budget mixes currencies; no single total reported"
            );
        }
        info!(
            project_id,
            items = report.items.len(),
            unpriced = report.unpriced_count,
            total = ?report.total,
            "budget resolved"
        );
        Ok(report)
    }

    /// Join consolidated items with catalog prices
    pub fn price_items(
        &self,
        project_id: i64,
        items: Vec<ConsolidatedLineItem>,
    ) -> Result<BudgetReport> {
        let codes: Vec<String> = items.iter().map(|i| i.code.clone()).collect();
        let prices = self.store.prices_for_codes(&codes)?;
        let default_currency = self.store.default_currency().to_string();

        let mut totals_by_currency: BTreeMap<String, f64> = BTreeMap::new();
        let mut unpriced_count = 0;
        let mut lines = Vec::with_capacity(items.len());

        for item in items {
            let line = match prices.get(&item.code) {
                Some(price) => {
                    let subtotal = round2(item.aggregated_quantity * price.unit_price);
                    *totals_by_currency.entry(price.currency.clone()).or_insert(0.0) += subtotal;
                    BudgetLineItem {
                        unit_price: price.unit_price,
                        currency: price.currency.clone(),
                        subtotal,
                        unpriced: false,
                        item,
                    }
                }
                None => {
                    unpriced_count += 1;
                    BudgetLineItem {
                        unit_price: 0.0,
                        currency: default_currency.clone(),
                        subtotal: 0.0,
                        unpriced: true,
                        item,
                    }
                }
            };
            lines.push(line);
        }

        for total in totals_by_currency.values_mut() {
            *total = round2(*total);
        }

        let (total, currency) = match totals_by_currency.len() {
            0 => (Some(0.0), Some(default_currency)),
            1 => totals_by_currency
                .iter()
                .next()
                .map(|(currency, total)| (Some(*total), Some(currency.clone())))
                .unwrap_or((None, None)),
            _ => (None, None),
        };

        Ok(BudgetReport {
            project_id,
            items: lines,
            total,
            currency,
            totals_by_currency,
            unpriced_count,
        })
    }
}
