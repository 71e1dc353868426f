use kit_catalog::{
    BudgetResolver, CalculationKind, CalculationRecorder, Calculator, CatalogConfig, CatalogStore,
    ConsolidationEngine, MaterialEntry, SagInputs, SagResult, SqliteHistory, SyncOrchestrator,
    VoltageDropInputs, VoltageDropResult,
};
use serde_json::json;
use std::fs;
use std::sync::Arc;
use tempfile::TempDir;

struct Fixture {
    _temp: TempDir,
    store: CatalogStore,
    history: SqliteHistory,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let source_dir = temp.path().join("sources");
        fs::create_dir_all(&source_dir).expect("create sources");
        fs::write(
            source_dir.join("kits.csv"),
            ",KIT-A,,\n,C1,Bracket,2\n,C2,Bolt,\"10,5\"\n,CE2 BRAÇO J,,\n,C1,Bracket,1\n,C3,Poste,1\n",
        )
        .expect("write source");

        let db_path = temp.path().join("catalog.db");
        let config = CatalogConfig::for_source_dir(&source_dir);
        let store = CatalogStore::open(&db_path, &config.default_currency).expect("store");
        SyncOrchestrator::from_config(&config, store.clone())
            .expect("orchestrator")
            .sync()
            .expect("sync");
        let history = SqliteHistory::open(&db_path).expect("history");

        Fixture {
            _temp: temp,
            store,
            history,
        }
    }

    fn resolver(&self) -> BudgetResolver {
        BudgetResolver::new(
            self.store.clone(),
            ConsolidationEngine::new(Arc::new(self.history.clone()), "UN"),
        )
    }

    fn sag(&self, project: i64, bundle: &[(&str, &str, f64)]) {
        let materials: Vec<MaterialEntry> = bundle
            .iter()
            .map(|(code, description, quantity)| MaterialEntry {
                code: code.to_string(),
                description: description.to_string(),
                quantity: *quantity,
            })
            .collect();
        self.history
            .save_calculation(project, CalculationKind::Sag, &json!({}), &json!({}), &materials)
            .expect("save calculation");
    }
}

#[test]
fn test_unpriced_line_is_flagged_not_fatal() {
    let fx = Fixture::new();
    fx.store.set_unit_price("C1", None, 4.2, None).expect("price C1");

    let project = fx.history.create_project("Linha Norte", None).unwrap();
    fx.sag(project, &[("C1", "Bracket", 2.0)]);
    fx.sag(project, &[("C1", "Bracket", 3.0), ("C2", "Bolt", 1.0)]);

    let report = fx.resolver().resolve_budget(project).expect("budget");

    assert_eq!(report.items.len(), 2);
    let c1 = report.items.iter().find(|l| l.item.code == "C1").unwrap();
    let c2 = report.items.iter().find(|l| l.item.code == "C2").unwrap();
    assert_eq!(c1.item.aggregated_quantity, 5.0);
    assert_eq!(c1.subtotal, 21.0);
    assert!(!c1.unpriced);
    assert_eq!(c2.subtotal, 0.0);
    assert!(c2.unpriced);

    assert_eq!(report.unpriced_count, 1);
    assert_eq!(report.total, Some(21.0));
    assert_eq!(report.currency.as_deref(), Some("BRL"));
}

#[test]
fn test_mixed_currencies_have_no_single_total() {
    let fx = Fixture::new();
    fx.store.set_unit_price("C1", None, 4.2, None).unwrap();
    fx.store.set_unit_price("C2", None, 1.5, Some("USD")).unwrap();

    let project = fx.history.create_project("P", None).unwrap();
    fx.sag(project, &[("C1", "Bracket", 5.0), ("C2", "Bolt", 2.0)]);

    let report = fx.resolver().resolve_budget(project).unwrap();

    assert!(report.has_mixed_currencies());
    assert_eq!(report.total, None);
    assert_eq!(report.currency, None);
    assert_eq!(report.totals_by_currency["BRL"], 21.0);
    assert_eq!(report.totals_by_currency["USD"], 3.0);
}

#[test]
fn test_budget_uses_current_prices() {
    let fx = Fixture::new();
    fx.store.set_unit_price("C1", None, 4.2, None).unwrap();
    let project = fx.history.create_project("P", None).unwrap();
    fx.sag(project, &[("C1", "Bracket", 5.0)]);

    assert_eq!(fx.resolver().resolve_budget(project).unwrap().total, Some(21.0));

    fx.store.set_unit_price("C1", None, 5.0, None).unwrap();
    assert_eq!(fx.resolver().resolve_budget(project).unwrap().total, Some(25.0));
    assert_eq!(fx.store.price_history("C1").unwrap()[0].new_price, 5.0);
}

#[test]
fn test_project_without_calculations_has_empty_budget() {
    let fx = Fixture::new();
    let project = fx.history.create_project("Empty", None).unwrap();

    let report = fx.resolver().resolve_budget(project).unwrap();

    assert!(report.items.is_empty());
    assert_eq!(report.total, Some(0.0));
    assert_eq!(report.unpriced_count, 0);
}

struct FixedCalculator;

impl Calculator for FixedCalculator {
    fn compute_sag(&self, inputs: &SagInputs) -> SagResult {
        SagResult {
            sag: inputs.span / 100.0,
            suggested_kit_name: "CE2 BRAÇO J".to_string(),
        }
    }

    fn compute_voltage_drop(&self, _inputs: &VoltageDropInputs) -> VoltageDropResult {
        VoltageDropResult {
            drop_volts: 1.0,
            drop_percent: 0.5,
            status: "WITHIN_LIMIT".to_string(),
        }
    }
}

#[test]
fn test_recorded_calculations_flow_into_budget() {
    let fx = Fixture::new();
    fx.store.set_unit_price("C3", None, 850.0, None).unwrap();
    let project = fx.history.create_project("Rede Sul", Some("two spans")).unwrap();

    let recorder = CalculationRecorder::new(Arc::new(FixedCalculator), fx.store.clone(), fx.history.clone());
    let inputs = SagInputs {
        span: 40.0,
        weight_per_unit: 0.5,
        initial_tension: 100.0,
    };
    recorder.record_sag(project, &inputs).expect("first span");
    recorder.record_sag(project, &inputs).expect("second span");
    recorder
        .record_voltage_drop(
            project,
            &VoltageDropInputs {
                nominal_voltage: 220.0,
                current: 10.0,
                length: 50.0,
                resistance_per_km: 3.0,
            },
        )
        .expect("voltage drop");

    let report = fx.resolver().resolve_budget(project).unwrap();

    let codes: Vec<&str> = report.items.iter().map(|l| l.item.code.as_str()).collect();
    assert_eq!(codes, vec!["C1", "C3"]);
    assert_eq!(report.items[1].item.aggregated_quantity, 2.0);
    assert_eq!(report.total, Some(1700.0));
    assert_eq!(report.unpriced_count, 1);
}
