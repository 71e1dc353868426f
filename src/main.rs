use anyhow::{bail, Context, Result};
use kit_catalog::{
    BudgetResolver, CatalogConfig, CatalogStore, CatalogWatcher, ConsolidationEngine,
    SqliteHistory, SyncOrchestrator,
};
use serde::Serialize;
use std::env;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;

const USAGE: &str = "usage: kit-catalog <command>

commands:
  sync [--full]                        resync the catalog from its sources
  watch                                resync on every source change
  kits                                 list kit names
  lookup <kit>                         material lines of one kit
  consolidate <project>                deduplicated bill of materials
  budget <project>                     priced bill of materials
  set-price <code> <price> [currency]  set the unit price of a material code
  price-history <code>                 price changes of a material code
  events [limit]                       recent sync runs";

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let Some(command) = args.first() else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    let config = CatalogConfig::load().context("failed to load configuration")?;

    match command.as_str() {
        "sync" => run_sync(&config, args.iter().any(|a| a == "--full")),
        "watch" => run_watch(&config),
        "kits" => print_json(&open_store(&config)?.list_kits()?),
        "lookup" => {
            let kit = required_arg(&args, 1, "kit")?;
            print_json(&open_store(&config)?.lookup(kit)?)
        }
        "consolidate" => {
            let project = project_arg(&args)?;
            print_json(&consolidation_engine(&config)?.consolidate(project)?)
        }
        "budget" => {
            let project = project_arg(&args)?;
            let resolver = BudgetResolver::new(open_store(&config)?, consolidation_engine(&config)?);
            print_json(&resolver.resolve_budget(project)?)
        }
        "set-price" => {
            let code = required_arg(&args, 1, "code")?;
            let price: f64 = required_arg(&args, 2, "price")?
                .replace(',', ".")
                .parse()
                .context("price must be a number")?;
            let currency = args.get(3).map(String::as_str);
            let updated = open_store(&config)?.set_unit_price(code, None, price, currency)?;
            print_json(&serde_json::json!({ "code": code, "rows_updated": updated }))
        }
        "price-history" => {
            let code = required_arg(&args, 1, "code")?;
            print_json(&open_store(&config)?.price_history(code)?)
        }
        "events" => {
            let limit = match args.get(1) {
                Some(raw) => raw.parse().context("limit must be a positive integer")?,
                None => 20,
            };
            print_json(&open_store(&config)?.recent_events(limit)?)
        }
        "help" | "--help" | "-h" => {
            println!("{USAGE}");
            Ok(())
        }
        other => {
            eprintln!("unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }
}

fn run_sync(config: &CatalogConfig, full: bool) -> Result<()> {
    let orchestrator = SyncOrchestrator::from_config(config, open_store(config)?)?;
    let report = if full {
        orchestrator.sync_full()
    } else {
        orchestrator.startup()
    }
    .with_context(|| format!("sync from {} failed", config.source_dir.display()))?;

    print_json(&report)
}

fn run_watch(config: &CatalogConfig) -> Result<()> {
    let orchestrator = Arc::new(SyncOrchestrator::from_config(config, open_store(config)?)?);

    // Startup sync failures are not fatal: the watcher retries on the next change
    if let Err(err) = orchestrator.startup() {
        tracing::warn!("initial sync failed: {err}");
    }

    let runtime = tokio::runtime::Runtime::new().context("failed to start async runtime")?;
    runtime.block_on(async {
        let watcher = CatalogWatcher::start(orchestrator, config.watch)?;
        let mut updates = watcher.subscribe_updates();

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("shutting down watcher");
                    break;
                }
                update = updates.recv() => match update {
                    Ok(update) => print_json(&update)?,
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "dropped sync updates");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }
        Ok::<(), anyhow::Error>(())
    })
}

fn open_store(config: &CatalogConfig) -> Result<CatalogStore> {
    CatalogStore::open(&config.database_path, &config.default_currency)
        .with_context(|| format!("failed to open catalog at {}", config.database_path.display()))
}

fn consolidation_engine(config: &CatalogConfig) -> Result<ConsolidationEngine> {
    let history = SqliteHistory::open(&config.database_path)
        .with_context(|| format!("failed to open history at {}", config.database_path.display()))?;
    Ok(ConsolidationEngine::new(Arc::new(history), &config.default_unit))
}

fn required_arg<'a>(args: &'a [String], index: usize, name: &str) -> Result<&'a str> {
    match args.get(index) {
        Some(value) => Ok(value.as_str()),
        None => bail!("missing <{name}> argument\n\n{USAGE}"),
    }
}

fn project_arg(args: &[String]) -> Result<i64> {
    required_arg(args, 1, "project")?
        .parse()
        .context("project must be a numeric id")
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
