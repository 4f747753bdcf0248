//! pocketsync - command-line front end for the finance dashboard cache.
//!
//! Reads go through the same cache the dashboard uses, so freshness windows,
//! shared fetches and sync reconciliation behave exactly as they do there.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use pocketsync_core::cache::{
    spawn_revalidation, CacheKey, CacheOptions, EntryStatus, Fetcher, FreshnessPolicy, Subscriber,
};
use pocketsync_core::models::Totals;
use pocketsync_core::{Config, EntityData, EntityType, FinanceCache, RestClient};

// ============================================================================
// Constants
// ============================================================================

/// Revalidation period for `watch` when the config sets none.
const DEFAULT_WATCH_INTERVAL_SECS: u64 = 15;

const USAGE: &str = "Usage: pocketsync <command>

Commands:
  status                 Fetch every collection and show its cache state
  show <entity> [id]     Print an entity's records as JSON
  sync                   Run the backend sync job and apply its result
  watch <entity>         Print the collection whenever it changes

Entities: profile, transactions, budgets, pots, recurring_bills, debts,
          debt_payments, income, totals

Environment: POCKETSYNC_BACKEND_URL, POCKETSYNC_API_KEY, POCKETSYNC_OWNER";

/// Initialize the tracing subscriber for logging
fn init_tracing() {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(filter)
        .init();
}

enum Command {
    Status,
    Show { entity: EntityType, id: Option<String> },
    Sync,
    Watch { entity: EntityType },
}

fn parse_entity(name: Option<&String>) -> Result<EntityType> {
    let name = name.ok_or_else(|| anyhow::anyhow!("Missing entity name\n\n{}", USAGE))?;
    EntityType::from_name(name).ok_or_else(|| anyhow::anyhow!("Unknown entity '{}'\n\n{}", name, USAGE))
}

fn parse_args(args: &[String]) -> Result<Command> {
    match args.first().map(String::as_str) {
        Some("status") => Ok(Command::Status),
        Some("show") => Ok(Command::Show {
            entity: parse_entity(args.get(1))?,
            id: args.get(2).cloned(),
        }),
        Some("sync") => Ok(Command::Sync),
        Some("watch") => Ok(Command::Watch {
            entity: parse_entity(args.get(1))?,
        }),
        _ => Err(anyhow::anyhow!("{}", USAGE)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    init_tracing();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = parse_args(&args)?;

    let mut config = Config::load()?;
    let owner = config
        .last_owner
        .clone()
        .ok_or_else(|| anyhow::anyhow!("No owner configured (set POCKETSYNC_OWNER)"))?;
    let client = RestClient::new(&config.backend_url()?, &Config::api_key()?)?;

    let options = CacheOptions {
        policy: FreshnessPolicy::from_config(&config.cache),
        ..CacheOptions::default()
    };
    let fetcher: Arc<dyn Fetcher<EntityData>> = Arc::new(client.clone());
    let cache = Arc::new(FinanceCache::with_options(owner.as_str(), fetcher, options));
    info!(owner = %owner, "pocketsync starting");

    match command {
        Command::Status => status(&cache).await?,
        Command::Show { entity, id } => {
            let key = match id {
                Some(id) => cache.item_key(entity, id),
                None => cache.key(entity),
            };
            let data = cache.read(&key).await?;
            println!("{}", serde_json::to_string_pretty(&data)?);
        }
        Command::Sync => {
            let written = cache.sync(&client).await?;
            for key in &written {
                let records = cache.get(key).value.map(|v| v.len()).unwrap_or(0);
                println!("{:<16} {:>5} records", key.entity(), records);
            }
            println!("Synced {} collections", written.len());
        }
        Command::Watch { entity } => {
            let interval = config.cache.revalidate_interval_secs.unwrap_or(DEFAULT_WATCH_INTERVAL_SECS);
            watch(&cache, entity, Duration::from_secs(interval)).await?;
        }
    }

    cache.log_stats();

    // Remember the owner for next time
    config.save().context("Failed to save config")?;
    Ok(())
}

async fn status(cache: &Arc<FinanceCache>) -> Result<()> {
    let keys: Vec<CacheKey> = EntityType::ALL.iter().map(|e| cache.key(*e)).collect();
    let results = read_all(cache, &keys).await;

    for (key, result) in keys.iter().zip(&results) {
        if let Err(e) = result {
            eprintln!("{}: {}", key.entity(), e);
        }
    }

    println!("{:<16} {:<9} {:>7}  AGE", "ENTITY", "STATUS", "RECORDS");
    for age in cache.snapshot_ages() {
        let records = cache
            .get(&cache.key(age.entity))
            .value
            .map(|v| v.len().to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<16} {:<9} {:>7}  {}",
            age.entity.as_str(),
            format!("{:?}", age.status),
            records,
            age.age.as_deref().unwrap_or("never")
        );
    }

    let cached: Vec<EntityData> = keys.iter().filter_map(|key| cache.get(key).value).collect();
    let summary = summary_lines(&cached);
    if !summary.is_empty() {
        println!();
        for line in summary {
            println!("{}", line);
        }
    }

    let stats = cache.dedup_stats();
    println!(
        "\n{} fetches, {} shared ({:.0}%)",
        stats.new_requests,
        stats.coalesced_requests,
        stats.coalescing_ratio() * 100.0
    );
    Ok(())
}

/// Dashboard figures from whatever collections are cached. Totals come from
/// the backend when cached, otherwise they are computed locally.
fn summary_lines(cached: &[EntityData]) -> Vec<String> {
    if cached.is_empty() {
        return Vec::new();
    }
    let mut profile = None;
    let mut backend_totals = None;
    let (mut transactions, mut budgets, mut pots, mut bills) = (Vec::new(), Vec::new(), Vec::new(), Vec::new());
    let (mut debts, mut payments, mut income) = (Vec::new(), Vec::new(), Vec::new());
    for data in cached {
        match data {
            EntityData::Profile(p) => profile = Some(p),
            EntityData::Totals(t) => backend_totals = Some(t.clone()),
            EntityData::Transactions(v) => transactions.extend(v.iter().cloned()),
            EntityData::Budgets(v) => budgets.extend(v.iter().cloned()),
            EntityData::Pots(v) => pots.extend(v.iter().cloned()),
            EntityData::RecurringBills(v) => bills.extend(v.iter().cloned()),
            EntityData::Debts(v) => debts.extend(v.iter().cloned()),
            EntityData::DebtPayments(v) => payments.extend(v.iter().cloned()),
            EntityData::Income(v) => income.extend(v.iter().cloned()),
        }
    }

    let mut lines = Vec::new();
    if let Some(profile) = profile {
        lines.push(format!("{} ({})", profile.name(), profile.currency));
    }

    let (totals, source) = match backend_totals {
        Some(totals) => (totals, "backend"),
        None => (Totals::compute(&transactions, &budgets, &pots, &bills, &debts, &income), "computed"),
    };
    lines.push(format!(
        "Income {:.2}  Spending {:.2}  Net {:.2}  Saved {:.2}  Bills/month {:.2}  Debt {:.2} ({})",
        totals.income,
        totals.spending,
        totals.net(),
        totals.saved,
        totals.bills_monthly,
        totals.debt_outstanding,
        source
    ));

    for budget in budgets.iter().filter(|b| b.is_over()) {
        lines.push(format!("Over budget: {} by {:.2}", budget.category, -budget.remaining()));
    }
    for pot in &pots {
        if let Some(progress) = pot.progress() {
            lines.push(format!("Pot {}: {:.0}% of target", pot.name, progress * 100.0));
        }
    }
    for debt in &debts {
        lines.push(format!(
            "Debt {}: {:.2} outstanding, {:.2} paid",
            debt.name,
            debt.balance,
            debt.paid(&payments)
        ));
    }
    lines
}

/// Read every key concurrently; readers of the same key share one fetch.
async fn read_all(
    cache: &Arc<FinanceCache>,
    keys: &[CacheKey],
) -> Vec<Result<EntityData, pocketsync_core::CacheError>> {
    let mut handles = Vec::with_capacity(keys.len());
    for key in keys {
        let cache = Arc::clone(cache);
        let key = key.clone();
        handles.push(tokio::spawn(async move { cache.read(&key).await }));
    }

    let mut results = Vec::with_capacity(handles.len());
    for (handle, key) in handles.into_iter().zip(keys) {
        match handle.await {
            Ok(result) => results.push(result),
            Err(e) => {
                error!(key = %key, error = %e, "Read task failed");
                results.push(Err(pocketsync_core::CacheError::Disposed(key.clone())));
            }
        }
    }
    results
}

async fn watch(cache: &Arc<FinanceCache>, entity: EntityType, interval: Duration) -> Result<()> {
    let key = cache.key(entity);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<CacheKey>();
    let subscriber: Arc<dyn Subscriber> = Arc::new(move |changed: &CacheKey| {
        if tx.send(changed.clone()).is_err() {
            error!(key = %changed, "Watch channel closed");
        }
    });

    let data = cache.read(&key).await?;
    println!("{}", serde_json::to_string_pretty(&data)?);

    cache.subscribe(&key, &subscriber);
    let refresh = spawn_revalidation(cache, interval);
    eprintln!("Watching {} every {}s (Ctrl-C to stop)", entity, interval.as_secs());

    while let Some(changed) = rx.recv().await {
        let snapshot = cache.get(&changed);
        match (snapshot.status, snapshot.value) {
            (EntryStatus::Fresh, Some(value)) => println!("{}", serde_json::to_string_pretty(&value)?),
            (EntryStatus::Error, _) => {
                let reason = snapshot.last_error.map(|e| e.to_string()).unwrap_or_default();
                eprintln!("{}: refresh failed: {}", changed, reason);
            }
            (status, _) => eprintln!("{}: {:?}", changed, status),
        }
    }

    refresh.abort();
    Ok(())
}
