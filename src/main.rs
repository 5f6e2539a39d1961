// 🧾 ledger-sync CLI
//
// Thin command-line surface over the sync engine: import a CSV, list what the
// reader context sees, re-resolve dangling links, show the commit journal.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ledger_sync::{
    load_csv, logging, Account, Aggregate, Category, DomainEntity, EntityKind, ImportBatch, ImportPipeline, Link,
    ReconciliationEngine, RecurringOccurrence, RecurringSeries, Store, StoreConfig, Transaction,
};
use std::path::PathBuf;

/// Ledger store maintenance and import tools.
#[derive(Parser)]
#[command(name = "ledger-sync")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the SQLite ledger file (overrides config and LEDGER_DB_PATH)
    #[arg(global = true, short, long)]
    database: Option<PathBuf>,

    /// JSON config file
    #[arg(global = true, short, long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(global = true, short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import transactions from a CSV file, skipping duplicates
    Import {
        /// CSV with Date, Description, Amount, Account, Category columns
        csv: PathBuf,

        /// Wire live links for the imported rows right away
        #[arg(long)]
        relink: bool,
    },

    /// Print every entity of a kind as JSON lines
    List {
        /// account, transaction, category, recurring_series, recurring_occurrence, aggregate, link
        kind: EntityKind,
    },

    /// Re-resolve dangling and missing live links
    Relink,

    /// Show the most recent commits
    Journal {
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}

fn load_config(cli: &Cli) -> Result<StoreConfig> {
    let config = match &cli.config {
        Some(path) => StoreConfig::load(path).with_context(|| format!("Failed to load config {}", path.display()))?,
        None => StoreConfig::default(),
    };
    let mut config = config.from_env().context("Invalid environment override")?;
    if let Some(path) = &cli.database {
        config.database_path = path.clone();
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let config = load_config(&cli)?;
    let store = Store::open(config.clone())
        .with_context(|| format!("Failed to open ledger {}", config.database_path.display()))?;
    let engine = ReconciliationEngine::from_config(&config);

    match cli.command {
        Commands::Import { csv, relink } => {
            let rows = load_csv(&csv).with_context(|| format!("Failed to read {}", csv.display()))?;
            let batch = ImportBatch::from_rows(rows)?;
            let pipeline = ImportPipeline::new(store.coordinator("import")?, engine, config.bulk_batch_size);

            let (report, _) = pipeline.run(batch).await.context("Import failed")?;
            println!("📥 {}", report.summary());

            if relink {
                relink_all(&store, engine).await?;
            }
        }
        Commands::List { kind } => match kind {
            EntityKind::Account => print_all::<Account>(&store).await?,
            EntityKind::Transaction => print_all::<Transaction>(&store).await?,
            EntityKind::Category => print_all::<Category>(&store).await?,
            EntityKind::RecurringSeries => print_all::<RecurringSeries>(&store).await?,
            EntityKind::RecurringOccurrence => print_all::<RecurringOccurrence>(&store).await?,
            EntityKind::Aggregate => print_all::<Aggregate>(&store).await?,
            EntityKind::Link => print_all::<Link>(&store).await?,
        },
        Commands::Relink => relink_all(&store, engine).await?,
        Commands::Journal { limit } => {
            for event in store.recent_commits(limit).await? {
                println!(
                    "#{:<5} {}  {:<24} {:<16} {}",
                    event.commit_id,
                    event.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    event.operation,
                    event.source,
                    event.summary
                );
            }
        }
    }

    Ok(())
}

async fn print_all<T: DomainEntity>(store: &Store) -> Result<()> {
    let outcome = store.reader().fetch_all::<T>().await?;
    if outcome.is_stale() {
        eprintln!("⚠️  store unreadable, showing last snapshot");
    }
    let entities = outcome.into_inner();
    for entity in &entities {
        println!("{}", serde_json::to_string(entity)?);
    }
    eprintln!("✓ {} {} records", entities.len(), T::KIND);
    Ok(())
}

async fn relink_all(store: &Store, engine: ReconciliationEngine) -> Result<()> {
    let outcome = store
        .coordinator("relink")?
        .perform("relink", move |session| engine.resolver().relink_all(session))
        .await
        .context("Relink failed")?;
    println!(
        "🔗 {} links resolved, {} still dangling",
        outcome.value.linked, outcome.value.dangling
    );
    Ok(())
}
