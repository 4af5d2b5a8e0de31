use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use listing_watch::{
    delete_alert, import_alerts, init_logging, list_alerts, load_alerts_csv, Alert, ListingEvent,
    ServiceConfig,
};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Admin tool for the listing watch alert store.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    #[clap(flatten)]
    config: ServiceConfig,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the alert database and its schema.
    Init,
    /// Import alerts from a CSV file with columns email,manufacturer,model,year,branch.
    ImportAlerts { csv: PathBuf },
    /// Print every stored alert.
    ListAlerts,
    /// Delete the alert with the given correlation id.
    DeleteAlert { external_id: Uuid },
    /// Run one listing event (a JSON file) through the ingestion pipeline.
    Ingest { listing: PathBuf },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.config.log_format);

    match &args.command {
        Command::Init => run_init(&args.config),
        Command::ImportAlerts { csv } => run_import(&args.config, csv),
        Command::ListAlerts => run_list(&args.config),
        Command::DeleteAlert { external_id } => run_delete(&args.config, external_id),
        Command::Ingest { listing } => run_ingest(&args.config, listing),
    }
}

fn run_init(config: &ServiceConfig) -> Result<()> {
    config.open_store()?;
    println!("✓ Database initialized at {:?}", config.database);
    Ok(())
}

fn run_import(config: &ServiceConfig, csv_path: &Path) -> Result<()> {
    let seeds = load_alerts_csv(csv_path)?;
    println!("✓ Loaded {} alerts from CSV", seeds.len());

    let store = config.open_store()?;
    let alerts = store.with_conn(|conn| import_alerts(conn, &seeds))??;

    for alert in &alerts {
        print_alert(alert);
    }
    println!("✓ Imported {} alerts", alerts.len());
    Ok(())
}

fn run_list(config: &ServiceConfig) -> Result<()> {
    let store = config.open_store()?;
    let alerts = store.with_conn(list_alerts)??;

    for alert in &alerts {
        print_alert(alert);
    }
    println!("{} alerts", alerts.len());
    Ok(())
}

fn print_alert(alert: &Alert) {
    println!(
        "  {}  {:<24} {:<28} {}",
        alert.external_id,
        alert.recipient(),
        alert.vehicle.to_string(),
        alert.branch.as_deref().unwrap_or("any branch"),
    );
}

fn run_delete(config: &ServiceConfig, external_id: &Uuid) -> Result<()> {
    let store = config.open_store()?;

    if store.with_conn(|conn| delete_alert(conn, external_id))?? {
        println!("✓ Deleted alert {external_id}");
    } else {
        println!("No alert with id {external_id}");
    }
    Ok(())
}

fn run_ingest(config: &ServiceConfig, listing_path: &Path) -> Result<()> {
    let content = std::fs::read_to_string(listing_path)
        .with_context(|| format!("Failed to read listing file: {:?}", listing_path))?;
    let listing: ListingEvent =
        serde_json::from_str(&content).context("Failed to parse listing JSON")?;

    let pipeline = config.build_pipeline()?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(pipeline.ingest(listing));

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
