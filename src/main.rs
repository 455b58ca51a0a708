//! Proximity Dispatch operator binary

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use std::path::Path;
use tracing::info;

use proximity_dispatch::cli::{Cli, Command};
use proximity_dispatch::models::{Customer, Technician};
use proximity_dispatch::{DispatchConfig, Dispatcher, DispatchStore, SqliteDispatchStore};

/// sysexits `EX_TEMPFAIL`: the dispatch may succeed if re-run
const EXIT_RETRYABLE: i32 = 75;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

async fn seed(config: &DispatchConfig, customers_path: &Path, technicians_path: &Path) -> Result<()> {
    let store = SqliteDispatchStore::new(&config.db_path).await?;

    let customers: Vec<Customer> = read_json(customers_path).await?;
    for customer in &customers {
        store.upsert_customer(customer).await?;
    }

    let technicians: Vec<Technician> = read_json(technicians_path).await?;
    for technician in &technicians {
        store.upsert_technician(technician).await?;
    }

    info!(customers = customers.len(), technicians = technicians.len(), "Seeded dispatch database");
    print_json(&serde_json::json!({
        "customers": customers.len(),
        "technicians": technicians.len(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = DispatchConfig::from_env()?;

    let dispatcher = || Dispatcher::from_config(&config);

    let result = match cli.command {
        Command::Seed { customers, technicians } => return seed(&config, &customers, &technicians).await,
        Command::Recommend { customer_id } => {
            dispatcher().await?.recommend(customer_id).await.map(serde_json::to_value)
        }
        Command::Dispatch { customer_id } => {
            dispatcher().await?.dispatch(customer_id).await.map(serde_json::to_value)
        }
        Command::Release { technician_id } => {
            dispatcher().await?.release(technician_id).await.map(serde_json::to_value)
        }
    };

    match result {
        Ok(value) => print_json(&value?),
        Err(e) if e.is_retryable() => {
            eprintln!("{} (safe to retry)", e);
            std::process::exit(EXIT_RETRYABLE);
        }
        Err(e) => Err(e.into()),
    }
}
