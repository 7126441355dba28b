//! Inspect or clean up an automation store from the command line.
//!
//! Summaries are printed to stdout as JSON; tracing output goes to stderr.

use std::path::PathBuf;

use anyhow::Context;
use automation_store::{AutomationStore, StoreConfig, doctor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut config_path: Option<PathBuf> = None;
    let mut command = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args.next().context("--config requires a file path")?;
                config_path = Some(PathBuf::from(path));
            }
            "help" | "--help" | "-h" => {
                print_usage();
                return Ok(());
            }
            other if command.is_none() => command = Some(other.to_owned()),
            other => anyhow::bail!("unexpected argument `{other}`"),
        }
    }

    let config = load_config(config_path)?;
    let store = AutomationStore::open(&config)
        .with_context(|| format!("failed to open store `{}`", config.store_name))?;
    let now = chrono::Utc::now();

    match command.as_deref().unwrap_or("summary") {
        "summary" => {
            let summary = doctor::summarize(&store, now).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        "purge-expired" => {
            let removed = doctor::purge_expired(&store, now).await?;
            println!("removed {removed} expired schedule(s)");
        }
        other => anyhow::bail!("unknown subcommand `{other}` (use summary|purge-expired|help)"),
    }
    Ok(())
}

/// Explicit `--config` must exist; the default path falls back to defaults.
fn load_config(explicit: Option<PathBuf>) -> anyhow::Result<StoreConfig> {
    if let Some(path) = explicit {
        return StoreConfig::from_file(&path)
            .with_context(|| format!("failed to load config {}", path.display()));
    }
    let default_path = StoreConfig::default_config_path();
    if default_path.exists() {
        tracing::info!(path = %default_path.display(), "using default config");
        return Ok(StoreConfig::from_file(&default_path)?);
    }
    Ok(StoreConfig::default())
}

fn print_usage() {
    println!("automation-store-doctor [--config <path>] [summary|purge-expired|help]");
    println!();
    println!("  summary        print per-state schedule counts and findings as JSON (default)");
    println!("  purge-expired  delete schedules past their end date and edit grace period");
    println!("  help           show this message");
}
