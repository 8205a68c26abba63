use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

use feedwatch::config::Config;
use feedwatch::feed::Strategy;
use feedwatch::storage::{Item, StorageError, StoreError};
use feedwatch::sync::{BatchStatus, BatchSummary, SyncOutcome};
use feedwatch::util::strip_control_chars;
use feedwatch::{Monitor, SyncTrigger};

#[derive(Parser, Debug)]
#[command(name = "feedwatch", about = "Watch public-account feeds and keep a deduplicated article store")]
struct Args {
    /// Config file (default: ~/.config/feedwatch/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a source
    Add {
        name: String,
        identifier: String,
        /// auto, mirror, rsshub, feed or search
        #[arg(long, default_value = "auto")]
        strategy: Strategy,
        /// Register without a validation fetch
        #[arg(long)]
        no_validate: bool,
    },
    /// Remove a source and its articles
    Remove { id: Uuid },
    /// List sources with counts and health
    List,
    /// Show articles, for one source or across all
    Articles {
        #[arg(long)]
        source: Option<Uuid>,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Mark an article read
    Read { id: Uuid },
    /// Sync one source now, or all of them
    Sync {
        #[arg(long)]
        source: Option<Uuid>,
    },
    /// Remove articles older than the retention window
    Purge {
        /// Overrides sync.retention_days
        #[arg(long)]
        days: Option<u32>,
    },
    /// Collapse duplicate sources
    Dedupe,
    /// Run the scheduler until Ctrl-C
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let config_path = match args.config {
        Some(path) => path,
        None => Config::default_dir()
            .context("HOME environment variable not set")?
            .join("config.toml"),
    };
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let monitor = match Monitor::open(&config).await {
        Ok(monitor) => monitor,
        Err(e) if matches!(e.downcast_ref::<StorageError>(), Some(StorageError::Locked)) => {
            eprintln!(
                "Error: the database is in use by another feedwatch process (is `feedwatch run` active?). Stop it and try again."
            );
            std::process::exit(1);
        }
        Err(e) => return Err(e.context("Failed to open store")),
    };

    match args.command {
        Command::Add {
            name,
            identifier,
            strategy,
            no_validate,
        } => match monitor
            .register_source(&name, &identifier, strategy, !no_validate)
            .await
        {
            Ok(source) => {
                println!("Added {} ({})", source.name, source.id);
                if !source.verified && !no_validate {
                    println!("Warning: no items could be fetched yet; the source will be retried on sync.");
                }
            }
            Err(StoreError::Duplicate { field, existing }) => {
                eprintln!("Error: a source with the same {} already exists ({})", field, existing);
                std::process::exit(1);
            }
            Err(e) => return Err(e.into()),
        },
        Command::Remove { id } => {
            let removed = monitor.remove_source(id).await?;
            println!("Removed {}", removed.name);
        }
        Command::List => {
            let sources = monitor.list_sources().await?;
            if sources.is_empty() {
                println!("No sources registered. Add one with: feedwatch add <name> <identifier>");
            }
            for summary in sources {
                let s = &summary.source;
                let checked = s
                    .last_checked_at
                    .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "never".to_string());
                println!(
                    "{}  {:<24} {:<8} {:<6} items={:<4} unread={:<4} checked={}{}",
                    s.id,
                    strip_control_chars(&s.name),
                    s.strategy,
                    s.status,
                    summary.item_count,
                    summary.unread_count,
                    checked,
                    if s.verified { "" } else { " (unverified)" },
                );
                if let Some(err) = &s.last_error {
                    println!("    last error: {}", strip_control_chars(err));
                }
            }
        }
        Command::Articles { source, limit } => {
            let items = match source {
                Some(id) => monitor.get_source_articles(id, Some(limit)).await?,
                None => {
                    let mut all = monitor.get_all_articles(limit).await?;
                    all.truncate(limit);
                    all
                }
            };
            for item in &items {
                print_item(item);
            }
        }
        Command::Read { id } => {
            monitor.mark_item_read(id).await?;
            println!("Marked {} read", id);
        }
        Command::Sync { source } => match monitor.trigger_sync(source).await? {
            SyncTrigger::One(outcome) => print_outcome(&outcome),
            SyncTrigger::Batch(summary) => print_summary(&summary),
        },
        Command::Purge { days } => {
            let days = days.unwrap_or(config.sync.retention_days);
            let removed = monitor.purge_older_than(days).await?;
            println!("Removed {} articles older than {} days", removed, days);
        }
        Command::Dedupe => {
            let removed = monitor.deduplicate_sources().await?;
            println!("Removed {} duplicate sources", removed.len());
        }
        Command::Run => {
            let scheduler = monitor.scheduler();
            scheduler.start();
            println!(
                "Scheduler running with timers: {}. Press Ctrl-C to stop.",
                scheduler.status().active_timers.join(", ")
            );
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")?;
            println!("Stopping...");
        }
    }

    monitor.close().await;
    Ok(())
}

fn print_item(item: &Item) {
    let date = item
        .effective_date()
        .format("%Y-%m-%d")
        .to_string();
    let marker = if item.is_read { " " } else { "*" };
    println!(
        "{} {} {}  {}",
        marker,
        date,
        strip_control_chars(&item.title),
        strip_control_chars(&item.link)
    );
    println!("    id: {}", item.id);
}

fn print_outcome(outcome: &SyncOutcome) {
    if outcome.success {
        println!(
            "{}: {} fetched, {} new{}",
            outcome.source_name,
            outcome.items_fetched,
            outcome.items_new,
            outcome
                .strategy
                .map(|s| format!(" (via {})", s))
                .unwrap_or_default()
        );
        for item in &outcome.new_items {
            println!("  + {}", strip_control_chars(&item.title));
        }
    } else {
        println!(
            "{}: failed: {}",
            outcome.source_name,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
}

fn print_summary(summary: &BatchSummary) {
    match summary.status() {
        BatchStatus::NoSources => {
            println!("No sources registered.");
            return;
        }
        BatchStatus::AllFailed => println!("All {} sources failed.", summary.accounts_total),
        BatchStatus::Partial => println!(
            "{} of {} sources synced, {} failed.",
            summary.accounts_succeeded, summary.accounts_total, summary.accounts_failed
        ),
        BatchStatus::AllSucceeded => println!("All {} sources synced.", summary.accounts_total),
    }
    for outcome in &summary.outcomes {
        print_outcome(outcome);
    }
    println!(
        "{} new items in {} ms",
        summary.items_new_total, summary.duration_ms
    );
}
