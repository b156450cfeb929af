//! Devkit Preload CLI
//!
//! Inspect and replay the persisted usage history that drives predictive
//! preloading.
//!
//! ## Usage
//!
//! ```bash
//! # Replay a session
//! devkit-preload record json-formatter table-sorter json-formatter
//!
//! # What usually follows a tool
//! devkit-preload predict json-formatter --top 5
//!
//! # Dump counts and edges
//! devkit-preload usage --json
//!
//! # Start over
//! devkit-preload --store ~/.devkit forget
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::info;

use devkit_preload::{init_tracing, FileStore, ManagerConfig, PreloadManager};

#[derive(Parser, Debug)]
#[command(name = "devkit-preload")]
#[command(version)]
#[command(about = "Inspect predictive preload state", long_about = None)]
struct Args {
    /// Directory holding the persisted usage history
    #[arg(long, default_value = ".devkit-preload")]
    store: PathBuf,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record tool uses in order
    Record {
        /// Tool slugs
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Predict the tools most likely to follow one
    Predict {
        /// Tool slug
        id: String,

        /// Number of predictions (defaults to the configured related_top_n)
        #[arg(short, long)]
        top: Option<usize>,
    },
    /// Show usage counts and associations
    Usage {
        /// Print the snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the usage history
    Forget,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(&args.log_level)?;

    let config = match &args.config {
        Some(path) => ManagerConfig::from_json_file(path)?,
        None => ManagerConfig::default(),
    };

    let store = FileStore::open(&args.store)?;
    info!("Using store at {}", store.root().display());

    let manager = PreloadManager::builder()
        .config(config)
        .store(Arc::new(store))
        .build()?;

    match args.command {
        Command::Record { ids } => {
            for id in &ids {
                manager.record_usage(id.as_str());
            }
            manager.usage().persist()?;
            println!("Recorded {} uses", ids.len());
        }
        Command::Predict { id, top } => {
            let top_n = top.unwrap_or(manager.config().related_top_n);
            let predicted = manager.predict_related(&id, top_n);

            if predicted.is_empty() {
                println!("No associations recorded for '{}'", id);
            }
            for (rank, next) in predicted.iter().enumerate() {
                let weight = manager.usage().edge_weight(&id, next.as_str());
                println!("{:>2}. {} (weight {})", rank + 1, next, weight);
            }
        }
        Command::Usage { json } => {
            let snapshot = manager.usage().snapshot();

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
                return Ok(());
            }

            let mut counts: Vec<_> = snapshot.counts.iter().collect();
            counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));

            println!("Uses ({} total):", snapshot.total_uses());
            for (id, count) in counts {
                println!("  {:<24} {}", id, count);
            }

            let mut sources: Vec<_> = snapshot.associations.iter().collect();
            sources.sort_by(|a, b| a.0.cmp(b.0));

            println!("Associations ({} edges):", snapshot.edge_count());
            for (from, edges) in sources {
                let targets: Vec<String> = edges
                    .iter()
                    .map(|(to, weight)| format!("{} ({})", to, weight))
                    .collect();
                println!("  {} -> {}", from, targets.join(", "));
            }
        }
        Command::Forget => {
            manager.usage().forget();
            println!("Usage history removed from {}", args.store.display());
        }
    }

    Ok(())
}
