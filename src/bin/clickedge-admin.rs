use anyhow::Result;
use clap::{Parser, Subcommand};
use clickedge::backend::HttpBackendClient;
use clickedge::config::{Config, StorageBackend};
use clickedge::edge::EdgeRouter;
use clickedge::storage::{FsBlobStore, KvStore, MemoryKv, SqliteKv};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "clickedge-admin")]
#[command(about = "clickedge operator CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a signed tracking link
    Sign {
        tracking_code: String,
        /// Prefix printed before the signed code, e.g. https://go.example/c/
        #[arg(long)]
        base_url: Option<String>,
    },
    /// Check a signed link without consuming its nonce
    Verify { link: String },
    /// Inspect or replay the dead-letter queue
    Dlq {
        #[command(subcommand)]
        command: DlqCommands,
    },
    /// Queue and emergency store counters
    Stats,
}

#[derive(Subcommand)]
enum DlqCommands {
    /// List dead letters
    List {
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Move dead letters back to the durable queue; all of them when no key is given
    Replay { keys: Vec<String> },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let cli = Cli::parse();
    let config = Config::from_env()?;

    let kv: Arc<dyn KvStore> = match config.storage.backend {
        StorageBackend::Sqlite => Arc::new(SqliteKv::new(&config.storage.url, 2).await?),
        StorageBackend::Memory => {
            eprintln!("⚠ STORAGE_BACKEND=memory: queue commands only see this process");
            Arc::new(MemoryKv::new())
        }
    };
    kv.init().await?;

    let blobs = Arc::new(FsBlobStore::new(&config.storage.overflow_dir).await?);
    let backend = Arc::new(HttpBackendClient::new(&config.backend)?);
    let edge = EdgeRouter::new(config, kv, blobs, backend, None)?;

    match cli.command {
        Commands::Sign {
            tracking_code,
            base_url,
        } => {
            let link = edge.links().generate(&tracking_code);
            println!("{}{}", base_url.unwrap_or_default(), link);
        }
        Commands::Verify { link } => {
            let code = link.rsplit('/').next().unwrap_or(&link);
            let inspection = edge.verify(code);
            println!("{}", serde_json::to_string_pretty(&inspection)?);
            if !inspection.valid {
                std::process::exit(1);
            }
        }
        Commands::Dlq {
            command: DlqCommands::List { limit },
        } => {
            let entries = edge.queue().dead_letters(limit).await?;
            if entries.is_empty() {
                println!("Dead-letter queue is empty.");
            } else {
                println!("{:<60} {:<16} {:<8} {}", "Key", "Tracking code", "Tries", "Reason");
                println!("{}", "-".repeat(100));
                for entry in entries {
                    println!(
                        "{:<60} {:<16} {:<8} {}",
                        entry.key,
                        entry.letter.click.event.tracking_code,
                        entry.letter.click.attempts,
                        entry.letter.reason
                    );
                }
            }
        }
        Commands::Dlq {
            command: DlqCommands::Replay { keys },
        } => {
            let keys = (!keys.is_empty()).then_some(keys);
            let replayed = edge.queue().replay_dead_letters(keys.as_deref()).await?;
            println!("✓ Replayed {} dead letter(s) into the durable queue", replayed);
            println!("  A running edge sharing this store sends them on its next flush");
        }
        Commands::Stats => {
            let snapshot = edge.queue().snapshot().await;
            println!("Durable entries:   {}", snapshot.durable);
            println!("Overflow blobs:    {}", snapshot.overflow_blobs);
            println!("Dead letters:      {}", snapshot.dead_letters);
            println!("Emergency clicks:  {}", edge.failover().emergency_count().await);
        }
    }

    Ok(())
}
