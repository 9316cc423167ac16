use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use offcache::cache::{CacheManager, CacheOptions, Priority, Strategy};
use offcache::config::Config;
use offcache::db::Database;
use offcache::queue::{OfflineQueue, OfflineQueueItem};
use offcache::quota::{format_bytes, QuotaReporter, SqliteQuota};
use offcache::logging;

#[derive(Parser, Debug)]
#[command(name = "offcache")]
#[command(about = "Inspect and maintain the offline cache and mutation queue")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/offcache/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Database file, overriding the configured one
  #[arg(long)]
  db: Option<PathBuf>,

  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  #[command(flatten)]
  Cache(CacheCommand),
  /// Show storage usage
  Quota,
  /// Ask for durable storage
  Persist,
  /// Inspect or repair the offline queue
  #[command(subcommand)]
  Queue(QueueCommand),
}

#[derive(Subcommand, Debug)]
enum CacheCommand {
  /// List cached keys
  Keys,
  /// Print a cached value
  Get { key: String },
  /// Store a JSON value
  Set {
    key: String,
    /// JSON document to store
    value: String,
    #[arg(long)]
    ttl_ms: Option<u64>,
    #[arg(long = "tag")]
    tags: Vec<String>,
    #[arg(long, default_value = "normal")]
    priority: Priority,
  },
  /// Delete a cached value
  Delete { key: String },
  /// Remove expired entries
  Cleanup,
  /// Remove every cached entry
  Clear,
}

#[derive(Subcommand, Debug)]
enum QueueCommand {
  /// Show every queued operation
  List,
  /// Show operations waiting to be replayed
  Pending,
  /// Show operations that ran out of retries
  Failed,
  /// Give a failed operation a fresh retry budget
  Retry { id: String },
  /// Reset every failed operation
  RetryFailed,
  /// Drop an operation
  Remove { id: String },
  /// Drop every operation
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let _log_guard = logging::init(&config.logging)?;

  let path = match args.db {
    Some(path) => path,
    None => config.database_path()?,
  };
  let db = Arc::new(Database::open(&path)?);

  match args.command {
    Command::Queue(command) => run_queue(command, OfflineQueue::from_config(&config, db)),
    Command::Quota => {
      let reporter = QuotaReporter::new(SqliteQuota::new(db, config.storage.quota_bytes));
      let quota = reporter.get_quota();
      println!(
        "{} of {} used ({:.2}%)",
        format_bytes(quota.usage),
        format_bytes(quota.quota),
        quota.percentage
      );
      println!("persisted: {}", reporter.is_persisted());
      Ok(())
    }
    Command::Persist => {
      let reporter = QuotaReporter::new(SqliteQuota::new(db, config.storage.quota_bytes));
      println!("persisted: {}", reporter.request_persistent());
      Ok(())
    }
    Command::Cache(command) => run_cache(command, CacheManager::from_config(&config, db)).await,
  }
}

async fn run_cache(command: CacheCommand, cache: CacheManager<Value>) -> Result<()> {
  match command {
    CacheCommand::Keys => {
      for key in cache.persistent().keys().await? {
        println!("{}", key);
      }
    }
    CacheCommand::Get { key } => {
      let options = CacheOptions::new().strategy(Strategy::CacheOnly);
      let value = cache
        .get(&key, || std::future::ready(Err(eyre!("no fetcher"))), &options)
        .await?;
      println!("{}", serde_json::to_string_pretty(&value)?);
    }
    CacheCommand::Set {
      key,
      value,
      ttl_ms,
      tags,
      priority,
    } => {
      let value: Value =
        serde_json::from_str(&value).map_err(|e| eyre!("Value is not valid JSON: {}", e))?;
      let mut options = CacheOptions::new().priority(priority);
      if let Some(ttl_ms) = ttl_ms {
        options = options.ttl(Duration::from_millis(ttl_ms));
      }
      for tag in tags {
        options = options.tag(tag);
      }
      cache.set(&key, value, &options).await?;
    }
    CacheCommand::Delete { key } => {
      if !cache.delete(&key).await? {
        println!("{} was not cached", key);
      }
    }
    CacheCommand::Cleanup => {
      let removed = cache.cleanup().await?;
      println!("removed {} expired entries", removed);
    }
    CacheCommand::Clear => cache.clear().await?,
  }

  Ok(())
}

fn run_queue(command: QueueCommand, queue: OfflineQueue) -> Result<()> {
  match command {
    QueueCommand::List => print_items(&queue.get_all()),
    QueueCommand::Pending => print_items(&queue.get_pending()),
    QueueCommand::Failed => print_items(&queue.get_failed()),
    QueueCommand::Retry { id } => {
      if !queue.retry(&id) {
        return Err(eyre!("No failed operation with id {}", id));
      }
    }
    QueueCommand::RetryFailed => println!("reset {} operations", queue.retry_failed()),
    QueueCommand::Remove { id } => {
      if !queue.remove(&id) {
        return Err(eyre!("No operation with id {}", id));
      }
    }
    QueueCommand::Clear => queue.clear(),
  }

  Ok(())
}

fn print_items(items: &[OfflineQueueItem]) {
  for item in items {
    let status = format!("{:?}", item.status).to_lowercase();
    print!(
      "{}  {}  {}  retries {}/{}",
      item.id, item.kind, status, item.retries, item.max_retries
    );
    match &item.last_error {
      Some(error) => println!("  {}", error),
      None => println!(),
    }
  }
}
