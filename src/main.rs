use clap::{Parser, Subcommand};
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use telemed_sync::config::Config;
use telemed_sync::sync::AbandonedMutation;
use telemed_sync::{
  ConnectivityMonitor, DrainOutcome, HttpProbe, HttpRemote, LocalStore, OfflineCache,
  ReachabilityProbe, RecordTable, RemoteApi, SyncEngine, SyncMetrics,
};

#[derive(Parser, Debug)]
#[command(name = "telemed-sync")]
#[command(about = "Offline cache and sync queue for the telemedicine client")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/telemed-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  #[command(subcommand)]
  command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Default)]
enum Command {
  /// Watch connectivity and sync whenever the server comes back (default)
  #[default]
  Run,
  /// Run one sync pass now
  Sync,
  /// Show pending mutations and unsynced records
  Status,
  /// Show a patient's records, refreshing from the server when reachable
  Records {
    /// Patient id
    owner: String,
    /// Show consultations instead of health records
    #[arg(long)]
    consultations: bool,
  },
  /// Show the medicine inventory, refreshing from the server when reachable
  Medicines,
  /// Delete all cached data
  Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let config = Config::load(args.config.as_deref())?;
  let cache_path = config.cache_path()?;
  let _log_guard = init_logging(&cache_path)?;

  let store = Arc::new(
    LocalStore::open(&cache_path)
      .map_err(|e| eyre!("Failed to open cache at {}: {}", cache_path.display(), e))?,
  );

  match args.command.unwrap_or_default() {
    Command::Run => run(&config, store).await,
    Command::Sync => sync_once(&config, store).await,
    Command::Status => status(store),
    Command::Records {
      owner,
      consultations,
    } => {
      let table = if consultations {
        RecordTable::Consultations
      } else {
        RecordTable::HealthRecords
      };
      records(&config, store, table, &owner).await
    }
    Command::Medicines => medicines(&config, store).await,
    Command::Clear => {
      store.clear_all()?;
      println!("Cleared cached data in {}", cache_path.display());
      Ok(())
    }
  }
}

/// Log to a daily rolling file next to the cache database.
fn init_logging(cache_path: &Path) -> Result<WorkerGuard> {
  let log_dir = cache_path
    .parent()
    .map(|p| p.join("logs"))
    .ok_or_else(|| eyre!("Cache path {} has no parent directory", cache_path.display()))?;

  let appender = tracing_appender::rolling::daily(log_dir, "telemed-sync.log");
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter =
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("telemed_sync=info"));

  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(writer)
    .with_ansi(false)
    .init();

  Ok(guard)
}

fn remote(config: &Config) -> Result<HttpRemote> {
  HttpRemote::new(
    &config.api.base_url,
    Config::api_token(),
    config.request_timeout(),
  )
  .map_err(|e| eyre!("Invalid API base URL {}: {}", config.api.base_url, e))
}

fn metrics() -> SyncMetrics {
  SyncMetrics::new().with_abandon_hook(|m: &AbandonedMutation| {
    eprintln!(
      "warning: dropped {} mutation for record {:?} after {} attempts ({})",
      m.kind, m.record_id, m.retry_count, m.last_error
    );
  })
}

async fn run(config: &Config, store: Arc<LocalStore>) -> Result<()> {
  let remote = remote(config)?;
  let probe = HttpProbe::new(remote.clone(), config.sync.health_path.clone());

  // Start offline so the first successful heartbeat drains anything left from a previous run
  let monitor = ConnectivityMonitor::new(false);
  let engine = Arc::new(
    SyncEngine::new(store, Arc::new(remote), monitor.handle(), config.sync_config())
      .with_metrics(metrics()),
  );

  info!(base_url = %config.api.base_url, "watching connectivity");
  println!("Watching {} (Ctrl-C to stop)", config.api.base_url);

  tokio::select! {
    _ = monitor.run(probe, Arc::clone(&engine), config.poll_interval()) => {}
    signal = tokio::signal::ctrl_c() => {
      if let Err(e) = signal {
        warn!(error = %e, "failed to listen for Ctrl-C");
      }
    }
  }

  let totals = engine.metrics().snapshot();
  println!(
    "Stopped after {} passes: {} synced, {} failed, {} abandoned",
    totals.passes, totals.total_synced, totals.total_failed, totals.total_abandoned
  );
  Ok(())
}

async fn sync_once(config: &Config, store: Arc<LocalStore>) -> Result<()> {
  let remote = remote(config)?;
  let monitor = ConnectivityMonitor::new(true);
  let engine = SyncEngine::new(store, Arc::new(remote), monitor.handle(), config.sync_config())
    .with_metrics(metrics());

  match engine.drain().await {
    DrainOutcome::Completed(report) => println!(
      "Synced {}, failed {}, abandoned {}, deferred {}",
      report.synced, report.failed, report.abandoned, report.deferred
    ),
    other => println!("No sync pass ran: {:?}", other),
  }
  Ok(())
}

fn status(store: Arc<LocalStore>) -> Result<()> {
  let cache = OfflineCache::new(store, ConnectivityMonitor::new(false).handle());

  println!("Pending mutations: {}", cache.pending_mutations()?);
  for table in RecordTable::ALL {
    println!("Unsynced {}: {}", table.name(), cache.unsynced(table)?);
  }
  Ok(())
}

/// A cache whose connectivity reflects one heartbeat against the server.
async fn probed_cache(config: &Config, store: Arc<LocalStore>, remote: &HttpRemote) -> OfflineCache {
  let probe = HttpProbe::new(remote.clone(), config.sync.health_path.clone());
  let monitor = ConnectivityMonitor::new(false);
  monitor.observe(probe.is_reachable().await);

  OfflineCache::new(store, monitor.handle()).with_stale_time(config.stale_time())
}

async fn records(
  config: &Config,
  store: Arc<LocalStore>,
  table: RecordTable,
  owner: &str,
) -> Result<()> {
  let remote = remote(config)?;
  let cache = probed_cache(config, store, &remote).await;

  let result = cache
    .read_records(table, owner, || remote.fetch_records(table, owner))
    .await;

  println!("{} for {} ({:?})", table.name(), owner, result.source);
  for record in &result.data {
    let state = if record.synced { "synced" } else { "pending" };
    println!("  #{} [{}] {}", record.id, state, record.payload);
  }
  Ok(())
}

async fn medicines(config: &Config, store: Arc<LocalStore>) -> Result<()> {
  let remote = remote(config)?;
  let cache = probed_cache(config, store, &remote).await;

  let result = cache.read_medicines(|| remote.fetch_medicines()).await;

  println!("Medicines ({:?})", result.source);
  for medicine in &result.data {
    println!("  {} x{}", medicine.name, medicine.stock_quantity);
  }
  Ok(())
}
