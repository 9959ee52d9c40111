use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::Deserialize;

use hookguard_core::{GuardPolicy, PolicyConfig};
use hookguard_storage::{FjallRecordStore, FjallStore, RecordStore, RetentionTask};
use hookguard_types::{now_ns, IdempotencyKey, Record};

#[derive(clap::Parser, Debug)]
#[command(name = "hookguard", about = "Operator tool for a hookguard record store")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Overrides `storage.data_dir`.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand, Debug)]
enum Command {
    /// Print the stored record for one idempotency key.
    Inspect { key: String },
    /// Purge terminal records older than `storage.retention_secs`.
    Sweep {
        /// Keep sweeping every `storage.sweep_interval_secs` until Ctrl-C.
        #[arg(long)]
        watch: bool,
    },
    /// Print the guard policy the loaded configuration resolves to.
    Policy,
}

#[derive(Debug, Deserialize)]
struct StorageConfig {
    data_dir: PathBuf,
    retention_secs: u64,
    sweep_interval_secs: u64,
}

#[derive(Debug, Deserialize)]
struct ObservabilityConfig {
    log_level: String,
    log_format: String,
}

#[derive(Debug, Deserialize)]
struct Config {
    guard: PolicyConfig,
    storage: StorageConfig,
    observability: ObservabilityConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let mut figment = Figment::new()
        .merge(Toml::string(include_str!("../../../config/default.toml")));

    if let Some(ref config_path) = cli.config {
        figment = figment.merge(Toml::file_exact(config_path));
    }

    let mut config: Config = figment
        .merge(Env::prefixed("HOOKGUARD_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    if let Some(dir) = cli.data_dir {
        config.storage.data_dir = dir;
    }

    match config.observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&config.observability.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    let policy = GuardPolicy::try_from(config.guard).context("invalid [guard] configuration")?;

    match cli.command {
        Command::Policy => {
            println!("{policy:#?}");
        }
        Command::Inspect { key } => {
            let key = IdempotencyKey::new(key).context("invalid idempotency key")?;
            let store = open_store(&config.storage)?;
            match FjallRecordStore(store).get(&key).await? {
                Some(record) => print_record(&record, &policy),
                None => println!("{key}: no record"),
            }
        }
        Command::Sweep { watch } => {
            let store = Arc::new(FjallRecordStore(open_store(&config.storage)?));
            let task = RetentionTask::new(
                store,
                Duration::from_secs(config.storage.retention_secs),
                Duration::from_secs(config.storage.sweep_interval_secs),
            );
            if watch {
                tracing::info!(
                    retention_secs = config.storage.retention_secs,
                    interval_secs = config.storage.sweep_interval_secs,
                    "retention sweeper starting"
                );
                let (tx, rx) = tokio::sync::watch::channel(false);
                let sweeper = tokio::spawn(task.run(rx));
                tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;
                tracing::info!("shutting down");
                let _ = tx.send(true);
                sweeper.await.context("retention sweeper panicked")?;
            } else {
                let removed = task.sweep_once().await?;
                println!("purged {removed} terminal record(s)");
            }
        }
    }

    Ok(())
}

fn open_store(storage: &StorageConfig) -> anyhow::Result<Arc<FjallStore>> {
    tracing::debug!(data_dir = %storage.data_dir.display(), "opening record store");
    FjallStore::open(&storage.data_dir)
        .with_context(|| format!("failed to open store at {}", storage.data_dir.display()))
}

fn print_record(record: &Record, policy: &GuardPolicy) {
    let now = now_ns();
    println!("key:        {}", record.key);
    println!("state:      {}", record.state);
    println!("attempts:   {}/{}", record.attempt_count, policy.max_attempts);
    println!("created:    {} ns", record.created_at_ns);
    println!("updated:    {} ns", record.updated_at_ns);
    if let Some(owner) = &record.lease_owner {
        println!("owner:      {owner}");
    }
    if let Some(expires) = record.lease_expires_at_ns {
        let status = if record.is_stale(now) { "stale" } else { "live" };
        println!("expires:    {expires} ns ({status})");
    }
    if let Some(result) = &record.result {
        println!("result:     {}", String::from_utf8_lossy(result));
    }
    if let Some(error) = &record.error {
        println!("error:      {error}");
    }
}
