//! Vaultsync CLI - run and inspect the sync engine for a vault.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use vaultsync_common::VaultPath;
use vaultsync_sync::{EventPattern, SyncConfig, VaultSync, Winner};

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "Vaultsync - local-first vault synchronization")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// Vault root directory.
    #[arg(long, default_value = ".")]
    vault: PathBuf,

    /// Configuration file (default: <vault>/.vaultsync/config.json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine until Ctrl-C, printing every event.
    Watch {
        /// Print events as JSON lines.
        #[arg(long)]
        json: bool,
    },

    /// Reconcile the vault against recorded state now.
    Scan,

    /// Print journal entries.
    Log {
        /// Only entries after this change id.
        #[arg(long, default_value_t = 0)]
        after: i64,

        /// Read from this consumer's cursor and advance it.
        #[arg(long)]
        consumer: Option<String>,

        /// Maximum number of entries.
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Show the current version and history of a document.
    Status {
        /// Vault-relative path.
        path: String,
    },

    /// Delete journal entries older than the retention window.
    Compact {
        /// Retention in days.
        #[arg(long, default_value_t = 30)]
        days: u32,
    },

    /// List active advisory locks.
    Locks {
        /// Remove expired locks first.
        #[arg(long)]
        cleanup: bool,
    },

    /// List recorded conflicts.
    Conflicts {
        /// Include settled conflicts.
        #[arg(long)]
        all: bool,
    },

    /// Settle a pending manual conflict.
    Resolve {
        conflict_id: String,

        /// Side that wins: "local" or "remote".
        #[arg(long, value_parser = ["local", "remote"])]
        winner: String,
    },

    /// Print this vault's device id.
    Device,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(&cli.vault, cli.config.as_deref())?;

    match cli.command {
        Commands::Watch { json } => cmd_watch(&cli.vault, config, json).await,
        Commands::Scan => cmd_scan(&*open(&cli.vault, config)?).await,
        Commands::Log {
            after,
            consumer,
            limit,
        } => cmd_log(&*open(&cli.vault, config)?, after, consumer.as_deref(), limit),
        Commands::Status { path } => cmd_status(&*open(&cli.vault, config)?, &path),
        Commands::Compact { days } => cmd_compact(&*open(&cli.vault, config)?, days),
        Commands::Locks { cleanup } => cmd_locks(&*open(&cli.vault, config)?, cleanup),
        Commands::Conflicts { all } => cmd_conflicts(&*open(&cli.vault, config)?, all),
        Commands::Resolve {
            conflict_id,
            winner,
        } => cmd_resolve(&*open(&cli.vault, config)?, &conflict_id, &winner),
        Commands::Device => {
            println!("{}", open(&cli.vault, config)?.device_id());
            Ok(())
        }
    }
}

fn load_config(vault: &Path, explicit: Option<&Path>) -> Result<SyncConfig> {
    match explicit {
        Some(path) => SyncConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display())),
        None => SyncConfig::load_for_vault(vault).context("Failed to load vault config"),
    }
}

/// Open the engine for a one-shot command: no watcher, no timers.
fn open(vault: &Path, config: SyncConfig) -> Result<Arc<VaultSync>> {
    let config = SyncConfig {
        watch: false,
        ..config
    };
    VaultSync::open(vault, config)
        .with_context(|| format!("Failed to open vault {}", vault.display()))
}

async fn cmd_watch(vault: &Path, config: SyncConfig, json: bool) -> Result<()> {
    let engine = VaultSync::open(vault, config)
        .with_context(|| format!("Failed to open vault {}", vault.display()))?;

    engine.on(EventPattern::Any, move |event| {
        if json {
            println!("{}", serde_json::to_string(event)?);
        } else {
            match event.change_id {
                Some(id) => println!("#{} {} {}", id, event.event_type, event.path),
                None => println!("{} {}", event.event_type, event.path),
            }
        }
        Ok(())
    });

    engine.start().await.context("Failed to start engine")?;
    info!("Watching {} (Ctrl-C to stop)", engine.root().display());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    engine.stop().await.context("Failed to stop engine")?;
    Ok(())
}

async fn cmd_scan(engine: &VaultSync) -> Result<()> {
    let count = engine.trigger_scan().await.context("Scan failed")?;
    println!("Scan complete: {} changes", count);
    Ok(())
}

fn cmd_log(engine: &VaultSync, after: i64, consumer: Option<&str>, limit: usize) -> Result<()> {
    let changelog = engine.changelog();
    let entries = match consumer {
        Some(consumer) => changelog.read_pending(consumer, limit)?,
        None => changelog.get_changes_after_limit(after, limit)?,
    };

    if entries.is_empty() {
        println!("No changes.");
    }
    for entry in &entries {
        let change = &entry.change;
        match &change.old_path {
            Some(old) => println!(
                "#{} {} {} -> {} ({}, {})",
                entry.change_id, change.change_type, old, change.path, change.source, change.device_id
            ),
            None => println!(
                "#{} {} {} ({}, {})",
                entry.change_id, change.change_type, change.path, change.source, change.device_id
            ),
        }
    }

    if let (Some(consumer), Some(last)) = (consumer, entries.last()) {
        changelog.acknowledge(consumer, last.change_id)?;
        println!("Cursor for {} advanced to {}", consumer, last.change_id);
    }
    Ok(())
}

fn cmd_status(engine: &VaultSync, path: &str) -> Result<()> {
    let path = VaultPath::parse(path).context("Invalid vault path")?;
    match engine.state().get_file_state(&path)? {
        Some(current) => {
            println!("{}:", path);
            println!("  Version: {}", current.version);
            println!("  Hash: {}", current.content_hash);
            println!("  Size: {} bytes", current.size);
            println!("  Modified: {}", current.mtime);
            println!("  Device: {}", current.device_id);
        }
        None => println!("{} is not tracked.", path),
    }

    let history = engine.state().get_history(&path)?;
    if !history.is_empty() {
        println!("  History:");
        for version in history {
            println!(
                "    v{} {} {} ({})",
                version.version,
                version.recorded_at,
                &version.content_hash[..version.content_hash.len().min(12)],
                version.device_id
            );
        }
    }
    Ok(())
}

fn cmd_compact(engine: &VaultSync, days: u32) -> Result<()> {
    let removed = engine.changelog().compact(days)?;
    println!(
        "Removed {} entries older than {} days ({} remain).",
        removed,
        days,
        engine.changelog().count()?
    );
    Ok(())
}

fn cmd_locks(engine: &VaultSync, cleanup: bool) -> Result<()> {
    if cleanup {
        let removed = engine.locks().cleanup_expired()?;
        println!("Removed {} expired locks.", removed);
    }
    let locks = engine.locks().active_locks()?;
    if locks.is_empty() {
        println!("No active locks.");
    }
    for lock in locks {
        println!("  {} held by {} until {}", lock.path, lock.holder, lock.expires_at);
    }
    Ok(())
}

fn cmd_conflicts(engine: &VaultSync, all: bool) -> Result<()> {
    let conflicts = engine.conflicts(!all)?;
    if conflicts.is_empty() {
        println!("No conflicts.");
    }
    for conflict in conflicts {
        let state = if conflict.is_pending() { "pending" } else { "settled" };
        println!(
            "{} {} [{}, {}] local {} vs remote {}",
            conflict.conflict_id,
            conflict.path,
            conflict.strategy,
            state,
            conflict.local_version.device_id,
            conflict.remote_version.device_id
        );
        if let Some(resolution) = conflict.resolution {
            println!("    loser kept at {}", resolution.loser_path);
        }
    }
    Ok(())
}

fn cmd_resolve(engine: &VaultSync, conflict_id: &str, winner: &str) -> Result<()> {
    let winner = match winner {
        "remote" => Winner::Remote,
        _ => Winner::Local,
    };
    if engine.resolver().mark_resolved(conflict_id, winner)? {
        println!("Conflict {} settled.", conflict_id);
    } else {
        anyhow::bail!("No pending conflict {}", conflict_id);
    }
    Ok(())
}
