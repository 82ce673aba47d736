//! `replhub` command line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use replhub_core::config::{ReplicationConfig, ScalingConfig};
use replhub_core::credentials::StaticCredentialStore;
use replhub_core::fs_store::FsObjectStore;
use replhub_core::ledger::MemoryLedger;
use replhub_core::queue::MemoryQueue;

use crate::finder::FinderOutcome;
use crate::pipeline::{Backends, Pipeline};
use crate::scaling::ScalingController;

/// Top-level arguments.
#[derive(Parser)]
#[command(name = "replhub")]
#[command(about = "Replicate objects between stores through a durable job queue", long_about = None)]
pub struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Action to perform.
    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Find changed objects and replicate them until the queue is empty.
    Run {
        #[command(flatten)]
        local: LocalArgs,
    },
    /// List the source and report what would be replicated.
    Find {
        #[command(flatten)]
        local: LocalArgs,
        /// Count candidates without writing the ledger or the queue.
        #[arg(long)]
        dry_run: bool,
    },
    /// Feed store notifications through the event trigger, then drain.
    Notify {
        #[command(flatten)]
        local: LocalArgs,
        /// Notification bodies, one JSON document per file.
        #[arg(required = true)]
        events: Vec<PathBuf>,
    },
    /// Load and validate a configuration file.
    CheckConfig {
        /// Configuration file (TOML or JSON).
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Show the capacity the scaling controller picks for a queue depth.
    Scale {
        /// Visible plus in-flight messages.
        #[arg(long)]
        depth: u64,
        /// Current pool capacity.
        #[arg(long, default_value = "1")]
        current: usize,
        /// Take pool bounds from this configuration file.
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// Options shared by the commands that move data between local directories.
#[derive(clap::Args, Clone)]
pub struct LocalArgs {
    /// Configuration file (TOML or JSON).
    #[arg(short, long, env = "REPLHUB_CONFIG")]
    pub config: PathBuf,

    /// Directory holding one sub-directory per bucket.
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// Ledger snapshot, loaded at start and written back at exit.
    #[arg(long)]
    pub ledger: Option<PathBuf>,

    /// JSON object mapping credential reference names to parameter values.
    #[arg(long, env = "REPLHUB_CREDENTIALS")]
    pub credentials: Option<PathBuf>,
}

fn load_config(path: &Path) -> Result<ReplicationConfig> {
    let config = ReplicationConfig::from_file(path)
        .with_context(|| format!("loading {}", path.display()))?
        .apply_env(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

fn load_credentials(path: Option<&Path>) -> Result<StaticCredentialStore> {
    let mut store = StaticCredentialStore::new();
    let Some(path) = path else {
        return Ok(store);
    };
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading credentials {}", path.display()))?;
    let entries: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&contents)?;
    for (name, value) in entries {
        store.insert_json(&name, &value.to_string())?;
    }
    Ok(store)
}

struct LocalPipeline {
    pipeline: Pipeline,
    ledger: Arc<MemoryLedger>,
    snapshot: PathBuf,
}

impl LocalPipeline {
    async fn open(args: &LocalArgs) -> Result<Self> {
        let config = load_config(&args.config)?;
        let snapshot = args
            .ledger
            .clone()
            .unwrap_or_else(|| args.data_dir.join(".replhub-ledger.bin"));
        let ledger = if snapshot.exists() {
            let ledger = MemoryLedger::load_snapshot(&snapshot)?;
            info!(path = %snapshot.display(), rows = ledger.records().len(), "loaded ledger snapshot");
            ledger
        } else {
            MemoryLedger::new()
        };
        let ledger = Arc::new(ledger);

        let backends = Backends {
            source: Arc::new(FsObjectStore::open(args.data_dir.join(&config.source.bucket)).await?),
            destination: Arc::new(
                FsObjectStore::open(args.data_dir.join(&config.destination.bucket)).await?,
            ),
            queue: Arc::new(MemoryQueue::new(config.queue.max_receive_count)),
            ledger: ledger.clone(),
            credentials: Arc::new(load_credentials(args.credentials.as_deref())?),
        };
        let pipeline = Pipeline::from_config(config, backends).await?;
        Ok(Self {
            pipeline,
            ledger,
            snapshot,
        })
    }

    async fn drain_and_save(&self) -> Result<()> {
        let report = self.pipeline.drain().await?;
        self.ledger.save_snapshot(&self.snapshot)?;
        let counts = self.ledger.status_counts();
        println!(
            "transferred={} failed={} bytes={} dead_letters={}",
            report.transferred, report.failed, report.bytes, report.dead_letters
        );
        println!(
            "ledger: pending={} in_progress={} done={} failed={}",
            counts.pending, counts.in_progress, counts.done, counts.failed
        );
        if report.dead_letters > 0 {
            warn!(count = report.dead_letters, "messages parked in the dead-letter queue");
        }
        Ok(())
    }
}

impl Cli {
    /// Execute the parsed command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Command::Run { ref local } => {
                let local = LocalPipeline::open(local).await?;
                print_finder(&local.pipeline.run_finder(false).await?);
                local.drain_and_save().await
            }
            Command::Find { ref local, dry_run } => {
                let local = LocalPipeline::open(local).await?;
                // The in-process queue ends with the command, so PENDING rows
                // are not persisted; the next `run` finds the same objects.
                print_finder(&local.pipeline.run_finder(dry_run).await?);
                Ok(())
            }
            Command::Notify {
                ref local,
                ref events,
            } => {
                let local = LocalPipeline::open(local).await?;
                let trigger = local.pipeline.event_trigger();
                for path in events {
                    let body = std::fs::read_to_string(path)
                        .with_context(|| format!("reading {}", path.display()))?;
                    let report = trigger.handle_notification(&body).await?;
                    println!(
                        "{}: enqueued={} stale={} ignored={}",
                        path.display(),
                        report.enqueued,
                        report.stale,
                        report.ignored
                    );
                }
                local.drain_and_save().await
            }
            Command::CheckConfig { ref config } => {
                let config = load_config(config)?;
                println!("{}", serde_json::to_string_pretty(&config)?);
                Ok(())
            }
            Command::Scale {
                depth,
                current,
                ref config,
            } => {
                let scaling = match config {
                    Some(path) => load_config(path)?.scaling,
                    None => ScalingConfig::default(),
                };
                let decision = ScalingController::new(&scaling).evaluate(depth, current);
                println!(
                    "depth={} current={} delta={} target={}",
                    decision.depth, decision.current, decision.delta, decision.target
                );
                Ok(())
            }
        }
    }
}

fn print_finder(outcome: &FinderOutcome) {
    match outcome {
        FinderOutcome::Skipped { depth } => {
            println!("finder skipped: {} messages still queued", depth)
        }
        FinderOutcome::Completed(r) => println!(
            "listed={} enqueued={} unchanged={} archived={} shards={}",
            r.listed, r.enqueued, r.skipped_unchanged, r.skipped_archived, r.shards
        ),
    }
}
