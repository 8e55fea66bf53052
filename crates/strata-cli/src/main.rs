mod config;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use strata_core::{format_timestamp, RecomputeReason, DEFAULT_SCOPE};
use strata_inference::projection::{load_direction, load_shifts};
use strata_jobs::{
    dispatch_structure_recompute, drain_queue, sweep_stale_jobs, RecomputeRequest,
    StructureJobProcessor, SystemClock,
};
use strata_storage::{StructureJob, StructureStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::{config_path, load_config, StrataConfig};

#[derive(Parser, Debug)]
#[command(name = "strata", about = "Structural inference over decisions and results")]
struct Cli {
    /// SQLite database holding source rows and derived structure.
    #[arg(long, global = true, env = "STRATA_DB")]
    db: Option<PathBuf>,
    /// Config file; defaults to the platform config dir.
    #[arg(long, global = true, env = "STRATA_CONFIG")]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Enqueue a recompute unless one is already in flight for the same key.
    Dispatch {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = "manual")]
        reason: RecomputeReason,
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
        #[arg(long)]
        debounce_key: Option<String>,
    },
    /// Dispatch a backfill recompute for every user with active sources.
    Backfill {
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
    /// Run a single queued job.
    Process { job_id: String },
    /// Sweep stale jobs, then process queued jobs oldest first.
    Drain {
        #[arg(long)]
        batch_size: Option<usize>,
        #[arg(long)]
        lock_path: Option<PathBuf>,
    },
    /// Fail jobs stuck in `running`.
    Sweep,
    /// Current direction projected from the latest snapshot.
    Direction {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
    /// Shifts between the two most recent snapshots.
    Shifts {
        #[arg(long)]
        user: String,
        #[arg(long, default_value = DEFAULT_SCOPE)]
        scope: String,
    },
    /// Job history for a user.
    Jobs {
        #[arg(long)]
        user: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let path = cli.config.clone().unwrap_or_else(config_path);
    let config = load_config(&path)?;
    init_logging(&config);

    let store = open_store(&config, cli.db.clone())?;
    let output = run(&cli.command, &config, &store)?;
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn init_logging(config: &StrataConfig) {
    let fallback = config.log_level.clone().unwrap_or_else(|| "info".to_string());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_store(config: &StrataConfig, flag: Option<PathBuf>) -> Result<StructureStore> {
    let db_path = config.resolve_db_path(flag);
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
    }
    let store = StructureStore::open(&db_path)
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    info!(event = "strata_store_opened", path = %db_path.display());
    Ok(store)
}

fn run(command: &Commands, config: &StrataConfig, store: &StructureStore) -> Result<Value> {
    let now = Utc::now();
    match command {
        Commands::Dispatch {
            user,
            reason,
            scope,
            debounce_key,
        } => {
            let request = RecomputeRequest {
                user_id: user.clone(),
                scope: scope.clone(),
                reason: *reason,
                debounce_key: debounce_key.clone(),
            };
            let outcome =
                dispatch_structure_recompute(store, &request, &config.job_config(), now)?;
            to_json(&outcome)
        }
        Commands::Backfill { scope } => {
            let mut outcomes = Vec::new();
            for user_id in store.users_with_sources()? {
                let request = RecomputeRequest {
                    scope: scope.clone(),
                    ..RecomputeRequest::new(user_id.clone(), RecomputeReason::Backfill)
                };
                let outcome =
                    dispatch_structure_recompute(store, &request, &config.job_config(), now)?;
                outcomes.push(json!({ "user_id": user_id, "dispatch": outcome }));
            }
            Ok(Value::Array(outcomes))
        }
        Commands::Process { job_id } => {
            let processor =
                StructureJobProcessor::new(config.inference_config(), config.job_config());
            let report = processor
                .process(store, job_id, &SystemClock)
                .with_context(|| format!("job {job_id} did not succeed"))?;
            to_json(&report)
        }
        Commands::Drain {
            batch_size,
            lock_path,
        } => {
            let mut drain = config.drain_config();
            if let Some(batch_size) = batch_size {
                drain.batch_size = *batch_size;
            }
            if lock_path.is_some() {
                drain.lock_path = lock_path.clone();
            }
            let report = drain_queue(store, &drain, &SystemClock)?;
            to_json(&report)
        }
        Commands::Sweep => {
            let swept = sweep_stale_jobs(store, &config.job_config(), now)?;
            Ok(json!({ "swept": swept }))
        }
        Commands::Direction { user, scope } => match load_direction(store, user, scope)? {
            Some(direction) => to_json(&direction),
            None => bail!("no snapshot for user {user} in scope {scope}"),
        },
        Commands::Shifts { user, scope } => match load_shifts(store, user, scope)? {
            Some(shifts) => to_json(&shifts),
            None => bail!("no snapshot for user {user} in scope {scope}"),
        },
        Commands::Jobs { user } => {
            let jobs = store.jobs_for_user(user)?;
            Ok(Value::Array(jobs.iter().map(job_json).collect()))
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn job_json(job: &StructureJob) -> Value {
    json!({
        "id": job.id,
        "user_id": job.user_id,
        "scope": job.scope,
        "job_type": job.job_type,
        "status": job.status.as_str(),
        "payload": job.payload,
        "debounce_key": job.debounce_key,
        "queued_at": format_timestamp(job.queued_at),
        "started_at": job.started_at.map(format_timestamp),
        "finished_at": job.finished_at.map(format_timestamp),
        "error": job.error,
    })
}
