use std::path::PathBuf;
use std::sync::Arc;

use annal_core::{
    ActorTracking, HistoryConfig, HistoryRecord, HistoryTracker, MutationContext, UpdateSource,
};
use annal_store_sqlite::{HistoryRegistry, SqliteHistory, StoreOptions};
use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

/// Context key the CLI stores the `--actor` payload under.
const ACTOR_CONTEXT_PATH: &str = "user";

#[derive(Debug, Parser)]
#[command(name = "annal")]
#[command(about = "Document mutation history CLI")]
struct Cli {
    #[arg(long, default_value = "./annal_history.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Track {
        #[command(subcommand)]
        command: Box<TrackCommand>,
    },
    History {
        #[command(subcommand)]
        command: Box<HistoryCommand>,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum TrackCommand {
    Insert(TrackInsertArgs),
    Update(TrackUpdateArgs),
    Remove(TrackRemoveArgs),
}

#[derive(Debug, Args)]
struct TargetArgs {
    #[arg(long)]
    collection: String,
    /// Override for the default `<collection>_history` target name.
    #[arg(long)]
    history_collection: Option<String>,
    /// Alternate database file for this history collection.
    #[arg(long)]
    database: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct ActorArgs {
    /// JSON identity attributed to this mutation.
    #[arg(long)]
    actor: Option<String>,
    /// Actor keys stripped before the record is written.
    #[arg(long = "actor-blacklist")]
    actor_blacklist: Vec<String>,
}

#[derive(Debug, Args)]
struct TrackInsertArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    document: String,
    #[arg(long, default_value_t = false)]
    include_collection_name: bool,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Args)]
struct TrackUpdateArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Pre-update snapshot captured at read time.
    #[arg(long)]
    original: String,
    /// Live state of an already-loaded instance.
    #[arg(long, conflicts_with_all = ["filter", "changes"])]
    current: Option<String>,
    /// Matching query of a single-document partial update.
    #[arg(long, requires = "changes")]
    filter: Option<String>,
    /// Patch fields of a single-document partial update.
    #[arg(long, requires = "filter")]
    changes: Option<String>,
    #[arg(long, default_value_t = false)]
    diff_only: bool,
    #[arg(long, default_value_t = false)]
    include_collection_name: bool,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Args)]
struct TrackRemoveArgs {
    #[command(flatten)]
    target: TargetArgs,
    /// Full pre-deletion snapshot.
    #[arg(long)]
    document: String,
    #[arg(long, default_value_t = false)]
    include_collection_name: bool,
    #[command(flatten)]
    actor: ActorArgs,
}

#[derive(Debug, Subcommand)]
enum HistoryCommand {
    List(HistoryListArgs),
    Clear(HistoryTargetArgs),
    Export(HistoryExportArgs),
}

#[derive(Debug, Args)]
struct HistoryTargetArgs {
    #[command(flatten)]
    target: TargetArgs,
}

#[derive(Debug, Args)]
struct HistoryListArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    document_id: Option<String>,
    #[arg(long)]
    limit: Option<u64>,
}

#[derive(Debug, Args)]
struct HistoryExportArgs {
    #[command(flatten)]
    target: TargetArgs,
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    Check,
}

#[derive(Debug, Serialize)]
struct TrackResult {
    collection: String,
    history_collection: String,
    record: HistoryRecord,
}

#[derive(Debug, Serialize)]
struct ListResult {
    history_collection: String,
    count: usize,
    records: Vec<HistoryRecord>,
}

#[derive(Debug, Serialize)]
struct ClearResult {
    history_collection: String,
    deleted: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let registry = HistoryRegistry::new(cli.db.clone());

    match cli.command {
        Command::Track { command } => run_track(&registry, *command).await,
        Command::History { command } => run_history(&registry, *command),
        Command::Db { command } => run_db(&registry, &command),
    }
}

async fn run_track(registry: &HistoryRegistry, command: TrackCommand) -> Result<()> {
    match command {
        TrackCommand::Insert(args) => {
            let config =
                tracking_config(&args.target, &args.actor, false, args.include_collection_name);
            let tracker = open_tracker(registry, &args.target, config)?;
            let context = mutation_context(&args.actor)?;
            let document = parse_json("document", &args.document)?;
            let record = tracker.record_insert(&document, &context).await?;
            print_track(tracker.config(), record)
        }
        TrackCommand::Update(args) => {
            let config = tracking_config(
                &args.target,
                &args.actor,
                args.diff_only,
                args.include_collection_name,
            );
            let tracker = open_tracker(registry, &args.target, config)?;
            let context = mutation_context(&args.actor)?;
            let original = parse_json("original", &args.original)?;
            let source = match (args.current, args.filter, args.changes) {
                (Some(current), None, None) => UpdateSource::Instance {
                    original,
                    current: parse_json("current", &current)?,
                },
                (None, Some(filter), Some(changes)) => UpdateSource::Patch {
                    original,
                    filter: parse_json("filter", &filter)?,
                    changes: parse_json("changes", &changes)?,
                },
                _ => {
                    return Err(anyhow!(
                        "track update needs either --current or both --filter and --changes"
                    ))
                }
            };
            let record = tracker.record_update(source, &context).await?;
            print_track(tracker.config(), record)
        }
        TrackCommand::Remove(args) => {
            let config =
                tracking_config(&args.target, &args.actor, false, args.include_collection_name);
            let tracker = open_tracker(registry, &args.target, config)?;
            let context = mutation_context(&args.actor)?;
            let document = parse_json("document", &args.document)?;
            let record = tracker.record_remove(&document, &context).await?;
            print_track(tracker.config(), record)
        }
    }
}

fn run_history(registry: &HistoryRegistry, command: HistoryCommand) -> Result<()> {
    match command {
        HistoryCommand::List(args) => {
            let (config, handle) = open_handle(registry, &args.target)?;
            let records = handle.list(args.document_id.as_deref(), args.limit)?;
            print_json(&ListResult {
                history_collection: config.history_collection_name(),
                count: records.len(),
                records,
            })
        }
        HistoryCommand::Clear(args) => {
            let (config, handle) = open_handle(registry, &args.target)?;
            let deleted = handle.clear_all()?;
            print_json(&ClearResult {
                history_collection: config.history_collection_name(),
                deleted,
            })
        }
        HistoryCommand::Export(args) => {
            let (_, handle) = open_handle(registry, &args.target)?;
            let manifest = handle.export_snapshot(&args.out)?;
            print_json(&manifest)
        }
    }
}

fn run_db(registry: &HistoryRegistry, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::Check => {
            let report = registry.integrity_check()?;
            print_json(&report)
        }
    }
}

fn tracking_config(
    target: &TargetArgs,
    actor: &ActorArgs,
    diff_only: bool,
    include_collection_name: bool,
) -> HistoryConfig {
    let mut config = HistoryConfig::new(target.collection.clone());
    config.custom_collection_name = target.history_collection.clone();
    config.include_collection_name = include_collection_name;
    config.diff_only = diff_only;
    if actor.actor.is_some() {
        config.modified_by = Some(ActorTracking {
            context_path: ACTOR_CONTEXT_PATH.to_string(),
            blacklist: actor.actor_blacklist.clone(),
        });
    }
    config
}

fn store_options(target: &TargetArgs) -> StoreOptions {
    StoreOptions { database: target.database.clone() }
}

fn open_tracker(
    registry: &HistoryRegistry,
    target: &TargetArgs,
    config: HistoryConfig,
) -> Result<HistoryTracker<Arc<SqliteHistory>>> {
    let handle = registry.handle_for(&config, &store_options(target))?;
    Ok(HistoryTracker::new(config, handle))
}

fn open_handle(
    registry: &HistoryRegistry,
    target: &TargetArgs,
) -> Result<(HistoryConfig, Arc<SqliteHistory>)> {
    let mut config = HistoryConfig::new(target.collection.clone());
    config.custom_collection_name = target.history_collection.clone();
    let handle = registry.handle_for(&config, &store_options(target))?;
    Ok((config, handle))
}

fn mutation_context(actor: &ActorArgs) -> Result<MutationContext> {
    let mut context = MutationContext::new();
    if let Some(raw) = &actor.actor {
        context = context.with_value(ACTOR_CONTEXT_PATH, parse_json("actor", raw)?);
    }
    Ok(context)
}

fn parse_json(what: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("--{what} is not valid JSON"))
}

fn print_track(config: &HistoryConfig, record: HistoryRecord) -> Result<()> {
    print_json(&TrackResult {
        collection: config.collection_name.clone(),
        history_collection: config.history_collection_name(),
        record,
    })
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let body =
        serde_json::to_string_pretty(value).context("failed to serialize output envelope")?;
    println!("{body}");
    Ok(())
}
