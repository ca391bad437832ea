use std::path::PathBuf;

use anyhow::{anyhow, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use site_order_core::{Collection, RecordId};
use site_order_store_sqlite::SqliteStore;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "sok")]
#[command(about = "Site order kernel CLI")]
struct Cli {
    #[arg(long, default_value = "./site_order.sqlite3")]
    db: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
    Record {
        #[command(subcommand)]
        command: RecordCommand,
    },
    Order {
        #[command(subcommand)]
        command: OrderCommand,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    SchemaVersion,
    Migrate(DbMigrateArgs),
    IntegrityCheck,
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
enum RecordCommand {
    Add(RecordAddArgs),
    List(CollectionArgs),
    Delete(RecordDeleteArgs),
}

#[derive(Debug, Args)]
struct CollectionArgs {
    #[arg(long)]
    collection: Collection,
}

#[derive(Debug, Args)]
struct RecordAddArgs {
    #[arg(long)]
    collection: Collection,
    #[arg(long)]
    title: String,
}

#[derive(Debug, Args)]
struct RecordDeleteArgs {
    #[arg(long)]
    collection: Collection,
    #[arg(long)]
    id: RecordId,
}

#[derive(Debug, Subcommand)]
enum OrderCommand {
    Reindex(ReindexArgs),
    Swap(SwapArgs),
    Compact(CollectionArgs),
    Check(CollectionArgs),
}

#[derive(Debug, Args)]
struct ReindexArgs {
    #[arg(long)]
    collection: Collection,
    /// Full ordered id list, comma separated.
    #[arg(long, value_delimiter = ',', required = true)]
    ids: Vec<RecordId>,
}

#[derive(Debug, Args)]
struct SwapArgs {
    #[arg(long)]
    collection: Collection,
    #[arg(long)]
    id1: RecordId,
    #[arg(long)]
    id2: RecordId,
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut store = SqliteStore::open(&cli.db)?;
    match cli.command {
        Command::Db { command } => run_db(command, &mut store),
        Command::Record { command } => {
            store.migrate()?;
            run_record(command, &mut store)
        }
        Command::Order { command } => {
            store.migrate()?;
            run_order(command, &mut store)
        }
    }
}

fn run_db(command: DbCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        DbCommand::SchemaVersion => run_db_schema_version(store),
        DbCommand::Migrate(args) => run_db_migrate(&args, store),
        DbCommand::IntegrityCheck => {
            let report = store.integrity_check()?;
            emit_json(serde_json::to_value(report)?)
        }
    }
}

fn run_db_schema_version(store: &SqliteStore) -> Result<()> {
    let status = store.schema_status()?;
    emit_json(serde_json::json!({
        "current_version": status.current_version,
        "target_version": status.target_version,
        "pending_versions": status.pending_versions,
        "up_to_date": status.pending_versions.is_empty(),
        "inferred_from_legacy": status.inferred_from_legacy
    }))
}

fn run_db_migrate(args: &DbMigrateArgs, store: &mut SqliteStore) -> Result<()> {
    let before = store.schema_status()?;
    if args.dry_run {
        emit_json(serde_json::json!({
            "dry_run": true,
            "current_version": before.current_version,
            "target_version": before.target_version,
            "would_apply_versions": before.pending_versions,
            "inferred_from_legacy": before.inferred_from_legacy
        }))?;
        return Ok(());
    }

    store.migrate()?;
    let after = store.schema_status()?;
    emit_json(serde_json::json!({
        "dry_run": false,
        "before_version": before.current_version,
        "applied_versions": before.pending_versions,
        "after_version": after.current_version,
        "target_version": after.target_version,
        "up_to_date": after.pending_versions.is_empty()
    }))
}

fn run_record(command: RecordCommand, store: &mut SqliteStore) -> Result<()> {
    match command {
        RecordCommand::Add(args) => {
            let record = store.create_record(args.collection, &args.title)?;
            emit_json(serde_json::to_value(record)?)
        }
        RecordCommand::List(args) => {
            let records = store.list_records(args.collection)?;
            emit_json(serde_json::json!({
                "collection": args.collection,
                "records": records
            }))
        }
        RecordCommand::Delete(args) => {
            if !store.delete_record(args.collection, args.id)? {
                return Err(anyhow!("{} record {} not found", args.collection.label(), args.id));
            }
            emit_json(serde_json::json!({
                "collection": args.collection,
                "deleted": args.id
            }))
        }
    }
}

fn run_order(command: OrderCommand, store: &mut SqliteStore) -> Result<()> {
    let (collection, changed) = match command {
        OrderCommand::Reindex(args) => {
            (args.collection, store.reindex(args.collection, &args.ids)?)
        }
        OrderCommand::Swap(args) => {
            (args.collection, store.swap_ranks(args.collection, args.id1, args.id2)?)
        }
        OrderCommand::Compact(args) => (args.collection, store.compact(args.collection)?),
        OrderCommand::Check(args) => {
            let report = store.order_report(args.collection)?;
            return emit_json(serde_json::json!({
                "collection": args.collection,
                "report": report
            }));
        }
    };

    emit_json(serde_json::json!({
        "collection": collection,
        "changed": changed
    }))
}
