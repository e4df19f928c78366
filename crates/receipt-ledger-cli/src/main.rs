use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use receipt_ledger_core::{
    ExtractionError, Identity, IdentityProvider, ReceiptDraft, ReceiptExtractor, ReceiptId,
    StaticIdentityProvider,
};
use receipt_ledger_history::HistoryService;
use serde_json::Value;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "rledger")]
#[command(about = "Receipt Ledger CLI")]
struct Cli {
    #[arg(long, default_value = "./receipt_ledger.sqlite3")]
    db: PathBuf,

    /// Stable identifier of the signed-in user. Omit to stay anonymous.
    #[arg(long)]
    user_id: Option<String>,

    /// Display name shown on owner stamps. Defaults to the user id.
    #[arg(long)]
    display_name: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Normalize a draft file and append it to the visible history.
    Save(SaveArgs),
    /// List the visible history, newest first.
    List,
    /// Delete one receipt by id.
    Delete(DeleteArgs),
    /// Merge anonymous history into the signed-in user's namespace.
    Login,
    /// Write the visible history as a portable backup file.
    Export(ExportArgs),
    /// Merge a backup file into the visible history.
    Import(ImportArgs),
    /// Report per-namespace storage usage.
    Stats,
}

#[derive(Debug, Args)]
struct SaveArgs {
    #[arg(long)]
    draft: PathBuf,
}

#[derive(Debug, Args)]
struct DeleteArgs {
    #[arg(long)]
    id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    out: PathBuf,
}

#[derive(Debug, Args)]
struct ImportArgs {
    #[arg(long = "in")]
    input: PathBuf,
}

/// Extraction backend that reads an already-extracted draft from a JSON
/// file instead of calling a vision model.
struct DraftFileExtractor;

impl ReceiptExtractor for DraftFileExtractor {
    fn extract(&self, image: &[u8]) -> Result<ReceiptDraft, ExtractionError> {
        serde_json::from_slice(image).map_err(|err| ExtractionError::Malformed(err.to_string()))
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();
}

fn identity_from_args(cli: &Cli) -> Option<Identity> {
    cli.user_id.as_ref().map(|user_id| {
        let display_name = cli.display_name.clone().unwrap_or_else(|| user_id.clone());
        Identity::new(user_id.clone(), display_name)
    })
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
    init_tracing();
    let cli = Cli::parse();

    let provider = StaticIdentityProvider::new(identity_from_args(&cli));
    let identity = provider.current_identity();

    let mut history = HistoryService::open(&cli.db)
        .with_context(|| format!("failed to open history database at {}", cli.db.display()))?;

    match cli.command {
        Command::Save(args) => run_save(&args, &mut history, identity.as_ref()),
        Command::List => run_list(&mut history, identity.as_ref()),
        Command::Delete(args) => run_delete(&args, &mut history, identity.as_ref()),
        Command::Login => {
            let identity = identity.ok_or_else(|| anyhow!("login requires --user-id"))?;
            run_login(&mut history, &identity)
        }
        Command::Export(args) => run_export(&args, &mut history, identity.as_ref()),
        Command::Import(args) => run_import(&args, &mut history, identity.as_ref()),
        Command::Stats => run_stats(&history),
    }
}

fn run_save(
    args: &SaveArgs,
    history: &mut HistoryService,
    identity: Option<&Identity>,
) -> Result<()> {
    let payload = fs::read(&args.draft)
        .with_context(|| format!("failed to read draft file {}", args.draft.display()))?;
    let draft = DraftFileExtractor.extract(&payload)?;
    let record = history.save(draft, identity)?;
    emit_json(serde_json::to_value(&record).context("failed to serialize saved receipt")?)
}

fn run_list(history: &mut HistoryService, identity: Option<&Identity>) -> Result<()> {
    let records = history.list(identity)?;
    emit_json(serde_json::json!({
        "count": records.len(),
        "records": records,
    }))
}

fn run_delete(
    args: &DeleteArgs,
    history: &mut HistoryService,
    identity: Option<&Identity>,
) -> Result<()> {
    let id = ReceiptId::new(args.id.clone());
    let remaining = history.delete(&id, identity)?;
    emit_json(serde_json::json!({
        "deleted_id": args.id,
        "count": remaining.len(),
        "records": remaining,
    }))
}

fn run_login(history: &mut HistoryService, identity: &Identity) -> Result<()> {
    let report = history.sync(identity)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize sync report")?)
}

fn run_export(
    args: &ExportArgs,
    history: &mut HistoryService,
    identity: Option<&Identity>,
) -> Result<()> {
    let payload = history.export(identity)?;
    fs::write(&args.out, &payload)
        .with_context(|| format!("failed to write backup file {}", args.out.display()))?;
    emit_json(serde_json::json!({
        "out_file": args.out.display().to_string(),
        "bytes": payload.len(),
    }))
}

fn run_import(
    args: &ImportArgs,
    history: &mut HistoryService,
    identity: Option<&Identity>,
) -> Result<()> {
    let payload = fs::read(&args.input)
        .with_context(|| format!("failed to read backup file {}", args.input.display()))?;
    let report = history.import(&payload, identity)?;
    emit_json(serde_json::to_value(&report).context("failed to serialize import report")?)
}

fn run_stats(history: &HistoryService) -> Result<()> {
    let report = history.storage_report()?;
    emit_json(serde_json::to_value(&report).context("failed to serialize storage report")?)
}
