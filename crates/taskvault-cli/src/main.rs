use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use taskvault_migrate::{MigrateOptions, MigrationConfig, MigrationResult, Migrator, OsFileSystem};
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const LOG_ENV: &str = "TASKVAULT_LOG";

#[derive(Debug, Parser)]
#[command(name = "tv")]
#[command(about = "Taskvault legacy document migration")]
struct Cli {
    /// Directory holding the legacy documents and the task store.
    #[arg(long, default_value = ".", global = true)]
    data_dir: PathBuf,

    /// Extra attempts when another process holds the migration lock.
    #[arg(long, global = true)]
    lock_retries: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Migrate the documents in the data directory into the task store.
    Migrate(MigrateArgs),
    /// Migrate documents from another directory through an explicit staging path.
    MigrateAtomic(MigrateAtomicArgs),
    /// Count the records in each source document.
    Count,
    /// Show the recorded migration state and whether it can be resumed.
    Status,
    /// Check the task store and the recorded source checksums.
    Verify,
    /// Print the entries of a migration log.
    Log(LogArgs),
}

#[derive(Debug, Args)]
struct MigrateArgs {
    #[arg(long, default_value_t = false)]
    force: bool,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct MigrateAtomicArgs {
    #[arg(long)]
    source: PathBuf,
    #[arg(long)]
    staging: Option<PathBuf>,
    #[command(flatten)]
    options: MigrateArgs,
}

#[derive(Debug, Args)]
struct LogArgs {
    /// Log file to read; defaults to the newest run.
    #[arg(long)]
    path: Option<PathBuf>,
}

impl MigrateArgs {
    fn options(&self) -> MigrateOptions {
        MigrateOptions { force: self.force, dry_run: self.dry_run }
    }
}

fn main() -> Result<ExitCode> {
    init_tracing();
    let cli = Cli::parse();
    let migrator = open_migrator(&cli.data_dir, cli.lock_retries)?;
    match cli.command {
        Command::Migrate(args) => emit_result(&migrator.migrate(args.options())),
        Command::MigrateAtomic(args) => emit_result(&migrator.migrate_atomic(
            &args.source,
            args.staging.as_deref(),
            args.options.options(),
        )),
        Command::Count => run_count(&migrator),
        Command::Status => run_status(&migrator),
        Command::Verify => run_verify(&migrator),
        Command::Log(args) => run_log(&migrator, &args),
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn open_migrator(data_dir: &Path, lock_retries: Option<u32>) -> Result<Migrator> {
    let mut config = MigrationConfig::load(&OsFileSystem, data_dir)
        .with_context(|| format!("failed to load config from {}", data_dir.display()))?;
    if let Some(retries) = lock_retries {
        config.lock_retries = retries;
    }
    debug!(data_dir = %data_dir.display(), "migrator configured");
    Ok(Migrator::with_config(data_dir, config))
}

fn emit_result(result: &MigrationResult) -> Result<ExitCode> {
    emit_json(serde_json::to_value(result)?)?;
    Ok(if result.success { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_count(migrator: &Migrator) -> Result<ExitCode> {
    let counts = migrator.count_source_records()?;
    emit_json(serde_json::json!({
        "source_dir": migrator.layout().source_dir,
        "counts": counts,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_status(migrator: &Migrator) -> Result<ExitCode> {
    let state = migrator.load_state()?;
    let resume = migrator.can_resume()?;
    emit_json(serde_json::json!({
        "state_file": migrator.layout().state,
        "state": state,
        "resume": resume,
    }))?;
    Ok(ExitCode::SUCCESS)
}

fn run_verify(migrator: &Migrator) -> Result<ExitCode> {
    let target = migrator.verify_target()?;
    let sources = migrator.verify_source_integrity()?;
    let sources_ok = match &sources {
        Some(report) => report.ok,
        None => true,
    };
    let healthy = target.healthy && sources_ok;
    emit_json(serde_json::json!({
        "healthy": healthy,
        "target": target,
        "sources": sources,
    }))?;
    Ok(if healthy { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

fn run_log(migrator: &Migrator, args: &LogArgs) -> Result<ExitCode> {
    let path = match &args.path {
        Some(path) => path.clone(),
        None => migrator.latest_log()?.ok_or_else(|| {
            anyhow!("no migration logs under {}", migrator.layout().logs_dir.display())
        })?,
    };
    let entries = migrator.read_log(&path)?;
    emit_json(serde_json::json!({
        "path": path,
        "entries": entries,
    }))?;
    Ok(ExitCode::SUCCESS)
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
