use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use migration_engine_core::{
    create_migration, init_migrations_dir, migration_slug, MigrationGraph, MigrationStatus, Plan,
    Target, VersionScheme,
};
use migration_engine_store_sqlite::{AppliedStep, RunReport, Runner, SqliteStore};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";
const USAGE_EXIT_CODE: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "dbm")]
#[command(about = "Versioned database schema migrations")]
struct Cli {
    #[arg(long, env = "DBM_DATABASE", default_value = "./app.sqlite3")]
    db: PathBuf,

    #[arg(long, env = "DBM_MIGRATIONS_DIR", default_value = "./migrations")]
    migrations_dir: PathBuf,

    #[arg(long, env = "DBM_VERSION_SCHEME", value_enum, default_value_t = SchemeArg::Sequence)]
    scheme: SchemeArg,

    /// `tracing` filter directive, e.g. `info` or `migration_engine_store_sqlite=debug`.
    #[arg(long, env = "DBM_LOG", default_value = "warn")]
    log_level: String,

    #[arg(long, env = "DBM_OUTPUT", value_enum, default_value_t = OutputFormat::Json)]
    output: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Db {
        #[command(subcommand)]
        command: Box<DbCommand>,
    },
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Create the migrations directory and the version store tables.
    Init,
    /// Write a new migration stub with the next version.
    Migrate(DbMigrateArgs),
    Upgrade(DbUpgradeArgs),
    Downgrade(DbDowngradeArgs),
    Current,
    History,
    /// Downgrade to base, then upgrade to head.
    Reset,
    /// Record a version as current without running any migration.
    Stamp(DbStampArgs),
}

impl DbCommand {
    fn operation(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Migrate(_) => "migrate",
            Self::Upgrade(_) => "upgrade",
            Self::Downgrade(_) => "downgrade",
            Self::Current => "current",
            Self::History => "history",
            Self::Reset => "reset",
            Self::Stamp(_) => "stamp",
        }
    }
}

#[derive(Debug, Args)]
struct DbMigrateArgs {
    #[arg(short = 'm', long = "message")]
    message: String,
}

#[derive(Debug, Args)]
struct DbUpgradeArgs {
    /// `head`, `base`, `+N`, `-N`, or a version.
    #[arg(long, default_value = "head")]
    target: Target,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbDowngradeArgs {
    #[arg(long, default_value = "-1", allow_hyphen_values = true)]
    target: Target,
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

#[derive(Debug, Args)]
struct DbStampArgs {
    #[arg(allow_hyphen_values = true)]
    target: Target,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum SchemeArg {
    Sequence,
    Timestamp,
}

impl From<SchemeArg> for VersionScheme {
    fn from(value: SchemeArg) -> Self {
        match value {
            SchemeArg::Sequence => Self::Sequence,
            SchemeArg::Timestamp => Self::Timestamp,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OutputFormat {
    Json,
    Text,
}

/// Invocation mistakes clap cannot catch; reported with the usage exit code.
#[derive(Debug, thiserror::Error)]
enum UsageError {
    #[error("migration message must not be blank (pass -m <text>)")]
    BlankMessage,
    #[error("migration message `{0}` has no letters or digits to name the file with")]
    UnnameableMessage(String),
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

fn emit(format: OutputFormat, value: Value, text: &str) -> Result<()> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
        }
        OutputFormat::Text => println!("{text}"),
    }
    Ok(())
}

fn init_tracing(filter: &str) {
    let env_filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(&cli.log_level);

    let Command::Db { command } = &cli.command;
    let operation = command.operation();
    debug!(operation, db = %cli.db.display(), migrations_dir = %cli.migrations_dir.display(), "starting");
    match run_db(&cli, command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {operation}: {err}");
            if err.downcast_ref::<UsageError>().is_some() {
                ExitCode::from(USAGE_EXIT_CODE)
            } else {
                ExitCode::FAILURE
            }
        }
    }
}

fn run_db(cli: &Cli, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::Init => run_db_init(cli),
        DbCommand::Migrate(args) => run_db_migrate(cli, args),
        DbCommand::Upgrade(args) => run_db_upgrade(cli, args.target, args.dry_run),
        DbCommand::Downgrade(args) => run_db_downgrade(cli, args.target, args.dry_run),
        DbCommand::Current => run_db_current(cli),
        DbCommand::History => run_db_history(cli),
        DbCommand::Reset => run_db_reset(cli),
        DbCommand::Stamp(args) => run_db_stamp(cli, args.target),
    }
}

// The graph is loaded before the database is opened so a broken
// migrations directory never touches the target database.
fn load_graph(cli: &Cli) -> Result<MigrationGraph> {
    Ok(MigrationGraph::load(&cli.migrations_dir, cli.scheme.into())?)
}

// Commands that only report must leave a missing database uncreated and an
// existing one in its journal mode.
fn open_store(cli: &Cli, read_only: bool) -> Result<SqliteStore> {
    if read_only {
        Ok(SqliteStore::open_read_only(&cli.db)?)
    } else {
        Ok(SqliteStore::open(&cli.db)?)
    }
}

fn run_db_init(cli: &Cli) -> Result<()> {
    let created_dir = init_migrations_dir(&cli.migrations_dir)?;
    let store = open_store(cli, false)?;
    let created_store = store.init()?;

    let text = format!(
        "migrations directory {} ({})\nversion store in {} ({})",
        cli.migrations_dir.display(),
        if created_dir { "created" } else { "exists" },
        cli.db.display(),
        if created_store { "created" } else { "exists" },
    );
    emit(
        cli.output,
        serde_json::json!({
            "migrations_dir": cli.migrations_dir.display().to_string(),
            "created_migrations_dir": created_dir,
            "db": cli.db.display().to_string(),
            "created_version_store": created_store
        }),
        &text,
    )
}

fn run_db_migrate(cli: &Cli, args: &DbMigrateArgs) -> Result<()> {
    if args.message.trim().is_empty() {
        return Err(UsageError::BlankMessage.into());
    }
    if migration_slug(&args.message).is_empty() {
        return Err(UsageError::UnnameableMessage(args.message.clone()).into());
    }

    let path = create_migration(
        &cli.migrations_dir,
        &args.message,
        cli.scheme.into(),
        OffsetDateTime::now_utc(),
    )?;
    emit(
        cli.output,
        serde_json::json!({
            "path": path.display().to_string(),
            "message": args.message
        }),
        &format!("created {}", path.display()),
    )
}

fn run_db_upgrade(cli: &Cli, target: Target, dry_run: bool) -> Result<()> {
    let graph = load_graph(cli)?;
    let mut store = open_store(cli, dry_run)?;
    let mut runner = Runner::new(&mut store, &graph);

    if dry_run {
        return emit_plan(cli.output, &runner.plan(target)?);
    }
    let report = runner.upgrade(target)?;
    emit_report(cli.output, &report)
}

fn run_db_downgrade(cli: &Cli, target: Target, dry_run: bool) -> Result<()> {
    let graph = load_graph(cli)?;
    let mut store = open_store(cli, dry_run)?;
    let mut runner = Runner::new(&mut store, &graph);

    if dry_run {
        return emit_plan(cli.output, &runner.plan(target)?);
    }
    let report = runner.downgrade(target)?;
    emit_report(cli.output, &report)
}

fn run_db_current(cli: &Cli) -> Result<()> {
    let store = open_store(cli, true)?;
    let current = store.read_current()?;
    emit(cli.output, serde_json::json!({ "current": current }), &current.to_string())
}

fn run_db_history(cli: &Cli) -> Result<()> {
    let graph = load_graph(cli)?;
    let mut store = open_store(cli, true)?;
    let runner = Runner::new(&mut store, &graph);
    let current = runner.current()?;
    let entries = runner.history()?;

    let mut lines = Vec::with_capacity(entries.len() + 1);
    lines.push(format!("current: {current}"));
    let migrations = entries
        .iter()
        .map(|entry| {
            let migration = entry.migration;
            lines.push(format!(
                "[{}] {} {}{}",
                if entry.status == MigrationStatus::Applied { "x" } else { " " },
                migration.version,
                migration.label,
                if entry.is_current { " (current)" } else { "" },
            ));
            serde_json::json!({
                "version": migration.version,
                "label": migration.label,
                "status": entry.status,
                "current": entry.is_current,
                "reversible": migration.is_reversible()
            })
        })
        .collect::<Vec<_>>();

    emit(
        cli.output,
        serde_json::json!({
            "current": current,
            "migrations": migrations
        }),
        &lines.join("\n"),
    )
}

fn run_db_reset(cli: &Cli) -> Result<()> {
    let graph = load_graph(cli)?;
    let mut store = open_store(cli, false)?;
    let report = Runner::new(&mut store, &graph).reset()?;

    let text = format!(
        "downgrade phase:\n{}\nupgrade phase:\n{}",
        render_report(&report.downgrade),
        render_report(&report.upgrade)
    );
    emit(cli.output, serde_json::to_value(&report)?, &text)
}

fn run_db_stamp(cli: &Cli, target: Target) -> Result<()> {
    let graph = load_graph(cli)?;
    let mut store = open_store(cli, false)?;
    let report = Runner::new(&mut store, &graph).stamp(target)?;

    emit(
        cli.output,
        serde_json::json!({
            "from": report.from,
            "to": report.to
        }),
        &format!("stamped {} (was {})", report.to, report.from),
    )
}

fn emit_plan(format: OutputFormat, plan: &Plan<'_>) -> Result<()> {
    let steps = plan.steps.iter().map(AppliedStep::from).collect::<Vec<_>>();
    let text = if steps.is_empty() {
        format!("already at {}; nothing to run", plan.to)
    } else {
        steps.iter().map(render_step).collect::<Vec<_>>().join("\n")
    };
    emit(
        format,
        serde_json::json!({
            "dry_run": true,
            "from": plan.from,
            "to": plan.to,
            "steps": steps
        }),
        &text,
    )
}

fn emit_report(format: OutputFormat, report: &RunReport) -> Result<()> {
    emit(
        format,
        serde_json::json!({
            "dry_run": false,
            "from": report.from,
            "to": report.to,
            "applied": report.steps
        }),
        &render_report(report),
    )
}

fn render_report(report: &RunReport) -> String {
    if report.steps.is_empty() {
        return format!("already at {}; nothing to run", report.to);
    }
    report.steps.iter().map(render_step).collect::<Vec<_>>().join("\n")
}

fn render_step(step: &AppliedStep) -> String {
    format!("{:<4} {} {} -> {}", step.direction.as_str(), step.version, step.label, step.resulting)
}
