//! Administrative commands against a PostgreSQL-backed engine.

use std::io::IsTerminal;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dynamic_table::admin::{self, CommandOutput};
use dynamic_table::scheduler::{JobQueue, RecomputeFormulas, Scheduler, WorkerPool};
use dynamic_table::{EngineConfig, FieldTypeRegistry, TableEngine};
use dynamic_table_postgres::PgPool;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "dynamic-table-admin")]
struct Args {
    /// PostgreSQL connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Invalidate the generated models cached by every process on this database.
    ClearModelCache,
    /// Count the rows of every table now.
    CountRows,
    /// Create the missing search columns of a table.
    SyncTableTsvectors {
        table_id: i64,
    },
    /// Recompute the search vectors of a table.
    UpdateTableTsvectors {
        table_id: i64,
        /// Revisit every row instead of only rows written since the last update.
        #[arg(long)]
        all: bool,
    },
    /// Run the worker pool and the timed jobs until interrupted.
    RunWorkers,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Enable ANSI colors only when stderr is a terminal and NO_COLOR is unset.
    let ansi = std::io::stderr().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .init();

    let args = Args::parse();
    let config = EngineConfig::from_env().context("invalid DYNAMIC_TABLE_* configuration")?;
    let store = PgPool::connect(&args.database_url)
        .await
        .context("failed to connect to the database")?;
    let engine = TableEngine::new(store, FieldTypeRegistry::with_builtin_types(), config);
    engine.install().await.context("failed to install the catalog")?;

    let output = match args.cmd {
        Command::ClearModelCache => admin::clear_model_cache(&engine).await?,
        Command::CountRows => admin::count_rows(&engine).await?,
        Command::SyncTableTsvectors { table_id } => {
            admin::sync_table_tsvectors(&engine, table_id).await?
        }
        Command::UpdateTableTsvectors { table_id, all } => {
            admin::update_table_tsvectors(&engine, table_id, !all).await?
        }
        Command::RunWorkers => run_workers(engine).await?,
    };

    if output.is_success() {
        println!("{}", output.message);
    } else {
        eprintln!("{}", output.message);
    }
    std::process::exit(output.exit_code);
}

async fn run_workers(engine: TableEngine<PgPool>) -> anyhow::Result<CommandOutput> {
    let (queue, receiver) = JobQueue::channel();
    let engine = engine.with_jobs(queue.clone());
    let scheduler = Scheduler::spawn(queue, engine.config());
    let pool = WorkerPool::spawn(engine.clone(), receiver, Arc::new(RecomputeFormulas));
    info!(
        workers = engine.config().worker_concurrency,
        "Workers started, press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    scheduler.abort();
    pool.abort();
    info!("Workers stopped");
    Ok(CommandOutput {
        exit_code: 0,
        message: "Workers stopped.".to_string(),
    })
}
