use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::Colorize;
use queuectl_core::jobs::{dead_letter, supervisor};
use queuectl_core::{create_pool, schema, EngineConfig, EnqueueRequest, Error, JobState, Store, Supervisor};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "queuectl", about = "A CLI for managing background jobs.")]
struct Cli {
    /// Path to the SQLite database file.
    #[arg(long, env = "QUEUECTL_DB", global = true, default_value = "queue.db")]
    db: PathBuf,

    /// Directory job stdout/stderr logs are written to.
    #[arg(long, env = "QUEUECTL_LOG_DIR", global = true, default_value = "logs")]
    log_dir: PathBuf,

    /// Path to the Supervisor's PID file.
    #[arg(long, env = "QUEUECTL_PID_FILE", global = true, default_value = "queuectl.pid")]
    pid_file: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Initializes the queue database and tables.
    Init,

    /// Show a summary of all job states and worker status.
    Status,

    /// Manage system configuration (max_retries, backoff_base).
    #[command(subcommand)]
    Config(ConfigCommand),

    /// Add a new job to the queue.
    ///
    /// Example: queuectl enqueue '{"id":"job1","command":"sleep 2"}'
    Enqueue {
        /// A JSON object: {"id", "command", "max_retries"?, "run_at"?, "priority"?, "timeout"?}
        job_json: String,
    },

    /// List jobs by their state.
    #[command(name = "list")]
    ListJobs {
        #[arg(long, default_value = "pending")]
        state: String,
    },

    /// Show the stdout or stderr logs for a job.
    Logs {
        job_id: String,
        #[arg(long, group = "log_stream")]
        stdout: bool,
        #[arg(long, group = "log_stream")]
        stderr: bool,
    },

    /// Manage the Dead Letter Queue (DLQ).
    #[command(subcommand)]
    Dlq(DlqCommand),

    /// Manage worker processes.
    #[command(subcommand)]
    Worker(WorkerCommand),
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Set a configuration value (max_retries or backoff_base).
    Set { key: String, value: String },
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List all jobs in the Dead Letter Queue (state=dead).
    List,
    /// Move a specific job from the DLQ back to 'pending'.
    Retry { job_id: String },
}

#[derive(Subcommand)]
enum WorkerCommand {
    /// Start one or more worker loops in the foreground.
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Signal the running Supervisor to shut down gracefully.
    Stop,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let engine_config = EngineConfig::new(cli.db.clone(), cli.log_dir.clone(), cli.pid_file.clone());

    let code = run(cli.command, engine_config).await;
    std::process::exit(code);
}

async fn run(command: Command, config: EngineConfig) -> i32 {
    match command {
        Command::Init => match init(&config).await {
            Ok(()) => {
                println!("Database initialized successfully.");
                0
            }
            Err(e) => report(e),
        },
        other => match with_store(&config, other).await {
            Ok(()) => 0,
            Err(e) => report(e),
        },
    }
}

fn report(e: Error) -> i32 {
    eprintln!("{} {}", "Error:".red().bold(), e);
    e.exit_code()
}

async fn init(config: &EngineConfig) -> queuectl_core::Result<()> {
    let pool = create_pool(&config.database_url()).await?;
    schema::init(&pool).await
}

async fn with_store(config: &EngineConfig, command: Command) -> queuectl_core::Result<()> {
    if !config.db_path.exists() {
        return Err(Error::fatal(format!(
            "Database file '{}' not found. Please run 'queuectl init' first.",
            config.db_path.display()
        )));
    }
    let pool = create_pool(&config.database_url()).await?;
    let store = Arc::new(Store::new(pool));

    match command {
        Command::Init => unreachable!("handled in run()"),
        Command::Status => status(&store, &config.pid_file).await,
        Command::Config(ConfigCommand::Set { key, value }) => {
            store.set_config(&key, &value).await?;
            println!("Config set: {} = {}", key, value);
            Ok(())
        }
        Command::Enqueue { job_json } => enqueue(&store, &job_json).await,
        Command::ListJobs { state } => list_jobs(&store, &state).await,
        Command::Logs { job_id, stdout: _, stderr } => logs(config, &job_id, stderr).await,
        Command::Dlq(DlqCommand::List) => dlq_list(&store).await,
        Command::Dlq(DlqCommand::Retry { job_id }) => dlq_retry(&store, &job_id).await,
        Command::Worker(WorkerCommand::Start { count }) => worker_start(store, config, count).await,
        Command::Worker(WorkerCommand::Stop) => supervisor::stop(&config.pid_file),
    }
}

async fn status(store: &Store, pid_file: &std::path::Path) -> queuectl_core::Result<()> {
    println!("--- Job Status ---");
    let summary = store.summary().await?;
    if summary.is_empty() {
        println!("No jobs in the queue.");
    } else {
        let mut total = 0i64;
        for (state, count) in &summary {
            println!("- {:<12}: {}", capitalize(state), count);
            total += count;
        }
        println!("- {:<12}: {}", "Total", total);
    }

    println!("\n--- Worker Status ---");
    if pid_file.exists() {
        match std::fs::read_to_string(pid_file) {
            Ok(contents) if !contents.trim().is_empty() => {
                println!("Active: worker fleet running (PID: {})", contents.trim());
            }
            Ok(_) => println!("Inactive: PID file is empty."),
            Err(e) => println!("Error reading PID file: {}", e),
        }
    } else {
        println!("Inactive: No PID file found.");
    }
    Ok(())
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

async fn enqueue(store: &Store, job_json: &str) -> queuectl_core::Result<()> {
    let req: EnqueueRequest =
        serde_json::from_str(job_json).map_err(|e| Error::bad_input(format!("invalid JSON: {}", e)))?;
    store.enqueue(&req.id, &req.command, req.opts).await?;
    println!("Enqueued job '{}'.", req.id);
    Ok(())
}

async fn list_jobs(store: &Store, state: &str) -> queuectl_core::Result<()> {
    let state = JobState::from_str(state)
        .ok_or_else(|| Error::bad_input(format!("unknown state '{}'. Allowed: pending, scheduled, processing, failed, completed, dead", state)))?;
    let jobs = store.get_by_state(state).await?;
    if jobs.is_empty() {
        println!("No jobs found with state: {}", state);
        return Ok(());
    }
    println!("--- Jobs ({}) ---", state);
    for job in jobs {
        println!("ID: {}", job.id);
        println!("  Command:   {}", job.command);
        println!("  State:     {}", job.state);
        println!("  Attempts:  {}/{}", job.attempts, job.max_retries);
        if let Some(run_at) = job.run_at {
            println!("  Next Run:  {}", run_at);
        }
        println!("  Created:   {}", job.created_at);
        println!("{}", "-".repeat(20));
    }
    Ok(())
}

async fn logs(config: &EngineConfig, job_id: &str, stderr: bool) -> queuectl_core::Result<()> {
    let suffix = if stderr { "err.log" } else { "out.log" };
    let path = config.log_dir.join(format!("{}.{}", job_id, suffix));
    let contents = std::fs::read_to_string(&path)
        .map_err(|_| Error::not_found(format!("log file not found: {}", path.display())))?;
    print!("{}", contents);
    Ok(())
}

async fn dlq_list(store: &Store) -> queuectl_core::Result<()> {
    let jobs = dead_letter::list(store).await?;
    if jobs.is_empty() {
        println!("Dead Letter Queue is empty.");
        return Ok(());
    }
    println!("--- Dead Letter Queue Jobs ---");
    for job in jobs {
        println!("ID: {}", job.id);
        println!("  Command:   {}", job.command);
        println!("  Attempts:  {}/{}", job.attempts, job.max_retries);
        println!("  Failed At: {}", job.updated_at);
        println!("{}", "-".repeat(20));
    }
    Ok(())
}

async fn dlq_retry(store: &Store, job_id: &str) -> queuectl_core::Result<()> {
    dead_letter::retry(store, job_id).await?;
    println!("Job '{}' moved back to pending.", job_id);
    Ok(())
}

async fn worker_start(store: Arc<Store>, config: &EngineConfig, count: usize) -> queuectl_core::Result<()> {
    println!("Starting {} worker(s) in the foreground. Press Ctrl+C to shut down.", count);
    let supervisor = Supervisor::new(store, config.log_dir.clone(), config.pid_file.clone());
    supervisor.run(count).await
}
