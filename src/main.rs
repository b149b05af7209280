use clap::{Parser, ValueEnum};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_stream::StreamExt;
use tracing_subscriber::EnvFilter;

use wrasse::config::DaemonConfig;
use wrasse::daemon::{Daemon, Services};
use wrasse::directory::{JobDirectory, JobFilter, SqliteDirectory};
use wrasse::identity::StaticIdentity;
use wrasse::shutdown::install_shutdown_handler;
use wrasse::store::LocalObjectStore;

#[derive(Parser, Debug)]
#[command(name = "wrasse")]
#[command(version)]
#[command(about = "Archives finished jobs to durable storage and purges them after a retention window")]
#[command(propagate_version = true)]
struct Args {
    /// Path to a JSON configuration file
    #[arg(long, short = 'f', global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run the archiver daemon
    Run(RunArgs),

    /// List jobs in the job directory with their claim state
    Jobs {
        /// Only list jobs owned by this account uuid
        #[arg(long)]
        owner: Option<String>,

        /// Only list archived (true) or unarchived (false) jobs
        #[arg(long)]
        archived: Option<bool>,

        /// Output format
        #[arg(long, short = 'o', default_value = "table")]
        output: OutputFormat,
    },
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Identity written into claims (defaults to the hostname)
    #[arg(long)]
    identity: Option<String>,

    /// Only archive jobs owned by this account uuid
    #[arg(long)]
    job_owner: Option<String>,

    /// Port for the status endpoint (optional)
    #[arg(long)]
    status_port: Option<u16>,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct JobListItem {
    job_id: String,
    owner: String,
    state: String,
    wrasse: Option<String>,
    claim_version: u64,
    time_archive_started: Option<String>,
    time_archive_done: Option<String>,
}

fn init_logging(config: &DaemonConfig, verbose: u8) {
    let default_level = match verbose {
        0 => config.log_level.clone().unwrap_or_else(|| "info".to_string()),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();
}

fn load_config(path: Option<&PathBuf>) -> Result<DaemonConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => Ok(DaemonConfig::load(path)?),
        None => Ok(DaemonConfig::default()),
    }
}

fn open_directory(config: &DaemonConfig) -> Result<SqliteDirectory, Box<dyn std::error::Error>> {
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    Ok(SqliteDirectory::open(&config.database_path)?)
}

async fn run_daemon(
    mut config: DaemonConfig,
    args: RunArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    if let Some(identity) = args.identity {
        config.identity = identity;
    }
    if let Some(owner) = args.job_owner {
        config.job_owner = Some(owner);
    }
    if let Some(port) = args.status_port {
        let addr: SocketAddr = format!("0.0.0.0:{}", port).parse()?;
        config.status_addr = Some(addr);
    }
    config.validate()?;

    std::fs::create_dir_all(&config.scratch_dir)?;
    std::fs::create_dir_all(&config.store_root)?;
    let directory = Arc::new(open_directory(&config)?);

    let services = Services {
        directory: directory.clone(),
        claims: directory,
        store: Arc::new(LocalObjectStore::new(config.store_root.clone())),
        identity: Arc::new(StaticIdentity::new(config.accounts.clone())),
    };

    let shutdown = install_shutdown_handler()?;
    let daemon = Daemon::new(config, services);
    daemon.run(shutdown).await?;
    Ok(())
}

async fn list_jobs(
    config: &DaemonConfig,
    owner: Option<String>,
    archived: Option<bool>,
    output: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let directory = open_directory(config)?;
    let mut filter = JobFilter::default().owner(owner.as_deref());
    if let Some(archived) = archived {
        filter = filter.archived(archived);
    }

    let mut jobs = directory.list_jobs(&filter).await?;
    let mut items = Vec::new();
    while let Some(job) = jobs.next().await {
        let job = job?;
        items.push(JobListItem {
            job_id: job.job_id,
            owner: job.owner,
            state: job.state.to_string(),
            wrasse: job.wrasse,
            claim_version: job.claim_version,
            time_archive_started: job.time_archive_started.map(|t| t.to_rfc3339()),
            time_archive_done: job.time_archive_done.map(|t| t.to_rfc3339()),
        });
    }

    match output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&items)?),
        OutputFormat::Table => {
            if items.is_empty() {
                println!("No jobs found.");
                return Ok(());
            }
            println!(
                "{:<38} {:<10} {:<24} {:<8} ARCHIVED",
                "JOB ID", "STATE", "CLAIMED BY", "VERSION"
            );
            println!("{}", "-".repeat(100));
            for item in &items {
                println!(
                    "{:<38} {:<10} {:<24} {:<8} {}",
                    item.job_id,
                    item.state,
                    item.wrasse.as_deref().unwrap_or("-"),
                    item.claim_version,
                    item.time_archive_done.as_deref().unwrap_or("-")
                );
            }
            println!();
            println!("{} jobs", items.len());
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(args.config.as_ref())?;
    init_logging(&config, args.verbose);

    match args.command {
        Commands::Run(run_args) => run_daemon(config, run_args).await?,
        Commands::Jobs {
            owner,
            archived,
            output,
        } => list_jobs(&config, owner, archived, &output).await?,
    }

    Ok(())
}
