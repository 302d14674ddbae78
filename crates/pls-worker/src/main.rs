use std::sync::Arc;

use clap::{Parser, Subcommand};
use pls_core::PlsConfig;
use pls_queue::{
    JobId, JobRecord, JobStore, NewJob, RecoveryScan, SqliteJobStore, WorkerPool,
};
use tracing::{info, warn};

mod jobs;

use jobs::FetchUrl;

#[derive(Parser, Debug)]
#[command(name = "pls-worker")]
#[command(version)]
#[command(about = "Claim and execute queued jobs from a shared SQLite store")]
struct Cli {
    /// Config file (defaults to $PLS_CONFIG, then ~/.pls/pls.toml)
    #[arg(long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Queue one fetch_url job per URL
    Enqueue {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Run a pool of workers
    Work {
        /// Number of concurrent workers (overrides [worker].workers)
        #[arg(long)]
        workers: Option<usize>,

        /// Stop after this many polling cycles instead of waiting for Ctrl-C
        #[arg(long)]
        cycles: Option<usize>,
    },

    /// List jobs that are in progress, including any stranded by a crash
    Stranded,

    /// List failed jobs
    Failed,

    /// Print one job as JSON
    Show { id: String },

    /// Queue a fixed batch of URLs and drain it with ten workers
    Demo,
}

const DEMO_WORKERS: usize = 10;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "pls_worker=info,pls_queue=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // load config: --config > PLS_CONFIG env > ~/.pls/pls.toml
    let config_path = cli.config.or_else(|| std::env::var("PLS_CONFIG").ok());
    let mut config = PlsConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!("Config load failed ({}), using defaults", e);
        PlsConfig::default()
    });

    let db_path = config.database.path.clone();
    ensure_parent_dir(&db_path);
    info!(path = %db_path, "opening SQLite database");
    let store: Arc<dyn JobStore> = Arc::new(SqliteJobStore::open(&config.database)?);

    match cli.command {
        Command::Enqueue { urls } => {
            for url in urls {
                let job = store.insert(NewJob::from_job(&FetchUrl::new(url))?)?;
                println!("{}", job.id);
            }
        }
        Command::Work { workers, cycles } => {
            if let Some(workers) = workers {
                config.worker.workers = workers;
            }
            let registry = jobs::registry();
            info!(
                workers = config.worker.workers,
                kinds = ?registry.kinds(),
                "starting worker pool"
            );
            let pool =
                WorkerPool::from_config(&config.database, &config.worker, Arc::new(registry))?;

            let report = match cycles {
                Some(n) => pool.run_cycles(n).await?,
                None => {
                    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
                    tokio::spawn(async move {
                        if tokio::signal::ctrl_c().await.is_ok() {
                            info!("Ctrl-C received, stopping workers");
                        }
                        let _ = shutdown_tx.send(true);
                    });
                    pool.run(shutdown_rx).await?
                }
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stranded => {
            print_records(&RecoveryScan::new(store).list_in_progress()?)?;
        }
        Command::Failed => {
            print_records(&RecoveryScan::new(store).list_failed()?)?;
        }
        Command::Show { id } => match store.get(&JobId::from(id.as_str()))? {
            Some(job) => println!("{}", serde_json::to_string_pretty(&job)?),
            None => anyhow::bail!("no job with id {id}"),
        },
        Command::Demo => {
            let urls = ["google.com".to_string(), "yahoo.com".to_string()]
                .into_iter()
                .chain((0..10).map(|i| format!("example-{i}.com")));
            for url in urls {
                store.insert(NewJob::from_job(&FetchUrl::new(url))?)?;
            }

            config.worker.workers = DEMO_WORKERS;
            let pool = WorkerPool::from_config(
                &config.database,
                &config.worker,
                Arc::new(jobs::registry()),
            )?;
            let report = pool.run_cycles(1).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

fn print_records(records: &[JobRecord]) -> anyhow::Result<()> {
    if records.is_empty() {
        println!("(none)");
        return Ok(());
    }
    for job in records {
        println!("{}", serde_json::to_string(job)?);
    }
    Ok(())
}

fn ensure_parent_dir(path: &str) {
    if let Some(parent) = std::path::Path::new(path).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
}
