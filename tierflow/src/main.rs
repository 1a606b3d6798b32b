use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::info;

use tierflow::config::AppConfig;
use tierflow::database;
use tierflow::domain::{FileReference, SizeClassifier, SizeTier};
use tierflow::logging;
use tierflow::platform::LocalProcessPlatform;
use tierflow::queue::{MessageQueue, SqliteQueue};
use tierflow::scheduler::{LocalRunScheduler, RunStore};
use tierflow::sensor::{QueueDispatcher, SensorService, parse_notification};
use tierflow::supervisor::TaskSupervisor;

#[derive(Parser, Debug)]
#[command(
    name = "tierflow",
    version,
    about = "Dispatch file-arrival events onto size-tiered remote tasks"
)]
struct Args {
    /// JSON configuration file
    #[arg(short, long, env = "TIERFLOW_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the sensor loop and the local scheduler until interrupted
    Run,

    /// Launch one task, supervise it, and print the outcome as JSON
    Supervise {
        #[arg(long)]
        bucket: String,

        #[arg(long)]
        key: String,

        /// Object size in bytes
        #[arg(long)]
        size: u64,

        #[arg(long, default_value = "manual")]
        fingerprint: String,

        /// Force a tier instead of classifying by size
        #[arg(long)]
        tier: Option<SizeTier>,

        #[arg(long)]
        correlation_id: Option<String>,
    },

    /// Push a notification body into the durable queue
    Enqueue {
        /// File holding the body; stdin when omitted
        body_file: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    match run(args).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("Application error: {:#}", e);
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> anyhow::Result<ExitCode> {
    let config =
        AppConfig::load(args.config.as_deref()).context("failed to load configuration")?;
    let _guard = logging::init(&config.logging)?;

    match args.command {
        Commands::Run => {
            run_service(config).await?;
            Ok(ExitCode::SUCCESS)
        }
        Commands::Supervise {
            bucket,
            key,
            size,
            fingerprint,
            tier,
            correlation_id,
        } => {
            let file = FileReference::new(bucket, key, size, fingerprint);
            supervise_one(config, file, tier, correlation_id).await
        }
        Commands::Enqueue { body_file } => {
            enqueue(config, body_file).await?;
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_service(config: AppConfig) -> anyhow::Result<()> {
    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;

    let queue = Arc::new(SqliteQueue::new(
        pool.clone(),
        config.queue.visibility_timeout(),
    ));
    let platform = Arc::new(LocalProcessPlatform::new(config.platform.clone()));
    let supervisor = Arc::new(TaskSupervisor::new(
        platform,
        config.supervisor.clone(),
        config.routing,
    ));
    let scheduler = Arc::new(LocalRunScheduler::with_store(
        supervisor,
        RunStore::new(pool.clone()),
        config.scheduler.clone(),
    ));
    scheduler.recover_runs().await?;
    let dispatcher = Arc::new(QueueDispatcher::new(
        queue,
        scheduler.clone(),
        SizeClassifier::new(config.tiers),
        config.routing,
        config.dispatcher.clone(),
    ));
    let sensor = Arc::new(SensorService::new(dispatcher, &config.sensor));

    let sensor_handle = sensor.clone().start();
    info!("tierflow started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");

    sensor.stop();
    sensor_handle.await?;
    scheduler.shutdown().await;
    pool.close().await;

    info!("tierflow stopped");
    Ok(())
}

async fn supervise_one(
    config: AppConfig,
    file: FileReference,
    tier: Option<SizeTier>,
    correlation_id: Option<String>,
) -> anyhow::Result<ExitCode> {
    let tier = SizeClassifier::new(config.tiers).resolve(file.size_bytes, tier);
    let correlation_id =
        correlation_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let platform = Arc::new(LocalProcessPlatform::new(config.platform.clone()));
    let supervisor = TaskSupervisor::new(platform, config.supervisor.clone(), config.routing);

    let outcome = supervisor.run(file, tier, &correlation_id).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);

    Ok(if outcome.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn enqueue(config: AppConfig, body_file: Option<PathBuf>) -> anyhow::Result<()> {
    let body = match body_file {
        Some(path) => tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?,
        None => {
            let mut body = String::new();
            tokio::io::stdin().read_to_string(&mut body).await?;
            body
        }
    };

    if let Err(e) = parse_notification(&body) {
        tracing::warn!(error = %e, "Body is not a recognized notification; enqueuing anyway");
    }

    let pool = database::init_pool(&config.database_url).await?;
    database::run_migrations(&pool).await?;
    let queue = SqliteQueue::new(pool.clone(), config.queue.visibility_timeout());
    let id = queue.send(&body).await?;
    pool.close().await;

    println!("{id}");
    Ok(())
}
