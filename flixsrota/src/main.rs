use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use flixsrota::api::{ApiServer, AppState};
use flixsrota::config::{AppConfig, StoreBackend};
use flixsrota::logging;
use flixsrota::queue::{JobStore, MemoryJobStore, RetentionService, SqliteJobStore};
use flixsrota::storage::LocalStorage;
use flixsrota::transcode::{Executor, FfmpegExecutor, resolve_tiers};
use flixsrota::worker::{JobProcessor, Worker, WorkerContext, WorkerPool};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser)]
#[command(name = "flixsrota", version, about = "HLS transcoding job queue")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatcher and the HTTP API (default).
    Serve,
    /// Inspect configuration.
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Print the ffmpeg command a job would run.
    Command {
        input: String,
        output: String,
        /// Comma-separated tier names; defaults to the configured set.
        #[arg(long)]
        qualities: Option<String>,
        /// Extra ffmpeg options, whitespace separated.
        #[arg(long, allow_hyphen_values = true)]
        args: Option<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Load, validate and print the effective configuration.
    Validate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = AppConfig::from_env_or_default().context("loading configuration")?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config).await,
        Command::Config {
            action: ConfigAction::Validate,
        } => {
            config.validate().context("invalid configuration")?;
            println!("{config}");
            Ok(())
        }
        Command::Command {
            input,
            output,
            qualities,
            args,
        } => {
            let resolved = match qualities {
                Some(list) => resolve_tiers(list.split(',')),
                None => resolve_tiers(&config.ffmpeg.qualities),
            };
            if !resolved.unknown.is_empty() {
                eprintln!("skipping unknown tiers: {}", resolved.unknown.join(", "));
            }
            let overrides: Vec<String> = args
                .as_deref()
                .unwrap_or_default()
                .split_whitespace()
                .map(str::to_string)
                .collect();

            let executor = FfmpegExecutor::new(config.ffmpeg.clone());
            let command = executor.builder().build(
                &config.ffmpeg.executable_path,
                &input,
                &output,
                &resolved.tiers,
                &overrides,
            );
            println!("{command}");
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> anyhow::Result<()> {
    let (log_handle, _guard) =
        logging::init_logging(&config.logging.dir).context("initializing logging")?;
    config.validate().context("invalid configuration")?;
    info!("Starting flixsrota {}", env!("CARGO_PKG_VERSION"));
    info!("{config}");

    let shutdown = CancellationToken::new();
    let log_cleanup = log_handle.start_retention_cleanup(shutdown.child_token());

    let executor = Arc::new(FfmpegExecutor::new(config.ffmpeg.clone()));
    executor
        .validate()
        .await
        .context("ffmpeg is not usable")?;

    let store: Arc<dyn JobStore> = match config.database.backend {
        StoreBackend::Sqlite => Arc::new(
            SqliteJobStore::connect(&config.database.url)
                .await
                .context("opening job store")?,
        ),
        StoreBackend::Memory => {
            warn!("Using the in-memory job store; jobs are lost on restart");
            Arc::new(MemoryJobStore::new())
        }
    };

    let storage = LocalStorage::new(&config.storage.base_path, &config.storage.temp_path)
        .await
        .context("preparing storage directories")?;

    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        executor,
        storage: Arc::new(storage),
        qualities: config.ffmpeg.qualities.clone(),
    });
    let pool = WorkerPool::new(Worker::many(config.worker.min_workers, ctx));
    let processor = JobProcessor::new(
        store.clone(),
        pool,
        config.worker.dispatch_strategy,
        config.worker.poll_interval(),
    );
    processor.start();

    let retention = config.retention.is_enabled().then(|| {
        RetentionService::new(config.retention.clone(), store.clone())
            .start_background_task(shutdown.child_token())
    });

    let state = AppState::new(store.clone())
        .with_processor(processor.clone())
        .with_log_handle(log_handle);
    let server = ApiServer::new(config.api.clone(), state);
    let server_token = server.cancel_token();

    let server_task = {
        let token = server_token.clone();
        tokio::spawn(async move {
            let result = server.run().await;
            token.cancel();
            result
        })
    };

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = server_token.cancelled() => {}
    }

    info!("Shutting down");
    server_token.cancel();
    match server_task.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server error: {}", e),
        Err(e) => error!("API server task panicked: {}", e),
    }

    processor.stop().await;
    shutdown.cancel();
    if let Some(handle) = retention {
        let _ = handle.await;
    }
    let _ = log_cleanup.await;
    store.close().await;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Shutdown signal received");
}
