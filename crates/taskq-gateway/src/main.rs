use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};

use taskq_core::TaskqConfig;
use taskq_scheduler::{
    broker::log_dead_letters, wait_for_store, Backoff, ChannelBroker, EchoHandler,
    SchedulerEngine, Store, TaskRepository, WorkerPool,
};

mod app;
mod http;

/// Durable deferred-task scheduler with an HTTP front end.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to taskq.toml (falls back to TASKQ_CONFIG, then ~/.taskq/taskq.toml).
    #[arg(long, short)]
    config: Option<String>,

    /// Override server.bind.
    #[arg(long)]
    bind: Option<String>,

    /// Override server.port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "taskq_gateway=info,taskq_scheduler=info,tower_http=debug".into()
            }),
        )
        .init();

    let cli = Cli::parse();

    // load config: --config > TASKQ_CONFIG env > ~/.taskq/taskq.toml
    let config_path = cli.config.clone().or_else(|| std::env::var("TASKQ_CONFIG").ok());
    let mut config = TaskqConfig::load(config_path.as_deref()).unwrap_or_else(|e| {
        warn!(code = e.code(), "Config load failed ({}), using defaults", e);
        TaskqConfig::default()
    });
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    // the store must answer before anything else starts; fatal otherwise
    let db = config.database.clone();
    if let Err(e) = ensure_parent_dir(&db.path) {
        warn!(path = %db.path, error = %e, "could not create database directory");
    }
    wait_for_store(
        &db.path,
        Duration::from_secs(db.wait_max_secs),
        Duration::from_millis(db.wait_interval_ms),
    )
    .await?;

    // one connection per actor: API, engine, workers
    let busy = Duration::from_millis(db.busy_timeout_ms);
    let api_store = Store::open(&db.path, busy)?;
    let engine_store = Store::open(&db.path, busy)?;
    let worker_store = Store::open(&db.path, busy)?;
    info!(path = %db.path, "task store ready");

    let (broker, receivers) = ChannelBroker::new(config.workers.channel_capacity);
    let broker = Arc::new(broker);

    // in-process worker pool drains the lanes
    let pool = Arc::new(WorkerPool::new(
        TaskRepository::new(worker_store),
        Arc::new(EchoHandler),
        broker.clone(),
        Backoff::from_config(&config.scheduler),
        config.workers.concurrency,
    ));
    let _workers = pool.spawn(receivers.lanes);
    tokio::spawn(log_dead_letters(receivers.dead_letters));

    // scheduler engine loop in background
    let engine = SchedulerEngine::new(engine_store, broker, &config.scheduler);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine_task = tokio::spawn(engine.run(shutdown_rx));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port).parse()?;
    let state = Arc::new(app::AppState::new(TaskRepository::new(api_store)));
    let router = app::build_router(state);

    info!("taskq gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown signal received");
        })
        .await?;

    // signal scheduler to stop and let the current tick finish
    let _ = shutdown_tx.send(true);
    let _ = engine_task.await;
    Ok(())
}

/// Ensure the parent directory for a file path exists.
fn ensure_parent_dir(path: &str) -> std::io::Result<()> {
    match std::path::Path::new(path).parent() {
        Some(parent) if !parent.as_os_str().is_empty() => std::fs::create_dir_all(parent),
        _ => Ok(()),
    }
}
