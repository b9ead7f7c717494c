mod config;
mod engine;
mod evaluator;
mod executor;
mod health;
mod languages;
mod limiter;
mod metrics;
mod pool;
mod sandbox;


use anyhow::Context;
use arbiter_common::challenge::ChallengeCatalog;
use arbiter_common::redis::RedisStore;
use arbiter_common::store::SubmissionStore;
use config::{LanguageConfigManager, WorkerSettings};
use engine::{EngineSettings, SandboxEngine};
use executor::Judge;
use limiter::ExecutionLimiter;
use pool::{PoolConfig, WorkerPool};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Claim ids are `{prefix}-{n}`, so the prefix must never repeat across
/// processes, including two workers sharing a hostname.
fn worker_prefix() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
    format!("{}-{}-{}", host, std::process::id(), &Uuid::new_v4().simple().to_string()[..8])
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Arbiter Worker booting...");

    let settings = WorkerSettings::from_env()?;

    let languages = LanguageConfigManager::load(&settings.common.languages_file).map_err(|e| {
        error!("Failed to load language configurations: {}", e);
        error!("Make sure {} exists", settings.common.languages_file.display());
        e
    })?;
    info!("Loaded language configurations for: {:?}", languages.list_languages());

    let catalog = ChallengeCatalog::load_dir(&settings.common.challenges_dir)
        .with_context(|| format!("Failed to load challenges from {}", settings.common.challenges_dir.display()))?;
    info!(challenges = catalog.len(), "Loaded challenge catalog");

    // Connect to Redis
    let client = ::redis::Client::open(settings.common.redis_url.as_str())?;
    let redis_conn = ::redis::aio::ConnectionManager::new(client).await?;
    info!("Connected to Redis: {}", settings.common.redis_url);
    let store: Arc<dyn SubmissionStore> = Arc::new(RedisStore::new(redis_conn));

    let limiter = ExecutionLimiter::new(settings.max_concurrent_executions);
    let engine = Arc::new(SandboxEngine::new(
        Arc::new(languages),
        limiter,
        EngineSettings::from_worker(&settings),
    )?);
    info!(
        workspace = %settings.workspace_root.display(),
        isolate_network = settings.isolate_network,
        isolate_filesystem = settings.isolate_filesystem,
        sandbox_uid = ?settings.sandbox_uid,
        max_concurrent_executions = settings.max_concurrent_executions,
        "Sandbox engine ready"
    );
    engine.verify_isolation().await.context(
        "Sandbox isolation is unavailable on this host; it needs mount and network namespaces \
         (ARBITER_ISOLATE_FILESYSTEM / ARBITER_ISOLATE_NETWORK)",
    )?;

    let judge = Arc::new(Judge::new(engine.clone(), Arc::new(catalog), store.clone()));
    let pool = WorkerPool::new(
        store,
        judge,
        PoolConfig {
            worker_prefix: worker_prefix(),
            worker_count: settings.worker_count,
            poll_interval: settings.poll_interval,
            submission_budget: settings.submission_budget,
            sweep_interval: settings.sweep_interval,
            stale_after: settings.common.stale_after,
            max_retries: settings.common.max_retries,
        },
    );
    info!(workers = ?pool.worker_ids(), "Worker pool configured");

    let health_state = Arc::new(health::HealthState {
        worker_ids: pool.worker_ids(),
        limiter: engine.limiter().clone(),
    });
    let listener = TcpListener::bind(settings.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", settings.http_addr))?;
    info!("Health server listening on {}", settings.http_addr);
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, health::routes(health_state)).await {
            error!(error = %e, "Health server stopped");
        }
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let pool_task = tokio::spawn(pool.run(shutdown_rx));

    // Setup graceful shutdown
    signal::ctrl_c().await.context("failed to install CTRL+C signal handler")?;
    warn!("Received shutdown signal, finishing in-flight submissions...");
    let _ = shutdown_tx.send(true);

    if let Err(e) = pool_task.await {
        error!(error = %e, "Worker pool panicked");
    }
    info!("Worker shutdown complete");
    Ok(())
}
