mod handlers;
mod language_config;
mod metrics;
mod routes;

use anyhow::Context;
use arbiter_common::challenge::ChallengeCatalog;
use arbiter_common::config::{env_or, SubmissionLimits, Settings};
use arbiter_common::redis::RedisStore;
use arbiter_common::store::{QueuePolicy, SubmissionStore};
use axum::Router;
use language_config::LanguageRegistry;
use redis::aio::ConnectionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::info;

pub struct AppState {
    pub store: Arc<dyn SubmissionStore>,
    pub catalog: Arc<ChallengeCatalog>,
    pub languages: Arc<LanguageRegistry>,
    pub limits: SubmissionLimits,
    pub policy: QueuePolicy,
    pub worker_liveness: Duration,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    if std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    info!("Arbiter API booting...");

    let settings = Settings::from_env()?;

    let languages = LanguageRegistry::load_from_file(&settings.languages_file)
        .with_context(|| format!("Failed to load {}", settings.languages_file.display()))?;
    info!("Enabled languages: {:?}", languages.enabled_languages());

    let catalog = ChallengeCatalog::load_dir(&settings.challenges_dir)
        .with_context(|| format!("Failed to load challenges from {}", settings.challenges_dir.display()))?;
    info!(challenges = catalog.len(), "Loaded challenge catalog");

    // Connect to Redis
    let client = redis::Client::open(settings.redis_url.as_str()).context("Failed to create Redis client")?;
    let redis_conn = ConnectionManager::new(client).await.context("Failed to connect to Redis")?;
    info!("Connected to Redis: {}", settings.redis_url);

    let state = Arc::new(AppState {
        store: Arc::new(RedisStore::new(redis_conn)),
        catalog: Arc::new(catalog),
        languages: Arc::new(languages),
        limits: settings.limits.clone(),
        policy: settings.queue_policy,
        worker_liveness: settings.worker_liveness,
    });
    info!(policy = ?settings.queue_policy, "Queue policy");

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr: String = env_or("ARBITER_API_ADDR", "0.0.0.0:3000".to_string())?;
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept submissions");

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
