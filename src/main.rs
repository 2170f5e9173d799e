use std::sync::Arc;

use site_assist::api::worker_routes;
use site_assist::config::AppConfig;
use site_assist::pipeline::{HttpPipeline, Pipeline, WebhookNotifier};
use site_assist::store::{LibSqlStore, Store};
use site_assist::task::TaskService;
use site_assist::worker::WorkerLoop;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = AppConfig::from_env();

    eprintln!("Site Assist v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API: http://0.0.0.0:{}/worker", config.http_port);
    eprintln!("   Pipeline: {}", config.pipeline_url);
    eprintln!(
        "   Auth: {}",
        if config.api_token.is_some() { "bearer token" } else { "disabled" }
    );

    // ── Database ─────────────────────────────────────────────────────────
    let db_path = std::path::Path::new(&config.db_path);
    let store: Arc<dyn Store> = Arc::new(LibSqlStore::new_local(db_path).await.unwrap_or_else(|e| {
        eprintln!("Error: Failed to open database at {}: {}", config.db_path, e);
        std::process::exit(1);
    }));
    eprintln!("   Database: {}", config.db_path);

    let service = Arc::new(TaskService::new(Arc::clone(&store), &config.worker));
    let pipeline: Arc<dyn Pipeline> = Arc::new(HttpPipeline::new(&config.pipeline_url));

    // ── Startup cleanup: drop sessions idle past the retention window ────
    match service
        .cleanup_old_sessions(config.worker.session_retention_days)
        .await
    {
        Ok(0) => {}
        Ok(removed) => eprintln!("   Removed {} stale sessions", removed),
        Err(e) => tracing::warn!(error = %e, "startup session cleanup failed"),
    }

    // ── Worker loop ──────────────────────────────────────────────────────
    let worker = WorkerLoop::new(
        Arc::clone(&service),
        Arc::clone(&pipeline),
        Arc::new(WebhookNotifier::new()),
        config.worker.clone(),
    );
    let _worker_handle = worker.spawn();

    // ── HTTP server ──────────────────────────────────────────────────────
    let app = worker_routes(service, pipeline, config.api_token.clone());
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    tracing::info!(port = config.http_port, "Worker API server started");
    axum::serve(listener, app).await?;

    Ok(())
}
