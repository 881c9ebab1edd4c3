use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod api;
mod config;
mod db;
mod error;
mod inference;
mod parsing;
mod pipeline;
mod queue;
mod storage;

use crate::db::Database;
use crate::inference::HttpInferenceClient;
use crate::pipeline::{Pipeline, PipelineSettings};
use crate::queue::TaskQueue;
use crate::storage::LocalObjectStore;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    init_logging();

    info!("Starting docpipe service v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        parser = ?config.parser.kind,
        workers = config.queue.workers,
        "Configuration loaded"
    );

    // Ensure data directory exists
    std::fs::create_dir_all(&config.storage.data_dir)?;

    // Initialize database
    let db_path = config.storage.data_dir.join(&config.database.file_name);
    let db = Arc::new(Database::open(&db_path, config.database.busy_timeout())?);
    info!(path = %db_path.display(), "Database initialized");

    // Collaborators
    let store = LocalObjectStore::new(
        config.storage.objects_dir(),
        config.storage.public_base_url.clone(),
        config.storage.presign_secret.as_deref(),
    )?;
    let parser: Arc<dyn parsing::DocumentParser> = Arc::from(parsing::build_parser(&config.parser)?);
    let inference = HttpInferenceClient::new(&config.inference)?;

    let pipeline = Arc::new(Pipeline::new(
        db.clone(),
        parser,
        Arc::new(store),
        Arc::new(inference),
        PipelineSettings::from_config(&config),
    ));

    // Start the queue workers (resumes any jobs a previous run left behind)
    let queue = Arc::new(TaskQueue::new(
        db.clone(),
        pipeline.clone(),
        config.queue.clone(),
    ));
    queue.recover()?;
    let shutdown = CancellationToken::new();
    let workers = queue.start(shutdown.clone());

    let app = api::router(pipeline, config.server.max_upload_bytes);

    // Start the server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr).await?;
    info!("Listening on {}", addr);

    let signal = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown requested");
            signal.cancel();
        })
        .await?;

    // Interrupted jobs stay `running` and are requeued by the next start
    shutdown.cancel();
    for worker in workers {
        if let Err(e) = worker.await {
            warn!(error = %e, "Queue worker ended abnormally");
        }
    }
    info!("Shutdown complete");

    Ok(())
}

fn init_logging() {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    // Use RUST_LOG if set, otherwise default to info level for our crate
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("docpipe_service=info"));

    let json = std::env::var("DOCPIPE_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));

    if json {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_current_span(true))
            .with(filter)
            .init();
    } else {
        let format = fmt::format()
            .with_target(true)
            .with_thread_ids(true)
            .compact();

        tracing_subscriber::registry()
            .with(fmt::layer().event_format(format))
            .with(filter)
            .init();
    }
}
