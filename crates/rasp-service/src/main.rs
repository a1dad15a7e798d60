use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use rasp_core::{CompletionConfig, EmbeddingConfig, PipelineConfig, VectorStoreConfig};
use rasp_ledger::SqliteBalanceLedger;
use rasp_orchestrator::StreamOrchestrator;
use rasp_providers::{HttpCompletionClient, HttpEmbeddingClient, HttpVectorStoreClient};
use rasp_store::SqliteChatStore;
use rusqlite::Connection;
use tower_http::cors::CorsLayer;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod handlers;
mod sse;

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Address to bind the service to.
    #[arg(long, default_value = "0.0.0.0:8080")]
    addr: String,
    /// Path to the SQLite database file backing the ledger and chat store.
    #[arg(long, default_value = "rasp.sqlite3")]
    db_path: PathBuf,
    /// Optional .env-style file to load before reading the environment.
    #[arg(long)]
    config: Option<PathBuf>,
}

/// Shared per-handler state, cloned into every request (mirrors the
/// teacher's `ServerState { registry: Arc<...> }`).
#[derive(Clone)]
pub struct ServiceState {
    pub orchestrator: Arc<StreamOrchestrator>,
    pub vector_store: Arc<dyn rasp_providers::VectorStoreClient>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if let Some(path) = &args.config {
        dotenvy::from_path(path)?;
    }

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("rasp_service=info,tower_http=info"));
    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let embedding_config = EmbeddingConfig::from_env()?;
    let completion_config = CompletionConfig::from_env()?;
    let vector_store_config = VectorStoreConfig::from_env()?;
    let pipeline_config = PipelineConfig::from_env()?;
    let top_k = vector_store_config.top_k;

    info!(addr = %args.addr, db_path = %args.db_path.display(), "starting service");

    let conn = Connection::open(&args.db_path)?;
    let conn = Arc::new(std::sync::Mutex::new(conn));

    let ledger = Arc::new(SqliteBalanceLedger::new(conn.clone())?);
    let store = Arc::new(SqliteChatStore::new(conn)?);

    let embedding = Arc::new(HttpEmbeddingClient::new(
        embedding_config,
        pipeline_config.max_retries,
        pipeline_config.retry_delay,
    ));
    let vector_store = Arc::new(HttpVectorStoreClient::new(
        vector_store_config,
        pipeline_config.max_retries,
        pipeline_config.retry_delay,
    ));
    let completion = Arc::new(HttpCompletionClient::new(completion_config));

    let orchestrator = Arc::new(StreamOrchestrator::new(
        embedding,
        vector_store.clone(),
        completion,
        ledger,
        store,
        pipeline_config,
        top_k,
    ));

    let state = ServiceState { orchestrator, vector_store };

    let protected = Router::new()
        .route("/api/chats/{id}/stream", get(handlers::stream_chat))
        .route_layer(axum::middleware::from_fn(handlers::require_user_id));

    let app = Router::new()
        .merge(protected)
        .route("/healthz", get(handlers::healthz))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&args.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
