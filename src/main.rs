use axum::{http::StatusCode, response::IntoResponse, Json};
use dotenv::dotenv;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod access;
mod config;
mod db;
mod ingest;
mod jwt;
mod models;
mod rag;
mod tokens;
mod web;

use config::Config;
use db::{setup_db, DBError, SharedDb};
use ingest::embedding::{HttpEmbedder, SharedEmbedder};
use ingest::{spawn_workers, IngestionPipeline, IngestionQueue, SegmentRetry, WorkerSettings};
use rag::{ChunkCache, SharedChunkCache};

pub use config::AppMode;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Invalid JWT")]
    InvalidJwt,

    #[error("Bad Request")]
    BadRequest,

    #[error("Only the chatbot owner can do this")]
    Forbidden,

    #[error("Resource not found")]
    NotFound,

    #[error("Document is too large")]
    PayloadTooLarge,

    #[error("Embedding service unavailable")]
    ServiceUnavailable,

    #[error("Internal server error")]
    InternalServerError,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub status: u16,
    pub message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = match self {
            ApiError::InvalidJwt => StatusCode::UNAUTHORIZED,
            ApiError::BadRequest => StatusCode::BAD_REQUEST,
            ApiError::Forbidden => StatusCode::FORBIDDEN,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::ServiceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                status: status.as_u16(),
                message: self.to_string(),
            }),
        )
            .into_response()
    }
}

impl From<DBError> for ApiError {
    fn from(err: DBError) -> Self {
        web::error_mapping::map_db_error(err)
    }
}

pub struct AppState {
    pub config: Config,
    pub db: SharedDb,
    pub embedder: SharedEmbedder,
    pub chunk_cache: SharedChunkCache,
    pub ingestion_queue: IngestionQueue,
}

impl AppState {
    pub fn new(config: Config, db: SharedDb, embedder: SharedEmbedder) -> Self {
        let ingestion_queue = IngestionQueue::new(db.clone(), config.ingest_max_attempts);
        Self {
            config,
            db,
            embedder,
            chunk_cache: Arc::new(Mutex::new(ChunkCache::default())),
            ingestion_queue,
        }
    }

    pub fn ingestion_pipeline(&self, segment_retry: SegmentRetry) -> IngestionPipeline {
        IngestionPipeline::new(
            self.db.clone(),
            self.embedder.clone(),
            self.chunk_cache.clone(),
            self.config.chunk_max_tokens,
            segment_retry,
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().map_err(|e| {
        error!("Invalid configuration: {}", e);
        e
    })?;
    info!("Starting docchat in {:?} mode: {:?}", config.app_mode, config);

    let db = setup_db(&config.database_url)?;
    let embedder: SharedEmbedder = Arc::new(HttpEmbedder::new(
        &config.embedding_api_base,
        config.embedding_api_key.clone(),
        config.embedding_model.clone(),
        config.embedding_dim,
    )?);

    let state = Arc::new(AppState::new(config.clone(), db.clone(), embedder));

    let workers = spawn_workers(
        db,
        state.ingestion_pipeline(SegmentRetry::default()),
        state.ingestion_queue.clone(),
        WorkerSettings {
            workers: config.ingest_workers,
            poll_interval: config.ingest_poll_interval,
            stale_after: config.ingest_stale_after,
        },
    );
    info!("Spawned {} ingestion workers", config.ingest_workers);

    let app = web::router(state);
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening on http://{}", addr);

    let served = axum::serve(listener, app).await;
    for worker in workers {
        worker.abort();
    }
    served?;
    Ok(())
}
