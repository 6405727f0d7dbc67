use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{delete, get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::access::Principal;
use crate::models::chatbots::Chatbot;
use crate::models::documents::{Document, NewDocument};
use crate::models::ingestion_jobs::{IngestionJob, IngestionStatus};
use crate::web::auth::require_principal;
use crate::web::chatbots::{owned_chatbot, owner_of};
use crate::web::error_mapping;
use crate::{ApiError, AppState};

/// Room for the filename, content type and JSON framing around the document.
const UPLOAD_ENVELOPE_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct UploadDocumentRequest {
    #[validate(length(min = 1, max = 255))]
    pub filename: String,
    #[validate(length(min = 1, max = 100))]
    pub content_type: Option<String>,
    pub content: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentResponse {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub filename: String,
    pub content_type: String,
    pub content_hash: String,
    pub byte_size: i32,
    pub created_at: DateTime<Utc>,
}

impl DocumentResponse {
    fn new(document: &Document, chatbot: &Chatbot) -> Self {
        Self {
            id: document.uuid,
            chatbot_id: chatbot.uuid,
            filename: document.filename.clone(),
            content_type: document.content_type.clone(),
            content_hash: document.content_hash.clone(),
            byte_size: document.byte_size,
            created_at: document.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionJobResponse {
    pub id: Uuid,
    pub document_id: Option<Uuid>,
    pub status: IngestionStatus,
    pub attempts: i32,
    pub max_attempts: i32,
    pub last_error: Option<String>,
    pub chunk_count: Option<i32>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl IngestionJobResponse {
    fn new(job: IngestionJob, document_id: Option<Uuid>) -> Self {
        Self {
            id: job.uuid,
            document_id,
            status: job.status,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            last_error: job.last_error,
            chunk_count: job.chunk_count,
            created_at: job.created_at,
            completed_at: job.completed_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadDocumentResponse {
    pub document: DocumentResponse,
    pub job: IngestionJobResponse,
}

/// Request body cap for uploads. JSON string escaping can grow the document, so the
/// transport limit sits above `max_document_bytes` and the handler enforces the exact size.
pub fn upload_body_limit(max_document_bytes: usize) -> usize {
    max_document_bytes
        .saturating_mul(2)
        .saturating_add(UPLOAD_ENVELOPE_BYTES)
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    let body_limit = upload_body_limit(app_state.config.max_document_bytes);
    Router::new()
        .route(
            "/v1/chatbots/:id/documents",
            post(upload_document).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/v1/documents/:id/reingest", post(reingest_document))
        .route("/v1/documents/:id", delete(delete_document))
        .route("/v1/ingestion-jobs/:id", get(get_ingestion_job))
        .layer(from_fn_with_state(app_state.clone(), require_principal))
        .with_state(app_state)
}

/// Resolves a document and its chatbot, requiring the principal to own the chatbot.
fn owned_document(
    state: &AppState,
    principal: &Principal,
    id: Uuid,
) -> Result<(Document, Chatbot), ApiError> {
    let document = state
        .db
        .get_document_by_uuid(id)?
        .ok_or(ApiError::NotFound)?;
    let chatbot = state
        .db
        .get_chatbot_by_id(document.chatbot_id)?
        .ok_or(ApiError::NotFound)?;
    let chatbot = owner_of(state, principal, chatbot)?;
    Ok((document, chatbot))
}

async fn upload_document(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    payload: Result<Json<UploadDocumentRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<UploadDocumentResponse>), ApiError> {
    let Json(body) = payload.map_err(|rejection| {
        debug!("Rejected upload body: {}", rejection.body_text());
        if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
            ApiError::PayloadTooLarge
        } else {
            ApiError::BadRequest
        }
    })?;
    body.validate().map_err(error_mapping::map_validation_error)?;
    let chatbot = owned_chatbot(&state, &principal, id)?;

    if body.content.len() > state.config.max_document_bytes {
        debug!(
            "Rejected {} byte upload to chatbot {}",
            body.content.len(),
            chatbot.uuid
        );
        return Err(ApiError::PayloadTooLarge);
    }
    if body.content.trim().is_empty() {
        return Err(ApiError::BadRequest);
    }

    let document = state.db.create_document(NewDocument::new(
        chatbot.id,
        principal.user_id,
        body.filename,
        body.content_type.unwrap_or_else(|| "text/plain".to_string()),
        body.content.into_bytes(),
    ))?;
    info!(
        "Stored document {} ({} bytes) for chatbot {}",
        document.uuid, document.byte_size, chatbot.uuid
    );

    let job = state
        .ingestion_queue
        .enqueue(document.id, chatbot.id, &principal)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(UploadDocumentResponse {
            document: DocumentResponse::new(&document, &chatbot),
            job: IngestionJobResponse::new(job, Some(document.uuid)),
        }),
    ))
}

async fn reingest_document(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<IngestionJobResponse>), ApiError> {
    let (document, chatbot) = owned_document(&state, &principal, id)?;
    let job = state
        .ingestion_queue
        .enqueue(document.id, chatbot.id, &principal)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(IngestionJobResponse::new(job, Some(document.uuid))),
    ))
}

async fn delete_document(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let (document, chatbot) = owned_document(&state, &principal, id)?;
    state.db.delete_document(document.id)?;
    state.chunk_cache.lock().await.evict_chatbot(chatbot.id);
    info!("Deleted document {} from chatbot {}", document.uuid, chatbot.uuid);
    Ok(StatusCode::NO_CONTENT)
}

/// Job status is visible to whoever requested it and to the chatbot owner.
async fn get_ingestion_job(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<IngestionJobResponse>, ApiError> {
    let job = state
        .db
        .get_ingestion_job_by_uuid(id)?
        .ok_or(ApiError::NotFound)?;

    let visible = job.requested_by == principal.user_id
        || state
            .db
            .get_chatbot_by_id(job.chatbot_id)?
            .map(|c| c.is_owned_by(principal.user_id))
            .unwrap_or(false);
    if !visible {
        return Err(ApiError::NotFound);
    }

    let document_id = state
        .db
        .get_document_by_id(job.document_id)?
        .map(|d| d.uuid);
    Ok(Json(IngestionJobResponse::new(job, document_id)))
}
