use axum::{
    extract::{Path, Query, State},
    middleware::from_fn_with_state,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;
use validator::Validate;

use crate::access::{ChunkAccessGate, Principal};
use crate::models::document_chunks::DocumentChunk;
use crate::rag::{search_chunks, ChunkSearchResult, MAX_TOP_K};
use crate::web::auth::require_principal;
use crate::web::chatbots::readable_chatbot;
use crate::web::error_mapping;
use crate::{ApiError, AppState};

const DEFAULT_PAGE_SIZE: i64 = 50;
const MAX_PAGE_SIZE: i64 = 200;
const DEFAULT_TOP_K: usize = 5;

#[derive(Debug, Clone, Deserialize)]
pub struct ListChunksParams {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkResponse {
    pub id: Uuid,
    pub chatbot_id: Uuid,
    pub chunk_index: i32,
    pub content: String,
    pub token_count: i32,
    pub embedding_model: String,
    pub created_at: DateTime<Utc>,
}

impl ChunkResponse {
    fn new(chunk: DocumentChunk, chatbot_uuid: Uuid) -> Self {
        Self {
            id: chunk.uuid,
            chatbot_id: chatbot_uuid,
            chunk_index: chunk.chunk_index,
            content: chunk.content,
            token_count: chunk.token_count,
            embedding_model: chunk.embedding_model,
            created_at: chunk.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkListResponse {
    pub chunks: Vec<ChunkResponse>,
    pub limit: i64,
    pub offset: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct SearchChunksRequest {
    #[validate(length(min = 1, max = 20))]
    pub chatbot_ids: Vec<Uuid>,
    #[validate(length(min = 1, max = 4000))]
    pub query: String,
    #[validate(range(min = 1, max = 50))]
    pub top_k: Option<usize>,
    #[validate(range(min = 1))]
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchChunksResponse {
    pub results: Vec<ChunkSearchResult>,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/v1/chatbots/:id/chunks", get(list_chatbot_chunks))
        .route("/v1/chunks/:id", get(get_chunk))
        .route("/v1/chunks/search", post(search))
        .layer(from_fn_with_state(app_state.clone(), require_principal))
        .with_state(app_state)
}

async fn list_chatbot_chunks(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Query(params): Query<ListChunksParams>,
) -> Result<Json<ChunkListResponse>, ApiError> {
    let chatbot = readable_chatbot(&state, &principal, id)?;
    let limit = params.limit.unwrap_or(DEFAULT_PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = params.offset.unwrap_or(0).max(0);

    let rows = state
        .db
        .list_readable_chunks_for_chatbot(&principal, chatbot.id, limit, offset)?;
    let mut gate = ChunkAccessGate::new(state.db.as_ref(), principal);
    let chunks = gate
        .retain_readable(rows)?
        .into_iter()
        .map(|c| ChunkResponse::new(c, chatbot.uuid))
        .collect();

    Ok(Json(ChunkListResponse {
        chunks,
        limit,
        offset,
    }))
}

async fn get_chunk(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChunkResponse>, ApiError> {
    let chunk = state
        .db
        .get_readable_chunk_by_uuid(&principal, id)?
        .ok_or(ApiError::NotFound)?;

    let mut gate = ChunkAccessGate::new(state.db.as_ref(), principal);
    if !gate.can_read_chunk(&chunk)? {
        debug!("Chunk {} denied to user {}", chunk.uuid, principal.user_id);
        return Err(ApiError::NotFound);
    }

    let Some(chatbot) = state.db.get_chatbot_by_id(chunk.chatbot_id)? else {
        error!(
            target: "data_integrity",
            "Chunk {} lost its chatbot id={} after the access check",
            chunk.uuid, chunk.chatbot_id
        );
        return Err(ApiError::NotFound);
    };

    Ok(Json(ChunkResponse::new(chunk, chatbot.uuid)))
}

/// Ranks chunks across the requested chatbots. Unreadable or unknown chatbots contribute nothing.
async fn search(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<SearchChunksRequest>,
) -> Result<Json<SearchChunksResponse>, ApiError> {
    body.validate().map_err(error_mapping::map_validation_error)?;
    if body.query.trim().is_empty() {
        return Err(ApiError::BadRequest);
    }

    let mut chatbots = Vec::with_capacity(body.chatbot_ids.len());
    for id in &body.chatbot_ids {
        if let Some(chatbot) = state.db.get_chatbot_by_uuid(*id)? {
            chatbots.push(chatbot);
        }
    }

    let results = search_chunks(
        state.db.as_ref(),
        state.embedder.as_ref(),
        &state.chunk_cache,
        principal,
        &chatbots,
        &body.query,
        body.top_k.unwrap_or(DEFAULT_TOP_K).min(MAX_TOP_K),
        body.max_tokens,
    )
    .await
    .map_err(error_mapping::map_rag_error)?;

    debug!(
        "Search by {} over {} chatbots returned {} chunks",
        principal.user_id,
        chatbots.len(),
        results.len()
    );
    Ok(Json(SearchChunksResponse { results }))
}
