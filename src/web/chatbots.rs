use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, patch, post},
    Extension, Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;
use validator::Validate;

use crate::access::{check_owner, check_read, OwnerCheck, Principal};
use crate::models::chatbots::{Chatbot, NewChatbot, Visibility};
use crate::web::auth::require_principal;
use crate::web::error_mapping;
use crate::{ApiError, AppState};

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateChatbotRequest {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    pub visibility: Option<Visibility>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdateVisibilityRequest {
    pub visibility: Visibility,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatbotResponse {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub visibility: Visibility,
    pub is_owner: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChatbotResponse {
    fn new(chatbot: Chatbot, principal: &Principal) -> Self {
        Self {
            is_owner: chatbot.is_owned_by(principal.user_id),
            id: chatbot.uuid,
            owner_id: chatbot.owner_id,
            name: chatbot.name,
            description: chatbot.description,
            visibility: chatbot.visibility,
            created_at: chatbot.created_at,
            updated_at: chatbot.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatbotListResponse {
    pub chatbots: Vec<ChatbotResponse>,
}

/// Loads a chatbot the principal may read. Unreadable and missing look the same.
pub(crate) fn readable_chatbot(
    state: &AppState,
    principal: &Principal,
    id: Uuid,
) -> Result<Chatbot, ApiError> {
    let chatbot = state.db.get_chatbot_by_uuid(id)?.ok_or(ApiError::NotFound)?;
    if check_read(state.db.as_ref(), principal, &chatbot)? {
        Ok(chatbot)
    } else {
        Err(ApiError::NotFound)
    }
}

/// Loads a chatbot the principal owns.
///
/// Readers who are not the owner get `Forbidden`; everyone else gets `NotFound`.
pub(crate) fn owned_chatbot(
    state: &AppState,
    principal: &Principal,
    id: Uuid,
) -> Result<Chatbot, ApiError> {
    let chatbot = state.db.get_chatbot_by_uuid(id)?.ok_or(ApiError::NotFound)?;
    owner_of(state, principal, chatbot)
}

pub(crate) fn owner_of(
    state: &AppState,
    principal: &Principal,
    chatbot: Chatbot,
) -> Result<Chatbot, ApiError> {
    match check_owner(state.db.as_ref(), principal, &chatbot)? {
        OwnerCheck::Owner => Ok(chatbot),
        OwnerCheck::NotOwner => {
            debug!(
                "User {} attempted an owner action on chatbot {}",
                principal.user_id, chatbot.uuid
            );
            Err(ApiError::Forbidden)
        }
        OwnerCheck::Hidden => Err(ApiError::NotFound),
    }
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/v1/chatbots", post(create_chatbot).get(list_chatbots))
        .route("/v1/chatbots/:id", get(get_chatbot).delete(delete_chatbot))
        .route("/v1/chatbots/:id/visibility", patch(update_visibility))
        .layer(from_fn_with_state(app_state.clone(), require_principal))
        .with_state(app_state)
}

async fn create_chatbot(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Json(body): Json<CreateChatbotRequest>,
) -> Result<(StatusCode, Json<ChatbotResponse>), ApiError> {
    body.validate().map_err(error_mapping::map_validation_error)?;
    if body.name.trim().is_empty() {
        return Err(ApiError::BadRequest);
    }

    let chatbot = state.db.create_chatbot(NewChatbot::new(
        principal.user_id,
        body.name.trim(),
        body.description,
        body.visibility.unwrap_or(Visibility::Private),
    ))?;
    info!(
        "User {} created {} chatbot {}",
        principal.user_id, chatbot.visibility, chatbot.uuid
    );

    Ok((
        StatusCode::CREATED,
        Json(ChatbotResponse::new(chatbot, &principal)),
    ))
}

async fn list_chatbots(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
) -> Result<Json<ChatbotListResponse>, ApiError> {
    let chatbots = state
        .db
        .list_readable_chatbots(&principal)?
        .into_iter()
        .map(|c| ChatbotResponse::new(c, &principal))
        .collect();
    Ok(Json(ChatbotListResponse { chatbots }))
}

async fn get_chatbot(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<ChatbotResponse>, ApiError> {
    let chatbot = readable_chatbot(&state, &principal, id)?;
    Ok(Json(ChatbotResponse::new(chatbot, &principal)))
}

async fn update_visibility(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
    Json(body): Json<UpdateVisibilityRequest>,
) -> Result<Json<ChatbotResponse>, ApiError> {
    let chatbot = owned_chatbot(&state, &principal, id)?;

    let updated = state
        .db
        .update_chatbot_visibility(chatbot.id, body.visibility)?;
    state.chunk_cache.lock().await.evict_chatbot(chatbot.id);

    if updated.visibility == Visibility::Shared && state.db.list_grantees(chatbot.id)?.is_empty() {
        debug!(
            "Chatbot {} is shared with no grantees; only the owner can read it",
            chatbot.uuid
        );
    }
    info!(
        "Chatbot {} visibility changed from {} to {}",
        chatbot.uuid, chatbot.visibility, updated.visibility
    );

    Ok(Json(ChatbotResponse::new(updated, &principal)))
}

async fn delete_chatbot(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    let chatbot = owned_chatbot(&state, &principal, id)?;
    state.db.delete_chatbot(chatbot.id)?;
    state.chunk_cache.lock().await.evict_chatbot(chatbot.id);
    info!("Chatbot {} deleted by owner", chatbot.uuid);
    Ok(StatusCode::NO_CONTENT)
}
