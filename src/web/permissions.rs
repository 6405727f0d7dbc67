use axum::{
    extract::{Path, State},
    http::StatusCode,
    middleware::from_fn_with_state,
    routing::{get, put},
    Extension, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use crate::access::Principal;
use crate::models::chatbots::Visibility;
use crate::web::auth::require_principal;
use crate::web::chatbots::owned_chatbot;
use crate::{ApiError, AppState};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GranteesResponse {
    pub chatbot_id: Uuid,
    pub grantees: Vec<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantResponse {
    pub chatbot_id: Uuid,
    pub user_id: Uuid,
    /// False when the grant already existed.
    pub created: bool,
}

pub fn router(app_state: Arc<AppState>) -> Router<()> {
    Router::new()
        .route("/v1/chatbots/:id/permissions", get(list_grantees))
        .route(
            "/v1/chatbots/:id/permissions/:user_id",
            put(grant).delete(revoke),
        )
        .layer(from_fn_with_state(app_state.clone(), require_principal))
        .with_state(app_state)
}

async fn list_grantees(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path(id): Path<Uuid>,
) -> Result<Json<GranteesResponse>, ApiError> {
    let chatbot = owned_chatbot(&state, &principal, id)?;
    let grantees = state.db.list_grantees(chatbot.id)?;
    Ok(Json(GranteesResponse {
        chatbot_id: chatbot.uuid,
        grantees,
    }))
}

async fn grant(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<Json<GrantResponse>, ApiError> {
    let chatbot = owned_chatbot(&state, &principal, id)?;

    let created = state
        .db
        .grant_permission(chatbot.id, user_id, principal.user_id)?;
    if created {
        info!("Granted user {} read access to chatbot {}", user_id, chatbot.uuid);
    }
    if chatbot.visibility != Visibility::Shared {
        debug!(
            "Grant on {} chatbot {} has no effect until it is shared",
            chatbot.visibility, chatbot.uuid
        );
    }

    Ok(Json(GrantResponse {
        chatbot_id: chatbot.uuid,
        user_id,
        created,
    }))
}

async fn revoke(
    State(state): State<Arc<AppState>>,
    Extension(principal): Extension<Principal>,
    Path((id, user_id)): Path<(Uuid, Uuid)>,
) -> Result<StatusCode, ApiError> {
    let chatbot = owned_chatbot(&state, &principal, id)?;
    if state.db.revoke_permission(chatbot.id, user_id)? {
        info!("Revoked user {} from chatbot {}", user_id, chatbot.uuid);
    }
    Ok(StatusCode::NO_CONTENT)
}
