pub mod auth;
pub mod chatbots;
pub mod chunks;
pub mod documents;
mod errors;
pub mod permissions;

pub use errors::error_mapping;

use crate::{AppMode, AppState};
use axum::{
    http::{header, Method},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Builds the full HTTP surface. Every `/v1` route sits behind the bearer-token middleware.
pub fn router(app_state: Arc<AppState>) -> Router<()> {
    let cors = cors_layer(app_state.config.app_mode);

    Router::new()
        .route("/health-check", get(health_check))
        .merge(chatbots::router(app_state.clone()))
        .merge(permissions::router(app_state.clone()))
        .merge(documents::router(app_state.clone()))
        .merge(chunks::router(app_state))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
}

fn cors_layer(app_mode: AppMode) -> CorsLayer {
    match app_mode {
        AppMode::Local | AppMode::Dev => CorsLayer::permissive(),
        AppMode::Preview | AppMode::Prod => CorsLayer::new()
            .allow_methods([
                Method::GET,
                Method::POST,
                Method::PUT,
                Method::PATCH,
                Method::DELETE,
            ])
            .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]),
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
