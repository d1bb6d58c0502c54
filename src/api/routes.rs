use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use super::analytics::{link_analytics, owner_analytics, owner_dashboard};
use super::handlers::{create_link, delete_link, health_check, issue_token, AppState};

pub fn create_api_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(health_check))
        .route("/links", post(create_link))
        .route("/links/{code}", axum::routing::delete(delete_link))
        .route("/links/{code}/token", post(issue_token))
        .route("/links/{code}/analytics", get(link_analytics))
        .route("/analytics", get(owner_analytics))
        .route("/dashboard", get(owner_dashboard))
        .with_state(state);

    Router::new()
        .nest("/api", api)
        .layer(CorsLayer::permissive())
}
