use axum::{middleware, routing::get, Router};
use std::sync::Arc;

use super::handlers::{health_check, redirect_url, verify_access, RedirectState};
use super::middleware::time_redirect;

pub fn create_redirect_router(state: Arc<RedirectState>) -> Router {
    Router::new()
        .route("/", get(health_check))
        .route("/{code}", get(redirect_url))
        .route("/{code}/verify", get(verify_access))
        .layer(middleware::from_fn(time_redirect))
        .with_state(state)
}
