use axum::{
    extract::{ConnectInfo, Path, Query, State},
    http::{
        header::{self, HeaderMap, HeaderValue},
        StatusCode,
    },
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;

use crate::analytics::ingestor::Ingestor;
use crate::analytics::ip_extractor::extract_client_ip;
use crate::config::AnalyticsConfig;
use crate::models::Link;
use crate::storage::{CachedLinkRegistry, LinkRegistry};
use crate::token::{self, TokenError};

pub struct RedirectState {
    pub links: Arc<CachedLinkRegistry>,
    /// `None` when analytics is disabled
    pub ingestor: Option<Ingestor>,
    pub analytics_config: AnalyticsConfig,
    pub redirect_status: StatusCode,
}

#[derive(Debug, Deserialize)]
pub struct RedirectParams {
    /// `qr` when the link was opened from a QR code
    pub r: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VerifyParams {
    pub token: String,
}

/// Redirect to original URL
pub async fn redirect_url(
    State(state): State<Arc<RedirectState>>,
    Path(code): Path<String>,
    Query(params): Query<RedirectParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let link = match resolve_link(&state, &code).await {
        Ok(link) => link,
        Err(response) => return response,
    };

    let is_qr = params.r.as_deref() == Some("qr");
    record_click(&state, &code, &headers, addr, is_qr);

    redirect_response(state.redirect_status, &link.original_url)
}

/// Redirect holders of a valid access token; the hit counts as a click
pub async fn verify_access(
    State(state): State<Arc<RedirectState>>,
    Path(code): Path<String>,
    Query(params): Query<VerifyParams>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    let link = match resolve_link(&state, &code).await {
        Ok(link) => link,
        Err(response) => return response,
    };

    if let Err(e) = token::verify(&params.token, &code) {
        let message = match e {
            TokenError::Expired => "Access token expired",
            TokenError::Malformed | TokenError::BadSignature => "Invalid access token",
        };
        return (StatusCode::FORBIDDEN, message).into_response();
    }

    record_click(&state, &code, &headers, addr, false);
    redirect_response(state.redirect_status, &link.original_url)
}

/// Look up a redirectable link, or the response explaining why there is none
async fn resolve_link(state: &RedirectState, code: &str) -> Result<Link, Response> {
    match state.links.get_link(code).await {
        Ok(Some(link)) if link.deleted => {
            Err((StatusCode::GONE, "This link has been deleted").into_response())
        }
        Ok(Some(link)) if link.is_expired_at(chrono::Utc::now().timestamp()) => {
            Err((StatusCode::GONE, "This link has expired").into_response())
        }
        Ok(Some(link)) => Ok(link),
        Ok(None) => Err((StatusCode::NOT_FOUND, "URL not found").into_response()),
        Err(e) => {
            tracing::error!(short_code = %code, error = %e, "Link lookup failed");
            Err((StatusCode::INTERNAL_SERVER_ERROR, "Internal server error").into_response())
        }
    }
}

/// Hand the click to the ingestor without waiting for it
fn record_click(
    state: &RedirectState,
    code: &str,
    headers: &HeaderMap,
    addr: SocketAddr,
    is_qr: bool,
) {
    let Some(ingestor) = &state.ingestor else {
        return;
    };

    let client_ip = extract_client_ip(headers, addr.ip(), &state.analytics_config);
    let header_str = |name: header::HeaderName| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    let referrer = Some(header_str(header::REFERER)).filter(|r| !r.is_empty());

    ingestor.record_detached(
        code.to_string(),
        client_ip.to_string(),
        header_str(header::USER_AGENT),
        referrer,
        is_qr,
    );
}

fn redirect_response(status: StatusCode, location: &str) -> Response {
    match HeaderValue::try_from(location) {
        Ok(value) => (status, [(header::LOCATION, value)]).into_response(),
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "Invalid target URL").into_response(),
    }
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    #[derive(Serialize)]
    struct HealthResponse {
        status: String,
    }

    Json(HealthResponse {
        status: "OK".to_string(),
    })
}
