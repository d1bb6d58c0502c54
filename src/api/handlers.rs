use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::allocator::Allocator;
use crate::analytics::reader::AggregationReader;
use crate::models::{CreateLinkRequest, CreateLinkResponse, Link};
use crate::storage::{CachedLinkRegistry, LinkRegistry, StorageError};
use crate::token;

/// Header carrying the authenticated caller, set by the fronting gateway.
pub const OWNER_HEADER: &str = "x-user-id";

/// Allocated codes can collide with custom codes claimed earlier.
const MAX_ALLOCATION_ATTEMPTS: usize = 3;

pub struct AppState {
    pub allocator: Arc<Allocator>,
    pub links: Arc<CachedLinkRegistry>,
    pub reader: Arc<AggregationReader>,
    pub code_width: usize,
    pub token_ttl: Duration,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct SuccessResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub token: String,
    pub expires_in: u64,
}

pub(crate) type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

pub(crate) fn owner_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Load a live link and check that the caller may manage it.
pub(crate) async fn owned_link(
    links: &CachedLinkRegistry,
    code: &str,
    owner: Option<&str>,
) -> Result<Link, ApiError> {
    let link = match links.get_link(code).await {
        Ok(Some(link)) if !link.deleted => link,
        Ok(_) => return Err(api_error(StatusCode::NOT_FOUND, "Short code not found")),
        Err(e) => {
            error!(short_code = %code, error = %e, "Link lookup failed");
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load link",
            ));
        }
    };

    match (link.owner_id.as_deref(), owner) {
        (Some(link_owner), Some(caller)) if link_owner != caller => {
            return Err(api_error(StatusCode::FORBIDDEN, "Not the owner of this link"));
        }
        (Some(_), None) => {
            return Err(api_error(StatusCode::UNAUTHORIZED, "Missing x-user-id header"));
        }
        _ => {}
    }
    Ok(link)
}

fn validate_custom_code(code: &str) -> Result<(), ApiError> {
    if code.is_empty() || code.len() > 20 {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Custom code must be 1-20 characters",
        ));
    }
    if !code
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "Custom code may only contain letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

/// Create a new short link
pub async fn create_link(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<CreateLinkRequest>,
) -> Result<(StatusCode, Json<CreateLinkResponse>), ApiError> {
    let url = payload.url.trim();
    if url.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "URL cannot be empty"));
    }
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "URL must start with http:// or https://",
        ));
    }

    let owner = owner_from_headers(&headers);

    let link = match payload.custom_code {
        Some(custom) => {
            validate_custom_code(&custom)?;
            create_custom(&state, &custom, url, owner.as_deref(), payload.expires_at).await?
        }
        None => create_allocated(&state, url, owner.as_deref(), payload.expires_at).await?,
    };

    info!(short_code = %link.short_code, owner_id = ?link.owner_id, "Created link");

    Ok((
        StatusCode::CREATED,
        Json(CreateLinkResponse {
            short_code: link.short_code.clone(),
            link,
        }),
    ))
}

async fn create_custom(
    state: &AppState,
    code: &str,
    url: &str,
    owner: Option<&str>,
    expires_at: Option<i64>,
) -> Result<Link, ApiError> {
    let available = state
        .links
        .is_code_available(owner.unwrap_or_default(), code)
        .await
        .map_err(|e| {
            error!(short_code = %code, error = %e, "Availability check failed");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to create link")
        })?;
    if !available {
        return Err(api_error(StatusCode::CONFLICT, "Short code is already taken"));
    }

    match state.links.create_link(code, url, owner, expires_at).await {
        Ok(link) => Ok(link),
        Err(StorageError::Conflict) => {
            Err(api_error(StatusCode::CONFLICT, "Short code already exists"))
        }
        Err(StorageError::Other(e)) => {
            error!(short_code = %code, error = %e, "Failed to create link");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to create link",
            ))
        }
    }
}

async fn create_allocated(
    state: &AppState,
    url: &str,
    owner: Option<&str>,
    expires_at: Option<i64>,
) -> Result<Link, ApiError> {
    for _ in 0..MAX_ALLOCATION_ATTEMPTS {
        let code = state.allocator.next_code(state.code_width).await.map_err(|e| {
            error!(error = %e, "Short code allocation failed");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to allocate short code",
            )
        })?;

        match state.links.create_link(&code, url, owner, expires_at).await {
            Ok(link) => return Ok(link),
            Err(StorageError::Conflict) => {
                warn!(short_code = %code, "Allocated code already in use, retrying");
            }
            Err(StorageError::Other(e)) => {
                error!(short_code = %code, error = %e, "Failed to create link");
                return Err(api_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to create link",
                ));
            }
        }
    }

    Err(api_error(
        StatusCode::INTERNAL_SERVER_ERROR,
        "Failed to allocate short code",
    ))
}

/// Issue a short-lived access token for a link
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<TokenResponse>, ApiError> {
    let owner = owner_from_headers(&headers);
    owned_link(&state.links, &code, owner.as_deref()).await?;

    Ok(Json(TokenResponse {
        token: token::issue(&code, state.token_ttl),
        expires_in: state.token_ttl.as_secs(),
    }))
}

/// Soft delete a link
pub async fn delete_link(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SuccessResponse>, ApiError> {
    let owner = owner_from_headers(&headers);
    owned_link(&state.links, &code, owner.as_deref()).await?;

    match state.links.soft_delete(&code).await {
        Ok(true) => Ok(Json(SuccessResponse {
            message: "Link deleted".to_string(),
        })),
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, "Short code not found")),
        Err(e) => {
            error!(short_code = %code, error = %e, "Failed to delete link");
            Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to delete link",
            ))
        }
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<SuccessResponse> {
    Json(SuccessResponse {
        message: "OK".to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_owner_from_headers() {
        let mut headers = HeaderMap::new();
        assert_eq!(owner_from_headers(&headers), None);

        headers.insert(OWNER_HEADER, HeaderValue::from_static("  "));
        assert_eq!(owner_from_headers(&headers), None);

        headers.insert(OWNER_HEADER, HeaderValue::from_static("user-7"));
        assert_eq!(owner_from_headers(&headers).as_deref(), Some("user-7"));
    }

    #[test]
    fn test_validate_custom_code() {
        assert!(validate_custom_code("my-link_2").is_ok());
        assert!(validate_custom_code("").is_err());
        assert!(validate_custom_code("a".repeat(21).as_str()).is_err());

        let (status, _) = validate_custom_code("has space").unwrap_err();
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }
}
