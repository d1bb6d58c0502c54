//! Dashboard analytics handlers

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{Duration, NaiveDate, Utc};
use serde::Deserialize;
use std::sync::Arc;

use super::handlers::{api_error, owned_link, owner_from_headers, AppState};
use crate::analytics::models::DateRange;

/// Window used when the caller gives no dates.
pub const DEFAULT_RANGE_DAYS: u32 = 30;

#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQueryParams {
    /// Inclusive, `YYYY-MM-DD`
    pub start_date: Option<NaiveDate>,
    /// Inclusive, `YYYY-MM-DD`
    pub end_date: Option<NaiveDate>,
}

impl AnalyticsQueryParams {
    pub fn range(&self) -> DateRange {
        let window = Duration::days(i64::from(DEFAULT_RANGE_DAYS));
        match (self.start_date, self.end_date) {
            (Some(start), Some(end)) => DateRange::new(start, end),
            (Some(start), None) => DateRange::new(start, Utc::now().date_naive()),
            (None, Some(end)) => DateRange::new(end - window, end),
            (None, None) => DateRange::last_days(DEFAULT_RANGE_DAYS),
        }
    }
}

/// Aggregate stats over every link of the calling owner
pub async fn owner_analytics(
    State(state): State<Arc<AppState>>,
    Query(params): Query<AnalyticsQueryParams>,
    headers: HeaderMap,
) -> Response {
    let Some(owner) = owner_from_headers(&headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "Missing x-user-id header").into_response();
    };

    match state.reader.summarize_owner(&owner, params.range()).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            tracing::error!(owner_id = %owner, dimension = e.dimension(), "Failed to load analytics: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load analytics: {}", e),
            )
            .into_response()
        }
    }
}

/// All-time totals of the calling owner and their most recently clicked link
pub async fn owner_dashboard(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    let Some(owner) = owner_from_headers(&headers) else {
        return api_error(StatusCode::UNAUTHORIZED, "Missing x-user-id header").into_response();
    };

    match state.reader.summarize_dashboard(&owner).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            tracing::error!(owner_id = %owner, dimension = e.dimension(), "Failed to load dashboard: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load dashboard: {}", e),
            )
            .into_response()
        }
    }
}

/// Lifetime stats of a single link
pub async fn link_analytics(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Response {
    let owner = owner_from_headers(&headers);
    if let Err(e) = owned_link(&state.links, &code, owner.as_deref()).await {
        return e.into_response();
    }

    match state.reader.summarize_link(&code).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => {
            tracing::error!(short_code = %code, dimension = e.dimension(), "Failed to load analytics: {}", e);
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to load analytics: {}", e),
            )
            .into_response()
        }
    }
}
