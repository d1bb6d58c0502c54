//! Dashboard API integration tests
//!
//! Link minting, access tokens and analytics endpoints, driven through the
//! API router against the in-memory store.

use axum::{
    body::Body,
    http::{header, Request, StatusCode},
    Router,
};
use linkpulse::allocator::{counter_start, Allocator};
use linkpulse::analytics::enrich::enrich;
use linkpulse::analytics::models::{GeoLocation, RawClickEvent};
use linkpulse::analytics::AggregationReader;
use linkpulse::api::{self, AppState};
use linkpulse::codec;
use linkpulse::storage::{AnalyticsStore, CachedLinkRegistry, LinkRegistry, MemoryStorage};
use linkpulse::token;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

const CODE_WIDTH: usize = 7;

async fn test_app(store: &Arc<MemoryStorage>) -> Router {
    let allocator = Allocator::new(store.clone(), "counter:test", 10).unwrap();
    allocator
        .ensure_counter(counter_start(CODE_WIDTH).unwrap())
        .await
        .unwrap();

    api::create_api_router(Arc::new(AppState {
        allocator: Arc::new(allocator),
        links: Arc::new(CachedLinkRegistry::new(
            store.clone(),
            1_000,
            Duration::from_secs(60),
        )),
        reader: Arc::new(AggregationReader::new(
            store.clone(),
            Duration::from_secs(5),
        )),
        code_width: CODE_WIDTH,
        token_ttl: Duration::from_secs(60),
    }))
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap()
    };
    (status, json)
}

fn post_json(uri: &str, owner: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(owner) = owner {
        builder = builder.header("x-user-id", owner);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn request(method: &str, uri: &str, owner: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(owner) = owner {
        builder = builder.header("x-user-id", owner);
    }
    builder.body(Body::empty()).unwrap()
}

#[tokio::test]
async fn test_health() {
    let store = Arc::new(MemoryStorage::new());
    let app = test_app(&store).await;

    let (status, body) = send(&app, request("GET", "/api/health", None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "OK");
}

#[tokio::test]
async fn test_create_link_allocates_sequential_codes() {
    let store = Arc::new(MemoryStorage::new());
    let app = test_app(&store).await;

    let (status, first) = send(
        &app,
        post_json("/api/links", Some("owner-1"), json!({"url": "https://example.com/a"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (_, second) = send(
        &app,
        post_json("/api/links", Some("owner-1"), json!({"url": "https://example.com/b"})),
    )
    .await;

    let first_code = first["short_code"].as_str().unwrap();
    let second_code = second["short_code"].as_str().unwrap();
    assert_eq!(first_code.len(), CODE_WIDTH);
    assert_eq!(
        codec::decode(second_code).unwrap(),
        codec::decode(first_code).unwrap() + 1
    );
    assert_eq!(first["link"]["owner_id"], "owner-1");
    assert_eq!(first["link"]["original_url"], "https://example.com/a");
}

#[tokio::test]
async fn test_create_link_validation() {
    let store = Arc::new(MemoryStorage::new());
    let app = test_app(&store).await;

    let (status, body) = send(&app, post_json("/api/links", None, json!({"url": ""}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "URL cannot be empty");

    let (status, _) = send(
        &app,
        post_json("/api/links", None, json!({"url": "ftp://example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        post_json(
            "/api/links",
            None,
            json!({"url": "https://example.com", "custom_code": "no spaces"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_custom_code_conflict() {
    let store = Arc::new(MemoryStorage::new());
    let app = test_app(&store).await;

    let body = json!({"url": "https://example.com", "custom_code": "launch"});
    let (status, created) = send(&app, post_json("/api/links", Some("owner-1"), body.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(created["short_code"], "launch");

    let (status, _) = send(&app, post_json("/api/links", Some("owner-2"), body.clone())).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, post_json("/api/links", Some("owner-1"), body)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_allocation_skips_codes_taken_by_custom_links() {
    let store = Arc::new(MemoryStorage::new());
    let app = test_app(&store).await;

    // Claim the code the allocator will hand out first
    let next = codec::encode(codec::min_full_width(CODE_WIDTH).unwrap(), CODE_WIDTH);
    store
        .create_link(&next, "https://example.com/custom", Some("owner-1"), None)
        .await
        .unwrap();

    let (status, body) = send(
        &app,
        post_json("/api/links", None, json!({"url": "https://example.com"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_ne!(body["short_code"], next.as_str());
}

#[tokio::test]
async fn test_issue_token_for_owned_link() {
    token::init_token_hmac_key(Some("api-integration-secret"));

    let store = Arc::new(MemoryStorage::new());
    store
        .create_link("private", "https://example.com", Some("owner-1"), None)
        .await
        .unwrap();
    let app = test_app(&store).await;

    let (status, body) = send(&app, request("POST", "/api/links/private/token", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["expires_in"], 60);
    assert!(token::verify(body["token"].as_str().unwrap(), "private").is_ok());

    let (status, _) = send(&app, request("POST", "/api/links/private/token", Some("owner-2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("POST", "/api/links/missing/token", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_delete_link() {
    let store = Arc::new(MemoryStorage::new());
    store
        .create_link("todelete", "https://example.com", Some("owner-1"), None)
        .await
        .unwrap();
    let app = test_app(&store).await;

    let (status, _) = send(&app, request("DELETE", "/api/links/todelete", Some("owner-2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("DELETE", "/api/links/todelete", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert!(store.get_link("todelete").await.unwrap().unwrap().deleted);

    let (status, _) = send(&app, request("DELETE", "/api/links/todelete", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_analytics_endpoints() {
    let store = Arc::new(MemoryStorage::new());
    store
        .create_link("stats01", "https://example.com", Some("owner-1"), None)
        .await
        .unwrap();

    let event = RawClickEvent::new(
        "stats01",
        "10.0.0.1",
        "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0",
        None,
        true,
    );
    let record = enrich(&event, Some("owner-1".to_string()), GeoLocation::default());
    assert!(store.insert_click(&record).await.unwrap());

    let app = test_app(&store).await;

    let (status, body) = send(&app, request("GET", "/api/links/stats01/analytics", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["total_clicks"], 1);
    assert_eq!(body["browsers"]["Firefox"], 1);
    assert_eq!(body["sources"]["QR Code"], 1);
    assert!(body["last_click"].is_object());

    let (status, body) = send(&app, request("GET", "/api/analytics", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["total_clicks"], 1);
    assert_eq!(body["top_links"][0]["short_code"], "stats01");

    let (status, _) = send(&app, request("GET", "/api/analytics", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&app, request("GET", "/api/links/stats01/analytics", Some("owner-2"))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, request("GET", "/api/links/nothing/analytics", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // A window with no clicks is an empty view, not an error
    let (status, body) = send(
        &app,
        request(
            "GET",
            "/api/analytics?start_date=2001-01-01&end_date=2001-01-31",
            Some("owner-1"),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["total_clicks"], 0);
}

#[tokio::test]
async fn test_dashboard_endpoint() {
    let store = Arc::new(MemoryStorage::new());
    store
        .create_link("dash001", "https://example.com/dash", Some("owner-1"), None)
        .await
        .unwrap();

    let event = RawClickEvent::new(
        "dash001",
        "10.0.0.1",
        "Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0",
        None,
        false,
    );
    let geo = GeoLocation {
        country: "France".to_string(),
        country_code: "FR".to_string(),
        city: "Paris".to_string(),
        ..GeoLocation::default()
    };
    let record = enrich(&event, Some("owner-1".to_string()), geo);
    assert!(store.insert_click(&record).await.unwrap());

    let app = test_app(&store).await;

    let (status, body) = send(&app, request("GET", "/api/dashboard", Some("owner-1"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["total_clicks"], 1);
    assert_eq!(body["recent_link"]["short_code"], "dash001");
    assert_eq!(body["recent_link"]["original_url"], "https://example.com/dash");
    assert_eq!(body["recent_link"]["total_clicks"], 1);
    assert_eq!(body["recent_link"]["top_browser"], "Firefox");
    assert_eq!(body["recent_link"]["top_os"], "Linux");
    assert_eq!(body["recent_link"]["top_city"], "Paris");
    assert_eq!(body["recent_link"]["top_country"], "France");

    // An owner with no clicks gets zero totals and no link
    let (status, body) = send(&app, request("GET", "/api/dashboard", Some("owner-2"))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["totals"]["total_clicks"], 0);
    assert!(body["recent_link"].is_null());

    let (status, _) = send(&app, request("GET", "/api/dashboard", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}
