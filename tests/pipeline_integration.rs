//! Click pipeline integration tests
//!
//! Ingest -> enrichment tick -> aggregation, against an in-memory SQLite
//! database so the SQL paths of every store are exercised.

use chrono::{DateTime, NaiveDate, Utc};
use linkpulse::analytics::ingestor::Ingestor;
use linkpulse::analytics::models::{DateRange, RawClickEvent};
use linkpulse::analytics::{AggregationReader, EnrichmentWorker, GeoResolver};
use linkpulse::storage::{EventBuffer, LinkRegistry, SqliteStorage, Storage};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

const CHROME_WINDOWS: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";
const SAFARI_IPHONE: &str = "Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Mobile/15E148 Safari/604.1";

/// Helper to create test storage. One connection: every `sqlite::memory:`
/// connection is its own database.
async fn create_test_storage() -> Arc<SqliteStorage> {
    let storage = SqliteStorage::new("sqlite::memory:", 1).await.unwrap();
    storage.init().await.unwrap();
    Arc::new(storage)
}

fn worker_for(store: &Arc<SqliteStorage>) -> EnrichmentWorker {
    EnrichmentWorker::new(
        store.clone(),
        store.clone(),
        store.clone(),
        GeoResolver::default(),
        Duration::from_secs(60),
    )
}

fn event_at(
    code: &str,
    ip: &str,
    ua: &str,
    referrer: Option<&str>,
    is_qr: bool,
    at: &str,
) -> RawClickEvent {
    let mut event = RawClickEvent::new(code, ip, ua, referrer.map(str::to_string), is_qr);
    event.timestamp = DateTime::parse_from_rfc3339(at)
        .unwrap()
        .with_timezone(&Utc);
    event
}

fn counts<K: Ord + Clone>(pairs: &[(K, i64)]) -> BTreeMap<K, i64> {
    pairs.iter().cloned().collect()
}

async fn seed(store: &Arc<SqliteStorage>) {
    store
        .create_link("pipe001", "https://example.com/a", Some("owner-1"), None)
        .await
        .unwrap();
    store
        .create_link("pipe002", "https://example.com/b", Some("owner-1"), None)
        .await
        .unwrap();

    let ingestor = Ingestor::new(store.clone());
    let events = [
        // Sunday
        event_at("pipe001", "10.0.0.1", CHROME_WINDOWS, None, false, "2024-03-10T14:05:00Z"),
        event_at(
            "pipe001",
            "10.0.0.2",
            SAFARI_IPHONE,
            Some("https://t.co/x"),
            false,
            "2024-03-10T14:30:00Z",
        ),
        // Monday
        event_at("pipe001", "10.0.0.1", CHROME_WINDOWS, None, true, "2024-03-11T09:00:00Z"),
        event_at("pipe002", "10.0.0.3", CHROME_WINDOWS, None, false, "2024-03-12T09:00:00Z"),
    ];
    for event in &events {
        ingestor.record_event(event).await.unwrap();
    }
}

#[tokio::test]
async fn test_tick_moves_buffer_into_analytics() {
    let store = create_test_storage().await;
    seed(&store).await;

    let report = worker_for(&store).tick().await.unwrap();
    assert_eq!(report.keys, 2);
    assert_eq!(report.inserted, 4);
    assert_eq!(report.dropped, 0);

    assert!(store.pending_keys("click:").await.unwrap().is_empty());

    // Nothing left to do
    let report = worker_for(&store).tick().await.unwrap();
    assert_eq!(report.processed(), 0);
}

#[tokio::test]
async fn test_link_summary_after_tick() {
    let store = create_test_storage().await;
    seed(&store).await;
    worker_for(&store).tick().await.unwrap();

    let reader = AggregationReader::new(store.clone(), Duration::from_secs(5));
    let view = reader.summarize_link("pipe001").await.unwrap();

    assert_eq!(view.totals.total_clicks, 3);
    assert_eq!(view.totals.unique_visitors, 2);
    assert_eq!(view.totals.qr_clicks, 1);
    assert_eq!(view.totals.direct_clicks, 2);

    assert_eq!(
        view.browsers,
        counts(&[("Chrome".to_string(), 2), ("Safari".to_string(), 1)])
    );
    assert_eq!(
        view.operating_systems,
        counts(&[("Windows".to_string(), 2), ("iOS".to_string(), 1)])
    );
    assert_eq!(
        view.devices,
        counts(&[("Desktop".to_string(), 2), ("Mobile".to_string(), 1)])
    );
    assert_eq!(view.hourly, counts(&[(14u32, 2), (9, 1)]));
    assert_eq!(view.weekly, counts(&[(0u32, 2), (1, 1)]));
    assert_eq!(view.monthly, counts(&[(3u32, 3)]));
    assert_eq!(
        view.daily,
        counts(&[("2024-03-10".to_string(), 2), ("2024-03-11".to_string(), 1)])
    );
    assert_eq!(
        view.sources,
        counts(&[("QR Code".to_string(), 1), ("Direct Link".to_string(), 2)])
    );

    // Private addresses never resolve to a country
    assert!(view.geographic.is_empty());

    let last = view.last_click.expect("last click");
    assert_eq!(last.browser, "Chrome");
    assert_eq!(
        last.clicked_at,
        DateTime::parse_from_rfc3339("2024-03-11T09:00:00Z").unwrap()
    );
}

#[tokio::test]
async fn test_owner_summary_respects_range() {
    let store = create_test_storage().await;
    seed(&store).await;
    worker_for(&store).tick().await.unwrap();

    let reader = AggregationReader::new(store.clone(), Duration::from_secs(5));
    let date = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();

    let march = reader
        .summarize_owner("owner-1", DateRange::new(date("2024-03-01"), date("2024-03-31")))
        .await
        .unwrap();
    assert_eq!(march.totals.total_clicks, 4);
    assert_eq!(march.top_links.len(), 2);
    assert_eq!(march.top_links[0].short_code, "pipe001");
    assert_eq!(march.top_links[0].total_clicks, 3);
    assert_eq!(march.top_links[0].original_url, "https://example.com/a");
    assert_eq!(march.recent_activity[0].short_code, "pipe002");
    assert!(march.last_click.is_none());

    let sunday_only = reader
        .summarize_owner("owner-1", DateRange::new(date("2024-03-10"), date("2024-03-10")))
        .await
        .unwrap();
    assert_eq!(sunday_only.totals.total_clicks, 2);

    let other = reader
        .summarize_owner("owner-2", DateRange::new(date("2024-03-01"), date("2024-03-31")))
        .await
        .unwrap();
    assert_eq!(other.totals.total_clicks, 0);
    assert!(other.browsers.is_empty());
}

#[tokio::test]
async fn test_dashboard_after_tick() {
    let store = create_test_storage().await;
    seed(&store).await;
    worker_for(&store).tick().await.unwrap();

    let reader = AggregationReader::new(store.clone(), Duration::from_secs(5));
    let dashboard = reader.summarize_dashboard("owner-1").await.unwrap();

    // Lifetime totals ignore any date window
    assert_eq!(dashboard.totals.total_clicks, 4);
    assert_eq!(dashboard.totals.unique_visitors, 3);

    let link = dashboard.recent_link.expect("recent link");
    assert_eq!(link.short_code, "pipe002");
    assert_eq!(link.original_url, "https://example.com/b");
    assert_eq!(link.total_clicks, 1);
    assert_eq!(link.top_browser.as_deref(), Some("Chrome"));
    assert_eq!(link.top_os.as_deref(), Some("Windows"));
    assert_eq!(link.top_device.as_deref(), Some("Desktop"));
    // 2024-03-12 is a Tuesday
    assert_eq!(link.top_day_of_week, Some(2));

    let empty = reader.summarize_dashboard("owner-2").await.unwrap();
    assert_eq!(empty.totals.total_clicks, 0);
    assert!(empty.recent_link.is_none());
}

#[tokio::test]
async fn test_replayed_event_is_not_double_counted() {
    let store = create_test_storage().await;
    store
        .create_link("replay1", "https://example.com", Some("owner-1"), None)
        .await
        .unwrap();

    let ingestor = Ingestor::new(store.clone());
    let event = event_at("replay1", "10.0.0.9", CHROME_WINDOWS, None, false, "2024-03-10T10:00:00Z");

    ingestor.record_event(&event).await.unwrap();
    worker_for(&store).tick().await.unwrap();

    // Same event delivered again, as after a lost acknowledgment
    ingestor.record_event(&event).await.unwrap();
    let report = worker_for(&store).tick().await.unwrap();
    assert_eq!(report.inserted, 0);
    assert_eq!(report.duplicates, 1);

    let reader = AggregationReader::new(store.clone(), Duration::from_secs(5));
    let view = reader.summarize_link("replay1").await.unwrap();
    assert_eq!(view.totals.total_clicks, 1);
}

#[tokio::test]
async fn test_events_for_missing_link_keep_no_owner() {
    let store = create_test_storage().await;
    let ingestor = Ingestor::new(store.clone());
    ingestor
        .record_event(&event_at(
            "gone001",
            "10.0.0.1",
            CHROME_WINDOWS,
            None,
            false,
            "2024-03-10T10:00:00Z",
        ))
        .await
        .unwrap();

    let report = worker_for(&store).tick().await.unwrap();
    assert_eq!(report.inserted, 1);

    let reader = AggregationReader::new(store.clone(), Duration::from_secs(5));
    assert_eq!(
        reader
            .summarize_link("gone001")
            .await
            .unwrap()
            .totals
            .total_clicks,
        1
    );
}
