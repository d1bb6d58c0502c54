//! Periodic drain of the click buffer into the analytics table.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time;
use tracing::{debug, error, info, warn};

use crate::analytics::enrich::enrich;
use crate::analytics::geoip::GeoResolver;
use crate::analytics::ingestor::BUFFER_PREFIX;
use crate::analytics::models::RawClickEvent;
use crate::storage::{AnalyticsStore, EventBuffer, LinkRegistry};

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Keys that had claimable entries
    pub keys: usize,
    pub inserted: usize,
    /// Events whose id was already stored (re-delivered after a lost ack)
    pub duplicates: usize,
    /// Events that could not be decoded or stored
    pub dropped: usize,
}

impl TickReport {
    pub fn processed(&self) -> usize {
        self.inserted + self.duplicates + self.dropped
    }
}

pub struct EnrichmentWorker {
    buffer: Arc<dyn EventBuffer>,
    analytics: Arc<dyn AnalyticsStore>,
    links: Arc<dyn LinkRegistry>,
    geo: GeoResolver,
    lease: Duration,
}

impl EnrichmentWorker {
    pub fn new(
        buffer: Arc<dyn EventBuffer>,
        analytics: Arc<dyn AnalyticsStore>,
        links: Arc<dyn LinkRegistry>,
        geo: GeoResolver,
        lease: Duration,
    ) -> Self {
        Self {
            buffer,
            analytics,
            links,
            geo,
            lease,
        }
    }

    /// Drain every pending key once.
    ///
    /// Only enumerating the keys can fail the tick; a key that cannot be
    /// claimed or acknowledged is logged and left for the next tick.
    pub async fn tick(&self) -> Result<TickReport> {
        let keys = self
            .buffer
            .pending_keys(BUFFER_PREFIX)
            .await
            .context("failed to list pending click buffers")?;

        let mut report = TickReport::default();
        for key in keys {
            if let Err(e) = self.drain_key(&key, &mut report).await {
                warn!(key = %key, error = %e, "Failed to drain click buffer");
            }
        }

        if report.processed() > 0 {
            info!(
                keys = report.keys,
                inserted = report.inserted,
                duplicates = report.duplicates,
                dropped = report.dropped,
                "📊 Enriched buffered clicks"
            );
        } else {
            debug!("No buffered clicks");
        }

        Ok(report)
    }

    async fn drain_key(&self, key: &str, report: &mut TickReport) -> Result<()> {
        let claim = self.buffer.claim(key, self.lease).await?;
        if claim.is_empty() {
            return Ok(());
        }
        report.keys += 1;

        for entry in &claim.entries {
            match self.process(&entry.payload).await {
                Ok(true) => report.inserted += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    warn!(key = %key, entry = entry.id, error = %e, "Dropping click event");
                    report.dropped += 1;
                }
            }
        }

        self.buffer
            .ack(&claim)
            .await
            .with_context(|| format!("failed to acknowledge {}", key))
    }

    async fn process(&self, payload: &str) -> Result<bool> {
        let event: RawClickEvent =
            serde_json::from_str(payload).context("invalid click event payload")?;

        // Best effort: a missing link leaves the owner empty
        let owner = match self.links.get_link(&event.short_code).await {
            Ok(link) => link.and_then(|l| l.owner_id),
            Err(e) => {
                debug!(short_code = %event.short_code, error = %e, "Owner lookup failed");
                None
            }
        };
        let geo = self.geo.resolve(&event.ip).await;

        let record = enrich(&event, owner, geo);
        self.analytics
            .insert_click(&record)
            .await
            .context("failed to store click record")
    }

    /// Run `tick` every `interval` until the returned handle is shut down.
    pub fn spawn(self: Arc<Self>, interval: Duration) -> WorkerHandle {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let join = tokio::spawn(async move {
            let mut interval = time::interval(interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = self.tick().await {
                            error!("Enrichment tick failed: {}", e);
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            info!("Shutdown signal received, draining click buffer...");
                            if let Err(e) = self.tick().await {
                                error!("Failed to drain click buffer on shutdown: {}", e);
                            } else {
                                info!("Click buffer drained on shutdown");
                            }
                            break;
                        }
                    }
                }
            }
        });

        WorkerHandle { shutdown_tx, join }
    }
}

pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal shutdown and wait for the final tick.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.join.await {
            error!("Enrichment worker task failed: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analytics::ingestor::{buffer_key, Ingestor};
    use crate::analytics::models::{AnalyticsScope, ClickTotals, EnrichedClickRecord};
    use crate::storage::MemoryStorage;
    use async_trait::async_trait;

    fn worker_for(store: Arc<MemoryStorage>, lease: Duration) -> EnrichmentWorker {
        EnrichmentWorker::new(
            store.clone(),
            store.clone(),
            store,
            GeoResolver::default(),
            lease,
        )
    }

    async fn totals_for(store: &MemoryStorage, code: &str) -> ClickTotals {
        store
            .totals(&AnalyticsScope::Link {
                short_code: code.to_string(),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_tick_drains_all_buffered_events() {
        let store = Arc::new(MemoryStorage::new());
        store
            .create_link("ab12cd3", "https://example.com", Some("owner-1"), None)
            .await
            .unwrap();
        let ingestor = Ingestor::new(store.clone());
        for i in 0..5 {
            ingestor
                .record("ab12cd3", &format!("10.0.0.{}", i), "curl/8.0", None, i % 2 == 0)
                .await
                .unwrap();
        }

        let worker = worker_for(store.clone(), Duration::from_secs(60));
        let report = worker.tick().await.unwrap();

        assert_eq!(report.keys, 1);
        assert_eq!(report.inserted, 5);
        assert!(store.pending_keys(BUFFER_PREFIX).await.unwrap().is_empty());

        let totals = totals_for(&store, "ab12cd3").await;
        assert_eq!(totals.total_clicks, 5);
        assert_eq!(totals.unique_visitors, 5);
        assert_eq!(totals.qr_clicks, 3);

        let last = store.last_click("ab12cd3").await.unwrap();
        assert!(last.is_some());
    }

    #[tokio::test]
    async fn test_owner_left_empty_for_unknown_link() {
        let store = Arc::new(MemoryStorage::new());
        Ingestor::new(store.clone())
            .record("gone", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        worker_for(store.clone(), Duration::from_secs(60))
            .tick()
            .await
            .unwrap();
        assert_eq!(totals_for(&store, "gone").await.total_clicks, 1);
    }

    #[tokio::test]
    async fn test_undecodable_payload_is_dropped() {
        let store = Arc::new(MemoryStorage::new());
        store.push(&buffer_key("abc"), "{not json").await.unwrap();
        Ingestor::new(store.clone())
            .record("abc", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        let report = worker_for(store.clone(), Duration::from_secs(60))
            .tick()
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.dropped, 1);
        assert!(store.pending_keys(BUFFER_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_replayed_event_is_not_duplicated() {
        let store = Arc::new(MemoryStorage::new());
        let event = RawClickEvent::new("abc", "1.1.1.1", "curl/8.0", None, false);
        let ingestor = Ingestor::new(store.clone());
        ingestor.record_event(&event).await.unwrap();
        // Same event delivered twice, e.g. after a crash before ack
        ingestor.record_event(&event).await.unwrap();

        let report = worker_for(store.clone(), Duration::from_secs(60))
            .tick()
            .await
            .unwrap();

        assert_eq!(report.inserted, 1);
        assert_eq!(report.duplicates, 1);
        assert_eq!(totals_for(&store, "abc").await.total_clicks, 1);
    }

    #[tokio::test]
    async fn test_unacked_claim_is_redelivered_after_lease() {
        let store = Arc::new(MemoryStorage::new());
        Ingestor::new(store.clone())
            .record("abc", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        // A worker that claimed and then died without acknowledging
        let abandoned = store.claim(&buffer_key("abc"), Duration::ZERO).await.unwrap();
        assert_eq!(abandoned.entries.len(), 1);

        let report = worker_for(store.clone(), Duration::ZERO)
            .tick()
            .await
            .unwrap();
        assert_eq!(report.inserted, 1);
        assert!(store.pending_keys(BUFFER_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_live_claim_is_not_stolen() {
        let store = Arc::new(MemoryStorage::new());
        Ingestor::new(store.clone())
            .record("abc", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        let held = store
            .claim(&buffer_key("abc"), Duration::from_secs(60))
            .await
            .unwrap();

        let report = worker_for(store.clone(), Duration::from_secs(60))
            .tick()
            .await
            .unwrap();
        assert_eq!(report.processed(), 0);

        store.ack(&held).await.unwrap();
        assert!(store.pending_keys(BUFFER_PREFIX).await.unwrap().is_empty());
    }

    struct RejectingAnalytics {
        inner: Arc<MemoryStorage>,
    }

    #[async_trait]
    impl AnalyticsStore for RejectingAnalytics {
        async fn insert_click(&self, _record: &EnrichedClickRecord) -> Result<bool> {
            anyhow::bail!("disk full")
        }
        async fn totals(&self, scope: &AnalyticsScope) -> Result<ClickTotals> {
            self.inner.totals(scope).await
        }
        async fn group_counts(
            &self,
            scope: &AnalyticsScope,
            dimension: crate::analytics::models::Dimension,
        ) -> Result<Vec<crate::analytics::models::GroupCount>> {
            self.inner.group_counts(scope, dimension).await
        }
        async fn geographic(
            &self,
            scope: &AnalyticsScope,
        ) -> Result<Vec<crate::analytics::models::GeographicCount>> {
            self.inner.geographic(scope).await
        }
        async fn top_links(
            &self,
            scope: &AnalyticsScope,
            limit: i64,
        ) -> Result<Vec<crate::analytics::models::TopLink>> {
            self.inner.top_links(scope, limit).await
        }
        async fn recent_activity(
            &self,
            scope: &AnalyticsScope,
            limit: i64,
        ) -> Result<Vec<crate::analytics::models::RecentActivity>> {
            self.inner.recent_activity(scope, limit).await
        }
        async fn last_click(
            &self,
            short_code: &str,
        ) -> Result<Option<crate::analytics::models::LastClick>> {
            self.inner.last_click(short_code).await
        }
        async fn latest_link(
            &self,
            owner_id: &str,
        ) -> Result<Option<crate::analytics::models::LatestLink>> {
            self.inner.latest_link(owner_id).await
        }
    }

    #[tokio::test]
    async fn test_insert_failure_drops_event_and_continues() {
        let store = Arc::new(MemoryStorage::new());
        let ingestor = Ingestor::new(store.clone());
        ingestor
            .record("a", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();
        ingestor
            .record("b", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        let worker = EnrichmentWorker::new(
            store.clone(),
            Arc::new(RejectingAnalytics {
                inner: store.clone(),
            }),
            store.clone(),
            GeoResolver::default(),
            Duration::from_secs(60),
        );
        let report = worker.tick().await.unwrap();

        assert_eq!(report.keys, 2);
        assert_eq!(report.dropped, 2);
        assert!(store.pending_keys(BUFFER_PREFIX).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_runs_final_tick() {
        let store = Arc::new(MemoryStorage::new());
        let worker = Arc::new(worker_for(store.clone(), Duration::from_secs(60)));
        let handle = worker.spawn(Duration::from_secs(3600));

        // Let the immediate first tick pass before buffering
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ingestor::new(store.clone())
            .record("abc", "1.1.1.1", "curl/8.0", None, false)
            .await
            .unwrap();

        handle.shutdown().await;
        assert_eq!(totals_for(&store, "abc").await.total_clicks, 1);
    }
}
