//! Dashboard aggregates: one grouped query per dimension, run concurrently
//! and merged into a single [`AggregateView`] or [`DashboardView`].
//!
//! Every sub-query is bounded by the configured timeout. The first failure or
//! timeout fails the whole view and cancels the queries still in flight, so a
//! caller never receives a view with silently empty dimensions.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time;

use crate::analytics::models::{
    AggregateView, AnalyticsScope, ClickTotals, DashboardView, DateRange, Dimension,
    GeographicCount, LinkSnapshot,
};
use crate::storage::AnalyticsStore;

/// Size of the top-links and recent-activity lists on the owner dashboard.
pub const TOP_LIMIT: i64 = 5;

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error("{dimension} query failed: {source}")]
    Query {
        dimension: &'static str,
        #[source]
        source: anyhow::Error,
    },
    #[error("{dimension} query timed out after {after:?}")]
    Timeout {
        dimension: &'static str,
        after: Duration,
    },
}

impl AggregationError {
    pub fn dimension(&self) -> &'static str {
        match self {
            AggregationError::Query { dimension, .. } | AggregationError::Timeout { dimension, .. } => {
                dimension
            }
        }
    }
}

/// The part of a view shared by owner and link scopes.
struct Breakdown {
    totals: ClickTotals,
    browsers: BTreeMap<String, i64>,
    operating_systems: BTreeMap<String, i64>,
    devices: BTreeMap<String, i64>,
    hourly: BTreeMap<u32, i64>,
    weekly: BTreeMap<u32, i64>,
    monthly: BTreeMap<u32, i64>,
    daily: BTreeMap<String, i64>,
    sources: BTreeMap<String, i64>,
    geographic: Vec<GeographicCount>,
}

impl From<Breakdown> for AggregateView {
    fn from(b: Breakdown) -> Self {
        AggregateView {
            totals: b.totals,
            browsers: b.browsers,
            operating_systems: b.operating_systems,
            devices: b.devices,
            hourly: b.hourly,
            weekly: b.weekly,
            monthly: b.monthly,
            daily: b.daily,
            sources: b.sources,
            geographic: b.geographic,
            ..AggregateView::default()
        }
    }
}

pub struct AggregationReader {
    store: Arc<dyn AnalyticsStore>,
    query_timeout: Duration,
}

impl AggregationReader {
    pub fn new(store: Arc<dyn AnalyticsStore>, query_timeout: Duration) -> Self {
        Self {
            store,
            query_timeout,
        }
    }

    /// Stats over every link of `owner_id` clicked within `range`.
    pub async fn summarize_owner(
        &self,
        owner_id: &str,
        range: DateRange,
    ) -> Result<AggregateView, AggregationError> {
        let scope = AnalyticsScope::Owner {
            owner_id: owner_id.to_string(),
            range,
        };

        let (breakdown, top_links, recent_activity) = tokio::try_join!(
            self.breakdown(&scope),
            self.bounded("top_links", self.store.top_links(&scope, TOP_LIMIT)),
            self.bounded(
                "recent_activity",
                self.store.recent_activity(&scope, TOP_LIMIT)
            ),
        )?;

        Ok(AggregateView {
            top_links,
            recent_activity,
            ..AggregateView::from(breakdown)
        })
    }

    /// Lifetime stats of one link, plus its last click.
    pub async fn summarize_link(&self, short_code: &str) -> Result<AggregateView, AggregationError> {
        let scope = AnalyticsScope::Link {
            short_code: short_code.to_string(),
        };

        let (breakdown, last_click) = tokio::try_join!(
            self.breakdown(&scope),
            self.bounded("last_click", self.store.last_click(short_code)),
        )?;

        Ok(AggregateView {
            last_click,
            ..AggregateView::from(breakdown)
        })
    }

    /// All-time totals of `owner_id` next to a profile of the link they got
    /// their most recent click on.
    pub async fn summarize_dashboard(&self, owner_id: &str) -> Result<DashboardView, AggregationError> {
        let scope = AnalyticsScope::OwnerLifetime {
            owner_id: owner_id.to_string(),
        };

        let (totals, recent_link) = tokio::try_join!(
            self.bounded("totals", self.store.totals(&scope)),
            self.latest_link_snapshot(owner_id),
        )?;

        Ok(DashboardView {
            totals,
            recent_link,
        })
    }

    async fn latest_link_snapshot(
        &self,
        owner_id: &str,
    ) -> Result<Option<LinkSnapshot>, AggregationError> {
        let Some(latest) = self
            .bounded("latest_link", self.store.latest_link(owner_id))
            .await?
        else {
            return Ok(None);
        };

        let scope = AnalyticsScope::Link {
            short_code: latest.short_code.clone(),
        };
        let (totals, day_of_week, city, country, browser, os, device) = tokio::try_join!(
            self.bounded("link_totals", self.store.totals(&scope)),
            self.top(&scope, Dimension::DayOfWeek),
            self.top(&scope, Dimension::City),
            self.top(&scope, Dimension::Country),
            self.top(&scope, Dimension::Browser),
            self.top(&scope, Dimension::OperatingSystem),
            self.top(&scope, Dimension::Device),
        )?;

        Ok(Some(LinkSnapshot {
            short_code: latest.short_code,
            original_url: latest.original_url,
            last_clicked_at: latest.clicked_at,
            total_clicks: totals.total_clicks,
            top_day_of_week: day_of_week.and_then(|d| d.trim().parse().ok()),
            top_city: city,
            top_country: country,
            top_browser: browser,
            top_os: os,
            top_device: device,
        }))
    }

    async fn breakdown(&self, scope: &AnalyticsScope) -> Result<Breakdown, AggregationError> {
        let (
            totals,
            browsers,
            operating_systems,
            devices,
            hourly,
            weekly,
            monthly,
            daily,
            sources,
            geographic,
        ) = tokio::try_join!(
            self.bounded("totals", self.store.totals(scope)),
            self.group(scope, Dimension::Browser),
            self.group(scope, Dimension::OperatingSystem),
            self.group(scope, Dimension::Device),
            self.group(scope, Dimension::HourOfDay),
            self.group(scope, Dimension::DayOfWeek),
            self.group(scope, Dimension::Month),
            self.group(scope, Dimension::Day),
            self.group(scope, Dimension::Source),
            self.bounded("geographic", self.store.geographic(scope)),
        )?;

        Ok(Breakdown {
            totals,
            browsers,
            operating_systems,
            devices,
            hourly: numeric_keys(hourly),
            weekly: numeric_keys(weekly),
            monthly: numeric_keys(monthly),
            daily,
            sources,
            geographic,
        })
    }

    async fn group(
        &self,
        scope: &AnalyticsScope,
        dimension: Dimension,
    ) -> Result<BTreeMap<String, i64>, AggregationError> {
        let rows = self
            .bounded(dimension.name(), self.store.group_counts(scope, dimension))
            .await?;
        Ok(rows.into_iter().map(|row| (row.key, row.clicks)).collect())
    }

    /// Largest group of one dimension; rows arrive ordered by count, then key.
    async fn top(
        &self,
        scope: &AnalyticsScope,
        dimension: Dimension,
    ) -> Result<Option<String>, AggregationError> {
        let rows = self
            .bounded(dimension.name(), self.store.group_counts(scope, dimension))
            .await?;
        Ok(rows.into_iter().next().map(|row| row.key))
    }

    async fn bounded<T, F>(&self, dimension: &'static str, query: F) -> Result<T, AggregationError>
    where
        F: Future<Output = anyhow::Result<T>>,
    {
        match time::timeout(self.query_timeout, query).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(source)) => Err(AggregationError::Query { dimension, source }),
            Err(_) => Err(AggregationError::Timeout {
                dimension,
                after: self.query_timeout,
            }),
        }
    }
}

// Calendar keys come back as text from SQL
fn numeric_keys(map: BTreeMap<String, i64>) -> BTreeMap<u32, i64> {
    map.into_iter()
        .filter_map(|(k, v)| k.trim().parse::<u32>().ok().map(|k| (k, v)))
        .collect()
}
