use crate::analytics::models::{
    AnalyticsScope, ClickTotals, Dimension, EnrichedClickRecord, GeographicCount, GroupCount,
    LastClick, LatestLink, RecentActivity, TopLink,
};
use crate::models::Link;
use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("short code already exists")]
    Conflict,
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// A named integer shared by every process using the same store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Create the counter with `start` unless it already exists.
    async fn init_counter(&self, name: &str, start: i64) -> Result<()>;

    /// Atomically add `by` and return the new value.
    async fn increment_by(&self, name: &str, by: i64) -> Result<i64>;
}

/// One buffered payload together with its position in the buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedEntry {
    pub id: i64,
    pub payload: String,
}

/// Entries reserved for one consumer until acknowledged or the lease runs out.
#[derive(Debug, Clone)]
pub struct BufferClaim {
    pub key: String,
    pub token: String,
    pub entries: Vec<BufferedEntry>,
}

impl BufferClaim {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Ordered, durable per-key event lists with consume-once delivery.
#[async_trait]
pub trait EventBuffer: Send + Sync {
    /// Append a payload to the list under `key`. Never reads the list.
    async fn push(&self, key: &str, payload: &str) -> Result<()>;

    /// Keys starting with `prefix` that hold at least one entry.
    async fn pending_keys(&self, prefix: &str) -> Result<Vec<String>>;

    /// Reserve every entry under `key` that is unclaimed or whose lease expired,
    /// in append order.
    async fn claim(&self, key: &str, lease: Duration) -> Result<BufferClaim>;

    /// Delete exactly the entries reserved by `claim`, in one operation.
    async fn ack(&self, claim: &BufferClaim) -> Result<()>;
}

/// Append-only analytics table plus the grouped reads over it.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    /// Insert one record. Returns `false` when the event id was already stored.
    async fn insert_click(&self, record: &EnrichedClickRecord) -> Result<bool>;

    async fn totals(&self, scope: &AnalyticsScope) -> Result<ClickTotals>;

    /// Grouped COUNT for one dimension, largest groups first.
    async fn group_counts(
        &self,
        scope: &AnalyticsScope,
        dimension: Dimension,
    ) -> Result<Vec<GroupCount>>;

    /// Clicks per country, unknown countries excluded, largest first.
    async fn geographic(&self, scope: &AnalyticsScope) -> Result<Vec<GeographicCount>>;

    async fn top_links(&self, scope: &AnalyticsScope, limit: i64) -> Result<Vec<TopLink>>;

    async fn recent_activity(
        &self,
        scope: &AnalyticsScope,
        limit: i64,
    ) -> Result<Vec<RecentActivity>>;

    /// Most recent click of a link with at least one known OS/device/location attribute.
    async fn last_click(&self, short_code: &str) -> Result<Option<LastClick>>;

    /// The link of the owner's newest click, if they have any.
    async fn latest_link(&self, owner_id: &str) -> Result<Option<LatestLink>>;
}

/// The link table, owned by the surrounding product.
#[async_trait]
pub trait LinkRegistry: Send + Sync {
    /// Create a link with a caller-provided code
    async fn create_link(
        &self,
        short_code: &str,
        original_url: &str,
        owner_id: Option<&str>,
        expires_at: Option<i64>,
    ) -> StorageResult<Link>;

    /// Get a link by short code, including soft-deleted ones
    async fn get_link(&self, short_code: &str) -> Result<Option<Link>>;

    /// Whether `owner_id` may use `short_code`: free, or already theirs.
    async fn is_code_available(&self, owner_id: &str, short_code: &str) -> Result<bool>;

    /// Soft delete
    async fn soft_delete(&self, short_code: &str) -> Result<bool>;
}

/// A backend that provides every store the pipeline needs.
#[async_trait]
pub trait Storage: CounterStore + EventBuffer + AnalyticsStore + LinkRegistry {
    /// Initialize the storage (create tables, etc.)
    async fn init(&self) -> Result<()>;
}
