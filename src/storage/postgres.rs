use crate::analytics::models::{
    AnalyticsScope, ClickTotals, Dimension, EnrichedClickRecord, GeographicCount, GroupCount,
    LastClick, LatestLink, RecentActivity, TopLink,
};
use crate::models::Link;
use crate::storage::sql::{self, LastClickRow, LatestLinkRow, RecentActivityRow};
use crate::storage::{
    AnalyticsStore, BufferClaim, BufferedEntry, CounterStore, EventBuffer, LinkRegistry, Storage,
    StorageError, StorageResult,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

pub struct PostgresStorage {
    pool: Arc<PgPool>,
}

impl PostgresStorage {
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        Ok(Self {
            pool: Arc::new(pool),
        })
    }
}

#[async_trait]
impl Storage for PostgresStorage {
    async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS counters (
                name TEXT PRIMARY KEY,
                value BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS links (
                id BIGSERIAL PRIMARY KEY,
                short_code TEXT NOT NULL UNIQUE,
                original_url TEXT NOT NULL,
                owner_id TEXT,
                created_at BIGINT NOT NULL,
                expires_at BIGINT,
                deleted BOOLEAN NOT NULL DEFAULT FALSE
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_links_owner ON links(owner_id)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_buffer (
                id BIGSERIAL PRIMARY KEY,
                buffer_key TEXT NOT NULL,
                payload TEXT NOT NULL,
                enqueued_at BIGINT NOT NULL,
                claim_token TEXT,
                claimed_at BIGINT
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_click_buffer_key ON click_buffer(buffer_key)")
            .execute(self.pool.as_ref())
            .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_click_buffer_claim ON click_buffer(claim_token)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS click_analytics (
                id BIGSERIAL PRIMARY KEY,
                event_id TEXT NOT NULL UNIQUE,
                short_code TEXT NOT NULL,
                owner_id TEXT,
                ip_address TEXT NOT NULL,
                user_agent TEXT NOT NULL,
                referrer TEXT,
                is_qr_code BOOLEAN NOT NULL DEFAULT FALSE,
                browser TEXT NOT NULL,
                browser_version TEXT NOT NULL,
                operating_system TEXT NOT NULL,
                os_version TEXT NOT NULL,
                device_type TEXT NOT NULL,
                country TEXT NOT NULL,
                country_code TEXT NOT NULL,
                city TEXT NOT NULL,
                region TEXT NOT NULL,
                timezone TEXT NOT NULL,
                latitude DOUBLE PRECISION NOT NULL,
                longitude DOUBLE PRECISION NOT NULL,
                click_timestamp BIGINT NOT NULL,
                click_date TEXT NOT NULL,
                day_of_week INTEGER NOT NULL,
                hour_of_day INTEGER NOT NULL,
                week_of_year INTEGER NOT NULL,
                month INTEGER NOT NULL,
                year INTEGER NOT NULL,
                created_at BIGINT NOT NULL
            )
            "#,
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_click_owner_date ON click_analytics(owner_id, click_date)",
        )
        .execute(self.pool.as_ref())
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_click_code_time ON click_analytics(short_code, click_timestamp)",
        )
        .execute(self.pool.as_ref())
        .await?;

        Ok(())
    }
}

#[async_trait]
impl CounterStore for PostgresStorage {
    async fn init_counter(&self, name: &str, start: i64) -> Result<()> {
        sqlx::query(
            "INSERT INTO counters (name, value) VALUES ($1, $2) ON CONFLICT (name) DO NOTHING",
        )
        .bind(name)
        .bind(start)
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn increment_by(&self, name: &str, by: i64) -> Result<i64> {
        let value: Option<i64> = sqlx::query_scalar(
            "UPDATE counters SET value = value + $1 WHERE name = $2 RETURNING value",
        )
        .bind(by)
        .bind(name)
        .fetch_optional(self.pool.as_ref())
        .await?;

        value.ok_or_else(|| anyhow::anyhow!("counter {} is not initialized", name))
    }
}

#[async_trait]
impl EventBuffer for PostgresStorage {
    async fn push(&self, key: &str, payload: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO click_buffer (buffer_key, payload, enqueued_at) VALUES ($1, $2, $3)",
        )
        .bind(key)
        .bind(payload)
        .bind(Utc::now().timestamp_millis())
        .execute(self.pool.as_ref())
        .await?;
        Ok(())
    }

    async fn pending_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let keys = sqlx::query_scalar(
            "SELECT DISTINCT buffer_key FROM click_buffer WHERE buffer_key LIKE $1 ORDER BY buffer_key",
        )
        .bind(format!("{}%", prefix))
        .fetch_all(self.pool.as_ref())
        .await?;
        Ok(keys)
    }

    async fn claim(&self, key: &str, lease: Duration) -> Result<BufferClaim> {
        let token = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp_millis();
        let stale_before = now - i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);

        // RETURNING gives back exactly the rows this statement stamped
        let mut rows: Vec<(i64, String)> = sqlx::query_as(
            r#"
            UPDATE click_buffer
            SET claim_token = $1, claimed_at = $2
            WHERE buffer_key = $3
              AND (claim_token IS NULL OR claimed_at < $4)
            RETURNING id, payload
            "#,
        )
        .bind(&token)
        .bind(now)
        .bind(key)
        .bind(stale_before)
        .fetch_all(self.pool.as_ref())
        .await?;

        rows.sort_by_key(|(id, _)| *id);

        Ok(BufferClaim {
            key: key.to_string(),
            token,
            entries: rows
                .into_iter()
                .map(|(id, payload)| BufferedEntry { id, payload })
                .collect(),
        })
    }

    async fn ack(&self, claim: &BufferClaim) -> Result<()> {
        if claim.is_empty() {
            return Ok(());
        }
        sqlx::query("DELETE FROM click_buffer WHERE buffer_key = $1 AND claim_token = $2")
            .bind(&claim.key)
            .bind(&claim.token)
            .execute(self.pool.as_ref())
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for PostgresStorage {
    async fn insert_click(&self, record: &EnrichedClickRecord) -> Result<bool> {
        let mut qb = sql::insert_click_query::<Postgres>(record);
        let result = qb.build().execute(self.pool.as_ref()).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn totals(&self, scope: &AnalyticsScope) -> Result<ClickTotals> {
        let mut qb = sql::totals_query::<Postgres>(scope);
        let totals = qb
            .build_query_as::<ClickTotals>()
            .fetch_one(self.pool.as_ref())
            .await?;
        Ok(totals)
    }

    async fn group_counts(
        &self,
        scope: &AnalyticsScope,
        dimension: Dimension,
    ) -> Result<Vec<GroupCount>> {
        let mut qb = sql::group_counts_query::<Postgres>(scope, dimension);
        let rows = qb
            .build_query_as::<GroupCount>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn geographic(&self, scope: &AnalyticsScope) -> Result<Vec<GeographicCount>> {
        let mut qb = sql::geographic_query::<Postgres>(scope);
        let rows = qb
            .build_query_as::<GeographicCount>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn top_links(&self, scope: &AnalyticsScope, limit: i64) -> Result<Vec<TopLink>> {
        let mut qb = sql::top_links_query::<Postgres>(scope, limit);
        let rows = qb
            .build_query_as::<TopLink>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows)
    }

    async fn recent_activity(
        &self,
        scope: &AnalyticsScope,
        limit: i64,
    ) -> Result<Vec<RecentActivity>> {
        let mut qb = sql::recent_activity_query::<Postgres>(scope, limit);
        let rows = qb
            .build_query_as::<RecentActivityRow>()
            .fetch_all(self.pool.as_ref())
            .await?;
        Ok(rows.into_iter().map(RecentActivity::from).collect())
    }

    async fn last_click(&self, short_code: &str) -> Result<Option<LastClick>> {
        let mut qb = sql::last_click_query::<Postgres>(short_code);
        let row = qb
            .build_query_as::<LastClickRow>()
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(LastClick::from))
    }

    async fn latest_link(&self, owner_id: &str) -> Result<Option<LatestLink>> {
        let mut qb = sql::latest_link_query::<Postgres>(owner_id);
        let row = qb
            .build_query_as::<LatestLinkRow>()
            .fetch_optional(self.pool.as_ref())
            .await?;
        Ok(row.map(LatestLink::from))
    }
}

#[async_trait]
impl LinkRegistry for PostgresStorage {
    async fn create_link(
        &self,
        short_code: &str,
        original_url: &str,
        owner_id: Option<&str>,
        expires_at: Option<i64>,
    ) -> StorageResult<Link> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            INSERT INTO links (short_code, original_url, owner_id, created_at, expires_at, deleted)
            VALUES ($1, $2, $3, $4, $5, FALSE)
            ON CONFLICT (short_code) DO NOTHING
            RETURNING id, short_code, original_url, owner_id, created_at, expires_at, deleted
            "#,
        )
        .bind(short_code)
        .bind(original_url)
        .bind(owner_id)
        .bind(Utc::now().timestamp())
        .bind(expires_at)
        .fetch_optional(self.pool.as_ref())
        .await
        .map_err(|e| StorageError::Other(e.into()))?;

        link.ok_or(StorageError::Conflict)
    }

    async fn get_link(&self, short_code: &str) -> Result<Option<Link>> {
        let link = sqlx::query_as::<_, Link>(
            r#"
            SELECT id, short_code, original_url, owner_id, created_at, expires_at, deleted
            FROM links
            WHERE short_code = $1
            "#,
        )
        .bind(short_code)
        .fetch_optional(self.pool.as_ref())
        .await?;

        Ok(link)
    }

    async fn is_code_available(&self, owner_id: &str, short_code: &str) -> Result<bool> {
        let owner: Option<Option<String>> =
            sqlx::query_scalar("SELECT owner_id FROM links WHERE short_code = $1")
                .bind(short_code)
                .fetch_optional(self.pool.as_ref())
                .await?;

        Ok(match owner {
            None => true,
            Some(existing) => existing.as_deref() == Some(owner_id),
        })
    }

    async fn soft_delete(&self, short_code: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE links SET deleted = TRUE WHERE short_code = $1 AND deleted = FALSE",
        )
        .bind(short_code)
        .execute(self.pool.as_ref())
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
