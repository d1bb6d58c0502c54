//! Process-local backend.
//!
//! Useful for tests and single-instance development: counters, buffer and
//! analytics all live in this process, so multiple instances do not share
//! state and nothing survives a restart.

use crate::analytics::models::{
    is_known, join_known, AnalyticsScope, ClickTotals, Dimension, EnrichedClickRecord,
    GeographicCount, GroupCount, LastClick, LatestLink, RecentActivity, TopLink,
};
use crate::models::Link;
use crate::storage::sql::{click_source, recent_location};
use crate::storage::{
    AnalyticsStore, BufferClaim, BufferedEntry, CounterStore, EventBuffer, LinkRegistry, Storage,
    StorageError, StorageResult,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

struct PendingEntry {
    id: i64,
    payload: String,
    claim: Option<(String, Instant)>,
}

#[derive(Default)]
struct BufferState {
    next_id: i64,
    lists: BTreeMap<String, Vec<PendingEntry>>,
}

#[derive(Default)]
struct ClickTable {
    rows: Vec<EnrichedClickRecord>,
    event_ids: HashSet<Uuid>,
}

#[derive(Default)]
pub struct MemoryStorage {
    counters: DashMap<String, AtomicI64>,
    buffer: Mutex<BufferState>,
    clicks: RwLock<ClickTable>,
    links: DashMap<String, Link>,
    next_link_id: AtomicI64,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    async fn scoped(&self, scope: &AnalyticsScope) -> Vec<EnrichedClickRecord> {
        self.clicks
            .read()
            .await
            .rows
            .iter()
            .filter(|r| scope.matches(r))
            .cloned()
            .collect()
    }

    fn original_url(&self, short_code: &str) -> String {
        self.links
            .get(short_code)
            .map(|l| l.original_url.clone())
            .unwrap_or_default()
    }
}

/// Largest groups first, ties broken by key.
fn ranked<K: Ord>(counts: HashMap<K, i64>) -> Vec<(K, i64)> {
    let mut rows: Vec<_> = counts.into_iter().collect();
    rows.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    rows
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl CounterStore for MemoryStorage {
    async fn init_counter(&self, name: &str, start: i64) -> Result<()> {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| AtomicI64::new(start));
        Ok(())
    }

    async fn increment_by(&self, name: &str, by: i64) -> Result<i64> {
        let counter = self
            .counters
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("counter {} is not initialized", name))?;
        Ok(counter.fetch_add(by, Ordering::SeqCst) + by)
    }
}

#[async_trait]
impl EventBuffer for MemoryStorage {
    async fn push(&self, key: &str, payload: &str) -> Result<()> {
        let mut state = self.buffer.lock().await;
        state.next_id += 1;
        let id = state.next_id;
        state
            .lists
            .entry(key.to_string())
            .or_default()
            .push(PendingEntry {
                id,
                payload: payload.to_string(),
                claim: None,
            });
        Ok(())
    }

    async fn pending_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.buffer.lock().await;
        Ok(state
            .lists
            .iter()
            .filter(|(key, entries)| key.starts_with(prefix) && !entries.is_empty())
            .map(|(key, _)| key.clone())
            .collect())
    }

    async fn claim(&self, key: &str, lease: Duration) -> Result<BufferClaim> {
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        let mut state = self.buffer.lock().await;

        let entries = state
            .lists
            .get_mut(key)
            .map(|list| {
                list.iter_mut()
                    .filter(|e| match &e.claim {
                        None => true,
                        Some((_, at)) => now.duration_since(*at) >= lease,
                    })
                    .map(|e| {
                        e.claim = Some((token.clone(), now));
                        BufferedEntry {
                            id: e.id,
                            payload: e.payload.clone(),
                        }
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(BufferClaim {
            key: key.to_string(),
            token,
            entries,
        })
    }

    async fn ack(&self, claim: &BufferClaim) -> Result<()> {
        let mut state = self.buffer.lock().await;
        if let Some(list) = state.lists.get_mut(&claim.key) {
            list.retain(|e| !matches!(&e.claim, Some((token, _)) if *token == claim.token));
            if list.is_empty() {
                state.lists.remove(&claim.key);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AnalyticsStore for MemoryStorage {
    async fn insert_click(&self, record: &EnrichedClickRecord) -> Result<bool> {
        let mut table = self.clicks.write().await;
        if !table.event_ids.insert(record.event_id) {
            return Ok(false);
        }
        table.rows.push(record.clone());
        Ok(true)
    }

    async fn totals(&self, scope: &AnalyticsScope) -> Result<ClickTotals> {
        let rows = self.scoped(scope).await;
        let visitors: HashSet<&str> = rows.iter().map(|r| r.ip.as_str()).collect();

        Ok(ClickTotals {
            total_clicks: rows.len() as i64,
            unique_visitors: visitors.len() as i64,
            qr_clicks: rows.iter().filter(|r| r.is_qr).count() as i64,
            direct_clicks: rows.iter().filter(|r| r.is_direct()).count() as i64,
        })
    }

    async fn group_counts(
        &self,
        scope: &AnalyticsScope,
        dimension: Dimension,
    ) -> Result<Vec<GroupCount>> {
        let mut counts: HashMap<String, i64> = HashMap::new();
        for record in self.scoped(scope).await {
            let key = dimension.key_of(&record);
            if dimension.skips_unknown() && !is_known(&key) {
                continue;
            }
            *counts.entry(key).or_insert(0) += 1;
        }

        Ok(ranked(counts)
            .into_iter()
            .map(|(key, clicks)| GroupCount { key, clicks })
            .collect())
    }

    async fn geographic(&self, scope: &AnalyticsScope) -> Result<Vec<GeographicCount>> {
        let mut counts: HashMap<(String, String), i64> = HashMap::new();
        for record in self.scoped(scope).await {
            if !is_known(&record.country) {
                continue;
            }
            *counts
                .entry((record.country, record.country_code))
                .or_insert(0) += 1;
        }

        Ok(ranked(counts)
            .into_iter()
            .map(|((country, country_code), clicks)| GeographicCount {
                country,
                country_code,
                clicks,
            })
            .collect())
    }

    async fn top_links(&self, scope: &AnalyticsScope, limit: i64) -> Result<Vec<TopLink>> {
        let mut per_link: HashMap<String, (i64, i64, i64)> = HashMap::new();
        for record in self.scoped(scope).await {
            let entry = per_link.entry(record.short_code.clone()).or_default();
            entry.0 += 1;
            entry.1 += i64::from(record.is_qr);
            entry.2 += i64::from(record.is_direct());
        }

        let mut links: Vec<TopLink> = per_link
            .into_iter()
            .map(|(short_code, (total, qr, direct))| TopLink {
                original_url: self.original_url(&short_code),
                short_code,
                total_clicks: total,
                qr_clicks: qr,
                direct_clicks: direct,
            })
            .collect();
        links.sort_by(|a, b| {
            b.total_clicks
                .cmp(&a.total_clicks)
                .then_with(|| a.short_code.cmp(&b.short_code))
        });
        links.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(links)
    }

    async fn recent_activity(
        &self,
        scope: &AnalyticsScope,
        limit: i64,
    ) -> Result<Vec<RecentActivity>> {
        let mut rows = self.scoped(scope).await;
        // Newest first; later inserts win ties
        rows.reverse();
        rows.sort_by(|a, b| b.click_timestamp.cmp(&a.click_timestamp));
        rows.truncate(usize::try_from(limit).unwrap_or(0));

        Ok(rows
            .into_iter()
            .map(|r| RecentActivity {
                original_url: self.original_url(&r.short_code),
                location: recent_location(&r.city, &r.country),
                device: format!("{} ({})", r.browser, r.device_type),
                click_source: click_source(r.is_qr, r.referrer.as_deref()).to_string(),
                clicked_at: r.click_timestamp,
                short_code: r.short_code,
            })
            .collect())
    }

    async fn last_click(&self, short_code: &str) -> Result<Option<LastClick>> {
        let table = self.clicks.read().await;
        let latest = table
            .rows
            .iter()
            .filter(|r| r.short_code == short_code)
            .filter(|r| {
                is_known(&r.os)
                    || is_known(r.device_type.as_str())
                    || is_known(&r.city)
                    || is_known(&r.country)
            })
            .max_by_key(|r| r.click_timestamp);

        Ok(latest.map(|r| LastClick {
            clicked_at: r.click_timestamp,
            browser: r.browser.clone(),
            device: join_known(&[&r.os, r.device_type.as_str()]),
            location: join_known(&[&r.city, &r.country]),
        }))
    }

    async fn latest_link(&self, owner_id: &str) -> Result<Option<LatestLink>> {
        let table = self.clicks.read().await;
        // max_by_key keeps the last maximum, so later inserts win ties
        let latest = table
            .rows
            .iter()
            .filter(|r| r.owner_user_id.as_deref() == Some(owner_id))
            .max_by_key(|r| r.click_timestamp);

        Ok(latest.map(|r| LatestLink {
            short_code: r.short_code.clone(),
            original_url: self.original_url(&r.short_code),
            clicked_at: r.click_timestamp,
        }))
    }
}

#[async_trait]
impl LinkRegistry for MemoryStorage {
    async fn create_link(
        &self,
        short_code: &str,
        original_url: &str,
        owner_id: Option<&str>,
        expires_at: Option<i64>,
    ) -> StorageResult<Link> {
        match self.links.entry(short_code.to_string()) {
            Entry::Occupied(_) => Err(StorageError::Conflict),
            Entry::Vacant(slot) => {
                let link = Link {
                    id: self.next_link_id.fetch_add(1, Ordering::SeqCst) + 1,
                    short_code: short_code.to_string(),
                    original_url: original_url.to_string(),
                    owner_id: owner_id.map(str::to_string),
                    created_at: Utc::now().timestamp(),
                    expires_at,
                    deleted: false,
                };
                slot.insert(link.clone());
                Ok(link)
            }
        }
    }

    async fn get_link(&self, short_code: &str) -> Result<Option<Link>> {
        Ok(self.links.get(short_code).map(|l| l.clone()))
    }

    async fn is_code_available(&self, owner_id: &str, short_code: &str) -> Result<bool> {
        Ok(self
            .links
            .get(short_code)
            .map_or(true, |l| l.owner_id.as_deref() == Some(owner_id)))
    }

    async fn soft_delete(&self, short_code: &str) -> Result<bool> {
        Ok(match self.links.get_mut(short_code) {
            Some(mut link) if !link.deleted => {
                link.deleted = true;
                true
            }
            _ => false,
        })
    }
}
