use crate::models::Link;
use crate::storage::{LinkRegistry, StorageResult};
use anyhow::Result;
use async_trait::async_trait;
use moka::future::Cache;
use std::sync::Arc;
use std::time::Duration;

/// Read-through cache in front of the link table.
///
/// The redirect path and the enrichment worker both look links up by short
/// code on every event; this keeps those lookups off the database. Negative
/// results are cached too, so a burst of clicks on a missing code costs one
/// query per TTL.
pub struct CachedLinkRegistry {
    /// Underlying link table
    inner: Arc<dyn LinkRegistry>,
    read_cache: Cache<String, Option<Link>>,
}

impl CachedLinkRegistry {
    pub fn new(inner: Arc<dyn LinkRegistry>, max_cache_entries: u64, ttl: Duration) -> Self {
        let read_cache = Cache::builder()
            .max_capacity(max_cache_entries)
            .time_to_live(ttl)
            .build();

        Self { inner, read_cache }
    }

    async fn invalidate_cache(&self, short_code: &str) {
        self.read_cache.invalidate(short_code).await;
    }
}

#[async_trait]
impl LinkRegistry for CachedLinkRegistry {
    async fn create_link(
        &self,
        short_code: &str,
        original_url: &str,
        owner_id: Option<&str>,
        expires_at: Option<i64>,
    ) -> StorageResult<Link> {
        let link = self
            .inner
            .create_link(short_code, original_url, owner_id, expires_at)
            .await?;

        // Replaces any cached negative lookup
        self.read_cache
            .insert(short_code.to_string(), Some(link.clone()))
            .await;

        Ok(link)
    }

    async fn get_link(&self, short_code: &str) -> Result<Option<Link>> {
        if let Some(cached) = self.read_cache.get(short_code).await {
            return Ok(cached);
        }

        let result = self.inner.get_link(short_code).await?;
        self.read_cache
            .insert(short_code.to_string(), result.clone())
            .await;

        Ok(result)
    }

    async fn is_code_available(&self, owner_id: &str, short_code: &str) -> Result<bool> {
        self.inner.is_code_available(owner_id, short_code).await
    }

    async fn soft_delete(&self, short_code: &str) -> Result<bool> {
        let result = self.inner.soft_delete(short_code).await?;

        if result {
            self.invalidate_cache(short_code).await;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingRegistry {
        inner: MemoryStorage,
        reads: AtomicUsize,
    }

    #[async_trait]
    impl LinkRegistry for CountingRegistry {
        async fn create_link(
            &self,
            short_code: &str,
            original_url: &str,
            owner_id: Option<&str>,
            expires_at: Option<i64>,
        ) -> StorageResult<Link> {
            self.inner
                .create_link(short_code, original_url, owner_id, expires_at)
                .await
        }

        async fn get_link(&self, short_code: &str) -> Result<Option<Link>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.get_link(short_code).await
        }

        async fn is_code_available(&self, owner_id: &str, short_code: &str) -> Result<bool> {
            self.inner.is_code_available(owner_id, short_code).await
        }

        async fn soft_delete(&self, short_code: &str) -> Result<bool> {
            self.inner.soft_delete(short_code).await
        }
    }

    fn setup() -> (Arc<CountingRegistry>, CachedLinkRegistry) {
        let inner = Arc::new(CountingRegistry {
            inner: MemoryStorage::new(),
            reads: AtomicUsize::new(0),
        });
        let cached = CachedLinkRegistry::new(inner.clone(), 100, Duration::from_secs(60));
        (inner, cached)
    }

    #[tokio::test]
    async fn test_repeated_lookups_hit_cache() {
        let (inner, cached) = setup();
        cached
            .create_link("abc", "https://example.com", Some("u1"), None)
            .await
            .unwrap();

        for _ in 0..5 {
            let link = cached.get_link("abc").await.unwrap().unwrap();
            assert_eq!(link.owner_id.as_deref(), Some("u1"));
        }
        assert_eq!(inner.reads.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_link_is_cached_until_created() {
        let (inner, cached) = setup();
        assert!(cached.get_link("abc").await.unwrap().is_none());
        assert!(cached.get_link("abc").await.unwrap().is_none());
        assert_eq!(inner.reads.load(Ordering::SeqCst), 1);

        cached
            .create_link("abc", "https://example.com", None, None)
            .await
            .unwrap();
        assert!(cached.get_link("abc").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_soft_delete_invalidates() {
        let (_, cached) = setup();
        cached
            .create_link("abc", "https://example.com", None, None)
            .await
            .unwrap();
        assert!(!cached.get_link("abc").await.unwrap().unwrap().deleted);

        assert!(cached.soft_delete("abc").await.unwrap());
        assert!(cached.get_link("abc").await.unwrap().unwrap().deleted);
    }
}
