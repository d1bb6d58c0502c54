pub mod cached;
pub mod memory;
pub mod postgres;
mod sql;
pub mod sqlite;
pub mod trait_def;

pub use cached::CachedLinkRegistry;
pub use memory::MemoryStorage;
pub use postgres::PostgresStorage;
pub use sqlite::SqliteStorage;
pub use trait_def::{
    AnalyticsStore, BufferClaim, BufferedEntry, CounterStore, EventBuffer, LinkRegistry, Storage,
    StorageError, StorageResult,
};

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use crate::config::{DatabaseBackend, DatabaseConfig};

/// One backend viewed through each store interface.
#[derive(Clone)]
pub struct Backends {
    pub counters: Arc<dyn CounterStore>,
    pub buffer: Arc<dyn EventBuffer>,
    pub analytics: Arc<dyn AnalyticsStore>,
    pub links: Arc<dyn LinkRegistry>,
}

impl Backends {
    pub fn from_storage<S: Storage + 'static>(storage: Arc<S>) -> Self {
        Self {
            counters: storage.clone(),
            buffer: storage.clone(),
            analytics: storage.clone(),
            links: storage,
        }
    }
}

/// Open the configured backend and create its schema.
pub async fn connect(config: &DatabaseConfig) -> Result<Backends> {
    match config.backend {
        DatabaseBackend::Sqlite => {
            info!("Using SQLite storage: {}", config.url);
            let storage = SqliteStorage::new(&config.url, config.max_connections).await?;
            init(storage).await
        }
        DatabaseBackend::Postgres => {
            info!("Using PostgreSQL storage: {}", config.url);
            let storage = PostgresStorage::new(&config.url, config.max_connections).await?;
            init(storage).await
        }
        DatabaseBackend::Memory => {
            info!("Using in-memory storage; nothing survives a restart");
            init(MemoryStorage::new()).await
        }
    }
}

async fn init<S: Storage + 'static>(storage: S) -> Result<Backends> {
    info!("Initializing database...");
    storage.init().await?;
    info!("Database initialized successfully");
    Ok(Backends::from_storage(Arc::new(storage)))
}
